//! Address Manager (AddrMan) for peer selection
//!
//! Keeps every peer address we have heard of, with connection history, and
//! picks dial candidates from it. Entries are keyed by endpoint, inserted or
//! refreshed on [`AddrManager::add`], and only dropped by
//! [`AddrManager::evict_stale`].

use crate::network::address::{unix_now, Address, ServiceFlags};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

// =============================================================================
// Constants
// =============================================================================

/// Maximum addresses accepted from a single peer-list message
pub const MAX_ADDR_PER_MESSAGE: usize = 1000;

/// Default maximum age for addresses (30 days)
pub const DEFAULT_MAX_AGE_SECS: i64 = 30 * 24 * 60 * 60;

/// Default capacity of the book
pub const DEFAULT_CAPACITY: usize = 16_384;

// =============================================================================
// Address Entry
// =============================================================================

/// Address plus connection history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddrEntry {
    /// The network address
    pub addr: Address,
    /// Peer (or seed) that told us about this address
    #[serde(default)]
    pub source: Option<String>,
    /// Failed attempts since the last success
    #[serde(default)]
    pub attempts: u32,
    /// Successful connections
    #[serde(default)]
    pub successes: u32,
    /// Last successful connection (unix seconds, 0 = never)
    #[serde(default)]
    pub last_success: i64,
}

impl AddrEntry {
    pub fn new(addr: Address, source: Option<String>) -> Self {
        Self {
            addr,
            source,
            attempts: 0,
            successes: 0,
            last_success: 0,
        }
    }

    /// Too many failures to be worth dialing
    pub fn is_terrible(&self) -> bool {
        if self.addr.last_try == 0 {
            return false;
        }

        // Never connected and failed repeatedly
        if self.successes == 0 && self.attempts >= 3 {
            return true;
        }

        // Once good, but failing for a long stretch now
        self.attempts > 10
    }

    /// Selection weight (higher = more likely)
    pub fn get_chance(&self) -> f64 {
        let mut chance = 1.0;

        // Back off exponentially on failures
        if self.attempts > 0 {
            chance *= 0.66_f64.powi(self.attempts.min(8) as i32);
        }

        // Favour peers we have talked to before
        if self.successes > 0 {
            chance *= 2.0;
        }

        chance.max(0.001)
    }

    /// Record a connection attempt
    pub fn attempt(&mut self) {
        self.attempts += 1;
        self.addr.mark_attempt();
    }

    /// Record a successful connection
    pub fn good(&mut self) {
        self.successes += 1;
        self.last_success = unix_now();
        self.attempts = 0;
        self.addr.touch();
    }
}

// =============================================================================
// Address Manager
// =============================================================================

/// Selection criteria for [`AddrManager::select`]
#[derive(Debug, Clone)]
pub struct SelectOptions {
    /// Services the candidate must advertise
    pub services: ServiceFlags,
    /// Skip addresses attempted less than this many seconds ago
    pub retry_after_secs: i64,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            services: ServiceFlags::NODE_NETWORK,
            retry_after_secs: 60,
        }
    }
}

/// Known peer addresses with selection and eviction policy
#[derive(Debug)]
pub struct AddrManager {
    /// Entries by endpoint
    by_addr: HashMap<SocketAddr, AddrEntry>,
    /// Accept loopback / private addresses (tests, private networks)
    allow_local: bool,
    /// Eviction kicks in beyond this many entries
    capacity: usize,
}

impl AddrManager {
    /// Create an empty address manager
    pub fn new() -> Self {
        Self {
            by_addr: HashMap::new(),
            allow_local: false,
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Also accept non-routable addresses
    pub fn allow_local(mut self, allow: bool) -> Self {
        self.allow_local = allow;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Rebuild from persisted entries
    pub fn from_entries(entries: Vec<AddrEntry>, allow_local: bool) -> Self {
        let mut mgr = Self::new().allow_local(allow_local);
        for entry in entries {
            if mgr.is_acceptable(&entry.addr) {
                mgr.by_addr.insert(entry.addr.canonical(), entry);
            }
        }
        mgr
    }

    /// Get number of addresses
    pub fn size(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    /// Entries with at least one successful connection
    pub fn tried_count(&self) -> usize {
        self.by_addr.values().filter(|e| e.successes > 0).count()
    }

    /// Basic format validation for incoming records
    fn is_acceptable(&self, addr: &Address) -> bool {
        let ip = addr.canonical().ip();
        if addr.port() == 0 || ip.is_unspecified() || ip.is_multicast() {
            return false;
        }

        self.allow_local || addr.is_routable()
    }

    /// Insert or refresh an address. Returns true if it was new.
    pub fn add(&mut self, addr: Address, source: Option<String>) -> bool {
        if !self.is_acceptable(&addr) {
            return false;
        }

        let key = addr.canonical();

        // Refresh existing entry
        if let Some(entry) = self.by_addr.get_mut(&key) {
            if addr.last_seen > entry.addr.last_seen {
                entry.addr.last_seen = addr.last_seen;
            }
            entry.addr.services |= addr.services;
            return false;
        }

        if self.by_addr.len() >= self.capacity {
            self.evict_oldest();
        }

        self.by_addr.insert(key, AddrEntry::new(addr, source));
        true
    }

    /// Add multiple addresses (from a peer-list message)
    pub fn add_many(&mut self, addrs: Vec<Address>, source: Option<String>) -> usize {
        let mut added = 0;
        for addr in addrs.into_iter().take(MAX_ADDR_PER_MESSAGE) {
            if self.add(addr, source.clone()) {
                added += 1;
            }
        }
        added
    }

    /// Look up one entry
    pub fn entry(&self, endpoint: &SocketAddr) -> Option<&AddrEntry> {
        self.by_addr.get(&crate::network::address::canonical(*endpoint))
    }

    /// All addresses matching `filter`
    pub fn get<F>(&self, filter: F) -> Vec<Address>
    where
        F: Fn(&AddrEntry) -> bool,
    {
        self.by_addr
            .values()
            .filter(|e| filter(e))
            .map(|e| e.addr.clone())
            .collect()
    }

    /// Mark address as good (successful connection)
    pub fn good(&mut self, endpoint: &SocketAddr) {
        let key = crate::network::address::canonical(*endpoint);
        if let Some(entry) = self.by_addr.get_mut(&key) {
            entry.good();
        }
    }

    /// Mark address as attempted
    pub fn attempt(&mut self, endpoint: &SocketAddr) {
        let key = crate::network::address::canonical(*endpoint);
        if let Some(entry) = self.by_addr.get_mut(&key) {
            entry.attempt();
        }
    }

    /// Pick a dial candidate not in `exclude`.
    ///
    /// Candidates must advertise the requested services and must not have
    /// been attempted within the retry interval. Never-attempted addresses
    /// are preferred; the rest are drawn weighted by [`AddrEntry::get_chance`].
    pub fn select(&self, exclude: &HashSet<SocketAddr>, opts: &SelectOptions) -> Option<Address> {
        let eligible: Vec<&AddrEntry> = self
            .by_addr
            .iter()
            .filter(|(k, e)| {
                !exclude.contains(*k)
                    && !e.is_terrible()
                    && e.addr.services.contains(opts.services)
                    && e
                        .addr
                        .since_attempt()
                        .map_or(true, |age| age >= opts.retry_after_secs)
            })
            .map(|(_, e)| e)
            .collect();

        if eligible.is_empty() {
            return None;
        }

        let mut rng = rand::thread_rng();

        let fresh: Vec<&&AddrEntry> = eligible.iter().filter(|e| e.addr.last_try == 0).collect();
        if !fresh.is_empty() {
            let pick = fresh[rng.gen_range(0..fresh.len())];
            return Some(pick.addr.clone());
        }

        // Weighted random selection based on chance
        let total_weight: f64 = eligible.iter().map(|e| e.get_chance()).sum();
        let mut target = rng.gen::<f64>() * total_weight;

        for entry in &eligible {
            target -= entry.get_chance();
            if target <= 0.0 {
                return Some(entry.addr.clone());
            }
        }

        // Fallback to first
        eligible.first().map(|e| e.addr.clone())
    }

    /// Random sample of usable addresses, e.g. to answer a peer-list request
    pub fn get_addr(&self, count: usize) -> Vec<Address> {
        let mut rng = rand::thread_rng();
        let count = count.min(MAX_ADDR_PER_MESSAGE);

        let mut addrs: Vec<_> = self
            .by_addr
            .values()
            .filter(|e| !e.is_terrible())
            .map(|e| e.addr.clone())
            .collect();

        // Shuffle and take requested count
        for i in (1..addrs.len()).rev() {
            let j = rng.gen_range(0..=i);
            addrs.swap(i, j);
        }

        addrs.truncate(count);
        addrs
    }

    /// Drop entries not seen for `max_age_secs` (as of `now`). Returns how many went.
    pub fn evict_stale(&mut self, max_age_secs: i64, now: i64) -> usize {
        let before = self.by_addr.len();
        self.by_addr.retain(|_, e| {
            let seen = now - e.addr.last_seen as i64 <= max_age_secs;
            let succeeded = e.last_success > 0 && now - e.last_success <= max_age_secs;
            seen || succeeded
        });
        before - self.by_addr.len()
    }

    /// Snapshot of every entry, for persistence
    pub fn entries(&self) -> Vec<AddrEntry> {
        self.by_addr.values().cloned().collect()
    }

    /// Make room by dropping the least recently seen entry
    fn evict_oldest(&mut self) {
        let oldest = self
            .by_addr
            .iter()
            .min_by_key(|(_, e)| e.addr.last_seen)
            .map(|(k, _)| *k);

        if let Some(key) = oldest {
            self.by_addr.remove(&key);
        }
    }
}

impl Default for AddrManager {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
