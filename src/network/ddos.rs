//! DDOS admission control
//!
//! Each server owns a [`DdosFilter`]. Every accepted connection and every
//! handled packet adds weight to the remote address's score; an address whose
//! connection or request score reaches its threshold inside the window is
//! banned for the length of the window.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// What a score is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreKind {
    Connection,
    Request,
}

/// Thresholds, window and weights of one filter
#[derive(Debug, Clone)]
pub struct DdosSettings {
    pub connection_threshold: u32,
    pub request_threshold: u32,
    pub window: Duration,
    pub connection_weight: u32,
    pub request_weight: u32,
}

impl Default for DdosSettings {
    fn default() -> Self {
        Self {
            connection_threshold: 1,
            request_threshold: 2000,
            window: Duration::from_secs(20),
            connection_weight: 1,
            request_weight: 1,
        }
    }
}

/// One sliding-window accumulator
#[derive(Debug, Clone, Copy)]
struct Accumulator {
    total: u32,
    last: Instant,
}

impl Accumulator {
    fn new(now: Instant) -> Self {
        Self { total: 0, last: now }
    }

    /// Add weight, starting over if untouched for longer than `window`
    fn add(&mut self, weight: u32, window: Duration, now: Instant) -> u32 {
        if now.saturating_duration_since(self.last) > window {
            self.total = 0;
        }
        self.total = self.total.saturating_add(weight);
        self.last = now;
        self.total
    }

    fn lapsed(&self, window: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last) > window
    }
}

/// Score state of one remote address
#[derive(Debug, Clone)]
pub struct DdosScore {
    connections: Accumulator,
    requests: Accumulator,
    banned_until: Option<Instant>,
}

impl DdosScore {
    fn new(now: Instant) -> Self {
        Self {
            connections: Accumulator::new(now),
            requests: Accumulator::new(now),
            banned_until: None,
        }
    }

    fn is_banned(&self, now: Instant) -> bool {
        self.banned_until.map_or(false, |until| now < until)
    }
}

/// Per-address scoring engine
#[derive(Debug)]
pub struct DdosFilter {
    settings: DdosSettings,
    scores: Mutex<HashMap<IpAddr, DdosScore>>,
}

impl DdosFilter {
    pub fn new(settings: DdosSettings) -> Self {
        Self {
            settings,
            scores: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &DdosSettings {
        &self.settings
    }

    /// Add `weight` to the address's score. Returns true if it is banned afterwards.
    pub fn score(&self, ip: IpAddr, weight: u32, kind: ScoreKind) -> bool {
        self.score_at(ip, weight, kind, Instant::now())
    }

    /// [`DdosFilter::score`] with the clock supplied by the caller
    pub fn score_at(&self, ip: IpAddr, weight: u32, kind: ScoreKind, now: Instant) -> bool {
        let window = self.settings.window;
        let mut scores = self.scores.lock();
        let entry = scores.entry(ip).or_insert_with(|| DdosScore::new(now));

        let (total, threshold) = match kind {
            ScoreKind::Connection => (
                entry.connections.add(weight, window, now),
                self.settings.connection_threshold,
            ),
            ScoreKind::Request => (
                entry.requests.add(weight, window, now),
                self.settings.request_threshold,
            ),
        };

        if entry.is_banned(now) {
            return true;
        }

        if threshold > 0 && total >= threshold {
            entry.banned_until = Some(now + window);
            log::warn!(
                "DDOS ban on {} for {:?}: {:?} score {} reached {}",
                ip,
                window,
                kind,
                total,
                threshold
            );
            return true;
        }

        false
    }

    /// Score one accepted connection with the configured weight
    pub fn score_connection(&self, ip: IpAddr) -> bool {
        self.score(ip, self.settings.connection_weight, ScoreKind::Connection)
    }

    /// Score one handled request with the configured weight
    pub fn score_request(&self, ip: IpAddr) -> bool {
        self.score(ip, self.settings.request_weight, ScoreKind::Request)
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        self.is_banned_at(ip, Instant::now())
    }

    pub fn is_banned_at(&self, ip: &IpAddr, now: Instant) -> bool {
        self.scores
            .lock()
            .get(ip)
            .map_or(false, |s| s.is_banned(now))
    }

    /// Ban an address for `duration` regardless of its score
    pub fn ban(&self, ip: IpAddr, duration: Duration) {
        let now = Instant::now();
        let mut scores = self.scores.lock();
        let entry = scores.entry(ip).or_insert_with(|| DdosScore::new(now));
        entry.banned_until = Some(now + duration);
        log::warn!("Banned {} for {:?}", ip, duration);
    }

    /// Drop entries whose ban is over and whose windows have lapsed
    pub fn evict_expired(&self, now: Instant) -> usize {
        let window = self.settings.window;
        let mut scores = self.scores.lock();
        let before = scores.len();
        scores.retain(|_, s| {
            s.is_banned(now) || !s.connections.lapsed(window, now) || !s.requests.lapsed(window, now)
        });
        before - scores.len()
    }

    pub fn tracked(&self) -> usize {
        self.scores.lock().len()
    }
}
