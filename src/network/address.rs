//! Peer addresses
//!
//! An [`Address`] is a remote endpoint plus what we know about it: the
//! services it advertises, when it was last seen, and (in memory only) when
//! we last tried to dial it.

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Seen-time given to records that carry none
pub const SEEN_TIME_FLOOR: u32 = 100_000_000;

/// Encoded size of an address in its binary wire form
pub const WIRE_SIZE: usize = 4 + 8 + 16 + 2;

bitflags! {
    /// Capabilities a peer advertises
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ServiceFlags: u64 {
        /// Full node serving the complete data protocol
        const NODE_NETWORK = 1 << 0;
    }
}

impl Default for ServiceFlags {
    fn default() -> Self {
        ServiceFlags::NODE_NETWORK
    }
}

/// Address decoding errors
#[derive(Error, Debug, PartialEq)]
pub enum AddressError {
    #[error("Truncated address record: {0} bytes")]
    Truncated(usize),
    #[error("Invalid port 0")]
    InvalidPort,
}

/// A peer endpoint with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    /// IP and port
    pub endpoint: SocketAddr,
    /// Advertised services
    #[serde(
        default,
        serialize_with = "serialize_services",
        deserialize_with = "deserialize_services"
    )]
    pub services: ServiceFlags,
    /// Last time (unix seconds) this peer was seen alive
    #[serde(default = "default_seen")]
    pub last_seen: u32,
    /// Last dial attempt (unix seconds, 0 = never). Never persisted.
    #[serde(skip)]
    pub last_try: i64,
}

fn default_seen() -> u32 {
    SEEN_TIME_FLOOR
}

fn serialize_services<S: Serializer>(flags: &ServiceFlags, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(flags.bits())
}

fn deserialize_services<'de, D: Deserializer<'de>>(d: D) -> Result<ServiceFlags, D::Error> {
    let bits = u64::deserialize(d)?;
    Ok(normalize_services(bits))
}

/// Drop unknown capability bits; an empty set falls back to a full node
fn normalize_services(bits: u64) -> ServiceFlags {
    let flags = ServiceFlags::from_bits_truncate(bits);
    if flags.is_empty() {
        ServiceFlags::NODE_NETWORK
    } else {
        flags
    }
}

/// Current unix time in seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Address {
    /// Create a full-node address seen now
    pub fn new(endpoint: SocketAddr) -> Self {
        Self::with_services(endpoint, ServiceFlags::NODE_NETWORK)
    }

    pub fn with_services(endpoint: SocketAddr, services: ServiceFlags) -> Self {
        Self {
            endpoint,
            services,
            last_seen: unix_now().clamp(0, u32::MAX as i64) as u32,
            last_try: 0,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.endpoint.ip()
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port()
    }

    pub fn is_ipv4(&self) -> bool {
        self.canonical().is_ipv4()
    }

    /// Endpoint with IPv4-mapped IPv6 addresses folded back to IPv4
    pub fn canonical(&self) -> SocketAddr {
        canonical(self.endpoint)
    }

    /// Loopback address
    pub fn is_local(&self) -> bool {
        self.canonical().ip().is_loopback()
    }

    /// Whether this address could be reached over the public internet
    pub fn is_routable(&self) -> bool {
        if self.endpoint.port() == 0 {
            return false;
        }

        match self.canonical().ip() {
            IpAddr::V4(ip) => {
                !(ip.is_loopback()
                    || ip.is_private()
                    || ip.is_link_local()
                    || ip.is_unspecified()
                    || ip.is_broadcast()
                    || ip.is_documentation()
                    || ip.is_multicast())
            }
            IpAddr::V6(ip) => {
                let first = ip.segments()[0];
                !(ip.is_loopback()
                    || ip.is_unspecified()
                    || ip.is_multicast()
                    || (first & 0xfe00) == 0xfc00 // unique local
                    || (first & 0xffc0) == 0xfe80 // link local
                    || first == 0x2001 && ip.segments()[1] == 0x0db8) // documentation
            }
        }
    }

    /// Refresh the last-seen time
    pub fn touch(&mut self) {
        self.last_seen = unix_now().clamp(0, u32::MAX as i64) as u32;
    }

    /// Record a dial attempt
    pub fn mark_attempt(&mut self) {
        self.last_try = unix_now();
    }

    /// Seconds since the last dial attempt, `None` if never attempted
    pub fn since_attempt(&self) -> Option<i64> {
        if self.last_try == 0 {
            None
        } else {
            Some((unix_now() - self.last_try).max(0))
        }
    }

    /// Append the binary wire form
    pub fn encode(&self, dst: &mut BytesMut) {
        let ip = match self.endpoint.ip() {
            IpAddr::V4(ip) => ip.to_ipv6_mapped(),
            IpAddr::V6(ip) => ip,
        };

        dst.reserve(WIRE_SIZE);
        dst.put_u32_le(self.last_seen);
        dst.put_u64_le(self.services.bits());
        dst.put_slice(&ip.octets());
        dst.put_u16(self.endpoint.port());
    }

    /// Read one address from the binary wire form.
    ///
    /// Service bits are normalized the same way as on-disk records.
    pub fn decode(src: &mut impl Buf) -> Result<Self, AddressError> {
        if src.remaining() < WIRE_SIZE {
            return Err(AddressError::Truncated(src.remaining()));
        }

        let last_seen = src.get_u32_le();
        let services = normalize_services(src.get_u64_le());
        let mut octets = [0u8; 16];
        src.copy_to_slice(&mut octets);
        let port = src.get_u16();

        if port == 0 {
            return Err(AddressError::InvalidPort);
        }

        let endpoint = canonical(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port));
        Ok(Self {
            endpoint,
            services,
            last_seen: if last_seen == 0 {
                SEEN_TIME_FLOOR
            } else {
                last_seen
            },
            last_try: 0,
        })
    }
}

/// Fold IPv4-mapped IPv6 endpoints back to plain IPv4
pub fn canonical(endpoint: SocketAddr) -> SocketAddr {
    match endpoint.ip() {
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), endpoint.port()),
            None => endpoint,
        },
        IpAddr::V4(_) => endpoint,
    }
}

impl From<SocketAddr> for Address {
    fn from(endpoint: SocketAddr) -> Self {
        Address::new(endpoint)
    }
}

// Identity is the endpoint alone; metadata refreshes do not change it.
impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}
