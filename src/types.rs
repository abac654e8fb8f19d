//! Core types shared by the address database, crawler and answer services
//!
//! Endpoints are modelled independently of `std::net::SocketAddr` because the
//! persisted format and the crawler also carry Tor v3 addresses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

// =============================================================================
// SERVICE FLAGS
// =============================================================================

/// Services bitmask advertised by a peer in its version / addr messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceFlags(pub u64);

impl ServiceFlags {
    pub const NONE: ServiceFlags = ServiceFlags(0);

    /// Full node serving the complete block chain
    pub const NETWORK: ServiceFlags = ServiceFlags(1 << 0);

    pub const GETUTXO: ServiceFlags = ServiceFlags(1 << 1);

    pub const BLOOM: ServiceFlags = ServiceFlags(1 << 2);

    pub const WITNESS: ServiceFlags = ServiceFlags(1 << 3);

    pub const COMPACT_FILTERS: ServiceFlags = ServiceFlags(1 << 6);

    /// Pruned node serving only recent blocks
    pub const NETWORK_LIMITED: ServiceFlags = ServiceFlags(1 << 10);

    pub fn bits(self) -> u64 {
        self.0
    }

    /// True if every bit of `other` is set in `self`
    pub fn contains(self, other: ServiceFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ServiceFlags {
    type Output = ServiceFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        ServiceFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for ServiceFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ServiceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// =============================================================================
// NETWORK ADDRESSES
// =============================================================================

/// Reachable network an address belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Ipv4,
    Ipv6,
    Onion,
}

/// Set of networks the answer service is allowed to hand out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedNetworks {
    pub ipv4: bool,
    pub ipv6: bool,
    pub onion: bool,
}

impl AllowedNetworks {
    pub const fn all() -> Self {
        Self { ipv4: true, ipv6: true, onion: true }
    }

    pub const fn only(network: Network) -> Self {
        Self {
            ipv4: matches!(network, Network::Ipv4),
            ipv6: matches!(network, Network::Ipv6),
            onion: matches!(network, Network::Onion),
        }
    }

    pub fn allows(&self, network: Network) -> bool {
        match network {
            Network::Ipv4 => self.ipv4,
            Network::Ipv6 => self.ipv6,
            Network::Onion => self.onion,
        }
    }
}

impl Default for AllowedNetworks {
    fn default() -> Self {
        Self::all()
    }
}

/// Host part of a peer endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NetAddr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    /// Tor v3 ed25519 public key
    TorV3([u8; 32]),
}

impl NetAddr {
    /// IPv4-mapped IPv6 addresses collapse to plain IPv4
    pub fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => NetAddr::Ipv4(v4),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => NetAddr::Ipv4(v4),
                None => NetAddr::Ipv6(v6),
            },
        }
    }

    pub fn network(&self) -> Network {
        match self {
            NetAddr::Ipv4(_) => Network::Ipv4,
            NetAddr::Ipv6(_) => Network::Ipv6,
            NetAddr::TorV3(_) => Network::Onion,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            NetAddr::Ipv4(v4) => Some(IpAddr::V4(*v4)),
            NetAddr::Ipv6(v6) => Some(IpAddr::V6(*v6)),
            NetAddr::TorV3(_) => None,
        }
    }

    /// Whether the address can be handed out to arbitrary internet peers
    ///
    /// Rejects unspecified, loopback, private, link-local, shared,
    /// benchmarking, documentation and ORCHID ranges.
    pub fn is_routable(&self) -> bool {
        match self {
            NetAddr::Ipv4(ip) => ipv4_is_routable(ip),
            NetAddr::Ipv6(ip) => ipv6_is_routable(ip),
            NetAddr::TorV3(_) => true,
        }
    }
}

fn ipv4_is_routable(ip: &Ipv4Addr) -> bool {
    let o = ip.octets();
    if ip.is_unspecified() || ip.is_broadcast() || o[0] == 0 || ip.is_loopback() {
        return false;
    }
    // RFC1918
    if ip.is_private() {
        return false;
    }
    // RFC2544 benchmarking 198.18.0.0/15
    if o[0] == 198 && (o[1] == 18 || o[1] == 19) {
        return false;
    }
    // RFC3927 link-local
    if ip.is_link_local() {
        return false;
    }
    // RFC6598 shared address space 100.64.0.0/10
    if o[0] == 100 && (o[1] & 0xc0) == 64 {
        return false;
    }
    // RFC5737 documentation
    if ip.is_documentation() {
        return false;
    }
    !ip.is_multicast()
}

fn ipv6_is_routable(ip: &Ipv6Addr) -> bool {
    let s = ip.segments();
    if ip.is_unspecified() || ip.is_loopback() || ip.is_multicast() {
        return false;
    }
    // RFC4193 unique local fc00::/7
    if (s[0] & 0xfe00) == 0xfc00 {
        return false;
    }
    // RFC4862 link-local fe80::/64
    if s[0] == 0xfe80 && s[1] == 0 && s[2] == 0 && s[3] == 0 {
        return false;
    }
    // RFC4843 ORCHID 2001:10::/28 and RFC7343 ORCHIDv2 2001:20::/28
    if s[0] == 0x2001 && ((s[1] & 0xfff0) == 0x0010 || (s[1] & 0xfff0) == 0x0020) {
        return false;
    }
    // RFC3849 documentation
    if s[0] == 0x2001 && s[1] == 0x0db8 {
        return false;
    }
    true
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetAddr::Ipv4(ip) => write!(f, "{}", ip),
            NetAddr::Ipv6(ip) => write!(f, "[{}]", ip),
            NetAddr::TorV3(key) => write!(f, "[torv3:{}]", hex::encode(key)),
        }
    }
}

/// Network endpoint identifying one address record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    pub addr: NetAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: NetAddr, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn network(&self) -> Network {
        self.addr.network()
    }

    pub fn is_routable(&self) -> bool {
        self.addr.is_routable()
    }

    /// Socket address for direct connection, if this is an IP endpoint
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.addr.ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(NetAddr::from_ip(addr.ip()), addr.port())
    }
}

impl Serialize for Endpoint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Gossiped address observation fed into the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrObservation {
    pub endpoint: Endpoint,
    pub services: ServiceFlags,
    /// Time the address was last seen by the gossiping peer (Unix seconds)
    pub time: i64,
}

impl AddrObservation {
    pub fn new(endpoint: Endpoint, services: ServiceFlags, time: i64) -> Self {
        Self { endpoint, services, time }
    }
}

/// Get current Unix timestamp
pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}
