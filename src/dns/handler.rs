//! DNS Request Handler
//!
//! Maps a query name onto a service filter and samples good addresses from
//! the database.
//!
//! Names served:
//! - `<domain>`: full nodes (`NETWORK`)
//! - `x<hex>.<domain>`: nodes offering every service bit in `<hex>`,
//!   if that mask is in the configured whitelist

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::debug;

use crate::config::SeederConfig;
use crate::db::AddrDb;
use crate::types::{AllowedNetworks, NetAddr, Network, ServiceFlags};

/// Outcome of resolving one query name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsQueryResult {
    /// Name is ours; possibly empty answer
    Answer {
        ipv4_addrs: Vec<Ipv4Addr>,
        ipv6_addrs: Vec<Ipv6Addr>,
        ttl: u32,
    },
    /// Name is below our domain but names no accepted filter
    NxDomain,
    /// Name is outside our domain
    Refused,
}

/// DNS handler backed by the address database
pub struct SeedDnsHandler {
    db: Arc<AddrDb>,
    config: Arc<SeederConfig>,
}

impl SeedDnsHandler {
    /// Create a new DNS handler
    pub fn new(db: Arc<AddrDb>, config: Arc<SeederConfig>) -> Self {
        Self { db, config }
    }

    /// Service filter requested by `qname`, lowercase and without trailing dot
    pub fn service_filter(&self, qname: &str) -> Result<ServiceFlags, DnsQueryResult> {
        let domain = self.config.dns_domain.to_lowercase();
        if qname == domain {
            return Ok(ServiceFlags::NETWORK);
        }

        let Some(prefix) = qname.strip_suffix(domain.as_str()).and_then(|p| p.strip_suffix('.')) else {
            return Err(DnsQueryResult::Refused);
        };

        let flags = prefix
            .strip_prefix('x')
            .filter(|hex| !hex.is_empty() && !hex.contains('.'))
            .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            .ok_or(DnsQueryResult::NxDomain)?;

        if self.config.allowed_service_filters.contains(&flags) {
            Ok(ServiceFlags(flags))
        } else {
            Err(DnsQueryResult::NxDomain)
        }
    }

    /// Resolve a query for `qname`
    ///
    /// `want_ipv4` / `want_ipv6` select which families are sampled.
    pub fn query(&self, qname: &str, want_ipv4: bool, want_ipv6: bool) -> DnsQueryResult {
        let flags = match self.service_filter(qname) {
            Ok(flags) => flags,
            Err(rejected) => return rejected,
        };

        let allowed = &self.config.allowed_networks;
        let max = self.config.max_dns_answers;

        let mut ipv4_addrs = Vec::new();
        if want_ipv4 && allowed.ipv4 {
            ipv4_addrs = self
                .db
                .get_ips(flags, max, &AllowedNetworks::only(Network::Ipv4))
                .into_iter()
                .filter_map(|e| match e.addr {
                    NetAddr::Ipv4(ip) => Some(ip),
                    _ => None,
                })
                .collect();
        }

        let mut ipv6_addrs = Vec::new();
        if want_ipv6 && allowed.ipv6 {
            ipv6_addrs = self
                .db
                .get_ips(flags, max, &AllowedNetworks::only(Network::Ipv6))
                .into_iter()
                .filter_map(|e| match e.addr {
                    NetAddr::Ipv6(ip) => Some(ip),
                    _ => None,
                })
                .collect();
        }

        debug!(
            "DNS query {} (filter {}): {} IPv4, {} IPv6 addresses",
            qname,
            flags,
            ipv4_addrs.len(),
            ipv6_addrs.len()
        );

        DnsQueryResult::Answer {
            ipv4_addrs,
            ipv6_addrs,
            ttl: self.config.dns_ttl,
        }
    }
}
