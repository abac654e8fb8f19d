//! DNS Server Module
//!
//! Answers bootstrap DNS queries with random samples of good addresses.
//!
//! ## DNS Records
//!
//! - A records: IPv4 addresses of good peers
//! - AAAA records: IPv6 addresses of good peers

mod handler;
mod server;

pub use handler::{DnsQueryResult, SeedDnsHandler};
pub use server::run_dns_server;
