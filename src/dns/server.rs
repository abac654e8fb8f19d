//! Simple DNS Server
//!
//! Implements a basic authoritative DNS server that responds to A and AAAA
//! queries with good addresses from the database.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, info};

use crate::api::Metrics;
use crate::config::SeederConfig;
use crate::db::AddrDb;
use crate::dns::{DnsQueryResult, SeedDnsHandler};

/// DNS packet constants
const DNS_HEADER_SIZE: usize = 12;
const DNS_MAX_PACKET_SIZE: usize = 512;

/// DNS record types
const TYPE_A: u16 = 1;
const TYPE_AAAA: u16 = 28;
const TYPE_ANY: u16 = 255;

/// DNS flags
const FLAG_QR: u16 = 0x8000; // Query/Response
const FLAG_AA: u16 = 0x0400; // Authoritative Answer
const FLAG_RD: u16 = 0x0100; // Recursion Desired

/// Response codes
const RCODE_FORMERR: u16 = 1;
const RCODE_NXDOMAIN: u16 = 3;
const RCODE_NOTIMP: u16 = 4;
const RCODE_REFUSED: u16 = 5;

/// Run the DNS server
pub async fn run_dns_server(
    config: Arc<SeederConfig>,
    db: Arc<AddrDb>,
    metrics: Arc<Metrics>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.dns_port));
    let socket = Arc::new(UdpSocket::bind(addr).await?);

    info!("🌐 DNS server listening on {} for {}", addr, config.dns_domain);

    let handler = Arc::new(SeedDnsHandler::new(db, config.clone()));

    loop {
        let mut buf = [0u8; DNS_MAX_PACKET_SIZE];
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => {
                let request = buf[..len].to_vec();
                let handler = handler.clone();
                let socket = socket.clone();
                let metrics = metrics.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle_dns_query(socket.as_ref(), src, &request, &handler, &metrics).await {
                        debug!("DNS query error from {}: {}", src, e);
                    }
                });
            }
            Err(e) => {
                error!("DNS socket error: {}", e);
            }
        }
    }
}

/// Handle a single DNS query
async fn handle_dns_query(
    socket: &UdpSocket,
    src: SocketAddr,
    request: &[u8],
    handler: &SeedDnsHandler,
    metrics: &Metrics,
) -> anyhow::Result<()> {
    metrics.inc_dns_queries();

    let Some(response) = answer_query(request, handler) else {
        return Ok(()); // Ignore packets we cannot even echo
    };

    if response.len() > DNS_HEADER_SIZE {
        let rcode = u16::from_be_bytes([response[2], response[3]]) & 0x000F;
        if rcode != 0 {
            metrics.inc_dns_rejected();
        }
    }

    socket.send_to(&response, src).await?;
    Ok(())
}

/// Build the response packet for a raw request
///
/// Returns `None` for packets too short to carry a header, or which are
/// themselves responses.
fn answer_query(request: &[u8], handler: &SeedDnsHandler) -> Option<Vec<u8>> {
    if request.len() < DNS_HEADER_SIZE {
        return None;
    }

    // Parse header
    let id = u16::from_be_bytes([request[0], request[1]]);
    let flags = u16::from_be_bytes([request[2], request[3]]);
    let qdcount = u16::from_be_bytes([request[4], request[5]]);

    if flags & FLAG_QR != 0 {
        return None;
    }

    let opcode = (flags >> 11) & 0x0F;
    if opcode != 0 {
        return Some(build_error_response(id, flags, RCODE_NOTIMP));
    }

    if qdcount != 1 {
        return Some(build_error_response(id, flags, RCODE_FORMERR));
    }

    let (qname, qtype) = match parse_question(&request[DNS_HEADER_SIZE..]) {
        Ok((qname, qtype, _)) => (qname, qtype),
        Err(_) => return Some(build_error_response(id, flags, RCODE_FORMERR)),
    };

    debug!("DNS query: {} type {}", qname, qtype);

    let want_ipv4 = qtype == TYPE_A || qtype == TYPE_ANY;
    let want_ipv6 = qtype == TYPE_AAAA || qtype == TYPE_ANY;

    let (rcode, ipv4_addrs, ipv6_addrs, ttl) = match handler.query(&qname, want_ipv4, want_ipv6) {
        DnsQueryResult::Answer {
            ipv4_addrs,
            ipv6_addrs,
            ttl,
        } => (0, ipv4_addrs, ipv6_addrs, ttl),
        DnsQueryResult::NxDomain => (RCODE_NXDOMAIN, vec![], vec![], 0),
        DnsQueryResult::Refused => (RCODE_REFUSED, vec![], vec![], 0),
    };

    Some(build_dns_response(id, flags, rcode, &qname, qtype, &ipv4_addrs, &ipv6_addrs, ttl))
}

/// Parse DNS question section
fn parse_question(data: &[u8]) -> anyhow::Result<(String, u16, usize)> {
    let mut name_parts = Vec::new();
    let mut offset = 0;

    // Parse name labels
    loop {
        if offset >= data.len() {
            anyhow::bail!("Truncated question");
        }

        let len = data[offset] as usize;
        if len == 0 {
            offset += 1;
            break;
        }

        if len > 63 {
            anyhow::bail!("Invalid label length");
        }

        offset += 1;
        if offset + len > data.len() {
            anyhow::bail!("Truncated label");
        }

        let label = std::str::from_utf8(&data[offset..offset + len])?;
        name_parts.push(label.to_lowercase());
        offset += len;
    }

    if offset + 4 > data.len() {
        anyhow::bail!("Truncated question");
    }

    let qtype = u16::from_be_bytes([data[offset], data[offset + 1]]);
    let _qclass = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
    offset += 4;

    let name = name_parts.join(".");

    Ok((name, qtype, offset))
}

/// Header-only response carrying `rcode`
fn build_error_response(id: u16, request_flags: u16, rcode: u16) -> Vec<u8> {
    let flags = FLAG_QR | (request_flags & FLAG_RD) | (request_flags & 0x7800) | rcode;

    let mut response = Vec::with_capacity(DNS_HEADER_SIZE);
    response.extend_from_slice(&id.to_be_bytes());
    response.extend_from_slice(&flags.to_be_bytes());
    response.extend_from_slice(&[0u8; 8]); // all counts zero
    response
}

/// Build DNS response packet
#[allow(clippy::too_many_arguments)]
fn build_dns_response(
    id: u16,
    request_flags: u16,
    rcode: u16,
    qname: &str,
    qtype: u16,
    ipv4_addrs: &[Ipv4Addr],
    ipv6_addrs: &[Ipv6Addr],
    ttl: u32,
) -> Vec<u8> {
    let mut response = Vec::with_capacity(DNS_MAX_PACKET_SIZE);

    // Build header; the answer count is patched in once records are written
    let flags = FLAG_QR | FLAG_AA | (request_flags & FLAG_RD) | rcode;

    response.extend_from_slice(&id.to_be_bytes());
    response.extend_from_slice(&flags.to_be_bytes());
    response.extend_from_slice(&1u16.to_be_bytes()); // qdcount = 1
    response.extend_from_slice(&0u16.to_be_bytes()); // ancount
    response.extend_from_slice(&0u16.to_be_bytes()); // nscount = 0
    response.extend_from_slice(&0u16.to_be_bytes()); // arcount = 0

    // Build question section (echo back)
    let qname_offset = response.len();
    for part in qname.split('.').filter(|part| !part.is_empty()) {
        response.push(part.len() as u8);
        response.extend_from_slice(part.as_bytes());
    }
    response.push(0); // End of name

    response.extend_from_slice(&qtype.to_be_bytes());
    response.extend_from_slice(&1u16.to_be_bytes()); // IN class

    // Build answer section
    let name_ptr = 0xC000 | (qname_offset as u16); // Compression pointer
    let mut ancount: u16 = 0;

    let records = ipv4_addrs
        .iter()
        .map(|ip| (TYPE_A, ip.octets().to_vec()))
        .chain(ipv6_addrs.iter().map(|ip| (TYPE_AAAA, ip.octets().to_vec())));

    for (rtype, rdata) in records {
        if response.len() + 12 + rdata.len() > DNS_MAX_PACKET_SIZE {
            break; // Stop if we'd exceed packet size
        }

        response.extend_from_slice(&name_ptr.to_be_bytes());
        response.extend_from_slice(&rtype.to_be_bytes());
        response.extend_from_slice(&1u16.to_be_bytes()); // IN class
        response.extend_from_slice(&ttl.to_be_bytes());
        response.extend_from_slice(&(rdata.len() as u16).to_be_bytes()); // rdlength
        response.extend_from_slice(&rdata);
        ancount += 1;
    }

    response[6..8].copy_from_slice(&ancount.to_be_bytes());
    response
}
