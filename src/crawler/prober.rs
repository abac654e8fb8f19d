//! Probers
//!
//! A prober attempts one connection to a candidate endpoint and reports
//! what it learned. Protocol-level probers plug in through [`Prober`].

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

use crate::db::ProbeResult;
use crate::types::AddrObservation;

/// What a peer told us about itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub client_version: i32,
    pub client_sub_version: String,
    pub height: i32,
    pub checkpoint_verified: bool,
}

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Good(NodeInfo),
    /// Failed; `info` holds whatever the peer reported before failing
    Bad { info: Option<NodeInfo>, ban_time: i64 },
    /// Not attempted, e.g. out of local sockets
    Skipped,
}

/// Result of one probe plus any addresses gossiped by the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub outcome: ProbeOutcome,
    pub learned: Vec<AddrObservation>,
}

impl From<ProbeOutcome> for ProbeReport {
    fn from(outcome: ProbeOutcome) -> Self {
        Self {
            outcome,
            learned: Vec::new(),
        }
    }
}

impl ProbeOutcome {
    /// Fill the result fields of a checked-out candidate
    ///
    /// Returns `false` for a skipped probe, which leaves `res` untouched.
    pub fn apply(&self, res: &mut ProbeResult) -> bool {
        let (good, info, ban_time) = match self {
            ProbeOutcome::Good(info) => (true, Some(info), 0),
            ProbeOutcome::Bad { info, ban_time } => (false, info.as_ref(), *ban_time),
            ProbeOutcome::Skipped => return false,
        };

        res.good = good;
        res.ban_time = ban_time;
        if let Some(info) = info {
            res.client_version = info.client_version;
            res.client_sub_version = info.client_sub_version.clone();
            res.height = info.height;
            res.checkpoint_verified = info.checkpoint_verified;
        }
        true
    }
}

/// Connects to a candidate and reports the outcome
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, candidate: &ProbeResult) -> ProbeReport;
}

/// Prober that only checks TCP reachability
pub struct TcpProber {
    timeout: Duration,
    /// Reachability counts as checkpoint verification
    marks_verified: bool,
}

impl TcpProber {
    pub fn new(timeout: Duration, marks_verified: bool) -> Self {
        Self {
            timeout,
            marks_verified,
        }
    }
}

/// Errors caused by local resource limits rather than the peer
fn is_local_failure(e: &io::Error) -> bool {
    const ENFILE: i32 = 23;
    const EMFILE: i32 = 24;
    matches!(e.raw_os_error(), Some(ENFILE) | Some(EMFILE)) || e.kind() == io::ErrorKind::AddrNotAvailable
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, candidate: &ProbeResult) -> ProbeReport {
        let Some(addr) = candidate.endpoint.socket_addr() else {
            return ProbeOutcome::Skipped.into();
        };

        let outcome = match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => ProbeOutcome::Good(NodeInfo {
                checkpoint_verified: self.marks_verified,
                ..Default::default()
            }),
            Ok(Err(e)) if is_local_failure(&e) => {
                trace!("Skipping {}: {}", addr, e);
                ProbeOutcome::Skipped
            }
            Ok(Err(e)) => {
                trace!("Probe of {} failed: {}", addr, e);
                ProbeOutcome::Bad { info: None, ban_time: 0 }
            }
            Err(_) => {
                trace!("Probe of {} timed out", addr);
                ProbeOutcome::Bad { info: None, ban_time: 0 }
            }
        };
        outcome.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Endpoint, NetAddr, ServiceFlags};

    fn candidate(endpoint: Endpoint) -> ProbeResult {
        ProbeResult {
            endpoint,
            services: ServiceFlags::NETWORK,
            good: false,
            ban_time: 0,
            height: 0,
            client_version: 0,
            client_sub_version: String::new(),
            checkpoint_verified: false,
            our_last_success: 0,
            last_address_request: 0,
        }
    }

    #[test]
    fn test_apply_outcomes() {
        let endpoint = Endpoint::new(NetAddr::Ipv4("1.2.3.4".parse().unwrap()), 8333);

        let mut res = candidate(endpoint);
        let info = NodeInfo {
            client_version: 70015,
            client_sub_version: "/Satoshi:25.0.0/".to_string(),
            height: 800_000,
            checkpoint_verified: true,
        };
        assert!(ProbeOutcome::Good(info).apply(&mut res));
        assert!(res.good);
        assert_eq!(res.height, 800_000);

        let mut res = candidate(endpoint);
        assert!(ProbeOutcome::Bad { info: None, ban_time: 3600 }.apply(&mut res));
        assert!(!res.good);
        assert_eq!(res.ban_time, 3600);
        assert_eq!(res.client_version, 0);

        let mut res = candidate(endpoint);
        assert!(!ProbeOutcome::Skipped.apply(&mut res));
        assert_eq!(res, candidate(endpoint));
    }

    #[tokio::test]
    async fn test_tcp_prober_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let prober = TcpProber::new(Duration::from_secs(5), true);
        let report = prober.probe(&candidate(Endpoint::from(addr))).await;

        match report.outcome {
            ProbeOutcome::Good(info) => assert!(info.checkpoint_verified),
            other => panic!("expected good outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tcp_prober_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let prober = TcpProber::new(Duration::from_secs(5), true);
        let report = prober.probe(&candidate(Endpoint::from(addr))).await;
        assert_eq!(report.outcome, ProbeOutcome::Bad { info: None, ban_time: 0 });
    }

    #[tokio::test]
    async fn test_tcp_prober_skips_onion() {
        let prober = TcpProber::new(Duration::from_secs(1), true);
        let report = prober.probe(&candidate(Endpoint::new(NetAddr::TorV3([7; 32]), 8333))).await;
        assert_eq!(report.outcome, ProbeOutcome::Skipped);
    }
}
