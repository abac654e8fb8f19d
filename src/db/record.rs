//! Per-address record and reliability classification

use serde::Serialize;
use std::fmt;

use super::stat::{ReliabilityStat, TAU_1D, TAU_1M, TAU_1W, TAU_2H, TAU_8H};
use crate::types::{Endpoint, ServiceFlags};

/// Minimum seconds between two of our own probes of the same address
pub const MIN_RETRY: i64 = 1000;

/// Ban durations (seconds)
pub const BAN_1_DAY: i64 = 86_400;
pub const BAN_7_DAYS: i64 = 7 * 86_400;
pub const BAN_30_DAYS: i64 = 30 * 86_400;

// =============================================================================
// CHAIN PARAMETERS
// =============================================================================

/// Network-specific thresholds used by classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainParams {
    /// Canonical P2P port of the network
    pub default_port: u16,

    /// Minimum protocol version a good peer must report
    pub required_version: i32,

    /// Peers reporting a version below this are banned for a week
    pub legacy_ban_version: i32,

    /// Minimum chain height a good peer must report
    pub required_height: i32,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            default_port: 8333,
            required_version: 70001,
            legacy_ban_version: 31900,
            required_height: 0,
        }
    }
}

// =============================================================================
// CLASSIFICATION
// =============================================================================

/// First reason an address is not reliable, or `Ok`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reliableness {
    Ok,
    NonstandardPort,
    NotNodeNetwork,
    NotRoutable,
    NotRequiredVersion,
    NotRequiredHeight,
    BadUptime,
    UnverifiedCheckpoint,
}

impl fmt::Display for Reliableness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reliableness::Ok => "OK",
            Reliableness::NonstandardPort => "NONSTANDARD_PORT",
            Reliableness::NotNodeNetwork => "NOT_NODE_NETWORK",
            Reliableness::NotRoutable => "NOT_ROUTABLE",
            Reliableness::NotRequiredVersion => "NOT_REQUIRED_VERSION",
            Reliableness::NotRequiredHeight => "NOT_REQUIRED_HEIGHT",
            Reliableness::BadUptime => "BAD_UPTIME",
            Reliableness::UnverifiedCheckpoint => "UNVERIFIED_CHECKPOINT",
        };
        f.write_str(s)
    }
}

/// Read-only snapshot of one record for reporting
#[derive(Debug, Clone, Serialize)]
pub struct AddrReport {
    pub endpoint: Endpoint,
    pub client_version: i32,
    pub client_sub_version: String,
    pub blocks: i32,
    /// Reliability over the 2h, 8h, 1d, 1w and 1m horizons
    pub uptime: [f64; 5],
    pub last_success: i64,
    pub reliableness: Reliableness,
    pub services: ServiceFlags,
}

// =============================================================================
// ADDRESS RECORD
// =============================================================================

/// Everything the seeder knows about one endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct AddrRecord {
    pub endpoint: Endpoint,
    pub services: ServiceFlags,

    /// Last time anyone (gossip or us) saw or tried this address
    pub last_try: i64,

    /// Our own last probe; zero while the record is untried
    pub our_last_try: i64,
    pub our_last_success: i64,
    pub last_address_request: i64,

    pub stat_2h: ReliabilityStat,
    pub stat_8h: ReliabilityStat,
    pub stat_1d: ReliabilityStat,
    pub stat_1w: ReliabilityStat,
    pub stat_1m: ReliabilityStat,

    pub client_version: i32,
    pub client_sub_version: String,
    pub blocks: i32,
    pub total: i32,
    pub success: i32,
    pub checkpoint_verified: bool,
}

impl AddrRecord {
    /// Fresh untried record
    pub fn new(endpoint: Endpoint, services: ServiceFlags, last_try: i64) -> Self {
        Self {
            endpoint,
            services,
            last_try,
            our_last_try: 0,
            our_last_success: 0,
            last_address_request: 0,
            stat_2h: ReliabilityStat::default(),
            stat_8h: ReliabilityStat::default(),
            stat_1d: ReliabilityStat::default(),
            stat_1w: ReliabilityStat::default(),
            stat_1m: ReliabilityStat::default(),
            client_version: 0,
            client_sub_version: String::new(),
            blocks: 0,
            total: 0,
            success: 0,
            checkpoint_verified: false,
        }
    }

    pub fn is_tried(&self) -> bool {
        self.our_last_try != 0
    }

    /// Record the outcome of one of our probes at time `now`
    pub fn update(&mut self, good: bool, now: i64) {
        if self.our_last_try == 0 {
            self.our_last_try = now - MIN_RETRY;
        }
        let age = now - self.our_last_try;
        self.last_try = now;
        self.our_last_try = now;
        self.total += 1;
        if good {
            self.success += 1;
            self.our_last_success = now;
        }

        self.stat_2h.update(good, age, TAU_2H);
        self.stat_8h.update(good, age, TAU_8H);
        self.stat_1d.update(good, age, TAU_1D);
        self.stat_1w.update(good, age, TAU_1W);
        self.stat_1m.update(good, age, TAU_1M);
    }

    /// Return the first detected reason this address is unreliable
    pub fn reliableness(&self, params: &ChainParams) -> Reliableness {
        if self.endpoint.port != params.default_port {
            return Reliableness::NonstandardPort;
        }
        if !self.services.contains(ServiceFlags::NETWORK) {
            return Reliableness::NotNodeNetwork;
        }
        if !self.endpoint.is_routable() {
            return Reliableness::NotRoutable;
        }
        if self.client_version != 0 && self.client_version < params.required_version {
            return Reliableness::NotRequiredVersion;
        }
        if self.blocks != 0 && self.blocks < params.required_height {
            return Reliableness::NotRequiredHeight;
        }
        if self.has_bad_uptime() {
            return Reliableness::BadUptime;
        }
        if !self.checkpoint_verified {
            return Reliableness::UnverifiedCheckpoint;
        }
        Reliableness::Ok
    }

    /// Every horizon is either below its reliability bar or still short of
    /// samples, on an address with enough failed history to judge.
    fn has_bad_uptime(&self) -> bool {
        (self.total > 3 || self.success * 2 < self.total)
            && (self.stat_2h.reliability <= 0.85 || self.stat_2h.count <= 2.0)
            && (self.stat_8h.reliability <= 0.70 || self.stat_8h.count <= 4.0)
            && (self.stat_1d.reliability <= 0.55 || self.stat_1d.count <= 8.0)
            && (self.stat_1w.reliability <= 0.45 || self.stat_1w.count <= 16.0)
            && (self.stat_1m.reliability <= 0.35 || self.stat_1m.count <= 32.0)
    }

    pub fn is_reliable(&self, params: &ChainParams) -> bool {
        self.reliableness(params) == Reliableness::Ok
    }

    /// Seconds this address should be banned for, zero if not at all
    pub fn ban_time(&self, params: &ChainParams) -> i64 {
        if self.is_reliable(params) {
            return 0;
        }
        if self.client_version != 0 && self.client_version < params.legacy_ban_version {
            return BAN_7_DAYS;
        }
        if self.stat_1m.margin() < 0.15 && self.stat_1m.count > 32.0 {
            return BAN_30_DAYS;
        }
        if self.stat_1w.margin() < 0.10 && self.stat_1w.count > 16.0 {
            return BAN_7_DAYS;
        }
        if self.stat_1d.margin() < 0.05 && self.stat_1d.count > 8.0 {
            return BAN_1_DAY;
        }
        0
    }

    pub fn report(&self, params: &ChainParams) -> AddrReport {
        AddrReport {
            endpoint: self.endpoint,
            client_version: self.client_version,
            client_sub_version: self.client_sub_version.clone(),
            blocks: self.blocks,
            uptime: [
                self.stat_2h.reliability as f64,
                self.stat_8h.reliability as f64,
                self.stat_1d.reliability as f64,
                self.stat_1w.reliability as f64,
                self.stat_1m.reliability as f64,
            ],
            last_success: self.our_last_success,
            reliableness: self.reliableness(params),
            services: self.services,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::NetAddr;

    pub(crate) const NOW: i64 = 1_700_000_000;

    pub(crate) fn endpoint(s: &str, port: u16) -> Endpoint {
        Endpoint::new(NetAddr::Ipv4(s.parse().unwrap()), port)
    }

    /// A record that passes every check
    pub(crate) fn reliable_record() -> AddrRecord {
        let mut record = AddrRecord::new(endpoint("1.2.3.4", 8333), ServiceFlags::NETWORK, NOW);
        record.client_version = 70015;
        record.blocks = 800_000;
        record.checkpoint_verified = true;
        record.update(true, NOW);
        record
    }

    fn stat(reliability: f32, weight: f32, count: f32) -> ReliabilityStat {
        ReliabilityStat { weight, count, reliability }
    }

    #[test]
    fn test_reliable_record() {
        let params = ChainParams::default();
        let record = reliable_record();
        assert_eq!(record.reliableness(&params), Reliableness::Ok);
        assert!(record.is_reliable(&params));
        assert_eq!(record.ban_time(&params), 0);
    }

    #[test]
    fn test_first_update_marks_tried() {
        let mut record = AddrRecord::new(endpoint("1.2.3.4", 8333), ServiceFlags::NETWORK, NOW);
        assert!(!record.is_tried());

        record.update(false, NOW);
        assert!(record.is_tried());
        assert_eq!(record.our_last_try, NOW);
        assert_eq!(record.total, 1);
        assert_eq!(record.success, 0);
        // First probe decays against a synthetic previous try MIN_RETRY ago
        assert!(record.stat_2h.weight > 0.0);
    }

    #[test]
    fn test_reliableness_priority_order() {
        let params = ChainParams { required_height: 1000, ..ChainParams::default() };

        // Every check fails: the port check wins
        let mut record = AddrRecord::new(endpoint("10.0.0.1", 1234), ServiceFlags::NONE, NOW);
        record.client_version = 100;
        record.blocks = 10;
        record.total = 10;
        assert_eq!(record.reliableness(&params), Reliableness::NonstandardPort);

        record.endpoint.port = 8333;
        assert_eq!(record.reliableness(&params), Reliableness::NotNodeNetwork);

        record.services = ServiceFlags::NETWORK;
        assert_eq!(record.reliableness(&params), Reliableness::NotRoutable);

        record.endpoint = endpoint("1.2.3.4", 8333);
        assert_eq!(record.reliableness(&params), Reliableness::NotRequiredVersion);

        record.client_version = 70015;
        assert_eq!(record.reliableness(&params), Reliableness::NotRequiredHeight);

        record.blocks = 2000;
        assert_eq!(record.reliableness(&params), Reliableness::BadUptime);

        record.total = 0;
        assert_eq!(record.reliableness(&params), Reliableness::UnverifiedCheckpoint);

        record.checkpoint_verified = true;
        assert_eq!(record.reliableness(&params), Reliableness::Ok);
    }

    #[test]
    fn test_unreported_version_and_height_pass() {
        let params = ChainParams { required_height: 1000, ..ChainParams::default() };
        let mut record = reliable_record();
        record.client_version = 0;
        record.blocks = 0;
        assert!(record.is_reliable(&params));
    }

    #[test]
    fn test_bad_uptime_low_sample_escape() {
        let params = ChainParams::default();
        let mut record = reliable_record();
        record.total = 10;
        record.success = 0;

        // A high 2h reliability over too few samples does not count
        record.stat_2h = stat(0.9, 0.95, 2.0);
        record.stat_8h = stat(0.0, 0.5, 50.0);
        record.stat_1d = stat(0.0, 0.5, 50.0);
        record.stat_1w = stat(0.0, 0.5, 50.0);
        record.stat_1m = stat(0.0, 0.5, 50.0);
        assert_eq!(record.reliableness(&params), Reliableness::BadUptime);

        // One horizon above its bar with enough samples rescues the record
        record.stat_1w = stat(0.5, 0.6, 50.0);
        assert_eq!(record.reliableness(&params), Reliableness::Ok);
    }

    #[test]
    fn test_bad_uptime_needs_attempt_history() {
        let params = ChainParams::default();
        let mut record = reliable_record();
        record.stat_2h = stat(0.0, 0.5, 50.0);
        record.stat_8h = stat(0.0, 0.5, 50.0);
        record.stat_1d = stat(0.0, 0.5, 50.0);
        record.stat_1w = stat(0.0, 0.5, 50.0);
        record.stat_1m = stat(0.0, 0.5, 50.0);

        // Three attempts, two successes: not enough history to judge
        record.total = 3;
        record.success = 2;
        assert!(record.is_reliable(&params));

        // Mostly failing attempts are enough
        record.success = 1;
        assert_eq!(record.reliableness(&params), Reliableness::BadUptime);
    }

    #[test]
    fn test_legacy_version_ban() {
        let params = ChainParams::default();
        let mut record = reliable_record();
        record.client_version = 31000;
        record.update(false, NOW + 3600);
        assert_eq!(record.ban_time(&params), BAN_7_DAYS);
    }

    #[test]
    fn test_ban_time_thresholds() {
        let params = ChainParams::default();
        let mut record = reliable_record();
        record.checkpoint_verified = false;
        assert_eq!(record.ban_time(&params), 0);

        // 1 month: margin just below 0.15 with enough samples
        record.stat_1m = stat(0.0, 0.86, 33.0);
        assert_eq!(record.ban_time(&params), BAN_30_DAYS);

        // At the edge: margin 0.15 is not below the bar
        record.stat_1m = stat(0.15, 1.0, 33.0);
        assert_eq!(record.ban_time(&params), 0);

        // Not enough samples
        record.stat_1m = stat(0.0, 0.9, 32.0);
        assert_eq!(record.ban_time(&params), 0);

        record.stat_1w = stat(0.0, 0.95, 17.0);
        assert_eq!(record.ban_time(&params), BAN_7_DAYS);
        record.stat_1w = stat(0.0, 0.95, 16.0);
        assert_eq!(record.ban_time(&params), 0);
        // 1 week margin: just below 0.10 bans, 0.10 does not
        record.stat_1w = stat(0.0, 0.91, 17.0);
        assert_eq!(record.ban_time(&params), BAN_7_DAYS);
        record.stat_1w = stat(0.10, 1.0, 17.0);
        assert_eq!(record.ban_time(&params), 0);

        record.stat_1d = stat(0.0, 0.97, 9.0);
        assert_eq!(record.ban_time(&params), BAN_1_DAY);
        record.stat_1d = stat(0.0, 0.97, 8.0);
        assert_eq!(record.ban_time(&params), 0);
        // 1 day margin: just below 0.05 bans, 0.05 does not
        record.stat_1d = stat(0.0, 0.96, 9.0);
        assert_eq!(record.ban_time(&params), BAN_1_DAY);
        record.stat_1d = stat(0.05, 1.0, 9.0);
        assert_eq!(record.ban_time(&params), 0);
    }

    #[test]
    fn test_ban_time_zero_iff_reliable() {
        let params = ChainParams::default();
        let mut record = reliable_record();
        record.stat_1m = stat(0.0, 0.9, 40.0);
        // Reliable records are never banned, even with a terrible month
        assert!(record.is_reliable(&params));
        assert_eq!(record.ban_time(&params), 0);

        record.checkpoint_verified = false;
        assert_eq!(record.ban_time(&params), BAN_30_DAYS);
    }

    #[test]
    fn test_report_fields() {
        let params = ChainParams::default();
        let record = reliable_record();
        let report = record.report(&params);
        assert_eq!(report.endpoint, record.endpoint);
        assert_eq!(report.last_success, NOW);
        assert_eq!(report.reliableness, Reliableness::Ok);
        assert_eq!(report.uptime[0], record.stat_2h.reliability as f64);
        assert_eq!(report.uptime[4], record.stat_1m.reliability as f64);
    }
}
