//! Metrics Collection
//!
//! Collects and exposes metrics for monitoring the seeder.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::db::DbStats;

/// Metrics collector for the seeder
#[derive(Default)]
pub struct Metrics {
    /// Start time for uptime calculation
    start_time: Option<Instant>,

    /// Probes reported good
    pub probes_good: AtomicU64,

    /// Probes reported bad
    pub probes_bad: AtomicU64,

    /// Candidates released without a probe
    pub probes_skipped: AtomicU64,

    /// Addresses learned from seeds
    pub seed_addresses: AtomicU64,

    /// DNS queries served
    pub dns_queries: AtomicU64,

    /// DNS queries refused or answered NXDOMAIN
    pub dns_rejected: AtomicU64,

    /// Database dumps written
    pub db_dumps: AtomicU64,

    /// Database dumps that failed
    pub db_dump_failures: AtomicU64,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    pub fn add_probes(&self, good: u64, bad: u64, skipped: u64) {
        self.probes_good.fetch_add(good, Ordering::Relaxed);
        self.probes_bad.fetch_add(bad, Ordering::Relaxed);
        self.probes_skipped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn add_seed_addresses(&self, count: u64) {
        self.seed_addresses.fetch_add(count, Ordering::Relaxed);
    }

    /// Increment DNS queries
    pub fn inc_dns_queries(&self) {
        self.dns_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dns_rejected(&self) {
        self.dns_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_db_dumps(&self) {
        self.db_dumps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_db_dump_failures(&self) {
        self.db_dump_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Export metrics in Prometheus format, with database gauges from `stats`
    pub fn to_prometheus(&self, stats: &DbStats) -> String {
        let mut output = String::new();

        // Uptime
        output.push_str(&format!(
            "# HELP addr_seeder_uptime_seconds Seeder uptime in seconds\n\
             # TYPE addr_seeder_uptime_seconds gauge\n\
             addr_seeder_uptime_seconds {}\n\n",
            self.uptime_secs()
        ));

        // Crawler
        output.push_str(&format!(
            "# HELP addr_seeder_probes_total Probe outcomes reported to the database\n\
             # TYPE addr_seeder_probes_total counter\n\
             addr_seeder_probes_total{{outcome=\"good\"}} {}\n\
             addr_seeder_probes_total{{outcome=\"bad\"}} {}\n\
             addr_seeder_probes_total{{outcome=\"skipped\"}} {}\n\n",
            self.probes_good.load(Ordering::Relaxed),
            self.probes_bad.load(Ordering::Relaxed),
            self.probes_skipped.load(Ordering::Relaxed)
        ));

        output.push_str(&format!(
            "# HELP addr_seeder_seed_addresses_total Addresses learned from seeds\n\
             # TYPE addr_seeder_seed_addresses_total counter\n\
             addr_seeder_seed_addresses_total {}\n\n",
            self.seed_addresses.load(Ordering::Relaxed)
        ));

        // DNS
        output.push_str(&format!(
            "# HELP addr_seeder_dns_queries DNS queries served\n\
             # TYPE addr_seeder_dns_queries counter\n\
             addr_seeder_dns_queries {}\n\n",
            self.dns_queries.load(Ordering::Relaxed)
        ));

        output.push_str(&format!(
            "# HELP addr_seeder_dns_rejected DNS queries refused or unknown\n\
             # TYPE addr_seeder_dns_rejected counter\n\
             addr_seeder_dns_rejected {}\n\n",
            self.dns_rejected.load(Ordering::Relaxed)
        ));

        // Persistence
        output.push_str(&format!(
            "# HELP addr_seeder_db_dumps Database dumps written\n\
             # TYPE addr_seeder_db_dumps counter\n\
             addr_seeder_db_dumps {}\n\n",
            self.db_dumps.load(Ordering::Relaxed)
        ));

        output.push_str(&format!(
            "# HELP addr_seeder_db_dump_failures Database dumps that failed\n\
             # TYPE addr_seeder_db_dump_failures counter\n\
             addr_seeder_db_dump_failures {}\n\n",
            self.db_dump_failures.load(Ordering::Relaxed)
        ));

        // Database
        output.push_str(&format!(
            "# HELP addr_seeder_addresses Addresses per database state\n\
             # TYPE addr_seeder_addresses gauge\n\
             addr_seeder_addresses{{state=\"available\"}} {}\n\
             addr_seeder_addresses{{state=\"tracked\"}} {}\n\
             addr_seeder_addresses{{state=\"new\"}} {}\n\
             addr_seeder_addresses{{state=\"good\"}} {}\n\
             addr_seeder_addresses{{state=\"banned\"}} {}\n\n",
            stats.available, stats.tracked, stats.new, stats.good, stats.banned
        ));

        output.push_str(&format!(
            "# HELP addr_seeder_queue_age_seconds Age of the stalest queued probe\n\
             # TYPE addr_seeder_queue_age_seconds gauge\n\
             addr_seeder_queue_age_seconds {}\n\n",
            stats.age
        ));

        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self, stats: &DbStats) -> serde_json::Value {
        serde_json::json!({
            "uptime_secs": self.uptime_secs(),
            "probes": {
                "good": self.probes_good.load(Ordering::Relaxed),
                "bad": self.probes_bad.load(Ordering::Relaxed),
                "skipped": self.probes_skipped.load(Ordering::Relaxed),
            },
            "seed_addresses": self.seed_addresses.load(Ordering::Relaxed),
            "dns": {
                "queries": self.dns_queries.load(Ordering::Relaxed),
                "rejected": self.dns_rejected.load(Ordering::Relaxed),
            },
            "dumps": {
                "written": self.db_dumps.load(Ordering::Relaxed),
                "failed": self.db_dump_failures.load(Ordering::Relaxed),
            },
            "database": stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.add_probes(2, 1, 0);
        metrics.add_probes(1, 0, 3);
        metrics.inc_dns_queries();

        assert_eq!(metrics.probes_good.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.probes_bad.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.probes_skipped.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.dns_queries.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.add_probes(5, 0, 0);
        let stats = DbStats {
            good: 100,
            banned: 7,
            ..Default::default()
        };

        let output = metrics.to_prometheus(&stats);

        assert!(output.contains("addr_seeder_probes_total{outcome=\"good\"} 5"));
        assert!(output.contains("addr_seeder_addresses{state=\"good\"} 100"));
        assert!(output.contains("addr_seeder_addresses{state=\"banned\"} 7"));
    }

    #[test]
    fn test_json_format() {
        let metrics = Metrics::new();
        metrics.inc_db_dumps();
        let stats = DbStats {
            tracked: 50,
            ..Default::default()
        };

        let json = metrics.to_json(&stats);

        assert_eq!(json["dumps"]["written"], 1);
        assert_eq!(json["database"]["tracked"], 50);
    }
}
