//! Seeder Configuration
//!
//! Configurable parameters for the crawler, the address database and the
//! answer services. Defaults target the Bitcoin main network.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::db::ChainParams;
use crate::types::{AllowedNetworks, ServiceFlags};

/// Main configuration for the seeder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeederConfig {
    // === Chain ===

    /// Canonical P2P port; good peers must listen on it
    pub default_port: u16,

    /// Minimum protocol version a good peer must report
    pub required_version: i32,

    /// Peers reporting a version below this are banned for a week
    pub legacy_ban_version: i32,

    /// Minimum chain height a good peer must report
    pub required_height: i32,

    // === Crawler ===

    /// Number of concurrent probe workers
    pub threads: usize,

    /// Candidates pulled from the database per worker round
    pub batch_size: usize,

    /// Connect timeout for a single probe (seconds)
    pub probe_timeout_secs: u64,

    /// Wait before pulling again when no candidate is due (seconds)
    pub idle_wait_secs: u64,

    /// Treat a successful TCP probe as checkpoint-verified
    pub tcp_probe_marks_verified: bool,

    /// Hosts resolved at startup and forced into the database (host[:port])
    pub seeds: Vec<String>,

    // === Persistence ===

    /// Interval between database dumps (seconds)
    pub dump_interval_secs: u64,

    /// Binary database file inside the data directory
    pub db_file: String,

    /// Human-readable report inside the data directory
    pub dump_file: String,

    /// Append-only stats log inside the data directory
    pub stats_file: String,

    // === API ===

    /// Port for HTTP API
    pub api_port: u16,

    // === DNS ===

    /// Port for DNS server
    pub dns_port: u16,

    /// DNS domain name for this seed
    pub dns_domain: String,

    /// TTL of answer records (seconds)
    pub dns_ttl: u32,

    /// Maximum addresses per DNS answer
    pub max_dns_answers: usize,

    /// Service masks clients may request through `x<hex>.` subdomains
    pub allowed_service_filters: Vec<u64>,

    /// Networks handed out in answers
    pub allowed_networks: AllowedNetworks,
}

impl Default for SeederConfig {
    fn default() -> Self {
        let params = ChainParams::default();
        Self {
            // Chain
            default_port: params.default_port,
            required_version: params.required_version,
            legacy_ban_version: params.legacy_ban_version,
            required_height: params.required_height,

            // Crawler
            threads: 32,
            batch_size: 16,
            probe_timeout_secs: 10,
            idle_wait_secs: 5,
            tcp_probe_marks_verified: true,
            seeds: vec![
                "seed.bitcoin.sipa.be".to_string(),
                "dnsseed.bluematt.me".to_string(),
                "seed.bitcoinstats.com".to_string(),
            ],

            // Persistence
            dump_interval_secs: 100,
            db_file: "seeder.dat".to_string(),
            dump_file: "seeder.dump".to_string(),
            stats_file: "dnsstats.log".to_string(),

            // API
            api_port: 8080,

            // DNS
            dns_port: 5353, // Use 53 in production with proper permissions
            dns_domain: "seed.example.net".to_string(),
            dns_ttl: 3600,
            max_dns_answers: 25,
            allowed_service_filters: vec![
                ServiceFlags::NETWORK.bits(),
                (ServiceFlags::NETWORK | ServiceFlags::BLOOM).bits(),
                (ServiceFlags::NETWORK | ServiceFlags::WITNESS).bits(),
                (ServiceFlags::NETWORK | ServiceFlags::WITNESS | ServiceFlags::BLOOM).bits(),
            ],
            allowed_networks: AllowedNetworks::all(),
        }
    }
}

impl SeederConfig {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn chain_params(&self) -> ChainParams {
        ChainParams {
            default_port: self.default_port,
            required_version: self.required_version,
            legacy_ban_version: self.legacy_ban_version,
            required_height: self.required_height,
        }
    }

    // Builder-style methods for CLI overrides

    pub fn with_dns_port(mut self, port: Option<u16>) -> Self {
        if let Some(port) = port {
            self.dns_port = port;
        }
        self
    }

    pub fn with_api_port(mut self, port: Option<u16>) -> Self {
        if let Some(port) = port {
            self.api_port = port;
        }
        self
    }

    pub fn with_threads(mut self, threads: Option<usize>) -> Self {
        if let Some(threads) = threads {
            self.threads = threads;
        }
        self
    }

    /// Extra seeds are appended to the configured ones
    pub fn with_seeds(mut self, seeds: Vec<String>) -> Self {
        for seed in seeds {
            if !self.seeds.contains(&seed) {
                self.seeds.push(seed);
            }
        }
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.threads == 0 {
            anyhow::bail!("threads must be at least 1");
        }

        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }

        if self.probe_timeout_secs == 0 || self.dump_interval_secs == 0 {
            anyhow::bail!(
                "probe_timeout_secs ({}) and dump_interval_secs ({}) must be positive",
                self.probe_timeout_secs,
                self.dump_interval_secs
            );
        }

        if self.legacy_ban_version > self.required_version {
            anyhow::bail!(
                "legacy_ban_version ({}) must not exceed required_version ({})",
                self.legacy_ban_version,
                self.required_version
            );
        }

        if self.dns_domain.is_empty() || self.dns_domain.split('.').any(|label| label.is_empty() || label.len() > 63) {
            anyhow::bail!("dns_domain ({:?}) is not a valid domain name", self.dns_domain);
        }

        if self.max_dns_answers == 0 {
            anyhow::bail!("max_dns_answers must be at least 1");
        }

        if !self.allowed_service_filters.contains(&ServiceFlags::NETWORK.bits()) {
            anyhow::bail!("allowed_service_filters must include the plain NETWORK filter (1)");
        }

        Ok(())
    }
}
