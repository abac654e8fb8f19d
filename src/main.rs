// Allow dead code - some accessors are kept for API completeness
#![allow(dead_code)]

//! Address Seeder Service
//!
//! Crawls a peer-to-peer network, keeps a reputation database of the
//! addresses it finds and serves the reliable ones to bootstrapping nodes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ADDR SEEDER                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Seed Resolver              ──▶ forces seed addresses in    │
//! │  Crawler workers            ◀─▶ pull / probe / report       │
//! │  Address Database           ←── reliability + ban policy    │
//! │  Dumper                     ──▶ seeder.dat, seeder.dump     │
//! │  DNS Server (53)            ←── answers A / AAAA queries    │
//! │  HTTP API (8080)            ←── stats, reports, metrics     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod api;
mod config;
mod crawler;
mod db;
mod dns;
mod storage;
mod types;

use api::Metrics;
use config::SeederConfig;
use crawler::{Prober, TcpProber};
use db::AddrDb;
use storage::DumpPaths;

/// Address seeder - peer crawler and bootstrap DNS server
#[derive(Parser, Debug)]
#[command(name = "addr-seeder")]
#[command(version)]
#[command(about = "Crawls the network and serves reliable peer addresses", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "seeder.toml")]
    config: PathBuf,

    /// Data directory for the address database and reports
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// DNS server port (requires root or CAP_NET_BIND_SERVICE for port 53)
    #[arg(long)]
    dns_port: Option<u16>,

    /// HTTP API port for metrics
    #[arg(long)]
    api_port: Option<u16>,

    /// Number of crawler workers
    #[arg(short, long)]
    threads: Option<usize>,

    /// Additional seed host[:port] (repeatable)
    #[arg(long = "seed")]
    seeds: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .init();

    info!("🌐 Address Seeder v{}", env!("CARGO_PKG_VERSION"));

    // Create data directory
    tokio::fs::create_dir_all(&args.data_dir).await?;

    // Load configuration
    let config = if args.config.exists() {
        SeederConfig::load(&args.config)?
    } else {
        warn!("Config file not found, using defaults");
        SeederConfig::default()
    };

    // Override config with CLI args
    let config = config
        .with_dns_port(args.dns_port)
        .with_api_port(args.api_port)
        .with_threads(args.threads)
        .with_seeds(args.seeds);

    config.validate()?;

    info!("⚙️  Configuration:");
    info!("   DNS: {} on port {}", config.dns_domain, config.dns_port);
    info!("   API port: {}", config.api_port);
    info!("   Crawler: {} workers, batch {}", config.threads, config.batch_size);
    info!("   Required version: {}, height: {}", config.required_version, config.required_height);

    let shared_config = Arc::new(config);

    // Open address database
    let paths = DumpPaths::new(&args.data_dir, &shared_config);
    let params = shared_config.chain_params();
    let db = match storage::load_database(&paths.database, params.clone()).await? {
        Some(db) => db,
        None => {
            info!("📦 No database at {:?}, starting empty", paths.database);
            AddrDb::new(params)
        }
    };
    let db = Arc::new(db);

    // Initialize metrics
    let metrics = Arc::new(Metrics::new());

    let prober: Arc<dyn Prober> = Arc::new(TcpProber::new(
        Duration::from_secs(shared_config.probe_timeout_secs),
        shared_config.tcp_probe_marks_verified,
    ));

    // Start all services concurrently
    let seed_handle = tokio::spawn(crawler::run_seed_resolver(
        shared_config.clone(),
        db.clone(),
        metrics.clone(),
    ));

    let crawler_handle = tokio::spawn(crawler::run_crawler(
        shared_config.clone(),
        db.clone(),
        prober,
        metrics.clone(),
    ));

    let dns_handle = tokio::spawn(dns::run_dns_server(
        shared_config.clone(),
        db.clone(),
        metrics.clone(),
    ));

    let api_handle = tokio::spawn(api::run_api_server(
        shared_config.clone(),
        db.clone(),
        metrics.clone(),
    ));

    let dumper_handle = tokio::spawn(storage::run_dumper(
        shared_config.clone(),
        db.clone(),
        paths.clone(),
        metrics.clone(),
    ));

    info!("✅ All services started");
    info!("   Press Ctrl+C to shutdown gracefully");

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Shutdown signal received");
        }
        result = seed_handle => {
            error!("Seed resolver exited: {:?}", result);
        }
        result = crawler_handle => {
            error!("Crawler exited: {:?}", result);
        }
        result = dns_handle => {
            error!("DNS server exited: {:?}", result);
        }
        result = api_handle => {
            error!("HTTP API exited: {:?}", result);
        }
        result = dumper_handle => {
            error!("Dumper exited: {:?}", result);
        }
    }

    // Graceful shutdown: final dump
    storage::dump_all(&db, &paths).await?;
    info!("📦 Address database written to {:?}", paths.database);

    info!("👋 Address seeder shutting down");
    Ok(())
}
