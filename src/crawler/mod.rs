//! Crawler
//!
//! Worker tasks pull candidate batches from the database, probe them
//! concurrently and report every outcome back exactly once. Seeds are
//! resolved at startup and periodically, and forced into the database.

mod prober;

pub use prober::{NodeInfo, ProbeOutcome, ProbeReport, Prober, TcpProber};

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::api::Metrics;
use crate::config::SeederConfig;
use crate::db::AddrDb;
use crate::types::{current_timestamp, AddrObservation, Endpoint, ServiceFlags};

/// Interval between seed re-resolutions (seconds)
const SEED_REFRESH_SECS: u64 = 1800;

/// Counts of one crawl round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundStats {
    pub good: usize,
    pub bad: usize,
    pub skipped: usize,
    pub learned: usize,
}

impl RoundStats {
    pub fn pulled(&self) -> usize {
        self.good + self.bad + self.skipped
    }
}

/// Pull one batch, probe it and report the outcomes
pub async fn crawl_round(db: &AddrDb, prober: &Arc<dyn Prober>, batch_size: usize) -> RoundStats {
    let batch = db.get_many(batch_size);
    if batch.is_empty() {
        return RoundStats::default();
    }

    let mut probes = JoinSet::new();
    for candidate in batch {
        let prober = prober.clone();
        probes.spawn(async move {
            let report = prober.probe(&candidate).await;
            (candidate, report)
        });
    }

    let mut probed = Vec::new();
    let mut skipped = Vec::new();
    let mut learned = Vec::new();
    let mut stats = RoundStats::default();

    while let Some(joined) = probes.join_next().await {
        let (mut candidate, report) = match joined {
            Ok(done) => done,
            Err(e) => {
                // The candidate is lost with the task; it stays checked out
                error!("Probe task failed: {}", e);
                continue;
            }
        };

        learned.extend(report.learned);
        if report.outcome.apply(&mut candidate) {
            if candidate.good {
                stats.good += 1;
            } else {
                stats.bad += 1;
            }
            probed.push(candidate);
        } else {
            stats.skipped += 1;
            skipped.push(candidate);
        }
    }

    stats.learned = learned.len();
    if !learned.is_empty() {
        db.add_many(&learned, false);
    }
    if let Err(e) = db.result_many(&probed) {
        warn!("Reporting probe results: {}", e);
    }
    if let Err(e) = db.skipped_many(&skipped) {
        warn!("Releasing skipped candidates: {}", e);
    }

    stats
}

/// Run `config.threads` crawl workers until one of them fails
pub async fn run_crawler(
    config: Arc<SeederConfig>,
    db: Arc<AddrDb>,
    prober: Arc<dyn Prober>,
    metrics: Arc<Metrics>,
) -> anyhow::Result<()> {
    info!("🕷️  Crawler starting {} workers", config.threads);

    let mut workers = JoinSet::new();
    for worker in 0..config.threads {
        workers.spawn(crawl_worker(
            worker,
            config.clone(),
            db.clone(),
            prober.clone(),
            metrics.clone(),
        ));
    }

    while let Some(joined) = workers.join_next().await {
        joined?;
    }
    Ok(())
}

async fn crawl_worker(
    worker: usize,
    config: Arc<SeederConfig>,
    db: Arc<AddrDb>,
    prober: Arc<dyn Prober>,
    metrics: Arc<Metrics>,
) {
    let idle = Duration::from_secs(config.idle_wait_secs);
    loop {
        let stats = crawl_round(&db, &prober, config.batch_size).await;
        metrics.add_probes(stats.good as u64, stats.bad as u64, stats.skipped as u64);

        if stats.pulled() == 0 {
            tokio::time::sleep(idle).await;
        } else {
            debug!(
                "Worker {}: {} good, {} bad, {} skipped, {} learned",
                worker, stats.good, stats.bad, stats.skipped, stats.learned
            );
            if stats.skipped == stats.pulled() {
                // Nothing could be attempted; back off instead of spinning
                tokio::time::sleep(idle).await;
            }
        }
    }
}

/// Turn `host`, `host:port` or `[v6]:port` into a lookup target
fn seed_target(seed: &str, default_port: u16) -> String {
    if seed.parse::<std::net::SocketAddr>().is_ok() {
        return seed.to_string();
    }
    if seed.parse::<std::net::IpAddr>().is_ok_and(|ip| ip.is_ipv6()) {
        return format!("[{}]:{}", seed, default_port);
    }
    match seed.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => seed.to_string(),
        _ => format!("{}:{}", seed, default_port),
    }
}

/// Resolve every seed and force the results into the database
///
/// Returns the number of addresses added.
pub async fn resolve_seeds(config: &SeederConfig, db: &AddrDb) -> usize {
    let now = current_timestamp();
    let mut observations = Vec::new();

    for seed in &config.seeds {
        let target = seed_target(seed, config.default_port);
        let resolved = tokio::net::lookup_host(target.as_str()).await;
        match resolved {
            Ok(addrs) => {
                let before = observations.len();
                observations.extend(
                    addrs.map(|addr| AddrObservation::new(Endpoint::from(addr), ServiceFlags::NETWORK, now)),
                );
                debug!("Seed {} resolved to {} addresses", seed, observations.len() - before);
            }
            Err(e) => warn!("Resolving seed {}: {}", seed, e),
        }
    }

    db.add_many(&observations, true);
    observations.len()
}

/// Resolve seeds now and every `SEED_REFRESH_SECS`
pub async fn run_seed_resolver(
    config: Arc<SeederConfig>,
    db: Arc<AddrDb>,
    metrics: Arc<Metrics>,
) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(Duration::from_secs(SEED_REFRESH_SECS));
    loop {
        interval.tick().await;
        let added = resolve_seeds(&config, &db).await;
        metrics.add_seed_addresses(added as u64);
        info!("🌱 Seeds resolved to {} addresses", added);
    }
}
