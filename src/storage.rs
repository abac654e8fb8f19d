//! Database Persistence
//!
//! Writes the binary database (temp file, then rename), the human-readable
//! address report and the append-only stats log. A periodic dumper task
//! refreshes all three.

use anyhow::Context;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::api::Metrics;
use crate::config::SeederConfig;
use crate::db::{AddrDb, AddrReport, ChainParams, Clock, Reliableness};

/// Paths of the files the seeder maintains
#[derive(Debug, Clone)]
pub struct DumpPaths {
    pub database: PathBuf,
    pub report: PathBuf,
    pub stats: PathBuf,
}

impl DumpPaths {
    pub fn new(data_dir: &Path, config: &SeederConfig) -> Self {
        Self {
            database: data_dir.join(&config.db_file),
            report: data_dir.join(&config.dump_file),
            stats: data_dir.join(&config.stats_file),
        }
    }
}

/// Write the database to `path` atomically
pub async fn save_database(db: &AddrDb, path: &Path) -> anyhow::Result<()> {
    let bytes = db.to_bytes()?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".new");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &bytes)
        .await
        .with_context(|| format!("writing {:?}", tmp))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {:?} to {:?}", tmp, path))?;

    debug!("Database saved to {:?} ({} bytes)", path, bytes.len());
    Ok(())
}

/// Load the database at `path`, or `None` if there is no file yet
pub async fn load_database(path: &Path, params: ChainParams) -> anyhow::Result<Option<AddrDb>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {:?}", path)),
    };

    let db = AddrDb::from_bytes(&bytes, params, Clock::System)
        .with_context(|| format!("loading {:?}", path))?;
    Ok(Some(db))
}

/// Render the address report, one line per address with a success
pub fn format_report(reports: &[AddrReport]) -> String {
    let mut out = String::new();
    out.push_str(
        "# address                                        good  lastSuccess    %(2h)   %(8h)   %(1d)   %(7d)  %(30d)  blocks      svcs  version\n",
    );
    for report in reports {
        let _ = writeln!(
            out,
            "{:<47}  {:>4}  {:>11}  {:>6.2}% {:>6.2}% {:>6.2}% {:>6.2}% {:>7.2}%  {:>6}  {}  {:>5} {:?}",
            report.endpoint.to_string(),
            u8::from(report.reliableness == Reliableness::Ok),
            report.last_success,
            100.0 * report.uptime[0],
            100.0 * report.uptime[1],
            100.0 * report.uptime[2],
            100.0 * report.uptime[3],
            100.0 * report.uptime[4],
            report.blocks,
            report.services,
            report.client_version,
            report.client_sub_version,
        );
    }
    out
}

/// Summed uptime of all reports per horizon, prefixed with the time
pub fn format_stats_line(reports: &[AddrReport], now: chrono::DateTime<chrono::Utc>) -> String {
    let mut sums = [0f64; 5];
    for report in reports {
        for (sum, uptime) in sums.iter_mut().zip(report.uptime.iter()) {
            *sum += uptime;
        }
    }
    format!(
        "{} {} {:.4} {:.4} {:.4} {:.4} {:.4}\n",
        now.timestamp(),
        now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        sums[0],
        sums[1],
        sums[2],
        sums[3],
        sums[4]
    )
}

/// Write the binary database, the report and one stats line
pub async fn dump_all(db: &AddrDb, paths: &DumpPaths) -> anyhow::Result<()> {
    save_database(db, &paths.database).await?;

    let reports = db.get_all();
    tokio::fs::write(&paths.report, format_report(&reports))
        .await
        .with_context(|| format!("writing {:?}", paths.report))?;

    let line = format_stats_line(&reports, chrono::Utc::now());
    let mut stats = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.stats)
        .await
        .with_context(|| format!("opening {:?}", paths.stats))?;
    stats.write_all(line.as_bytes()).await?;

    Ok(())
}

/// Periodically dump the database and expire old bans
pub async fn run_dumper(
    config: Arc<SeederConfig>,
    db: Arc<AddrDb>,
    paths: DumpPaths,
    metrics: Arc<Metrics>,
) -> anyhow::Result<()> {
    let period = Duration::from_secs(config.dump_interval_secs);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        interval.tick().await;

        let expired = db.expire_bans();
        if expired > 0 {
            debug!("🧹 Expired {} bans", expired);
        }

        match dump_all(&db, &paths).await {
            Ok(()) => metrics.inc_db_dumps(),
            Err(e) => {
                metrics.inc_db_dump_failures();
                warn!("Database dump failed: {:#}", e);
            }
        }

        let stats = db.stats();
        info!(
            "📊 Status: {}/{} available ({} tried, {} new, {} good, {} banned), queue age {}s",
            stats.available - stats.new,
            stats.available,
            stats.tracked,
            stats.new,
            stats.good,
            stats.banned,
            stats.age
        );
    }
}
