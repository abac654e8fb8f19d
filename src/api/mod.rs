//! HTTP API Module
//!
//! Provides health, database statistics, per-address reports and metrics
//! endpoints for the seeder.

mod metrics;
mod routes;

pub use metrics::Metrics;
pub use routes::{router, run_api_server, ApiState};
