//! API Routes
//!
//! HTTP endpoints for health checks, database statistics, address reports
//! and metrics

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::Metrics;
use crate::config::SeederConfig;
use crate::db::AddrDb;
use crate::types::Endpoint;

/// Default number of reports returned by /report
const DEFAULT_REPORT_LIMIT: usize = 100;

/// Shared API state
pub struct ApiState {
    pub config: Arc<SeederConfig>,
    pub db: Arc<AddrDb>,
    pub metrics: Arc<Metrics>,
}

/// Build the API router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health_check))
        .route("/stats", get(get_stats))

        // Address reports
        .route("/report", get(get_reports))
        .route("/report/:endpoint", get(get_report))

        // Metrics
        .route("/metrics", get(get_metrics_prometheus))
        .route("/metrics/json", get(get_metrics_json))

        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_api_server(
    config: Arc<SeederConfig>,
    db: Arc<AddrDb>,
    metrics: Arc<Metrics>,
) -> anyhow::Result<()> {
    let state = Arc::new(ApiState {
        config: config.clone(),
        db,
        metrics,
    });

    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    info!("📊 HTTP API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// GET /health - Simple health check
async fn health_check() -> impl IntoResponse {
    "OK"
}

/// GET /stats - Database counts
async fn get_stats(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let stats = state.db.stats();

    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.metrics.uptime_secs(),
        "dns_domain": state.config.dns_domain,
        "database": stats,
    }))
}

#[derive(Debug, Deserialize)]
struct ReportQuery {
    limit: Option<usize>,
}

/// GET /report - Reports of addresses with at least one success
async fn get_reports(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ReportQuery>,
) -> impl IntoResponse {
    let reports = state.db.get_all();
    let total = reports.len();
    let limit = query.limit.unwrap_or(DEFAULT_REPORT_LIMIT);

    let reports: Vec<_> = reports.into_iter().take(limit).collect();

    Json(serde_json::json!({
        "count": total,
        "reports": reports,
    }))
}

/// GET /report/:endpoint - Report of one address
async fn get_report(
    State(state): State<Arc<ApiState>>,
    Path(endpoint): Path<String>,
) -> impl IntoResponse {
    let endpoint = match endpoint.parse::<SocketAddr>() {
        Ok(addr) => Endpoint::from(addr),
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "expected ip:port" })),
            );
        }
    };

    match state.db.report(&endpoint) {
        Some(report) => (StatusCode::OK, Json(serde_json::json!(report))),
        None => {
            let body = match state.db.banned_until(&endpoint) {
                Some(until) => serde_json::json!({ "error": "banned", "banned_until": until }),
                None => serde_json::json!({ "error": "unknown address" }),
            };
            (StatusCode::NOT_FOUND, Json(body))
        }
    }
}

/// GET /metrics - Prometheus format metrics
async fn get_metrics_prometheus(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let stats = state.db.stats();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.to_prometheus(&stats),
    )
}

/// GET /metrics/json - JSON format metrics
async fn get_metrics_json(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let stats = state.db.stats();
    Json(state.metrics.to_json(&stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::db::{ChainParams, Clock};
    use crate::types::{AddrObservation, ServiceFlags};

    const NOW: i64 = 1_700_000_000;

    fn test_state() -> Arc<ApiState> {
        let db = AddrDb::with_clock(ChainParams::default(), Clock::manual(NOW));
        let endpoint: Endpoint = "1.2.3.4:8333".parse::<SocketAddr>().unwrap().into();
        db.add(&AddrObservation::new(endpoint, ServiceFlags::NETWORK, NOW), false);

        let mut batch = db.get_many(1);
        batch[0].good = true;
        batch[0].client_version = 70015;
        batch[0].height = 800_000;
        batch[0].checkpoint_verified = true;
        db.result_many(&batch).unwrap();

        Arc::new(ApiState {
            config: Arc::new(SeederConfig::default()),
            db: Arc::new(db),
            metrics: Arc::new(Metrics::new()),
        })
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_stats() {
        let (status, json) = get_json(router(test_state()), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["database"]["good"], 1);
        assert_eq!(json["database"]["tracked"], 1);
    }

    #[tokio::test]
    async fn test_reports() {
        let (status, json) = get_json(router(test_state()), "/report?limit=10").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["count"], 1);
        assert_eq!(json["reports"][0]["endpoint"], "1.2.3.4:8333");
        assert_eq!(json["reports"][0]["reliableness"], "OK");
    }

    #[tokio::test]
    async fn test_single_report() {
        let state = test_state();

        let (status, json) = get_json(router(state.clone()), "/report/1.2.3.4:8333").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["client_version"], 70015);

        let (status, _) = get_json(router(state.clone()), "/report/5.6.7.8:8333").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_json(router(state), "/report/nonsense").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_endpoints() {
        let state = test_state();
        state.metrics.add_probes(1, 0, 0);

        let (status, json) = get_json(router(state.clone()), "/metrics/json").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["probes"]["good"], 1);
        assert_eq!(json["database"]["good"], 1);

        let response = router(state)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("addr_seeder_addresses{state=\"good\"} 1"));
    }
}
