//! Metrics HTTP server
//!
//! Exposes Prometheus metrics and a scheduler health summary over HTTP.
//!
//! ## Usage
//!
//! ```no_run
//! use hybrid_scheduler::{metrics_server, HybridScheduler, SchedulerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let scheduler = HybridScheduler::from_config(SchedulerConfig::default())?;
//!     let handle = tokio::spawn(metrics_server::start_server("0.0.0.0:9090", scheduler));
//!
//!     // Your application code...
//!
//!     handle.abort();
//!     Ok(())
//! }
//! ```
//!
//! ## Endpoints
//!
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /health` - Scheduler snapshot plus counter totals, as JSON

#[cfg(feature = "metrics-server")]
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;
#[cfg(feature = "metrics-server")]
use tower_http::trace::TraceLayer;
#[cfg(feature = "metrics-server")]
use tracing::info;

use crate::HybridScheduler;

#[cfg(feature = "metrics-server")]
/// Start the metrics HTTP server.
///
/// Runs until the listener fails or the returned future is dropped.
///
/// # Errors
///
/// Returns an error if `addr` does not parse or cannot be bound.
pub async fn start_server(
    addr: &str,
    scheduler: HybridScheduler,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = addr.parse()?;

    let app = router(scheduler);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(%addr, "metrics server listening");

    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(feature = "metrics-server")]
fn router(scheduler: HybridScheduler) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(scheduler)
}

#[cfg(feature = "metrics-server")]
async fn metrics_handler() -> Response {
    let metrics = crate::metrics::gather_metrics();

    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        metrics,
    )
        .into_response()
}

#[cfg(feature = "metrics-server")]
async fn health_handler(State(scheduler): State<HybridScheduler>) -> Response {
    let snapshot = scheduler.metrics_snapshot();
    let summary = crate::metrics::get_metrics_summary();

    let status = if snapshot.shedding { "shedding" } else { "healthy" };
    let body = serde_json::json!({
        "status": status,
        "scheduler": snapshot,
        "admitted_total": summary.admitted_total.values().sum::<u64>(),
        "rejected_total": summary.rejected_total.values().sum::<u64>(),
        "preemptions_total": summary.preemptions_total.values().sum::<u64>(),
    });

    (
        StatusCode::OK,
        [("Content-Type", "application/json")],
        serde_json::to_string_pretty(&body)
            .unwrap_or_else(|_| r#"{"error":"serialization failed"}"#.to_string()),
    )
        .into_response()
}

#[cfg(not(feature = "metrics-server"))]
/// Metrics server is not available without the `metrics-server` feature.
///
/// # Errors
///
/// Always returns an error naming the missing feature.
pub async fn start_server(
    _addr: &str,
    _scheduler: HybridScheduler,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    Err("metrics server requires the 'metrics-server' feature".into())
}
