pub mod columnar;
pub mod compaction;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod metrics;
pub mod store;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics::SinkMetrics;
use std::sync::Arc;

/// Minimal operational surface: metrics exposition plus liveness and
/// readiness probes.  Liveness never touches external dependencies.
pub fn build_status_router(metrics: Arc<SinkMetrics>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .route("/metrics", get(render_metrics))
        .with_state(metrics)
}

async fn render_metrics(State(metrics): State<Arc<SinkMetrics>>) -> impl IntoResponse {
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        metrics.render(),
    )
}
