//! Liveness, readiness, and metrics exposition.

use crate::state::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse};

/// Liveness: never touches external dependencies.
pub async fn health() -> impl IntoResponse {
    "ok"
}

/// Readiness: verifies the credential store round-trip when one is wired.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    match &state.pool {
        Some(pool) => match sqlx::query("SELECT 1").execute(pool).await {
            Ok(_) => (StatusCode::OK, "ok").into_response(),
            Err(e) => {
                tracing::warn!(error = %e, "readiness check failed");
                (StatusCode::SERVICE_UNAVAILABLE, "database unavailable").into_response()
            }
        },
        None => (StatusCode::OK, "ok").into_response(),
    }
}

/// Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        state.metrics.render(),
    )
}
