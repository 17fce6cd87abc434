//! Request-scoped middleware: request ids, HTTP metrics, and content-type
//! enforcement.  Auth and rate limiting live in their own modules.

use crate::state::AppState;
use axum::{
    extract::{MatchedPath, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use causality_protocol::{error_codes, HttpErrorEnvelope};
use std::time::Instant;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request id carried through extensions for log correlation.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Assign a request id (honoring one supplied by a trusted proxy) and echo
/// it on the response.
pub async fn assign_request_id(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Record request count and latency per matched route.
pub async fn record_http_metrics(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().to_string();
    // The matched route template keeps cardinality bounded; fall back to
    // the raw path for unrouted requests (404s).
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| req.uri().path().to_owned(), |m| m.as_str().to_owned());

    let start = Instant::now();
    let response = next.run(req).await;

    state
        .metrics
        .http_requests
        .with_label_values(&[&method, &path, response.status().as_str()])
        .inc();
    state
        .metrics
        .http_duration
        .with_label_values(&[&method, &path])
        .observe(start.elapsed().as_secs_f64());

    response
}

/// Ingest endpoints accept JSON only.
pub async fn enforce_json_content_type(req: Request, next: Next) -> Response {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("application/json") {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Json(HttpErrorEnvelope {
                code: error_codes::BAD_REQUEST.to_owned(),
                message: "Content-Type must be application/json".to_owned(),
                details: None,
            }),
        )
            .into_response();
    }
    next.run(req).await
}
