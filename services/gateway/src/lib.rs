pub mod auth;
pub mod config;
pub mod dedup;
pub mod http;
pub mod metrics;
pub mod middleware;
pub mod publisher;
pub mod ratelimit;
pub mod state;

pub use state::AppState;

use axum::http::{HeaderValue, Method};
use axum::routing::{delete, get, post};
use axum::Router;
use config::GatewayConfig;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Build the gateway router.
///
/// Layer order, outermost first: request-id, access log, panic recovery,
/// HTTP metrics, CORS, body cap, timeout — then, on the ingest routes only:
/// auth, per-key rate limit, content-type enforcement.  Auth precedes the
/// limiter so buckets key on the authenticated tenant.
pub fn build_router(state: AppState, cfg: &GatewayConfig) -> Router {
    let ingest = Router::new()
        .route("/v1/events/ingest", post(http::ingest::ingest_event))
        .route("/v1/events/batch", post(http::ingest::ingest_batch))
        .layer(axum::middleware::from_fn(
            middleware::enforce_json_content_type,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            ratelimit::per_key_rate_limit,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    let open = Router::new()
        .route("/health", get(http::status::health))
        .route("/ready", get(http::status::ready))
        .route("/metrics", get(http::status::metrics))
        .route(
            "/api/admin/keys",
            post(http::admin::create_key).get(http::admin::list_keys),
        )
        .route("/api/admin/keys/:key_id", delete(http::admin::revoke_key));

    ingest
        .merge(open)
        .layer(TimeoutLayer::new(cfg.write_timeout))
        .layer(RequestBodyLimitLayer::new(cfg.max_body_bytes))
        .layer(build_cors(cfg))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::record_http_metrics,
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(middleware::assign_request_id))
        .with_state(state)
}

fn build_cors(cfg: &GatewayConfig) -> CorsLayer {
    let allow_any = cfg
        .cors
        .allowed_origins
        .iter()
        .any(|origin| origin == "*");
    if allow_any {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = cfg
        .cors
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
}
