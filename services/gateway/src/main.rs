use gateway::auth::PgApiKeyStore;
use gateway::config;
use gateway::dedup::DedupEngine;
use gateway::metrics::Metrics;
use gateway::publisher::JetStreamPublisher;
use gateway::ratelimit::RateLimiterRegistry;
use gateway::state::{AppState, RuntimeSettings};
use sqlx::postgres::PgPoolOptions;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config_path =
        env::var("GATEWAY_CONFIG").unwrap_or_else(|_| "/etc/causality/gateway.toml".to_owned());
    let mut cfg = config::load_config_from_path(Path::new(&config_path))
        .unwrap_or_else(|e| panic!("loading config '{}': {}", config_path, e));
    if let Ok(url) = env::var("NATS_URL") {
        cfg.stream.url = url;
    }

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    info!("connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to Postgres");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("failed to run database migrations");
    info!("migrations applied");

    info!(url = %cfg.stream.url, "connecting to stream broker...");
    let nats = async_nats::connect(&cfg.stream.url)
        .await
        .expect("failed to connect to NATS");
    let jetstream = async_nats::jetstream::new(nats);

    let dedup = Arc::new(DedupEngine::new(&cfg.dedup));
    dedup.start().await;

    let limiters = Arc::new(RateLimiterRegistry::new(
        cfg.per_key_rps,
        cfg.per_key_burst,
        cfg.limiter_idle,
    ));
    let (sweep_stop_tx, sweep_stop_rx) = tokio::sync::watch::channel(false);
    let sweeper = tokio::spawn(
        Arc::clone(&limiters).run_sweeper(Duration::from_secs(60), sweep_stop_rx),
    );

    let state = AppState::new(
        Arc::new(PgApiKeyStore::new(pool.clone())),
        Arc::new(JetStreamPublisher::new(jetstream)),
        Arc::clone(&dedup),
        limiters,
        Arc::new(Metrics::new()),
        RuntimeSettings {
            max_batch_events: cfg.max_batch_events,
            subject_prefix: cfg.stream.subject_prefix.clone(),
            enforce_app_id_match: cfg.enforce_app_id_match,
        },
    )
    .with_pool(pool);

    let router = gateway::build_router(state, &cfg);
    let listener = tokio::net::TcpListener::bind(&cfg.addr)
        .await
        .expect("failed to bind");
    info!(addr = %cfg.addr, "gateway listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    let _ = sweep_stop_tx.send(true);
    let _ = sweeper.await;
    dedup.stop().await;
    info!("gateway shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
