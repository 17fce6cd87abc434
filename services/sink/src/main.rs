use async_nats::jetstream;
use sink::compaction::Compactor;
use sink::config::{self, StorageBackend};
use sink::consumer::{JetStreamSource, Sink};
use sink::dlq::DlqRouter;
use sink::metrics::SinkMetrics;
use sink::store::{BlobStore, MemoryStore, S3Store};
use std::env;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config_path =
        env::var("SINK_CONFIG").unwrap_or_else(|_| "/etc/causality/sink.toml".to_owned());
    let mut cfg = config::load_config_from_path(Path::new(&config_path))
        .unwrap_or_else(|e| panic!("loading config '{}': {}", config_path, e));
    if let Ok(url) = env::var("NATS_URL") {
        cfg.stream.url = url;
    }

    info!(url = %cfg.stream.url, "connecting to stream broker...");
    let client = async_nats::connect(&cfg.stream.url)
        .await
        .expect("failed to connect to NATS");
    let js = jetstream::new(client.clone());

    // Main stream: file storage, explicit-ack pull consumer with a bounded
    // delivery budget so poison-adjacent messages eventually advise out.
    let stream = js
        .get_or_create_stream(jetstream::stream::Config {
            name: cfg.stream.stream_name.clone(),
            subjects: vec!["events.>".to_owned()],
            storage: jetstream::stream::StorageType::File,
            max_age: cfg.stream.max_age,
            ..Default::default()
        })
        .await
        .expect("failed to ensure main stream");

    js.get_or_create_stream(jetstream::stream::Config {
        name: cfg.stream.dlq_stream_name.clone(),
        subjects: vec!["dlq.>".to_owned()],
        storage: jetstream::stream::StorageType::File,
        max_age: cfg.stream.dlq_max_age,
        ..Default::default()
    })
    .await
    .expect("failed to ensure dlq stream");

    let consumer = stream
        .get_or_create_consumer(
            &cfg.stream.consumer_name,
            jetstream::consumer::pull::Config {
                durable_name: Some(cfg.stream.consumer_name.clone()),
                ack_policy: jetstream::consumer::AckPolicy::Explicit,
                max_deliver: cfg.stream.max_deliver,
                ..Default::default()
            },
        )
        .await
        .expect("failed to ensure pull consumer");

    let store: Arc<dyn BlobStore> = match cfg.storage.backend {
        StorageBackend::S3 => {
            let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            Arc::new(S3Store::new(
                aws_sdk_s3::Client::new(&sdk_config),
                cfg.storage.bucket.clone(),
            ))
        }
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
    };

    let metrics = Arc::new(SinkMetrics::new());
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    let sink = Arc::new(Sink::new(
        Arc::new(JetStreamSource::new(consumer)),
        Arc::clone(&store),
        Arc::clone(&metrics),
        cfg.sink.clone(),
        cfg.storage.prefix.clone(),
    ));
    let sink_task = tokio::spawn(Arc::clone(&sink).run(stop_rx.clone()));

    let dlq_router = DlqRouter::new(
        client,
        js,
        cfg.stream.stream_name.clone(),
        cfg.stream.consumer_name.clone(),
        cfg.stream.dlq_stream_name.clone(),
        Arc::clone(&metrics),
    );
    let dlq_task = tokio::spawn(dlq_router.run(stop_rx.clone()));

    let compaction_task = if cfg.compaction.enabled {
        let compactor = Compactor::new(
            Arc::clone(&store),
            Arc::clone(&metrics),
            cfg.compaction.clone(),
            cfg.storage.prefix.clone(),
        );
        Some(tokio::spawn(compactor.run(stop_rx.clone())))
    } else {
        None
    };

    let listener = tokio::net::TcpListener::bind(&cfg.addr)
        .await
        .expect("failed to bind");
    info!(addr = %cfg.addr, "sink status endpoint listening");
    let status = axum::serve(listener, sink::build_status_router(metrics));

    tokio::select! {
        _ = shutdown_signal() => {}
        result = status => {
            result.expect("status server error");
        }
    }

    info!("stopping sink...");
    let _ = stop_tx.send(true);
    let _ = sink_task.await;
    let _ = dlq_task.await;
    if let Some(task) = compaction_task {
        let _ = task.await;
    }
    info!("sink shut down gracefully");
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
