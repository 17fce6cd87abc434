use crate::auth::ApiKeyStore;
use crate::dedup::DedupEngine;
use crate::metrics::Metrics;
use crate::publisher::EventPublisher;
use crate::ratelimit::RateLimiterRegistry;
use sqlx::PgPool;
use std::sync::Arc;

/// Request-scoped settings snapshotted from config at startup.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub max_batch_events: usize,
    pub subject_prefix: String,
    pub enforce_app_id_match: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub keys: Arc<dyn ApiKeyStore>,
    pub publisher: Arc<dyn EventPublisher>,
    pub dedup: Arc<DedupEngine>,
    pub limiters: Arc<RateLimiterRegistry>,
    pub metrics: Arc<Metrics>,
    pub settings: Arc<RuntimeSettings>,
    /// Present in production for the readiness probe; tests run without it.
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn new(
        keys: Arc<dyn ApiKeyStore>,
        publisher: Arc<dyn EventPublisher>,
        dedup: Arc<DedupEngine>,
        limiters: Arc<RateLimiterRegistry>,
        metrics: Arc<Metrics>,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            keys,
            publisher,
            dedup,
            limiters,
            metrics,
            settings: Arc::new(settings),
            pool: None,
        }
    }

    pub fn with_pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }
}
