//! Per-application token-bucket rate limiting.
//!
//! Limiters are created lazily on a tenant's first request and reaped by a
//! periodic sweep once idle for the configured interval, so the registry
//! stays bounded by the set of recently active tenants rather than every
//! tenant ever seen.
//!
//! The auth layer runs before this one, so the limiter always keys on the
//! authenticated `app_id`, never on anything client-controlled.

use crate::auth::Tenant;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use causality_protocol::{error_codes, HttpErrorEnvelope};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

type AppLimiter = DefaultDirectRateLimiter;

struct Entry {
    limiter: Arc<AppLimiter>,
    last_seen: std::sync::Mutex<Instant>,
}

pub struct RateLimiterRegistry {
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    rps: NonZeroU32,
    burst: NonZeroU32,
    idle: Duration,
}

impl RateLimiterRegistry {
    pub fn new(rps: u32, burst: u32, idle: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            rps: NonZeroU32::new(rps.max(1)).expect("non-zero rps"),
            burst: NonZeroU32::new(burst.max(1)).expect("non-zero burst"),
            idle,
        }
    }

    /// Check (and consume) one token for `app_id`.  Returns false when the
    /// bucket is empty.
    pub async fn check(&self, app_id: &str) -> bool {
        let entry = self.get_or_create(app_id).await;
        *entry
            .last_seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Instant::now();
        entry.limiter.check().is_ok()
    }

    async fn get_or_create(&self, app_id: &str) -> Arc<Entry> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(app_id) {
                return Arc::clone(entry);
            }
        }
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(app_id) {
            return Arc::clone(entry);
        }
        let quota = Quota::per_second(self.rps).allow_burst(self.burst);
        let entry = Arc::new(Entry {
            limiter: Arc::new(RateLimiter::direct(quota)),
            last_seen: std::sync::Mutex::new(Instant::now()),
        });
        entries.insert(app_id.to_owned(), Arc::clone(&entry));
        entry
    }

    /// Drop limiters idle for longer than the configured interval.
    /// Returns the number reaped.
    pub async fn sweep(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| {
            entry
                .last_seen
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .elapsed()
                < self.idle
        });
        let reaped = before - entries.len();
        if reaped > 0 {
            debug!(reaped, "reaped idle rate limiters");
        }
        reaped
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Periodic sweep loop; exits when the stop channel flips.
    pub async fn run_sweeper(
        self: Arc<Self>,
        every: Duration,
        mut stop_rx: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }
}

/// Reject requests once the tenant's bucket is empty: 429 with `Retry-After`.
pub async fn per_key_rate_limit(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(tenant) = req.extensions().get::<Tenant>().cloned() else {
        // Auth must run before the limiter; a missing tenant means the
        // middleware stack is miswired, not that the client misbehaved.
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(HttpErrorEnvelope {
                code: error_codes::INTERNAL_ERROR.to_owned(),
                message: "rate limiter ran without tenant identity".to_owned(),
                details: None,
            }),
        )
            .into_response();
    };

    if !state.limiters.check(&tenant.app_id).await {
        state.metrics.rate_limited.inc();
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(HttpErrorEnvelope {
                code: error_codes::RATE_LIMITED.to_owned(),
                message: "rate limit exceeded".to_owned(),
                details: None,
            }),
        )
            .into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        return response;
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_then_reject() {
        let registry = RateLimiterRegistry::new(1, 3, Duration::from_secs(600));
        assert!(registry.check("app-1").await);
        assert!(registry.check("app-1").await);
        assert!(registry.check("app-1").await);
        // Burst of 3 exhausted; steady rate is 1/s so the 4th call fails.
        assert!(!registry.check("app-1").await);
    }

    #[tokio::test]
    async fn tenants_have_independent_buckets() {
        let registry = RateLimiterRegistry::new(1, 1, Duration::from_secs(600));
        assert!(registry.check("app-1").await);
        assert!(!registry.check("app-1").await);
        assert!(registry.check("app-2").await);
    }

    #[tokio::test]
    async fn sweep_reaps_only_idle_entries() {
        let registry = RateLimiterRegistry::new(10, 10, Duration::from_millis(50));
        registry.check("app-1").await;
        assert_eq!(registry.len().await, 1);

        // Nothing is idle yet.
        assert_eq!(registry.sweep().await, 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        registry.check("app-2").await;
        assert_eq!(registry.sweep().await, 1);
        assert_eq!(registry.len().await, 1);
    }
}
