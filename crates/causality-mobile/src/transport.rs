//! HTTP batch transport with status-aware retry.
//!
//! POSTs `{"events": [...]}` to `<endpoint>/v1/events/batch` with the
//! configured API key.  5xx, 429, and transport-level failures retry under
//! the backoff policy; other 4xx are terminal and surface immediately.  A
//! `Retry-After` header (seconds or HTTP-date) raises the wait to
//! `max(header, strategy)` — the server can slow a client down but never
//! speed it up past its own backoff.

use crate::backoff::BackoffPolicy;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

pub const BATCH_PATH: &str = "/v1/events/batch";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server error: HTTP {status}")]
    Server {
        status: u16,
        retry_after: Option<Duration>,
    },
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("client error: HTTP {status}")]
    Client { status: u16 },
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl TransportError {
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Network(_)
                | TransportError::Server { .. }
                | TransportError::RateLimited { .. }
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::Server { retry_after, .. }
            | TransportError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Delivery seam between the batcher and the network.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a batch of already-serialized event JSON documents.
    async fn send_batch(&self, events: &[String]) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpTransport {
    client: reqwest::Client,
    batch_url: String,
    api_key: String,
    policy: BackoffPolicy,
}

impl HttpTransport {
    pub fn new(
        endpoint: &str,
        api_key: &str,
        policy: BackoffPolicy,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("causality-mobile/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self {
            client,
            batch_url: format!("{}{}", endpoint.trim_end_matches('/'), BATCH_PATH),
            api_key: api_key.to_owned(),
            policy,
        })
    }

    async fn post_once(&self, body: &serde_json::Value) -> Result<(), TransportError> {
        let response = self
            .client
            .post(&self.batch_url)
            .header("X-API-Key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);

        if status.as_u16() == 429 {
            return Err(TransportError::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(TransportError::Server {
                status: status.as_u16(),
                retry_after,
            });
        }
        Err(TransportError::Client {
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_batch(&self, events: &[String]) -> Result<(), TransportError> {
        let mut parsed = Vec::with_capacity(events.len());
        for event in events {
            parsed.push(
                serde_json::from_str::<serde_json::Value>(event)
                    .map_err(|e| TransportError::InvalidPayload(e.to_string()))?,
            );
        }
        let body = serde_json::json!({ "events": parsed });

        let mut last: Option<TransportError> = None;
        for attempt in 0..self.policy.max_attempts {
            match self.post_once(&body).await {
                Ok(()) => {
                    debug!(events = events.len(), attempt, "batch delivered");
                    return Ok(());
                }
                Err(e) if !e.retryable() => return Err(e),
                Err(e) => {
                    let mut delay = self.policy.delay_for(attempt);
                    if let Some(server_delay) = e.retry_after() {
                        delay = delay.max(server_delay);
                    }
                    warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "batch send failed, will retry");
                    last = Some(e);
                    if attempt + 1 < self.policy.max_attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(TransportError::RetriesExhausted {
            attempts: self.policy.max_attempts,
            last: last
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempts made".to_owned()),
        })
    }
}

/// `Retry-After` is either integer seconds or an HTTP-date.
fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let when = chrono::DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
    delta.to_std().ok()
}
