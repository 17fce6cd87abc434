//! Event publishing onto the durable stream.
//!
//! The gateway publishes each accepted envelope as JSON to
//! `<subject_prefix>.<app_id>` and waits for the broker's persist ack, so a
//! 2xx ingest response means the event is on the stream, not merely in a
//! socket buffer.

use async_trait::async_trait;
use causality_protocol::Event;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("stream publish: {0}")]
    Stream(String),
}

/// Stream-publishing seam.  Production wraps a JetStream context; tests use
/// a recording implementation.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

/// Subject for an event: `<prefix>.<app_id>` with token-unsafe characters
/// replaced, since app ids are operator input rather than subject-safe by
/// construction.
pub fn subject_for(prefix: &str, app_id: &str) -> String {
    let safe: String = app_id
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' | ' ' => '_',
            other => other,
        })
        .collect();
    format!("{}.{}", prefix, safe)
}

/// Serialize an envelope for the stream.
pub fn encode_event(event: &Event) -> Result<Vec<u8>, PublishError> {
    serde_json::to_vec(event).map_err(|e| PublishError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// JetStream implementation
// ---------------------------------------------------------------------------

pub struct JetStreamPublisher {
    context: async_nats::jetstream::Context,
}

impl JetStreamPublisher {
    pub fn new(context: async_nats::jetstream::Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl EventPublisher for JetStreamPublisher {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let ack = self
            .context
            .publish(subject.to_owned(), payload.into())
            .await
            .map_err(|e| PublishError::Stream(e.to_string()))?;
        // Wait for the persist ack; without it the event may not be durable.
        ack.await.map_err(|e| PublishError::Stream(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_sanitizes_token_breaking_characters() {
        assert_eq!(subject_for("events", "app-1"), "events.app-1");
        assert_eq!(subject_for("events", "my.app v2"), "events.my_app_v2");
        assert_eq!(subject_for("events", "a>b*c"), "events.a_b_c");
    }
}
