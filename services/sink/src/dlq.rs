//! Dead-letter routing.
//!
//! The broker publishes an advisory when a message exhausts its delivery
//! attempts.  This router subscribes to those advisories (a core, ephemeral
//! subscription — a missed advisory only delays routing, since the source
//! message stays on the main stream), fetches the referenced message by
//! sequence, and republishes it to `dlq.<original-subject>` on the
//! long-retention DLQ stream with headers naming its origin.

use crate::metrics::SinkMetrics;
use causality_protocol::dlq_headers;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Max-deliveries advisory payload, as emitted by the broker.
#[derive(Debug, Clone, Deserialize)]
pub struct MaxDeliveriesAdvisory {
    pub stream: String,
    pub consumer: String,
    pub stream_seq: u64,
    #[serde(default)]
    pub deliveries: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("advisory decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("stream lookup: {0}")]
    Stream(String),
    #[error("message fetch: {0}")]
    Fetch(String),
    #[error("dlq publish: {0}")]
    Publish(String),
}

/// Advisory subject for a `(stream, consumer)` pair.
pub fn advisory_subject(stream: &str, consumer: &str) -> String {
    format!(
        "$JS.EVENT.ADVISORY.CONSUMER.MAX_DELIVERIES.{}.{}",
        stream, consumer
    )
}

pub struct DlqRouter {
    client: async_nats::Client,
    jetstream: async_nats::jetstream::Context,
    stream_name: String,
    consumer_name: String,
    dlq_stream_name: String,
    metrics: Arc<SinkMetrics>,
}

impl DlqRouter {
    pub fn new(
        client: async_nats::Client,
        jetstream: async_nats::jetstream::Context,
        stream_name: impl Into<String>,
        consumer_name: impl Into<String>,
        dlq_stream_name: impl Into<String>,
        metrics: Arc<SinkMetrics>,
    ) -> Self {
        Self {
            client,
            jetstream,
            stream_name: stream_name.into(),
            consumer_name: consumer_name.into(),
            dlq_stream_name: dlq_stream_name.into(),
            metrics,
        }
    }

    /// Subscribe to advisories and route until the stop signal flips.
    pub async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let subject = advisory_subject(&self.stream_name, &self.consumer_name);
        let mut subscription = match self.client.subscribe(subject.clone()).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(subject = %subject, error = %e, "dlq advisory subscribe failed");
                return;
            }
        };
        info!(subject = %subject, "dlq router subscribed");

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                message = subscription.next() => {
                    match message {
                        None => break,
                        Some(message) => {
                            match self.handle_advisory(&message.payload).await {
                                Ok(()) => self.metrics.dlq_routed.inc(),
                                Err(e) => {
                                    self.metrics.dlq_failures.inc();
                                    warn!(error = %e, "dlq routing failed");
                                }
                            }
                            self.refresh_depth().await;
                        }
                    }
                }
            }
        }
        info!("dlq router stopped");
    }

    async fn handle_advisory(&self, payload: &[u8]) -> Result<(), DlqError> {
        let advisory: MaxDeliveriesAdvisory = serde_json::from_slice(payload)?;
        debug!(
            stream = %advisory.stream,
            seq = advisory.stream_seq,
            deliveries = advisory.deliveries,
            "max-deliveries advisory"
        );

        let stream = self
            .jetstream
            .get_stream(&self.stream_name)
            .await
            .map_err(|e| DlqError::Stream(e.to_string()))?;
        let raw = stream
            .get_raw_message(advisory.stream_seq)
            .await
            .map_err(|e| DlqError::Fetch(e.to_string()))?;

        let original_subject = raw.subject.to_string();
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(dlq_headers::ORIGINAL_SUBJECT, original_subject.as_str());
        headers.insert(
            dlq_headers::DELIVERY_COUNT,
            advisory.deliveries.to_string().as_str(),
        );
        headers.insert(
            dlq_headers::TIMESTAMP,
            chrono::Utc::now().to_rfc3339().as_str(),
        );

        let dlq_subject = format!("dlq.{}", original_subject);
        let ack = self
            .jetstream
            .publish_with_headers(dlq_subject, headers, raw.payload.to_vec().into())
            .await
            .map_err(|e| DlqError::Publish(e.to_string()))?;
        ack.await.map_err(|e| DlqError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn refresh_depth(&self) {
        match self.jetstream.get_stream(&self.dlq_stream_name).await {
            Ok(mut stream) => match stream.info().await {
                Ok(info) => {
                    self.metrics.dlq_depth.set(info.state.messages as i64);
                }
                Err(e) => debug!(error = %e, "dlq stream info failed"),
            },
            Err(e) => debug!(error = %e, "dlq stream lookup failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_subject_matches_broker_convention() {
        assert_eq!(
            advisory_subject("CAUSALITY_EVENTS", "warehouse-sink"),
            "$JS.EVENT.ADVISORY.CONSUMER.MAX_DELIVERIES.CAUSALITY_EVENTS.warehouse-sink"
        );
    }

    #[test]
    fn advisory_payload_decodes() {
        let payload = serde_json::json!({
            "type": "io.nats.jetstream.advisory.v1.max_deliver",
            "id": "abc",
            "timestamp": "2026-01-15T10:30:00Z",
            "stream": "CAUSALITY_EVENTS",
            "consumer": "warehouse-sink",
            "stream_seq": 42,
            "deliveries": 5
        });
        let advisory: MaxDeliveriesAdvisory =
            serde_json::from_slice(payload.to_string().as_bytes()).expect("decode advisory");
        assert_eq!(advisory.stream_seq, 42);
        assert_eq!(advisory.deliveries, 5);
    }
}
