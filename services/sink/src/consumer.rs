//! Pull-consumer worker pool and the flush protocol.
//!
//! N workers share one durable pull subscription.  Fetched messages are
//! decoded and appended to a shared batch; a size check may trigger a
//! flush, and a timer task forces one when the interval elapses without.
//!
//! Acknowledgement discipline: a message handle is owned by exactly one
//! `TrackedEvent` from receive until its partition's flush concludes, and
//! the `AckHandle` methods consume the handle, so the cycle
//! `receive -> batch -> upload -> (ack | nak | term)` happens exactly once
//! by construction.
//!
//! - Upload success: every handle in the partition is acked.
//! - Upload failure: every handle in the partition is naked for redelivery;
//!   other partitions in the same flush proceed independently.
//! - Undecodable payload: terminated immediately — such a message can never
//!   succeed, so redelivery would only burn attempts on the way to the DLQ.

use crate::columnar;
use crate::config::SinkConfig;
use crate::metrics::SinkMetrics;
use crate::store::BlobStore;
use async_trait::async_trait;
use causality_protocol::{Event, PartitionKey};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Stream seams
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
#[error("acknowledgement failed: {0}")]
pub struct AckError(pub String);

/// Single-use acknowledgement authority for one stream message.
///
/// Methods consume the handle: once a decision is made there is no way to
/// make another.
#[async_trait]
pub trait AckHandle: Send {
    async fn ack(self: Box<Self>) -> Result<(), AckError>;
    async fn nak(self: Box<Self>) -> Result<(), AckError>;
    async fn term(self: Box<Self>) -> Result<(), AckError>;
}

#[derive(Debug, thiserror::Error)]
#[error("stream fetch failed: {0}")]
pub struct SourceError(pub String);

/// A fetched message: raw payload plus its acknowledgement handle.
pub struct StreamMessage {
    pub payload: bytes::Bytes,
    pub handle: Box<dyn AckHandle>,
}

/// Fetch seam over the durable pull subscription.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Fetch up to `max_messages`, waiting at most `wait` for the first.
    async fn fetch(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<StreamMessage>, SourceError>;
}

// ---------------------------------------------------------------------------
// JetStream implementations
// ---------------------------------------------------------------------------

pub struct JetStreamSource {
    consumer: async_nats::jetstream::consumer::PullConsumer,
}

impl JetStreamSource {
    pub fn new(consumer: async_nats::jetstream::consumer::PullConsumer) -> Self {
        Self { consumer }
    }
}

#[async_trait]
impl EventSource for JetStreamSource {
    async fn fetch(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<StreamMessage>, SourceError> {
        let mut fetched = self
            .consumer
            .fetch()
            .max_messages(max_messages)
            .expires(wait)
            .messages()
            .await
            .map_err(|e| SourceError(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(message) = fetched.next().await {
            let message = message.map_err(|e| SourceError(e.to_string()))?;
            out.push(StreamMessage {
                payload: message.payload.clone(),
                handle: Box::new(JetStreamAckHandle { message }),
            });
        }
        Ok(out)
    }
}

struct JetStreamAckHandle {
    message: async_nats::jetstream::Message,
}

#[async_trait]
impl AckHandle for JetStreamAckHandle {
    async fn ack(self: Box<Self>) -> Result<(), AckError> {
        self.message
            .ack()
            .await
            .map_err(|e| AckError(e.to_string()))
    }

    async fn nak(self: Box<Self>) -> Result<(), AckError> {
        self.message
            .ack_with(async_nats::jetstream::AckKind::Nak(None))
            .await
            .map_err(|e| AckError(e.to_string()))
    }

    async fn term(self: Box<Self>) -> Result<(), AckError> {
        self.message
            .ack_with(async_nats::jetstream::AckKind::Term)
            .await
            .map_err(|e| AckError(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// A decoded event still owning its acknowledgement handle.
pub struct TrackedEvent {
    pub event: Event,
    pub handle: Box<dyn AckHandle>,
}

pub struct Sink {
    source: Arc<dyn EventSource>,
    store: Arc<dyn BlobStore>,
    metrics: Arc<SinkMetrics>,
    cfg: SinkConfig,
    prefix: String,
    batch: Mutex<Vec<TrackedEvent>>,
    last_flush: Mutex<Instant>,
}

impl Sink {
    pub fn new(
        source: Arc<dyn EventSource>,
        store: Arc<dyn BlobStore>,
        metrics: Arc<SinkMetrics>,
        cfg: SinkConfig,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            source,
            store,
            metrics,
            cfg,
            prefix: prefix.into(),
            batch: Mutex::new(Vec::new()),
            last_flush: Mutex::new(Instant::now()),
        }
    }

    /// Run workers and the flush timer until the stop signal flips, then
    /// drain and perform one final flush under a capped deadline.
    pub async fn run(self: Arc<Self>, stop_rx: watch::Receiver<bool>) {
        let mut workers = Vec::with_capacity(self.cfg.workers);
        for worker_id in 0..self.cfg.workers {
            workers.push(tokio::spawn(
                Arc::clone(&self).worker_loop(worker_id, stop_rx.clone()),
            ));
        }
        let timer = tokio::spawn(Arc::clone(&self).timer_loop(stop_rx));

        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "sink worker panicked");
            }
        }
        if let Err(e) = timer.await {
            error!(error = %e, "sink flush timer panicked");
        }

        // Final flush with a capped deadline so shutdown cannot deadlock on
        // a wedged upload.
        let deadline = self.cfg.flush_interval * 2;
        match tokio::time::timeout(deadline, self.flush()).await {
            Ok(()) => info!("sink drained"),
            Err(_) => warn!(deadline_ms = deadline.as_millis() as u64, "final flush timed out"),
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, mut stop_rx: watch::Receiver<bool>) {
        debug!(worker_id, "sink worker started");
        loop {
            if *stop_rx.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                fetched = self.source.fetch(self.cfg.fetch_max, self.cfg.fetch_wait) => {
                    match fetched {
                        Ok(messages) => {
                            if messages.is_empty() {
                                continue;
                            }
                            if self.ingest_messages(messages).await {
                                self.flush().await;
                            }
                        }
                        Err(e) => {
                            warn!(worker_id, error = %e, "fetch failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
        debug!(worker_id, "sink worker stopped");
    }

    async fn timer_loop(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.cfg.flush_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let due = self.last_flush.lock().await.elapsed() >= self.cfg.flush_interval;
                    if due {
                        self.flush().await;
                    }
                }
            }
        }
    }

    /// Decode fetched messages into the shared batch.  Poison messages
    /// (undecodable payloads, unrepresentable timestamps) are terminated
    /// here and never reach the batch.  Returns true when the batch has
    /// grown past the size trigger.
    pub async fn ingest_messages(&self, messages: Vec<StreamMessage>) -> bool {
        let mut decoded = Vec::with_capacity(messages.len());
        for message in messages {
            match serde_json::from_slice::<Event>(&message.payload) {
                Ok(event) => {
                    if PartitionKey::from_timestamp_ms(&event.app_id, event.timestamp_ms).is_none()
                    {
                        self.terminate_poison(message.handle, "unrepresentable timestamp")
                            .await;
                        continue;
                    }
                    decoded.push(TrackedEvent {
                        event,
                        handle: message.handle,
                    });
                }
                Err(e) => {
                    self.terminate_poison(message.handle, &e.to_string()).await;
                }
            }
        }

        let mut batch = self.batch.lock().await;
        batch.extend(decoded);
        batch.len() >= self.cfg.flush_max_events
    }

    async fn terminate_poison(&self, handle: Box<dyn AckHandle>, reason: &str) {
        self.metrics.poison_terminated.inc();
        warn!(reason, "terminating poison message");
        if let Err(e) = handle.term().await {
            warn!(error = %e, "term failed");
        }
    }

    /// Flush the shared batch: group by partition, upload each partition's
    /// Parquet file, then settle every handle in that partition.  Errors
    /// are counted, never fatal.
    pub async fn flush(&self) {
        let drained = {
            let mut batch = self.batch.lock().await;
            std::mem::take(&mut *batch)
        };
        if !drained.is_empty() {
            let mut partitions: HashMap<PartitionKey, Vec<TrackedEvent>> = HashMap::new();
            for tracked in drained {
                // Derivability was checked at ingest; events in the batch
                // always map to a partition.
                if let Some(key) = PartitionKey::from_timestamp_ms(
                    &tracked.event.app_id,
                    tracked.event.timestamp_ms,
                ) {
                    partitions.entry(key).or_default().push(tracked);
                }
            }

            for (partition, group) in partitions {
                self.flush_partition(&partition, group).await;
            }
        }
        *self.last_flush.lock().await = Instant::now();
    }

    async fn flush_partition(&self, partition: &PartitionKey, group: Vec<TrackedEvent>) {
        let (events, handles): (Vec<Event>, Vec<Box<dyn AckHandle>>) = group
            .into_iter()
            .map(|tracked| (tracked.event, tracked.handle))
            .unzip();

        let outcome = match columnar::encode_partition(partition, &events) {
            Ok(bytes) => {
                let key = partition.object_key(&self.prefix, &Uuid::new_v4().to_string());
                let size = bytes.len() as u64;
                match self.store.put(&key, bytes).await {
                    Ok(()) => {
                        self.metrics.batches_uploaded.inc();
                        self.metrics.bytes_written.inc_by(size);
                        debug!(partition = %partition, key = %key, rows = events.len(), "partition flushed");
                        Ok(())
                    }
                    Err(e) => Err(e.to_string()),
                }
            }
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(()) => {
                self.metrics.events_flushed.inc_by(handles.len() as u64);
                for handle in handles {
                    if let Err(e) = handle.ack().await {
                        warn!(error = %e, "ack failed after durable write");
                    }
                }
            }
            Err(reason) => {
                self.metrics.flush_failures.inc();
                self.metrics.events_naked.inc_by(handles.len() as u64);
                warn!(partition = %partition, error = %reason, "partition flush failed, naking");
                for handle in handles {
                    if let Err(e) = handle.nak().await {
                        warn!(error = %e, "nak failed");
                    }
                }
            }
        }
    }

    /// Events currently held in the shared batch.
    pub async fn pending(&self) -> usize {
        self.batch.lock().await.len()
    }
}
