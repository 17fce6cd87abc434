//! Acknowledgement-discipline tests for the sink: ACK only after a durable
//! write, NAK on upload failure, Term for poison, and partition
//! independence within one flush.  All hermetic behind the `AckHandle`,
//! `EventSource`, and `BlobStore` seams.

use async_trait::async_trait;
use causality_protocol::{DeviceContext, Event, EventPayload};
use sink::config::SinkConfig;
use sink::consumer::{AckError, AckHandle, EventSource, Sink, SourceError, StreamMessage};
use sink::metrics::SinkMetrics;
use sink::store::{BlobStore, MemoryStore, StoreError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Recording handles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    Ack,
    Nak,
    Term,
}

#[derive(Default, Clone)]
struct SettleLog {
    entries: Arc<Mutex<HashMap<String, Vec<Settle>>>>,
}

impl SettleLog {
    fn record(&self, id: &str, settle: Settle) {
        self.entries
            .lock()
            .unwrap()
            .entry(id.to_owned())
            .or_default()
            .push(settle);
    }

    fn settles(&self, id: &str) -> Vec<Settle> {
        self.entries
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    fn assert_settled_exactly(&self, id: &str, expected: Settle) {
        assert_eq!(
            self.settles(id),
            vec![expected],
            "message {} must settle exactly once as {:?}",
            id,
            expected
        );
    }
}

struct RecordingHandle {
    id: String,
    log: SettleLog,
}

#[async_trait]
impl AckHandle for RecordingHandle {
    async fn ack(self: Box<Self>) -> Result<(), AckError> {
        self.log.record(&self.id, Settle::Ack);
        Ok(())
    }

    async fn nak(self: Box<Self>) -> Result<(), AckError> {
        self.log.record(&self.id, Settle::Nak);
        Ok(())
    }

    async fn term(self: Box<Self>) -> Result<(), AckError> {
        self.log.record(&self.id, Settle::Term);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store that fails selected partitions
// ---------------------------------------------------------------------------

struct FailingStore {
    inner: MemoryStore,
    fail_substring: String,
}

#[async_trait]
impl BlobStore for FailingStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        if key.contains(&self.fail_substring) {
            return Err(StoreError::Backend("simulated upload failure".to_owned()));
        }
        self.inner.put(key, bytes).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.inner.get(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<sink::store::ObjectMeta>, StoreError> {
        self.inner.list(prefix).await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), StoreError> {
        self.inner.delete_many(keys).await
    }
}

// ---------------------------------------------------------------------------
// Scripted source
// ---------------------------------------------------------------------------

struct ScriptedSource {
    batches: Mutex<Vec<Vec<StreamMessage>>>,
}

#[async_trait]
impl EventSource for ScriptedSource {
    async fn fetch(
        &self,
        _max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<StreamMessage>, SourceError> {
        let next = self.batches.lock().unwrap().pop();
        match next {
            Some(batch) => Ok(batch),
            None => {
                // Emulate the broker's short-wait fetch on an idle stream.
                tokio::time::sleep(wait.min(Duration::from_millis(10))).await;
                Ok(Vec::new())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn event_json(idempotency_key: &str, timestamp_ms: i64) -> Vec<u8> {
    let event = Event {
        event_id: format!("evt-{}", idempotency_key),
        app_id: "app-1".to_owned(),
        device_id: "dev-1".to_owned(),
        timestamp_ms,
        correlation_id: None,
        idempotency_key: idempotency_key.to_owned(),
        context: DeviceContext::default(),
        payload: EventPayload::Custom {
            event_type: "ping".to_owned(),
            properties: serde_json::Value::Null,
        },
    };
    serde_json::to_vec(&event).expect("encode event")
}

fn message(log: &SettleLog, id: &str, payload: Vec<u8>) -> StreamMessage {
    StreamMessage {
        payload: payload.into(),
        handle: Box::new(RecordingHandle {
            id: id.to_owned(),
            log: log.clone(),
        }),
    }
}

fn sink_config(flush_max_events: usize) -> SinkConfig {
    SinkConfig {
        workers: 1,
        fetch_max: 10,
        fetch_wait: Duration::from_millis(20),
        flush_max_events,
        flush_interval: Duration::from_millis(100),
    }
}

fn make_sink(store: Arc<dyn BlobStore>, flush_max_events: usize) -> Sink {
    Sink::new(
        Arc::new(ScriptedSource {
            batches: Mutex::new(Vec::new()),
        }),
        store,
        Arc::new(SinkMetrics::new()),
        sink_config(flush_max_events),
        "events",
    )
}

// Timestamps: 2026-01-15T10:30:00Z and 2026-01-15T11:30:00Z.
const TS_HOUR_10: i64 = 1768473000000;
const TS_HOUR_11: i64 = 1768476600000;

// ---------------------------------------------------------------------------
// ACK-after-write
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_flush_acks_every_handle_exactly_once() {
    let log = SettleLog::default();
    let store = Arc::new(MemoryStore::new());
    let sink = make_sink(store.clone(), 100);

    sink.ingest_messages(vec![
        message(&log, "m1", event_json("k1", TS_HOUR_10)),
        message(&log, "m2", event_json("k2", TS_HOUR_10)),
    ])
    .await;
    sink.flush().await;

    log.assert_settled_exactly("m1", Settle::Ack);
    log.assert_settled_exactly("m2", Settle::Ack);
    assert_eq!(store.len().await, 1);
    assert_eq!(sink.pending().await, 0);
}

#[tokio::test]
async fn failed_upload_naks_every_handle_exactly_once() {
    let log = SettleLog::default();
    let store = Arc::new(FailingStore {
        inner: MemoryStore::new(),
        fail_substring: "app_id=app-1".to_owned(),
    });
    let sink = make_sink(store, 100);

    sink.ingest_messages(vec![
        message(&log, "m1", event_json("k1", TS_HOUR_10)),
        message(&log, "m2", event_json("k2", TS_HOUR_10)),
    ])
    .await;
    sink.flush().await;

    log.assert_settled_exactly("m1", Settle::Nak);
    log.assert_settled_exactly("m2", Settle::Nak);
}

// ---------------------------------------------------------------------------
// Poison
// ---------------------------------------------------------------------------

#[tokio::test]
async fn poison_payload_is_terminated_and_never_batched() {
    let log = SettleLog::default();
    let store = Arc::new(MemoryStore::new());
    let sink = make_sink(store.clone(), 100);

    sink.ingest_messages(vec![message(&log, "poison", b"not json {{".to_vec())])
        .await;

    log.assert_settled_exactly("poison", Settle::Term);
    assert_eq!(sink.pending().await, 0);

    // A flush after poison writes nothing: the batch never saw it.
    sink.flush().await;
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn poison_does_not_disturb_healthy_messages_in_the_same_fetch() {
    let log = SettleLog::default();
    let store = Arc::new(MemoryStore::new());
    let sink = make_sink(store.clone(), 100);

    sink.ingest_messages(vec![
        message(&log, "good", event_json("k1", TS_HOUR_10)),
        message(&log, "poison", b"\x00\x01garbage".to_vec()),
        message(&log, "good-2", event_json("k2", TS_HOUR_10)),
    ])
    .await;
    sink.flush().await;

    log.assert_settled_exactly("poison", Settle::Term);
    log.assert_settled_exactly("good", Settle::Ack);
    log.assert_settled_exactly("good-2", Settle::Ack);
}

// ---------------------------------------------------------------------------
// Partition behavior
// ---------------------------------------------------------------------------

#[tokio::test]
async fn flush_groups_by_hour_partition_with_formatted_keys() {
    let log = SettleLog::default();
    let store = Arc::new(MemoryStore::new());
    let sink = make_sink(store.clone(), 100);

    sink.ingest_messages(vec![
        message(&log, "m1", event_json("k1", TS_HOUR_10)),
        message(&log, "m2", event_json("k2", TS_HOUR_10)),
        message(&log, "m3", event_json("k3", TS_HOUR_11)),
    ])
    .await;
    sink.flush().await;

    // Two partitions, one upload each.
    let hour_10 = store
        .list("events/app_id=app-1/year=2026/month=01/day=15/hour=10/")
        .await
        .unwrap();
    let hour_11 = store
        .list("events/app_id=app-1/year=2026/month=01/day=15/hour=11/")
        .await
        .unwrap();
    assert_eq!(hour_10.len(), 1);
    assert_eq!(hour_11.len(), 1);
    assert!(hour_10[0].key.ends_with(".parquet"));
    assert!(hour_10[0]
        .key
        .rsplit('/')
        .next()
        .unwrap()
        .starts_with("events_"));

    // Three acks total.
    log.assert_settled_exactly("m1", Settle::Ack);
    log.assert_settled_exactly("m2", Settle::Ack);
    log.assert_settled_exactly("m3", Settle::Ack);

    // Row counts per partition file.
    let data = store.get(&hour_10[0].key).await.unwrap();
    let batches = sink::columnar::decode_batches(data).unwrap();
    assert_eq!(sink::columnar::row_count(&batches), 2);
}

#[tokio::test]
async fn partitions_fail_independently_within_one_flush() {
    let log = SettleLog::default();
    let store = Arc::new(FailingStore {
        inner: MemoryStore::new(),
        fail_substring: "hour=11".to_owned(),
    });
    let sink = make_sink(store, 100);

    sink.ingest_messages(vec![
        message(&log, "p1-a", event_json("k1", TS_HOUR_10)),
        message(&log, "p1-b", event_json("k2", TS_HOUR_10)),
        message(&log, "p2-a", event_json("k3", TS_HOUR_11)),
        message(&log, "p2-b", event_json("k4", TS_HOUR_11)),
    ])
    .await;
    sink.flush().await;

    log.assert_settled_exactly("p1-a", Settle::Ack);
    log.assert_settled_exactly("p1-b", Settle::Ack);
    log.assert_settled_exactly("p2-a", Settle::Nak);
    log.assert_settled_exactly("p2-b", Settle::Nak);
}

// ---------------------------------------------------------------------------
// Worker loop end to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn worker_pool_drains_scripted_stream_and_stops_cleanly() {
    let log = SettleLog::default();
    let store = Arc::new(MemoryStore::new());

    let batches = vec![vec![
        message(&log, "m1", event_json("k1", TS_HOUR_10)),
        message(&log, "m2", event_json("k2", TS_HOUR_10)),
    ]];
    let sink = Arc::new(Sink::new(
        Arc::new(ScriptedSource {
            batches: Mutex::new(batches),
        }),
        store.clone(),
        Arc::new(SinkMetrics::new()),
        // Size trigger of 2 so the worker flushes without waiting for the
        // timer.
        sink_config(2),
        "events",
    ));

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(Arc::clone(&sink).run(stop_rx));

    // Give the worker a few scheduling slots to fetch and flush.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let _ = stop_tx.send(true);
    task.await.expect("sink task join");

    log.assert_settled_exactly("m1", Settle::Ack);
    log.assert_settled_exactly("m2", Settle::Ack);
    assert_eq!(store.len().await, 1);
}
