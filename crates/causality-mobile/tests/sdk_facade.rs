//! Façade behavior: metadata injection, typed tracking, session identity
//! in events, and full reset.

use async_trait::async_trait;
use causality_mobile::config::SdkConfig;
use causality_mobile::sdk::Sdk;
use causality_mobile::transport::{Transport, TransportError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct RecordingTransport {
    delivered: Mutex<Vec<Vec<String>>>,
}

impl RecordingTransport {
    fn events(&self) -> Vec<serde_json::Value> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|raw| serde_json::from_str(raw).expect("delivered event is JSON"))
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_batch(&self, events: &[String]) -> Result<(), TransportError> {
        self.delivered.lock().unwrap().push(events.to_vec());
        Ok(())
    }
}

fn sdk_with_recorder(config_json: &str) -> (Sdk, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::default());
    let handle = Arc::clone(&transport);
    let config = SdkConfig::parse(config_json).expect("config");
    let sdk = Sdk::init_with_transport_factory(config, move |_| Ok(handle as Arc<dyn Transport>))
        .expect("init");
    (sdk, transport)
}

const CONFIG: &str = r#"{
    "api_key": "k",
    "endpoint": "http://localhost:8080",
    "app_id": "a",
    "batch_size": 5,
    "flush_interval_ms": 10000
}"#;

#[test]
fn track_injects_metadata_and_enqueues() {
    let (sdk, transport) = sdk_with_recorder(CONFIG);

    sdk.track(r#"{"type":"screen_view","properties":{"screen_name":"Home"}}"#)
        .unwrap();
    assert_eq!(sdk.queue_count().unwrap(), 1);

    // Deliver the enriched row and inspect what was actually stored.
    sdk.flush().unwrap();
    assert_eq!(sdk.queue_count().unwrap(), 0);

    let events = transport.events();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event["type"], "screen_view");
    assert_eq!(event["properties"]["screen_name"], "Home");

    let metadata = &event["metadata"];
    assert_eq!(metadata["app_id"], "a");
    assert_eq!(metadata["idempotency_key"].as_str().unwrap().len(), 36);
    assert!(!metadata["device_id"].as_str().unwrap().is_empty());
    assert!(!metadata["session_id"].as_str().unwrap().is_empty());
    let timestamp = metadata["timestamp"].as_str().unwrap();
    chrono::DateTime::parse_from_rfc3339(timestamp).expect("rfc3339 timestamp");

    // Context snapshot rides along for the gateway's device columns.
    assert!(event["context"].is_object());
}

#[test]
fn user_id_appears_after_set_user() {
    let (sdk, transport) = sdk_with_recorder(CONFIG);
    sdk.set_user("u", serde_json::json!({"plan": "pro"}), Vec::new())
        .unwrap();
    sdk.track(r#"{"type":"ping"}"#).unwrap();
    sdk.flush().unwrap();

    let events = transport.events();
    assert_eq!(events[0]["metadata"]["user_id"], "u");
}

#[test]
fn events_within_a_session_share_the_session_id() {
    let (sdk, transport) = sdk_with_recorder(CONFIG);
    sdk.track(r#"{"type":"a"}"#).unwrap();
    sdk.track(r#"{"type":"b"}"#).unwrap();
    sdk.flush().unwrap();

    let events = transport.events();
    assert_eq!(
        events[0]["metadata"]["session_id"],
        events[1]["metadata"]["session_id"]
    );
}

#[test]
fn session_tracking_can_be_disabled_in_config() {
    let config = r#"{
        "api_key": "k", "endpoint": "http://x", "app_id": "a",
        "enable_session_tracking": false
    }"#;
    let (sdk, transport) = sdk_with_recorder(config);
    sdk.track(r#"{"type":"ping"}"#).unwrap();
    sdk.flush().unwrap();

    let events = transport.events();
    assert!(events[0]["metadata"].get("session_id").is_none());
}

#[test]
fn track_requires_a_type() {
    let (sdk, _) = sdk_with_recorder(CONFIG);
    let err = sdk.track(r#"{"properties":{}}"#).unwrap_err();
    assert_eq!(err.code(), "EVENT_TYPE_REQUIRED");

    let err = sdk.track("not json").unwrap_err();
    assert_eq!(err.code(), "INVALID_JSON");
    assert_eq!(sdk.queue_count().unwrap(), 0);
}

#[test]
fn track_typed_validates_against_the_closed_category_set() {
    let (sdk, transport) = sdk_with_recorder(CONFIG);

    let err = sdk.track_typed("telemetry", "{}").unwrap_err();
    assert_eq!(err.code(), "EVENT_TYPE_REQUIRED");

    sdk.track_typed("commerce", r#"{"amount": 9.99}"#).unwrap();
    sdk.flush().unwrap();

    let events = transport.events();
    assert_eq!(events[0]["type"], "commerce");
    assert_eq!(events[0]["properties"]["amount"], 9.99);
}

#[test]
fn each_track_gets_a_fresh_idempotency_key() {
    let (sdk, transport) = sdk_with_recorder(CONFIG);
    sdk.track(r#"{"type":"a"}"#).unwrap();
    sdk.track(r#"{"type":"a"}"#).unwrap();
    sdk.flush().unwrap();

    let events = transport.events();
    assert_eq!(events.len(), 2, "same payload is two distinct events");
    assert_ne!(
        events[0]["metadata"]["idempotency_key"],
        events[1]["metadata"]["idempotency_key"]
    );
}

#[test]
fn reset_all_clears_identity_device_queue_and_session() {
    let (sdk, _) = sdk_with_recorder(CONFIG);
    sdk.set_user("u", serde_json::Value::Null, Vec::new())
        .unwrap();
    sdk.track(r#"{"type":"a"}"#).unwrap();
    let device_before = sdk.device_id().unwrap();
    assert!(sdk.current_session_id().is_some());

    sdk.reset_all().unwrap();

    assert_eq!(sdk.user_id(), "");
    assert_ne!(sdk.device_id().unwrap(), device_before);
    assert_eq!(sdk.queue_count().unwrap(), 0);
    assert!(sdk.current_session_id().is_none());
}

#[test]
fn background_flush_persists_pending_events() {
    let (sdk, transport) = sdk_with_recorder(CONFIG);
    sdk.track(r#"{"type":"a"}"#).unwrap();

    sdk.app_did_enter_background();
    // The flush runs on the SDK runtime; give it a moment.
    for _ in 0..100 {
        if sdk.queue_count().unwrap() == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(sdk.queue_count().unwrap(), 0);
    assert_eq!(transport.events().len(), 1);
}

#[test]
fn shutdown_delivers_whatever_is_queued() {
    let (sdk, transport) = sdk_with_recorder(CONFIG);
    sdk.track(r#"{"type":"a"}"#).unwrap();
    sdk.shutdown();
    assert_eq!(transport.events().len(), 1);
}
