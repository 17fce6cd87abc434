// causality-protocol: Event envelope and ingest API types.
//
// Everything that crosses a process boundary — HTTP bodies, stream payloads,
// mobile queue rows — is JSON with the shapes defined here.  The envelope is
// frozen at enqueue time on the client and enriched exactly once at the
// gateway (id + idempotency-key defaulting); it is immutable afterwards.

use chrono::{DateTime, Datelike, Timelike};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Device context
// ---------------------------------------------------------------------------

/// Client platform, as reported by the native wrapper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Web,
    #[default]
    Unknown,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
            Platform::Web => "web",
            Platform::Unknown => "unknown",
        }
    }
}

/// Network reachability class at event time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Wifi,
    Cellular,
    Ethernet,
    Offline,
    #[default]
    Unknown,
}

impl NetworkType {
    pub fn as_str(self) -> &'static str {
        match self {
            NetworkType::Wifi => "wifi",
            NetworkType::Cellular => "cellular",
            NetworkType::Ethernet => "ethernet",
            NetworkType::Offline => "offline",
            NetworkType::Unknown => "unknown",
        }
    }
}

/// Platform-populated metadata attached to every event for segmentation.
///
/// All fields are optional on the wire; absent fields deserialize to their
/// defaults so old SDK builds keep working as columns are added.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceContext {
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub app_version: String,
    #[serde(default)]
    pub build_number: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub screen_width: u32,
    #[serde(default)]
    pub screen_height: u32,
    #[serde(default)]
    pub locale: String,
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub network_type: NetworkType,
    #[serde(default)]
    pub carrier: String,
    #[serde(default)]
    pub is_jailbroken: bool,
    #[serde(default)]
    pub is_emulator: bool,
    #[serde(default)]
    pub sdk_version: String,
}

// ---------------------------------------------------------------------------
// Payload variants
// ---------------------------------------------------------------------------

/// Typed payload, discriminated by the `category` field.
///
/// The category set is closed: unknown categories are rejected at the
/// gateway rather than passed through.  `properties` is free-form JSON so
/// per-variant schema evolution never breaks the stream or the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category")]
#[serde(rename_all = "snake_case")]
pub enum EventPayload {
    User {
        event_type: String,
        #[serde(default)]
        properties: serde_json::Value,
    },
    Screen {
        event_type: String,
        #[serde(default)]
        properties: serde_json::Value,
    },
    Interaction {
        event_type: String,
        #[serde(default)]
        properties: serde_json::Value,
    },
    Commerce {
        event_type: String,
        #[serde(default)]
        properties: serde_json::Value,
    },
    System {
        event_type: String,
        #[serde(default)]
        properties: serde_json::Value,
    },
    Custom {
        event_type: String,
        #[serde(default)]
        properties: serde_json::Value,
    },
}

/// The closed set of wire category names, in serialization order.
pub const EVENT_CATEGORIES: &[&str] = &[
    "user",
    "screen",
    "interaction",
    "commerce",
    "system",
    "custom",
];

impl EventPayload {
    /// The wire name of this variant's category.
    pub fn category(&self) -> &'static str {
        match self {
            EventPayload::User { .. } => "user",
            EventPayload::Screen { .. } => "screen",
            EventPayload::Interaction { .. } => "interaction",
            EventPayload::Commerce { .. } => "commerce",
            EventPayload::System { .. } => "system",
            EventPayload::Custom { .. } => "custom",
        }
    }

    /// The client-chosen event type inside the variant (e.g. `screen_view`).
    pub fn event_type(&self) -> &str {
        match self {
            EventPayload::User { event_type, .. }
            | EventPayload::Screen { event_type, .. }
            | EventPayload::Interaction { event_type, .. }
            | EventPayload::Commerce { event_type, .. }
            | EventPayload::System { event_type, .. }
            | EventPayload::Custom { event_type, .. } => event_type,
        }
    }

    /// The free-form properties object inside the variant.
    pub fn properties(&self) -> &serde_json::Value {
        match self {
            EventPayload::User { properties, .. }
            | EventPayload::Screen { properties, .. }
            | EventPayload::Interaction { properties, .. }
            | EventPayload::Commerce { properties, .. }
            | EventPayload::System { properties, .. }
            | EventPayload::Custom { properties, .. } => properties,
        }
    }
}

/// True when `category` names one of the closed payload variants.
pub fn is_known_category(category: &str) -> bool {
    EVENT_CATEGORIES.contains(&category)
}

// ---------------------------------------------------------------------------
// Event envelope
// ---------------------------------------------------------------------------

/// The event envelope carried on the wire and on the stream.
///
/// Lifecycle: constructed client-side, frozen at enqueue, enriched once at
/// the gateway (`event_id` assigned when empty, `idempotency_key` defaulted
/// when empty), immutable thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Time-sortable UUID; server-assigned when the client leaves it empty.
    #[serde(default)]
    pub event_id: String,
    pub app_id: String,
    #[serde(default)]
    pub device_id: String,
    /// Milliseconds since the Unix epoch; must be > 0.
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Client-generated key, globally unique per logical event.  The
    /// gateway assigns a fresh one when empty so every event entering
    /// dedup carries a non-empty key.
    #[serde(default)]
    pub idempotency_key: String,
    #[serde(default)]
    pub context: DeviceContext,
    #[serde(flatten)]
    pub payload: EventPayload,
}

// ---------------------------------------------------------------------------
// Partition key
// ---------------------------------------------------------------------------

/// Hour-grained partition identity used to group sink batches and to build
/// object-store prefixes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub app_id: String,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
}

impl PartitionKey {
    /// Derive the partition for an event timestamp, interpreted as UTC.
    ///
    /// Returns `None` for timestamps chrono cannot represent; callers treat
    /// that the same as any other malformed envelope.
    pub fn from_timestamp_ms(app_id: &str, timestamp_ms: i64) -> Option<Self> {
        let ts = DateTime::from_timestamp_millis(timestamp_ms)?;
        Some(PartitionKey {
            app_id: app_id.to_owned(),
            year: ts.year(),
            month: ts.month(),
            day: ts.day(),
            hour: ts.hour(),
        })
    }

    /// Object-store prefix for this partition, under `root`.
    ///
    /// `<root>/app_id=<A>/year=<YYYY>/month=<MM>/day=<DD>/hour=<HH>/`
    /// with zero-padded month, day, and hour.
    pub fn object_prefix(&self, root: &str) -> String {
        format!(
            "{}/app_id={}/year={:04}/month={:02}/day={:02}/hour={:02}/",
            root.trim_end_matches('/'),
            self.app_id,
            self.year,
            self.month,
            self.day,
            self.hour,
        )
    }

    /// Full object key for a fresh Parquet file in this partition.
    pub fn object_key(&self, root: &str, file_uuid: &str) -> String {
        format!("{}events_{}.parquet", self.object_prefix(root), file_uuid)
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{:04}-{:02}-{:02}T{:02}",
            self.app_id, self.year, self.month, self.day, self.hour
        )
    }
}

// ---------------------------------------------------------------------------
// Ingest API bodies
// ---------------------------------------------------------------------------

/// Response for `POST /v1/events/ingest` on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResponse {
    /// Always `"accepted"` — duplicates are accepted idempotently.
    pub status: String,
    pub event_id: String,
}

/// Request body for `POST /v1/events/batch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchIngestRequest {
    pub events: Vec<Event>,
}

/// Per-event outcome inside a batch response.  Entries are positional:
/// `results[i]` corresponds to `events[i]` in the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEntryResult {
    /// `"accepted"` or `"rejected"`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response for `POST /v1/events/batch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchIngestResponse {
    pub accepted_count: u64,
    pub rejected_count: u64,
    pub results: Vec<BatchEntryResult>,
}

/// Frozen HTTP error envelope used by all non-2xx responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Frozen error codes.
pub mod error_codes {
    pub const APP_ID_REQUIRED: &str = "APP_ID_REQUIRED";
    pub const EVENT_TYPE_REQUIRED: &str = "EVENT_TYPE_REQUIRED";
    pub const TIMESTAMP_REQUIRED: &str = "TIMESTAMP_REQUIRED";
    pub const AT_LEAST_ONE_EVENT: &str = "AT_LEAST_ONE_EVENT";
    pub const BATCH_TOO_LARGE: &str = "BATCH_TOO_LARGE";
    pub const INVALID_JSON: &str = "INVALID_JSON";
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const PUBLISH_FAILED: &str = "PUBLISH_FAILED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

// ---------------------------------------------------------------------------
// DLQ headers
// ---------------------------------------------------------------------------

/// Header names carried by messages republished onto the DLQ stream.
pub mod dlq_headers {
    pub const ORIGINAL_SUBJECT: &str = "X-DLQ-Original-Subject";
    pub const DELIVERY_COUNT: &str = "X-DLQ-Delivery-Count";
    pub const TIMESTAMP: &str = "X-DLQ-Timestamp";
}
