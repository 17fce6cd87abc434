//! Single-event and batch ingestion.
//!
//! Two wire shapes arrive here: the canonical envelope (server-to-server
//! producers) and the mobile SDK shape, where the event carries a `type`,
//! `properties`, a `metadata` sub-object injected by the SDK, and the
//! collected device `context`.  Both normalize to the same envelope before
//! validation, enrichment, dedup, and publish.

use crate::auth::Tenant;
use crate::publisher::{encode_event, subject_for};
use crate::state::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use causality_protocol::{
    error_codes, is_known_category, BatchEntryResult, BatchIngestResponse, DeviceContext, Event,
    EventPayload, HttpErrorEnvelope, IngestResponse,
};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Validation failure
// ---------------------------------------------------------------------------

/// A per-event rejection: frozen code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub code: &'static str,
    pub message: String,
}

impl ValidationFailure {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Parse one wire value into an envelope, accepting both wire shapes.
pub fn parse_envelope(value: &Value) -> Result<Event, ValidationFailure> {
    let obj = value.as_object().ok_or_else(|| {
        ValidationFailure::new(error_codes::INVALID_JSON, "event must be a JSON object")
    })?;

    let event = if obj.contains_key("metadata") && !obj.contains_key("app_id") {
        parse_sdk_shape(obj)?
    } else {
        parse_envelope_shape(value)?
    };
    validate_event(&event)?;
    Ok(event)
}

fn parse_envelope_shape(value: &Value) -> Result<Event, ValidationFailure> {
    // Field-by-field precondition checks first, so clients get the frozen
    // code for the field they actually got wrong rather than a serde trace.
    if value.get("app_id").and_then(Value::as_str).unwrap_or("").is_empty() {
        return Err(ValidationFailure::new(
            error_codes::APP_ID_REQUIRED,
            "app_id is required",
        ));
    }
    match value.get("category").and_then(Value::as_str) {
        Some(category) if is_known_category(category) => {}
        Some(category) => {
            return Err(ValidationFailure::new(
                error_codes::EVENT_TYPE_REQUIRED,
                format!("unknown event category '{}'", category),
            ));
        }
        None => {
            return Err(ValidationFailure::new(
                error_codes::EVENT_TYPE_REQUIRED,
                "a payload variant (category + event_type) is required",
            ));
        }
    }
    if value.get("timestamp_ms").and_then(Value::as_i64).unwrap_or(0) <= 0 {
        return Err(ValidationFailure::new(
            error_codes::TIMESTAMP_REQUIRED,
            "timestamp_ms must be > 0",
        ));
    }

    serde_json::from_value(value.clone())
        .map_err(|e| ValidationFailure::new(error_codes::INVALID_JSON, e.to_string()))
}

/// Normalize the SDK shape:
/// `{type, properties, metadata: {app_id, device_id, timestamp, idempotency_key,
///   session_id?, user_id?, event_id?}, context?}`.
fn parse_sdk_shape(obj: &serde_json::Map<String, Value>) -> Result<Event, ValidationFailure> {
    let event_type = obj
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_owned();
    if event_type.is_empty() {
        return Err(ValidationFailure::new(
            error_codes::EVENT_TYPE_REQUIRED,
            "type is required",
        ));
    }

    let metadata = obj
        .get("metadata")
        .and_then(Value::as_object)
        .ok_or_else(|| {
            ValidationFailure::new(error_codes::INVALID_JSON, "metadata must be an object")
        })?;
    let meta_str = |key: &str| {
        metadata
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_owned()
    };

    let app_id = meta_str("app_id");
    if app_id.is_empty() {
        return Err(ValidationFailure::new(
            error_codes::APP_ID_REQUIRED,
            "metadata.app_id is required",
        ));
    }

    let timestamp_ms = metadata
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.timestamp_millis())
        .unwrap_or(0);
    if timestamp_ms <= 0 {
        return Err(ValidationFailure::new(
            error_codes::TIMESTAMP_REQUIRED,
            "metadata.timestamp must be a valid RFC3339 instant",
        ));
    }

    // TrackTyped sends a category name as the type; everything else lands
    // in the custom bucket with the client's type preserved.
    let category = match metadata.get("category").and_then(Value::as_str) {
        Some(category) if is_known_category(category) => category.to_owned(),
        _ if is_known_category(&event_type) => event_type.clone(),
        _ => "custom".to_owned(),
    };

    let mut properties = obj.get("properties").cloned().unwrap_or(Value::Null);
    let user_id = meta_str("user_id");
    if !user_id.is_empty() {
        if !properties.is_object() {
            properties = Value::Object(serde_json::Map::new());
        }
        if let Some(props) = properties.as_object_mut() {
            props.insert("$user_id".to_owned(), Value::String(user_id));
        }
    }

    let payload = payload_from_parts(&category, event_type, properties).ok_or_else(|| {
        ValidationFailure::new(
            error_codes::EVENT_TYPE_REQUIRED,
            format!("unknown event category '{}'", category),
        )
    })?;

    let context = obj
        .get("context")
        .cloned()
        .map(serde_json::from_value::<DeviceContext>)
        .transpose()
        .map_err(|e| ValidationFailure::new(error_codes::INVALID_JSON, e.to_string()))?
        .unwrap_or_default();

    let session_id = meta_str("session_id");
    Ok(Event {
        event_id: meta_str("event_id"),
        app_id,
        device_id: meta_str("device_id"),
        timestamp_ms,
        correlation_id: (!session_id.is_empty()).then_some(session_id),
        idempotency_key: meta_str("idempotency_key"),
        context,
        payload,
    })
}

fn payload_from_parts(
    category: &str,
    event_type: String,
    properties: Value,
) -> Option<EventPayload> {
    Some(match category {
        "user" => EventPayload::User {
            event_type,
            properties,
        },
        "screen" => EventPayload::Screen {
            event_type,
            properties,
        },
        "interaction" => EventPayload::Interaction {
            event_type,
            properties,
        },
        "commerce" => EventPayload::Commerce {
            event_type,
            properties,
        },
        "system" => EventPayload::System {
            event_type,
            properties,
        },
        "custom" => EventPayload::Custom {
            event_type,
            properties,
        },
        _ => return None,
    })
}

fn validate_event(event: &Event) -> Result<(), ValidationFailure> {
    if event.app_id.is_empty() {
        return Err(ValidationFailure::new(
            error_codes::APP_ID_REQUIRED,
            "app_id is required",
        ));
    }
    if event.payload.event_type().is_empty() {
        return Err(ValidationFailure::new(
            error_codes::EVENT_TYPE_REQUIRED,
            "event_type is required",
        ));
    }
    if event.timestamp_ms <= 0 {
        return Err(ValidationFailure::new(
            error_codes::TIMESTAMP_REQUIRED,
            "timestamp_ms must be > 0",
        ));
    }
    Ok(())
}

/// Enrichment happens exactly once, at the gateway: assign a time-sortable
/// id when the client left it empty, and guarantee a non-empty idempotency
/// key so every event entering dedup carries one.
pub fn enrich_event(event: &mut Event) {
    if event.event_id.is_empty() {
        event.event_id = Uuid::now_v7().to_string();
    }
    if event.idempotency_key.is_empty() {
        event.idempotency_key = Uuid::new_v4().to_string();
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

enum Accepted {
    Published(String),
    Duplicate(String),
}

/// Shared accept path: validate tenant match, enrich, dedup, publish.
async fn accept_event(
    state: &AppState,
    tenant: &Tenant,
    mut event: Event,
) -> Result<Accepted, ValidationFailure> {
    if state.settings.enforce_app_id_match && event.app_id != tenant.app_id {
        return Err(ValidationFailure::new(
            error_codes::BAD_REQUEST,
            "app_id does not match the authenticated credential",
        ));
    }

    enrich_event(&mut event);

    let timer = state.metrics.dedup_check_duration.start_timer();
    let duplicate = state.dedup.is_duplicate(&event.idempotency_key);
    timer.observe_duration();

    if duplicate {
        state.metrics.events_duplicate.inc();
        state.metrics.dedup_dropped.inc();
        debug!(
            event_id = %event.event_id,
            idempotency_key = %event.idempotency_key,
            "duplicate suppressed"
        );
        return Ok(Accepted::Duplicate(event.event_id));
    }

    let payload = encode_event(&event).map_err(|e| {
        ValidationFailure::new(error_codes::INVALID_JSON, e.to_string())
    })?;
    let subject = subject_for(&state.settings.subject_prefix, &event.app_id);
    match state.publisher.publish(&subject, payload).await {
        Ok(()) => {
            state.metrics.events_ingested.inc();
            Ok(Accepted::Published(event.event_id))
        }
        Err(e) => {
            state.metrics.publish_failures.inc();
            warn!(error = %e, subject = %subject, "stream publish failed");
            Err(ValidationFailure::new(
                error_codes::PUBLISH_FAILED,
                "event could not be persisted to the stream",
            ))
        }
    }
}

fn status_for(code: &str) -> StatusCode {
    match code {
        error_codes::PUBLISH_FAILED => StatusCode::BAD_GATEWAY,
        error_codes::INTERNAL_ERROR => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn error_response(failure: &ValidationFailure) -> Response {
    (
        status_for(failure.code),
        Json(HttpErrorEnvelope {
            code: failure.code.to_owned(),
            message: failure.message.clone(),
            details: None,
        }),
    )
        .into_response()
}

/// `POST /v1/events/ingest` — single envelope.
pub async fn ingest_event(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Json(body): Json<Value>,
) -> Response {
    let event = match parse_envelope(&body) {
        Ok(event) => event,
        Err(failure) => {
            state.metrics.events_rejected.inc();
            return error_response(&failure);
        }
    };

    match accept_event(&state, &tenant, event).await {
        Ok(Accepted::Published(event_id) | Accepted::Duplicate(event_id)) => (
            StatusCode::OK,
            Json(IngestResponse {
                status: "accepted".to_owned(),
                event_id,
            }),
        )
            .into_response(),
        Err(failure) => {
            state.metrics.events_rejected.inc();
            error_response(&failure)
        }
    }
}

/// `POST /v1/events/batch` — independent per-event validation and publish;
/// one bad event never aborts its batch.
pub async fn ingest_batch(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Json(body): Json<Value>,
) -> Response {
    let events = match body.get("events").and_then(Value::as_array) {
        Some(events) if !events.is_empty() => events,
        _ => {
            return error_response(&ValidationFailure::new(
                error_codes::AT_LEAST_ONE_EVENT,
                "events must be a non-empty array",
            ));
        }
    };
    if events.len() > state.settings.max_batch_events {
        return error_response(&ValidationFailure::new(
            error_codes::BATCH_TOO_LARGE,
            format!(
                "batch of {} exceeds the maximum of {}",
                events.len(),
                state.settings.max_batch_events
            ),
        ));
    }

    let mut results = Vec::with_capacity(events.len());
    let mut accepted_count = 0u64;
    let mut rejected_count = 0u64;

    for value in events {
        let outcome = match parse_envelope(value) {
            Ok(event) => accept_event(&state, &tenant, event).await,
            Err(failure) => Err(failure),
        };
        match outcome {
            Ok(Accepted::Published(event_id) | Accepted::Duplicate(event_id)) => {
                accepted_count += 1;
                results.push(BatchEntryResult {
                    status: "accepted".to_owned(),
                    event_id: Some(event_id),
                    error: None,
                });
            }
            Err(failure) => {
                rejected_count += 1;
                state.metrics.events_rejected.inc();
                results.push(BatchEntryResult {
                    status: "rejected".to_owned(),
                    event_id: None,
                    error: Some(failure.code.to_owned()),
                });
            }
        }
    }

    (
        StatusCode::OK,
        Json(BatchIngestResponse {
            accepted_count,
            rejected_count,
            results,
        }),
    )
        .into_response()
}
