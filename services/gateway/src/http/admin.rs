//! API-key management.
//!
//! Create returns the plaintext key exactly once; it is never stored and
//! the listing never exposes hashes.  These routes carry no authentication
//! of their own yet — deployments must gate them at the edge until the
//! session auth layer lands.

use crate::auth::{hash_key, KeyStoreError};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use causality_protocol::{error_codes, HttpErrorEnvelope};
use rand::RngCore;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct CreateKeyRequest {
    pub app_id: String,
    #[serde(default)]
    pub display_name: String,
}

pub async fn create_key(
    State(state): State<AppState>,
    Json(body): Json<CreateKeyRequest>,
) -> impl IntoResponse {
    let app_id = body.app_id.trim().to_owned();
    if app_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(HttpErrorEnvelope {
                code: error_codes::BAD_REQUEST.to_owned(),
                message: "app_id must not be empty".to_owned(),
                details: None,
            }),
        )
            .into_response();
    }

    // 32 random bytes: 256 bits of entropy, so a fast hash is sufficient.
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let raw_key = URL_SAFE_NO_PAD.encode(bytes);
    let digest = hash_key(&raw_key);

    match state.keys.create(&app_id, body.display_name.trim(), &digest).await {
        Ok(record) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "key_id": record.key_id.to_string(),
                "app_id": record.app_id,
                "display_name": record.display_name,
                "created_at": record.created_at.to_rfc3339(),
                // Shown exactly once; never retrievable again.
                "api_key": raw_key,
            })),
        )
            .into_response(),
        Err(KeyStoreError::Conflict) => (
            StatusCode::CONFLICT,
            Json(HttpErrorEnvelope {
                code: "CONFLICT".to_owned(),
                message: "a key with this value already exists".to_owned(),
                details: None,
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(HttpErrorEnvelope {
                code: error_codes::INTERNAL_ERROR.to_owned(),
                message: e.to_string(),
                details: None,
            }),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
pub struct ListKeysQuery {
    pub app_id: Option<String>,
}

pub async fn list_keys(
    State(state): State<AppState>,
    Query(query): Query<ListKeysQuery>,
) -> impl IntoResponse {
    match state.keys.list(query.app_id.as_deref()).await {
        Ok(records) => {
            let keys: Vec<serde_json::Value> = records
                .into_iter()
                .map(|r| {
                    serde_json::json!({
                        "key_id": r.key_id.to_string(),
                        "app_id": r.app_id,
                        "display_name": r.display_name,
                        "created_at": r.created_at.to_rfc3339(),
                        "revoked": r.revoked,
                    })
                })
                .collect();
            (StatusCode::OK, Json(serde_json::json!({ "keys": keys }))).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(HttpErrorEnvelope {
                code: error_codes::INTERNAL_ERROR.to_owned(),
                message: e.to_string(),
                details: None,
            }),
        )
            .into_response(),
    }
}

pub async fn revoke_key(
    State(state): State<AppState>,
    Path(key_id): Path<Uuid>,
) -> impl IntoResponse {
    match state.keys.revoke(key_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(HttpErrorEnvelope {
                code: error_codes::NOT_FOUND.to_owned(),
                message: "key not found or already revoked".to_owned(),
                details: None,
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(HttpErrorEnvelope {
                code: error_codes::INTERNAL_ERROR.to_owned(),
                message: e.to_string(),
                details: None,
            }),
        )
            .into_response(),
    }
}
