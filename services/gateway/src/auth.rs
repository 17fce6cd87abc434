//! API-key authentication.
//!
//! Clients send the raw key in `X-API-Key`.  The gateway hashes it with
//! SHA-256 and looks up an active row by the hex digest; the digest column
//! carries a partial unique index over non-revoked rows so the hot path is
//! one index probe.  The stored digest is re-compared in constant time
//! before the request is admitted.
//!
//! On success the tenant (`app_id`) is injected into request extensions so
//! downstream layers — the per-key rate limiter first among them — can key
//! on it.

use crate::state::AppState;
use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use causality_protocol::{error_codes, HttpErrorEnvelope};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub const API_KEY_HEADER: &str = "x-api-key";

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// SHA-256 hex digest of a raw API key.
pub fn hash_key(raw_key: &str) -> String {
    hex::encode(Sha256::digest(raw_key.as_bytes()))
}

/// Constant-time equality over two digest strings.
///
/// Length differences return early; lengths are not secret (all digests are
/// 64 hex chars).
pub fn digest_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ---------------------------------------------------------------------------
// Key store
// ---------------------------------------------------------------------------

/// Tenant identity resolved from an active API key.
#[derive(Debug, Clone)]
pub struct ApiKeyIdentity {
    pub key_id: Uuid,
    pub app_id: String,
    /// Stored digest, for the constant-time re-check.
    pub key_hash: String,
}

/// One row of the admin key listing.  Never carries the hash.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiKeyRecord {
    pub key_id: Uuid,
    pub app_id: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("a key with this value already exists")]
    Conflict,
}

/// Credential storage seam.  Production uses Postgres; tests use the
/// in-memory implementation so the full middleware stack runs hermetically.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn lookup_active(&self, key_hash: &str) -> Result<Option<ApiKeyIdentity>, KeyStoreError>;
    async fn create(
        &self,
        app_id: &str,
        display_name: &str,
        key_hash: &str,
    ) -> Result<ApiKeyRecord, KeyStoreError>;
    async fn list(&self, app_id: Option<&str>) -> Result<Vec<ApiKeyRecord>, KeyStoreError>;
    /// Returns false when the key does not exist or is already revoked.
    async fn revoke(&self, key_id: Uuid) -> Result<bool, KeyStoreError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub struct PgApiKeyStore {
    pool: PgPool,
}

impl PgApiKeyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApiKeyStore for PgApiKeyStore {
    async fn lookup_active(&self, key_hash: &str) -> Result<Option<ApiKeyIdentity>, KeyStoreError> {
        let row = sqlx::query(
            "SELECT key_id, app_id, key_hash FROM api_keys
             WHERE key_hash = $1 AND revoked_at IS NULL",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| KeyStoreError::Database(e.to_string()))?;

        Ok(row.map(|r| ApiKeyIdentity {
            key_id: r.get("key_id"),
            app_id: r.get("app_id"),
            key_hash: r.get::<String, _>("key_hash").trim().to_owned(),
        }))
    }

    async fn create(
        &self,
        app_id: &str,
        display_name: &str,
        key_hash: &str,
    ) -> Result<ApiKeyRecord, KeyStoreError> {
        let row = sqlx::query(
            "INSERT INTO api_keys (app_id, display_name, key_hash)
             VALUES ($1, $2, $3)
             RETURNING key_id, created_at",
        )
        .bind(app_id)
        .bind(display_name)
        .bind(key_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if e.as_database_error()
                .is_some_and(|db| db.is_unique_violation())
            {
                KeyStoreError::Conflict
            } else {
                KeyStoreError::Database(e.to_string())
            }
        })?;

        Ok(ApiKeyRecord {
            key_id: row.get("key_id"),
            app_id: app_id.to_owned(),
            display_name: display_name.to_owned(),
            created_at: row.get("created_at"),
            revoked: false,
        })
    }

    async fn list(&self, app_id: Option<&str>) -> Result<Vec<ApiKeyRecord>, KeyStoreError> {
        let rows = match app_id {
            Some(app) => {
                sqlx::query(
                    "SELECT key_id, app_id, display_name, created_at,
                            (revoked_at IS NOT NULL) AS revoked
                     FROM api_keys WHERE app_id = $1 ORDER BY created_at ASC",
                )
                .bind(app)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT key_id, app_id, display_name, created_at,
                            (revoked_at IS NOT NULL) AS revoked
                     FROM api_keys ORDER BY created_at ASC",
                )
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| KeyStoreError::Database(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|r| ApiKeyRecord {
                key_id: r.get("key_id"),
                app_id: r.get("app_id"),
                display_name: r.get("display_name"),
                created_at: r.get("created_at"),
                revoked: r.get("revoked"),
            })
            .collect())
    }

    async fn revoke(&self, key_id: Uuid) -> Result<bool, KeyStoreError> {
        let result = sqlx::query(
            "UPDATE api_keys SET revoked_at = now()
             WHERE key_id = $1 AND revoked_at IS NULL",
        )
        .bind(key_id)
        .execute(&self.pool)
        .await
        .map_err(|e| KeyStoreError::Database(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests, local development)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryKeyStore {
    rows: tokio::sync::RwLock<Vec<MemoryRow>>,
}

struct MemoryRow {
    record: ApiKeyRecord,
    key_hash: String,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApiKeyStore for InMemoryKeyStore {
    async fn lookup_active(&self, key_hash: &str) -> Result<Option<ApiKeyIdentity>, KeyStoreError> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .find(|r| !r.record.revoked && r.key_hash == key_hash)
            .map(|r| ApiKeyIdentity {
                key_id: r.record.key_id,
                app_id: r.record.app_id.clone(),
                key_hash: r.key_hash.clone(),
            }))
    }

    async fn create(
        &self,
        app_id: &str,
        display_name: &str,
        key_hash: &str,
    ) -> Result<ApiKeyRecord, KeyStoreError> {
        let mut rows = self.rows.write().await;
        if rows.iter().any(|r| r.key_hash == key_hash) {
            return Err(KeyStoreError::Conflict);
        }
        let record = ApiKeyRecord {
            key_id: Uuid::new_v4(),
            app_id: app_id.to_owned(),
            display_name: display_name.to_owned(),
            created_at: Utc::now(),
            revoked: false,
        };
        rows.push(MemoryRow {
            record: record.clone(),
            key_hash: key_hash.to_owned(),
        });
        Ok(record)
    }

    async fn list(&self, app_id: Option<&str>) -> Result<Vec<ApiKeyRecord>, KeyStoreError> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|r| app_id.is_none_or(|a| r.record.app_id == a))
            .map(|r| r.record.clone())
            .collect())
    }

    async fn revoke(&self, key_id: Uuid) -> Result<bool, KeyStoreError> {
        let mut rows = self.rows.write().await;
        match rows
            .iter_mut()
            .find(|r| r.record.key_id == key_id && !r.record.revoked)
        {
            Some(row) => {
                row.record.revoked = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Tenant identity injected into request extensions after authentication.
#[derive(Debug, Clone)]
pub struct Tenant {
    pub app_id: String,
}

/// Require a valid `X-API-Key` header; reject with an opaque 401 otherwise.
pub async fn require_api_key(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let raw_key = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if raw_key.is_empty() {
        return unauthorized();
    }

    let digest = hash_key(raw_key);
    let identity = match state.keys.lookup_active(&digest).await {
        Ok(Some(identity)) => identity,
        Ok(None) => return unauthorized(),
        Err(e) => {
            tracing::error!(error = %e, "api key lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(HttpErrorEnvelope {
                    code: error_codes::INTERNAL_ERROR.to_owned(),
                    message: "credential store unavailable".to_owned(),
                    details: None,
                }),
            )
                .into_response();
        }
    };

    if !digest_eq(&digest, &identity.key_hash) {
        return unauthorized();
    }

    req.extensions_mut().insert(Tenant {
        app_id: identity.app_id,
    });
    next.run(req).await
}

fn unauthorized() -> Response {
    // Deliberately opaque: do not reveal whether the key exists or is revoked.
    (
        StatusCode::UNAUTHORIZED,
        Json(HttpErrorEnvelope {
            code: error_codes::AUTH_FAILED.to_owned(),
            message: "invalid credentials".to_owned(),
            details: None,
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_64_hex_chars() {
        let digest = hash_key("some-raw-key");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn digest_eq_matches_only_identical_digests() {
        let a = hash_key("key-a");
        let b = hash_key("key-b");
        assert!(digest_eq(&a, &a));
        assert!(!digest_eq(&a, &b));
        assert!(!digest_eq(&a, &a[..32]));
    }

    #[tokio::test]
    async fn memory_store_lookup_honors_revocation() {
        let store = InMemoryKeyStore::new();
        let digest = hash_key("raw");
        let record = store.create("app-1", "ci key", &digest).await.unwrap();

        let found = store.lookup_active(&digest).await.unwrap();
        assert_eq!(found.unwrap().app_id, "app-1");

        assert!(store.revoke(record.key_id).await.unwrap());
        assert!(store.lookup_active(&digest).await.unwrap().is_none());
        // Second revoke is a no-op.
        assert!(!store.revoke(record.key_id).await.unwrap());
    }

    #[tokio::test]
    async fn memory_store_rejects_duplicate_hashes() {
        let store = InMemoryKeyStore::new();
        let digest = hash_key("raw");
        store.create("app-1", "", &digest).await.unwrap();
        let err = store.create("app-2", "", &digest).await.unwrap_err();
        assert!(matches!(err, KeyStoreError::Conflict));
    }
}
