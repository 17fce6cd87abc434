//! SDK configuration: one JSON string across the bridge.
//!
//! # Required fields
//! - `api_key`, `endpoint`, `app_id`
//!
//! Optional fields carry defaults and floor values (`batch_size >= 5`,
//! `flush_interval_ms >= 5000`) so a misconfigured host cannot turn the
//! SDK into a per-event network chatterbox.

use crate::error::SdkError;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SdkConfig {
    pub api_key: String,
    pub endpoint: String,
    pub app_id: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_queue_size: usize,
    pub session_timeout: Duration,
    pub debug_mode: bool,
    pub enable_session_tracking: bool,
    pub persistent_device_id: bool,
    /// Directory for the SQLite queue; in-memory when absent.
    pub data_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    api_key: Option<String>,
    endpoint: Option<String>,
    app_id: Option<String>,
    batch_size: Option<usize>,
    flush_interval_ms: Option<u64>,
    max_queue_size: Option<usize>,
    session_timeout_ms: Option<u64>,
    debug_mode: Option<bool>,
    enable_session_tracking: Option<bool>,
    persistent_device_id: Option<bool>,
    data_path: Option<String>,
}

impl SdkConfig {
    pub fn parse(config_json: &str) -> Result<Self, SdkError> {
        let raw: RawConfig = serde_json::from_str(config_json)
            .map_err(|e| SdkError::InvalidConfig(e.to_string()))?;

        let required = |value: Option<String>, field: &str| {
            value
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| SdkError::InvalidConfig(format!("{} is required", field)))
        };
        let api_key = required(raw.api_key, "api_key")?;
        let endpoint = required(raw.endpoint, "endpoint")?;
        let app_id = required(raw.app_id, "app_id")?;

        let batch_size = raw.batch_size.unwrap_or(20);
        if batch_size < 5 {
            return Err(SdkError::InvalidConfig(
                "batch_size must be >= 5".to_owned(),
            ));
        }
        let flush_interval_ms = raw.flush_interval_ms.unwrap_or(30_000);
        if flush_interval_ms < 5_000 {
            return Err(SdkError::InvalidConfig(
                "flush_interval_ms must be >= 5000".to_owned(),
            ));
        }
        let max_queue_size = raw.max_queue_size.unwrap_or(1_000);
        if max_queue_size == 0 {
            return Err(SdkError::InvalidConfig(
                "max_queue_size must be > 0".to_owned(),
            ));
        }

        Ok(Self {
            api_key,
            endpoint,
            app_id,
            batch_size,
            flush_interval: Duration::from_millis(flush_interval_ms),
            max_queue_size,
            session_timeout: Duration::from_millis(raw.session_timeout_ms.unwrap_or(30_000)),
            debug_mode: raw.debug_mode.unwrap_or(false),
            enable_session_tracking: raw.enable_session_tracking.unwrap_or(true),
            persistent_device_id: raw.persistent_device_id.unwrap_or(true),
            data_path: raw.data_path.filter(|p| !p.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_applies_defaults() {
        let cfg = SdkConfig::parse(
            r#"{"api_key":"k","endpoint":"http://localhost:8080","app_id":"a"}"#,
        )
        .expect("minimal config");
        assert_eq!(cfg.batch_size, 20);
        assert_eq!(cfg.flush_interval, Duration::from_secs(30));
        assert_eq!(cfg.session_timeout, Duration::from_secs(30));
        assert!(cfg.enable_session_tracking);
        assert!(cfg.persistent_device_id);
        assert!(!cfg.debug_mode);
        assert!(cfg.data_path.is_none());
    }

    #[test]
    fn missing_required_fields_name_the_field() {
        let err = SdkConfig::parse(r#"{"endpoint":"http://x","app_id":"a"}"#).unwrap_err();
        assert!(err.to_string().contains("api_key"));

        let err = SdkConfig::parse(r#"{"api_key":"k","endpoint":"http://x"}"#).unwrap_err();
        assert!(err.to_string().contains("app_id"));
    }

    #[test]
    fn floors_are_enforced() {
        let err = SdkConfig::parse(
            r#"{"api_key":"k","endpoint":"http://x","app_id":"a","batch_size":2}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("batch_size"));

        let err = SdkConfig::parse(
            r#"{"api_key":"k","endpoint":"http://x","app_id":"a","flush_interval_ms":100}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("flush_interval_ms"));
    }

    #[test]
    fn malformed_json_is_invalid_config() {
        let err = SdkConfig::parse("{not json").unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");
    }
}
