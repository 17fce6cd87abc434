//! Sink configuration loading.
//!
//! TOML is the sole config source; `NATS_URL` and `LOG_LEVEL` env overrides
//! are resolved in `main`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `[storage] backend` of `"s3"` requires `bucket`

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SinkServiceConfig {
    pub schema_version: u32,
    /// Bind address for `/metrics`, `/healthz`, `/readyz`.
    pub addr: String,
    pub stream: StreamConfig,
    pub sink: SinkConfig,
    pub storage: StorageConfig,
    pub compaction: CompactionConfig,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub stream_name: String,
    pub consumer_name: String,
    pub dlq_stream_name: String,
    /// Delivery attempts before the broker emits a max-deliveries advisory.
    pub max_deliver: i64,
    /// Main stream retention.
    pub max_age: Duration,
    /// DLQ retention; held significantly longer for post-hoc investigation.
    pub dlq_max_age: Duration,
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub workers: usize,
    pub fetch_max: usize,
    pub fetch_wait: Duration,
    /// Size trigger: flush once the shared batch reaches this many events.
    pub flush_max_events: usize,
    /// Time trigger: flush when this long has passed since the last flush.
    pub flush_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub bucket: String,
    /// Root prefix for partitioned objects, e.g. `events`.
    pub prefix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    S3,
    Memory,
}

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Merged outputs aim for this size without exceeding it.
    pub target_bytes: u64,
    /// Files below this size are merge candidates.
    pub small_threshold_bytes: u64,
    /// Hours behind the current wall-clock hour a partition must be before
    /// it is considered cold.  Minimum 1; 2 is the conservative default.
    pub lag_hours: u32,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    addr: Option<String>,
    stream: Option<RawStreamConfig>,
    sink: Option<RawSinkConfig>,
    storage: Option<RawStorageConfig>,
    compaction: Option<RawCompactionConfig>,
}

#[derive(Debug, Deserialize)]
struct RawStreamConfig {
    url: Option<String>,
    stream_name: Option<String>,
    consumer_name: Option<String>,
    dlq_stream_name: Option<String>,
    max_deliver: Option<i64>,
    max_age_hours: Option<u64>,
    dlq_max_age_days: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawSinkConfig {
    workers: Option<usize>,
    fetch_max: Option<usize>,
    fetch_wait_ms: Option<u64>,
    flush_max_events: Option<usize>,
    flush_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawStorageConfig {
    backend: Option<String>,
    bucket: Option<String>,
    prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCompactionConfig {
    enabled: Option<bool>,
    interval_secs: Option<u64>,
    target_bytes: Option<u64>,
    small_threshold_bytes: Option<u64>,
    lag_hours: Option<u32>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<SinkServiceConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<SinkServiceConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let stream = {
        let s = raw.stream;
        let get = |f: fn(&RawStreamConfig) -> Option<String>, default: &str| {
            s.as_ref().and_then(f).unwrap_or_else(|| default.to_owned())
        };
        StreamConfig {
            url: get(|s| s.url.clone(), "nats://127.0.0.1:4222"),
            stream_name: get(|s| s.stream_name.clone(), "CAUSALITY_EVENTS"),
            consumer_name: get(|s| s.consumer_name.clone(), "warehouse-sink"),
            dlq_stream_name: get(|s| s.dlq_stream_name.clone(), "CAUSALITY_EVENTS_DLQ"),
            max_deliver: s.as_ref().and_then(|s| s.max_deliver).unwrap_or(5),
            max_age: Duration::from_secs(
                s.as_ref().and_then(|s| s.max_age_hours).unwrap_or(72) * 3600,
            ),
            dlq_max_age: Duration::from_secs(
                s.as_ref().and_then(|s| s.dlq_max_age_days).unwrap_or(30) * 24 * 3600,
            ),
        }
    };

    let sink = {
        let s = raw.sink;
        let workers = s.as_ref().and_then(|s| s.workers).unwrap_or(4);
        if workers == 0 {
            return Err(ConfigError::InvalidValue(
                "sink.workers must be > 0".to_owned(),
            ));
        }
        SinkConfig {
            workers,
            fetch_max: s.as_ref().and_then(|s| s.fetch_max).unwrap_or(100),
            fetch_wait: Duration::from_millis(
                s.as_ref().and_then(|s| s.fetch_wait_ms).unwrap_or(2_000),
            ),
            flush_max_events: s.as_ref().and_then(|s| s.flush_max_events).unwrap_or(5_000),
            flush_interval: Duration::from_millis(
                s.as_ref().and_then(|s| s.flush_interval_ms).unwrap_or(30_000),
            ),
        }
    };

    let storage = {
        let s = raw.storage;
        let backend = match s
            .as_ref()
            .and_then(|s| s.backend.clone())
            .unwrap_or_else(|| "s3".to_owned())
            .as_str()
        {
            "s3" => StorageBackend::S3,
            "memory" => StorageBackend::Memory,
            other => {
                return Err(ConfigError::InvalidValue(format!(
                    "storage.backend must be \"s3\" or \"memory\", got \"{}\"",
                    other
                )));
            }
        };
        let bucket = s
            .as_ref()
            .and_then(|s| s.bucket.clone())
            .unwrap_or_default();
        if backend == StorageBackend::S3 && bucket.is_empty() {
            return Err(ConfigError::MissingField("storage.bucket".to_owned()));
        }
        StorageConfig {
            backend,
            bucket,
            prefix: s
                .as_ref()
                .and_then(|s| s.prefix.clone())
                .unwrap_or_else(|| "events".to_owned()),
        }
    };

    let compaction = {
        let c = raw.compaction;
        let lag_hours = c.as_ref().and_then(|c| c.lag_hours).unwrap_or(2);
        if lag_hours == 0 {
            return Err(ConfigError::InvalidValue(
                "compaction.lag_hours must be >= 1".to_owned(),
            ));
        }
        CompactionConfig {
            enabled: c.as_ref().and_then(|c| c.enabled).unwrap_or(true),
            interval: Duration::from_secs(
                c.as_ref().and_then(|c| c.interval_secs).unwrap_or(3_600),
            ),
            target_bytes: c
                .as_ref()
                .and_then(|c| c.target_bytes)
                .unwrap_or(128 * 1024 * 1024),
            small_threshold_bytes: c
                .as_ref()
                .and_then(|c| c.small_threshold_bytes)
                .unwrap_or(32 * 1024 * 1024),
            lag_hours,
        }
    };

    Ok(SinkServiceConfig {
        schema_version,
        addr: raw.addr.unwrap_or_else(|| "0.0.0.0:8081".to_owned()),
        stream,
        sink,
        storage,
        compaction,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
