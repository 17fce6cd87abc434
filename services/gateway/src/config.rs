//! Gateway configuration loading.
//!
//! TOML is the sole config source; the only environment overrides are
//! secrets and endpoints (`DATABASE_URL`, `NATS_URL`) plus `LOG_LEVEL`,
//! which are resolved in `main`, not here.
//!
//! # Required fields
//! - `schema_version = 1`
//!
//! Everything else has a default tuned for a single-node deployment.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub schema_version: u32,
    pub addr: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub cors: CorsConfig,
    pub max_body_bytes: usize,
    pub max_batch_events: usize,
    pub per_key_rps: u32,
    pub per_key_burst: u32,
    /// Limiters unused for this long are reaped by the sweep task.
    pub limiter_idle: Duration,
    pub enforce_app_id_match: bool,
    pub dedup: DedupConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// `["*"]` means any origin.
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Sliding-window duration W. Keys are visible for at least W.
    pub window: Duration,
    /// Expected key volume per window; size for >= 2x the real rate.
    pub capacity: usize,
    pub fp_rate: f64,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub stream_name: String,
    /// Subject prefix; events publish to `<prefix>.<app_id>`.
    pub subject_prefix: String,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    addr: Option<String>,
    read_timeout_secs: Option<u64>,
    write_timeout_secs: Option<u64>,
    max_body_bytes: Option<usize>,
    max_batch_events: Option<usize>,
    per_key_rps: Option<u32>,
    per_key_burst: Option<u32>,
    limiter_idle_minutes: Option<u64>,
    enforce_app_id_match: Option<bool>,
    cors: Option<RawCorsConfig>,
    dedup: Option<RawDedupConfig>,
    stream: Option<RawStreamConfig>,
}

#[derive(Debug, Deserialize)]
struct RawCorsConfig {
    allowed_origins: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawDedupConfig {
    window_secs: Option<u64>,
    capacity: Option<usize>,
    fp_rate: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawStreamConfig {
    url: Option<String>,
    stream_name: Option<String>,
    subject_prefix: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load gateway config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load gateway config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<GatewayConfig, ConfigError> {
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

    let per_key_rps = raw.per_key_rps.unwrap_or(100);
    let per_key_burst = raw.per_key_burst.unwrap_or(200);
    if per_key_rps == 0 || per_key_burst == 0 {
        return Err(ConfigError::InvalidValue(
            "per_key_rps and per_key_burst must be > 0".to_owned(),
        ));
    }

    let dedup = match raw.dedup {
        Some(d) => {
            let fp_rate = d.fp_rate.unwrap_or(1e-4);
            if !(fp_rate > 0.0 && fp_rate < 1.0) {
                return Err(ConfigError::InvalidValue(format!(
                    "dedup.fp_rate must be in (0, 1), got {}",
                    fp_rate
                )));
            }
            DedupConfig {
                window: Duration::from_secs(d.window_secs.unwrap_or(24 * 60 * 60)),
                capacity: d.capacity.unwrap_or(1_000_000),
                fp_rate,
            }
        }
        None => DedupConfig {
            window: Duration::from_secs(24 * 60 * 60),
            capacity: 1_000_000,
            fp_rate: 1e-4,
        },
    };
    if dedup.window.as_secs() < 2 {
        return Err(ConfigError::InvalidValue(
            "dedup.window_secs must be >= 2".to_owned(),
        ));
    }

    let stream = match raw.stream {
        Some(s) => StreamConfig {
            url: s.url.unwrap_or_else(|| "nats://127.0.0.1:4222".to_owned()),
            stream_name: s.stream_name.unwrap_or_else(|| "CAUSALITY_EVENTS".to_owned()),
            subject_prefix: s.subject_prefix.unwrap_or_else(|| "events".to_owned()),
        },
        None => StreamConfig {
            url: "nats://127.0.0.1:4222".to_owned(),
            stream_name: "CAUSALITY_EVENTS".to_owned(),
            subject_prefix: "events".to_owned(),
        },
    };

    let cors = CorsConfig {
        allowed_origins: raw
            .cors
            .and_then(|c| c.allowed_origins)
            .unwrap_or_else(|| vec!["*".to_owned()]),
    };

    Ok(GatewayConfig {
        schema_version,
        addr: raw.addr.unwrap_or_else(|| "0.0.0.0:8080".to_owned()),
        read_timeout: Duration::from_secs(raw.read_timeout_secs.unwrap_or(15)),
        write_timeout: Duration::from_secs(raw.write_timeout_secs.unwrap_or(15)),
        cors,
        max_body_bytes: raw.max_body_bytes.unwrap_or(1024 * 1024),
        max_batch_events: raw.max_batch_events.unwrap_or(500),
        per_key_rps,
        per_key_burst,
        limiter_idle: Duration::from_secs(raw.limiter_idle_minutes.unwrap_or(10) * 60),
        enforce_app_id_match: raw.enforce_app_id_match.unwrap_or(false),
        dedup,
        stream,
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
