//! SDK error taxonomy and the asynchronous error-callback registry.
//!
//! Every error maps to a stable code plus a severity.  Callbacks fire only
//! for warning severity and above, always from a freshly spawned task so a
//! slow host callback can never stall the SDK caller.  Debug severity
//! never fires callbacks, debug mode or not — debug mode only controls log
//! verbosity.

use crate::batcher::FlushError;
use crate::queue::QueueError;
use crate::transport::TransportError;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Critical = 3,
}

impl Severity {
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    #[error("SDK is not initialized")]
    NotInitialized,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("event type is required")]
    EventTypeRequired,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("storage: {0}")]
    Storage(#[from] QueueError),
    #[error("network: {0}")]
    Network(String),
    #[error("server rejected request: {0}")]
    Server(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl SdkError {
    pub fn code(&self) -> &'static str {
        match self {
            SdkError::NotInitialized => "NOT_INITIALIZED",
            SdkError::InvalidConfig(_) => "INVALID_CONFIG",
            SdkError::InvalidJson(_) => "INVALID_JSON",
            SdkError::EventTypeRequired => "EVENT_TYPE_REQUIRED",
            SdkError::InvalidArgument(_) => "INVALID_ARGUMENT",
            SdkError::Storage(_) => "DISK_ERROR",
            SdkError::Network(_) => "NETWORK_ERROR",
            SdkError::Server(_) => "SERVER_ERROR",
            SdkError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            SdkError::NotInitialized => Severity::Critical,
            SdkError::InvalidConfig(_) => Severity::Critical,
            SdkError::InvalidJson(_)
            | SdkError::EventTypeRequired
            | SdkError::InvalidArgument(_) => Severity::Info,
            SdkError::Storage(_) => Severity::Warning,
            SdkError::Network(_) | SdkError::Server(_) => Severity::Warning,
            SdkError::Internal(_) => Severity::Critical,
        }
    }
}

impl From<FlushError> for SdkError {
    fn from(e: FlushError) -> Self {
        match e {
            FlushError::Storage(e) => SdkError::Storage(e),
            FlushError::Transport(TransportError::Client { status }) => {
                SdkError::Server(format!("HTTP {}", status))
            }
            FlushError::Transport(e) => SdkError::Network(e.to_string()),
            FlushError::Stopped => SdkError::Network("stopped before delivery completed".to_owned()),
        }
    }
}

// ---------------------------------------------------------------------------
// Callback registry
// ---------------------------------------------------------------------------

/// `(code, message, severity)`.
pub type ErrorCallback = Arc<dyn Fn(&str, &str, i64) + Send + Sync>;

#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: Mutex<Vec<ErrorCallback>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: ErrorCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Fire-and-forget notification on `handle`.  Returns immediately; the
    /// callbacks run on the runtime, never on the caller thread.  Debug
    /// and info severities are filtered here.
    pub fn notify(&self, handle: &tokio::runtime::Handle, error: &SdkError) {
        let severity = error.severity();
        if severity < Severity::Warning {
            return;
        }
        let code = error.code().to_owned();
        let message = error.to_string();
        let callbacks: Vec<ErrorCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            let code = code.clone();
            let message = message.clone();
            handle.spawn(async move {
                callback(&code, &message, severity.as_i64());
            });
        }
    }
}
