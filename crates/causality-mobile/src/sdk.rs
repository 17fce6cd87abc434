//! SDK façade: the track pipeline and lifecycle surface the bridge wraps.
//!
//! `track` composes metadata (timestamp, idempotency key, app/device/
//! session/user identity) into the caller's event JSON and hands it to the
//! batcher.  It returns in well under a millisecond: the only I/O on the
//! caller thread is the local queue insert; networking lives in the flush
//! loop on the SDK's private runtime.

use crate::backoff::BackoffPolicy;
use crate::batcher::{Batcher, BatcherConfig};
use crate::config::SdkConfig;
use crate::context::PlatformContextStore;
use crate::device::DeviceManager;
use crate::error::{CallbackRegistry, ErrorCallback, SdkError};
use crate::identity::IdentityManager;
use crate::queue::PersistentQueue;
use crate::session::SessionTracker;
use crate::transport::{HttpTransport, Transport};
use chrono::SecondsFormat;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct Sdk {
    config: SdkConfig,
    runtime: tokio::runtime::Runtime,
    queue: Arc<PersistentQueue>,
    batcher: Arc<Batcher>,
    session: Arc<SessionTracker>,
    device: Arc<DeviceManager>,
    identity: Arc<IdentityManager>,
    context: Arc<PlatformContextStore>,
    callbacks: Arc<CallbackRegistry>,
}

impl Sdk {
    /// Initialize from the bridge config JSON.
    pub fn init(config_json: &str) -> Result<Self, SdkError> {
        let config = SdkConfig::parse(config_json)?;
        Self::init_with_transport_factory(config, |cfg| {
            Ok(Arc::new(HttpTransport::new(
                &cfg.endpoint,
                &cfg.api_key,
                BackoffPolicy::default(),
            )?) as Arc<dyn Transport>)
        })
    }

    /// Init with a transport seam; tests inject recording transports.
    pub fn init_with_transport_factory(
        config: SdkConfig,
        transport_factory: impl FnOnce(&SdkConfig) -> Result<Arc<dyn Transport>, crate::transport::TransportError>,
    ) -> Result<Self, SdkError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("causality-sdk")
            .enable_all()
            .build()
            .map_err(|e| SdkError::Internal(format!("runtime: {}", e)))?;

        let queue = match &config.data_path {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .map_err(|e| SdkError::InvalidConfig(format!("data_path '{}': {}", dir, e)))?;
                let path = std::path::Path::new(dir).join("causality.sqlite3");
                Arc::new(PersistentQueue::open(&path, config.max_queue_size)?)
            }
            None => Arc::new(PersistentQueue::open_in_memory(config.max_queue_size)?),
        };

        let transport = transport_factory(&config)
            .map_err(|e| SdkError::Network(e.to_string()))?;
        let batcher = Batcher::new(
            Arc::clone(&queue),
            transport,
            BatcherConfig {
                batch_size: config.batch_size,
                flush_interval: config.flush_interval,
            },
        );
        batcher.spawn(runtime.handle());

        let device = Arc::new(DeviceManager::new(
            Arc::clone(&queue),
            config.persistent_device_id,
        ));
        let identity = Arc::new(IdentityManager::new(Arc::clone(&queue)));
        if let Err(e) = identity.load_from_db() {
            // A corrupt blob must not brick the SDK; identity starts fresh.
            warn!(error = %e, "stored identity unreadable, starting fresh");
        }

        let session = Arc::new(SessionTracker::new(
            config.session_timeout,
            config.enable_session_tracking,
        ));
        let context = Arc::new(PlatformContextStore::new(env!("CARGO_PKG_VERSION")));

        debug!(app_id = %config.app_id, "sdk initialized");
        Ok(Self {
            config,
            runtime,
            queue,
            batcher,
            session,
            device,
            identity,
            context,
            callbacks: Arc::new(CallbackRegistry::new()),
        })
    }

    // -----------------------------------------------------------------------
    // Track pipeline
    // -----------------------------------------------------------------------

    /// Enrich the event JSON with metadata and enqueue it.
    pub fn track(&self, event_json: &str) -> Result<(), SdkError> {
        let mut value: serde_json::Value = serde_json::from_str(event_json)
            .map_err(|e| SdkError::InvalidJson(e.to_string()))?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| SdkError::InvalidJson("event must be a JSON object".to_owned()))?;

        let event_type = obj
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("");
        if event_type.is_empty() {
            return Err(SdkError::EventTypeRequired);
        }

        let idempotency_key = Uuid::new_v4().to_string();
        let device_id = self.device.device_id()?;

        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "timestamp".to_owned(),
            serde_json::Value::String(
                chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            ),
        );
        metadata.insert(
            "idempotency_key".to_owned(),
            serde_json::Value::String(idempotency_key.clone()),
        );
        metadata.insert(
            "app_id".to_owned(),
            serde_json::Value::String(self.config.app_id.clone()),
        );
        metadata.insert("device_id".to_owned(), serde_json::Value::String(device_id));
        if self.session.is_enabled() {
            let session_id = self.session.record_activity();
            if !session_id.is_empty() {
                metadata.insert(
                    "session_id".to_owned(),
                    serde_json::Value::String(session_id),
                );
            }
        }
        let user_id = self.identity.user_id();
        if !user_id.is_empty() {
            metadata.insert("user_id".to_owned(), serde_json::Value::String(user_id));
        }
        obj.insert("metadata".to_owned(), serde_json::Value::Object(metadata));

        let context = serde_json::to_value(self.context.collect())
            .map_err(|e| SdkError::InvalidJson(e.to_string()))?;
        obj.insert("context".to_owned(), context);

        let enriched = value.to_string();
        if let Err(e) = self.batcher.add(&enriched, &idempotency_key) {
            let error = SdkError::from(e);
            self.notify_error_callbacks(&error);
            return Err(error);
        }
        Ok(())
    }

    /// Validate `event_type` against the closed category set, then track
    /// `{type, properties}`.
    pub fn track_typed(&self, event_type: &str, properties_json: &str) -> Result<(), SdkError> {
        if !causality_protocol::is_known_category(event_type) {
            return Err(SdkError::EventTypeRequired);
        }
        let properties: serde_json::Value = if properties_json.trim().is_empty() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(properties_json)
                .map_err(|e| SdkError::InvalidJson(e.to_string()))?
        };
        let event = serde_json::json!({
            "type": event_type,
            "properties": properties,
        });
        self.track(&event.to_string())
    }

    // -----------------------------------------------------------------------
    // Lifecycle and identity
    // -----------------------------------------------------------------------

    /// Force an immediate drain.  Blocks the caller until the batch is
    /// delivered or the transport gives up.
    pub fn flush(&self) -> Result<(), SdkError> {
        let result = self.runtime.block_on(self.batcher.flush());
        if let Err(e) = result {
            let error = SdkError::from(e);
            self.notify_error_callbacks(&error);
            return Err(error);
        }
        Ok(())
    }

    /// Persist pending events before possible termination, without
    /// blocking the lifecycle callback.
    pub fn app_did_enter_background(&self) {
        self.session.app_did_enter_background();
        let batcher = Arc::clone(&self.batcher);
        self.runtime.spawn(async move {
            let _ = batcher.flush().await;
        });
    }

    pub fn app_will_enter_foreground(&self) {
        self.session.app_will_enter_foreground();
    }

    pub fn set_user(
        &self,
        user_id: &str,
        traits: serde_json::Value,
        aliases: Vec<String>,
    ) -> Result<(), SdkError> {
        self.identity.set_user(user_id, traits, aliases)
    }

    pub fn user_id(&self) -> String {
        self.identity.user_id()
    }

    pub fn device_id(&self) -> Result<String, SdkError> {
        Ok(self.device.device_id()?)
    }

    pub fn set_session_tracking_enabled(&self, enabled: bool) {
        self.session.set_enabled(enabled);
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.session.current_session_id()
    }

    /// Clear identity, rotate the device id, wipe the queue, and end any
    /// session (privacy/reset flows).
    pub fn reset_all(&self) -> Result<(), SdkError> {
        self.identity.reset()?;
        self.device.regenerate()?;
        self.queue.clear()?;
        self.session.reset();
        Ok(())
    }

    pub fn register_error_callback(&self, callback: ErrorCallback) {
        self.callbacks.register(callback);
    }

    /// Fire-and-forget notification; callbacks run on the SDK runtime.
    pub fn notify_error_callbacks(&self, error: &SdkError) {
        self.callbacks.notify(self.runtime.handle(), error);
    }

    /// Pending events in the durable queue.
    pub fn queue_count(&self) -> Result<i64, SdkError> {
        Ok(self.queue.count()?)
    }

    /// Stop the flush loop (with its final flush).  The runtime itself is
    /// torn down when the `Sdk` drops.
    pub fn shutdown(&self) {
        self.runtime.block_on(self.batcher.stop());
    }

    pub fn config(&self) -> &SdkConfig {
        &self.config
    }

    pub fn platform_context(&self) -> &PlatformContextStore {
        &self.context
    }
}
