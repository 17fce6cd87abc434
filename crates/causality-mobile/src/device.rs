//! Stable device identity.
//!
//! The device id is a UUID minted on first use, cached in memory, and (in
//! persistent mode) stored in `device_info` so it survives restarts.
//! Privacy/reset flows replace it wholesale via `regenerate`.

use crate::queue::{PersistentQueue, QueueError};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

pub const DEVICE_ID_KEY: &str = "device_id";

pub struct DeviceManager {
    queue: Arc<PersistentQueue>,
    persistent: bool,
    cached: Mutex<Option<String>>,
}

impl DeviceManager {
    pub fn new(queue: Arc<PersistentQueue>, persistent: bool) -> Self {
        Self {
            queue,
            persistent,
            cached: Mutex::new(None),
        }
    }

    /// The stable device id, minting and persisting one on first call.
    pub fn device_id(&self) -> Result<String, QueueError> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        // Re-check under the lock: another caller may have minted it while
        // we waited.
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        if self.persistent {
            if let Some(stored) = self.queue.get_device_info(DEVICE_ID_KEY)? {
                *cached = Some(stored.clone());
                return Ok(stored);
            }
        }

        let id = Uuid::new_v4().simple().to_string();
        if self.persistent {
            self.queue.set_device_info(DEVICE_ID_KEY, &id)?;
        }
        *cached = Some(id.clone());
        Ok(id)
    }

    /// Replace the device id (full reset / privacy flows).
    pub fn regenerate(&self) -> Result<String, QueueError> {
        let id = Uuid::new_v4().simple().to_string();
        if self.persistent {
            self.queue.set_device_info(DEVICE_ID_KEY, &id)?;
        }
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = Some(id.clone());
        Ok(id)
    }
}
