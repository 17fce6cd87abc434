//! User identity persistence.
//!
//! The identity is a small JSON blob under `device_info[user_identity]`:
//! `{user_id, traits, aliases}`.  Reads hand out deep copies so callers
//! can never mutate the cached state behind the manager's back.

use crate::error::SdkError;
use crate::queue::PersistentQueue;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

pub const USER_IDENTITY_KEY: &str = "user_identity";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    #[serde(default)]
    pub traits: serde_json::Value,
    #[serde(default)]
    pub aliases: Vec<String>,
}

pub struct IdentityManager {
    queue: Arc<PersistentQueue>,
    cached: Mutex<Option<UserIdentity>>,
}

impl IdentityManager {
    pub fn new(queue: Arc<PersistentQueue>) -> Self {
        Self {
            queue,
            cached: Mutex::new(None),
        }
    }

    /// Restore persisted identity at SDK init.  Absence is not an error on
    /// first launch; a corrupt blob is surfaced.
    pub fn load_from_db(&self) -> Result<(), SdkError> {
        let Some(raw) = self.queue.get_device_info(USER_IDENTITY_KEY)? else {
            return Ok(());
        };
        let identity: UserIdentity = serde_json::from_str(&raw)
            .map_err(|e| SdkError::InvalidJson(format!("stored identity: {}", e)))?;
        *self.lock() = Some(identity);
        Ok(())
    }

    pub fn set_user(
        &self,
        user_id: &str,
        traits: serde_json::Value,
        aliases: Vec<String>,
    ) -> Result<(), SdkError> {
        if user_id.is_empty() {
            return Err(SdkError::InvalidArgument(
                "user_id must not be empty".to_owned(),
            ));
        }
        let identity = UserIdentity {
            user_id: user_id.to_owned(),
            traits,
            aliases,
        };
        let blob = serde_json::to_string(&identity)
            .map_err(|e| SdkError::InvalidJson(e.to_string()))?;
        self.queue.set_device_info(USER_IDENTITY_KEY, &blob)?;
        *self.lock() = Some(identity);
        Ok(())
    }

    /// Deep copy of the current identity, if any.
    pub fn get_user(&self) -> Option<UserIdentity> {
        self.lock().clone()
    }

    pub fn user_id(&self) -> String {
        self.lock()
            .as_ref()
            .map(|identity| identity.user_id.clone())
            .unwrap_or_default()
    }

    /// Clear in-memory and persisted identity.
    pub fn reset(&self) -> Result<(), SdkError> {
        self.queue.delete_device_info(USER_IDENTITY_KEY)?;
        *self.lock() = None;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<UserIdentity>> {
        self.cached.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
