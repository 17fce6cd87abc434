//! Sliding-window deduplication over idempotency keys.
//!
//! Two bloom filters ("current" and "previous") are rotated every W/2 by a
//! background worker: previous <- current, current <- fresh.  A key written
//! at any point is therefore visible for at least one full window W before
//! it can roll off.  A key counts as duplicate when either set contains it.
//!
//! The engine is an optimization layer: if the rotation worker dies the
//! pipeline stays correct (fewer duplicates caught, never a false reject of
//! a fresh key beyond the configured false-positive rate).

use crate::config::DedupConfig;
use bloomfilter::Bloom;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Windows {
    current: Bloom<str>,
    previous: Bloom<str>,
    rotated_at: Instant,
}

pub struct DedupEngine {
    windows: RwLock<Windows>,
    capacity: usize,
    fp_rate: f64,
    rotation_every: Duration,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DedupEngine {
    pub fn new(cfg: &DedupConfig) -> Self {
        Self {
            windows: RwLock::new(Windows {
                current: Bloom::new_for_fp_rate(cfg.capacity, cfg.fp_rate),
                previous: Bloom::new_for_fp_rate(cfg.capacity, cfg.fp_rate),
                rotated_at: Instant::now(),
            }),
            capacity: cfg.capacity,
            fp_rate: cfg.fp_rate,
            rotation_every: cfg.window / 2,
            stop_tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Report whether `key` has been seen within the sliding window, and
    /// record it when it has not.
    ///
    /// Empty keys always pass through without touching state.  The read
    /// path holds the shared lock; insertion upgrades to the exclusive lock
    /// and re-checks, so concurrent first-writers agree on a single winner.
    pub fn is_duplicate(&self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }

        {
            let w = self.windows.read().unwrap_or_else(PoisonError::into_inner);
            if w.current.check(key) || w.previous.check(key) {
                return true;
            }
        }

        let mut w = self.windows.write().unwrap_or_else(PoisonError::into_inner);
        // Re-check under the exclusive lock: another writer may have won.
        if w.current.check(key) || w.previous.check(key) {
            return true;
        }
        w.current.set(key);
        false
    }

    /// Launch the rotation worker.  Idempotent: a second call replaces a
    /// finished worker but is a no-op while one is running.
    pub async fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.stop_tx.lock().await = Some(stop_tx);

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.rotation_every);
            // The first tick fires immediately; skip it so the initial
            // window gets a full half-period.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            debug!("dedup rotation worker stopping");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        engine.rotate();
                    }
                }
            }
        });
        *worker = Some(handle);
        info!(
            rotation_secs = self.rotation_every.as_secs(),
            capacity = self.capacity,
            "dedup engine started"
        );
    }

    /// Cooperatively stop the rotation worker and wait for it to exit.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().await.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "dedup rotation worker join failed");
            }
        }
    }

    /// previous <- current, current <- fresh.
    pub fn rotate(&self) {
        let fresh = Bloom::new_for_fp_rate(self.capacity, self.fp_rate);
        let mut w = self.windows.write().unwrap_or_else(PoisonError::into_inner);
        w.previous = std::mem::replace(&mut w.current, fresh);
        w.rotated_at = Instant::now();
        debug!("dedup window rotated");
    }

    /// Instant of the last rotation (or engine creation).
    pub fn rotated_at(&self) -> Instant {
        self.windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .rotated_at
    }
}
