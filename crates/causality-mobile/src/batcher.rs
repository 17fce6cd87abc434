//! Dual-trigger flush loop over the persistent queue.
//!
//! - Count trigger: every `add` bumps a pending counter; crossing the batch
//!   size signals the flush channel.  The channel is buffered (capacity 1)
//!   so `add` never blocks the caller thread.
//! - Time trigger: a ticker fires every flush interval.
//!
//! A flush dequeues up to one batch, sends it through the transport, and
//! only then deletes the rows.  Failed sends mark every row for retry and
//! leave them queued, so delivery is at-least-once end to end.

use crate::queue::{PersistentQueue, QueueError};
use crate::transport::{Transport, TransportError};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    #[error("storage: {0}")]
    Storage(#[from] QueueError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("stopped before delivery completed")]
    Stopped,
}

/// Cap on the final flush at stop time.  The queue is durable; a dead
/// network must not hold app shutdown hostage for a full retry schedule.
const FINAL_FLUSH_DEADLINE: Duration = Duration::from_secs(5);

pub struct Batcher {
    queue: Arc<PersistentQueue>,
    transport: Arc<dyn Transport>,
    cfg: BatcherConfig,
    pending: AtomicUsize,
    flush_tx: mpsc::Sender<()>,
    flush_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Serializes concurrent flushes (manual, count-trigger, timer).
    flush_lock: Mutex<()>,
}

impl Batcher {
    pub fn new(
        queue: Arc<PersistentQueue>,
        transport: Arc<dyn Transport>,
        cfg: BatcherConfig,
    ) -> Arc<Self> {
        let (flush_tx, flush_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        Arc::new(Self {
            queue,
            transport,
            cfg,
            pending: AtomicUsize::new(0),
            flush_tx,
            flush_rx: std::sync::Mutex::new(Some(flush_rx)),
            stop_tx,
            stop_rx,
            worker: Mutex::new(None),
            flush_lock: Mutex::new(()),
        })
    }

    /// Spawn the flush loop onto `handle`.  Call once after construction.
    pub fn spawn(self: &Arc<Self>, handle: &tokio::runtime::Handle) {
        let Some(flush_rx) = self
            .flush_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let batcher = Arc::clone(self);
        let worker = handle.spawn(batcher.run_loop(flush_rx));
        if let Ok(mut slot) = self.worker.try_lock() {
            *slot = Some(worker);
        }
    }

    /// Enqueue an event.  Returns immediately; the only I/O is the local
    /// WAL insert.  Never blocks on the network or the flush loop.
    pub fn add(&self, event_json: &str, idempotency_key: &str) -> Result<(), QueueError> {
        self.queue.enqueue(event_json, idempotency_key)?;
        let pending = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        if pending >= self.cfg.batch_size {
            // Buffered channel: if a signal is already queued this is a
            // no-op, which is exactly the coalescing we want.
            let _ = self.flush_tx.try_send(());
        }
        Ok(())
    }

    /// Drain one batch to the transport.
    ///
    /// Delete-after-send: rows leave the queue only once the transport
    /// confirms delivery; failures mark every row for retry instead.
    /// Stopping the batcher aborts the in-flight request and any backoff
    /// sleep; the rows stay queued for the next launch.
    pub async fn flush(&self) -> Result<(), FlushError> {
        let mut stop_rx = self.stop_rx.clone();
        tokio::select! {
            result = self.flush_inner() => result,
            _ = async {
                while !*stop_rx.borrow() {
                    if stop_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => Err(FlushError::Stopped),
        }
    }

    async fn flush_inner(&self) -> Result<(), FlushError> {
        let _guard = self.flush_lock.lock().await;
        self.pending.store(0, Ordering::SeqCst);

        let rows = self.queue.dequeue_batch(self.cfg.batch_size)?;
        if rows.is_empty() {
            return Ok(());
        }

        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let events: Vec<String> = rows.into_iter().map(|r| r.event_json).collect();

        match self.transport.send_batch(&events).await {
            Ok(()) => {
                self.queue.delete(&ids)?;
                debug!(delivered = ids.len(), "batch flushed");
                Ok(())
            }
            Err(e) => {
                for id in &ids {
                    if let Err(mark_err) = self.queue.mark_retry(*id) {
                        warn!(id, error = %mark_err, "mark_retry failed");
                    }
                }
                warn!(queued = ids.len(), error = %e, "flush failed, rows remain queued");
                Err(e.into())
            }
        }
    }

    /// Events currently waiting in the queue.
    pub fn queued(&self) -> Result<i64, QueueError> {
        self.queue.count()
    }

    /// Stop the flush loop: one final flush runs before the task exits.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "flush loop join failed");
            }
        }
    }

    async fn run_loop(self: Arc<Self>, mut flush_rx: mpsc::Receiver<()>) {
        let mut stop_rx = self.stop_rx.clone();
        let mut ticker = tokio::time::interval(self.cfg.flush_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        debug!(error = %e, "interval flush failed");
                    }
                }
                Some(()) = flush_rx.recv() => {
                    if let Err(e) = self.flush().await {
                        debug!(error = %e, "count-triggered flush failed");
                    }
                }
            }
        }
        // Final flush: one bounded delivery attempt before exit.  It runs
        // after the stop signal, so it bypasses the stop race and relies
        // on the deadline instead.
        match tokio::time::timeout(FINAL_FLUSH_DEADLINE, self.flush_inner()).await {
            Ok(Err(e)) => debug!(error = %e, "final flush failed"),
            Err(_) => debug!("final flush hit its deadline, rows remain queued"),
            Ok(Ok(())) => {}
        }
    }
}
