//! Durable SQLite event queue.
//!
//! # Schema
//! - `events`: FIFO rows keyed by auto-increment id with a unique
//!   idempotency-key column; duplicate enqueues are silently ignored.
//! - `device_info`: key/value upsert rows (`device_id`, `user_identity`).
//! - `schema_migrations`: applied migration versions.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, a 5-second busy timeout for
//! concurrent access, foreign_keys=ON.  PRAGMA integrity_check runs at
//! open; returns an error if it fails.
//!
//! # Ownership
//! A row belongs to the queue until transport confirms delivery; the
//! batcher deletes delivered rows and marks failed ones for retry.

use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One pending event row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEvent {
    pub id: i64,
    pub event_json: String,
    pub idempotency_key: String,
    pub created_at: i64,
    pub retry_count: i64,
    pub last_retry_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

/// Forward-only migrations, applied transactionally in order at open.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE events (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             event_json TEXT NOT NULL,
             idempotency_key TEXT NOT NULL UNIQUE,
             created_at INTEGER NOT NULL,
             retry_count INTEGER NOT NULL DEFAULT 0,
             last_retry_at INTEGER NOT NULL DEFAULT 0
         );
         CREATE INDEX idx_events_created_at ON events (created_at);
         CREATE INDEX idx_events_retry ON events (retry_count, last_retry_at);",
    ),
    (
        2,
        "CREATE TABLE device_info (
             key TEXT PRIMARY KEY,
             value TEXT NOT NULL
         );",
    ),
];

// ---------------------------------------------------------------------------
// PersistentQueue
// ---------------------------------------------------------------------------

/// The durable FIFO behind the batcher, plus the small device-info
/// key/value store the device and identity managers share.
pub struct PersistentQueue {
    conn: Mutex<Connection>,
    capacity: usize,
}

impl PersistentQueue {
    /// Open (or create) the queue at `path` and run pending migrations.
    pub fn open(path: &Path, capacity: usize) -> QueueResult<Self> {
        let conn = Connection::open(path)?;
        Self::setup(conn, capacity)
    }

    /// In-memory queue: used by tests and by hosts that opt out of disk
    /// persistence entirely.
    pub fn open_in_memory(capacity: usize) -> QueueResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::setup(conn, capacity)
    }

    fn setup(conn: Connection, capacity: usize) -> QueueResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA foreign_keys=ON;",
        )?;
        let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if result != "ok" {
            return Err(QueueError::IntegrityCheckFailed(result));
        }
        let mut queue = Self {
            conn: Mutex::new(conn),
            capacity: capacity.max(1),
        };
        queue.migrate()?;
        Ok(queue)
    }

    fn migrate(&mut self) -> QueueResult<()> {
        let mut conn = self.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                 version INTEGER PRIMARY KEY,
                 applied_at INTEGER NOT NULL
             )",
            [],
        )?;
        for (version, sql) in MIGRATIONS {
            let applied: i64 = conn.query_row(
                "SELECT COUNT(*) FROM schema_migrations WHERE version = ?1",
                params![version],
                |row| row.get(0),
            )?;
            if applied > 0 {
                continue;
            }
            let tx = conn.transaction()?;
            tx.execute_batch(sql)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                params![version, now_ms()],
            )?;
            tx.commit()?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Event rows
    // -----------------------------------------------------------------------

    /// Insert an event, evicting the oldest rows first when at capacity.
    ///
    /// Returns false when a row with the same idempotency key already
    /// exists (the insert is silently ignored).  The duplicate check runs
    /// before eviction: a re-enqueue must be a true no-op, never evict the
    /// row it duplicates.
    pub fn enqueue(&self, event_json: &str, idempotency_key: &str) -> QueueResult<bool> {
        let conn = self.lock();

        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE idempotency_key = ?1",
            params![idempotency_key],
            |row| row.get(0),
        )?;
        if exists > 0 {
            return Ok(false);
        }

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        let overflow = (count + 1) - self.capacity as i64;
        if overflow > 0 {
            conn.execute(
                "DELETE FROM events WHERE id IN (
                     SELECT id FROM events ORDER BY created_at ASC, id ASC LIMIT ?1
                 )",
                params![overflow],
            )?;
        }

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO events (event_json, idempotency_key, created_at)
             VALUES (?1, ?2, ?3)",
            params![event_json, idempotency_key, now_ms()],
        )?;
        Ok(inserted > 0)
    }

    /// Return up to `n` rows in FIFO order.  Does not delete.
    pub fn dequeue_batch(&self, n: usize) -> QueueResult<Vec<QueuedEvent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, event_json, idempotency_key, created_at, retry_count, last_retry_at
             FROM events
             ORDER BY created_at ASC, id ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![n as i64], |row| {
            Ok(QueuedEvent {
                id: row.get(0)?,
                event_json: row.get(1)?,
                idempotency_key: row.get(2)?,
                created_at: row.get(3)?,
                retry_count: row.get(4)?,
                last_retry_at: row.get(5)?,
            })
        })?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Remove rows after successful delivery.
    pub fn delete(&self, ids: &[i64]) -> QueueResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for id in ids {
            tx.execute("DELETE FROM events WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Record a failed delivery attempt for a row.
    pub fn mark_retry(&self, id: i64) -> QueueResult<()> {
        self.lock().execute(
            "UPDATE events SET retry_count = retry_count + 1, last_retry_at = ?2 WHERE id = ?1",
            params![id, now_ms()],
        )?;
        Ok(())
    }

    pub fn count(&self) -> QueueResult<i64> {
        Ok(self
            .lock()
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?)
    }

    /// Wipe all pending rows (privacy/reset flows).
    pub fn clear(&self) -> QueueResult<()> {
        self.lock().execute("DELETE FROM events", [])?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Device info
    // -----------------------------------------------------------------------

    pub fn get_device_info(&self, key: &str) -> QueueResult<Option<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT value FROM device_info WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        Ok(rows.next().transpose()?)
    }

    pub fn set_device_info(&self, key: &str, value: &str) -> QueueResult<()> {
        self.lock().execute(
            "INSERT INTO device_info (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_device_info(&self, key: &str) -> QueueResult<()> {
        self.lock()
            .execute("DELETE FROM device_info WHERE key = ?1", params![key])?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_once_and_record_versions() {
        let queue = PersistentQueue::open_in_memory(10).expect("open");
        let conn = queue.lock();
        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(versions, MIGRATIONS.len() as i64);
    }

    #[test]
    fn reopening_a_file_queue_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.sqlite3");
        {
            let queue = PersistentQueue::open(&path, 10).unwrap();
            queue.enqueue("{\"type\":\"a\"}", "k1").unwrap();
        }
        let queue = PersistentQueue::open(&path, 10).unwrap();
        assert_eq!(queue.count().unwrap(), 1);
        assert_eq!(queue.dequeue_batch(10).unwrap()[0].idempotency_key, "k1");
    }
}
