//! Durable queue of sync tasks.
//!
//! Tasks reference a cache key and an operation. At most one pending task
//! exists per `(key, operation)`; enqueueing a duplicate is a no-op. A task
//! handed to the worker is in flight and no longer counts as pending, so a
//! write that lands during its upload queues a follow-up task. Tasks that
//! exhaust their attempts move to the dead-letter state and stay there until
//! retried by hand.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::bucket::{CacheKey, CoordinateBucket, GridResolution};
use crate::error::WeatherResult;

/// Direction of a sync task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    /// Push the cached record to the sync backend
    Upload,
    /// Pull the backend's document into the cache
    Download,
}

impl SyncOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "download" => Self::Download,
            _ => Self::Upload,
        }
    }
}

/// A queued task with metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncTask {
    pub id: i64,
    pub key: CacheKey,
    pub operation: SyncOperation,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
}

const PENDING: &str = "pending";
const IN_FLIGHT: &str = "inflight";
const DEAD: &str = "dead";

const TASK_COLUMNS: &str =
    "id, cells, lat_idx, lon_idx, horizon, operation, created_at, attempts, last_error, next_attempt_at";

/// Sync queue backed by SQLite.
pub struct SyncQueue {
    conn: Mutex<Connection>,
}

impl SyncQueue {
    /// Open (or create) the queue at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> WeatherResult<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// In-memory queue (for testing).
    pub fn in_memory() -> WeatherResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> WeatherResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cells INTEGER NOT NULL,
                lat_idx INTEGER NOT NULL,
                lon_idx INTEGER NOT NULL,
                horizon INTEGER NOT NULL,
                operation TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                next_attempt_at INTEGER NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_tasks_pending_key
                ON sync_tasks(cells, lat_idx, lon_idx, horizon, operation)
                WHERE state = 'pending';
            CREATE INDEX IF NOT EXISTS idx_sync_tasks_due ON sync_tasks(state, next_attempt_at);
            "#,
        )?;
        Self::release_in_flight(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Queue a task. Returns the new id, or `None` when an identical task is
    /// already pending.
    pub fn enqueue(
        &self,
        key: &CacheKey,
        operation: SyncOperation,
        now: DateTime<Utc>,
    ) -> WeatherResult<Option<i64>> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO sync_tasks \
             (cells, lat_idx, lon_idx, horizon, operation, state, created_at, next_attempt_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6)",
            params![
                key.bucket.cells_per_degree,
                key.bucket.lat_index,
                key.bucket.lon_index,
                key.horizon,
                operation.as_str(),
                now.timestamp_millis(),
            ],
        )?;

        if inserted == 0 {
            tracing::debug!("Sync task {} {} already pending", operation.as_str(), key);
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    /// Claim the oldest pending task whose backoff has elapsed.
    ///
    /// The task moves to the in-flight state until it is completed, fails or
    /// is dead-lettered.
    pub fn next_due(&self, now: DateTime<Utc>) -> WeatherResult<Option<SyncTask>> {
        let conn = self.conn.lock();
        let task = conn
            .query_row(
                &format!(
                    "SELECT {} FROM sync_tasks \
                     WHERE state = 'pending' AND next_attempt_at <= ?1 \
                     ORDER BY next_attempt_at ASC, id ASC LIMIT 1",
                    TASK_COLUMNS
                ),
                params![now.timestamp_millis()],
                Self::row_to_task,
            )
            .optional()?;

        if let Some(task) = &task {
            conn.execute(
                "UPDATE sync_tasks SET state = 'inflight' WHERE id = ?1",
                params![task.id],
            )?;
        }
        Ok(task)
    }

    /// Return tasks left in flight by an interrupted worker to the queue.
    fn release_in_flight(conn: &Connection) -> WeatherResult<()> {
        let released = conn.execute(
            "UPDATE OR IGNORE sync_tasks SET state = 'pending' WHERE state = 'inflight'",
            [],
        )?;
        // Whatever is left already has a pending twin.
        conn.execute("DELETE FROM sync_tasks WHERE state = 'inflight'", [])?;
        if released > 0 {
            tracing::info!("Requeued {} interrupted sync tasks", released);
        }
        Ok(())
    }

    /// When the next pending task becomes due, if any.
    pub fn next_wakeup(&self) -> WeatherResult<Option<DateTime<Utc>>> {
        let ms: Option<i64> = self.conn.lock().query_row(
            "SELECT MIN(next_attempt_at) FROM sync_tasks WHERE state = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(ms.and_then(DateTime::from_timestamp_millis))
    }

    /// Remove a finished task.
    pub fn complete(&self, id: i64) -> WeatherResult<()> {
        self.conn
            .lock()
            .execute("DELETE FROM sync_tasks WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Record a failed attempt and put the task back in the queue. Returns
    /// the attempt count.
    ///
    /// When a newer task for the same key was queued while this one was in
    /// flight, the newer task takes over and this one is dropped.
    pub fn record_failure(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> WeatherResult<u32> {
        let conn = self.conn.lock();
        let attempts: Option<u32> = conn
            .query_row(
                "SELECT attempts FROM sync_tasks WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(attempts) = attempts.map(|a| a + 1) else {
            return Ok(0);
        };

        let requeued = conn.execute(
            "UPDATE OR IGNORE sync_tasks \
             SET state = 'pending', attempts = ?1, last_error = ?2, next_attempt_at = ?3 \
             WHERE id = ?4",
            params![attempts, error, next_attempt_at.timestamp_millis(), id],
        )?;
        if requeued == 0 {
            tracing::debug!("Sync task {} superseded by a newer pending task", id);
            conn.execute("DELETE FROM sync_tasks WHERE id = ?1", params![id])?;
        }
        Ok(attempts)
    }

    /// Move a task to the dead-letter set.
    pub fn dead_letter(&self, id: i64, error: &str) -> WeatherResult<()> {
        self.conn.lock().execute(
            "UPDATE sync_tasks SET state = 'dead', last_error = ?1 WHERE id = ?2",
            params![error, id],
        )?;
        Ok(())
    }

    pub fn list_pending(&self) -> WeatherResult<Vec<SyncTask>> {
        self.list_in_state(PENDING)
    }

    pub fn list_dead_letters(&self) -> WeatherResult<Vec<SyncTask>> {
        self.list_in_state(DEAD)
    }

    fn list_in_state(&self, state: &str) -> WeatherResult<Vec<SyncTask>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sync_tasks WHERE state = ?1 ORDER BY created_at ASC, id ASC",
            TASK_COLUMNS
        ))?;
        let rows = stmt.query_map(params![state], Self::row_to_task)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Put a dead-lettered task back in the pending queue with a fresh attempt
    /// budget. Returns false when no such dead letter exists.
    pub fn retry_dead_letter(&self, id: i64, now: DateTime<Utc>) -> WeatherResult<bool> {
        let conn = self.conn.lock();
        let revived = conn.execute(
            "UPDATE OR IGNORE sync_tasks \
             SET state = 'pending', attempts = 0, last_error = NULL, next_attempt_at = ?1 \
             WHERE id = ?2 AND state = 'dead'",
            params![now.timestamp_millis(), id],
        )?;
        if revived > 0 {
            return Ok(true);
        }

        // An identical task is already pending and covers this one.
        let removed = conn.execute(
            "DELETE FROM sync_tasks WHERE id = ?1 AND state = 'dead'",
            params![id],
        )?;
        Ok(removed > 0)
    }

    pub fn pending_count(&self) -> WeatherResult<u32> {
        self.count_in_state(PENDING)
    }

    /// Tasks claimed by the worker and not yet finished.
    pub fn in_flight_count(&self) -> WeatherResult<u32> {
        self.count_in_state(IN_FLIGHT)
    }

    pub fn dead_letter_count(&self) -> WeatherResult<u32> {
        self.count_in_state(DEAD)
    }

    fn count_in_state(&self, state: &str) -> WeatherResult<u32> {
        let count: u32 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM sync_tasks WHERE state = ?1",
            params![state],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Clear every task, dead letters included.
    pub fn clear(&self) -> WeatherResult<()> {
        self.conn.lock().execute("DELETE FROM sync_tasks", [])?;
        Ok(())
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<SyncTask> {
        let cells: u32 = row.get(1)?;
        let bucket = CoordinateBucket::new(row.get(2)?, row.get(3)?, GridResolution::new(cells));
        let operation: String = row.get(5)?;

        Ok(SyncTask {
            id: row.get(0)?,
            key: CacheKey::new(bucket, row.get(4)?),
            operation: SyncOperation::parse(&operation),
            created_at: DateTime::from_timestamp_millis(row.get(6)?).unwrap_or_default(),
            attempts: row.get(7)?,
            last_error: row.get(8)?,
            next_attempt_at: DateTime::from_timestamp_millis(row.get(9)?).unwrap_or_default(),
        })
    }
}
