//! SQLite-backed task store: one durable record per submitted document.
//!
//! The store is the single shared-state surface of the service. Concurrent
//! readers (status polls) and the one writer per task (that task's runner)
//! go through an `Arc<Mutex<Connection>>`; blocking SQLite work runs on the
//! Tokio blocking pool, gated by a one-permit semaphore so only one blocking
//! thread waits on the mutex at a time.
//!
//! Status transitions are monotonic and enforced *here*, not by caller
//! discipline: every transition is a guarded `UPDATE ... WHERE status = ?`
//! so a buggy caller cannot skip PROCESSING, revisit a terminal state, or
//! overwrite a result. Records are never deleted by the core.

use crate::error::ExtractError;
use crate::pipeline::client::TokenUsage;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Lifecycle state of a task.
///
/// Only forward transitions exist:
/// `Pending → Processing → {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// True for COMPLETED and FAILED.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(&s.to_ascii_uppercase())
            .ok_or_else(|| ExtractError::InvalidConfig(format!("unknown task status: {s}")))
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked extraction task.
///
/// Invariant: exactly one of {`payload` + token counters} or `error_message`
/// is populated, and only once `status` is terminal. While PENDING or
/// PROCESSING, all of them are `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub filename: String,
    pub submitter: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Raw extracted text, stored byte-for-byte and never parsed by the core.
    pub payload: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub error_message: Option<String>,
}

/// Aggregate counters over all records.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub total_tokens_used: i64,
}

/// SQLite-backed task store. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
    /// Gate concurrent spawn_blocking calls so only one blocking thread
    /// waits on the connection mutex at a time.
    sem: Arc<Semaphore>,
}

impl TaskStore {
    /// Open (or create) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ExtractError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ExtractError::Internal(format!("create store dir: {e}")))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory store. Intended for tests; nothing survives drop.
    pub fn in_memory() -> Result<Self, ExtractError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ExtractError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               task_id TEXT NOT NULL UNIQUE,\
               filename TEXT NOT NULL,\
               submitter TEXT NOT NULL,\
               status TEXT NOT NULL DEFAULT 'PENDING',\
               created_at TEXT NOT NULL,\
               completed_at TEXT,\
               payload TEXT,\
               prompt_tokens INTEGER,\
               completion_tokens INTEGER,\
               total_tokens INTEGER,\
               error_message TEXT\
             );\
             CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);\
             CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            sem: Arc::new(Semaphore::new(1)),
        })
    }

    /// Lock the connection, recovering from mutex poisoning: the SQLite
    /// connection itself stays usable after a panicked holder.
    fn with_conn<F, R>(&self, f: F) -> Result<R, ExtractError>
    where
        F: FnOnce(&Connection) -> Result<R, ExtractError>,
    {
        let guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    /// Run a closure against the connection on the blocking pool.
    async fn run<F, R>(&self, f: F) -> Result<R, ExtractError>
    where
        F: FnOnce(&Connection) -> Result<R, ExtractError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        let _permit = self
            .sem
            .acquire()
            .await
            .map_err(|_| ExtractError::Internal("store semaphore closed".into()))?;
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| ExtractError::Join(e.to_string()))?
    }

    // ── Creation & lookup ────────────────────────────────────────────────

    /// Create a PENDING record and return it. The generated `task_id` is the
    /// caller's sole handle from here on.
    pub async fn create_task(
        &self,
        filename: &str,
        submitter: &str,
    ) -> Result<TaskRecord, ExtractError> {
        let record = TaskRecord {
            task_id: Uuid::new_v4(),
            filename: filename.to_string(),
            submitter: submitter.to_string(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            payload: None,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            error_message: None,
        };
        let inserted = record.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO tasks (task_id, filename, submitter, status, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    inserted.task_id.to_string(),
                    inserted.filename,
                    inserted.submitter,
                    inserted.status.as_str(),
                    inserted.created_at,
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(record)
    }

    /// Fetch a record by id; `None` when unknown.
    pub async fn get(&self, task_id: Uuid) -> Result<Option<TaskRecord>, ExtractError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM tasks WHERE task_id = ?1"
            ))?;
            let mut rows = stmt.query(params![task_id.to_string()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_record(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    // ── Guarded transitions ──────────────────────────────────────────────

    /// PENDING → PROCESSING. The runner calls this before any external work
    /// so concurrent polls observe an in-flight task promptly.
    pub async fn mark_processing(&self, task_id: Uuid) -> Result<(), ExtractError> {
        self.transition(
            task_id,
            TaskStatus::Pending,
            "UPDATE tasks SET status = 'PROCESSING' \
             WHERE task_id = ?1 AND status = 'PENDING'",
            Vec::new(),
        )
        .await
    }

    /// PROCESSING → COMPLETED, recording the payload and all three counters.
    /// Stamps `completed_at`; this is the record's final write.
    pub async fn complete(
        &self,
        task_id: Uuid,
        payload: &str,
        usage: TokenUsage,
    ) -> Result<(), ExtractError> {
        self.transition(
            task_id,
            TaskStatus::Processing,
            "UPDATE tasks SET status = 'COMPLETED', payload = ?2, \
             prompt_tokens = ?3, completion_tokens = ?4, total_tokens = ?5, \
             completed_at = ?6 \
             WHERE task_id = ?1 AND status = 'PROCESSING'",
            vec![
                Box::new(payload.to_string()),
                Box::new(usage.prompt_tokens),
                Box::new(usage.completion_tokens),
                Box::new(usage.total_tokens),
                Box::new(Utc::now()),
            ],
        )
        .await
    }

    /// PROCESSING → FAILED, recording a human-readable cause.
    /// Stamps `completed_at`; this is the record's final write.
    pub async fn fail(&self, task_id: Uuid, error_message: &str) -> Result<(), ExtractError> {
        self.transition(
            task_id,
            TaskStatus::Processing,
            "UPDATE tasks SET status = 'FAILED', error_message = ?2, \
             completed_at = ?3 \
             WHERE task_id = ?1 AND status = 'PROCESSING'",
            vec![
                Box::new(error_message.to_string()),
                Box::new(Utc::now()),
            ],
        )
        .await
    }

    /// Run a guarded transition UPDATE; when zero rows match, report whether
    /// the record is missing or merely in the wrong state.
    async fn transition(
        &self,
        task_id: Uuid,
        expected: TaskStatus,
        sql: &'static str,
        extra: Vec<Box<dyn rusqlite::ToSql + Send>>,
    ) -> Result<(), ExtractError> {
        self.run(move |conn| {
            let id = task_id.to_string();
            let mut values: Vec<&dyn rusqlite::ToSql> = vec![&id];
            for v in &extra {
                values.push(v.as_ref());
            }
            let rows = conn.execute(sql, values.as_slice())?;
            if rows == 1 {
                return Ok(());
            }
            let exists = conn.query_row(
                "SELECT 1 FROM tasks WHERE task_id = ?1",
                params![id],
                |_| Ok(()),
            );
            match exists {
                Ok(()) => Err(ExtractError::InvalidTransition {
                    task_id,
                    expected: expected.as_str(),
                }),
                Err(rusqlite::Error::QueryReturnedNoRows) => {
                    Err(ExtractError::TaskNotFound { task_id })
                }
                Err(e) => Err(ExtractError::Store(e)),
            }
        })
        .await
    }

    // ── Recovery & reporting ─────────────────────────────────────────────

    /// Fail every PROCESSING record created more than `grace_secs` ago.
    ///
    /// Startup reconciliation: a process that died mid-task leaves records
    /// stuck in PROCESSING forever, breaking the "status eventually reaches a
    /// terminal state" contract. Returns the number of records swept.
    pub async fn fail_stale_processing(&self, grace_secs: u64) -> Result<usize, ExtractError> {
        self.run(move |conn| {
            let cutoff = Utc::now() - chrono::Duration::seconds(grace_secs as i64);
            let swept = conn.execute(
                "UPDATE tasks SET status = 'FAILED', \
                 error_message = 'worker terminated before the task finished', \
                 completed_at = ?1 \
                 WHERE status = 'PROCESSING' AND created_at < ?2",
                params![Utc::now(), cutoff],
            )?;
            Ok(swept)
        })
        .await
    }

    /// Newest-first listing, optionally filtered by status.
    pub async fn recent(
        &self,
        limit: usize,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskRecord>, ExtractError> {
        self.run(move |conn| {
            let sql = match status {
                Some(_) => format!(
                    "SELECT {COLUMNS} FROM tasks WHERE status = ?1 \
                     ORDER BY created_at DESC LIMIT ?2"
                ),
                None => format!(
                    "SELECT {COLUMNS} FROM tasks ORDER BY created_at DESC LIMIT ?1"
                ),
            };
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = match status {
                Some(s) => stmt.query(params![s.as_str(), limit as i64])?,
                None => stmt.query(params![limit as i64])?,
            };
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(row_to_record(row)?);
            }
            Ok(records)
        })
        .await
    }

    /// Per-status counts plus total tokens consumed across all tasks.
    pub async fn stats(&self) -> Result<StoreStats, ExtractError> {
        self.run(|conn| {
            let mut stats = StoreStats::default();
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let status: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                match TaskStatus::parse(&status) {
                    Some(TaskStatus::Pending) => stats.pending = count,
                    Some(TaskStatus::Processing) => stats.processing = count,
                    Some(TaskStatus::Completed) => stats.completed = count,
                    Some(TaskStatus::Failed) => stats.failed = count,
                    None => {}
                }
            }
            stats.total_tokens_used = conn.query_row(
                "SELECT COALESCE(SUM(total_tokens), 0) FROM tasks",
                [],
                |row| row.get(0),
            )?;
            Ok(stats)
        })
        .await
    }
}

/// Column list shared by every SELECT so row mapping stays positional-safe.
const COLUMNS: &str = "task_id, filename, submitter, status, created_at, \
                       completed_at, payload, prompt_tokens, completion_tokens, \
                       total_tokens, error_message";

fn row_to_record(row: &Row<'_>) -> Result<TaskRecord, ExtractError> {
    let id_text: String = row.get(0)?;
    let task_id = Uuid::parse_str(&id_text)
        .map_err(|e| ExtractError::Internal(format!("corrupt task_id '{id_text}': {e}")))?;
    let status_text: String = row.get(3)?;
    let status = TaskStatus::parse(&status_text)
        .ok_or_else(|| ExtractError::Internal(format!("corrupt status '{status_text}'")))?;
    Ok(TaskRecord {
        task_id,
        filename: row.get(1)?,
        submitter: row.get(2)?,
        status,
        created_at: row.get(4)?,
        completed_at: row.get(5)?,
        payload: row.get(6)?,
        prompt_tokens: row.get(7)?,
        completion_tokens: row.get(8)?,
        total_tokens: row.get(9)?,
        error_message: row.get(10)?,
    })
}
