//! Durable state for relay.
//!
//! One SQLite database holds the job queue (with partial streaming content),
//! the chat message placeholders jobs are linked to, the curated model
//! catalog, per-device install state, and the model switch audit trail.
//!
//! # Key invariant
//!
//! Job status transitions are serialised through this store: every transition
//! runs inside a transaction that re-checks the current status, so a job can
//! never leave a terminal state and at most one job is `streaming` at a time.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;
use thiserror::Error;

use relay_types::{InvalidValue, JobId};

mod jobs;
mod models;

pub use jobs::StaleJobs;
pub use models::ModelSwitch;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("model '{0}' is not installed")]
    NotInstalled(String),
    #[error("corrupt persisted value: {0}")]
    Corrupt(#[from] InvalidValue),
    #[error("corrupt persisted JSON: {0}")]
    CorruptJson(#[from] serde_json::Error),
}

/// Epoch milliseconds, the timestamp unit used throughout the schema.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Handle to the relay database.
///
/// The connection sits behind a mutex; callers hold it only for the duration
/// of one operation. All writes that touch job status run in transactions.
pub struct Store {
    db: Mutex<Connection>,
}

impl Store {
    const SCHEMA: &'static str = r"
        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            queue_position INTEGER NOT NULL DEFAULT 0,
            requested_model TEXT NOT NULL,
            model_sequence TEXT NOT NULL DEFAULT '[]',
            max_wait_secs INTEGER NOT NULL,
            payload TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            thinking TEXT NOT NULL DEFAULT '',
            sources TEXT,
            queued_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            last_update_at INTEGER NOT NULL,
            error_message TEXT,
            message_id INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
        CREATE INDEX IF NOT EXISTS idx_jobs_conversation ON jobs(conversation_id);

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            thinking TEXT,
            sources TEXT,
            status TEXT NOT NULL,
            job_id INTEGER
        );

        CREATE TABLE IF NOT EXISTS catalog (
            id TEXT PRIMARY KEY,
            external_name TEXT NOT NULL,
            display_name TEXT NOT NULL,
            ram_required_gb REAL NOT NULL,
            tier INTEGER NOT NULL,
            capabilities TEXT NOT NULL DEFAULT '[]'
        );

        CREATE TABLE IF NOT EXISTS installed (
            id TEXT PRIMARY KEY REFERENCES catalog(id),
            status TEXT NOT NULL,
            download_progress INTEGER NOT NULL DEFAULT 0,
            is_default INTEGER NOT NULL DEFAULT 0,
            last_used_at INTEGER,
            usage_count INTEGER NOT NULL DEFAULT 0,
            downloaded_at INTEGER,
            error_message TEXT
        );

        CREATE TABLE IF NOT EXISTS model_switches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            from_model TEXT,
            to_model TEXT NOT NULL,
            duration_ms INTEGER NOT NULL,
            triggered_by TEXT NOT NULL,
            reason TEXT NOT NULL,
            switched_at INTEGER NOT NULL
        );
    ";

    /// Open or create the database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
        }
        Self::initialize(Connection::open(path)?)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(db: Connection) -> Result<Self, StoreError> {
        db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        db.execute_batch(Self::SCHEMA)?;
        Self::seed_catalog(&db)?;
        Ok(Self { db: Mutex::new(db) })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
