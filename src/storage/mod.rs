//! Durable storage for the sync scheduler
//!
//! Everything the scheduler and the workers share lives in one SQLite
//! database: tracked events, provider credentials, the sync job queue and the
//! append-only sync history. Each process (scheduler, worker, operator CLI)
//! opens its own connection; SQLite's write lock plus the partial unique
//! index on active jobs are the only coordination between them.
//!
//! # Modules
//!
//! - [`jobs`] - The job queue (`JobQueue` trait, `SqliteJobStore`)
//! - [`catalog`] - Tracked events and candidate selection (`SyncCatalog`)

pub mod catalog;
pub mod jobs;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use thiserror::Error;

use crate::models::JobId;

pub use catalog::{CandidateWindow, SqliteSyncCatalog, SyncCatalog};
pub use jobs::{JobQueue, RequeueReport, SqliteJobStore};

/// Result type for storage operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// How long a connection waits for the write lock before reporting busy
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Storage-layer errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("database connection lock poisoned")]
    LockPoisoned,

    #[error("invalid value {value:?} in column {column}")]
    InvalidRow { column: &'static str, value: String },

    #[error("job {0} not found")]
    JobNotFound(JobId),

    /// The job is no longer running under the caller's claim
    #[error("job {job_id} is not running under attempt {attempt}")]
    LeaseLost { job_id: JobId, attempt: u32 },
}

impl StoreError {
    pub(crate) fn invalid_row(column: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidRow {
            column,
            value: value.into(),
        }
    }

    /// Errors that are expected to clear up on their own (busy database,
    /// unreachable file). The scheduler retries these on the next tick.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::SystemIoFailure
            ),
            Self::Io(_) => true,
            _ => false,
        }
    }
}

/// Handle to the shared SQLite database
///
/// Cloning is cheap and shares the underlying connection. Open a second
/// `Database` on the same path to get an independent connection, the way a
/// separate worker process would.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) the database file and apply the schema
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self::from_connection(conn, Some(path.to_path_buf()))?;
        tracing::info!(path = %path.display(), "SQLite database opened");
        Ok(db)
    }

    /// Private in-memory database (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> StoreResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Path of the database file, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` with exclusive access to the connection
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&mut conn)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

/// Encode a timestamp as fixed-width UTC RFC 3339 so text order is time order
pub(crate) fn encode_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn decode_time(column: &'static str, value: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::invalid_row(column, value))
}

pub(crate) fn decode_opt_time(
    column: &'static str,
    value: Option<String>,
) -> StoreResult<Option<DateTime<Utc>>> {
    value.map(|v| decode_time(column, &v)).transpose()
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS provider_credentials (
        tenant_id TEXT NOT NULL,
        provider_id TEXT NOT NULL,
        api_key TEXT,
        enabled INTEGER NOT NULL DEFAULT 1,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, provider_id)
    );

    CREATE TABLE IF NOT EXISTS tracked_events (
        tenant_id TEXT NOT NULL,
        provider_id TEXT NOT NULL,
        event_id TEXT NOT NULL,
        name TEXT,
        start_time TEXT,
        full_sync_completed INTEGER NOT NULL DEFAULT 0,
        first_seen_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, provider_id, event_id)
    );

    CREATE INDEX IF NOT EXISTS idx_tracked_events_start
        ON tracked_events(start_time);

    CREATE TABLE IF NOT EXISTS sync_jobs (
        job_id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id TEXT NOT NULL,
        provider_id TEXT NOT NULL,
        event_id TEXT NOT NULL,
        operation_kind TEXT NOT NULL,
        direction TEXT NOT NULL DEFAULT 'inbound',
        priority INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'running', 'success', 'failed')),
        scheduled_time TEXT NOT NULL,
        started_time TEXT,
        completed_time TEXT,
        payload TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        worker_id TEXT,
        failure_reason TEXT
    );

    -- At most one pending/running job per (tenant, provider, event, kind)
    CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_jobs_active
        ON sync_jobs(tenant_id, provider_id, event_id, operation_kind)
        WHERE status IN ('pending', 'running');

    CREATE INDEX IF NOT EXISTS idx_sync_jobs_claim
        ON sync_jobs(status, priority, scheduled_time);

    CREATE TABLE IF NOT EXISTS sync_outcomes (
        outcome_id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER,
        tenant_id TEXT NOT NULL,
        provider_id TEXT NOT NULL,
        event_id TEXT NOT NULL,
        operation_kind TEXT NOT NULL,
        sync_time TEXT NOT NULL,
        records_synced INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL CHECK (status IN ('success', 'failed')),
        failure_reason TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_sync_outcomes_event
        ON sync_outcomes(tenant_id, provider_id, event_id, operation_kind, status, sync_time);

    CREATE TRIGGER IF NOT EXISTS sync_outcomes_no_update
        BEFORE UPDATE ON sync_outcomes
    BEGIN
        SELECT RAISE(ABORT, 'sync_outcomes is append-only');
    END;

    CREATE TRIGGER IF NOT EXISTS sync_outcomes_no_delete
        BEFORE DELETE ON sync_outcomes
    BEGIN
        SELECT RAISE(ABORT, 'sync_outcomes is append-only');
    END;
"#;
