#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

//! SQLite-backed request transactions.
//!
//! Each request gets its own connection with an open `BEGIN` transaction.
//! The orchestrator commits or rolls it back once the request resolves.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use http::StatusCode;
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, InterruptHandle};
use tracegate_orchestrator::{StorageTransaction, TransactionSource};
use tracegate_trace::{DisclosureLevel, ErrorTrace};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteDatabase {
    /// Describes the database at `path`. No connection is made until the
    /// first transaction begins, so an unreachable file surfaces per request.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(anyhow!("sqlite database path MUST NOT be empty"));
        }
        Ok(Self { path, busy_timeout: DEFAULT_BUSY_TIMEOUT })
    }

    #[must_use]
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }
}

impl TransactionSource for SqliteDatabase {
    type Transaction = SqliteTransaction;

    fn begin(&self) -> Result<SqliteTransaction, ErrorTrace> {
        let conn = self.connect().map_err(|err| begin_error(&err))?;
        conn.execute_batch("BEGIN").map_err(|err| begin_error(&err))?;
        tracing::debug!(path = %self.path.display(), "sqlite transaction opened");
        let interrupt = conn.get_interrupt_handle();
        Ok(SqliteTransaction { conn: Mutex::new(Some(conn)), interrupt })
    }
}

fn begin_error(err: &rusqlite::Error) -> ErrorTrace {
    let unreachable = matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: ErrorCode::CannotOpen
                    | ErrorCode::PermissionDenied
                    | ErrorCode::NotADatabase
                    | ErrorCode::SystemIoFailure,
                ..
            },
            _
        )
    );
    let wordy = if unreachable { "The database is not reachable" } else { "Could not begin transaction" };
    ErrorTrace::new()
        .with_status(StatusCode::SERVICE_UNAVAILABLE)
        .append_error(DisclosureLevel::Debug, err)
        .append(DisclosureLevel::Wordy, wordy)
        .alt(DisclosureLevel::Plain, "Database error")
}

fn query_error(err: &rusqlite::Error) -> ErrorTrace {
    ErrorTrace::new()
        .append_error(DisclosureLevel::Debug, err)
        .append(DisclosureLevel::Wordy, "Database query failed")
        .alt(DisclosureLevel::Plain, "Database error")
}

fn closed_error() -> ErrorTrace {
    ErrorTrace::new()
        .append(DisclosureLevel::Debug, "transaction already closed")
        .append(DisclosureLevel::Plain, "Database error")
}

/// A connection holding one open transaction until commit or rollback.
pub struct SqliteTransaction {
    conn: Mutex<Option<Connection>>,
    // Lives outside the mutex so a rollback can stop a statement that is
    // still holding the connection.
    interrupt: InterruptHandle,
}

impl std::fmt::Debug for SqliteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTransaction").field("open", &self.is_open()).finish()
    }
}

impl SqliteTransaction {
    /// Runs `f` against the open connection on the calling thread.
    pub fn with_connection<R, F>(&self, f: F) -> Result<R, ErrorTrace>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R>,
    {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or_else(closed_error)?;
        f(conn).map_err(|err| query_error(&err))
    }

    /// Runs `f` on the blocking pool so the async executor never waits on
    /// SQLite.
    pub async fn query<R, F>(self: &Arc<Self>, f: F) -> Result<R, ErrorTrace>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let tx = Arc::clone(self);
        match tokio::task::spawn_blocking(move || tx.with_connection(f)).await {
            Ok(result) => result,
            Err(err) => Err(ErrorTrace::new()
                .append_error(DisclosureLevel::Debug, &err)
                .append(DisclosureLevel::Wordy, "Database query failed")
                .alt(DisclosureLevel::Plain, "Database error")),
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.conn.lock().is_some()
    }
}

impl StorageTransaction for SqliteTransaction {
    fn commit(&self) -> Result<(), ErrorTrace> {
        let conn = self.conn.lock().take().ok_or_else(closed_error)?;
        conn.execute_batch("COMMIT").map_err(|err| {
            ErrorTrace::new()
                .append_error(DisclosureLevel::Debug, &err)
                .append(DisclosureLevel::Wordy, "Could not commit database transaction")
        })
    }

    /// Interrupts any statement still running on the connection first, so
    /// an abandoned request never waits for its own runaway query.
    fn rollback(&self) -> Result<(), ErrorTrace> {
        self.interrupt.interrupt();
        let Some(conn) = self.conn.lock().take() else {
            return Ok(());
        };
        // An interrupted write may already have rolled the transaction back.
        if conn.is_autocommit() {
            return Ok(());
        }
        conn.execute_batch("ROLLBACK").map_err(|err| {
            ErrorTrace::new()
                .append_error(DisclosureLevel::Debug, &err)
                .append(DisclosureLevel::Wordy, "Could not roll back database transaction")
        })
    }
}
