// SPDX-License-Identifier: MIT OR Apache-2.0
//! Connection ownership, pragmas, transactions, and the error surface.

use crate::blobs::CasOptions;
use crate::migrations;
use chrono::{DateTime, SecondsFormat, Utc};
use reach_core::clock::SharedClock;
use reach_core::{CancelToken, ErrorKind, ReachError};
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// Errors from the storage driver.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The database is busy (writer contention). Retryable.
    #[error("database busy: {0}")]
    Busy(String),

    /// Any other SQLite failure.
    #[error("sqlite: {0}")]
    Sqlite(rusqlite::Error),

    /// Filesystem failure under the CAS root.
    #[error("blob io: {0}")]
    Io(#[from] std::io::Error),

    /// A stored content hash and the recomputed hash disagree.
    #[error("integrity mismatch for blob {key}: stored {stored}, recomputed {actual}")]
    Integrity {
        /// Blob key.
        key: String,
        /// Hash recorded at write time.
        stored: String,
        /// Hash recomputed from the bytes on disk.
        actual: String,
    },

    /// A snapshot's stored state hash does not match its payload.
    #[error("snapshot hash mismatch for run {run_id} at event {last_event_id}")]
    SnapshotHashMismatch {
        /// Owning run.
        run_id: Uuid,
        /// Snapshot position.
        last_event_id: i64,
    },

    /// Prune requested without a covering snapshot.
    #[error("no snapshot with last_event_id >= {required} for run {run_id}; refusing to prune")]
    MissingSnapshot {
        /// Owning run.
        run_id: Uuid,
        /// Minimum `last_event_id` a covering snapshot must have.
        required: i64,
    },

    /// A run fingerprint was written twice.
    #[error("fingerprint already written for run {0}")]
    FingerprintAlreadySet(Uuid),

    /// The requested blob does not exist.
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// The content store is at capacity and the eviction policy is `reject`.
    #[error("content store full: {needed} bytes needed, {available} available")]
    CasFull {
        /// Bytes the incoming blob requires.
        needed: u64,
        /// Bytes currently free under the cap.
        available: u64,
    },

    /// A row failed to decode into its contract type.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Serialization of a payload failed.
    #[error(transparent)]
    Canonical(#[from] reach_hash::CanonicalError),

    /// The operation's context was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, msg) = &err
            && matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        {
            return StoreError::Busy(msg.clone().unwrap_or_else(|| failure.to_string()));
        }
        StoreError::Sqlite(err)
    }
}

impl StoreError {
    /// Map onto the Reach error taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Busy(_) | StoreError::CasFull { .. } => ErrorKind::TransientIo,
            StoreError::Integrity { .. } | StoreError::SnapshotHashMismatch { .. } => {
                ErrorKind::IntegrityMismatch
            }
            StoreError::MissingSnapshot { .. } | StoreError::FingerprintAlreadySet(_) => {
                ErrorKind::InvariantViolation
            }
            StoreError::Cancelled => ErrorKind::Cancelled,
            StoreError::Canonical(_) | StoreError::Corrupt(_) | StoreError::BlobNotFound(_) => {
                ErrorKind::ValidationFailure
            }
            StoreError::Sqlite(_) | StoreError::Io(_) => ErrorKind::TransientIo,
        }
    }
}

impl From<StoreError> for ReachError {
    fn from(err: StoreError) -> Self {
        ReachError::new(err.kind(), err.to_string())
    }
}

/// Handle to the embedded store.
///
/// The handle owns the connection; all access funnels through
/// [`with_conn`](Store::with_conn) and [`with_tx`](Store::with_tx), which
/// serialize writers in-process while WAL mode serializes them across
/// processes.
pub struct Store {
    conn: Mutex<Connection>,
    cas_root: PathBuf,
    cas_options: CasOptions,
    clock: SharedClock,
}

impl Store {
    /// Open (or create) the database at `db_path` with the CAS rooted at
    /// `cas_root`, applying any pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened, a pragma fails, or
    /// a migration cannot be applied.
    pub fn open(
        db_path: &Path,
        cas_root: &Path,
        cas_options: CasOptions,
        clock: SharedClock,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir_all(cas_root)?;
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn, cas_root, cas_options, clock)
    }

    /// Open an in-memory store. Intended for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if migrations cannot be applied.
    pub fn open_in_memory(
        cas_root: &Path,
        clock: SharedClock,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(cas_root)?;
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, cas_root, CasOptions::default(), clock)
    }

    fn from_connection(
        conn: Connection,
        cas_root: &Path,
        cas_options: CasOptions,
        clock: SharedClock,
    ) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        let now = fmt_ts(clock.now());
        migrations::apply(&conn, &now)?;
        tracing::debug!(cas_root = %cas_root.display(), "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            cas_root: cas_root.to_path_buf(),
            cas_options,
            clock,
        })
    }

    /// Run a closure against the connection.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error; busy failures surface as
    /// [`StoreError::Busy`].
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().expect("store connection lock poisoned");
        f(&conn)
    }

    /// Run a closure inside a `BEGIN IMMEDIATE … COMMIT` transaction.
    ///
    /// Compound writes (snapshot + prune, migration apply, lease flips) go
    /// through here so interruption never leaves partial state.
    ///
    /// # Errors
    ///
    /// Rolls back and propagates the closure's error.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().expect("store connection lock poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// The clock this store was opened with.
    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Current instant from the store's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// CAS root directory.
    #[must_use]
    pub fn cas_root(&self) -> &Path {
        &self.cas_root
    }

    pub(crate) fn cas_options(&self) -> &CasOptions {
        &self.cas_options
    }

    pub(crate) fn check(ctx: &CancelToken) -> Result<(), StoreError> {
        if ctx.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        Ok(())
    }
}

/// Fixed-width UTC timestamp format; lexicographic order equals time order.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {s:?}: {e}")))
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("bad uuid {s:?}: {e}")))
}
