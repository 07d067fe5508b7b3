// src/utils/errors.rs
//! Error types for the recorder engine
//!
//! Database failures are classified at conversion time so the worker loop can
//! route them: transient errors are retried, corruption triggers quarantine
//! and reinit, everything else closes and reopens the session.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T, E = RecorderError> = std::result::Result<T, E>;

/// Recorder engine errors
#[derive(Debug, Error)]
pub enum RecorderError {
    /// Connectivity blip or lock contention; safe to retry with backoff
    #[error("transient database error: {0}")]
    Transient(#[source] rusqlite::Error),

    /// Storage-layer integrity failure; requires quarantine + reinit
    #[error("database corruption detected: {0}")]
    Corruption(#[source] rusqlite::Error),

    /// Any other database-layer failure
    #[error("database error: {0}")]
    Database(#[source] rusqlite::Error),

    /// The configured database URL names a dialect this engine cannot drive
    #[error("unsupported database backend: {0}")]
    UnsupportedBackend(String),

    /// A single event's payload could not be encoded
    #[error("event payload could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Schema upgrade step failed; fatal to the startup attempt
    #[error("schema migration failed: {0}")]
    Migration(String),

    /// Backup lock was not granted or released in time
    #[error("timed out waiting for the database write lock")]
    LockTimeout,

    /// A second lock request arrived while the database was already locked
    #[error("database is already locked")]
    AlreadyLocked,

    /// A pooled connection was touched from a thread that does not own it
    #[error("connection affinity violation: {0}")]
    ThreadAffinity(String),

    /// The task queue hit its hard capacity
    #[error("task queue full")]
    QueueFull,

    /// No read session available within the configured bound
    #[error("read session pool exhausted")]
    PoolExhausted,

    /// Read-side access before the engine published its readiness signals
    #[error("recorder is not ready")]
    NotReady,

    /// The engine is stopping or stopped
    #[error("recorder is shutting down")]
    ShuttingDown,

    /// Filesystem-level failure (quarantine, store directory)
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded or validated
    #[error("configuration error: {0}")]
    Config(String),
}

impl RecorderError {
    /// Whether a bounded fixed-backoff retry is appropriate
    pub fn is_transient(&self) -> bool {
        matches!(self, RecorderError::Transient(_))
    }

    /// Whether the storage layer reported integrity failure
    pub fn is_corruption(&self) -> bool {
        matches!(self, RecorderError::Corruption(_))
    }

    /// Whether this came from the database layer at all (any classification)
    pub fn is_database(&self) -> bool {
        matches!(
            self,
            RecorderError::Transient(_)
                | RecorderError::Corruption(_)
                | RecorderError::Database(_)
        )
    }
}

impl From<rusqlite::Error> for RecorderError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                RecorderError::Transient(err)
            }
            Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
                RecorderError::Corruption(err)
            }
            _ => RecorderError::Database(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn sqlite_err(code: ffi::ErrorCode, extended: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code,
                extended_code: extended,
            },
            None,
        )
    }

    #[test]
    fn test_busy_is_transient() {
        let err: RecorderError = sqlite_err(ffi::ErrorCode::DatabaseBusy, 5).into();
        assert!(err.is_transient());
        assert!(err.is_database());
        assert!(!err.is_corruption());
    }

    #[test]
    fn test_corrupt_is_corruption() {
        let err: RecorderError = sqlite_err(ffi::ErrorCode::DatabaseCorrupt, 11).into();
        assert!(err.is_corruption());
        assert!(err.is_database());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_not_a_database_is_corruption() {
        let err: RecorderError = sqlite_err(ffi::ErrorCode::NotADatabase, 26).into();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_other_sqlite_errors_are_plain_database() {
        let err: RecorderError = sqlite_err(ffi::ErrorCode::ConstraintViolation, 19).into();
        assert!(err.is_database());
        assert!(!err.is_transient());
        assert!(!err.is_corruption());
    }

    #[test]
    fn test_non_database_kinds() {
        assert!(!RecorderError::LockTimeout.is_database());
        assert!(!RecorderError::QueueFull.is_transient());
    }
}
