// src/storage/mod.rs
//! SQLite persistence layer
//!
//! This module owns everything that touches the database file:
//!
//! - **Session**: one connection plus the row-level operations the engine
//!   needs (insert, hash-filtered lookup, delete-by-id-set)
//! - **Pool**: connection lifecycle with thread affinity and a bounded
//!   helper pool for read jobs
//! - **Migration**: schema version gate and the linear upgrade chain
//!
//! The engine is single-writer: exactly one read-write session exists and it
//! is bound to the worker thread. Everyone else reads through their own
//! read-only session.

pub mod migration;
pub mod pool;
pub mod session;

pub use migration::{SchemaMigrationCoordinator, SchemaStatus, SqliteMigrations, SCHEMA_VERSION};
pub use pool::{ConnectionPool, JobPool, ReadSession};
pub use session::{PayloadClass, Session};

use crate::utils::errors::{RecorderError, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Table/column names of one content-addressed payload class
pub(crate) struct PayloadClassColumns {
    pub table: &'static str,
    pub id: &'static str,
    pub payload: &'static str,
    pub referencing_table: &'static str,
}

/// Supported storage backends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// SQLite database file on local disk
    SqliteFile(PathBuf),
}

impl Backend {
    /// Parse a database URL. Anything that is not a SQLite file is an
    /// [`RecorderError::UnsupportedBackend`] and must not be retried.
    pub fn parse(db_url: &str) -> Result<Self> {
        let url = db_url.trim();

        if url.is_empty() {
            return Err(RecorderError::Config("db_url is empty".into()));
        }

        let path = if let Some(rest) = url.strip_prefix("sqlite://") {
            rest
        } else if let Some((scheme, _)) = url.split_once("://") {
            return Err(RecorderError::UnsupportedBackend(scheme.to_string()));
        } else {
            url
        };

        if path == ":memory:" || path.is_empty() {
            return Err(RecorderError::UnsupportedBackend(
                "in-memory sqlite stores are not durable".into(),
            ));
        }

        Ok(Backend::SqliteFile(PathBuf::from(path)))
    }

    /// Path of the store file
    pub fn path(&self) -> &Path {
        match self {
            Backend::SqliteFile(path) => path,
        }
    }

    /// Whether the backend lives in a local file (quarantine is possible)
    pub fn is_file_based(&self) -> bool {
        matches!(self, Backend::SqliteFile(_))
    }

    /// Whether the backend speaks over a socket (keep-alive relevant)
    pub fn uses_socket(&self) -> bool {
        false
    }
}

/// Move a damaged store file aside so a fresh one can be created.
///
/// The damaged file is never overwritten and never silently deleted: the
/// rename target gets a timestamp suffix, plus a counter when that name is
/// already taken. WAL/SHM sidecars belong to the damaged file and are
/// removed.
pub fn move_away_broken_database(path: &Path) -> Result<PathBuf> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S");
    let base = path.to_string_lossy().into_owned();

    let mut target = PathBuf::from(format!("{}.corrupt.{}", base, stamp));
    let mut attempt = 0u32;
    while target.exists() {
        attempt += 1;
        target = PathBuf::from(format!("{}.corrupt.{}.{}", base, stamp, attempt));
    }

    std::fs::rename(path, &target)?;
    warn!(from = %path.display(), to = %target.display(), "quarantined corrupt database");

    for sidecar in ["-wal", "-shm"] {
        let sidecar_path = PathBuf::from(format!("{}{}", base, sidecar));
        if sidecar_path.exists() {
            if let Err(e) = std::fs::remove_file(&sidecar_path) {
                warn!(path = %sidecar_path.display(), "could not remove sidecar: {}", e);
            }
        }
    }

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_plain_path() {
        let backend = Backend::parse("hearth.db").unwrap();
        assert_eq!(backend, Backend::SqliteFile(PathBuf::from("hearth.db")));
        assert!(backend.is_file_based());
        assert!(!backend.uses_socket());
    }

    #[test]
    fn test_parse_sqlite_url() {
        let backend = Backend::parse("sqlite:///data/hearth.db").unwrap();
        assert_eq!(backend.path(), Path::new("/data/hearth.db"));
    }

    #[test]
    fn test_parse_rejects_other_dialects() {
        for url in ["mysql://host/db", "postgresql://host/db", "mssql://x"] {
            match Backend::parse(url) {
                Err(RecorderError::UnsupportedBackend(_)) => {}
                other => panic!("expected UnsupportedBackend, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_parse_rejects_memory() {
        assert!(matches!(
            Backend::parse("sqlite://:memory:"),
            Err(RecorderError::UnsupportedBackend(_))
        ));
    }

    #[test]
    fn test_quarantine_never_overwrites() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("hearth.db");

        std::fs::write(&db, b"broken").unwrap();
        let first = move_away_broken_database(&db).unwrap();
        assert!(first.exists());
        assert!(!db.exists());

        // A second corruption in the same second must land elsewhere.
        std::fs::write(&db, b"broken again").unwrap();
        let second = move_away_broken_database(&db).unwrap();
        assert_ne!(first, second);
        assert!(first.exists());
        assert!(second.exists());
    }

    #[test]
    fn test_quarantine_removes_sidecars() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("hearth.db");
        let wal = dir.path().join("hearth.db-wal");

        std::fs::write(&db, b"broken").unwrap();
        std::fs::write(&wal, b"wal").unwrap();

        move_away_broken_database(&db).unwrap();
        assert!(!wal.exists());
    }
}
