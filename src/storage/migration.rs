// src/storage/migration.rs
//! Schema version gate and upgrade driver
//!
//! The engine consumes this through the [`SchemaMigrationCoordinator`] trait:
//! validate once after connecting, then either proceed (current), migrate
//! live (index-only steps, writes keep flowing) or migrate offline (engine
//! holds back its ready signal until the chain completes). Migration failure
//! is fatal to the startup attempt, never retried.

use crate::storage::session::Session;
use crate::utils::errors::{RecorderError, Result};
use chrono::Utc;
use rusqlite::params;
use tracing::{info, warn};

/// Schema version this build writes
pub const SCHEMA_VERSION: u32 = 3;

/// Upgrades starting at or above this version only add indexes and are safe
/// to run while serving writes.
const LIVE_MIGRATION_MIN_VERSION: u32 = 2;

/// Everything a fresh store needs, created directly at the current version
const SCHEMA_CREATE_ALL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_changes (
    change_id INTEGER PRIMARY KEY AUTOINCREMENT,
    version INTEGER NOT NULL,
    applied_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS recorder_runs (
    run_id INTEGER PRIMARY KEY AUTOINCREMENT,
    start INTEGER NOT NULL,
    created INTEGER NOT NULL,
    finished_at INTEGER,
    closed_incorrect INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS event_data (
    data_id INTEGER PRIMARY KEY AUTOINCREMENT,
    hash INTEGER NOT NULL,
    shared_data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    time_fired INTEGER NOT NULL,
    data_id INTEGER REFERENCES event_data(data_id),
    context_id TEXT
);

CREATE TABLE IF NOT EXISTS state_attributes (
    attributes_id INTEGER PRIMARY KEY AUTOINCREMENT,
    hash INTEGER NOT NULL,
    shared_attrs TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS states (
    state_id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id TEXT NOT NULL,
    state TEXT NOT NULL,
    last_updated INTEGER NOT NULL,
    attributes_id INTEGER REFERENCES state_attributes(attributes_id),
    old_state_id INTEGER REFERENCES states(state_id),
    context_id TEXT
);

CREATE INDEX IF NOT EXISTS ix_events_time_fired ON events (time_fired);
CREATE INDEX IF NOT EXISTS ix_event_data_hash ON event_data (hash);
CREATE INDEX IF NOT EXISTS ix_states_entity_last_updated ON states (entity_id, last_updated);
CREATE INDEX IF NOT EXISTS ix_state_attributes_hash ON state_attributes (hash);
"#;

/// Result of validating the on-disk schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaStatus {
    /// Version currently stamped on disk
    pub current_version: u32,
    /// Whether the store was created by this validation pass
    pub fresh: bool,
}

/// Schema lifecycle gate consumed by the engine
pub trait SchemaMigrationCoordinator: Send {
    /// Inspect (and for fresh stores, create) the schema
    fn validate_schema(&self, session: &mut Session) -> Result<SchemaStatus>;

    /// Whether the stamped version matches what this build writes
    fn schema_is_valid(&self, status: &SchemaStatus) -> bool {
        status.current_version == SCHEMA_VERSION
    }

    /// Whether the remaining upgrade chain can run while serving writes
    fn is_live_migration(&self, status: &SchemaStatus) -> bool;

    /// Drive the upgrade chain to the current version
    fn migrate_schema(&self, session: &mut Session, status: &SchemaStatus) -> Result<()>;
}

/// Default SQLite migration chain
#[derive(Debug, Default)]
pub struct SqliteMigrations;

impl SqliteMigrations {
    fn stamp(tx: &rusqlite::Transaction<'_>, version: u32) -> Result<()> {
        tx.execute(
            "INSERT INTO schema_changes (version, applied_at) VALUES (?1, ?2)",
            params![version, Utc::now().timestamp_micros()],
        )?;
        Ok(())
    }

    fn apply_step(session: &mut Session, version: u32) -> Result<()> {
        let tx = session.conn.transaction()?;
        match version {
            2 => {
                // Context correlation columns
                tx.execute_batch(
                    "ALTER TABLE events ADD COLUMN context_id TEXT;
                     ALTER TABLE states ADD COLUMN context_id TEXT;",
                )?;
            }
            3 => {
                // Query/dedup indexes; additive, safe while writes flow
                tx.execute_batch(
                    "CREATE INDEX IF NOT EXISTS ix_events_time_fired ON events (time_fired);
                     CREATE INDEX IF NOT EXISTS ix_event_data_hash ON event_data (hash);
                     CREATE INDEX IF NOT EXISTS ix_states_entity_last_updated
                         ON states (entity_id, last_updated);
                     CREATE INDEX IF NOT EXISTS ix_state_attributes_hash
                         ON state_attributes (hash);",
                )?;
            }
            other => {
                return Err(RecorderError::Migration(format!(
                    "no upgrade step for schema version {}",
                    other
                )));
            }
        }
        Self::stamp(&tx, version)?;
        tx.commit()?;
        Ok(())
    }

    fn has_schema_changes_table(session: &Session) -> Result<bool> {
        let count: i64 = session.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_changes'",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

impl SchemaMigrationCoordinator for SqliteMigrations {
    fn validate_schema(&self, session: &mut Session) -> Result<SchemaStatus> {
        if !Self::has_schema_changes_table(session)? {
            info!(version = SCHEMA_VERSION, "creating fresh schema");
            let tx = session.conn.transaction()?;
            tx.execute_batch(SCHEMA_CREATE_ALL)?;
            Self::stamp(&tx, SCHEMA_VERSION)?;
            tx.commit()?;
            return Ok(SchemaStatus {
                current_version: SCHEMA_VERSION,
                fresh: true,
            });
        }

        let current_version = session.max_schema_version()?.ok_or_else(|| {
            RecorderError::Migration("schema_changes table exists but holds no version".into())
        })?;

        if current_version > SCHEMA_VERSION {
            return Err(RecorderError::Migration(format!(
                "store was written by schema version {} but this build supports {}",
                current_version, SCHEMA_VERSION
            )));
        }

        if current_version < SCHEMA_VERSION {
            warn!(
                from = current_version,
                to = SCHEMA_VERSION,
                "schema upgrade required"
            );
        }

        Ok(SchemaStatus {
            current_version,
            fresh: false,
        })
    }

    fn is_live_migration(&self, status: &SchemaStatus) -> bool {
        status.current_version >= LIVE_MIGRATION_MIN_VERSION
    }

    fn migrate_schema(&self, session: &mut Session, status: &SchemaStatus) -> Result<()> {
        for version in (status.current_version + 1)..=SCHEMA_VERSION {
            info!(version, "applying schema upgrade step");
            Self::apply_step(session, version).map_err(|e| {
                RecorderError::Migration(format!("upgrade to version {} failed: {}", version, e))
            })?;
        }
        info!(version = SCHEMA_VERSION, "schema upgrade complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// The base schema as version 1 shipped it: no context columns, no
    /// secondary indexes.
    const SCHEMA_V1: &str = r#"
        CREATE TABLE schema_changes (
            change_id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at INTEGER NOT NULL
        );
        CREATE TABLE recorder_runs (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            start INTEGER NOT NULL,
            created INTEGER NOT NULL,
            finished_at INTEGER,
            closed_incorrect INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE event_data (
            data_id INTEGER PRIMARY KEY AUTOINCREMENT,
            hash INTEGER NOT NULL,
            shared_data TEXT NOT NULL
        );
        CREATE TABLE events (
            event_id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            time_fired INTEGER NOT NULL,
            data_id INTEGER REFERENCES event_data(data_id)
        );
        CREATE TABLE state_attributes (
            attributes_id INTEGER PRIMARY KEY AUTOINCREMENT,
            hash INTEGER NOT NULL,
            shared_attrs TEXT NOT NULL
        );
        CREATE TABLE states (
            state_id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id TEXT NOT NULL,
            state TEXT NOT NULL,
            last_updated INTEGER NOT NULL,
            attributes_id INTEGER REFERENCES state_attributes(attributes_id),
            old_state_id INTEGER REFERENCES states(state_id)
        );
        INSERT INTO schema_changes (version, applied_at) VALUES (1, 0);
    "#;

    fn open(dir: &TempDir) -> Session {
        Session::open(&dir.path().join("hearth.db"), false).unwrap()
    }

    fn stamp_only(session: &Session, version: u32) {
        session
            .conn
            .execute(
                "INSERT INTO schema_changes (version, applied_at) VALUES (?1, 0)",
                params![version],
            )
            .unwrap();
    }

    #[test]
    fn test_fresh_install_is_current() {
        let dir = TempDir::new().unwrap();
        let mut session = open(&dir);
        let migrations = SqliteMigrations::default();

        let status = migrations.validate_schema(&mut session).unwrap();
        assert!(status.fresh);
        assert!(migrations.schema_is_valid(&status));
        assert_eq!(session.max_schema_version().unwrap(), Some(SCHEMA_VERSION));

        // Revalidating an existing store does not recreate it.
        let status = migrations.validate_schema(&mut session).unwrap();
        assert!(!status.fresh);
        assert!(migrations.schema_is_valid(&status));
    }

    #[test]
    fn test_v1_store_needs_offline_migration() {
        let dir = TempDir::new().unwrap();
        let mut session = open(&dir);
        session.conn.execute_batch(SCHEMA_V1).unwrap();

        let migrations = SqliteMigrations::default();
        let status = migrations.validate_schema(&mut session).unwrap();
        assert_eq!(status.current_version, 1);
        assert!(!migrations.schema_is_valid(&status));
        assert!(!migrations.is_live_migration(&status));

        migrations.migrate_schema(&mut session, &status).unwrap();
        assert_eq!(session.max_schema_version().unwrap(), Some(SCHEMA_VERSION));

        // The context column exists after the upgrade.
        session
            .conn
            .execute(
                "INSERT INTO events (event_type, time_fired, context_id) VALUES ('x', 1, 'ctx')",
                [],
            )
            .unwrap();
    }

    #[test]
    fn test_v2_store_migrates_live() {
        let dir = TempDir::new().unwrap();
        let mut session = open(&dir);
        session.conn.execute_batch(SCHEMA_V1).unwrap();
        session
            .conn
            .execute_batch(
                "ALTER TABLE events ADD COLUMN context_id TEXT;
                 ALTER TABLE states ADD COLUMN context_id TEXT;",
            )
            .unwrap();
        stamp_only(&session, 2);

        let migrations = SqliteMigrations::default();
        let status = migrations.validate_schema(&mut session).unwrap();
        assert_eq!(status.current_version, 2);
        assert!(!migrations.schema_is_valid(&status));
        assert!(migrations.is_live_migration(&status));

        migrations.migrate_schema(&mut session, &status).unwrap();
        let status = migrations.validate_schema(&mut session).unwrap();
        assert!(migrations.schema_is_valid(&status));
    }

    #[test]
    fn test_newer_store_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut session = open(&dir);
        session.conn.execute_batch(SCHEMA_V1).unwrap();
        stamp_only(&session, SCHEMA_VERSION + 1);

        let migrations = SqliteMigrations::default();
        let err = migrations.validate_schema(&mut session).unwrap_err();
        assert!(matches!(err, RecorderError::Migration(_)));
    }
}
