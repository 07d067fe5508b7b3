// src/storage/session.rs
//! One database connection and the row-level operations built on it
//!
//! A `Session` is bound to the thread that opened it (or that checked it out
//! of the pool). Touching it from any other thread is a programming error and
//! returns [`RecorderError::ThreadAffinity`] instead of silently opening a
//! side channel to the store.

use crate::storage::PayloadClassColumns;
use crate::utils::errors::{RecorderError, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::debug;

/// SQLite's default variable limit is 999; stay comfortably below it.
const MAX_BIND_VARS: usize = 500;

/// Short low-level busy wait; longer contention is handled by the engine's
/// bounded retry loop, not by blocking inside SQLite.
const BUSY_TIMEOUT: Duration = Duration::from_millis(500);

/// The two content-addressed payload classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadClass {
    /// Shared event payloads (`event_data`)
    EventData,
    /// Shared state attributes (`state_attributes`)
    StateAttributes,
}

impl PayloadClass {
    pub(crate) fn columns(self) -> PayloadClassColumns {
        match self {
            PayloadClass::EventData => PayloadClassColumns {
                table: "event_data",
                id: "data_id",
                payload: "shared_data",
                referencing_table: "events",
            },
            PayloadClass::StateAttributes => PayloadClassColumns {
                table: "state_attributes",
                id: "attributes_id",
                payload: "shared_attrs",
                referencing_table: "states",
            },
        }
    }

    /// Short label for logs
    pub fn label(self) -> &'static str {
        match self {
            PayloadClass::EventData => "event_data",
            PayloadClass::StateAttributes => "state_attributes",
        }
    }
}

/// Row staged for the `events` table
#[derive(Debug, Clone)]
pub struct EventRow {
    pub event_type: String,
    pub time_fired_us: i64,
    pub data_id: Option<i64>,
    pub context_id: Option<String>,
}

/// Row staged for the `states` table
#[derive(Debug, Clone)]
pub struct StateRow {
    pub entity_id: String,
    pub state: String,
    pub last_updated_us: i64,
    pub attributes_id: Option<i64>,
    pub old_state_id: Option<i64>,
    pub context_id: Option<String>,
}

/// Raw `recorder_runs` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRow {
    pub run_id: i64,
    pub start_us: i64,
    pub created_us: i64,
    pub finished_at_us: Option<i64>,
    pub closed_incorrect: bool,
}

/// One open connection, bound to its owning thread
#[derive(Debug)]
pub struct Session {
    pub(crate) conn: Connection,
    owner: ThreadId,
    read_only: bool,
}

impl Session {
    /// Open a session on a SQLite file
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let conn = if read_only {
            Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            Connection::open(path)?
        };

        conn.busy_timeout(BUSY_TIMEOUT)?;
        if !read_only {
            let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
            conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA synchronous=NORMAL;")?;
        }

        debug!(path = %path.display(), read_only, "session opened");
        Ok(Self {
            conn,
            owner: thread::current().id(),
            read_only,
        })
    }

    /// Re-bind to the calling thread; used by the pool on checkout
    pub(crate) fn rebind_owner(&mut self) {
        self.owner = thread::current().id();
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Surface cross-thread access loudly instead of degrading
    fn guard(&self) -> Result<()> {
        if thread::current().id() != self.owner {
            return Err(RecorderError::ThreadAffinity(format!(
                "session owned by {:?} touched from {:?}",
                self.owner,
                thread::current().id()
            )));
        }
        Ok(())
    }

    /// Cheap liveness probe for socket-backed stores
    pub fn keep_alive(&self) -> Result<()> {
        self.guard()?;
        self.conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    /// Release cached statements; run every N commits to bound memory
    pub fn expire(&self) {
        self.conn.flush_prepared_statement_cache();
    }

    /// Store lookup for a shared payload: filter by hash, confirm by full
    /// payload equality so colliding hashes never merge distinct payloads.
    pub fn lookup_shared(
        &self,
        class: PayloadClass,
        hash: i64,
        payload: &str,
    ) -> Result<Option<i64>> {
        self.guard()?;
        let cols = class.columns();
        let sql = format!(
            "SELECT {id}, {payload} FROM {table} WHERE hash = ?1",
            id = cols.id,
            payload = cols.payload,
            table = cols.table,
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(params![hash])?;
        while let Some(row) = rows.next()? {
            let stored: String = row.get(1)?;
            if stored == payload {
                return Ok(Some(row.get(0)?));
            }
        }
        Ok(None)
    }

    /// Begin the single write transaction used by a flush
    pub fn write_tx(&mut self) -> Result<WriteTx<'_>> {
        self.guard()?;
        Ok(WriteTx {
            tx: self.conn.transaction()?,
        })
    }

    /// Take SQLite's exclusive write lock (backup coordination)
    pub fn begin_exclusive(&self) -> Result<()> {
        self.guard()?;
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    /// Release the exclusive write lock
    pub fn end_exclusive(&self) -> Result<()> {
        self.guard()?;
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    // --- run markers ---

    pub fn insert_run(&self, start_us: i64, created_us: i64) -> Result<i64> {
        self.guard()?;
        self.conn.execute(
            "INSERT INTO recorder_runs (start, created, finished_at, closed_incorrect)
             VALUES (?1, ?2, NULL, 0)",
            params![start_us, created_us],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn end_run(&self, run_id: i64, finished_at_us: i64) -> Result<()> {
        self.guard()?;
        self.conn.execute(
            "UPDATE recorder_runs SET finished_at = ?2 WHERE run_id = ?1",
            params![run_id, finished_at_us],
        )?;
        Ok(())
    }

    /// Mark runs a crash left open; returns how many were repaired
    pub fn close_incomplete_runs(&self, now_us: i64) -> Result<usize> {
        self.guard()?;
        let repaired = self.conn.execute(
            "UPDATE recorder_runs SET finished_at = ?1, closed_incorrect = 1
             WHERE finished_at IS NULL",
            params![now_us],
        )?;
        Ok(repaired)
    }

    pub fn select_runs(&self) -> Result<Vec<RunRow>> {
        self.guard()?;
        let mut stmt = self.conn.prepare_cached(
            "SELECT run_id, start, created, finished_at, closed_incorrect
             FROM recorder_runs ORDER BY start",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RunRow {
                    run_id: row.get(0)?,
                    start_us: row.get(1)?,
                    created_us: row.get(2)?,
                    finished_at_us: row.get(3)?,
                    closed_incorrect: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // --- maintenance ---

    /// Bulk entity rename across recorded states
    pub fn update_entity_id(&self, old_entity_id: &str, new_entity_id: &str) -> Result<usize> {
        self.guard()?;
        let updated = self.conn.execute(
            "UPDATE states SET entity_id = ?2 WHERE entity_id = ?1",
            params![old_entity_id, new_entity_id],
        )?;
        Ok(updated)
    }

    // --- retention ---

    pub fn select_expired_state_ids(&self, before_us: i64, limit: usize) -> Result<Vec<i64>> {
        self.guard()?;
        self.select_ids(
            "SELECT state_id FROM states WHERE last_updated < ?1 LIMIT ?2",
            before_us,
            limit,
        )
    }

    pub fn select_expired_event_ids(&self, before_us: i64, limit: usize) -> Result<Vec<i64>> {
        self.guard()?;
        self.select_ids(
            "SELECT event_id FROM events WHERE time_fired < ?1 LIMIT ?2",
            before_us,
            limit,
        )
    }

    fn select_ids(&self, sql: &str, before_us: i64, limit: usize) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let ids = stmt
            .query_map(params![before_us, limit as i64], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Delete states by id, detaching any rows that chained off them first
    pub fn delete_states(&self, ids: &[i64]) -> Result<usize> {
        self.guard()?;
        self.execute_chunked(
            "UPDATE states SET old_state_id = NULL WHERE old_state_id IN",
            ids,
        )?;
        self.execute_chunked("DELETE FROM states WHERE state_id IN", ids)
    }

    pub fn delete_events(&self, ids: &[i64]) -> Result<usize> {
        self.guard()?;
        self.execute_chunked("DELETE FROM events WHERE event_id IN", ids)
    }

    /// Shared payload rows nothing references any more
    pub fn select_orphaned_shared(&self, class: PayloadClass) -> Result<Vec<i64>> {
        self.guard()?;
        let cols = class.columns();
        let sql = format!(
            "SELECT {id} FROM {table} WHERE {id} NOT IN
             (SELECT {id} FROM {referencing} WHERE {id} IS NOT NULL)",
            id = cols.id,
            table = cols.table,
            referencing = cols.referencing_table,
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    pub fn delete_shared(&self, class: PayloadClass, ids: &[i64]) -> Result<usize> {
        self.guard()?;
        let cols = class.columns();
        let prefix = format!(
            "DELETE FROM {table} WHERE {id} IN",
            table = cols.table,
            id = cols.id
        );
        self.execute_chunked(&prefix, ids)
    }

    /// Rebuild the store file to reclaim space
    pub fn repack(&self) -> Result<()> {
        self.guard()?;
        self.conn.execute_batch("VACUUM")?;
        Ok(())
    }

    fn execute_chunked(&self, sql_prefix: &str, ids: &[i64]) -> Result<usize> {
        let mut total = 0;
        for chunk in ids.chunks(MAX_BIND_VARS) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!("{} ({})", sql_prefix, placeholders);
            total += self
                .conn
                .execute(&sql, rusqlite::params_from_iter(chunk.iter()))?;
        }
        Ok(total)
    }

    // --- introspection (tests, stats) ---

    pub(crate) fn table_count(&self, table: &str) -> Result<i64> {
        self.guard()?;
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
    }

    pub(crate) fn max_schema_version(&self) -> Result<Option<u32>> {
        self.guard()?;
        let version = self
            .conn
            .query_row("SELECT MAX(version) FROM schema_changes", [], |row| {
                row.get::<_, Option<u32>>(0)
            })
            .optional()?
            .flatten();
        Ok(version)
    }

    /// Close the connection; errors here are worth reporting, not ignoring
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| RecorderError::from(e))
    }
}

/// The flush transaction: every staged row in one commit
pub struct WriteTx<'c> {
    tx: rusqlite::Transaction<'c>,
}

impl WriteTx<'_> {
    /// Insert a shared payload row; returns the assigned id
    pub fn insert_shared(&self, class: PayloadClass, hash: i64, payload: &str) -> Result<i64> {
        let cols = class.columns();
        let sql = format!(
            "INSERT INTO {table} (hash, {payload}) VALUES (?1, ?2)",
            table = cols.table,
            payload = cols.payload,
        );
        self.tx.execute(&sql, params![hash, payload])?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn insert_event(&self, row: &EventRow) -> Result<i64> {
        self.tx.execute(
            "INSERT INTO events (event_type, time_fired, data_id, context_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![row.event_type, row.time_fired_us, row.data_id, row.context_id],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn insert_state(&self, row: &StateRow) -> Result<i64> {
        self.tx.execute(
            "INSERT INTO states (entity_id, state, last_updated, attributes_id, old_state_id, context_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.entity_id,
                row.state,
                row.last_updated_us,
                row.attributes_id,
                row.old_state_id,
                row.context_id
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migration::{SchemaMigrationCoordinator, SqliteMigrations};
    use tempfile::TempDir;

    fn open_fresh() -> (TempDir, Session) {
        let dir = TempDir::new().unwrap();
        let mut session = Session::open(&dir.path().join("hearth.db"), false).unwrap();
        let migrations = SqliteMigrations::default();
        let status = migrations.validate_schema(&mut session).unwrap();
        assert!(migrations.schema_is_valid(&status));
        (dir, session)
    }

    #[test]
    fn test_lookup_shared_requires_payload_equality() {
        let (_dir, mut session) = open_fresh();

        // Two distinct payloads sharing a hash must stay distinct rows.
        let tx = session.write_tx().unwrap();
        let id_a = tx
            .insert_shared(PayloadClass::EventData, 7, r#"{"a":1}"#)
            .unwrap();
        let id_b = tx
            .insert_shared(PayloadClass::EventData, 7, r#"{"b":2}"#)
            .unwrap();
        tx.commit().unwrap();
        assert_ne!(id_a, id_b);

        assert_eq!(
            session
                .lookup_shared(PayloadClass::EventData, 7, r#"{"a":1}"#)
                .unwrap(),
            Some(id_a)
        );
        assert_eq!(
            session
                .lookup_shared(PayloadClass::EventData, 7, r#"{"b":2}"#)
                .unwrap(),
            Some(id_b)
        );
        assert_eq!(
            session
                .lookup_shared(PayloadClass::EventData, 7, r#"{"c":3}"#)
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_run_lifecycle() {
        let (_dir, session) = open_fresh();

        let run_id = session.insert_run(100, 110).unwrap();
        let runs = session.select_runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, run_id);
        assert_eq!(runs[0].start_us, 100);
        assert!(runs[0].finished_at_us.is_none());

        session.end_run(run_id, 500).unwrap();
        let runs = session.select_runs().unwrap();
        assert_eq!(runs[0].finished_at_us, Some(500));
        assert!(!runs[0].closed_incorrect);
    }

    #[test]
    fn test_close_incomplete_runs() {
        let (_dir, session) = open_fresh();

        session.insert_run(100, 100).unwrap();
        session.insert_run(200, 200).unwrap();
        let repaired = session.close_incomplete_runs(300).unwrap();
        assert_eq!(repaired, 2);

        let runs = session.select_runs().unwrap();
        assert!(runs.iter().all(|r| r.closed_incorrect));
        assert!(runs.iter().all(|r| r.finished_at_us == Some(300)));
    }

    #[test]
    fn test_purge_primitives_and_orphans() {
        let (_dir, mut session) = open_fresh();

        let tx = session.write_tx().unwrap();
        let data_id = tx
            .insert_shared(PayloadClass::EventData, 1, r#"{"k":1}"#)
            .unwrap();
        tx.insert_event(&EventRow {
            event_type: "automation_triggered".into(),
            time_fired_us: 100,
            data_id: Some(data_id),
            context_id: None,
        })
        .unwrap();
        tx.insert_event(&EventRow {
            event_type: "automation_triggered".into(),
            time_fired_us: 900,
            data_id: Some(data_id),
            context_id: None,
        })
        .unwrap();
        tx.commit().unwrap();

        let expired = session.select_expired_event_ids(500, 100).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(session.delete_events(&expired).unwrap(), 1);

        // Still referenced by the newer event.
        assert!(session
            .select_orphaned_shared(PayloadClass::EventData)
            .unwrap()
            .is_empty());

        let rest = session.select_expired_event_ids(i64::MAX, 100).unwrap();
        session.delete_events(&rest).unwrap();
        let orphans = session.select_orphaned_shared(PayloadClass::EventData).unwrap();
        assert_eq!(orphans, vec![data_id]);
        assert_eq!(
            session.delete_shared(PayloadClass::EventData, &orphans).unwrap(),
            1
        );
    }

    #[test]
    fn test_delete_states_detaches_chain() {
        let (_dir, mut session) = open_fresh();

        let tx = session.write_tx().unwrap();
        let first = tx
            .insert_state(&StateRow {
                entity_id: "light.porch".into(),
                state: "on".into(),
                last_updated_us: 100,
                attributes_id: None,
                old_state_id: None,
                context_id: None,
            })
            .unwrap();
        tx.insert_state(&StateRow {
            entity_id: "light.porch".into(),
            state: "off".into(),
            last_updated_us: 200,
            attributes_id: None,
            old_state_id: Some(first),
            context_id: None,
        })
        .unwrap();
        tx.commit().unwrap();

        assert_eq!(session.delete_states(&[first]).unwrap(), 1);

        let dangling: i64 = session
            .conn
            .query_row(
                "SELECT COUNT(*) FROM states WHERE old_state_id IS NOT NULL",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(dangling, 0);
    }

    #[test]
    fn test_update_entity_id() {
        let (_dir, mut session) = open_fresh();

        let tx = session.write_tx().unwrap();
        tx.insert_state(&StateRow {
            entity_id: "light.old".into(),
            state: "on".into(),
            last_updated_us: 1,
            attributes_id: None,
            old_state_id: None,
            context_id: None,
        })
        .unwrap();
        tx.commit().unwrap();

        assert_eq!(session.update_entity_id("light.old", "light.new").unwrap(), 1);
        assert_eq!(session.update_entity_id("light.old", "light.new").unwrap(), 0);
    }

    #[test]
    fn test_thread_affinity_is_enforced() {
        let (_dir, session) = open_fresh();

        // A session is Send, but using it from a foreign thread must fail.
        let (send_back, receive_back) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            let err = session.keep_alive().unwrap_err();
            send_back.send(session).unwrap();
            err
        });
        let err = handle.join().unwrap();
        assert!(matches!(err, RecorderError::ThreadAffinity(_)));

        // Re-binding on checkout is what makes pooled reuse legal.
        let mut session = receive_back.recv().unwrap();
        session.rebind_owner();
        session.keep_alive().unwrap();
    }
}
