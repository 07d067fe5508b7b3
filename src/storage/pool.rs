// src/storage/pool.rs
//! Connection lifecycle with thread affinity
//!
//! Exactly one read-write session exists per store and it belongs to the
//! engine's worker thread; a second thread asking for it is a programming
//! error, not a fallback path. Read-only access comes in two flavors:
//!
//! - a bounded pool of reader sessions checked out by external collaborators
//!   (history queries, statistics)
//! - a small fixed pool of helper threads that run submitted read jobs on
//!   their own dedicated sessions (the engine's auxiliary I/O pool)

use crate::storage::{Backend, Session};
use crate::utils::errors::{RecorderError, Result};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, warn};

/// Default number of pooled reader sessions
pub const DEFAULT_MAX_READERS: usize = 4;

/// Default number of helper I/O threads
pub const DEFAULT_HELPER_THREADS: usize = 2;

/// Capacity of the helper job channel
const JOB_CHANNEL_CAPACITY: usize = 64;

/// Per-store connection factory and registry
pub struct ConnectionPool {
    backend: Backend,
    worker: Mutex<Option<ThreadId>>,
    helpers: Mutex<HashSet<ThreadId>>,
    idle_readers: Mutex<Vec<Session>>,
    reader_count: AtomicUsize,
    max_readers: usize,
    /// Bumped when the store file is replaced; sessions from an older
    /// generation are closed instead of re-pooled.
    generation: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(db_url: &str, max_readers: usize) -> Result<Self> {
        let backend = Backend::parse(db_url)?;
        Ok(Self {
            backend,
            worker: Mutex::new(None),
            helpers: Mutex::new(HashSet::new()),
            idle_readers: Mutex::new(Vec::new()),
            reader_count: AtomicUsize::new(0),
            max_readers,
            generation: AtomicUsize::new(0),
        })
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn db_path(&self) -> &Path {
        self.backend.path()
    }

    /// Open the single read-write session. The first caller becomes the
    /// owning worker thread; reopening later (session recycle, corruption
    /// recovery) must happen on that same thread.
    pub fn open_worker_session(&self) -> Result<Session> {
        let current = thread::current().id();
        let mut worker = self.worker.lock();
        match *worker {
            None => *worker = Some(current),
            Some(owner) if owner == current => {}
            Some(owner) => {
                return Err(RecorderError::ThreadAffinity(format!(
                    "writer session belongs to {:?}, requested from {:?}",
                    owner, current
                )));
            }
        }
        drop(worker);

        Session::open(self.db_path(), false)
    }

    /// Open a dedicated read-only session for a helper thread and register
    /// the thread as part of the engine's auxiliary pool.
    pub fn open_helper_session(&self) -> Result<Session> {
        self.helpers.lock().insert(thread::current().id());
        Session::open(self.db_path(), true)
    }

    pub fn deregister_helper(&self) {
        self.helpers.lock().remove(&thread::current().id());
    }

    /// Whether the calling thread is the worker or one of its helpers
    pub fn is_engine_thread(&self) -> bool {
        let current = thread::current().id();
        if *self.worker.lock() == Some(current) {
            return true;
        }
        self.helpers.lock().contains(&current)
    }

    /// Check out a pooled read-only session for an external collaborator
    pub fn read_session(self: &Arc<Self>) -> Result<ReadSession> {
        let generation = self.generation.load(Ordering::Acquire);
        if let Some(mut session) = self.idle_readers.lock().pop() {
            session.rebind_owner();
            return Ok(ReadSession {
                session: Some(session),
                pool: Arc::clone(self),
                generation,
            });
        }

        // No idle session; open a new one if the bound allows.
        let claimed = self
            .reader_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < self.max_readers).then_some(count + 1)
            })
            .is_ok();
        if !claimed {
            return Err(RecorderError::PoolExhausted);
        }

        match Session::open(self.db_path(), true) {
            Ok(session) => Ok(ReadSession {
                session: Some(session),
                pool: Arc::clone(self),
                generation,
            }),
            Err(e) => {
                self.reader_count.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    fn return_reader(&self, session: Session, generation: usize) {
        if generation == self.generation.load(Ordering::Acquire) {
            self.idle_readers.lock().push(session);
            return;
        }
        // The store file was replaced while this session was out; its
        // handle points at the quarantined file.
        self.reader_count.fetch_sub(1, Ordering::AcqRel);
        if let Err(e) = session.close() {
            warn!("failed to close stale reader: {}", e);
        }
    }

    /// Close every idle reader and invalidate checked-out ones; used when
    /// the store file is being replaced so stale handles do not pin (or
    /// silently serve) a quarantined file.
    pub fn close_idle_readers(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let idle: Vec<Session> = self.idle_readers.lock().drain(..).collect();
        for session in idle {
            self.reader_count.fetch_sub(1, Ordering::AcqRel);
            if let Err(e) = session.close() {
                warn!("failed to close idle reader: {}", e);
            }
        }
    }
}

/// A pooled read-only session; returns to the pool on drop
pub struct ReadSession {
    session: Option<Session>,
    pool: Arc<ConnectionPool>,
    generation: usize,
}

impl std::ops::Deref for ReadSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session.as_ref().expect("session present until drop")
    }
}

impl std::ops::DerefMut for ReadSession {
    fn deref_mut(&mut self) -> &mut Session {
        self.session.as_mut().expect("session present until drop")
    }
}

impl Drop for ReadSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.return_reader(session, self.generation);
        }
    }
}

/// A read job executed on a helper thread with its own session
pub type DbJob = Box<dyn FnOnce(&mut Session) + Send + 'static>;

/// Bounded auxiliary I/O pool
///
/// Owned by the engine, closed at shutdown. Jobs run in submission order per
/// thread; there is no result channel here, callers bring their own.
pub struct JobPool {
    tx: Option<Sender<DbJob>>,
    handles: Vec<JoinHandle<()>>,
}

impl JobPool {
    pub fn new(pool: &Arc<ConnectionPool>, threads: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded::<DbJob>(JOB_CHANNEL_CAPACITY);
        let mut handles = Vec::with_capacity(threads);

        for index in 0..threads {
            let pool = Arc::clone(pool);
            let rx: Receiver<DbJob> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("recorder-io-{}", index))
                .spawn(move || {
                    let mut session = match pool.open_helper_session() {
                        Ok(session) => session,
                        Err(e) => {
                            error!("helper thread could not open a session: {}", e);
                            pool.deregister_helper();
                            return;
                        }
                    };
                    while let Ok(job) = rx.recv() {
                        job(&mut session);
                    }
                    pool.deregister_helper();
                    if let Err(e) = session.close() {
                        warn!("failed to close helper session: {}", e);
                    }
                })
                .expect("spawning helper thread");
            handles.push(handle);
        }

        Self {
            tx: Some(tx),
            handles,
        }
    }

    /// Submit a job; fails fast when the pool is saturated or closed
    pub fn submit(&self, job: DbJob) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(RecorderError::ShuttingDown)?;
        tx.try_send(job).map_err(|e| match e {
            crossbeam_channel::TrySendError::Full(_) => RecorderError::QueueFull,
            crossbeam_channel::TrySendError::Disconnected(_) => RecorderError::ShuttingDown,
        })
    }

    /// Drain and join every helper thread
    pub fn close(&mut self) {
        if self.tx.take().is_some() {
            debug!("closing helper pool");
            for handle in self.handles.drain(..) {
                if handle.join().is_err() {
                    error!("helper thread panicked");
                }
            }
        }
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migration::{SchemaMigrationCoordinator, SqliteMigrations};
    use tempfile::TempDir;

    fn pool_with_schema(max_readers: usize) -> (TempDir, Arc<ConnectionPool>) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("hearth.db").display());
        let pool = Arc::new(ConnectionPool::new(&url, max_readers).unwrap());

        let mut session = pool.open_worker_session().unwrap();
        SqliteMigrations::default()
            .validate_schema(&mut session)
            .unwrap();
        session.close().unwrap();
        (dir, pool)
    }

    #[test]
    fn test_unsupported_backend_rejected_at_construction() {
        assert!(matches!(
            ConnectionPool::new("mysql://db/hearth", 2),
            Err(RecorderError::UnsupportedBackend(_))
        ));
    }

    #[test]
    fn test_worker_session_is_single_threaded() {
        let (_dir, pool) = pool_with_schema(2);

        // Same thread may reopen (session recycling).
        let session = pool.open_worker_session().unwrap();
        session.close().unwrap();
        let session = pool.open_worker_session().unwrap();
        session.close().unwrap();

        // A different thread must be rejected loudly.
        let pool_clone = Arc::clone(&pool);
        let err = thread::spawn(move || pool_clone.open_worker_session().unwrap_err())
            .join()
            .unwrap();
        assert!(matches!(err, RecorderError::ThreadAffinity(_)));
    }

    #[test]
    fn test_reader_pool_is_bounded() {
        let (_dir, pool) = pool_with_schema(1);

        let first = pool.read_session().unwrap();
        assert!(matches!(
            pool.read_session(),
            Err(RecorderError::PoolExhausted)
        ));

        drop(first);
        let second = pool.read_session().unwrap();
        assert_eq!(second.table_count("events").unwrap(), 0);
    }

    #[test]
    fn test_stale_readers_are_not_repooled() {
        let (_dir, pool) = pool_with_schema(2);

        let first = pool.read_session().unwrap();
        // The store file is about to be replaced.
        pool.close_idle_readers();
        drop(first);

        // The checked-out session was closed instead of re-pooled, and its
        // capacity slot was released.
        assert!(pool.idle_readers.lock().is_empty());
        let _fresh = pool.read_session().unwrap();
    }

    #[test]
    fn test_job_pool_runs_jobs_and_closes() {
        let (_dir, pool) = pool_with_schema(2);
        let mut jobs = JobPool::new(&pool, 2);

        let (tx, rx) = crossbeam_channel::bounded(1);
        jobs.submit(Box::new(move |session| {
            let count = session.table_count("events").unwrap();
            tx.send(count).unwrap();
        }))
        .unwrap();
        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap(), 0);

        jobs.close();
        assert!(matches!(
            jobs.submit(Box::new(|_| {})),
            Err(RecorderError::ShuttingDown)
        ));
    }
}
