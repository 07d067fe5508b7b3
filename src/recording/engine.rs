// src/recording/engine.rs
//! The recorder engine: single-writer worker loop
//!
//! One dedicated thread owns the write session, both dedup caches and the
//! run index. Everything else in the process talks to it through immutable
//! tasks on a bounded FIFO, or through read-only snapshots.
//!
//! # Lifecycle
//!
//! ```text
//! INIT → CONNECTING → { SETUP_FAILED | MIGRATING } → RUNNING → STOPPING → STOPPED
//! ```
//!
//! Readiness signals resolve in order: `connected` → `db_ready` →
//! `fully_ready`. Terminal failure paths resolve every remaining signal so
//! observers never hang; the engine state carries the outcome.

use crate::event::{EventFilter, HubEvent, StateChangedData, EVENT_STATE_CHANGED};
use crate::recording::dedup_cache::{hash_payload, ContentAddressedCache, PayloadRef};
use crate::recording::run_history::RunHistory;
use crate::recording::scheduler::Scheduler;
use crate::recording::task::{
    AdjustStatisticsTask, CommitTask, DatabaseLockTask, EventTask, ImportStatisticsTask,
    PurgeTask, StatisticsSink, StopTask, SynchronizeTask, Task, UpdateEntityIdTask,
};
use crate::recording::task_queue::{QueueStats, TaskQueue};
use crate::storage::pool::{ConnectionPool, JobPool, ReadSession, DEFAULT_HELPER_THREADS,
    DEFAULT_MAX_READERS};
use crate::storage::session::{EventRow, Session, StateRow};
use crate::storage::{
    migration::{SchemaMigrationCoordinator, SqliteMigrations},
    move_away_broken_database, PayloadClass,
};
use crate::utils::config::RecorderConfig;
use crate::utils::errors::{RecorderError, Result};
use crate::utils::notify::{
    Notifier, NOTIFY_BACKUP_UNTRUSTWORTHY, NOTIFY_CONNECTION_FAILED, NOTIFY_MIGRATION_FAILED,
    NOTIFY_MIGRATION_IN_PROGRESS,
};
use crate::utils::signal::ReadySignal;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Full cache/session expire runs every this many commits
const EXPIRE_AFTER_COMMITS: u32 = 120;

/// How long a lock requester waits for the grant
const DB_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Re-check cadence of the unlock signal and the backlog while locked
const DB_LOCK_QUEUE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// While locked, abandon the lock past this fraction of the backlog ceiling
const QUEUE_OVERFLOW_FRACTION: f64 = 0.9;

/// Poll cadence while waiting for the host-started signal
const STARTUP_WAIT_POLL: Duration = Duration::from_millis(100);

/// Row budget of one purge pass; the task tail-chains until drained
const PURGE_BATCH_SIZE: usize = 4096;

/// Engine lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Init = 0,
    Connecting = 1,
    SetupFailed = 2,
    Migrating = 3,
    Running = 4,
    Stopping = 5,
    Stopped = 6,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::Init,
            1 => EngineState::Connecting,
            2 => EngineState::SetupFailed,
            3 => EngineState::Migrating,
            4 => EngineState::Running,
            5 => EngineState::Stopping,
            _ => EngineState::Stopped,
        }
    }
}

/// The engine's readiness signals, resolved in declaration order
#[derive(Debug, Clone, Default)]
pub struct Readiness {
    /// Connection attempt finished
    pub connected: ReadySignal,
    /// Schema validated as current, or a live migration is pending
    pub db_ready: ReadySignal,
    /// First run open, periodic work scheduled
    pub fully_ready: ReadySignal,
}

/// State shared between the handle, the worker and the scheduler
pub(crate) struct EngineShared {
    pub(crate) config: RecorderConfig,
    pub(crate) queue: TaskQueue,
    pub(crate) readiness: Readiness,
    pub(crate) host_started: ReadySignal,
    pub(crate) shutdown_requested: ReadySignal,
    pub(crate) state: AtomicU8,
    pub(crate) accepting: AtomicBool,
    pub(crate) filter: EventFilter,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) run_history: Arc<RunHistory>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) stats_sink: Option<Arc<dyn StatisticsSink>>,
    pub(crate) job_pool: Mutex<Option<JobPool>>,
}

impl EngineShared {
    pub(crate) fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EngineState) {
        let previous = self.state.swap(state as u8, Ordering::AcqRel);
        debug!(from = ?EngineState::from_u8(previous), to = ?state, "engine state");
    }

    /// Resolve every readiness signal; terminal paths call this so waiters
    /// wake up and read the state for the outcome.
    fn resolve_all_signals(&self) {
        self.readiness.connected.set();
        self.readiness.db_ready.set();
        self.readiness.fully_ready.set();
    }

    /// Sample queue depth against the ceiling. Returns whether this call
    /// performed the stop-accepting transition (it happens exactly once).
    pub(crate) fn check_backlog(&self) -> bool {
        let depth = self.queue.len();
        if depth <= self.config.max_backlog {
            return false;
        }
        if self.accepting.swap(false, Ordering::AcqRel) {
            error!(
                depth,
                ceiling = self.config.max_backlog,
                "backlog ceiling exceeded; recorder no longer accepting events"
            );
            true
        } else {
            false
        }
    }
}

struct ActiveLock {
    unlock: ReadySignal,
    overflow: Arc<AtomicBool>,
}

/// Handle to the recorder engine
///
/// Cheap to share by reference; all methods take `&self`. Producers feed
/// [`RecorderEngine::handle_event`]; maintenance and control go through the
/// dedicated methods, which enqueue tasks in strict FIFO order.
pub struct RecorderEngine {
    shared: Arc<EngineShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    scheduler: Mutex<Option<Scheduler>>,
    lock: Mutex<Option<ActiveLock>>,
}

impl RecorderEngine {
    pub fn new(config: RecorderConfig) -> Result<Self> {
        Self::with_collaborators(config, Arc::new(crate::utils::notify::LogNotifier), None)
    }

    /// Create an engine with host-supplied collaborators
    pub fn with_collaborators(
        config: RecorderConfig,
        notifier: Arc<dyn Notifier>,
        stats_sink: Option<Arc<dyn StatisticsSink>>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(ConnectionPool::new(&config.db_url, DEFAULT_MAX_READERS)?);

        let filter = EventFilter::new(
            config.include_event_types.clone(),
            config.exclude_event_types.clone(),
            config.include_entities.clone(),
            config.exclude_entities.clone(),
        );

        // Headroom above the watchdog ceiling so control tasks still fit
        // after a breach.
        let capacity = config.max_backlog + config.max_backlog / 10 + 64;

        Ok(Self {
            shared: Arc::new(EngineShared {
                queue: TaskQueue::new(capacity),
                readiness: Readiness::default(),
                host_started: ReadySignal::new(),
                shutdown_requested: ReadySignal::new(),
                state: AtomicU8::new(EngineState::Init as u8),
                accepting: AtomicBool::new(true),
                filter,
                pool,
                run_history: Arc::new(RunHistory::new(Utc::now())),
                notifier,
                stats_sink,
                job_pool: Mutex::new(None),
                config,
            }),
            worker: Mutex::new(None),
            scheduler: Mutex::new(None),
            lock: Mutex::new(None),
        })
    }

    /// Spawn the worker and scheduler threads; idempotent
    pub fn start(&self) -> Result<()> {
        let mut slot = self.worker.lock();
        if slot.is_some() {
            return Ok(());
        }

        let worker = EngineWorker::new(Arc::clone(&self.shared));
        let handle = thread::Builder::new()
            .name("recorder".into())
            .spawn(move || worker.run())?;
        *slot = Some(handle);

        *self.scheduler.lock() = Some(Scheduler::spawn(Arc::clone(&self.shared)));
        Ok(())
    }

    // --- ingest path ---

    /// Bus callback: filter, then enqueue. Never blocks the caller.
    pub fn handle_event(&self, event: HubEvent) {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return;
        }
        if !self.shared.filter.allows(&event) {
            return;
        }
        if self.shared.queue.push(Box::new(EventTask::new(event))).is_err() {
            warn!("task queue full; dropping event");
        }
    }

    /// Whether the engine is still subscribed to the event source
    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }

    // --- control ---

    /// Request a flush of everything staged
    pub fn flush(&self) {
        self.shared.queue.push_blocking(Box::new(CommitTask));
    }

    /// FIFO barrier: the returned signal fires once every task enqueued
    /// before it has executed and staged writes are committed.
    pub fn synchronize(&self) -> ReadySignal {
        let done = ReadySignal::new();
        self.shared
            .queue
            .push_blocking(Box::new(SynchronizeTask::new(done.clone())));
        done
    }

    /// Convenience: synchronize and wait, bounded
    pub fn block_till_done(&self, timeout: Duration) -> bool {
        self.synchronize().wait_timeout(timeout)
    }

    /// Enqueue a retention pass deleting rows older than `purge_before`
    pub fn purge(&self, purge_before: DateTime<Utc>, repack: bool) {
        self.shared.queue.push_blocking(Box::new(PurgeTask {
            purge_before,
            repack,
        }));
    }

    pub fn adjust_statistics(&self, statistic_id: String, start: DateTime<Utc>, adjustment: f64) {
        self.shared.queue.push_blocking(Box::new(AdjustStatisticsTask {
            statistic_id,
            start,
            adjustment,
        }));
    }

    pub fn import_statistics(&self, payload: serde_json::Value) {
        self.shared
            .queue
            .push_blocking(Box::new(ImportStatisticsTask { payload }));
    }

    pub fn update_entity_id(&self, old_entity_id: String, new_entity_id: String) {
        self.shared.queue.push_blocking(Box::new(UpdateEntityIdTask {
            old_entity_id,
            new_entity_id,
        }));
    }

    /// Acquire the exclusive write lock for a backup. Blocks up to the lock
    /// timeout for the grant; writes stay queued while the lock is held.
    pub fn lock_database(&self) -> Result<()> {
        self.lock_database_with_timeout(DB_LOCK_TIMEOUT)
    }

    fn lock_database_with_timeout(&self, timeout: Duration) -> Result<()> {
        let mut slot = self.lock.lock();
        if slot.is_some() {
            return Err(RecorderError::AlreadyLocked);
        }

        let locked = ReadySignal::new();
        let unlock = ReadySignal::new();
        let overflow = Arc::new(AtomicBool::new(false));
        self.shared.queue.push_blocking(Box::new(DatabaseLockTask {
            locked: locked.clone(),
            unlock: unlock.clone(),
            queue_overflow: Arc::clone(&overflow),
        }));

        if !locked.wait_timeout(timeout) {
            // The task may still run later; make it release immediately.
            unlock.set();
            return Err(RecorderError::LockTimeout);
        }

        *slot = Some(ActiveLock { unlock, overflow });
        Ok(())
    }

    /// Release the backup lock. Returns whether the backup can be trusted:
    /// `false` means the backlog forced the engine to resume writing while
    /// the lock was supposedly held.
    pub fn unlock_database(&self) -> bool {
        let Some(active) = self.lock.lock().take() else {
            return true;
        };
        active.unlock.set();
        let trustworthy = !active.overflow.load(Ordering::Acquire);
        if !trustworthy {
            self.shared.notifier.create(
                NOTIFY_BACKUP_UNTRUSTWORTHY,
                "Recorder backup",
                "Writes resumed while the database was locked; the backup taken \
                 during this window must not be trusted.",
            );
        }
        trustworthy
    }

    /// Host signal: startup finished, CPU-heavy work may begin
    pub fn note_host_started(&self) {
        self.shared.host_started.set();
    }

    /// Normal stop: the backlog is processed, the run is finalized, then
    /// everything closes. Blocks until the worker exits.
    pub fn stop(&self) {
        self.shared.shutdown_requested.set();
        self.shared.queue.push_blocking(Box::new(StopTask));
        self.join_threads();
    }

    /// Emergency stop: the backlog is discarded and replaced with a single
    /// stop marker so termination is prompt even under pressure.
    pub fn shutdown_now(&self) {
        self.shared.shutdown_requested.set();
        let dropped = self.shared.queue.drain();
        if dropped > 0 {
            warn!(dropped, "emergency shutdown discarded queued tasks");
        }
        self.shared.queue.push_blocking(Box::new(StopTask));
        self.join_threads();
    }

    fn join_threads(&self) {
        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("recorder worker panicked");
            }
        }
    }

    // --- observation & read side ---

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    pub fn readiness(&self) -> &Readiness {
        &self.shared.readiness
    }

    /// Wait for startup to finish; `true` only if the engine is running
    pub fn wait_fully_ready(&self, timeout: Duration) -> bool {
        self.shared.readiness.fully_ready.wait_timeout(timeout)
            && self.shared.state() == EngineState::Running
    }

    pub fn run_history(&self) -> Arc<RunHistory> {
        Arc::clone(&self.shared.run_history)
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.shared.queue.stats()
    }

    fn read_side_available(&self) -> bool {
        self.shared.readiness.db_ready.is_set()
            && matches!(
                self.shared.state(),
                EngineState::Migrating | EngineState::Running
            )
    }

    /// Check out a read-only session for an external collaborator
    pub fn get_session(&self) -> Result<ReadSession> {
        if !self.read_side_available() {
            return Err(RecorderError::NotReady);
        }
        self.shared.pool.read_session()
    }

    /// Run a read job on the auxiliary I/O pool; the receiver yields the
    /// job's result.
    pub fn run_db_job<T, F>(&self, job: F) -> Result<crossbeam_channel::Receiver<Result<T>>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Session) -> Result<T> + Send + 'static,
    {
        if !self.read_side_available() {
            return Err(RecorderError::NotReady);
        }
        let guard = self.shared.job_pool.lock();
        let Some(jobs) = guard.as_ref() else {
            return Err(RecorderError::NotReady);
        };
        let (tx, rx) = crossbeam_channel::bounded(1);
        jobs.submit(Box::new(move |session| {
            let _ = tx.send(job(session));
        }))?;
        Ok(rx)
    }
}

/// Where an entity's previous state row lives
#[derive(Debug, Clone, Copy)]
enum StateRef {
    Committed(i64),
    /// Index into the current pending-states batch
    Pending(usize),
}

#[derive(Debug)]
struct PendingEvent {
    event_type: String,
    time_fired_us: i64,
    payload: Option<PayloadRef>,
    context_id: Option<String>,
}

#[derive(Debug)]
struct PendingState {
    entity_id: String,
    state: String,
    last_updated_us: i64,
    attributes: Option<PayloadRef>,
    old_state: Option<StateRef>,
    context_id: Option<String>,
}

/// The worker-side of the engine: owns every piece of mutable state
pub struct EngineWorker {
    shared: Arc<EngineShared>,
    migrations: Box<dyn SchemaMigrationCoordinator>,
    session: Option<Session>,
    event_data_cache: ContentAddressedCache,
    state_attributes_cache: ContentAddressedCache,
    pending_events: Vec<PendingEvent>,
    pending_states: Vec<PendingState>,
    /// Latest state row per entity, for old-state chaining
    last_state_ids: HashMap<String, StateRef>,
    commits_since_expire: u32,
    stop_requested: bool,
}

impl EngineWorker {
    fn new(shared: Arc<EngineShared>) -> Self {
        let event_cap = NonZeroUsize::new(shared.config.event_data_cache_size)
            .unwrap_or(NonZeroUsize::MIN);
        let attrs_cap = NonZeroUsize::new(shared.config.state_attributes_cache_size)
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            migrations: Box::new(SqliteMigrations),
            session: None,
            event_data_cache: ContentAddressedCache::new(PayloadClass::EventData, event_cap),
            state_attributes_cache: ContentAddressedCache::new(
                PayloadClass::StateAttributes,
                attrs_cap,
            ),
            pending_events: Vec::new(),
            pending_states: Vec::new(),
            last_state_ids: HashMap::new(),
            commits_since_expire: 0,
            stop_requested: false,
            shared,
        }
    }

    // --- startup ---

    fn run(mut self) {
        self.shared.set_state(EngineState::Connecting);
        if let Err(e) = self.setup_connection() {
            error!("database connection failed: {}", e);
            self.shared.notifier.create(
                NOTIFY_CONNECTION_FAILED,
                "Recorder",
                &format!("The recorder could not connect to its database: {}", e),
            );
            self.shared.set_state(EngineState::SetupFailed);
            self.shared.resolve_all_signals();
            return;
        }
        self.shared.readiness.connected.set();

        let status = match self.validate_schema() {
            Ok(status) => status,
            Err(e) => {
                self.fail_migration(e);
                return;
            }
        };
        let valid = self.migrations.schema_is_valid(&status);
        let live = self.migrations.is_live_migration(&status);

        if valid || live {
            // Ready for use early; hold heavy work until the host is up.
            self.shared.readiness.db_ready.set();
            if !self.wait_for_host_start() {
                info!("shutdown before host startup finished; skipping migration");
                self.cleanup_aborted_start();
                return;
            }
        }

        if !valid {
            self.shared.set_state(EngineState::Migrating);
            self.shared.notifier.create(
                NOTIFY_MIGRATION_IN_PROGRESS,
                "Recorder",
                "The recorder database is being upgraded; history is temporarily unavailable.",
            );
            let result = self.migrate_schema(&status);
            self.shared.notifier.dismiss(NOTIFY_MIGRATION_IN_PROGRESS);
            if let Err(e) = result {
                self.fail_migration(e);
                return;
            }
            if !live {
                self.shared.readiness.db_ready.set();
            }
        }

        if let Err(e) = self.open_run() {
            error!("could not open the recording run: {}", e);
            self.shared.set_state(EngineState::SetupFailed);
            self.close_session();
            self.shared.resolve_all_signals();
            return;
        }

        *self.shared.job_pool.lock() =
            Some(JobPool::new(&self.shared.pool, DEFAULT_HELPER_THREADS));
        self.shared.readiness.fully_ready.set();
        self.shared.set_state(EngineState::Running);
        info!("recorder started");

        self.process_loop();
        self.shutdown();
    }

    fn setup_connection(&mut self) -> Result<()> {
        let max_retries = self.shared.config.max_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.shared.pool.open_worker_session() {
                Ok(session) => {
                    self.session = Some(session);
                    return Ok(());
                }
                Err(e @ RecorderError::UnsupportedBackend(_)) => return Err(e),
                Err(e)
                    if e.is_corruption() && self.shared.pool.backend().is_file_based() =>
                {
                    error!("store is corrupt at startup: {}", e);
                    move_away_broken_database(self.shared.pool.db_path())?;
                }
                Err(e) if attempt < max_retries => {
                    warn!(attempt, "database connection failed, retrying: {}", e);
                    thread::sleep(self.shared.config.retry_wait());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn validate_schema(&mut self) -> Result<crate::storage::SchemaStatus> {
        let Some(session) = self.session.as_mut() else {
            return Err(RecorderError::ShuttingDown);
        };
        self.migrations.validate_schema(session)
    }

    fn migrate_schema(&mut self, status: &crate::storage::SchemaStatus) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(RecorderError::ShuttingDown);
        };
        self.migrations.migrate_schema(session, status)
    }

    /// Wait for the host to finish starting; `false` means shutdown won
    fn wait_for_host_start(&self) -> bool {
        loop {
            if self.shared.host_started.wait_timeout(STARTUP_WAIT_POLL) {
                return true;
            }
            if self.shared.shutdown_requested.is_set() {
                return false;
            }
        }
    }

    fn cleanup_aborted_start(&mut self) {
        self.shared.run_history.clear();
        self.close_session();
        self.shared.set_state(EngineState::Stopped);
        self.shared.resolve_all_signals();
    }

    fn fail_migration(&mut self, error: RecorderError) {
        error!("schema migration failed: {}", error);
        self.shared.notifier.create(
            NOTIFY_MIGRATION_FAILED,
            "Recorder",
            &format!(
                "The recorder database upgrade failed and recording is disabled: {}",
                error
            ),
        );
        self.shared.set_state(EngineState::Stopping);
        self.close_session();
        self.shared.set_state(EngineState::Stopped);
        self.shared.resolve_all_signals();
    }

    fn open_run(&mut self) -> Result<()> {
        let Some(session) = self.session.as_ref() else {
            return Err(RecorderError::ShuttingDown);
        };
        self.shared.run_history.start(session)
    }

    // --- main loop ---

    fn process_loop(&mut self) {
        while !self.stop_requested {
            let task = self.shared.queue.pop();
            self.guarded_run(task);
        }
    }

    /// Dispatch one task. Database failures recycle the session (or trigger
    /// corruption recovery); anything else is logged and swallowed so one
    /// bad task never kills the worker.
    fn guarded_run(&mut self, task: Box<dyn Task>) {
        if task.commit_before() {
            if let Err(e) = self.commit_or_retry() {
                self.recover_from(e);
            }
        }

        let descr = format!("{:?}", task);
        match catch_unwind(AssertUnwindSafe(|| task.run(self))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_database() => self.recover_from(e),
            Ok(Err(e)) => warn!(task = %descr, "task failed: {}", e),
            Err(_) => error!(task = %descr, "task panicked"),
        }
    }

    fn recover_from(&mut self, error: RecorderError) {
        if error.is_corruption() && self.shared.pool.backend().is_file_based() {
            error!("database corruption detected: {}", error);
            if let Err(e) = self.recover_from_corruption() {
                error!("corruption recovery failed, stopping: {}", e);
                self.stop_requested = true;
            }
        } else {
            warn!("database error, recycling session: {}", error);
            self.reopen_session();
        }
    }

    fn reopen_session(&mut self) {
        self.close_session();
        self.discard_assigned_ids();
        match self.shared.pool.open_worker_session() {
            Ok(session) => self.session = Some(session),
            Err(e) => {
                error!("could not reopen the session, stopping: {}", e);
                self.stop_requested = true;
            }
        }
    }

    /// Quarantine the damaged store and rebuild a fresh one: close, move
    /// the file aside, reset the run epoch, wipe caches and staged writes,
    /// reinitialize and open a new run.
    fn recover_from_corruption(&mut self) -> Result<()> {
        warn!(
            lost_events = self.pending_events.len(),
            lost_states = self.pending_states.len(),
            "rebuilding store after corruption; uncommitted rows are lost"
        );

        self.close_session();
        // Helper sessions hold open handles on the damaged file; recycle
        // the whole auxiliary pool along with the idle readers.
        if let Some(mut jobs) = self.shared.job_pool.lock().take() {
            jobs.close();
        }
        self.shared.pool.close_idle_readers();
        move_away_broken_database(self.shared.pool.db_path())?;

        self.shared.run_history.reset(Utc::now());
        self.event_data_cache.reset();
        self.state_attributes_cache.reset();
        self.pending_events.clear();
        self.pending_states.clear();
        self.last_state_ids.clear();
        self.commits_since_expire = 0;

        self.setup_connection()?;
        let status = self.validate_schema()?;
        if !self.migrations.schema_is_valid(&status) {
            return Err(RecorderError::Migration(
                "fresh store did not come up at the current schema version".into(),
            ));
        }
        self.open_run()?;
        *self.shared.job_pool.lock() =
            Some(JobPool::new(&self.shared.pool, DEFAULT_HELPER_THREADS));
        info!("fresh store initialized after corruption");
        Ok(())
    }

    // --- ingest ---

    pub(crate) fn process_event(&mut self, event: HubEvent) -> Result<()> {
        if event.event_type == EVENT_STATE_CHANGED {
            self.stage_state_changed(event)?;
        } else {
            self.stage_plain_event(event)?;
        }

        if self.shared.config.commit_synchronously() {
            self.commit_or_retry()?;
        }
        Ok(())
    }

    fn stage_plain_event(&mut self, event: HubEvent) -> Result<()> {
        let payload = match serialize_payload(&event.data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event_type = %event.event_type, "dropping unserializable event: {}", e);
                return Ok(());
            }
        };

        let payload_ref = match payload {
            None => None,
            Some(serialized) => {
                let key: Arc<str> = Arc::from(serialized);
                Some(self.resolve_payload(PayloadClass::EventData, key)?)
            }
        };

        self.pending_events.push(PendingEvent {
            event_type: event.event_type,
            time_fired_us: event.time_fired.timestamp_micros(),
            payload: payload_ref,
            context_id: event.context_id,
        });
        Ok(())
    }

    fn stage_state_changed(&mut self, event: HubEvent) -> Result<()> {
        let change: StateChangedData = match serde_json::from_value(event.data.clone()) {
            Ok(change) => change,
            Err(e) => {
                warn!("dropping malformed state_changed event: {}", e);
                return Ok(());
            }
        };

        let attributes = match serialize_payload(&change.attributes) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(entity_id = %change.entity_id, "dropping state with unserializable attributes: {}", e);
                return Ok(());
            }
        };
        let attributes_ref = match attributes {
            None => None,
            Some(serialized) => {
                let key: Arc<str> = Arc::from(serialized);
                Some(self.resolve_payload(PayloadClass::StateAttributes, key)?)
            }
        };

        let old_state = self.last_state_ids.get(&change.entity_id).copied();
        let index = self.pending_states.len();
        self.pending_states.push(PendingState {
            entity_id: change.entity_id.clone(),
            state: change.state,
            last_updated_us: event.time_fired.timestamp_micros(),
            attributes: attributes_ref,
            old_state,
            context_id: event.context_id,
        });
        self.last_state_ids
            .insert(change.entity_id, StateRef::Pending(index));
        Ok(())
    }

    /// Dedup resolution: pending map, LRU, store lookup; stage on total miss
    fn resolve_payload(&mut self, class: PayloadClass, key: Arc<str>) -> Result<PayloadRef> {
        let Some(session) = self.session.as_ref() else {
            return Err(RecorderError::ShuttingDown);
        };
        let hash = hash_payload(&key);
        let cache = match class {
            PayloadClass::EventData => &mut self.event_data_cache,
            PayloadClass::StateAttributes => &mut self.state_attributes_cache,
        };
        match cache.get(&key, hash, |h, p| session.lookup_shared(class, h, p))? {
            Some(found) => Ok(found),
            None => {
                cache.stage(Arc::clone(&key), hash);
                Ok(PayloadRef::Pending(key))
            }
        }
    }

    // --- commit ---

    pub(crate) fn commit(&mut self) -> Result<()> {
        self.commit_or_retry()
    }

    fn has_pending(&self) -> bool {
        !self.pending_events.is_empty()
            || !self.pending_states.is_empty()
            || self.event_data_cache.pending_len() > 0
            || self.state_attributes_cache.pending_len() > 0
    }

    /// Commit staged writes, retrying transient errors with a fixed wait.
    /// The whole flush is one transaction, so a retry never re-applies
    /// side effects of a failed attempt.
    fn commit_or_retry(&mut self) -> Result<()> {
        if !self.has_pending() {
            return Ok(());
        }

        let max_retries = self.shared.config.max_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.commit_once() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < max_retries => {
                    warn!(attempt, "transient commit error, retrying: {}", e);
                    self.discard_assigned_ids();
                    thread::sleep(self.shared.config.retry_wait());
                }
                Err(e) => {
                    self.discard_assigned_ids();
                    return Err(e);
                }
            }
        }
    }

    fn commit_once(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(RecorderError::ShuttingDown);
        };
        let tx = session.write_tx()?;

        // Shared payloads first, so rows can reference their assigned ids
        // within the same transaction.
        for (payload, entry) in self.event_data_cache.pending_mut() {
            entry.id = Some(tx.insert_shared(PayloadClass::EventData, entry.hash, payload)?);
        }
        for (payload, entry) in self.state_attributes_cache.pending_mut() {
            entry.id = Some(tx.insert_shared(
                PayloadClass::StateAttributes,
                entry.hash,
                payload,
            )?);
        }

        for row in &self.pending_events {
            let data_id = match &row.payload {
                None => None,
                Some(PayloadRef::Committed(id)) => Some(*id),
                Some(PayloadRef::Pending(key)) => {
                    let id = self.event_data_cache.pending_id(key);
                    if id.is_none() {
                        error!("staged event payload is missing its id");
                    }
                    id
                }
            };
            tx.insert_event(&EventRow {
                event_type: row.event_type.clone(),
                time_fired_us: row.time_fired_us,
                data_id,
                context_id: row.context_id.clone(),
            })?;
        }

        let mut inserted_state_ids = Vec::with_capacity(self.pending_states.len());
        for row in &self.pending_states {
            let attributes_id = match &row.attributes {
                None => None,
                Some(PayloadRef::Committed(id)) => Some(*id),
                Some(PayloadRef::Pending(key)) => {
                    let id = self.state_attributes_cache.pending_id(key);
                    if id.is_none() {
                        error!("staged state attributes are missing their id");
                    }
                    id
                }
            };
            let old_state_id = match row.old_state {
                None => None,
                Some(StateRef::Committed(id)) => Some(id),
                Some(StateRef::Pending(index)) => inserted_state_ids.get(index).copied(),
            };
            let state_id = tx.insert_state(&StateRow {
                entity_id: row.entity_id.clone(),
                state: row.state.clone(),
                last_updated_us: row.last_updated_us,
                attributes_id,
                old_state_id,
                context_id: row.context_id.clone(),
            })?;
            inserted_state_ids.push(state_id);
        }

        tx.commit()?;

        // Only now is the cache authoritative again.
        self.event_data_cache.post_commit_pending();
        self.state_attributes_cache.post_commit_pending();
        self.pending_events.clear();
        for state_ref in self.last_state_ids.values_mut() {
            if let StateRef::Pending(index) = *state_ref {
                if let Some(&id) = inserted_state_ids.get(index) {
                    *state_ref = StateRef::Committed(id);
                }
            }
        }
        self.pending_states.clear();

        self.commits_since_expire += 1;
        if self.commits_since_expire >= EXPIRE_AFTER_COMMITS {
            self.expire_caches();
        }
        Ok(())
    }

    fn discard_assigned_ids(&mut self) {
        self.event_data_cache.discard_pending_ids();
        self.state_attributes_cache.discard_pending_ids();
    }

    /// Expiry is relatively costly, so it runs every N commits rather than
    /// per commit.
    fn expire_caches(&mut self) {
        debug!(
            commits = self.commits_since_expire,
            "expiring caches and session statement cache"
        );
        self.event_data_cache.expire();
        self.state_attributes_cache.expire();
        if let Some(session) = self.session.as_ref() {
            session.expire();
        }
        self.commits_since_expire = 0;
    }

    // --- maintenance tasks ---

    pub(crate) fn send_keep_alive(&mut self) -> Result<()> {
        let Some(session) = self.session.as_ref() else {
            return Err(RecorderError::ShuttingDown);
        };
        session.keep_alive()
    }

    pub(crate) fn purge(&mut self, purge_before: DateTime<Utc>, repack: bool) -> Result<()> {
        let before_us = purge_before.timestamp_micros();
        let Some(session) = self.session.as_ref() else {
            return Err(RecorderError::ShuttingDown);
        };

        let state_ids = session.select_expired_state_ids(before_us, PURGE_BATCH_SIZE)?;
        let event_ids = session.select_expired_event_ids(before_us, PURGE_BATCH_SIZE)?;
        session.delete_states(&state_ids)?;
        session.delete_events(&event_ids)?;
        debug!(
            states = state_ids.len(),
            events = event_ids.len(),
            "purge pass deleted expired rows"
        );

        // Old-state chaining must not point at deleted rows.
        let deleted: std::collections::HashSet<i64> = state_ids.iter().copied().collect();
        self.last_state_ids.retain(|_, state_ref| {
            !matches!(state_ref, StateRef::Committed(id) if deleted.contains(id))
        });

        if state_ids.len() == PURGE_BATCH_SIZE || event_ids.len() == PURGE_BATCH_SIZE {
            // More rows remain; run another pass after queued work.
            let _ = self.shared.queue.push(Box::new(PurgeTask {
                purge_before,
                repack,
            }));
            return Ok(());
        }

        for class in [PayloadClass::EventData, PayloadClass::StateAttributes] {
            let orphans = session.select_orphaned_shared(class)?;
            if orphans.is_empty() {
                continue;
            }
            session.delete_shared(class, &orphans)?;
            let purged: std::collections::HashSet<i64> = orphans.into_iter().collect();
            match class {
                PayloadClass::EventData => self.event_data_cache.evict_purged(&purged),
                PayloadClass::StateAttributes => {
                    self.state_attributes_cache.evict_purged(&purged)
                }
            }
        }

        if repack {
            info!("repacking store after purge");
            session.repack()?;
        }
        Ok(())
    }

    pub(crate) fn update_entity_id(&mut self, old: &str, new: &str) -> Result<()> {
        let Some(session) = self.session.as_ref() else {
            return Err(RecorderError::ShuttingDown);
        };
        let updated = session.update_entity_id(old, new)?;
        info!(old, new, updated, "entity id updated");
        if let Some(state_ref) = self.last_state_ids.remove(old) {
            self.last_state_ids.insert(new.to_string(), state_ref);
        }
        Ok(())
    }

    pub(crate) fn adjust_statistics(
        &mut self,
        statistic_id: &str,
        start: DateTime<Utc>,
        adjustment: f64,
    ) -> Result<()> {
        let Some(sink) = self.shared.stats_sink.clone() else {
            warn!("statistics adjustment requested but no sink is configured");
            return Ok(());
        };
        let Some(session) = self.session.as_mut() else {
            return Err(RecorderError::ShuttingDown);
        };
        sink.adjust(session, statistic_id, start, adjustment)
    }

    pub(crate) fn import_statistics(&mut self, payload: serde_json::Value) -> Result<()> {
        let Some(sink) = self.shared.stats_sink.clone() else {
            warn!("statistics import requested but no sink is configured");
            return Ok(());
        };
        let Some(session) = self.session.as_mut() else {
            return Err(RecorderError::ShuttingDown);
        };
        sink.import(session, payload)
    }

    /// Hold the exclusive write lock until unlocked, shutdown, or backlog
    /// pressure forces an abort.
    pub(crate) fn lock_database(
        &mut self,
        locked: ReadySignal,
        unlock: ReadySignal,
        queue_overflow: Arc<AtomicBool>,
    ) -> Result<()> {
        let Some(session) = self.session.as_ref() else {
            return Err(RecorderError::ShuttingDown);
        };
        session.begin_exclusive()?;
        info!("database write lock acquired");
        locked.set();

        let ceiling =
            (self.shared.config.max_backlog as f64 * QUEUE_OVERFLOW_FRACTION) as usize;
        loop {
            if unlock.wait_timeout(DB_LOCK_QUEUE_CHECK_INTERVAL) {
                break;
            }
            if self.shared.shutdown_requested.is_set() {
                warn!("shutdown requested while the database was locked");
                queue_overflow.store(true, Ordering::Release);
                break;
            }
            if self.shared.queue.len() > ceiling {
                queue_overflow.store(true, Ordering::Release);
                warn!(
                    ceiling,
                    "backlog pressure while locked; resuming writes, backup is untrustworthy"
                );
                break;
            }
        }

        session.end_exclusive()?;
        info!("database write lock released");
        Ok(())
    }

    pub(crate) fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    // --- shutdown ---

    fn shutdown(&mut self) {
        self.shared.set_state(EngineState::Stopping);

        if let Some(session) = self.session.as_ref() {
            if let Err(e) = self.shared.run_history.end(session) {
                warn!("could not finalize the run end marker: {}", e);
            }
        }
        if let Err(e) = self.commit_or_retry() {
            warn!("final flush failed; staged rows are lost: {}", e);
        }
        if let Some(mut jobs) = self.shared.job_pool.lock().take() {
            jobs.close();
        }
        self.shared.pool.close_idle_readers();
        self.close_session();

        self.shared.set_state(EngineState::Stopped);
        self.shared.resolve_all_signals();
        info!("recorder stopped");
    }

    fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close() {
                warn!("error closing session: {}", e);
            }
        }
    }
}

/// Canonical payload form: `None` for null/empty payloads, otherwise the
/// serialized JSON with object keys in sorted order.
fn serialize_payload(value: &serde_json::Value) -> Result<Option<String>> {
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Object(map) if map.is_empty() => Ok(None),
        other => Ok(Some(serde_json::to_string(other)?)),
    }
}
