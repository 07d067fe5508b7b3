// src/recording/task.rs
//! The task protocol
//!
//! Everything the engine does flows through immutable task objects on the
//! queue, consumed exactly once by the worker. The worker never inspects a
//! task beyond this contract: `commit_before` (flush staged writes first)
//! and `run`.

use crate::event::HubEvent;
use crate::recording::engine::EngineWorker;
use crate::storage::Session;
use crate::utils::errors::Result;
use crate::utils::signal::ReadySignal;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// One unit of work for the worker
pub trait Task: Send + fmt::Debug {
    /// Flush pending writes before running this task
    fn commit_before(&self) -> bool {
        true
    }

    fn run(self: Box<Self>, worker: &mut EngineWorker) -> Result<()>;
}

/// Ingest one domain event
#[derive(Debug)]
pub struct EventTask {
    event: HubEvent,
}

impl EventTask {
    pub fn new(event: HubEvent) -> Self {
        Self { event }
    }
}

impl Task for EventTask {
    fn commit_before(&self) -> bool {
        false
    }

    fn run(self: Box<Self>, worker: &mut EngineWorker) -> Result<()> {
        worker.process_event(self.event)
    }
}

/// Commit everything staged so far
#[derive(Debug)]
pub struct CommitTask;

impl Task for CommitTask {
    fn commit_before(&self) -> bool {
        false
    }

    fn run(self: Box<Self>, worker: &mut EngineWorker) -> Result<()> {
        worker.commit()
    }
}

/// Liveness ping for socket-backed stores
#[derive(Debug)]
pub struct KeepAliveTask;

impl Task for KeepAliveTask {
    fn commit_before(&self) -> bool {
        false
    }

    fn run(self: Box<Self>, worker: &mut EngineWorker) -> Result<()> {
        worker.send_keep_alive()
    }
}

/// Queue-drain barrier: the signal fires only after every task enqueued
/// before this one has executed and staged writes are committed.
#[derive(Debug)]
pub struct SynchronizeTask {
    done: ReadySignal,
}

impl SynchronizeTask {
    pub fn new(done: ReadySignal) -> Self {
        Self { done }
    }
}

impl Task for SynchronizeTask {
    fn run(self: Box<Self>, _worker: &mut EngineWorker) -> Result<()> {
        self.done.set();
        Ok(())
    }
}

/// Terminal stop marker
#[derive(Debug)]
pub struct StopTask;

impl Task for StopTask {
    fn commit_before(&self) -> bool {
        false
    }

    fn run(self: Box<Self>, worker: &mut EngineWorker) -> Result<()> {
        worker.request_stop();
        Ok(())
    }
}

/// Retention pass; re-enqueues itself while row batches keep filling up
#[derive(Debug)]
pub struct PurgeTask {
    pub purge_before: DateTime<Utc>,
    pub repack: bool,
}

impl Task for PurgeTask {
    fn run(self: Box<Self>, worker: &mut EngineWorker) -> Result<()> {
        worker.purge(self.purge_before, self.repack)
    }
}

/// Backup coordination: hold the exclusive write lock until unlocked or the
/// backlog forces an abort.
#[derive(Debug)]
pub struct DatabaseLockTask {
    pub locked: ReadySignal,
    pub unlock: ReadySignal,
    pub queue_overflow: Arc<AtomicBool>,
}

impl Task for DatabaseLockTask {
    fn run(self: Box<Self>, worker: &mut EngineWorker) -> Result<()> {
        worker.lock_database(self.locked, self.unlock, self.queue_overflow)
    }
}

/// Bulk entity rename across recorded states
#[derive(Debug)]
pub struct UpdateEntityIdTask {
    pub old_entity_id: String,
    pub new_entity_id: String,
}

impl Task for UpdateEntityIdTask {
    fn run(self: Box<Self>, worker: &mut EngineWorker) -> Result<()> {
        worker.update_entity_id(&self.old_entity_id, &self.new_entity_id)
    }
}

/// External statistics algorithms, driven through the engine's session
pub trait StatisticsSink: Send + Sync {
    /// Adjust a recorded statistic from `start` onward
    fn adjust(
        &self,
        session: &mut Session,
        statistic_id: &str,
        start: DateTime<Utc>,
        adjustment: f64,
    ) -> Result<()>;

    /// Import externally produced statistics rows
    fn import(&self, session: &mut Session, payload: serde_json::Value) -> Result<()>;
}

/// Apply a statistics adjustment
#[derive(Debug)]
pub struct AdjustStatisticsTask {
    pub statistic_id: String,
    pub start: DateTime<Utc>,
    pub adjustment: f64,
}

impl Task for AdjustStatisticsTask {
    fn run(self: Box<Self>, worker: &mut EngineWorker) -> Result<()> {
        worker.adjust_statistics(&self.statistic_id, self.start, self.adjustment)
    }
}

/// Import externally produced statistics
#[derive(Debug)]
pub struct ImportStatisticsTask {
    pub payload: serde_json::Value,
}

impl Task for ImportStatisticsTask {
    fn run(self: Box<Self>, worker: &mut EngineWorker) -> Result<()> {
        worker.import_statistics(self.payload)
    }
}
