// src/recording/scheduler.rs
//! Periodic task scheduler
//!
//! A companion thread that only ever enqueues tasks; the worker stays the
//! sole owner of mutable state. Deadlines are anchored at engine start, so
//! periodic work missed while a migration was running fires immediately
//! once the engine activates (catch-up).

use crate::recording::engine::{EngineShared, EngineState};
use crate::recording::task::{CommitTask, KeepAliveTask, PurgeTask};
use crate::utils::signal::ReadySignal;
use chrono::Utc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Scheduler wake-up cadence
const TICK: Duration = Duration::from_millis(500);

/// Backlog watchdog sampling interval
const QUEUE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Nightly retention cadence
const PURGE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub(crate) struct Scheduler {
    shutdown: ReadySignal,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub(crate) fn spawn(shared: Arc<EngineShared>) -> Self {
        let shutdown = ReadySignal::new();
        let thread_shutdown = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("recorder-scheduler".into())
            .spawn(move || run(shared, thread_shutdown))
            .map_err(|e| error!("could not spawn the scheduler: {}", e))
            .ok();
        Self {
            shutdown,
            handle,
        }
    }

    pub(crate) fn stop(mut self) {
        self.shutdown.set();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(shared: Arc<EngineShared>, shutdown: ReadySignal) {
    // Deadlines are anchored here, before the engine is fully up: anything
    // that lapses during migration is due immediately on activation.
    let origin = Instant::now();
    let commit_interval = (!shared.config.commit_synchronously())
        .then(|| shared.config.commit_interval());
    let keep_alive_interval = shared
        .config
        .keep_alive_interval()
        .filter(|_| shared.pool.backend().uses_socket());

    let mut next_commit = commit_interval.map(|interval| origin + interval);
    let mut next_keep_alive = keep_alive_interval.map(|interval| origin + interval);
    let mut next_queue_check = origin + QUEUE_CHECK_INTERVAL;
    let mut next_purge = shared.config.auto_purge.then(|| origin + PURGE_INTERVAL);

    loop {
        if shutdown.wait_timeout(TICK) {
            return;
        }
        match shared.state() {
            EngineState::Running => {}
            EngineState::Stopping | EngineState::Stopped | EngineState::SetupFailed => return,
            // Still starting up or migrating; deadlines keep aging.
            _ => continue,
        }

        let now = Instant::now();

        if let (Some(due), Some(interval)) = (next_commit, commit_interval) {
            if now >= due {
                shared.queue.push_blocking(Box::new(CommitTask));
                next_commit = Some(now + interval);
            }
        }

        if let (Some(due), Some(interval)) = (next_keep_alive, keep_alive_interval) {
            if now >= due {
                shared.queue.push_blocking(Box::new(KeepAliveTask));
                next_keep_alive = Some(now + interval);
            }
        }

        if now >= next_queue_check {
            shared.check_backlog();
            next_queue_check = now + QUEUE_CHECK_INTERVAL;
        }

        if let Some(due) = next_purge {
            if now >= due {
                let purge_before = Utc::now() - shared.config.purge_keep();
                debug!(%purge_before, "scheduling nightly purge");
                shared.queue.push_blocking(Box::new(PurgeTask {
                    purge_before,
                    repack: shared.config.auto_repack,
                }));
                next_purge = Some(now + PURGE_INTERVAL);
            }
        }
    }
}
