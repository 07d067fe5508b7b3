// src/utils/signal.rs
//! One-shot readiness signals
//!
//! The engine publishes its lifecycle through three of these, resolved in
//! order: `connected` → `db_ready` → `fully_ready`. A signal can be set from
//! any thread, setting twice is a no-op, and waiters that arrive after the
//! set return immediately. On terminal failure paths the engine resolves all
//! remaining signals so observers never hang; they read the engine state for
//! the outcome.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

/// A one-shot, idempotent signal usable across threads
#[derive(Clone, Default)]
pub struct ReadySignal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    set: Mutex<bool>,
    cond: Condvar,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the signal; idempotent
    pub fn set(&self) {
        let mut set = self.inner.set.lock();
        if !*set {
            *set = true;
            self.inner.cond.notify_all();
        }
    }

    pub fn is_set(&self) -> bool {
        *self.inner.set.lock()
    }

    /// Block until the signal is set
    pub fn wait(&self) {
        let mut set = self.inner.set.lock();
        while !*set {
            self.inner.cond.wait(&mut set);
        }
    }

    /// Block up to `timeout`; returns whether the signal was set
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut set = self.inner.set.lock();
        if *set {
            return true;
        }
        self.inner.cond.wait_for(&mut set, timeout);
        *set
    }
}

impl std::fmt::Debug for ReadySignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadySignal")
            .field("set", &self.is_set())
            .finish()
    }
}
