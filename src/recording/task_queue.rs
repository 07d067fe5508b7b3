// src/recording/task_queue.rs
//! Bounded task queue feeding the worker
//!
//! Strict FIFO: producers push from any thread, the single worker blocks on
//! pop. Pushes past the hard capacity fail instead of growing memory; the
//! backlog watchdog is expected to intervene well before that point.

use crate::recording::task::Task;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Thread-safe FIFO of boxed tasks
pub struct TaskQueue {
    tx: Sender<Box<dyn Task>>,
    rx: Receiver<Box<dyn Task>>,

    /// Total tasks pushed
    push_count: AtomicU64,

    /// Total tasks popped
    pop_count: AtomicU64,

    /// Total tasks rejected (queue full)
    drop_count: AtomicU64,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            push_count: AtomicU64::new(0),
            pop_count: AtomicU64::new(0),
            drop_count: AtomicU64::new(0),
        }
    }

    /// Push without blocking; full queue returns the task to the caller
    pub fn push(&self, task: Box<dyn Task>) -> Result<(), Box<dyn Task>> {
        match self.tx.try_send(task) {
            Ok(()) => {
                self.push_count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(crossbeam_channel::TrySendError::Full(task))
            | Err(crossbeam_channel::TrySendError::Disconnected(task)) => {
                self.drop_count.fetch_add(1, Ordering::Relaxed);
                Err(task)
            }
        }
    }

    /// Push and wait for room; used by control tasks that must not be lost
    pub fn push_blocking(&self, task: Box<dyn Task>) {
        if self.tx.send(task).is_ok() {
            self.push_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Block until the next task; only the worker calls this
    pub fn pop(&self) -> Box<dyn Task> {
        let task = self.rx.recv().expect("queue holds its own sender");
        self.pop_count.fetch_add(1, Ordering::Relaxed);
        task
    }

    /// Block up to `timeout` for the next task
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Box<dyn Task>> {
        match self.rx.recv_timeout(timeout) {
            Ok(task) => {
                self.pop_count.fetch_add(1, Ordering::Relaxed);
                Some(task)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Discard everything queued; returns how many tasks were dropped.
    /// Emergency shutdown path: the caller replaces the backlog with a
    /// single stop marker.
    pub fn drain(&self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        self.drop_count.fetch_add(dropped as u64, Ordering::Relaxed);
        dropped
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().expect("bounded channel")
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            push_count: self.push_count.load(Ordering::Relaxed),
            pop_count: self.pop_count.load(Ordering::Relaxed),
            drop_count: self.drop_count.load(Ordering::Relaxed),
            current_size: self.len(),
            capacity: self.capacity(),
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone)]
pub struct QueueStats {
    /// Total tasks pushed
    pub push_count: u64,

    /// Total tasks popped
    pub pop_count: u64,

    /// Total tasks dropped (queue full or drained)
    pub drop_count: u64,

    /// Current queue size
    pub current_size: usize,

    /// Queue capacity
    pub capacity: usize,
}

impl QueueStats {
    /// Calculate fill percentage
    pub fn fill_percentage(&self) -> f64 {
        (self.current_size as f64 / self.capacity as f64) * 100.0
    }

    /// Calculate drop rate
    pub fn drop_rate(&self) -> f64 {
        if self.push_count == 0 {
            0.0
        } else {
            (self.drop_count as f64 / self.push_count as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::task::KeepAliveTask;

    fn ping() -> Box<dyn Task> {
        Box::new(KeepAliveTask)
    }

    #[test]
    fn test_fifo_order() {
        use crate::recording::task::SynchronizeTask;
        use crate::utils::signal::ReadySignal;

        let queue = TaskQueue::new(8);
        queue.push(ping()).unwrap();
        let done = ReadySignal::new();
        queue.push(Box::new(SynchronizeTask::new(done.clone()))).unwrap();

        assert_eq!(queue.len(), 2);
        let first = queue.pop();
        assert!(!first.commit_before());
        let second = queue.pop();
        assert!(second.commit_before());
    }

    #[test]
    fn test_push_fails_when_full() {
        let queue = TaskQueue::new(2);
        queue.push(ping()).unwrap();
        queue.push(ping()).unwrap();
        assert!(queue.push(ping()).is_err());

        let stats = queue.stats();
        assert_eq!(stats.push_count, 2);
        assert_eq!(stats.drop_count, 1);
        assert!((stats.fill_percentage() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_drain_discards_backlog() {
        let queue = TaskQueue::new(8);
        for _ in 0..5 {
            queue.push(ping()).unwrap();
        }
        assert_eq!(queue.drain(), 5);
        assert!(queue.is_empty());
        assert_eq!(queue.stats().drop_count, 5);
    }

    #[test]
    fn test_pop_timeout_expires() {
        let queue = TaskQueue::new(2);
        assert!(queue.pop_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_concurrent_producers() {
        use std::sync::Arc;
        use std::thread;

        let queue = Arc::new(TaskQueue::new(1000));
        let mut handles = vec![];
        for _ in 0..8 {
            let q = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let _ = q.push(Box::new(KeepAliveTask));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(queue.stats().push_count, 800);
        assert_eq!(queue.len(), 800);
    }
}
