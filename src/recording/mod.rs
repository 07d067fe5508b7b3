// src/recording/mod.rs
//! The ingestion/retention engine
//!
//! This module is the single-writer core of the recorder:
//!
//! - **Engine**: the worker loop owning session, caches and run state
//! - **Task / Task Queue**: bounded FIFO of immutable command objects
//! - **Dedup Cache**: content-addressed store for repeated payloads
//! - **Run History**: bisectable index of recording sessions
//! - **Scheduler**: periodic commit/keep-alive/watchdog/purge enqueuer
//!
//! # Architecture
//!
//! ```text
//! Event Bus → handle_event() → Filter → Task Queue → Worker Thread
//!                                           ↑              ↓
//!                                      Scheduler      Dedup Caches
//!                                   (periodic tasks)       ↓
//!                                                    Pending Writes
//!                                                         ↓
//!                                                  SQLite (one commit)
//! ```

pub mod dedup_cache;
pub mod engine;
pub mod run_history;
mod scheduler;
pub mod task;
pub mod task_queue;

// Re-export commonly used types
pub use dedup_cache::{hash_payload, CacheStats, ContentAddressedCache, PayloadRef};
pub use engine::{EngineState, Readiness, RecorderEngine};
pub use run_history::{RunHistory, RunInfo};
pub use task::{StatisticsSink, Task};
pub use task_queue::{QueueStats, TaskQueue};
