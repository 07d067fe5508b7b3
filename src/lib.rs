// src/lib.rs
//! Hearth Recorder Engine Library
//!
//! This library is the persistence engine of the Hearth home-automation
//! hub: it durably records the hub's event stream into a SQLite store while
//! deduplicating repeated payloads, batching commits, surviving storage
//! corruption, coordinating schema upgrades, and enforcing backpressure.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **recording**: the single-writer worker loop, task protocol, dedup
//!   caches and run index
//! - **storage**: SQLite sessions, connection pool with thread affinity,
//!   schema migration
//! - **event**: domain events and the ingest filter
//! - **observability**: tracing setup
//! - **utils**: errors, configuration, signals, notifications
//!
//! # Usage
//!
//! ```no_run
//! use hearth_recorder::{HubEvent, RecorderConfig, RecorderEngine};
//!
//! # fn main() -> hearth_recorder::Result<()> {
//! let engine = RecorderEngine::new(RecorderConfig::default())?;
//! engine.start()?;
//! engine.note_host_started();
//!
//! engine.handle_event(HubEvent::state_changed(
//!     "light.porch",
//!     "on",
//!     serde_json::json!({ "brightness": 200 }),
//! ));
//!
//! engine.stop();
//! # Ok(())
//! # }
//! ```

// Public module exports
pub mod event;
pub mod observability;
pub mod recording;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use event::{EventFilter, HubEvent, EVENT_STATE_CHANGED};
pub use recording::{EngineState, Readiness, RecorderEngine, RunHistory, RunInfo, StatisticsSink};
pub use storage::{SchemaMigrationCoordinator, SchemaStatus, SCHEMA_VERSION};
pub use utils::config::RecorderConfig;
pub use utils::errors::{RecorderError, Result};
pub use utils::notify::{LogNotifier, Notifier};
pub use utils::signal::ReadySignal;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
