// src/observability.rs
//! Tracing initialization
//!
//! Host processes call this once at startup. Filtering follows `RUST_LOG`
//! when set, with a sensible default otherwise.

use crate::utils::errors::{RecorderError, Result};
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hearth_recorder=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| RecorderError::Config(format!("tracing init failed: {}", e)))
}
