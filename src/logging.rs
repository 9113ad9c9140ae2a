//! Logging setup (spec.md §4.12 [AMBIENT]).
//!
//! `tracing` + `tracing-subscriber`, switched between a human-readable
//! formatter for local development and structured JSON for production log
//! aggregation, the way the teacher's own `main`/`cli` wiring initializes
//! its subscriber before anything else runs.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogFormat;

/// Initialize the global `tracing` subscriber. Must be called exactly once,
/// before any other module logs.
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Pretty => {
            fmt().with_env_filter(filter).with_target(true).init();
        }
        LogFormat::Json => {
            fmt().with_env_filter(filter).json().with_target(true).init();
        }
    }
}
