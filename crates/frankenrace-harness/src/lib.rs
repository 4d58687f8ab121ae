//! Trace replay harness for frankenrace.
//!
//! This crate provides:
//! - Trace format: one JSON event per line, keyed by logical thread names
//! - Replayer: drives a [`frankenrace_core::Detector`] from a parsed trace
//! - Logging setup for the `harness` binary

#![forbid(unsafe_code)]

pub mod replay;
pub mod trace;

use std::path::PathBuf;

use thiserror::Error;

pub use replay::{ReplayOutcome, Replayer};
pub use trace::{TraceEvent, parse_trace};

/// Errors from loading or replaying a trace.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: malformed event: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("line {line}: invalid address {text:?}")]
    BadAddress { line: usize, text: String },

    #[error("line {line}: unknown thread {name:?}")]
    UnknownThread { line: usize, name: String },

    #[error("line {line}: thread {name:?} already exists")]
    DuplicateThread { line: usize, name: String },

    #[error("line {line}: thread {name:?} is not running")]
    NotRunning { line: usize, name: String },

    #[error("line {line}: join of {name:?} before its finish was replayed")]
    JoinBeforeFinish { line: usize, name: String },
}

/// Install a `fmt` subscriber on stderr filtered by `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
