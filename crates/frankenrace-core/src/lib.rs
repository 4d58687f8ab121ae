//! # frankenrace-core
//!
//! Happens-before data race detection over a simulated address space.
//!
//! The core tracks every instrumented memory access in shadow memory, keeps a
//! vector clock per thread and per synchronization object, and reports pairs
//! of conflicting accesses that no synchronization orders. The pieces:
//!
//! - [`shadow`]: address translation, packed access records, meta cells.
//! - [`vector_clock`]: epochs and clocks with freed-thread marks.
//! - [`sync`]: the sync-object registry with lock-free insertion.
//! - [`thread`]: thread contexts, their state machine and tid quarantine.
//! - [`access`]: the race check itself.
//! - [`alloc`]: allocation metadata and the allocator hooks.
//! - [`detector`]: the facade every event enters through.
//!
//! No `unsafe` code is permitted in this crate.

#![deny(unsafe_code)]

pub mod access;
pub mod alloc;
pub mod blocking;
pub mod config;
pub mod detector;
pub mod error;
pub mod metrics;
pub mod report;
pub mod shadow;
pub mod stack;
pub mod sync;
pub mod thread;
pub mod vector_clock;

pub use alloc::{BlockHandle, MBlock};
pub use blocking::{BlockingCall, Notification, NotificationHandler};
pub use config::{DetectorConfig, ReportMode};
pub use detector::Detector;
pub use error::{DetectorError, Diagnostic, set_die_callback};
pub use metrics::MetricsSnapshot;
pub use report::{AccessDesc, CollectingSink, Location, RaceReport, ReportSink, TracingSink};
pub use stack::StackId;
pub use thread::{ThreadInfo, ThreadState, ThreadStatus};
pub use vector_clock::{Epoch, Tid, VectorClock};
