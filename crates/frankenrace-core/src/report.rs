//! Race reports and the sinks that receive them.

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::Diagnostic;
use crate::stack::StackId;
use crate::vector_clock::{Epoch, Tid};

/// One side of a race.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessDesc {
    pub tid: Tid,
    /// Process-unique thread sequence number; 0 when the tid has been reused
    /// since the access was recorded.
    pub unique_id: u64,
    pub epoch: Epoch,
    pub addr: usize,
    pub size: usize,
    pub is_write: bool,
    pub is_atomic: bool,
    /// The thread that made the access no longer occupies `tid`.
    pub retired: bool,
    pub stack: StackId,
}

/// What the raced-on memory is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Location {
    Heap {
        block: usize,
        size: usize,
        alloc_tid: Tid,
        alloc_stack: StackId,
    },
    Stack {
        tid: Tid,
    },
    Tls {
        tid: Tid,
    },
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaceReport {
    pub addr: usize,
    pub size: usize,
    pub current: AccessDesc,
    pub previous: AccessDesc,
    pub location: Location,
}

impl std::fmt::Display for RaceReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = |a: &AccessDesc| match (a.is_write, a.is_atomic) {
            (true, true) => "atomic write",
            (true, false) => "write",
            (false, true) => "atomic read",
            (false, false) => "read",
        };
        write!(
            f,
            "data race at {:#x}: {} of size {} by T{} vs previous {} of size {} by T{}{}",
            self.addr,
            kind(&self.current),
            self.current.size,
            self.current.tid,
            kind(&self.previous),
            self.previous.size,
            self.previous.tid,
            if self.previous.retired { " (finished)" } else { "" },
        )
    }
}

/// Consumer of race reports and misuse diagnostics.
pub trait ReportSink: Send + Sync {
    fn race(&self, report: &RaceReport);
    fn diagnostic(&self, diag: &Diagnostic);
}

/// Default sink: one `warn` event per report.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn race(&self, report: &RaceReport) {
        tracing::warn!(
            target: "frankenrace::report",
            addr = report.addr,
            size = report.size,
            tid = report.current.tid.0,
            other_tid = report.previous.tid.0,
            location = ?report.location,
            "{report}"
        );
    }

    fn diagnostic(&self, diag: &Diagnostic) {
        tracing::warn!(target: "frankenrace::report", "{diag}");
    }
}

/// Sink that keeps everything it receives.
#[derive(Debug, Default)]
pub struct CollectingSink {
    races: Mutex<Vec<RaceReport>>,
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn races(&self) -> Vec<RaceReport> {
        self.races.lock().clone()
    }

    #[must_use]
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }

    /// Remove and return the races collected so far.
    pub fn take_races(&self) -> Vec<RaceReport> {
        std::mem::take(&mut *self.races.lock())
    }

    pub fn take_diagnostics(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.diagnostics.lock())
    }
}

impl ReportSink for CollectingSink {
    fn race(&self, report: &RaceReport) {
        self.races.lock().push(report.clone());
    }

    fn diagnostic(&self, diag: &Diagnostic) {
        self.diagnostics.lock().push(*diag);
    }
}
