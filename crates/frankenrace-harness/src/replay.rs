//! Single-threaded replay of a parsed trace against the detector core.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use frankenrace_core::{
    CollectingSink, Detector, DetectorConfig, Diagnostic, MetricsSnapshot, RaceReport,
    ReportSink, ThreadState, Tid,
};
use serde::Serialize;

use crate::HarnessError;
use crate::trace::TraceEvent;

/// Name of the thread that exists before the first event.
pub const MAIN_THREAD: &str = "main";

enum Phase {
    Created,
    Running(ThreadState),
    Finished,
}

struct Entry {
    tid: Tid,
    detached: bool,
    phase: Phase,
}

fn entry_in<'a>(
    threads: &'a mut HashMap<String, Entry>,
    line: usize,
    name: &str,
) -> Result<&'a mut Entry, HarnessError> {
    threads
        .get_mut(name)
        .ok_or_else(|| HarnessError::UnknownThread {
            line,
            name: name.to_owned(),
        })
}

fn running_in<'a>(
    threads: &'a mut HashMap<String, Entry>,
    line: usize,
    name: &str,
) -> Result<&'a mut ThreadState, HarnessError> {
    match &mut entry_in(threads, line, name)?.phase {
        Phase::Running(thr) => Ok(thr),
        Phase::Created | Phase::Finished => Err(HarnessError::NotRunning {
            line,
            name: name.to_owned(),
        }),
    }
}

/// Keeps every report and forwards it to an optional second sink.
struct TeeSink {
    keep: CollectingSink,
    forward: Option<Arc<dyn ReportSink>>,
}

impl ReportSink for TeeSink {
    fn race(&self, report: &RaceReport) {
        self.keep.race(report);
        if let Some(forward) = &self.forward {
            forward.race(report);
        }
    }

    fn diagnostic(&self, diag: &Diagnostic) {
        self.keep.diagnostic(diag);
        if let Some(forward) = &self.forward {
            forward.diagnostic(diag);
        }
    }
}

/// Writes each race to stdout as one JSON line the moment it is reported,
/// so reports survive a halt-on-race abort. Diagnostics go to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLinesSink;

impl ReportSink for JsonLinesSink {
    fn race(&self, report: &RaceReport) {
        let Ok(line) = serde_json::to_string(report) else {
            return;
        };
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    }

    fn diagnostic(&self, diag: &Diagnostic) {
        eprintln!("diagnostic: {diag}");
    }
}

/// Everything a finished replay produced.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayOutcome {
    pub races: Vec<RaceReport>,
    pub diagnostics: Vec<Diagnostic>,
    pub metrics: MetricsSnapshot,
    pub exit_code: i32,
}

/// Drives one [`Detector`] from trace events.
///
/// The trace thread named [`MAIN_THREAD`] is running from the start; every
/// other thread must be created and started by events.
pub struct Replayer {
    detector: Detector,
    sink: Arc<TeeSink>,
    threads: HashMap<String, Entry>,
    next_os_id: u64,
}

impl Replayer {
    #[must_use]
    pub fn new(config: DetectorConfig) -> Self {
        Self::with_forward(config, None)
    }

    /// Replayer whose reports are also handed to `forward` as they occur.
    #[must_use]
    pub fn with_forward(config: DetectorConfig, forward: Option<Arc<dyn ReportSink>>) -> Self {
        let sink = Arc::new(TeeSink {
            keep: CollectingSink::new(),
            forward,
        });
        let detector = Detector::new(config, sink.clone());
        let main = detector.main_thread(1);
        let mut threads = HashMap::new();
        threads.insert(
            MAIN_THREAD.to_owned(),
            Entry {
                tid: main.tid(),
                detached: false,
                phase: Phase::Running(main),
            },
        );
        Self {
            detector,
            sink,
            threads,
            next_os_id: 2,
        }
    }

    #[must_use]
    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    /// Races reported since the last call.
    pub fn take_races(&self) -> Vec<RaceReport> {
        self.sink.keep.take_races()
    }

    /// Detector tid of a trace thread.
    #[must_use]
    pub fn tid_of(&self, name: &str) -> Option<Tid> {
        self.threads.get(name).map(|e| e.tid)
    }

    /// Apply one event.
    pub fn apply(&mut self, line: usize, event: &TraceEvent) -> Result<(), HarnessError> {
        let Self {
            detector,
            threads,
            next_os_id,
            ..
        } = self;
        let name = event.thread();
        match event {
            TraceEvent::Create {
                child, detached, ..
            } => {
                if threads.contains_key(child) {
                    return Err(HarnessError::DuplicateThread {
                        line,
                        name: child.clone(),
                    });
                }
                let parent = running_in(threads, line, name)?;
                let tid = detector.on_thread_create(parent, *detached);
                threads.insert(
                    child.clone(),
                    Entry {
                        tid,
                        detached: *detached,
                        phase: Phase::Created,
                    },
                );
            }
            TraceEvent::Start { .. } => {
                let entry = entry_in(threads, line, name)?;
                if !matches!(entry.phase, Phase::Created) {
                    return Err(HarnessError::DuplicateThread {
                        line,
                        name: name.to_owned(),
                    });
                }
                entry.phase = Phase::Running(detector.on_thread_start(entry.tid, *next_os_id));
                *next_os_id += 1;
            }
            TraceEvent::Finish { .. } => {
                let entry = entry_in(threads, line, name)?;
                match std::mem::replace(&mut entry.phase, Phase::Finished) {
                    Phase::Running(mut thr) => detector.on_thread_finish(&mut thr),
                    other => {
                        entry.phase = other;
                        return Err(HarnessError::NotRunning {
                            line,
                            name: name.to_owned(),
                        });
                    }
                }
            }
            TraceEvent::Join { target, .. } => {
                let joinee = entry_in(threads, line, target)?;
                // A non-detached thread that has not finished would block forever.
                if !joinee.detached && !matches!(joinee.phase, Phase::Finished) {
                    return Err(HarnessError::JoinBeforeFinish {
                        line,
                        name: target.clone(),
                    });
                }
                let tid = joinee.tid;
                let joiner = running_in(threads, line, name)?;
                detector.on_thread_join(joiner, tid);
            }
            TraceEvent::Detach { target, .. } => {
                let joinee = entry_in(threads, line, target)?;
                joinee.detached = true;
                detector.on_thread_detach(joinee.tid);
            }
            TraceEvent::Read {
                addr, size, atomic, ..
            }
            | TraceEvent::Write {
                addr, size, atomic, ..
            } => {
                let addr = addr.resolve(line)?;
                let is_write = matches!(event, TraceEvent::Write { .. });
                let thr = running_in(threads, line, name)?;
                if *atomic {
                    detector.record_atomic_access(thr, addr, *size, is_write);
                } else {
                    detector.record_access(thr, addr, *size, is_write);
                }
            }
            TraceEvent::Lock { addr, .. }
            | TraceEvent::Unlock { addr, .. }
            | TraceEvent::Rlock { addr, .. }
            | TraceEvent::Runlock { addr, .. }
            | TraceEvent::Acquire { addr, .. }
            | TraceEvent::Release { addr, .. } => {
                let addr = addr.resolve(line)?;
                let thr = running_in(threads, line, name)?;
                match event {
                    TraceEvent::Lock { .. } => detector.on_lock(thr, addr),
                    TraceEvent::Unlock { .. } => detector.on_unlock(thr, addr),
                    TraceEvent::Rlock { .. } => detector.on_read_lock(thr, addr),
                    TraceEvent::Runlock { .. } => detector.on_read_unlock(thr, addr),
                    TraceEvent::Acquire { .. } => detector.acquire(thr, addr),
                    _ => detector.release(thr, addr),
                }
            }
            TraceEvent::Alloc { addr, size, .. } => {
                let addr = addr.resolve(line)?;
                let thr = running_in(threads, line, name)?;
                detector.on_alloc(thr, addr, *size);
            }
            TraceEvent::Free { addr, .. } => {
                let addr = addr.resolve(line)?;
                let thr = running_in(threads, line, name)?;
                detector.on_free(thr, addr);
            }
            TraceEvent::Mmap { addr, size, .. } => {
                let addr = addr.resolve(line)?;
                let thr = running_in(threads, line, name)?;
                detector.on_mmap(thr, addr, *size);
            }
            TraceEvent::Munmap { addr, size, .. } => {
                let addr = addr.resolve(line)?;
                let thr = running_in(threads, line, name)?;
                detector.on_munmap(thr, addr, *size);
            }
            TraceEvent::FuncEntry { pc, .. } => {
                let pc = pc.resolve(line)?;
                running_in(threads, line, name)?.func_entry(pc);
            }
            TraceEvent::FuncExit { .. } => {
                running_in(threads, line, name)?.func_exit();
            }
        }
        tracing::trace!(target: "frankenrace::harness", line, ?event, "replayed");
        Ok(())
    }

    /// Apply every event in order and collect the results.
    pub fn replay(
        mut self,
        events: &[(usize, TraceEvent)],
    ) -> Result<ReplayOutcome, HarnessError> {
        for (line, event) in events {
            self.apply(*line, event)?;
        }
        Ok(self.finish())
    }

    /// Finalize the detector and collect everything it reported.
    #[must_use]
    pub fn finish(self) -> ReplayOutcome {
        let exit_code = self.detector.finalize();
        ReplayOutcome {
            races: self.sink.keep.take_races(),
            diagnostics: self.sink.keep.take_diagnostics(),
            metrics: self.detector.metrics(),
            exit_code,
        }
    }
}
