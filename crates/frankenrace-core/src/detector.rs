//! The detector facade.
//!
//! [`Detector`] owns every registry and exposes the event entry points an
//! instrumented program (or a trace replayer) calls. Each entry point takes
//! the calling thread's [`ThreadState`] by `&mut`; that state is owned by
//! its thread and never shared.
//!
//! Entry points never return detector errors. Invariant violations go to
//! [`crate::error::die`]; misuse by the program becomes a [`Diagnostic`]
//! on the report sink and the operation is skipped.

use std::ops::Range;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::access::{self, RaceHit};
use crate::blocking::NotificationHandler;
use crate::config::DetectorConfig;
use crate::error::{DetectorError, Diagnostic, OrDie};
use crate::metrics::{DetectorMetrics, MetricsSnapshot};
use crate::report::{AccessDesc, Location, RaceReport, ReportSink, TracingSink};
use crate::shadow::{ShadowMemory, granule_base};
use crate::stack::{StackDepot, StackId};
use crate::sync::{SyncRegistry, SyncState};
use crate::thread::{ThreadInfo, ThreadRegistry, ThreadState, ThreadStatus};
use crate::vector_clock::Tid;

/// Process-wide race detector state.
pub struct Detector {
    pub(crate) config: DetectorConfig,
    pub(crate) shadow: ShadowMemory,
    pub(crate) syncs: SyncRegistry,
    pub(crate) threads: ThreadRegistry,
    pub(crate) stacks: StackDepot,
    pub(crate) metrics: Arc<DetectorMetrics>,
    sink: Arc<dyn ReportSink>,
    pub(crate) handler: RwLock<Option<NotificationHandler>>,
}

impl Detector {
    #[must_use]
    pub fn new(config: DetectorConfig, sink: Arc<dyn ReportSink>) -> Self {
        let config = config.normalized();
        let metrics = Arc::new(DetectorMetrics::new());
        tracing::debug!(
            target: "frankenrace::detector",
            max_threads = config.max_threads,
            quarantine = config.thread_quarantine_size,
            mode = ?config.report_mode,
            "detector initialized"
        );
        Self {
            shadow: ShadowMemory::new(),
            syncs: SyncRegistry::new(
                config.max_sync_objects,
                config.max_blocks,
                config.cas_retry_limit,
                Arc::clone(&metrics),
            ),
            threads: ThreadRegistry::new(
                config.max_threads,
                config.thread_quarantine_size,
                Arc::clone(&metrics),
            ),
            stacks: StackDepot::new(),
            metrics,
            sink,
            handler: RwLock::new(None),
            config,
        }
    }

    /// Detector reporting through `tracing`.
    #[must_use]
    pub fn with_tracing_sink(config: DetectorConfig) -> Self {
        Self::new(config, Arc::new(TracingSink))
    }

    #[must_use]
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Whether accesses and synchronization are being recorded at all.
    #[inline]
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.report_mode.enabled()
    }

    #[must_use]
    pub fn stacks(&self) -> &StackDepot {
        &self.stacks
    }

    #[must_use]
    pub fn sync_registry(&self) -> &SyncRegistry {
        &self.syncs
    }

    #[must_use]
    pub fn shadow(&self) -> &ShadowMemory {
        &self.shadow
    }

    // -----------------------------------------------------------------------
    // Threads
    // -----------------------------------------------------------------------

    /// Create and start the initial thread. Call once, before anything else.
    pub fn main_thread(&self, os_id: u64) -> ThreadState {
        let tid = self
            .threads
            .create(None, false, None, StackId::NONE)
            .or_die();
        self.threads.start(tid, os_id).or_die()
    }

    /// `parent` creates a new thread; returns the child's tid.
    pub fn on_thread_create(&self, parent: &mut ThreadState, detached: bool) -> Tid {
        self.create_thread(parent, detached, None)
    }

    /// Like [`Self::on_thread_create`], registering the program's own
    /// identifier for the thread so [`Self::thread_tid`] can find it.
    pub fn on_thread_create_for(
        &self,
        parent: &mut ThreadState,
        detached: bool,
        user_id: u64,
    ) -> Tid {
        self.create_thread(parent, detached, Some(user_id))
    }

    fn create_thread(&self, parent: &mut ThreadState, detached: bool, user_id: Option<u64>) -> Tid {
        self.process_pending(parent);
        let stack = parent.current_stack(&self.stacks);
        self.threads
            .create(Some(parent), detached, user_id, stack)
            .or_die()
    }

    /// The new thread starts running; returns its per-thread state.
    pub fn on_thread_start(&self, tid: Tid, os_id: u64) -> ThreadState {
        self.threads.start(tid, os_id).or_die()
    }

    pub fn on_thread_finish(&self, thr: &mut ThreadState) {
        self.process_pending(thr);
        self.threads.finish(thr).or_die();
    }

    /// Block until `tid` finishes, then acquire everything it did.
    pub fn on_thread_join(&self, thr: &mut ThreadState, tid: Tid) {
        let outcome = {
            let mut call = self.blocking_call(thr);
            self.threads.join(call.state(), tid)
        };
        self.note(outcome);
    }

    pub fn on_thread_detach(&self, tid: Tid) {
        let outcome = self.threads.detach(tid);
        self.note(outcome);
    }

    pub fn set_thread_name(&self, tid: Tid, name: &str) {
        self.threads.set_name(tid, name);
    }

    /// Record the stack and TLS ranges of `tid` for race locations.
    pub fn set_thread_ranges(&self, tid: Tid, stack: Option<Range<usize>>, tls: Option<Range<usize>>) {
        self.threads.set_ranges(tid, stack, tls);
    }

    /// Tid of the live thread created with `user_id`.
    #[must_use]
    pub fn thread_tid(&self, user_id: u64) -> Option<Tid> {
        self.threads.thread_tid(user_id)
    }

    #[must_use]
    pub fn thread_status(&self, tid: Tid) -> ThreadStatus {
        self.threads.status(tid)
    }

    #[must_use]
    pub fn thread_info(&self, tid: Tid) -> Option<ThreadInfo> {
        self.threads.info(tid)
    }

    #[must_use]
    pub fn threads_snapshot(&self) -> Vec<ThreadInfo> {
        self.threads.snapshot()
    }

    #[must_use]
    pub fn quarantine_len(&self) -> usize {
        self.threads.quarantine_len()
    }

    // -----------------------------------------------------------------------
    // Memory accesses
    // -----------------------------------------------------------------------

    /// A plain load (`is_write == false`) or store of `size` bytes.
    pub fn record_access(&self, thr: &mut ThreadState, addr: usize, size: usize, is_write: bool) {
        self.access_range(thr, addr, size, is_write, false).or_die();
    }

    /// An atomic load or store. Atomic accesses never race with each other.
    pub fn record_atomic_access(
        &self,
        thr: &mut ThreadState,
        addr: usize,
        size: usize,
        is_write: bool,
    ) {
        self.access_range(thr, addr, size, is_write, true).or_die();
    }

    pub(crate) fn access_range(
        &self,
        thr: &mut ThreadState,
        addr: usize,
        size: usize,
        is_write: bool,
        is_atomic: bool,
    ) -> Result<(), DetectorError> {
        if size == 0 || !self.enabled() || thr.ignoring_accesses() {
            return Ok(());
        }
        DetectorMetrics::inc(&self.metrics.accesses);
        let mut hits = Vec::new();
        let granules =
            access::access_range(&self.shadow, thr, addr, size, is_write, is_atomic, &mut hits)?;
        DetectorMetrics::add(&self.metrics.granules_checked, granules);
        // One report per access; the rest of the range is still recorded.
        match hits.first() {
            Some(hit) => self.report_race(thr, hit),
            None => Ok(()),
        }
    }

    fn report_race(&self, thr: &ThreadState, hit: &RaceHit) -> Result<(), DetectorError> {
        let cur = hit.current;
        let prev = hit.previous;
        let (prev_unique, prev_retired) = self
            .threads
            .occupant(prev.tid(), prev.epoch())
            .unwrap_or((0, true));
        let report = RaceReport {
            addr: hit.addr,
            size: cur.size(),
            current: AccessDesc {
                tid: thr.tid(),
                unique_id: thr.unique_id(),
                epoch: cur.epoch(),
                addr: hit.addr,
                size: cur.size(),
                is_write: cur.is_write(),
                is_atomic: cur.is_atomic(),
                retired: false,
                stack: thr.current_stack(&self.stacks),
            },
            previous: AccessDesc {
                tid: prev.tid(),
                unique_id: prev_unique,
                epoch: prev.epoch(),
                addr: granule_base(hit.addr) + prev.offset(),
                size: prev.size(),
                is_write: prev.is_write(),
                is_atomic: prev.is_atomic(),
                retired: prev_retired,
                stack: StackId::NONE,
            },
            location: self.locate(hit.addr),
        };
        DetectorMetrics::inc(&self.metrics.races_reported);
        self.sink.race(&report);
        if self.config.report_mode.halts() {
            return Err(DetectorError::HaltOnRace { addr: hit.addr });
        }
        Ok(())
    }

    fn locate(&self, addr: usize) -> Location {
        if let Some(block) = self.syncs.blocks().find_containing(addr) {
            return Location::Heap {
                block: block.addr,
                size: block.size,
                alloc_tid: block.alloc_tid,
                alloc_stack: block.alloc_stack,
            };
        }
        self.threads.classify(addr).unwrap_or(Location::Unknown)
    }

    fn note(&self, outcome: Result<(), Diagnostic>) {
        if let Err(diag) = outcome {
            DetectorMetrics::inc(&self.metrics.diagnostics);
            self.sink.diagnostic(&diag);
        }
    }

    // -----------------------------------------------------------------------
    // Synchronization
    // -----------------------------------------------------------------------

    /// Common prologue of the sync entry points. False means skip the event.
    fn enter_sync(&self, thr: &mut ThreadState) -> bool {
        self.process_pending(thr);
        self.enabled() && !thr.ignoring_sync()
    }

    /// A mutex is initialized at `addr`. Initialization counts as a write
    /// of its first byte.
    pub fn on_mutex_create(
        &self,
        thr: &mut ThreadState,
        addr: usize,
        is_rw: bool,
        is_recursive: bool,
    ) {
        if !self.enter_sync(thr) {
            return;
        }
        self.access_range(thr, addr, 1, true, false).or_die();
        let stack = thr.current_stack(&self.stacks);
        self.syncs
            .get_or_create_and_lock(addr, stack, |s| {
                s.is_rw = is_rw;
                s.is_recursive = is_recursive;
            })
            .or_die();
    }

    /// The mutex at `addr` is destroyed; its sync object is removed.
    pub fn on_mutex_destroy(&self, thr: &mut ThreadState, addr: usize) {
        if !self.enter_sync(thr) {
            return;
        }
        let tid = thr.tid();
        if let Some(Some(owner)) = self.syncs.get_and_remove(addr, |s| s.owner) {
            self.note(Err(Diagnostic::DestroyLocked { addr, tid, owner }));
        }
        self.access_range(thr, addr, 1, true, false).or_die();
    }

    /// Exclusive lock acquired.
    pub fn on_lock(&self, thr: &mut ThreadState, addr: usize) {
        if !self.enter_sync(thr) {
            return;
        }
        let tid = thr.tid();
        let stack = thr.current_stack(&self.stacks);
        let outcome = self
            .syncs
            .get_or_create_and_lock(addr, stack, |s| match s.owner {
                Some(owner) if owner == tid => {
                    if s.is_recursive {
                        s.recursion += 1;
                        Ok(())
                    } else {
                        Err(Diagnostic::DoubleLock { addr, tid })
                    }
                }
                _ => {
                    s.owner = Some(tid);
                    s.recursion = 1;
                    thr.acquire(&s.clock);
                    thr.acquire(&s.read_clock);
                    Ok(())
                }
            })
            .or_die();
        self.note(outcome);
    }

    /// Exclusive unlock. The final unlock of a recursive mutex releases.
    pub fn on_unlock(&self, thr: &mut ThreadState, addr: usize) {
        if !self.enter_sync(thr) {
            return;
        }
        thr.tick().or_die();
        let stack = thr.current_stack(&self.stacks);
        let outcome = self
            .syncs
            .get_or_create_and_lock(addr, stack, |s| unlock_exclusive(s, thr, addr))
            .or_die();
        self.note(outcome);
    }

    /// Shared lock acquired. Acquires writers' releases only.
    pub fn on_read_lock(&self, thr: &mut ThreadState, addr: usize) {
        if !self.enter_sync(thr) {
            return;
        }
        let tid = thr.tid();
        let stack = thr.current_stack(&self.stacks);
        let outcome = self
            .syncs
            .get_or_create_and_lock(addr, stack, |s| match s.owner {
                Some(owner) => Err(Diagnostic::ReadLockWhileWriteLocked { addr, tid, owner }),
                None => {
                    s.readers += 1;
                    thr.acquire(&s.clock);
                    Ok(())
                }
            })
            .or_die();
        self.note(outcome);
    }

    /// Shared unlock; releases into the read clock.
    pub fn on_read_unlock(&self, thr: &mut ThreadState, addr: usize) {
        if !self.enter_sync(thr) {
            return;
        }
        thr.tick().or_die();
        let stack = thr.current_stack(&self.stacks);
        let outcome = self
            .syncs
            .get_or_create_and_lock(addr, stack, |s| unlock_shared(s, thr, addr))
            .or_die();
        self.note(outcome);
    }

    /// An unlock that does not say which mode was held: exclusive if the
    /// caller owns the mutex, shared otherwise.
    pub fn on_read_or_write_unlock(&self, thr: &mut ThreadState, addr: usize) {
        if !self.enter_sync(thr) {
            return;
        }
        thr.tick().or_die();
        let tid = thr.tid();
        let stack = thr.current_stack(&self.stacks);
        let outcome = self
            .syncs
            .get_or_create_and_lock(addr, stack, |s| {
                if s.owner == Some(tid) {
                    unlock_exclusive(s, thr, addr)
                } else {
                    unlock_shared(s, thr, addr)
                }
            })
            .or_die();
        self.note(outcome);
    }

    /// Acquire whatever has been released to `addr`. A no-op if nothing was.
    pub fn acquire(&self, thr: &mut ThreadState, addr: usize) {
        if !self.enter_sync(thr) {
            return;
        }
        self.syncs.with_existing(addr, |s| {
            thr.acquire(&s.clock);
        });
    }

    /// Merge the caller's clock into `addr`.
    pub fn release(&self, thr: &mut ThreadState, addr: usize) {
        if !self.enter_sync(thr) {
            return;
        }
        thr.tick().or_die();
        let stack = thr.current_stack(&self.stacks);
        self.syncs
            .get_or_create_and_lock(addr, stack, |s| thr.clock().release(&mut s.clock))
            .or_die();
    }

    /// Overwrite `addr`'s clock with the caller's.
    pub fn release_store(&self, thr: &mut ThreadState, addr: usize) {
        if !self.enter_sync(thr) {
            return;
        }
        thr.tick().or_die();
        let stack = thr.current_stack(&self.stacks);
        self.syncs
            .get_or_create_and_lock(addr, stack, |s| thr.clock().release_store(&mut s.clock))
            .or_die();
    }

    /// The program moved `[src, src + size)` to `dst`; sync objects and
    /// blocks follow the bytes. Unaligned moves are fatal.
    pub fn move_memory(&self, src: usize, dst: usize, size: usize) {
        self.syncs.move_memory(src, dst, size).or_die();
    }

    /// Creation uid of the sync object at `addr`, if one exists.
    #[must_use]
    pub fn sync_uid(&self, addr: usize) -> Option<u64> {
        self.syncs.with_existing(addr, |s| s.uid)
    }

    // -----------------------------------------------------------------------
    // Reporting
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.shadow.resident_pages() as u64)
    }

    #[must_use]
    pub fn races_reported(&self) -> u64 {
        DetectorMetrics::get(&self.metrics.races_reported)
    }

    /// Hand the current counters to `callback`.
    pub fn print_stats(&self, callback: impl FnOnce(&MetricsSnapshot)) {
        callback(&self.metrics());
    }

    /// Log final statistics and return the process exit code: the configured
    /// race exit code if any race was reported, 0 otherwise.
    #[must_use]
    pub fn finalize(&self) -> i32 {
        let snapshot = self.metrics();
        tracing::info!(
            target: "frankenrace::detector",
            races = snapshot.races_reported,
            accesses = snapshot.accesses,
            threads = snapshot.threads_created,
            sync_objects = self.syncs.live_syncs(),
            "detector finalized"
        );
        if snapshot.races_reported > 0 {
            self.config.exit_code
        } else {
            0
        }
    }
}

fn unlock_exclusive(
    s: &mut SyncState,
    thr: &mut ThreadState,
    addr: usize,
) -> Result<(), Diagnostic> {
    let tid = thr.tid();
    match s.owner {
        None => Err(Diagnostic::UnlockUnlocked { addr, tid }),
        Some(owner) if owner != tid => Err(Diagnostic::UnlockForeign { addr, tid, owner }),
        Some(_) => {
            s.recursion = s.recursion.saturating_sub(1);
            if s.recursion == 0 {
                s.owner = None;
                thr.clock().release(&mut s.clock);
            }
            Ok(())
        }
    }
}

fn unlock_shared(s: &mut SyncState, thr: &mut ThreadState, addr: usize) -> Result<(), Diagnostic> {
    if s.readers == 0 {
        return Err(Diagnostic::ReadUnlockUnlocked {
            addr,
            tid: thr.tid(),
        });
    }
    s.readers -= 1;
    thr.clock().release(&mut s.read_clock);
    Ok(())
}

// ---------------------------------------------------------------------------
// Process-wide instance
// ---------------------------------------------------------------------------

static GLOBAL: OnceLock<Detector> = OnceLock::new();

/// Install the process-wide detector. Later calls return the first instance
/// and ignore their arguments.
pub fn initialize(config: DetectorConfig, sink: Arc<dyn ReportSink>) -> &'static Detector {
    if let Some(existing) = GLOBAL.get() {
        tracing::warn!(target: "frankenrace::detector", "detector already initialized");
        return existing;
    }
    GLOBAL.get_or_init(|| Detector::new(config, sink))
}

#[must_use]
pub fn global() -> Option<&'static Detector> {
    GLOBAL.get()
}

/// Finalize the process-wide detector; 0 if it was never initialized.
#[must_use]
pub fn finalize() -> i32 {
    GLOBAL.get().map_or(0, Detector::finalize)
}
