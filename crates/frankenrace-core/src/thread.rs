//! Thread contexts and per-thread runtime state.
//!
//! [`ThreadRegistry`] owns one [`ThreadContext`] per tid and is the single
//! serialization point for creating, starting, finishing, joining and
//! detaching threads. Retired contexts wait in a FIFO quarantine before their
//! tid is handed out again.
//!
//! Lifecycle:
//!
//! ```text
//! Invalid -> Created -> Running -> Finished -> Dead   (joinable)
//!                               \-----------> Dead   (detached)
//! Dead --(quarantine overflow)--> Invalid -> Created  (reuse)
//! ```
//!
//! [`ThreadState`] is the hot per-thread half: the vector clock, the shadow
//! call stack and the ignore counters. Only its own thread touches it.

use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::blocking::SignalContext;
use crate::error::{DetectorError, Diagnostic};
use crate::metrics::DetectorMetrics;
use crate::report::Location;
use crate::shadow::ShadowRecord;
use crate::stack::{StackDepot, StackId};
use crate::vector_clock::{Epoch, Tid, VectorClock};

/// Thread lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Invalid,
    Created,
    Running,
    Finished,
    Dead,
}

// ---------------------------------------------------------------------------
// Per-thread state
// ---------------------------------------------------------------------------

/// State owned by one running thread.
pub struct ThreadState {
    tid: Tid,
    unique_id: u64,
    /// First epoch of this occupancy of `tid`.
    epoch0: Epoch,
    /// Latest epoch of a previous occupant of `tid` this thread has acquired.
    prior_epoch: Epoch,
    clock: VectorClock,
    shadow_stack: Vec<usize>,
    ignore_accesses: u32,
    ignore_sync: u32,
    signal: Arc<SignalContext>,
    /// Published current epoch, read by other threads' global acquire.
    epoch_cell: Arc<AtomicU64>,
    finished: bool,
}

impl ThreadState {
    fn new(
        tid: Tid,
        unique_id: u64,
        epoch0: Epoch,
        signal: Arc<SignalContext>,
        epoch_cell: Arc<AtomicU64>,
    ) -> Self {
        let mut clock = VectorClock::new();
        clock.set(tid, epoch0);
        epoch_cell.store(epoch0, Ordering::Relaxed);
        Self {
            tid,
            unique_id,
            epoch0,
            prior_epoch: 0,
            clock,
            shadow_stack: Vec::new(),
            ignore_accesses: 0,
            ignore_sync: 0,
            signal,
            epoch_cell,
            finished: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn detached_for_tests(tid: Tid, epoch0: Epoch) -> Self {
        Self::new(
            tid,
            u64::from(tid.0) + 1,
            epoch0,
            Arc::new(SignalContext::new()),
            Arc::new(AtomicU64::new(0)),
        )
    }

    #[inline]
    #[must_use]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    #[must_use]
    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    #[must_use]
    pub fn epoch0(&self) -> Epoch {
        self.epoch0
    }

    #[inline]
    #[must_use]
    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    #[must_use]
    pub fn current_epoch(&self) -> Epoch {
        self.clock.get(self.tid)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn signal(&self) -> &Arc<SignalContext> {
        &self.signal
    }

    pub(crate) fn clock_mut(&mut self) -> &mut VectorClock {
        &mut self.clock
    }

    /// Advance this thread's own epoch.
    #[inline]
    pub fn tick(&mut self) -> Result<Epoch, DetectorError> {
        let epoch = self.clock.tick(self.tid)?;
        self.epoch_cell.store(epoch, Ordering::Relaxed);
        Ok(epoch)
    }

    /// Merge `src` into this thread's clock.
    ///
    /// A value in our own slot below `epoch0` belongs to a previous occupant
    /// of the tid and is remembered separately.
    pub fn acquire(&mut self, src: &VectorClock) -> bool {
        let theirs = src.get(self.tid);
        if theirs < self.epoch0 && theirs > self.prior_epoch {
            self.prior_epoch = theirs;
        }
        self.clock.acquire(src)
    }

    /// The record was made by this occupancy of our tid.
    #[inline]
    #[must_use]
    pub fn is_own(&self, rec: ShadowRecord) -> bool {
        rec.tid() == self.tid && rec.epoch() >= self.epoch0
    }

    /// The record is ordered before our next access.
    #[inline]
    #[must_use]
    pub fn happens_after(&self, rec: ShadowRecord) -> bool {
        if rec.tid() == self.tid {
            rec.epoch() <= self.prior_epoch
        } else {
            self.clock.dominates(rec.tid(), rec.epoch())
        }
    }

    pub fn func_entry(&mut self, pc: usize) {
        self.shadow_stack.push(pc);
    }

    pub fn func_exit(&mut self) {
        self.shadow_stack.pop();
    }

    #[must_use]
    pub fn stack_frames(&self) -> &[usize] {
        &self.shadow_stack
    }

    /// Intern the current shadow stack.
    pub fn current_stack(&self, depot: &StackDepot) -> StackId {
        depot.put(&self.shadow_stack)
    }

    pub fn ignore_begin(&mut self) {
        self.ignore_accesses += 1;
    }

    pub fn ignore_end(&mut self) {
        self.ignore_accesses = self.ignore_accesses.saturating_sub(1);
    }

    pub fn ignore_sync_begin(&mut self) {
        self.ignore_sync += 1;
    }

    pub fn ignore_sync_end(&mut self) {
        self.ignore_sync = self.ignore_sync.saturating_sub(1);
    }

    #[inline]
    #[must_use]
    pub fn ignoring_accesses(&self) -> bool {
        self.ignore_accesses > 0 || self.finished
    }

    #[inline]
    #[must_use]
    pub fn ignoring_sync(&self) -> bool {
        self.ignore_sync > 0 || self.finished
    }
}

impl std::fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadState")
            .field("tid", &self.tid)
            .field("unique_id", &self.unique_id)
            .field("epoch", &self.current_epoch())
            .field("epoch0", &self.epoch0)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct ThreadContext {
    tid: Tid,
    unique_id: u64,
    user_id: Option<u64>,
    os_id: u64,
    status: ThreadStatus,
    detached: bool,
    epoch0: Epoch,
    epoch1: Epoch,
    /// Released by the creator at create, by the thread itself at finish.
    sync: VectorClock,
    name: Option<String>,
    reuse_count: u32,
    parent: Option<Tid>,
    creation_stack: StackId,
    stack_range: Option<Range<usize>>,
    tls_range: Option<Range<usize>>,
    epoch_cell: Arc<AtomicU64>,
    signal: Arc<SignalContext>,
}

impl ThreadContext {
    fn new(tid: Tid) -> Self {
        Self {
            tid,
            unique_id: 0,
            user_id: None,
            os_id: 0,
            status: ThreadStatus::Invalid,
            detached: false,
            epoch0: 0,
            epoch1: 0,
            sync: VectorClock::new(),
            name: None,
            reuse_count: 0,
            parent: None,
            creation_stack: StackId::NONE,
            stack_range: None,
            tls_range: None,
            epoch_cell: Arc::new(AtomicU64::new(0)),
            signal: Arc::new(SignalContext::new()),
        }
    }

    fn is_live(&self) -> bool {
        !matches!(self.status, ThreadStatus::Invalid | ThreadStatus::Dead)
    }

    fn info(&self) -> ThreadInfo {
        ThreadInfo {
            tid: self.tid,
            unique_id: self.unique_id,
            status: self.status,
            detached: self.detached,
            epoch0: self.epoch0,
            epoch1: self.epoch1,
            name: self.name.clone(),
            reuse_count: self.reuse_count,
            parent: self.parent,
            user_id: self.user_id,
            os_id: self.os_id,
            creation_stack: self.creation_stack,
        }
    }
}

/// Read-only view of one context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadInfo {
    pub tid: Tid,
    pub unique_id: u64,
    pub status: ThreadStatus,
    pub detached: bool,
    pub epoch0: Epoch,
    pub epoch1: Epoch,
    pub name: Option<String>,
    pub reuse_count: u32,
    pub parent: Option<Tid>,
    pub user_id: Option<u64>,
    pub os_id: u64,
    pub creation_stack: StackId,
}

struct RegistryInner {
    contexts: Vec<ThreadContext>,
    quarantine: VecDeque<Tid>,
    by_user_id: HashMap<u64, Tid>,
    next_unique: u64,
}

impl RegistryInner {
    fn context_mut(&mut self, tid: Tid) -> Option<&mut ThreadContext> {
        self.contexts.get_mut(tid.index())
    }
}

/// Fixed-capacity table of thread contexts.
pub struct ThreadRegistry {
    inner: Mutex<RegistryInner>,
    finished: Condvar,
    max_threads: usize,
    quarantine_size: usize,
    metrics: Arc<DetectorMetrics>,
}

impl ThreadRegistry {
    #[must_use]
    pub fn new(max_threads: usize, quarantine_size: usize, metrics: Arc<DetectorMetrics>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                contexts: Vec::new(),
                quarantine: VecDeque::new(),
                by_user_id: HashMap::new(),
                next_unique: 0,
            }),
            finished: Condvar::new(),
            max_threads,
            quarantine_size,
            metrics,
        }
    }

    /// Allocate a context for a new thread.
    ///
    /// The oldest quarantined tid is reused once the quarantine exceeds its
    /// cap or no fresh tid is left. The parent's clock is released into the
    /// new context for the child to acquire at start.
    pub fn create(
        &self,
        parent: Option<&mut ThreadState>,
        detached: bool,
        user_id: Option<u64>,
        stack: StackId,
    ) -> Result<Tid, DetectorError> {
        let mut parent = parent;
        if let Some(p) = parent.as_deref_mut() {
            p.tick()?;
        }
        let mut inner = self.inner.lock();
        let exhausted = inner.contexts.len() >= self.max_threads;
        let tid = if inner.quarantine.len() > self.quarantine_size || exhausted {
            match inner.quarantine.pop_front() {
                Some(tid) => {
                    let ctx = inner
                        .context_mut(tid)
                        .ok_or(DetectorError::InvalidTid { tid })?;
                    ctx.status = ThreadStatus::Invalid;
                    ctx.epoch0 = ctx.epoch1 + 1;
                    ctx.reuse_count += 1;
                    DetectorMetrics::inc(&self.metrics.threads_reused);
                    tracing::debug!(
                        target: "frankenrace::thread",
                        tid = tid.0,
                        reuse = ctx.reuse_count,
                        epoch0 = ctx.epoch0,
                        "reusing quarantined tid"
                    );
                    tid
                }
                None if exhausted => {
                    return Err(DetectorError::TidSpaceExhausted {
                        max_threads: self.max_threads,
                    });
                }
                None => Self::fresh(&mut inner),
            }
        } else {
            Self::fresh(&mut inner)
        };

        inner.next_unique += 1;
        let unique_id = inner.next_unique;
        if let Some(uid) = user_id {
            inner.by_user_id.insert(uid, tid);
        }
        let ctx = inner
            .context_mut(tid)
            .ok_or(DetectorError::InvalidTid { tid })?;
        ctx.unique_id = unique_id;
        ctx.user_id = user_id;
        ctx.os_id = 0;
        ctx.status = ThreadStatus::Created;
        ctx.detached = detached;
        ctx.epoch1 = 0;
        ctx.name = None;
        ctx.parent = parent.as_deref().map(ThreadState::tid);
        ctx.creation_stack = stack;
        ctx.stack_range = None;
        ctx.tls_range = None;
        ctx.signal = Arc::new(SignalContext::new());
        match parent.as_deref() {
            Some(p) => p.clock().release_store(&mut ctx.sync),
            None => ctx.sync.reset(),
        }
        DetectorMetrics::inc(&self.metrics.threads_created);
        tracing::debug!(
            target: "frankenrace::thread",
            tid = tid.0,
            unique_id,
            detached,
            parent = ?ctx.parent,
            "thread created"
        );
        Ok(tid)
    }

    fn fresh(inner: &mut RegistryInner) -> Tid {
        let tid = Tid(inner.contexts.len() as u32);
        let mut ctx = ThreadContext::new(tid);
        ctx.epoch0 = 1;
        inner.contexts.push(ctx);
        tid
    }

    /// Called on the new thread itself; returns its runtime state.
    pub fn start(&self, tid: Tid, os_id: u64) -> Result<ThreadState, DetectorError> {
        let mut inner = self.inner.lock();
        let ctx = inner
            .context_mut(tid)
            .filter(|c| c.status == ThreadStatus::Created)
            .ok_or(DetectorError::InvalidTid { tid })?;
        ctx.status = ThreadStatus::Running;
        ctx.os_id = os_id;
        let mut state = ThreadState::new(
            tid,
            ctx.unique_id,
            ctx.epoch0,
            Arc::clone(&ctx.signal),
            Arc::clone(&ctx.epoch_cell),
        );
        state.acquire(&ctx.sync);
        tracing::debug!(target: "frankenrace::thread", tid = tid.0, os_id, "thread started");
        Ok(state)
    }

    /// Called by a thread as it exits.
    pub fn finish(&self, thr: &mut ThreadState) -> Result<(), DetectorError> {
        let tid = thr.tid();
        let epoch = thr.tick()?;
        let mut inner = self.inner.lock();
        let ctx = inner
            .context_mut(tid)
            .filter(|c| c.status == ThreadStatus::Running)
            .ok_or(DetectorError::InvalidTid { tid })?;
        ctx.epoch1 = epoch;
        ctx.stack_range = None;
        ctx.tls_range = None;
        thr.finished = true;
        if ctx.detached {
            ctx.sync.reset();
            Self::retire(&mut inner, tid, &self.metrics);
            tracing::debug!(target: "frankenrace::thread", tid = tid.0, epoch, "detached thread finished");
        } else {
            thr.clock().release_store(&mut ctx.sync);
            ctx.sync.mark_freed(tid);
            ctx.status = ThreadStatus::Finished;
            tracing::debug!(target: "frankenrace::thread", tid = tid.0, epoch, "thread finished");
            self.finished.notify_all();
        }
        Ok(())
    }

    /// Mark `tid` dead and queue it for reuse.
    fn retire(inner: &mut RegistryInner, tid: Tid, metrics: &DetectorMetrics) {
        if let Some(ctx) = inner.context_mut(tid) {
            ctx.status = ThreadStatus::Dead;
            if let Some(uid) = ctx.user_id.take() {
                inner.by_user_id.remove(&uid);
            }
        }
        inner.quarantine.push_back(tid);
        DetectorMetrics::raise(&metrics.quarantine_high_water, inner.quarantine.len() as u64);
    }

    /// Wait for `tid` to finish and acquire its final clock.
    pub fn join(&self, joiner: &mut ThreadState, tid: Tid) -> Result<(), Diagnostic> {
        let mut inner = self.inner.lock();
        loop {
            let Some(ctx) = inner.contexts.get(tid.index()) else {
                return Err(Diagnostic::JoinInvalidThread { tid });
            };
            if ctx.detached && ctx.status != ThreadStatus::Invalid {
                return Err(Diagnostic::JoinDetachedThread { tid });
            }
            match ctx.status {
                ThreadStatus::Invalid | ThreadStatus::Dead => {
                    return Err(Diagnostic::JoinInvalidThread { tid });
                }
                ThreadStatus::Created | ThreadStatus::Running => {
                    self.finished.wait(&mut inner);
                }
                ThreadStatus::Finished => break,
            }
        }
        if let Some(ctx) = inner.contexts.get(tid.index()) {
            joiner.acquire(&ctx.sync);
        }
        Self::retire(&mut inner, tid, &self.metrics);
        tracing::debug!(target: "frankenrace::thread", tid = tid.0, joiner = joiner.tid().0, "thread joined");
        Ok(())
    }

    pub fn detach(&self, tid: Tid) -> Result<(), Diagnostic> {
        let mut inner = self.inner.lock();
        let Some(ctx) = inner.context_mut(tid) else {
            return Err(Diagnostic::DetachInvalidThread { tid });
        };
        if ctx.detached && ctx.status != ThreadStatus::Invalid {
            return Err(Diagnostic::DoubleDetach { tid });
        }
        match ctx.status {
            ThreadStatus::Invalid | ThreadStatus::Dead => Err(Diagnostic::DetachInvalidThread { tid }),
            ThreadStatus::Finished => {
                ctx.detached = true;
                ctx.sync.reset();
                Self::retire(&mut inner, tid, &self.metrics);
                tracing::debug!(target: "frankenrace::thread", tid = tid.0, "finished thread detached");
                Ok(())
            }
            ThreadStatus::Created | ThreadStatus::Running => {
                ctx.detached = true;
                tracing::debug!(target: "frankenrace::thread", tid = tid.0, "thread detached");
                Ok(())
            }
        }
    }

    pub fn set_name(&self, tid: Tid, name: &str) {
        if let Some(ctx) = self.inner.lock().context_mut(tid).filter(|c| c.is_live()) {
            ctx.name = Some(name.to_owned());
        }
    }

    pub fn set_ranges(&self, tid: Tid, stack: Option<Range<usize>>, tls: Option<Range<usize>>) {
        if let Some(ctx) = self.inner.lock().context_mut(tid).filter(|c| c.is_live()) {
            ctx.stack_range = stack;
            ctx.tls_range = tls;
        }
    }

    /// Tid of the live thread the wrapper knows as `user_id`.
    #[must_use]
    pub fn thread_tid(&self, user_id: u64) -> Option<Tid> {
        let inner = self.inner.lock();
        let tid = *inner.by_user_id.get(&user_id)?;
        inner
            .contexts
            .get(tid.index())
            .filter(|c| c.is_live())
            .map(|c| c.tid)
    }

    #[must_use]
    pub fn status(&self, tid: Tid) -> ThreadStatus {
        self.inner
            .lock()
            .contexts
            .get(tid.index())
            .map_or(ThreadStatus::Invalid, |c| c.status)
    }

    #[must_use]
    pub fn info(&self, tid: Tid) -> Option<ThreadInfo> {
        self.inner.lock().contexts.get(tid.index()).map(ThreadContext::info)
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<ThreadInfo> {
        self.inner.lock().contexts.iter().map(ThreadContext::info).collect()
    }

    #[must_use]
    pub fn quarantine_len(&self) -> usize {
        self.inner.lock().quarantine.len()
    }

    /// Unique id of the thread that recorded `epoch` on `tid`, and whether
    /// it has finished since. `None` once the tid was reused.
    #[must_use]
    pub fn occupant(&self, tid: Tid, epoch: Epoch) -> Option<(u64, bool)> {
        let inner = self.inner.lock();
        let ctx = inner.contexts.get(tid.index())?;
        if ctx.status == ThreadStatus::Invalid || epoch < ctx.epoch0 {
            return None;
        }
        let retired = matches!(ctx.status, ThreadStatus::Finished | ThreadStatus::Dead);
        Some((ctx.unique_id, retired))
    }

    /// Current epoch of every thread that has run.
    #[must_use]
    pub fn global_clock(&self) -> VectorClock {
        let inner = self.inner.lock();
        let mut clock = VectorClock::new();
        for ctx in &inner.contexts {
            let epoch = match ctx.status {
                ThreadStatus::Running => ctx.epoch_cell.load(Ordering::Relaxed),
                ThreadStatus::Finished | ThreadStatus::Dead => ctx.epoch1,
                ThreadStatus::Invalid | ThreadStatus::Created => continue,
            };
            clock.set(ctx.tid, epoch);
        }
        clock
    }

    /// Stack or TLS location of a running thread containing `addr`.
    #[must_use]
    pub fn classify(&self, addr: usize) -> Option<Location> {
        let inner = self.inner.lock();
        inner
            .contexts
            .iter()
            .filter(|c| c.status == ThreadStatus::Running)
            .find_map(|c| {
                if c.stack_range.as_ref().is_some_and(|r| r.contains(&addr)) {
                    Some(Location::Stack { tid: c.tid })
                } else if c.tls_range.as_ref().is_some_and(|r| r.contains(&addr)) {
                    Some(Location::Tls { tid: c.tid })
                } else {
                    None
                }
            })
    }

    /// Notification context of a thread that has not finished.
    #[must_use]
    pub fn signal_context(&self, tid: Tid) -> Option<Arc<SignalContext>> {
        let inner = self.inner.lock();
        inner
            .contexts
            .get(tid.index())
            .filter(|c| matches!(c.status, ThreadStatus::Created | ThreadStatus::Running))
            .map(|c| Arc::clone(&c.signal))
    }
}
