//! Blocking calls and deferred notifications.
//!
//! A thread about to enter a call the program would block in (join, timed
//! wait, sleep) wraps it in a [`BlockingCall`]. While the guard is alive,
//! notifications aimed at the thread are only queued; they are replayed on
//! the thread itself when the guard drops. Each signal number has a single
//! pending slot, so duplicates arriving while one is armed are dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::detector::Detector;
use crate::error::OrDie;
use crate::metrics::DetectorMetrics;
use crate::thread::ThreadState;
use crate::vector_clock::Tid;

/// Number of distinct signal numbers.
pub const SIGNAL_COUNT: usize = 65;

/// An asynchronous notification for a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub signo: u32,
    pub payload: u64,
}

/// Handler run on the receiving thread after its global acquire.
pub type NotificationHandler = Arc<dyn Fn(Tid, Notification) + Send + Sync>;

/// Per-thread notification state, shared with senders.
pub struct SignalContext {
    in_blocking: AtomicBool,
    has_pending: AtomicBool,
    pending: Mutex<[Option<Notification>; SIGNAL_COUNT]>,
}

impl SignalContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_blocking: AtomicBool::new(false),
            has_pending: AtomicBool::new(false),
            pending: Mutex::new([None; SIGNAL_COUNT]),
        }
    }

    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.in_blocking.load(Ordering::Acquire)
    }

    fn set_blocking(&self, on: bool) {
        self.in_blocking.store(on, Ordering::Release);
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.has_pending.load(Ordering::Acquire)
    }

    /// Arm the slot for `n.signo`. Returns false if one is already armed.
    fn enqueue(&self, n: Notification) -> bool {
        let mut pending = self.pending.lock();
        let Some(slot) = pending.get_mut(n.signo as usize) else {
            return false;
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(n);
        self.has_pending.store(true, Ordering::Release);
        true
    }

    /// Disarm and return every pending notification in signal order.
    fn take_pending(&self) -> Vec<Notification> {
        if !self.has_pending.swap(false, Ordering::AcqRel) {
            return Vec::new();
        }
        self.pending.lock().iter_mut().filter_map(Option::take).collect()
    }
}

impl Default for SignalContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard marking its thread as inside a blocking call.
pub struct BlockingCall<'a> {
    detector: &'a Detector,
    thr: &'a mut ThreadState,
}

impl BlockingCall<'_> {
    /// The blocked thread's state, for the operation performed inside the call.
    pub fn state(&mut self) -> &mut ThreadState {
        &mut *self.thr
    }
}

impl Drop for BlockingCall<'_> {
    fn drop(&mut self) {
        self.thr.signal().set_blocking(false);
        self.detector.process_pending(self.thr);
    }
}

impl Detector {
    /// Enter a blocking call. Notifications already pending are handled first.
    pub fn blocking_call<'a>(&'a self, thr: &'a mut ThreadState) -> BlockingCall<'a> {
        self.process_pending(thr);
        thr.signal().set_blocking(true);
        BlockingCall {
            detector: self,
            thr,
        }
    }

    pub fn set_notification_handler(&self, handler: Option<NotificationHandler>) {
        *self.handler.write() = handler;
    }

    /// Send `n` to `target`.
    ///
    /// A thread notifying itself outside a blocking call handles it at once;
    /// anything else is queued on the target.
    pub fn deliver(&self, from: Option<&mut ThreadState>, target: Tid, n: Notification) {
        if let Some(thr) = from
            && thr.tid() == target
            && !thr.signal().is_blocking()
        {
            self.handle_notification(thr, n);
            return;
        }
        let Some(ctx) = self.threads.signal_context(target) else {
            tracing::debug!(target: "frankenrace::detector", tid = target.0, signo = n.signo, "notification for dead thread dropped");
            return;
        };
        if ctx.enqueue(n) {
            DetectorMetrics::inc(&self.metrics.notifications_queued);
        }
    }

    /// Run every notification queued for `thr`.
    pub fn process_pending(&self, thr: &mut ThreadState) {
        if !thr.signal().has_pending() {
            return;
        }
        let pending = thr.signal().take_pending();
        for n in pending {
            self.handle_notification(thr, n);
        }
    }

    fn handle_notification(&self, thr: &mut ThreadState, n: Notification) {
        self.acquire_global(thr);
        DetectorMetrics::inc(&self.metrics.notifications_processed);
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(thr.tid(), n);
        }
    }

    /// Acquire the current epoch of every thread.
    pub fn acquire_global(&self, thr: &mut ThreadState) {
        if thr.ignoring_sync() {
            return;
        }
        let global = self.threads.global_clock();
        thr.acquire(&global);
        thr.tick().or_die();
    }
}
