//! Failure taxonomy for the detector core.
//!
//! Two classes exist and neither is handed back to the instrumented program:
//! - [`DetectorError`]: invariant violations. Internal code propagates these
//!   with `?`; the public entry points route them to [`die`], which logs,
//!   runs the installed die-callback and aborts the process.
//! - [`Diagnostic`]: misuse by the program under test (joining a thread that
//!   was never created, unlocking a mutex it does not own). These go to the
//!   report sink and the offending operation becomes a no-op.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::vector_clock::Tid;

/// Detector invariant violations. Every variant is fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectorError {
    /// All thread identifiers are live and the quarantine is empty.
    #[error("thread identifier space exhausted ({max_threads} threads) with empty quarantine")]
    TidSpaceExhausted { max_threads: usize },

    /// `free` on an address with no allocation metadata.
    #[error("free of address {addr:#x} with no allocation metadata")]
    UnknownBlock { addr: usize },

    /// A fixed-capacity arena ran out of slots.
    #[error("{arena} arena exhausted ({capacity} slots)")]
    ArenaExhausted { arena: &'static str, capacity: usize },

    /// A thread's logical clock ran past the epoch bit width.
    #[error("epoch overflow on thread {tid}")]
    EpochOverflow { tid: Tid },

    /// Address outside the supported application range.
    #[error("address {addr:#x} outside application memory")]
    AddressOutOfRange { addr: usize },

    /// A memory move whose ends or length are not granule-aligned.
    #[error("move of {size:#x} bytes from {src:#x} to {dst:#x} is not granule-aligned")]
    UnalignedMove { src: usize, dst: usize, size: usize },

    /// Sync-object insertion kept losing its compare-and-swap even under
    /// the registry lock.
    #[error("sync object insertion at {addr:#x} made no progress after {attempts} attempts")]
    InsertStalled { addr: usize, attempts: usize },

    /// A tid that does not name a context slot.
    #[error("tid {tid} does not name a thread context")]
    InvalidTid { tid: Tid },

    /// A race was reported while running in halt-on-race mode.
    #[error("halting after data race at {addr:#x}")]
    HaltOnRace { addr: usize },
}

/// Misuse of threads or synchronization by the program under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    JoinInvalidThread { tid: Tid },
    JoinDetachedThread { tid: Tid },
    DetachInvalidThread { tid: Tid },
    DoubleDetach { tid: Tid },
    DoubleLock { addr: usize, tid: Tid },
    UnlockUnlocked { addr: usize, tid: Tid },
    UnlockForeign { addr: usize, tid: Tid, owner: Tid },
    ReadLockWhileWriteLocked { addr: usize, tid: Tid, owner: Tid },
    ReadUnlockUnlocked { addr: usize, tid: Tid },
    DestroyLocked { addr: usize, tid: Tid, owner: Tid },
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::JoinInvalidThread { tid } => write!(f, "join of invalid thread T{tid}"),
            Self::JoinDetachedThread { tid } => write!(f, "join of detached thread T{tid}"),
            Self::DetachInvalidThread { tid } => write!(f, "detach of invalid thread T{tid}"),
            Self::DoubleDetach { tid } => write!(f, "thread T{tid} detached twice"),
            Self::DoubleLock { addr, tid } => {
                write!(f, "double lock of mutex {addr:#x} by T{tid}")
            }
            Self::UnlockUnlocked { addr, tid } => {
                write!(f, "unlock of unlocked mutex {addr:#x} by T{tid}")
            }
            Self::UnlockForeign { addr, tid, owner } => {
                write!(f, "unlock of mutex {addr:#x} by T{tid}, owned by T{owner}")
            }
            Self::ReadLockWhileWriteLocked { addr, tid, owner } => write!(
                f,
                "read lock of mutex {addr:#x} by T{tid} while write-locked by T{owner}"
            ),
            Self::ReadUnlockUnlocked { addr, tid } => {
                write!(f, "read unlock of unlocked mutex {addr:#x} by T{tid}")
            }
            Self::DestroyLocked { addr, tid, owner } => write!(
                f,
                "destroy of mutex {addr:#x} by T{tid} while locked by T{owner}"
            ),
        }
    }
}

/// Callback run by [`die`] before the process aborts.
pub type DieCallback = Arc<dyn Fn(&DetectorError) + Send + Sync>;

static DIE_CALLBACK: RwLock<Option<DieCallback>> = RwLock::new(None);

/// Install a callback that runs on every fatal error, replacing any previous one.
///
/// A callback that panics turns fatal errors into unwinding panics, which is
/// how tests observe them.
pub fn set_die_callback(callback: Option<DieCallback>) {
    *DIE_CALLBACK.write() = callback;
}

/// Terminate the process on a detector invariant violation.
#[cold]
pub fn die(err: &DetectorError) -> ! {
    tracing::error!(target: "frankenrace::detector", error = %err, "FATAL: FrankenRace");
    let callback = DIE_CALLBACK.read().clone();
    if let Some(callback) = callback {
        callback(err);
    }
    std::process::abort()
}

/// Unwrap a core result at a public entry point, dying on error.
pub(crate) trait OrDie<T> {
    fn or_die(self) -> T;
}

impl<T> OrDie<T> for Result<T, DetectorError> {
    #[inline]
    fn or_die(self) -> T {
        match self {
            Ok(v) => v,
            Err(e) => die(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_addresses_in_hex() {
        let err = DetectorError::UnknownBlock { addr: 0x1000 };
        assert_eq!(
            err.to_string(),
            "free of address 0x1000 with no allocation metadata"
        );
    }

    #[test]
    fn registry_errors_name_their_operands() {
        let err = DetectorError::UnalignedMove {
            src: 0x1004,
            dst: 0x2000,
            size: 4,
        };
        assert_eq!(
            err.to_string(),
            "move of 0x4 bytes from 0x1004 to 0x2000 is not granule-aligned"
        );
        let err = DetectorError::InsertStalled {
            addr: 0x40,
            attempts: 4097,
        };
        assert_eq!(
            err.to_string(),
            "sync object insertion at 0x40 made no progress after 4097 attempts"
        );
    }

    #[test]
    fn diagnostics_render_thread_names() {
        let d = Diagnostic::UnlockForeign {
            addr: 0x40,
            tid: Tid(2),
            owner: Tid(1),
        };
        assert_eq!(d.to_string(), "unlock of mutex 0x40 by T2, owned by T1");
    }

    #[test]
    fn diagnostics_serialize_with_kind_tag() {
        let d = Diagnostic::DoubleDetach { tid: Tid(3) };
        let json = serde_json::to_value(d).expect("serialize");
        assert_eq!(json["kind"], "double_detach");
        assert_eq!(json["tid"], 3);
    }
}
