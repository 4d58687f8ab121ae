//! Interned call stacks.
//!
//! Threads keep a shadow call stack of program counters pushed by
//! `FuncEntry` and popped by `FuncExit`. Whenever a stack has to outlive the
//! moment (sync object creation, allocation, race reports) it is interned in
//! the [`StackDepot`] and referred to by a compact [`StackId`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

/// Handle to an interned stack. `StackId::NONE` is the empty stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StackId(pub u32);

impl StackId {
    pub const NONE: StackId = StackId(0);

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

#[derive(Default)]
struct DepotInner {
    ids: HashMap<Arc<[usize]>, StackId>,
    // Index i holds the frames of StackId(i + 1).
    frames: Vec<Arc<[usize]>>,
}

/// Process-wide stack interning table.
#[derive(Default)]
pub struct StackDepot {
    inner: RwLock<DepotInner>,
}

impl StackDepot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `frames` (outermost first) and return its id.
    pub fn put(&self, frames: &[usize]) -> StackId {
        if frames.is_empty() {
            return StackId::NONE;
        }
        if let Some(&id) = self.inner.read().ids.get(frames) {
            return id;
        }
        let mut inner = self.inner.write();
        if let Some(&id) = inner.ids.get(frames) {
            return id;
        }
        let stored: Arc<[usize]> = Arc::from(frames);
        let id = StackId(u32::try_from(inner.frames.len() + 1).unwrap_or(u32::MAX));
        inner.frames.push(Arc::clone(&stored));
        inner.ids.insert(stored, id);
        id
    }

    /// Frames of an interned stack; empty for [`StackId::NONE`] or unknown ids.
    #[must_use]
    pub fn get(&self, id: StackId) -> Arc<[usize]> {
        if id.is_none() {
            return Arc::from(Vec::new());
        }
        self.inner
            .read()
            .frames
            .get(id.0 as usize - 1)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
