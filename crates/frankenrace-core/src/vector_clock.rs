//! Thread identifiers, epochs and vector clocks.
//!
//! A [`VectorClock`] is indexed by [`Tid`] and holds one epoch per thread.
//! Each element carries a "freed" high bit: set on the slot of a thread that
//! has since retired, so a snapshot can tell that an epoch belongs to a
//! previous occupant of a reusable tid.
//!
//! Epochs of a tid keep counting across reuse (a new occupant starts past the
//! last epoch of the previous one), which keeps every stale snapshot value
//! strictly below the new occupant's epochs.

use serde::Serialize;

use crate::error::DetectorError;

/// Width of an epoch in bits.
pub const EPOCH_BITS: u32 = 42;

/// Largest representable epoch.
pub const MAX_EPOCH: Epoch = (1 << EPOCH_BITS) - 1;

/// Width of a thread identifier in shadow records.
pub const TID_BITS: u32 = 13;

/// Hard upper bound on simultaneously addressable thread identifiers.
pub const MAX_TID_SPACE: usize = 1 << TID_BITS;

const FREED_BIT: u64 = 1 << 63;

/// Logical time of one thread.
pub type Epoch = u64;

/// Dense thread identifier, reused after quarantine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Tid(pub u32);

impl Tid {
    /// The thread that initialized the detector.
    pub const MAIN: Tid = Tid(0);

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for Tid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One clock slot: an epoch plus the freed bit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockElem(u64);

impl ClockElem {
    #[inline]
    #[must_use]
    pub const fn new(epoch: Epoch, freed: bool) -> Self {
        let bits = epoch & MAX_EPOCH;
        Self(if freed { bits | FREED_BIT } else { bits })
    }

    #[inline]
    #[must_use]
    pub const fn epoch(self) -> Epoch {
        self.0 & MAX_EPOCH
    }

    #[inline]
    #[must_use]
    pub const fn is_freed(self) -> bool {
        self.0 & FREED_BIT != 0
    }
}

/// Per-thread array of epochs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorClock {
    elems: Vec<ClockElem>,
}

impl VectorClock {
    #[must_use]
    pub const fn new() -> Self {
        Self { elems: Vec::new() }
    }

    /// Number of slots materialized so far; slots past this read as zero.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elems.iter().all(|e| e.epoch() == 0)
    }

    #[inline]
    #[must_use]
    pub fn get(&self, tid: Tid) -> Epoch {
        self.elem(tid).epoch()
    }

    #[inline]
    #[must_use]
    pub fn elem(&self, tid: Tid) -> ClockElem {
        self.elems.get(tid.index()).copied().unwrap_or_default()
    }

    fn slot_mut(&mut self, tid: Tid) -> &mut ClockElem {
        let idx = tid.index();
        if idx >= self.elems.len() {
            self.elems.resize(idx + 1, ClockElem::default());
        }
        &mut self.elems[idx]
    }

    /// Direct write of one slot; clears its freed bit.
    pub fn set(&mut self, tid: Tid, epoch: Epoch) {
        *self.slot_mut(tid) = ClockElem::new(epoch, false);
    }

    /// Advance `tid`'s own slot by one.
    pub fn tick(&mut self, tid: Tid) -> Result<Epoch, DetectorError> {
        let next = self.get(tid) + 1;
        if next > MAX_EPOCH {
            return Err(DetectorError::EpochOverflow { tid });
        }
        self.set(tid, next);
        Ok(next)
    }

    /// Pointwise max-merge of `src` into `self`.
    ///
    /// On equal epochs the freed bits are or-ed. Returns true if any slot grew.
    pub fn acquire(&mut self, src: &VectorClock) -> bool {
        if src.elems.len() > self.elems.len() {
            self.elems.resize(src.elems.len(), ClockElem::default());
        }
        let mut changed = false;
        for (dst, &s) in self.elems.iter_mut().zip(src.elems.iter()) {
            if s.epoch() > dst.epoch() {
                *dst = s;
                changed = true;
            } else if s.epoch() == dst.epoch() && s.is_freed() && !dst.is_freed() {
                *dst = s;
            }
        }
        changed
    }

    /// Merge the current state into `dst` (what a releasing unlock does).
    pub fn release(&self, dst: &mut VectorClock) {
        dst.acquire(self);
    }

    /// Overwrite `dst` with the current state.
    pub fn release_store(&self, dst: &mut VectorClock) {
        dst.elems.clear();
        dst.elems.extend_from_slice(&self.elems);
    }

    /// Mark `tid`'s slot as belonging to a retired thread.
    pub fn mark_freed(&mut self, tid: Tid) {
        let slot = self.slot_mut(tid);
        *slot = ClockElem::new(slot.epoch(), true);
    }

    #[must_use]
    pub fn is_freed(&self, tid: Tid) -> bool {
        self.elem(tid).is_freed()
    }

    /// True if this clock has observed `epoch` of `tid`.
    #[inline]
    #[must_use]
    pub fn dominates(&self, tid: Tid, epoch: Epoch) -> bool {
        self.get(tid) >= epoch
    }

    pub fn reset(&mut self) {
        self.elems.clear();
    }

    /// Iterate over materialized `(tid, elem)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Tid, ClockElem)> + '_ {
        self.elems
            .iter()
            .enumerate()
            .map(|(i, &e)| (Tid(i as u32), e))
    }
}
