//! Allocation metadata and the allocator hooks.
//!
//! Each live heap block gets an [`MBlock`] slot in a [`BlockArena`]. The
//! block is referenced from the meta cell of its first granule, at the tail
//! of that cell's sync chain, so freeing the block's range tears down the
//! sync objects that live inside it together with the block itself.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;

use crate::access;
use crate::detector::Detector;
use crate::error::{DetectorError, OrDie};
use crate::metrics::DetectorMetrics;
use crate::stack::StackId;
use crate::thread::ThreadState;
use crate::vector_clock::Tid;

/// Metadata of one live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MBlock {
    pub addr: usize,
    pub size: usize,
    pub alloc_tid: Tid,
    pub alloc_stack: StackId,
}

/// Opaque handle returned by [`Detector::on_alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle(pub u32);

struct BlockArenaInner {
    slots: Vec<Option<MBlock>>,
    free_list: Vec<u32>,
    /// Start address to slot index, for containing-address lookups.
    by_addr: BTreeMap<usize, u32>,
}

/// Fixed-capacity arena of allocation blocks.
pub struct BlockArena {
    inner: Mutex<BlockArenaInner>,
    capacity: usize,
}

impl BlockArena {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BlockArenaInner {
                slots: Vec::new(),
                free_list: Vec::new(),
                by_addr: BTreeMap::new(),
            }),
            capacity,
        }
    }

    pub fn alloc(&self, block: MBlock) -> Result<u32, DetectorError> {
        let mut inner = self.inner.lock();
        let idx = match inner.free_list.pop() {
            Some(idx) => idx,
            None => {
                if inner.slots.len() >= self.capacity {
                    return Err(DetectorError::ArenaExhausted {
                        arena: "block",
                        capacity: self.capacity,
                    });
                }
                inner.slots.push(None);
                (inner.slots.len() - 1) as u32
            }
        };
        inner.slots[idx as usize] = Some(block);
        // A stale entry at the same start is superseded.
        if let Some(old) = inner.by_addr.insert(block.addr, idx)
            && old != idx
            && let Some(slot) = inner.slots.get_mut(old as usize)
            && slot.take().is_some()
        {
            inner.free_list.push(old);
        }
        Ok(idx)
    }

    #[must_use]
    pub fn get(&self, idx: u32) -> Option<MBlock> {
        self.inner.lock().slots.get(idx as usize).copied().flatten()
    }

    /// Release a slot; returns the block it held.
    pub fn free(&self, idx: u32) -> Option<MBlock> {
        let mut inner = self.inner.lock();
        let block = inner.slots.get_mut(idx as usize)?.take()?;
        if inner.by_addr.get(&block.addr) == Some(&idx) {
            inner.by_addr.remove(&block.addr);
        }
        inner.free_list.push(idx);
        Some(block)
    }

    /// Release every block starting in `[lo, hi)`; returns how many.
    pub fn forget_range(&self, lo: usize, hi: usize) -> usize {
        if lo >= hi {
            return 0;
        }
        let mut inner = self.inner.lock();
        let doomed: Vec<(usize, u32)> = inner.by_addr.range(lo..hi).map(|(&a, &i)| (a, i)).collect();
        for &(addr, idx) in &doomed {
            inner.by_addr.remove(&addr);
            if let Some(slot) = inner.slots.get_mut(idx as usize) {
                *slot = None;
            }
            inner.free_list.push(idx);
        }
        doomed.len()
    }

    /// Move a block to a new start address.
    pub fn rebase(&self, idx: u32, new_addr: usize) {
        let mut inner = self.inner.lock();
        let Some(Some(block)) = inner.slots.get(idx as usize).copied() else {
            return;
        };
        if inner.by_addr.get(&block.addr) == Some(&idx) {
            inner.by_addr.remove(&block.addr);
        }
        inner.by_addr.insert(new_addr, idx);
        inner.slots[idx as usize] = Some(MBlock {
            addr: new_addr,
            ..block
        });
    }

    /// The live block whose byte range contains `addr`.
    #[must_use]
    pub fn find_containing(&self, addr: usize) -> Option<MBlock> {
        let inner = self.inner.lock();
        let (_, &idx) = inner.by_addr.range(..=addr).next_back()?;
        let block = inner.slots.get(idx as usize).copied().flatten()?;
        (addr < block.addr + block.size.max(1)).then_some(block)
    }

    #[must_use]
    pub fn live(&self) -> usize {
        self.inner.lock().by_addr.len()
    }
}

/// Mappings larger than this are reset rather than imitated as written.
const IMITATE_WRITE_LIMIT: usize = 1 << 20;

impl Detector {
    /// A fresh allocation at `[addr, addr + size)` by the calling thread.
    ///
    /// Any metadata left over in the range is discarded and the range counts
    /// as written by the allocating thread.
    pub fn on_alloc(&self, thr: &mut ThreadState, addr: usize, size: usize) -> BlockHandle {
        self.alloc_block(thr, addr, size).or_die()
    }

    fn alloc_block(
        &self,
        thr: &mut ThreadState,
        addr: usize,
        size: usize,
    ) -> Result<BlockHandle, DetectorError> {
        let span = size.max(1);
        if addr.checked_add(span).is_none_or(|end| end > crate::shadow::APP_MEM_END) {
            return Err(DetectorError::AddressOutOfRange { addr });
        }
        self.syncs.free_range(addr, span);
        let alloc_stack = thr.current_stack(&self.stacks);
        let idx = self.syncs.alloc_block(MBlock {
            addr,
            size,
            alloc_tid: thr.tid(),
            alloc_stack,
        })?;
        if self.enabled() && !thr.ignoring_accesses() && size <= IMITATE_WRITE_LIMIT {
            access::imitate_write(&self.shadow, thr, addr, size)?;
        } else {
            self.shadow.reset_range(addr, size);
        }
        DetectorMetrics::inc(&self.metrics.blocks_allocated);
        tracing::trace!(target: "frankenrace::alloc", addr, size, tid = thr.tid().0, "alloc");
        Ok(BlockHandle(idx))
    }

    /// Release of the block starting at `addr`.
    ///
    /// The freed range is checked as a write first, so a free racing with an
    /// unsynchronized access is reported. Unknown blocks are fatal.
    pub fn on_free(&self, thr: &mut ThreadState, addr: usize) {
        self.free_block(thr, addr).or_die();
    }

    fn free_block(&self, thr: &mut ThreadState, addr: usize) -> Result<(), DetectorError> {
        // An interior pointer shares the meta cell of its block's start.
        let Some((_, block)) = self.syncs.find_block(addr).filter(|(_, b)| b.addr == addr) else {
            return Err(DetectorError::UnknownBlock { addr });
        };
        if block.size > 0 {
            self.access_range(thr, addr, block.size, true, false)?;
        }
        self.syncs.free_range(addr, block.size.max(1));
        self.shadow.reset_range(addr, block.size);
        tracing::trace!(target: "frankenrace::alloc", addr, size = block.size, tid = thr.tid().0, "free");
        Ok(())
    }

    /// A new mapping; treated like an allocation without a block.
    pub fn on_mmap(&self, thr: &mut ThreadState, addr: usize, size: usize) {
        self.map_range(thr, addr, size).or_die();
    }

    fn map_range(&self, thr: &mut ThreadState, addr: usize, size: usize) -> Result<(), DetectorError> {
        if size == 0 {
            return Ok(());
        }
        if addr.checked_add(size).is_none_or(|end| end > crate::shadow::APP_MEM_END) {
            return Err(DetectorError::AddressOutOfRange { addr });
        }
        if self.enabled() && !thr.ignoring_accesses() && size <= IMITATE_WRITE_LIMIT {
            access::imitate_write(&self.shadow, thr, addr, size)
        } else {
            self.shadow.reset_range(addr, size);
            Ok(())
        }
    }

    /// An unmapping; runs the best-effort huge-range reset on meta and
    /// shadow state.
    pub fn on_munmap(&self, _thr: &mut ThreadState, addr: usize, size: usize) {
        self.syncs.reset_range(addr, size);
        self.shadow.reset_range(addr, size);
        tracing::debug!(target: "frankenrace::alloc", addr, size, "munmap");
    }

    /// Recorded size of the live block starting at `addr`.
    #[must_use]
    pub fn block_size(&self, addr: usize) -> Option<usize> {
        self.syncs
            .find_block(addr)
            .filter(|(_, b)| b.addr == addr)
            .map(|(_, b)| b.size)
    }

    /// The live block containing `addr`.
    #[must_use]
    pub fn find_block_containing(&self, addr: usize) -> Option<MBlock> {
        self.syncs.blocks().find_containing(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(addr: usize, size: usize) -> MBlock {
        MBlock {
            addr,
            size,
            alloc_tid: Tid(0),
            alloc_stack: StackId::NONE,
        }
    }

    #[test]
    fn containing_lookup_respects_bounds() {
        let arena = BlockArena::new(8);
        arena.alloc(block(0x1000, 0x40)).unwrap();
        arena.alloc(block(0x2000, 0x10)).unwrap();
        assert_eq!(arena.find_containing(0x1000).map(|b| b.addr), Some(0x1000));
        assert_eq!(arena.find_containing(0x103f).map(|b| b.addr), Some(0x1000));
        assert_eq!(arena.find_containing(0x1040), None);
        assert_eq!(arena.find_containing(0xfff), None);
        assert_eq!(arena.find_containing(0x2008).map(|b| b.size), Some(0x10));
    }

    #[test]
    fn freed_slots_are_reused() {
        let arena = BlockArena::new(2);
        let a = arena.alloc(block(0x10, 8)).unwrap();
        arena.alloc(block(0x20, 8)).unwrap();
        assert!(arena.alloc(block(0x30, 8)).is_err());
        assert_eq!(arena.free(a).map(|b| b.addr), Some(0x10));
        assert_eq!(arena.free(a), None, "double free of a slot is a no-op");
        assert_eq!(arena.alloc(block(0x30, 8)).unwrap(), a);
        assert_eq!(arena.live(), 2);
    }

    #[test]
    fn forget_range_drops_only_inner_starts() {
        let arena = BlockArena::new(8);
        arena.alloc(block(0x1000, 8)).unwrap();
        arena.alloc(block(0x5000, 8)).unwrap();
        arena.alloc(block(0x9000, 8)).unwrap();
        assert_eq!(arena.forget_range(0x2000, 0x9000), 1);
        assert!(arena.find_containing(0x5000).is_none());
        assert!(arena.find_containing(0x1000).is_some());
        assert!(arena.find_containing(0x9000).is_some());
    }

    #[test]
    fn rebase_moves_the_index() {
        let arena = BlockArena::new(4);
        let idx = arena.alloc(block(0x100, 16)).unwrap();
        arena.rebase(idx, 0x200);
        assert!(arena.find_containing(0x100).is_none());
        assert_eq!(arena.get(idx).map(|b| b.addr), Some(0x200));
    }
}
