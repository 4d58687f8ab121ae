//! Synchronization-object registry.
//!
//! Every address the program synchronizes on gets a [`SyncVar`]: a clock
//! snapshot plus lock ownership. Vars live in a slot arena with a free list
//! and are referenced from the meta shadow cell of their granule through a
//! tagged [`MetaRef`]. Several vars (and at most one allocation block, always
//! last) can share a cell; they form a chain through each var's `next` link.
//!
//! Insertion is lock-free: a new var is pushed at the chain head with a
//! single compare-and-swap, retried a bounded number of times before the
//! inserter falls back to the registry lock. Lock-free inserters do not take
//! that lock, so the locked round is bounded too; running out of it is fatal.
//! Removal always holds the lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::alloc::{BlockArena, MBlock};
use crate::error::DetectorError;
use crate::metrics::DetectorMetrics;
use crate::shadow::{
    APP_MEM_END, GRANULE, MetaCell, MetaMemory, MetaRef, PAGE_SIZE, granule_base, is_app_mem,
};
use crate::stack::StackId;
use crate::vector_clock::{Tid, VectorClock};

/// Address sentinel of a var sitting on the free list.
const FREE_ADDR: usize = usize::MAX;

/// Insertion rounds under the registry lock before giving up. Each lost
/// round means a lock-free inserter won on the same cell.
const LOCKED_INSERT_ROUNDS: usize = 4096;

/// Ranges up to this many pages are always freed exactly.
const EXACT_RESET_PAGES: usize = 4;
/// Forward probing stops at the first empty page past this many bytes.
const FORWARD_PROBE_BYTES: usize = 128 << 10;
/// Backward probing stops at the first empty page past this many bytes.
const BACKWARD_PROBE_BYTES: usize = 512 << 10;

/// Lock-protected part of a sync object.
#[derive(Debug, Default)]
pub struct SyncState {
    /// Creation sequence number; a new object at a reused address gets a new uid.
    pub uid: u64,
    /// Released by writers and exclusive unlocks.
    pub clock: VectorClock,
    /// Released by read unlocks; acquired by exclusive locks only.
    pub read_clock: VectorClock,
    pub owner: Option<Tid>,
    pub recursion: u32,
    pub readers: u32,
    pub is_rw: bool,
    pub is_recursive: bool,
    pub creation_stack: StackId,
}

impl SyncState {
    fn reinit(&mut self, uid: u64, stack: StackId) {
        self.uid = uid;
        self.clock.reset();
        self.read_clock.reset();
        self.owner = None;
        self.recursion = 0;
        self.readers = 0;
        self.is_rw = false;
        self.is_recursive = false;
        self.creation_stack = stack;
    }
}

/// One arena slot.
#[derive(Debug)]
pub struct SyncVar {
    addr: AtomicUsize,
    next: AtomicU32,
    state: RwLock<SyncState>,
}

impl SyncVar {
    fn new(addr: usize, uid: u64, stack: StackId) -> Self {
        Self {
            addr: AtomicUsize::new(addr),
            next: AtomicU32::new(0),
            state: RwLock::new(SyncState {
                uid,
                creation_stack: stack,
                ..SyncState::default()
            }),
        }
    }

    #[inline]
    #[must_use]
    pub fn addr(&self) -> usize {
        self.addr.load(Ordering::Acquire)
    }

    #[inline]
    fn next(&self) -> MetaRef {
        MetaRef::decode(self.next.load(Ordering::Acquire))
    }

    #[inline]
    fn set_next(&self, next: MetaRef) {
        self.next.store(next.encode(), Ordering::Release);
    }
}

/// Fixed-capacity slot arena for sync objects.
struct SyncArena {
    slots: RwLock<Vec<Arc<SyncVar>>>,
    free_list: Mutex<Vec<u32>>,
    capacity: usize,
}

impl SyncArena {
    fn new(capacity: usize) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            free_list: Mutex::new(Vec::new()),
            capacity,
        }
    }

    fn get(&self, idx: u32) -> Option<Arc<SyncVar>> {
        self.slots.read().get(idx as usize).cloned()
    }

    /// Take a slot from the free list or grow the arena. The bool is true
    /// for a recycled slot.
    fn alloc(
        &self,
        addr: usize,
        uid: u64,
        stack: StackId,
    ) -> Result<(u32, Arc<SyncVar>, bool), DetectorError> {
        let recycled = self.free_list.lock().pop();
        if let Some(idx) = recycled
            && let Some(var) = self.get(idx)
        {
            var.state.write().reinit(uid, stack);
            var.set_next(MetaRef::Empty);
            var.addr.store(addr, Ordering::Release);
            return Ok((idx, var, true));
        }
        let mut slots = self.slots.write();
        if slots.len() >= self.capacity {
            return Err(DetectorError::ArenaExhausted {
                arena: "sync",
                capacity: self.capacity,
            });
        }
        let idx = slots.len() as u32;
        let var = Arc::new(SyncVar::new(addr, uid, stack));
        slots.push(Arc::clone(&var));
        Ok((idx, var, false))
    }

    /// Reset a var and put its slot back on the free list.
    fn release(&self, idx: u32, var: &SyncVar) {
        var.state.write().reinit(0, StackId::NONE);
        var.addr.store(FREE_ADDR, Ordering::Release);
        var.set_next(MetaRef::Empty);
        self.free_list.lock().push(idx);
    }

    fn live(&self) -> usize {
        self.slots.read().len() - self.free_list.lock().len()
    }
}

/// Registry mapping application addresses to sync objects and allocation blocks.
pub struct SyncRegistry {
    meta: MetaMemory,
    syncs: SyncArena,
    blocks: BlockArena,
    next_uid: AtomicU64,
    cas_retry_limit: usize,
    /// Serializes chain removal and contended insertion.
    registry_lock: Mutex<()>,
    metrics: Arc<DetectorMetrics>,
}

impl SyncRegistry {
    #[must_use]
    pub fn new(
        max_sync_objects: usize,
        max_blocks: usize,
        cas_retry_limit: usize,
        metrics: Arc<DetectorMetrics>,
    ) -> Self {
        Self {
            meta: MetaMemory::new(),
            syncs: SyncArena::new(max_sync_objects),
            blocks: BlockArena::new(max_blocks),
            next_uid: AtomicU64::new(1),
            cas_retry_limit: cas_retry_limit.max(1),
            registry_lock: Mutex::new(()),
            metrics,
        }
    }

    #[must_use]
    pub fn blocks(&self) -> &BlockArena {
        &self.blocks
    }

    #[must_use]
    pub fn meta(&self) -> &MetaMemory {
        &self.meta
    }

    /// Number of sync objects currently allocated.
    #[must_use]
    pub fn live_syncs(&self) -> usize {
        self.syncs.live()
    }

    fn find_in_chain(&self, mut cur: MetaRef, addr: usize) -> Option<(u32, Arc<SyncVar>)> {
        while let MetaRef::Sync(idx) = cur {
            let var = self.syncs.get(idx)?;
            if var.addr() == addr {
                return Some((idx, var));
            }
            cur = var.next();
        }
        None
    }

    /// Look up the var for `addr`, creating it if absent.
    fn get_or_create(
        &self,
        addr: usize,
        stack: StackId,
    ) -> Result<(u32, Arc<SyncVar>), DetectorError> {
        let cell = self.meta.cell(addr)?;
        let mut speculative: Option<(u32, Arc<SyncVar>)> = None;

        for _ in 0..self.cas_retry_limit {
            if let Some(found) = self.try_insert(&cell, addr, stack, &mut speculative)? {
                return Ok(found);
            }
            DetectorMetrics::inc(&self.metrics.cas_retries);
        }

        DetectorMetrics::inc(&self.metrics.cas_fallbacks);
        tracing::debug!(target: "frankenrace::sync", addr, "insertion fell back to registry lock");
        let _serial = self.registry_lock.lock();
        for _ in 0..LOCKED_INSERT_ROUNDS {
            if let Some(found) = self.try_insert(&cell, addr, stack, &mut speculative)? {
                return Ok(found);
            }
            DetectorMetrics::inc(&self.metrics.cas_retries);
        }
        Err(DetectorError::InsertStalled {
            addr,
            attempts: self.cas_retry_limit + LOCKED_INSERT_ROUNDS,
        })
    }

    /// One walk-then-CAS round. `Ok(None)` means the CAS lost and the caller
    /// should retry.
    fn try_insert(
        &self,
        cell: &MetaCell,
        addr: usize,
        stack: StackId,
        speculative: &mut Option<(u32, Arc<SyncVar>)>,
    ) -> Result<Option<(u32, Arc<SyncVar>)>, DetectorError> {
        let head = cell.load();
        if let Some(found) = self.find_in_chain(head, addr) {
            if let Some((idx, var)) = speculative.take() {
                DetectorMetrics::inc(&self.metrics.speculative_discards);
                self.syncs.release(idx, &var);
            }
            return Ok(Some(found));
        }
        if speculative.is_none() {
            let uid = self.next_uid.fetch_add(1, Ordering::Relaxed);
            let (idx, var, recycled) = self.syncs.alloc(addr, uid, stack)?;
            if recycled {
                DetectorMetrics::inc(&self.metrics.sync_reused);
            }
            *speculative = Some((idx, var));
        }
        let Some((idx, var)) = speculative.as_ref() else {
            return Ok(None);
        };
        var.set_next(head);
        match cell.compare_exchange(head, MetaRef::Sync(*idx)) {
            Ok(()) => {
                DetectorMetrics::inc(&self.metrics.sync_created);
                tracing::trace!(target: "frankenrace::sync", addr, idx = *idx, "sync object created");
                Ok(speculative.take())
            }
            Err(_) => Ok(None),
        }
    }

    /// Run `f` on the sync object for `addr` with it exclusively locked,
    /// creating the object first if needed.
    pub fn get_or_create_and_lock<R>(
        &self,
        addr: usize,
        stack: StackId,
        f: impl FnOnce(&mut SyncState) -> R,
    ) -> Result<R, DetectorError> {
        loop {
            let (_, var) = self.get_or_create(addr, stack)?;
            let mut state = var.state.write();
            // Freed and recycled for another address between lookup and lock.
            if var.addr() != addr {
                continue;
            }
            return Ok(f(&mut state));
        }
    }

    /// Shared-lock flavor of [`Self::get_or_create_and_lock`].
    pub fn get_or_create_and_lock_shared<R>(
        &self,
        addr: usize,
        stack: StackId,
        f: impl FnOnce(&SyncState) -> R,
    ) -> Result<R, DetectorError> {
        loop {
            let (_, var) = self.get_or_create(addr, stack)?;
            let state = var.state.read();
            if var.addr() != addr {
                continue;
            }
            return Ok(f(&state));
        }
    }

    /// Run `f` under the shared lock if a sync object exists for `addr`.
    pub fn with_existing<R>(&self, addr: usize, f: impl FnOnce(&SyncState) -> R) -> Option<R> {
        let cell = self.meta.existing_cell(addr)?;
        let (_, var) = self.find_in_chain(cell.load(), addr)?;
        let state = var.state.read();
        (var.addr() == addr).then(|| f(&state))
    }

    /// Unlink the sync object for `addr`, run `f` on its final state, and
    /// return its slot to the free list.
    pub fn get_and_remove<R>(&self, addr: usize, f: impl FnOnce(&SyncState) -> R) -> Option<R> {
        let cell = self.meta.existing_cell(addr)?;
        let _serial = self.registry_lock.lock();
        let (idx, var) = loop {
            let head = cell.load();
            let (idx, var) = self.find_in_chain(head, addr)?;
            if head == MetaRef::Sync(idx) {
                if cell.compare_exchange(head, var.next()).is_ok() {
                    break (idx, var);
                }
                // A lock-free insert pushed a new head; walk again.
                continue;
            }
            // Interior node: inserts only touch the head, so the predecessor is stable.
            let mut prev = head;
            while let MetaRef::Sync(p) = prev {
                let Some(pv) = self.syncs.get(p) else { break };
                if pv.next() == MetaRef::Sync(idx) {
                    pv.set_next(var.next());
                    break;
                }
                prev = pv.next();
            }
            break (idx, var);
        };
        let out = f(&var.state.write());
        self.syncs.release(idx, &var);
        DetectorMetrics::inc(&self.metrics.sync_freed);
        Some(out)
    }

    /// Record a new allocation block at `addr`, at the tail of the cell's chain.
    pub fn alloc_block(&self, block: MBlock) -> Result<u32, DetectorError> {
        let addr = block.addr;
        let cell = self.meta.cell(addr)?;
        let idx = self.blocks.alloc(block)?;
        let _serial = self.registry_lock.lock();
        let mut cur = cell.load();
        if cur.is_empty() {
            if cell.compare_exchange(MetaRef::Empty, MetaRef::Block(idx)).is_ok() {
                return Ok(idx);
            }
            cur = cell.load();
        }
        while let MetaRef::Sync(i) = cur {
            let Some(var) = self.syncs.get(i) else { break };
            let next = var.next();
            if next.is_empty() {
                var.set_next(MetaRef::Block(idx));
                return Ok(idx);
            }
            cur = next;
        }
        // The cell ends in another block: replace it.
        if let MetaRef::Block(stale) = cur {
            self.blocks.free(stale);
        }
        self.replace_tail_block(&cell, MetaRef::Block(idx));
        Ok(idx)
    }

    fn replace_tail_block(&self, cell: &MetaCell, block: MetaRef) {
        let head = cell.load();
        if !matches!(head, MetaRef::Sync(_)) {
            cell.store(block);
            return;
        }
        let mut cur = head;
        while let MetaRef::Sync(i) = cur {
            let Some(var) = self.syncs.get(i) else { return };
            let next = var.next();
            if !matches!(next, MetaRef::Sync(_)) {
                var.set_next(block);
                return;
            }
            cur = next;
        }
    }

    /// The block recorded at exactly `addr`.
    #[must_use]
    pub fn find_block(&self, addr: usize) -> Option<(u32, MBlock)> {
        let cell = self.meta.existing_cell(addr)?;
        let mut cur = cell.load();
        loop {
            match cur {
                MetaRef::Sync(i) => cur = self.syncs.get(i)?.next(),
                MetaRef::Block(i) => return self.blocks.get(i).map(|b| (i, b)),
                MetaRef::Empty => return None,
            }
        }
    }

    /// Tear down every sync object and block referenced from the meta
    /// cells of `[addr, addr + size)`. Returns true if anything was found.
    pub fn free_range(&self, addr: usize, size: usize) -> bool {
        if size == 0 || !is_app_mem(addr) {
            return false;
        }
        let end = addr.saturating_add(size).min(APP_MEM_END);
        let pages = self
            .meta
            .resident_pages_in(addr / PAGE_SIZE, (end - 1) / PAGE_SIZE + 1);
        let mut found = false;
        for page in pages {
            let lo = addr.max(page * PAGE_SIZE);
            let hi = end.min((page + 1) * PAGE_SIZE);
            let mut g = granule_base(lo);
            while g < hi {
                if let Some(cell) = self.meta.existing_cell(g) {
                    found |= self.free_cell(&cell);
                }
                g += GRANULE;
            }
        }
        found
    }

    fn free_cell(&self, cell: &MetaCell) -> bool {
        if cell.load().is_empty() {
            return false;
        }
        let _serial = self.registry_lock.lock();
        let mut cur = cell.swap(MetaRef::Empty);
        let found = !cur.is_empty();
        loop {
            match cur {
                MetaRef::Sync(idx) => {
                    let Some(var) = self.syncs.get(idx) else { break };
                    cur = var.next();
                    // Wait out any thread still inside the object.
                    drop(var.state.write());
                    self.syncs.release(idx, &var);
                    DetectorMetrics::inc(&self.metrics.sync_freed);
                }
                MetaRef::Block(idx) => {
                    if self.blocks.free(idx).is_some() {
                        DetectorMetrics::inc(&self.metrics.blocks_freed);
                    }
                    break;
                }
                MetaRef::Empty => break,
            }
        }
        found
    }

    /// Best-effort reset for huge ranges.
    ///
    /// Probes whole pages forward from the start and backward from the end,
    /// each direction stopping at the first page with no metadata once enough
    /// bytes have been probed, then drops the untouched interior pages in
    /// bulk. Metadata in the interior that the probes did not reach is
    /// discarded without being returned to the arena.
    pub fn reset_range(&self, addr: usize, size: usize) {
        if size == 0 || !is_app_mem(addr) {
            return;
        }
        let size = size.min(APP_MEM_END - addr);
        if size <= EXACT_RESET_PAGES * PAGE_SIZE {
            self.free_range(addr, size);
            return;
        }
        let mut p = addr;
        let mut sz = size;
        let head = p.next_multiple_of(PAGE_SIZE) - p;
        if head != 0 {
            self.free_range(p, head);
            p += head;
            sz -= head;
        }
        let tail = (p + sz) % PAGE_SIZE;
        if tail != 0 {
            self.free_range(p + sz - tail, tail);
            sz -= tail;
        }

        let mut checked = 0;
        while sz > 0 {
            let has_meta = self.free_range(p, PAGE_SIZE);
            DetectorMetrics::inc(&self.metrics.pages_probed);
            p += PAGE_SIZE;
            sz -= PAGE_SIZE;
            checked += PAGE_SIZE;
            if !has_meta && checked > FORWARD_PROBE_BYTES {
                break;
            }
        }
        checked = 0;
        while sz > 0 {
            let has_meta = self.free_range(p + sz - PAGE_SIZE, PAGE_SIZE);
            DetectorMetrics::inc(&self.metrics.pages_probed);
            sz -= PAGE_SIZE;
            checked += PAGE_SIZE;
            if !has_meta && checked > BACKWARD_PROBE_BYTES {
                break;
            }
        }
        if sz > 0 {
            let forgotten = self.blocks.forget_range(p, p + sz);
            DetectorMetrics::add(&self.metrics.blocks_freed, forgotten as u64);
            self.meta
                .blank_pages(p / PAGE_SIZE, (p + sz) / PAGE_SIZE);
            tracing::debug!(
                target: "frankenrace::sync",
                addr = p,
                size = sz,
                "blanked interior of huge range"
            );
        }
    }

    /// Carry meta state of `[src, src + size)` over to `dst`, rebasing every
    /// sync object address and block by `dst - src`. All three arguments
    /// must be multiples of the granule size.
    ///
    /// Cells are moved in the direction that never overwrites a source cell
    /// before it has been read.
    pub fn move_memory(&self, src: usize, dst: usize, size: usize) -> Result<(), DetectorError> {
        if size == 0 || src == dst {
            return Ok(());
        }
        for (addr, len) in [(src, size), (dst, size)] {
            if addr.checked_add(len).is_none_or(|end| end > APP_MEM_END) {
                return Err(DetectorError::AddressOutOfRange { addr });
            }
        }
        if src % GRANULE != 0 || dst % GRANULE != 0 || size % GRANULE != 0 {
            return Err(DetectorError::UnalignedMove { src, dst, size });
        }
        let granules = size / GRANULE;
        let shift = |a: usize| a.wrapping_add(dst.wrapping_sub(src));
        let _serial = self.registry_lock.lock();
        let step = |i: usize| -> Result<(), DetectorError> {
            let from = src + i * GRANULE;
            let Some(src_cell) = self.meta.existing_cell(from) else {
                return Ok(());
            };
            let head = src_cell.swap(MetaRef::Empty);
            if head.is_empty() {
                return Ok(());
            }
            let to = dst + i * GRANULE;
            let mut cur = head;
            loop {
                match cur {
                    MetaRef::Sync(idx) => {
                        let Some(var) = self.syncs.get(idx) else { break };
                        var.addr.store(shift(var.addr()), Ordering::Release);
                        cur = var.next();
                    }
                    MetaRef::Block(idx) => {
                        if let Some(block) = self.blocks.get(idx) {
                            self.blocks.rebase(idx, shift(block.addr));
                        }
                        break;
                    }
                    MetaRef::Empty => break,
                }
            }
            self.meta.cell(to)?.store(head);
            Ok(())
        };
        if dst < src {
            for i in 0..granules {
                step(i)?;
            }
        } else {
            for i in (0..granules).rev() {
                step(i)?;
            }
        }
        Ok(())
    }
}
