//! Shadow and meta shadow memory.
//!
//! Application memory is split into 8-byte granules. Each granule owns
//! [`HISTORY_SIZE`] access records in shadow memory and one tagged `u32` in
//! meta shadow memory. Both locations are fixed arithmetic functions of the
//! application address ([`mem_to_shadow`], [`mem_to_meta`]); the backing
//! store is a sparse table of lazily materialized pages keyed by the page
//! number of that computed address, so untouched memory costs nothing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::config::HISTORY_SIZE;
use crate::error::DetectorError;
use crate::vector_clock::{EPOCH_BITS, Epoch, MAX_EPOCH, TID_BITS, Tid};

const _: () = assert!(usize::BITS == 64, "shadow layout assumes a 64-bit address space");

/// Bytes of application memory per granule.
pub const GRANULE: usize = 8;
const GRANULE_SHIFT: u32 = 3;

/// Application page size used for shadow paging and range reset probing.
pub const PAGE_SIZE: usize = 4096;

/// First address past the supported application range.
pub const APP_MEM_END: usize = 1 << 47;

/// Base of the shadow range.
pub const SHADOW_BEG: usize = 1 << 48;
/// Shadow bytes per application byte.
pub const SHADOW_MULTIPLIER: usize = HISTORY_SIZE * 8 / GRANULE;
/// Base of the meta shadow range.
pub const META_BEG: usize = 1 << 51;
/// Meta shadow bytes per application byte.
const META_RATIO: usize = GRANULE / 4;

const SHADOW_PAGE_BYTES: usize = PAGE_SIZE * SHADOW_MULTIPLIER;
const SHADOW_PAGE_CELLS: usize = SHADOW_PAGE_BYTES / 8;
const META_PAGE_BYTES: usize = PAGE_SIZE / META_RATIO;
const META_PAGE_CELLS: usize = META_PAGE_BYTES / 4;

/// Largest arena index a meta cell can carry.
pub const MAX_META_INDEX: usize = (1 << 30) - 1;

/// Shadow address of the first record of `addr`'s granule.
#[inline]
#[must_use]
pub const fn mem_to_shadow(addr: usize) -> usize {
    SHADOW_BEG + (addr & !(GRANULE - 1)) * SHADOW_MULTIPLIER
}

/// Application address of the granule a shadow address belongs to.
#[inline]
#[must_use]
pub const fn shadow_to_mem(shadow: usize) -> usize {
    (shadow - SHADOW_BEG) / SHADOW_MULTIPLIER & !(GRANULE - 1)
}

/// Meta shadow address of `addr`'s granule.
#[inline]
#[must_use]
pub const fn mem_to_meta(addr: usize) -> usize {
    META_BEG + (addr >> GRANULE_SHIFT) * 4
}

#[inline]
#[must_use]
pub const fn is_app_mem(addr: usize) -> bool {
    addr < APP_MEM_END
}

#[inline]
#[must_use]
pub const fn granule_base(addr: usize) -> usize {
    addr & !(GRANULE - 1)
}

fn check_range(addr: usize, size: usize) -> Result<(), DetectorError> {
    match addr.checked_add(size) {
        Some(end) if end <= APP_MEM_END => Ok(()),
        _ => Err(DetectorError::AddressOutOfRange { addr }),
    }
}

// ---------------------------------------------------------------------------
// Access records
// ---------------------------------------------------------------------------

const TID_SHIFT: u32 = EPOCH_BITS;
const OFFSET_SHIFT: u32 = TID_SHIFT + TID_BITS;
const SIZE_LOG_SHIFT: u32 = OFFSET_SHIFT + 3;
const WRITE_BIT: u64 = 1 << (SIZE_LOG_SHIFT + 2);
const ATOMIC_BIT: u64 = WRITE_BIT << 1;

/// One packed access record: `{tid, epoch, offset, size_log, is_write, is_atomic}`.
///
/// The all-zero value is the empty record; recorded epochs start at 1.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ShadowRecord(u64);

impl ShadowRecord {
    pub const EMPTY: Self = Self(0);

    /// Pack a record. `offset + (1 << size_log)` must not exceed [`GRANULE`].
    #[must_use]
    pub fn new(
        tid: Tid,
        epoch: Epoch,
        offset: usize,
        size_log: u32,
        is_write: bool,
        is_atomic: bool,
    ) -> Self {
        debug_assert!(size_log <= 3 && offset + (1usize << size_log) <= GRANULE);
        debug_assert!(tid.index() < (1 << TID_BITS));
        let mut raw = (epoch & MAX_EPOCH)
            | (u64::from(tid.0) << TID_SHIFT)
            | ((offset as u64) << OFFSET_SHIFT)
            | (u64::from(size_log) << SIZE_LOG_SHIFT);
        if is_write {
            raw |= WRITE_BIT;
        }
        if is_atomic {
            raw |= ATOMIC_BIT;
        }
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn epoch(self) -> Epoch {
        self.0 & MAX_EPOCH
    }

    #[inline]
    #[must_use]
    pub const fn tid(self) -> Tid {
        Tid(((self.0 >> TID_SHIFT) & ((1 << TID_BITS) - 1)) as u32)
    }

    #[inline]
    #[must_use]
    pub const fn offset(self) -> usize {
        ((self.0 >> OFFSET_SHIFT) & 0b111) as usize
    }

    #[inline]
    #[must_use]
    pub const fn size_log(self) -> u32 {
        ((self.0 >> SIZE_LOG_SHIFT) & 0b11) as u32
    }

    #[inline]
    #[must_use]
    pub const fn size(self) -> usize {
        1 << self.size_log()
    }

    #[inline]
    #[must_use]
    pub const fn is_write(self) -> bool {
        self.0 & WRITE_BIT != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_atomic(self) -> bool {
        self.0 & ATOMIC_BIT != 0
    }

    /// Byte ranges of the two records intersect within the granule.
    #[inline]
    #[must_use]
    pub const fn overlaps(self, other: Self) -> bool {
        self.offset() < other.offset() + other.size()
            && other.offset() < self.offset() + self.size()
    }

    #[inline]
    #[must_use]
    pub const fn same_range(self, other: Self) -> bool {
        self.offset() == other.offset() && self.size_log() == other.size_log()
    }
}

impl std::fmt::Debug for ShadowRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return f.write_str("ShadowRecord(empty)");
        }
        f.debug_struct("ShadowRecord")
            .field("tid", &self.tid().0)
            .field("epoch", &self.epoch())
            .field("offset", &self.offset())
            .field("size", &self.size())
            .field("is_write", &self.is_write())
            .field("is_atomic", &self.is_atomic())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Shadow pages
// ---------------------------------------------------------------------------

struct ShadowPage {
    cells: Box<[AtomicU64]>,
}

impl ShadowPage {
    fn new() -> Self {
        Self {
            cells: (0..SHADOW_PAGE_CELLS).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

/// The [`HISTORY_SIZE`] record slots of one granule.
pub struct GranuleCells {
    page: Arc<ShadowPage>,
    first: usize,
}

impl GranuleCells {
    #[inline]
    #[must_use]
    pub fn load(&self, slot: usize) -> ShadowRecord {
        ShadowRecord(self.page.cells[self.first + slot].load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, slot: usize, rec: ShadowRecord) {
        self.page.cells[self.first + slot].store(rec.0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> [ShadowRecord; HISTORY_SIZE] {
        std::array::from_fn(|i| self.load(i))
    }
}

/// Sparse shadow memory holding access records.
pub struct ShadowMemory {
    pages: RwLock<BTreeMap<usize, Arc<ShadowPage>>>,
}

impl ShadowMemory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pages: RwLock::new(BTreeMap::new()),
        }
    }

    fn locate(addr: usize) -> (usize, usize) {
        let off = mem_to_shadow(addr) - SHADOW_BEG;
        (off / SHADOW_PAGE_BYTES, (off % SHADOW_PAGE_BYTES) / 8)
    }

    /// Record slots of the granule holding `addr`, materializing its page.
    pub fn granule(&self, addr: usize) -> Result<GranuleCells, DetectorError> {
        check_range(addr, 1)?;
        let (page_no, first) = Self::locate(addr);
        if let Some(page) = self.pages.read().get(&page_no) {
            return Ok(GranuleCells {
                page: Arc::clone(page),
                first,
            });
        }
        let mut pages = self.pages.write();
        let page = pages
            .entry(page_no)
            .or_insert_with(|| Arc::new(ShadowPage::new()));
        Ok(GranuleCells {
            page: Arc::clone(page),
            first,
        })
    }

    /// Records of `addr`'s granule without materializing anything.
    #[must_use]
    pub fn peek(&self, addr: usize) -> [ShadowRecord; HISTORY_SIZE] {
        if !is_app_mem(addr) {
            return [ShadowRecord::EMPTY; HISTORY_SIZE];
        }
        let (page_no, first) = Self::locate(addr);
        match self.pages.read().get(&page_no) {
            Some(page) => GranuleCells {
                page: Arc::clone(page),
                first,
            }
            .snapshot(),
            None => [ShadowRecord::EMPTY; HISTORY_SIZE],
        }
    }

    /// Blank every record of every granule touching `[addr, addr + size)`.
    ///
    /// Pages wholly inside the range are dropped; cost is proportional to
    /// resident pages, not to `size`.
    pub fn reset_range(&self, addr: usize, size: usize) {
        if size == 0 || !is_app_mem(addr) {
            return;
        }
        let end = addr.saturating_add(size).min(APP_MEM_END);
        let first_page = addr / PAGE_SIZE;
        let last_page = (end - 1) / PAGE_SIZE;
        let full_lo = addr.div_ceil(PAGE_SIZE);
        let full_hi = end / PAGE_SIZE;

        let mut pages = self.pages.write();
        if full_lo < full_hi {
            let doomed: Vec<usize> = pages.range(full_lo..full_hi).map(|(&k, _)| k).collect();
            for k in doomed {
                pages.remove(&k);
            }
        }
        for page_no in [first_page, last_page] {
            if page_no >= full_lo && page_no < full_hi {
                continue;
            }
            let Some(page) = pages.get(&page_no) else {
                continue;
            };
            let lo = addr.max(page_no * PAGE_SIZE);
            let hi = end.min((page_no + 1) * PAGE_SIZE);
            let mut g = granule_base(lo);
            while g < hi {
                let (_, first) = Self::locate(g);
                for slot in 0..HISTORY_SIZE {
                    page.cells[first + slot].store(0, Ordering::Relaxed);
                }
                g += GRANULE;
            }
        }
    }

    #[must_use]
    pub fn resident_pages(&self) -> usize {
        self.pages.read().len()
    }
}

impl Default for ShadowMemory {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Meta shadow
// ---------------------------------------------------------------------------

const TAG_SHIFT: u32 = 30;
const TAG_BLOCK: u32 = 0b01 << TAG_SHIFT;
const TAG_SYNC: u32 = 0b10 << TAG_SHIFT;
const INDEX_MASK: u32 = (1 << TAG_SHIFT) - 1;

/// Decoded meta cell (or chain link) value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MetaRef {
    #[default]
    Empty,
    /// Index into the sync-object arena.
    Sync(u32),
    /// Index into the allocation-block arena.
    Block(u32),
}

impl MetaRef {
    #[inline]
    #[must_use]
    pub const fn encode(self) -> u32 {
        match self {
            Self::Empty => 0,
            Self::Sync(idx) => TAG_SYNC | (idx & INDEX_MASK),
            Self::Block(idx) => TAG_BLOCK | (idx & INDEX_MASK),
        }
    }

    #[inline]
    #[must_use]
    pub const fn decode(raw: u32) -> Self {
        match raw & !INDEX_MASK {
            TAG_SYNC => Self::Sync(raw & INDEX_MASK),
            TAG_BLOCK => Self::Block(raw & INDEX_MASK),
            _ => Self::Empty,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        matches!(self, Self::Empty)
    }
}

struct MetaPage {
    cells: Box<[AtomicU32]>,
}

impl MetaPage {
    fn new() -> Self {
        Self {
            cells: (0..META_PAGE_CELLS).map(|_| AtomicU32::new(0)).collect(),
        }
    }
}

/// Handle to one meta cell.
pub struct MetaCell {
    page: Arc<MetaPage>,
    idx: usize,
}

impl MetaCell {
    #[inline]
    #[must_use]
    pub fn load(&self) -> MetaRef {
        MetaRef::decode(self.page.cells[self.idx].load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, value: MetaRef) {
        self.page.cells[self.idx].store(value.encode(), Ordering::Release);
    }

    #[inline]
    pub fn swap(&self, value: MetaRef) -> MetaRef {
        MetaRef::decode(self.page.cells[self.idx].swap(value.encode(), Ordering::AcqRel))
    }

    /// Single compare-and-swap; returns the value observed on failure.
    #[inline]
    pub fn compare_exchange(&self, current: MetaRef, new: MetaRef) -> Result<(), MetaRef> {
        self.page.cells[self.idx]
            .compare_exchange(
                current.encode(),
                new.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(MetaRef::decode)
    }
}

/// Sparse meta shadow memory: one tagged reference per granule.
pub struct MetaMemory {
    pages: RwLock<BTreeMap<usize, Arc<MetaPage>>>,
}

impl MetaMemory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pages: RwLock::new(BTreeMap::new()),
        }
    }

    fn locate(addr: usize) -> (usize, usize) {
        let off = mem_to_meta(addr) - META_BEG;
        (off / META_PAGE_BYTES, (off % META_PAGE_BYTES) / 4)
    }

    /// Meta cell of `addr`, materializing its page.
    pub fn cell(&self, addr: usize) -> Result<MetaCell, DetectorError> {
        check_range(addr, 1)?;
        let (page_no, idx) = Self::locate(addr);
        if let Some(page) = self.pages.read().get(&page_no) {
            return Ok(MetaCell {
                page: Arc::clone(page),
                idx,
            });
        }
        let mut pages = self.pages.write();
        let page = pages
            .entry(page_no)
            .or_insert_with(|| Arc::new(MetaPage::new()));
        Ok(MetaCell {
            page: Arc::clone(page),
            idx,
        })
    }

    /// Meta cell of `addr` if its page is resident.
    #[must_use]
    pub fn existing_cell(&self, addr: usize) -> Option<MetaCell> {
        if !is_app_mem(addr) {
            return None;
        }
        let (page_no, idx) = Self::locate(addr);
        self.pages.read().get(&page_no).map(|page| MetaCell {
            page: Arc::clone(page),
            idx,
        })
    }

    /// Application page numbers in `[first_app_page, last_app_page)` whose
    /// meta page is resident.
    #[must_use]
    pub fn resident_pages_in(&self, first_app_page: usize, last_app_page: usize) -> Vec<usize> {
        if first_app_page >= last_app_page {
            return Vec::new();
        }
        self.pages
            .read()
            .range(first_app_page..last_app_page)
            .map(|(&k, _)| k)
            .collect()
    }

    /// Drop every resident page covering application pages
    /// `[first_app_page, last_app_page)` without visiting their cells.
    pub fn blank_pages(&self, first_app_page: usize, last_app_page: usize) {
        if first_app_page >= last_app_page {
            return;
        }
        let mut pages = self.pages.write();
        let doomed: Vec<usize> = pages
            .range(first_app_page..last_app_page)
            .map(|(&k, _)| k)
            .collect();
        for k in doomed {
            pages.remove(&k);
        }
    }

    #[must_use]
    pub fn resident_pages(&self) -> usize {
        self.pages.read().len()
    }
}

impl Default for MetaMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_mapping_is_granule_aligned_and_invertible() {
        assert_eq!(mem_to_shadow(0), SHADOW_BEG);
        assert_eq!(mem_to_shadow(7), SHADOW_BEG);
        assert_eq!(mem_to_shadow(8), SHADOW_BEG + 8 * SHADOW_MULTIPLIER);
        for addr in [0x1000_usize, 0x7fff_1234_5678, 0x10] {
            let s = mem_to_shadow(addr);
            assert_eq!(shadow_to_mem(s), granule_base(addr));
            assert_eq!(s % (HISTORY_SIZE * 8), 0, "records of a granule are contiguous");
        }
    }

    #[test]
    fn meta_mapping_has_one_u32_per_granule() {
        assert_eq!(mem_to_meta(0), META_BEG);
        assert_eq!(mem_to_meta(7), META_BEG);
        assert_eq!(mem_to_meta(8), META_BEG + 4);
        assert_eq!(mem_to_meta(APP_MEM_END - 1) - META_BEG, (APP_MEM_END / 8 - 1) * 4);
        assert!(mem_to_shadow(APP_MEM_END - 1) < META_BEG, "ranges do not overlap");
    }

    #[test]
    fn record_packs_every_field() {
        let r = ShadowRecord::new(Tid(8191), MAX_EPOCH, 4, 2, true, false);
        assert_eq!(r.tid(), Tid(8191));
        assert_eq!(r.epoch(), MAX_EPOCH);
        assert_eq!(r.offset(), 4);
        assert_eq!(r.size(), 4);
        assert!(r.is_write());
        assert!(!r.is_atomic());
        assert!(!r.is_empty());

        let a = ShadowRecord::new(Tid(0), 1, 0, 0, false, true);
        assert!(a.is_atomic() && !a.is_write());
        assert_eq!(a.tid(), Tid(0));
    }

    #[test]
    fn overlap_is_by_byte_range() {
        let lo = ShadowRecord::new(Tid(1), 1, 0, 2, true, false); // bytes 0..4
        let hi = ShadowRecord::new(Tid(2), 1, 4, 2, true, false); // bytes 4..8
        let mid = ShadowRecord::new(Tid(3), 1, 2, 1, true, false); // bytes 2..4
        let whole = ShadowRecord::new(Tid(4), 1, 0, 3, false, false);
        assert!(!lo.overlaps(hi));
        assert!(lo.overlaps(mid));
        assert!(!mid.overlaps(hi));
        assert!(whole.overlaps(lo) && whole.overlaps(hi));
    }

    #[test]
    fn meta_ref_round_trips_tags() {
        for r in [MetaRef::Empty, MetaRef::Sync(0), MetaRef::Sync(77), MetaRef::Block(5)] {
            assert_eq!(MetaRef::decode(r.encode()), r);
        }
        assert_ne!(MetaRef::Sync(0).encode(), 0, "index 0 is distinguishable from empty");
    }

    #[test]
    fn granules_materialize_lazily() {
        let shadow = ShadowMemory::new();
        assert_eq!(shadow.peek(0x4000), [ShadowRecord::EMPTY; HISTORY_SIZE]);
        assert_eq!(shadow.resident_pages(), 0);

        let cells = shadow.granule(0x4008).unwrap();
        let rec = ShadowRecord::new(Tid(1), 3, 0, 3, true, false);
        cells.store(2, rec);
        assert_eq!(shadow.resident_pages(), 1);
        assert_eq!(shadow.peek(0x400c)[2], rec);
        assert_eq!(shadow.peek(0x4010)[2], ShadowRecord::EMPTY);
    }

    #[test]
    fn out_of_range_granule_is_an_error() {
        let shadow = ShadowMemory::new();
        assert!(matches!(
            shadow.granule(APP_MEM_END),
            Err(DetectorError::AddressOutOfRange { .. })
        ));
    }

    #[test]
    fn reset_range_clears_partial_pages_and_drops_full_ones() {
        let shadow = ShadowMemory::new();
        let rec = ShadowRecord::new(Tid(1), 1, 0, 3, true, false);
        for addr in [0x1ff8, 0x2000, 0x2ff8, 0x3000, 0x3008] {
            shadow.granule(addr).unwrap().store(0, rec);
        }
        assert_eq!(shadow.resident_pages(), 3);

        shadow.reset_range(0x1ff8, 0x3008 - 0x1ff8);
        assert_eq!(shadow.peek(0x1ff8)[0], ShadowRecord::EMPTY);
        assert_eq!(shadow.peek(0x2000)[0], ShadowRecord::EMPTY);
        assert_eq!(shadow.peek(0x3000)[0], ShadowRecord::EMPTY);
        assert_eq!(shadow.peek(0x3008)[0], rec, "first byte past the range survives");
        assert_eq!(shadow.resident_pages(), 2, "the fully covered page was dropped");
    }

    #[test]
    fn meta_cell_compare_exchange_reports_current() {
        let meta = MetaMemory::new();
        let cell = meta.cell(0x1000).unwrap();
        assert_eq!(cell.load(), MetaRef::Empty);
        assert!(cell.compare_exchange(MetaRef::Empty, MetaRef::Sync(3)).is_ok());
        assert_eq!(
            cell.compare_exchange(MetaRef::Empty, MetaRef::Sync(4)),
            Err(MetaRef::Sync(3))
        );
        assert!(meta.existing_cell(0x1004).is_some());
        assert!(meta.existing_cell(0x9000).is_none());
    }
}
