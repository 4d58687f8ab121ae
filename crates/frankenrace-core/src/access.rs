//! The access checker.
//!
//! A byte range is split into granules: an unaligned leading part, whole
//! middle granules and an unaligned trailing part. Partial granules are
//! further split into naturally aligned power-of-two chunks so every piece
//! fits one shadow record. Each granule costs one epoch tick; each chunk is
//! compared against the granule's stored records and then stored itself.

use crate::config::HISTORY_SIZE;
use crate::error::DetectorError;
use crate::shadow::{GRANULE, GranuleCells, ShadowMemory, ShadowRecord, granule_base};
use crate::thread::ThreadState;

/// A conflicting pair found while recording an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RaceHit {
    pub addr: usize,
    pub current: ShadowRecord,
    pub previous: ShadowRecord,
}

/// Naturally aligned power-of-two chunks covering `len` bytes at `offset`
/// inside one granule, as `(offset, size_log)`.
pub(crate) fn chunks(mut offset: usize, mut len: usize) -> impl Iterator<Item = (usize, u32)> {
    std::iter::from_fn(move || {
        if len == 0 {
            return None;
        }
        let mut size = GRANULE;
        while size > len || offset % size != 0 {
            size >>= 1;
        }
        let chunk = (offset, size.trailing_zeros());
        offset += size;
        len -= size;
        Some(chunk)
    })
}

/// `new` may take over `old`'s slot: a write beats a read and a plain
/// access beats an atomic one.
#[inline]
fn at_least_as_strong(new: ShadowRecord, old: ShadowRecord) -> bool {
    (new.is_write() || !old.is_write()) && (!new.is_atomic() || old.is_atomic())
}

/// Compare `cur` with the stored records of one granule and store it.
///
/// Returns the first stored record that races with `cur`. Slot choice, in
/// order: the caller's own record for the same bytes, an empty slot, a
/// record for the same bytes that the caller already happens-after, and
/// finally a slot picked by epoch.
pub(crate) fn check_and_store(
    cells: &GranuleCells,
    cur: ShadowRecord,
    thr: &ThreadState,
) -> Option<ShadowRecord> {
    let mut race = None;
    let mut own = None;
    let mut empty = None;
    let mut dominated = None;
    for slot in 0..HISTORY_SIZE {
        let old = cells.load(slot);
        if old.is_empty() {
            empty.get_or_insert(slot);
            continue;
        }
        if !old.overlaps(cur) {
            continue;
        }
        let replaceable = old.same_range(cur) && at_least_as_strong(cur, old);
        if thr.is_own(old) {
            if replaceable {
                own.get_or_insert(slot);
            }
            continue;
        }
        if thr.happens_after(old) {
            if replaceable {
                dominated.get_or_insert(slot);
            }
            continue;
        }
        if !old.is_write() && !cur.is_write() {
            continue;
        }
        if old.is_atomic() && cur.is_atomic() {
            continue;
        }
        race.get_or_insert(old);
    }
    let slot = own
        .or(empty)
        .or(dominated)
        .unwrap_or((cur.epoch() % HISTORY_SIZE as u64) as usize);
    cells.store(slot, cur);
    race
}

/// Check and record `[addr, addr + size)`. Races are appended to `hits`.
///
/// Returns the number of granules visited.
pub(crate) fn access_range(
    shadow: &ShadowMemory,
    thr: &mut ThreadState,
    addr: usize,
    size: usize,
    is_write: bool,
    is_atomic: bool,
    hits: &mut Vec<RaceHit>,
) -> Result<u64, DetectorError> {
    let end = addr
        .checked_add(size)
        .ok_or(DetectorError::AddressOutOfRange { addr })?;
    let mut granules = 0;
    let mut a = addr;
    while a < end {
        let g = granule_base(a);
        let g_end = (g + GRANULE).min(end);
        let cells = shadow.granule(g)?;
        let epoch = thr.tick()?;
        for (offset, size_log) in chunks(a - g, g_end - a) {
            let cur = ShadowRecord::new(thr.tid(), epoch, offset, size_log, is_write, is_atomic);
            if let Some(previous) = check_and_store(&cells, cur, thr) {
                hits.push(RaceHit {
                    addr: g + offset,
                    current: cur,
                    previous,
                });
            }
        }
        granules += 1;
        a = g_end;
    }
    Ok(granules)
}

/// Mark `[addr, addr + size)` as freshly written by `thr` without checking.
///
/// Prior records are wiped; each granule gets a single whole-granule write
/// record at one new epoch.
pub(crate) fn imitate_write(
    shadow: &ShadowMemory,
    thr: &mut ThreadState,
    addr: usize,
    size: usize,
) -> Result<(), DetectorError> {
    if size == 0 {
        return Ok(());
    }
    shadow.reset_range(addr, size);
    let epoch = thr.tick()?;
    let rec = ShadowRecord::new(thr.tid(), epoch, 0, 3, true, false);
    let end = addr
        .checked_add(size)
        .ok_or(DetectorError::AddressOutOfRange { addr })?;
    let mut g = granule_base(addr);
    while g < end {
        shadow.granule(g)?.store(0, rec);
        g += GRANULE;
    }
    Ok(())
}
