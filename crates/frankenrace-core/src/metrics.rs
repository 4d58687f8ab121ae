//! Atomic counters for detector statistics.
//!
//! All counters use relaxed ordering; they are diagnostic, never used for
//! synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Detector operation counters.
pub struct DetectorMetrics {
    /// `RecordAccess` calls that reached the checker.
    pub accesses: AtomicU64,
    /// Granules compared against existing records.
    pub granules_checked: AtomicU64,
    /// Races handed to the report sink.
    pub races_reported: AtomicU64,
    /// Misuse diagnostics handed to the report sink.
    pub diagnostics: AtomicU64,
    pub sync_created: AtomicU64,
    /// Arena slots recycled from the free list.
    pub sync_reused: AtomicU64,
    pub sync_freed: AtomicU64,
    /// Failed meta-cell compare-and-swap attempts.
    pub cas_retries: AtomicU64,
    /// Insertions that exhausted the retry bound and took the registry lock.
    pub cas_fallbacks: AtomicU64,
    /// Speculative sync objects discarded after losing an insertion race.
    pub speculative_discards: AtomicU64,
    pub threads_created: AtomicU64,
    /// Creations that recycled a quarantined context.
    pub threads_reused: AtomicU64,
    /// Largest quarantine length observed.
    pub quarantine_high_water: AtomicU64,
    pub blocks_allocated: AtomicU64,
    pub blocks_freed: AtomicU64,
    /// Pages inspected by best-effort range resets.
    pub pages_probed: AtomicU64,
    /// Notifications deferred because the target was blocking or remote.
    pub notifications_queued: AtomicU64,
    pub notifications_processed: AtomicU64,
}

impl DetectorMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            accesses: AtomicU64::new(0),
            granules_checked: AtomicU64::new(0),
            races_reported: AtomicU64::new(0),
            diagnostics: AtomicU64::new(0),
            sync_created: AtomicU64::new(0),
            sync_reused: AtomicU64::new(0),
            sync_freed: AtomicU64::new(0),
            cas_retries: AtomicU64::new(0),
            cas_fallbacks: AtomicU64::new(0),
            speculative_discards: AtomicU64::new(0),
            threads_created: AtomicU64::new(0),
            threads_reused: AtomicU64::new(0),
            quarantine_high_water: AtomicU64::new(0),
            blocks_allocated: AtomicU64::new(0),
            blocks_freed: AtomicU64::new(0),
            pages_probed: AtomicU64::new(0),
            notifications_queued: AtomicU64::new(0),
            notifications_processed: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Raise a high-water mark to at least `value`.
    pub fn raise(counter: &AtomicU64, value: u64) {
        counter.fetch_max(value, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Snapshot all counters. `shadow_pages_resident` is sampled by the caller.
    #[must_use]
    pub fn snapshot(&self, shadow_pages_resident: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            accesses: Self::get(&self.accesses),
            granules_checked: Self::get(&self.granules_checked),
            races_reported: Self::get(&self.races_reported),
            diagnostics: Self::get(&self.diagnostics),
            sync_created: Self::get(&self.sync_created),
            sync_reused: Self::get(&self.sync_reused),
            sync_freed: Self::get(&self.sync_freed),
            cas_retries: Self::get(&self.cas_retries),
            cas_fallbacks: Self::get(&self.cas_fallbacks),
            speculative_discards: Self::get(&self.speculative_discards),
            threads_created: Self::get(&self.threads_created),
            threads_reused: Self::get(&self.threads_reused),
            quarantine_high_water: Self::get(&self.quarantine_high_water),
            blocks_allocated: Self::get(&self.blocks_allocated),
            blocks_freed: Self::get(&self.blocks_freed),
            pages_probed: Self::get(&self.pages_probed),
            notifications_queued: Self::get(&self.notifications_queued),
            notifications_processed: Self::get(&self.notifications_processed),
            shadow_pages_resident,
        }
    }
}

impl Default for DetectorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all detector counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub accesses: u64,
    pub granules_checked: u64,
    pub races_reported: u64,
    pub diagnostics: u64,
    pub sync_created: u64,
    pub sync_reused: u64,
    pub sync_freed: u64,
    pub cas_retries: u64,
    pub cas_fallbacks: u64,
    pub speculative_discards: u64,
    pub threads_created: u64,
    pub threads_reused: u64,
    pub quarantine_high_water: u64,
    pub blocks_allocated: u64,
    pub blocks_freed: u64,
    pub pages_probed: u64,
    pub notifications_queued: u64,
    pub notifications_processed: u64,
    pub shadow_pages_resident: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = DetectorMetrics::new();
        let snap = m.snapshot(0);
        assert_eq!(snap.accesses, 0);
        assert_eq!(snap.races_reported, 0);
    }

    #[test]
    fn increment_and_high_water() {
        let m = DetectorMetrics::new();
        DetectorMetrics::inc(&m.accesses);
        DetectorMetrics::inc(&m.accesses);
        DetectorMetrics::add(&m.pages_probed, 5);
        DetectorMetrics::raise(&m.quarantine_high_water, 7);
        DetectorMetrics::raise(&m.quarantine_high_water, 3);
        let snap = m.snapshot(2);
        assert_eq!(snap.accesses, 2);
        assert_eq!(snap.pages_probed, 5);
        assert_eq!(snap.quarantine_high_water, 7);
        assert_eq!(snap.shadow_pages_resident, 2);
    }

    #[test]
    fn snapshot_serializes_flat() {
        let m = DetectorMetrics::new();
        DetectorMetrics::inc(&m.cas_fallbacks);
        let json = serde_json::to_value(m.snapshot(0)).expect("serialize");
        assert_eq!(json["cas_fallbacks"], 1);
        assert_eq!(json["threads_reused"], 0);
    }
}
