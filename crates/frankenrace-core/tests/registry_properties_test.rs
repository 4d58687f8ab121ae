use frankenrace_core::metrics::DetectorMetrics;
use frankenrace_core::sync::SyncRegistry;
use frankenrace_core::{
    CollectingSink, Detector, DetectorConfig, StackId, ThreadStatus, Tid,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Barrier};
use std::thread;

fn detector(config: DetectorConfig) -> (Detector, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::new());
    (Detector::new(config, sink.clone()), sink)
}

// ---------------------------------------------------------------------------
// Sync object identity
// ---------------------------------------------------------------------------

fn concurrent_get_or_create(cas_retry_limit: usize) -> (SyncRegistry, Arc<DetectorMetrics>) {
    const WORKERS: usize = 8;
    const ADDRS: usize = 64;

    let metrics = Arc::new(DetectorMetrics::new());
    let registry = SyncRegistry::new(1 << 12, 1 << 12, cas_retry_limit, Arc::clone(&metrics));
    let barrier = Barrier::new(WORKERS);
    let seen: Vec<HashMap<usize, u64>> = thread::scope(|s| {
        let handles: Vec<_> = (0..WORKERS)
            .map(|w| {
                let registry = &registry;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    let mut uids = HashMap::new();
                    // Workers walk the addresses in different orders.
                    for i in 0..ADDRS {
                        let addr = 0x5_0000 + ((i * 7 + w * 13) % ADDRS) * 8;
                        let uid = registry
                            .get_or_create_and_lock(addr, StackId::NONE, |s| s.uid)
                            .expect("get_or_create");
                        uids.insert(addr, uid);
                    }
                    uids
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect()
    });

    for addr in seen[0].keys() {
        let uids: HashSet<u64> = seen.iter().map(|m| m[addr]).collect();
        assert_eq!(uids.len(), 1, "addr={addr:#x} observed uids {uids:?}");
    }
    assert_eq!(registry.live_syncs(), ADDRS, "speculative objects are returned");
    (registry, metrics)
}

#[test]
fn concurrent_get_or_create_yields_one_object_per_address() {
    let (_, metrics) = concurrent_get_or_create(64);
    let snapshot = metrics.snapshot(0);
    assert_eq!(snapshot.sync_created, 64);
}

#[test]
fn contended_insertion_falls_back_without_duplicates() {
    let (registry, metrics) = concurrent_get_or_create(1);
    let snapshot = metrics.snapshot(0);
    assert_eq!(snapshot.sync_created, 64);
    let uid = registry
        .get_or_create_and_lock(0x5_0000, StackId::NONE, |s| s.uid)
        .expect("lookup");
    assert_eq!(
        registry.with_existing(0x5_0000, |s| s.uid),
        Some(uid),
        "a later lookup sees the same object"
    );
}

#[test]
fn one_cell_contention_stays_within_the_locked_bound() {
    const WORKERS: usize = 8;
    let metrics = Arc::new(DetectorMetrics::new());
    let registry = SyncRegistry::new(1 << 12, 1 << 12, 1, Arc::clone(&metrics));
    let barrier = Barrier::new(WORKERS);
    // Every worker creates a distinct byte of the same granule.
    thread::scope(|s| {
        for w in 0..WORKERS {
            let registry = &registry;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                for round in 0..32 {
                    let addr = 0x7_0000 + round * 8 + w;
                    registry
                        .get_or_create_and_lock(addr, StackId::NONE, |_| ())
                        .expect("insert completes");
                }
            });
        }
    });
    assert_eq!(registry.live_syncs(), WORKERS * 32);
    assert_eq!(metrics.snapshot(0).sync_created, (WORKERS * 32) as u64);
}

// ---------------------------------------------------------------------------
// Thread identifiers
// ---------------------------------------------------------------------------

#[test]
fn live_threads_never_share_a_tid() {
    const PARENTS: usize = 4;
    const CHILDREN: usize = 8;

    let (det, _) = detector(DetectorConfig::default());
    let mut main = det.main_thread(1);
    let parents: Vec<Tid> = (0..PARENTS)
        .map(|_| det.on_thread_create(&mut main, false))
        .collect();

    let created: Vec<Vec<(Tid, u64)>> = thread::scope(|s| {
        let handles: Vec<_> = parents
            .iter()
            .enumerate()
            .map(|(i, &tid)| {
                let det = &det;
                s.spawn(move || {
                    let mut thr = det.on_thread_start(tid, 100 + i as u64);
                    (0..CHILDREN)
                        .map(|_| {
                            let child = det.on_thread_create(&mut thr, false);
                            let unique = det.thread_info(child).expect("info").unique_id;
                            (child, unique)
                        })
                        .collect()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("parent panicked"))
            .collect()
    });

    let mut tids: HashSet<Tid> = parents.iter().copied().collect();
    tids.insert(Tid::MAIN);
    let mut uniques = HashSet::new();
    for (tid, unique) in created.into_iter().flatten() {
        assert!(tids.insert(tid), "tid {tid} handed out twice while live");
        assert!(uniques.insert(unique), "unique id {unique} repeated");
    }
    assert_eq!(tids.len(), 1 + PARENTS + PARENTS * CHILDREN);
    let live = det
        .threads_snapshot()
        .into_iter()
        .filter(|t| !matches!(t.status, ThreadStatus::Dead | ThreadStatus::Invalid))
        .count();
    assert_eq!(live, tids.len());
}

#[test]
fn oldest_quarantined_tid_is_reused_once_the_cap_is_exceeded() {
    const QUARANTINE: usize = 2;

    let (det, _) = detector(DetectorConfig {
        thread_quarantine_size: QUARANTINE,
        ..DetectorConfig::default()
    });
    let mut main = det.main_thread(1);
    let mut retired = Vec::new();
    for i in 0..=QUARANTINE {
        let tid = det.on_thread_create(&mut main, true);
        let mut thr = det.on_thread_start(tid, 10 + i as u64);
        det.record_access(&mut thr, 0x6_0000 + i * 8, 8, true);
        det.on_thread_finish(&mut thr);
        assert_eq!(det.thread_status(tid), ThreadStatus::Dead);
        retired.push((tid, det.thread_info(tid).expect("info").epoch1));
    }
    assert_eq!(det.quarantine_len(), QUARANTINE + 1);

    let reused = det.on_thread_create(&mut main, false);
    let (oldest, old_epoch1) = retired[0];
    assert_eq!(reused, oldest, "the oldest quarantined tid comes back first");
    let info = det.thread_info(reused).expect("info");
    assert_eq!(info.reuse_count, 1);
    assert_eq!(info.epoch0, old_epoch1 + 1);
    assert_eq!(info.status, ThreadStatus::Created);

    let thr = det.on_thread_start(reused, 99);
    assert_eq!(
        thr.clock().get(reused),
        info.epoch0,
        "the new occupant starts past every epoch of the old one"
    );
    assert_eq!(det.metrics().threads_reused, 1);
}

#[test]
fn exhausted_tid_space_takes_from_quarantine_below_the_cap() {
    let (det, _) = detector(DetectorConfig {
        max_threads: 2,
        thread_quarantine_size: 16,
        ..DetectorConfig::default()
    });
    let mut main = det.main_thread(1);
    let first = det.on_thread_create(&mut main, false);
    let mut thr = det.on_thread_start(first, 2);
    det.on_thread_finish(&mut thr);
    det.on_thread_join(&mut main, first);
    assert_eq!(det.quarantine_len(), 1);

    let second = det.on_thread_create(&mut main, false);
    assert_eq!(second, first);
    assert_eq!(det.quarantine_len(), 0);
}

#[test]
fn records_of_a_previous_occupant_are_a_different_thread() {
    let (det, sink) = detector(DetectorConfig {
        max_threads: 4,
        thread_quarantine_size: 0,
        ..DetectorConfig::default()
    });
    let mut main = det.main_thread(1);

    // Detached: nobody acquires its final clock.
    let tid = det.on_thread_create(&mut main, true);
    let mut old = det.on_thread_start(tid, 2);
    det.record_access(&mut old, 0x7_0000, 8, true);
    det.on_thread_finish(&mut old);

    let again = det.on_thread_create(&mut main, false);
    assert_eq!(again, tid);
    let mut new = det.on_thread_start(again, 3);
    det.record_access(&mut new, 0x7_0000, 8, true);
    let races = sink.take_races();
    assert_eq!(races.len(), 1, "{races:?}");
    assert_eq!(races[0].previous.tid, tid);
    assert!(races[0].previous.retired);
    assert_eq!(races[0].previous.unique_id, 0, "old occupant is gone");
    assert_ne!(races[0].current.unique_id, 0);
}

#[test]
fn joined_previous_occupant_is_ordered_before_the_new_one() {
    let (det, sink) = detector(DetectorConfig {
        max_threads: 4,
        thread_quarantine_size: 0,
        ..DetectorConfig::default()
    });
    let mut main = det.main_thread(1);
    let tid = det.on_thread_create(&mut main, false);
    let mut old = det.on_thread_start(tid, 2);
    det.record_access(&mut old, 0x7_1000, 8, true);
    det.on_thread_finish(&mut old);
    det.on_thread_join(&mut main, tid);

    let again = det.on_thread_create(&mut main, false);
    assert_eq!(again, tid);
    let mut new = det.on_thread_start(again, 3);
    det.record_access(&mut new, 0x7_1000, 8, true);
    assert!(sink.races().is_empty(), "{:?}", sink.races());
}

// ---------------------------------------------------------------------------
// Allocation metadata
// ---------------------------------------------------------------------------

#[test]
fn free_and_realloc_yields_a_fresh_sync_object() {
    const BLOCK: usize = 0x20_0000;
    const MUTEX: usize = BLOCK + 0x10;

    let (det, sink) = detector(DetectorConfig::default());
    let mut main = det.main_thread(1);

    det.on_alloc(&mut main, BLOCK, 64);
    assert_eq!(det.block_size(BLOCK), Some(64));
    det.on_mutex_create(&mut main, MUTEX, false, false);
    let before = det.sync_uid(MUTEX).expect("mutex exists");

    det.on_free(&mut main, BLOCK);
    assert_eq!(det.sync_uid(MUTEX), None, "free tears down objects inside the block");
    assert_eq!(det.block_size(BLOCK), None);

    det.on_alloc(&mut main, BLOCK, 64);
    det.on_mutex_create(&mut main, MUTEX, false, false);
    let after = det.sync_uid(MUTEX).expect("mutex exists");
    assert_ne!(before, after);

    let m = det.metrics();
    assert_eq!(m.blocks_allocated, 2);
    assert!(m.sync_freed >= 1);
    assert!(m.blocks_freed >= 1);
    assert!(sink.races().is_empty());
}

#[test]
fn free_racing_with_an_unsynchronized_read_is_reported() {
    let (det, sink) = detector(DetectorConfig::default());
    let mut main = det.main_thread(1);
    let child = det.on_thread_create(&mut main, false);
    let mut t1 = det.on_thread_start(child, 2);

    det.on_alloc(&mut main, 0x30_0000, 32);
    det.release_store(&mut main, 0x40_0000);
    det.acquire(&mut t1, 0x40_0000);
    det.record_access(&mut t1, 0x30_0008, 4, false);
    det.on_free(&mut main, 0x30_0000);
    let races = sink.take_races();
    assert_eq!(races.len(), 1);
    assert!(races[0].current.is_write);
    assert_eq!(races[0].previous.tid, child);
}

#[test]
fn huge_unmap_probes_a_bounded_number_of_pages() {
    const BASE: usize = 0x4000_0000;
    const SIZE: usize = 1 << 30;

    let (det, _) = detector(DetectorConfig::default());
    let mut main = det.main_thread(1);
    det.on_mmap(&mut main, BASE, 4096);
    det.on_mutex_create(&mut main, BASE + 0x10, false, false);
    det.on_mutex_create(&mut main, BASE + SIZE - 0x40, false, false);
    det.on_mutex_create(&mut main, BASE + SIZE / 2, false, false);

    det.on_munmap(&mut main, BASE, SIZE);

    let probed = det.metrics().pages_probed;
    assert!(
        probed <= 200,
        "probed {probed} pages of {} for a region with three live objects",
        SIZE / 4096
    );
    assert_eq!(det.sync_uid(BASE + 0x10), None);
    assert_eq!(det.sync_uid(BASE + SIZE - 0x40), None);
    assert_eq!(det.sync_uid(BASE + SIZE / 2), None, "interior metadata is dropped");
}

#[test]
fn small_unmap_is_exact() {
    let (det, _) = detector(DetectorConfig::default());
    let mut main = det.main_thread(1);
    det.on_mutex_create(&mut main, 0x50_0100, false, false);
    det.on_munmap(&mut main, 0x50_0000, 0x2000);
    assert_eq!(det.sync_uid(0x50_0100), None);
    assert_eq!(det.metrics().pages_probed, 0);
    assert_eq!(det.sync_registry().live_syncs(), 0);
}

#[test]
fn move_memory_carries_sync_objects() {
    let (det, _) = detector(DetectorConfig::default());
    let mut main = det.main_thread(1);
    det.on_mutex_create(&mut main, 0x60_0010, false, false);
    let uid = det.sync_uid(0x60_0010).expect("mutex");
    det.move_memory(0x60_0000, 0x61_0000, 0x40);
    assert_eq!(det.sync_uid(0x60_0010), None);
    assert_eq!(det.sync_uid(0x61_0010), Some(uid));
}
