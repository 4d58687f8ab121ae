//! Sync-object registry benchmarks.

use std::sync::Arc;
use std::thread;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use frankenrace_core::metrics::DetectorMetrics;
use frankenrace_core::stack::StackId;
use frankenrace_core::sync::SyncRegistry;
use frankenrace_core::{CollectingSink, Detector, DetectorConfig};

const BASE: usize = 0x20_0000;

fn registry(cas_retry_limit: usize) -> SyncRegistry {
    SyncRegistry::new(1 << 16, 1 << 10, cas_retry_limit, Arc::new(DetectorMetrics::new()))
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_or_create");

    group.bench_function("existing", |b| {
        let reg = registry(8);
        let _ = reg.get_or_create_and_lock(BASE, StackId::NONE, |_| ());
        b.iter(|| reg.get_or_create_and_lock(black_box(BASE), StackId::NONE, |s| s.recursion));
    });

    // Eight objects sharing one meta cell chain.
    group.bench_function("chain_of_8", |b| {
        let reg = registry(8);
        for i in 0..8 {
            let _ = reg.get_or_create_and_lock(BASE + i, StackId::NONE, |_| ());
        }
        b.iter(|| reg.get_or_create_and_lock(black_box(BASE), StackId::NONE, |s| s.recursion));
    });

    group.finish();
}

fn bench_contended_create(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_create");
    group.sample_size(20);

    for &limit in &[1usize, 8, 64] {
        group.bench_with_input(BenchmarkId::new("cas_retry_limit", limit), &limit, |b, &lim| {
            b.iter(|| {
                let reg = registry(lim);
                thread::scope(|s| {
                    for _ in 0..4 {
                        s.spawn(|| {
                            for i in 0..256 {
                                let _ = reg.get_or_create_and_lock(BASE + i, StackId::NONE, |_| ());
                            }
                        });
                    }
                });
                black_box(reg.live_syncs())
            });
        });
    }
    group.finish();
}

fn bench_mutex(c: &mut Criterion) {
    let mut group = c.benchmark_group("mutex");

    group.bench_function("lock_unlock", |b| {
        let det = Detector::new(DetectorConfig::default(), Arc::new(CollectingSink::new()));
        let mut thr = det.main_thread(1);
        b.iter(|| {
            det.on_lock(&mut thr, black_box(BASE));
            det.on_unlock(&mut thr, black_box(BASE));
        });
    });

    group.finish();
}

criterion_group!(benches, bench_lookup, bench_contended_create, bench_mutex);
criterion_main!(benches);
