//! Performance benchmarks for the backend layer
//!
//! Covers the CRTC/plane matcher, which runs on every hotplug, and signal
//! emission, which sits on every device and output event.

use axiom_backend::{match_obj, Backend, HeadlessBackend, InputDeviceType, ManualEventLoop, Signal, UNMATCHED};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use std::rc::Rc;

/// Benchmark matching with every object fitting every slot (search exits early)
fn bench_match_full_compatibility(c: &mut Criterion) {
    let mut group = c.benchmark_group("match_obj_full");

    for size in [2usize, 4, 8].iter() {
        let mask = (1u32 << size) - 1;
        let objs = vec![mask; *size];
        let res = vec![UNMATCHED; *size];
        group.bench_with_input(format!("{}x{}", size, size), size, |b, &size| {
            let mut out = vec![0u32; size];
            b.iter(|| black_box(match_obj(black_box(&objs), black_box(&res), &mut out)));
        });
    }

    group.finish();
}

/// Benchmark matching where most objects fit a single slot (worst-case backtracking)
fn bench_match_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("match_obj_contended");

    for size in [4usize, 6, 8].iter() {
        // Object i fits slot 0 and slot i: only one assignment is maximal
        let objs: Vec<u32> = (0..*size).map(|i| 1 | (1 << i)).collect();
        let res: Vec<u32> = (0..*size).map(|i| ((i + 1) % size) as u32).collect();
        group.bench_with_input(format!("{}_objects_stale_hint", size), size, |b, &size| {
            let mut out = vec![0u32; size];
            b.iter(|| black_box(match_obj(black_box(&objs), black_box(&res), &mut out)));
        });
    }

    group.finish();
}

/// Benchmark signal emission with a growing listener list
fn bench_signal_emit(c: &mut Criterion) {
    let mut group = c.benchmark_group("signal_emit");

    for listeners in [1usize, 10, 100].iter() {
        let signal: Signal<u64> = Signal::new();
        let sum = Rc::new(std::cell::Cell::new(0u64));
        let handles: Vec<_> = (0..*listeners)
            .map(|_| {
                let sum = sum.clone();
                signal.connect(move |value| sum.set(sum.get().wrapping_add(*value)))
            })
            .collect();

        group.bench_function(format!("{}_listeners", listeners), |b| {
            b.iter(|| signal.emit(black_box(&1)));
        });
        drop(handles);
    }

    group.finish();
}

/// Benchmark a full headless bring-up and teardown
fn bench_headless_lifecycle(c: &mut Criterion) {
    c.bench_function("headless_start_destroy", |b| {
        b.iter_batched(
            || {
                let backend = HeadlessBackend::new(Rc::new(ManualEventLoop::new()));
                for _ in 0..4 {
                    backend.add_output(1920, 1080);
                }
                for ty in InputDeviceType::ALL {
                    backend.add_input_device(ty);
                }
                backend
            },
            |backend| {
                black_box(backend.start());
                backend.destroy();
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_match_full_compatibility,
    bench_match_contended,
    bench_signal_emit,
    bench_headless_lifecycle
);

criterion_main!(benches);
