// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![expect(missing_docs, reason = "Benchmark code")]

//! Benchmarks the ordered queue that backs every scheduling loop. The scenarios:
//! * Insert 10k entries with pseudo-random fire times, then drain them in order
//! * Insert and cancel half of 10k entries, then extract the due ones in batches

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use timerloop::OrderedQueue;

const ENTRIES: usize = 10_000;

fn criterion_benchmark(c: &mut Criterion) {
    queue(c);
}

fn fire_times(seed: u64) -> Vec<i64> {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..ENTRIES).map(|_| rng.i64(0..1_000_000_000)).collect()
}

fn queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("ordered_queue");
    let times = fire_times(42);

    group.bench_function("insert_then_extract_min", |b| {
        b.iter(|| {
            let mut queue = OrderedQueue::new();
            for (index, when) in times.iter().enumerate() {
                let _ = queue.insert(*when, index);
            }
            while let Some(entry) = queue.extract_min() {
                let _ = black_box(entry);
            }
        });
    });

    group.bench_function("insert_cancel_extract_due", |b| {
        b.iter(|| {
            let mut queue = OrderedQueue::new();
            let keys: Vec<_> = times.iter().enumerate().map(|(index, when)| queue.insert(*when, index)).collect();
            for key in keys.iter().step_by(2) {
                let _ = queue.remove(*key);
            }
            for now in (0..=1_000_000_000).step_by(100_000_000) {
                let _ = black_box(queue.extract_due(now));
            }
        });
    });

    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default();
    targets = criterion_benchmark
}

criterion_main!(benches);
