//! Benchmarks for queue operations using criterion.
//!
//! These benchmarks measure the performance of basic queue operations:
//! - Single add
//! - Batch add (100 items)
//! - Reserve from a deep ready sub-queue
//! - Full lifecycle (add → reserve → complete)

#![allow(missing_docs)]

use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use sluice::config::QueueConfig;
use sluice::queue::{AddRequest, Queue};

fn request(n: usize) -> AddRequest<String> {
    AddRequest {
        key: format!("key-{n}"),
        data: format!("payload-{n}"),
        priority: (n % 256) as u8,
        reserve_group: String::new(),
        until_buried: 3,
        dep_groups: Vec::new(),
        dependencies: Vec::new(),
        supersede: false,
    }
}

fn bench_add_single(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_single");
    group.sample_size(100);

    group.bench_function("in_memory", |b| {
        let queue: Queue<String> = Queue::new("bench", QueueConfig::default());
        let mut n = 0usize;
        b.iter(|| {
            n += 1;
            queue.add(request(n)).expect("add should succeed");
        });
    });

    group.finish();
}

fn bench_add_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_batch");
    group.throughput(Throughput::Elements(100));

    group.bench_function("100_items", |b| {
        let mut base = 0usize;
        b.iter(|| {
            let queue: Queue<String> = Queue::new("bench", QueueConfig::default());
            for n in base..base + 100 {
                queue.add(request(n)).expect("add should succeed");
            }
            base += 100;
        });
    });

    group.finish();
}

fn bench_reserve(c: &mut Criterion) {
    let mut group = c.benchmark_group("reserve");

    group.bench_function("deep_ready", |b| {
        let queue: Queue<String> = Queue::new("bench", QueueConfig::default());
        for n in 0..10_000 {
            queue.add(request(n)).expect("add should succeed");
        }
        b.iter(|| {
            if let Ok(Some((key, _))) = queue.reserve("", Duration::from_secs(600)) {
                // keep the pool full
                queue.complete(&key).expect("complete should succeed");
                let mut refill = request(0);
                refill.key = key;
                refill.supersede = true;
                queue.add(refill).expect("refill should succeed");
            }
        });
    });

    group.finish();
}

fn bench_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("lifecycle");

    group.bench_function("add_reserve_complete", |b| {
        let queue: Queue<String> = Queue::new("bench", QueueConfig::default());
        let mut n = 0usize;
        b.iter(|| {
            n += 1;
            queue.add(request(n)).expect("add should succeed");
            let (key, _) = queue
                .reserve("", Duration::from_secs(600))
                .expect("reserve should succeed")
                .expect("an item should be ready");
            queue.complete(&key).expect("complete should succeed");
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_add_single,
    bench_add_batch,
    bench_reserve,
    bench_lifecycle
);
criterion_main!(benches);
