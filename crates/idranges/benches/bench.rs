use core::hint::black_box;
use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use futures::future::try_join_all;
use idranges::{Allocator, AllocatorConfig, ConcurrentRangeSet, MemoryBackend, Range, RangeSet};
use std::time::Instant;
use tokio::runtime::Builder;

const CATEGORY: &str = "bench";

// Number of IDs issued per benchmark iteration.
const TOTAL_IDS: usize = 4096;

/// A fragmented set: `count` ranges of `len` IDs separated by gaps of `len`.
fn fragmented(count: u64, len: u64) -> RangeSet {
    RangeSet::new(
        (0..count).map(|i| Range::new(1 + i * 2 * len, i * 2 * len + len)),
        CATEGORY,
    )
}

fn bench_range_set_take_one(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_set/take_one");
    group.throughput(Throughput::Elements(TOTAL_IDS as u64));

    group.bench_function(format!("elems/{TOTAL_IDS}"), |b| {
        b.iter_batched(
            || fragmented(64, 64),
            |mut set| {
                for _ in 0..TOTAL_IDS {
                    black_box(set.take_one().unwrap());
                }
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_range_set_take_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_set/take_push");

    for ranges in [1_u64, 64, 1024] {
        group.bench_function(format!("ranges/{ranges}"), |b| {
            b.iter_batched(
                || fragmented(ranges, 16),
                |mut set| {
                    let total = set.total_size();
                    let mut taken = set.take(total / 2).unwrap();
                    set.push(&mut taken).unwrap();
                    black_box(set);
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_range_set_validate(c: &mut Criterion) {
    let set = fragmented(1024, 16);
    let mut group = c.benchmark_group("range_set/validate_no_overlap");
    group.bench_function("ranges/1024", |b| {
        b.iter(|| black_box(set.validate_no_overlap(black_box(&Range::new(16_400, 16_410)))));
    });
    group.finish();
}

fn bench_concurrent_take_one(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_range_set/take_one");
    group.sample_size(10);

    for consumers in [1, num_cpus::get()] {
        group.throughput(Throughput::Elements((TOTAL_IDS * consumers) as u64));
        group.bench_function(format!("consumers/{consumers}"), |b| {
            let rt = Builder::new_multi_thread().enable_all().build().unwrap();

            b.to_async(&rt).iter_custom(move |iters| async move {
                let start = Instant::now();

                for _ in 0..iters {
                    let set = ConcurrentRangeSet::spawn(RangeSet::new(
                        [Range::new(1, u64::MAX)],
                        CATEGORY,
                    ));
                    let tasks = (0..consumers).map(|_| {
                        let set = set.clone();
                        tokio::spawn(async move {
                            for _ in 0..TOTAL_IDS {
                                black_box(set.take_one().await?);
                            }
                            Ok::<_, idranges::Error>(())
                        })
                    });
                    for result in try_join_all(tasks).await.unwrap() {
                        result.unwrap();
                    }
                    set.shutdown().await.unwrap();
                }

                start.elapsed()
            });
        });
    }

    group.finish();
}

fn bench_allocator_take_id(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocator/take_id");
    group.sample_size(10);
    group.throughput(Throughput::Elements(TOTAL_IDS as u64));

    for batch_size in [10_u64, 1000] {
        group.bench_function(format!("batch/{batch_size}"), |b| {
            let rt = Builder::new_multi_thread().enable_all().build().unwrap();

            b.to_async(&rt).iter_custom(move |iters| async move {
                let start = Instant::now();

                for _ in 0..iters {
                    let config = AllocatorConfig::default().with_batch_size(batch_size);
                    let allocator = Allocator::new(MemoryBackend::new(), config).unwrap();
                    let run = async {
                        for _ in 0..TOTAL_IDS {
                            black_box(allocator.take_id(CATEGORY).await?);
                        }
                        allocator.stop().await?;
                        Ok::<_, idranges::Error>(())
                    };
                    run.await.unwrap();
                }

                start.elapsed()
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_range_set_take_one,
    bench_range_set_take_push,
    bench_range_set_validate,
    bench_concurrent_take_one,
    bench_allocator_take_id,
);
criterion_main!(benches);
