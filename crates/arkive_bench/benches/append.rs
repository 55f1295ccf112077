//! Append benchmarks.

use arkive_bench::{fill, observation, temp_dataset};
use arkive_core::{AcquireResult, IndexKind, SegmentKind};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

/// Benchmark single appends per index kind.
fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    group.throughput(Throughput::Elements(1));

    for (name, index) in [
        ("per_segment", IndexKind::PerSegment),
        ("plain", IndexKind::Plain),
        ("sqlite", IndexKind::Sqlite),
    ] {
        group.bench_function(BenchmarkId::new("concat", name), |b| {
            let (_dir, dataset) = temp_dataset(|c| c.index(index));
            let writer = dataset.writer();
            let mut n = 0;
            b.iter(|| {
                let mut record = observation(n);
                n += 1;
                assert_eq!(writer.acquire(black_box(&mut record)), AcquireResult::Ok);
            });
        });
    }

    group.bench_function(BenchmarkId::new("dir", "per_segment"), |b| {
        let (_dir, dataset) = temp_dataset(|c| c.segments(SegmentKind::Dir));
        let writer = dataset.writer();
        let mut n = 0;
        b.iter(|| {
            let mut record = observation(n);
            n += 1;
            assert_eq!(writer.acquire(black_box(&mut record)), AcquireResult::Ok);
        });
    });

    group.finish();
}

/// Benchmark rejection of duplicates.
fn bench_duplicate(c: &mut Criterion) {
    let (_dir, dataset) = temp_dataset(|c| c);
    fill(&dataset, 0, 100);
    let writer = dataset.writer();

    c.bench_function("append_duplicate", |b| {
        b.iter(|| {
            let mut record = observation(black_box(42));
            assert_eq!(writer.acquire(&mut record), AcquireResult::Duplicate);
        });
    });
}

criterion_group!(benches, bench_append, bench_duplicate);
criterion_main!(benches);
