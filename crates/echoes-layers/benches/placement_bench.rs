//! Benchmarks for layer/room placement
//!
//! Measures performance of:
//! - Layer lookup across the standard table
//! - Full placement (layer + room) at different epoch sizes

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use echoes_layers::{LayerTable, DEFAULT_BABEL_THRESHOLD};

/// Benchmark layer lookup at different epoch sizes
fn bench_layer_for(c: &mut Criterion) {
    let table = LayerTable::standard();
    let mut group = c.benchmark_group("layer_for");

    for &total in &[0u64, 150, 5_000, 60_000, 500_000, DEFAULT_BABEL_THRESHOLD] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(total), &total, |b, &t| {
            b.iter(|| table.layer_for(black_box(t)).index)
        });
    }
    group.finish();
}

/// Benchmark full placement against a fixed per-layer count
fn bench_place(c: &mut Criterion) {
    let table = LayerTable::standard();
    let mut group = c.benchmark_group("place");

    for &total in &[0u64, 9_000, 750_000] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(total), &total, |b, &t| {
            b.iter(|| table.place(black_box(t), |_| black_box(t / 2)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_layer_for, bench_place);
criterion_main!(benches);
