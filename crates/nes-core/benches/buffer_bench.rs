//! Buffer pool benchmarks
//!
//! Run with: cargo bench --bench buffer_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nes_core::buffer::{BufferManager, BufferManagerConfig, BufferProvider};

fn manager(num_buffers: usize) -> std::sync::Arc<BufferManager> {
    BufferManager::new(
        BufferManagerConfig::builder()
            .buffer_size(4096)
            .num_buffers(num_buffers)
            .build(),
    )
    .unwrap()
}

/// Acquire and release one pooled buffer.
fn bench_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_acquire");
    group.throughput(Throughput::Elements(1));

    let global = manager(1024);
    group.bench_function("global_pool", |b| {
        b.iter(|| {
            let buffer = global.get_buffer_blocking();
            black_box(buffer.buffer_size())
        })
    });

    let local = global.create_fixed_size_buffer_pool(64).unwrap();
    group.bench_function("local_pool", |b| {
        b.iter(|| {
            let buffer = local.get_buffer_blocking();
            black_box(buffer.buffer_size())
        })
    });

    group.finish();
}

/// Clone and drop of shared buffers with metadata access.
fn bench_share(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_share");
    let global = manager(16);

    for clones in [1usize, 8, 64] {
        group.throughput(Throughput::Elements(clones as u64));
        group.bench_with_input(BenchmarkId::new("clone", clones), &clones, |b, &clones| {
            let buffer = global.get_buffer_blocking();
            b.iter(|| {
                let copies: Vec<_> = (0..clones).map(|_| buffer.clone()).collect();
                black_box(copies[0].sequence_number())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_acquire_release, bench_share);
criterion_main!(benches);
