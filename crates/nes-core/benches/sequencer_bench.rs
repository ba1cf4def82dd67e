//! Sequencer and input formatter benchmarks
//!
//! Run with: cargo bench --bench sequencer_bench

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nes_core::buffer::TupleBuffer;
use nes_core::sequence::{InputFormatter, SequenceData, SequenceShredder, Sequencer};

/// Release of units arriving in order and in reversed blocks.
fn bench_sequencer(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequencer");

    for block in [1u64, 16, 256] {
        group.throughput(Throughput::Elements(block));
        group.bench_with_input(BenchmarkId::new("reversed_block", block), &block, |b, &block| {
            let sequencer = Sequencer::new();
            let mut base = 1u64;
            b.iter(|| {
                let mut released = 0u64;
                for sn in (base..base + block).rev() {
                    let data = SequenceData::single(sn);
                    let mut ready = sequencer.is_next(data, data);
                    while let Some(unit) = ready {
                        released += 1;
                        ready = sequencer.advance_and_get_next(unit);
                    }
                }
                base += block;
                black_box(released)
            })
        });
    }

    group.finish();
}

/// Formatting of CSV-like buffers with records spanning buffer boundaries.
fn bench_formatter(c: &mut Criterion) {
    let mut group = c.benchmark_group("input_formatter");
    let line = b"1,2,3,4,5,6,7,8\n";
    let payload: Vec<u8> = line.iter().copied().cycle().take(4096).collect();
    group.throughput(Throughput::Bytes(payload.len() as u64));

    group.bench_function("spanning_records", |b| {
        let formatter = InputFormatter::new(b'\n', Arc::new(SequenceShredder::new(1024).unwrap()));
        let mut sn = 1u64;
        b.iter(|| {
            let buffer = TupleBuffer::from_vec(payload.clone());
            buffer.set_number_of_tuples(payload.len() as u64);
            buffer.set_sequence_number(sn);
            sn += 1;
            let records = formatter.format(&buffer).unwrap();
            black_box(records.len())
        })
    });

    group.finish();
}

criterion_group!(benches, bench_sequencer, bench_formatter);
criterion_main!(benches);
