//! Criterion benchmarks for stream file decoding.
//!
//! A typical fly scan streams tens of thousands of 10-column rows; decoding
//! must stay well below the transfer time of the file.
//!
//! Run with: cargo bench --bench decoder_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flyscan::decoder::{decode_bytes, ApbSettings};
use flyscan::hardware::apb::NUM_CHANNELS;
use flyscan::hardware::mock::synthetic_stream_bytes;

/// Decode throughput for growing row counts.
fn decode_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_bytes");
    let settings = ApbSettings::new(NUM_CHANNELS, 10.0);

    for rows in [1_000usize, 30_500, 250_000] {
        let data = synthetic_stream_bytes(&settings, rows);
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &data, |b, data| {
            b.iter(|| decode_bytes(black_box(&settings), black_box(data)).unwrap());
        });
    }

    group.finish();
}

fn settings_parse(c: &mut Criterion) {
    let text = ApbSettings::new(NUM_CHANNELS, 10.0).to_text();
    c.bench_function("settings_parse", |b| {
        b.iter(|| ApbSettings::parse(black_box(&text), std::path::Path::new("bench.txt")).unwrap())
    });
}

criterion_group!(benches, decode_throughput, settings_parse);
criterion_main!(benches);
