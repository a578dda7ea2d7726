//! Codec throughput on frame-sized payloads

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use payload_compression::{Codec, DictionaryCodec, PayloadCompressor, RunLengthCodec};

fn structured_payload() -> Vec<u8> {
    let mut data = Vec::new();
    for i in 0..50i32 {
        let name = format!("Variable_{i}");
        data.extend_from_slice(&(name.len() as u16).to_le_bytes());
        data.extend_from_slice(name.as_bytes());
        data.extend_from_slice(&(i * 100).to_le_bytes());
    }
    data
}

fn bench_codecs(c: &mut Criterion) {
    let structured = structured_payload();
    let repetitive: Vec<u8> = (0..1000).map(|i| ((i / 100) % 10) as u8).collect();

    c.bench_function("rle_compress_repetitive", |b| {
        b.iter(|| RunLengthCodec.compress(black_box(&repetitive)))
    });
    c.bench_function("dictionary_compress_structured", |b| {
        b.iter(|| DictionaryCodec.compress(black_box(&structured)))
    });
    c.bench_function("auto_compress_structured", |b| {
        b.iter(|| PayloadCompressor::compress_auto(black_box(&structured)))
    });

    let packed = DictionaryCodec.compress(&structured);
    c.bench_function("dictionary_decompress_structured", |b| {
        b.iter(|| DictionaryCodec.decompress(black_box(&packed)))
    });
}

criterion_group!(benches, bench_codecs);
criterion_main!(benches);
