#![allow(clippy::unwrap_used, clippy::uninlined_format_args)]

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use eqstream::core::wire::{append_crc, compress, decompress};
use eqstream::utils::compression::{deflate, inflate, MAX_INFLATED_SIZE};

fn bench_compression(c: &mut Criterion) {
    let mut group = c.benchmark_group("compression");
    let sizes = [32usize, 128, 512, 4096];

    for &size in &sizes {
        let data: Vec<u8> = (0..size).map(|i| (i % 23) as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("zlib_deflate_{}b", size), |b| {
            b.iter_batched(
                || data.clone(),
                |d| {
                    let _ = deflate(&d).unwrap();
                },
                BatchSize::SmallInput,
            )
        });
        group.bench_function(format!("zlib_inflate_{}b", size), |b| {
            let compressed = deflate(&data).unwrap();
            b.iter(|| {
                let out = inflate(&compressed, MAX_INFLATED_SIZE).unwrap();
                assert_eq!(out.len(), data.len());
            })
        });

        let mut frame = vec![0x00, 0x09];
        frame.extend_from_slice(&data);
        group.bench_function(format!("frame_compress_{}b", size), |b| {
            b.iter(|| {
                let _ = compress(&frame).unwrap();
            })
        });
        group.bench_function(format!("frame_decompress_{}b", size), |b| {
            let mut wire = compress(&frame).unwrap();
            append_crc(&mut wire, 0x1234_5678);
            b.iter(|| {
                let out = decompress(&wire, MAX_INFLATED_SIZE).unwrap();
                assert_eq!(out.len(), frame.len() + 2);
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compression);
criterion_main!(benches);
