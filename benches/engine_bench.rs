//! Benchmarks for VaultDisk engine operations

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use tempfile::TempDir;
use vaultdisk::{Config, Engine, RingCipher, BLOCK_SIZE};

fn bench_engine(dir: &TempDir) -> Engine {
    let config = Config::builder()
        .device_path(dir.path().join("bench.img"))
        .blocks_per_segment(64)
        .nr_segment(64)
        .nr_disk_level(3)
        .level_growth_ratio(4)
        .level0_files(4)
        .max_level_files(16)
        .file_capacity(1024)
        .memtable_capacity(512)
        .gc_free_threshold(8)
        .build();
    Engine::open(config, Arc::new(RingCipher::new())).unwrap()
}

fn engine_benchmarks(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = bench_engine(&dir);
    let payload = vec![0xA5u8; BLOCK_SIZE];

    let mut lba = 0u64;
    c.bench_function("sequential_write", |b| {
        b.iter(|| {
            engine.write(lba % 1024, &payload).unwrap();
            lba += 1;
        })
    });

    for warm in 0..256 {
        engine.write(warm, &payload).unwrap();
    }
    let mut read_lba = 0u64;
    c.bench_function("sequential_read", |b| {
        b.iter(|| {
            let data = engine.read(read_lba % 256).unwrap().unwrap();
            assert_eq!(data.len(), BLOCK_SIZE);
            read_lba += 1;
        })
    });

    engine.shutdown().unwrap();
}

criterion_group!(benches, engine_benchmarks);
criterion_main!(benches);
