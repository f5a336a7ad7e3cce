//! Benchmarks for buffer cache hot paths.
//!
//! - Gets of memory-resident objects (pin + touch + deserialize)
//! - Gets that promote from storage (read + block copy + checksum)
//! - Add/remove cycles (serialize + inode allocation + release)
//!
//! Run with: cargo bench --bench buffer_cache

use std::io::{self, Read, Write};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use spillcache::{BufferCache, BufferConfig, GroupId, Serializer, BLOCK_SIZE};

struct Bytes(GroupId);

impl Serializer<Vec<u8>> for Bytes {
    fn group_id(&self) -> GroupId {
        self.0
    }

    fn serialize(&self, value: &Vec<u8>, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(&(value.len() as u64).to_le_bytes())?;
        out.write_all(value)
    }

    fn deserialize(&self, input: &mut dyn Read) -> io::Result<Vec<u8>> {
        let mut len = [0u8; 8];
        input.read_exact(&mut len)?;
        let mut value = vec![0u8; u64::from_le_bytes(len) as usize];
        input.read_exact(&mut value)?;
        Ok(value)
    }
}

/// A cache of `blocks` memory blocks filled with `objects` values.
fn populated_cache(blocks: u64, objects: u64, value_size: usize) -> BufferCache {
    let config = BufferConfig::default()
        .with_memory_buffer_space((blocks + 1) * BLOCK_SIZE as u64)
        .with_max_storage_object_size(64 * BLOCK_SIZE)
        .with_use_disk(false)
        .with_max_storage_file_size(1 << 26);
    let cache = BufferCache::new(config).unwrap();
    let bytes = Bytes(1);
    cache.create_cache_group(1);
    let value = vec![0xAB; value_size];
    for id in 0..objects {
        cache.add_to_cache_group(1, id);
        cache.add(id, &value, &bytes).unwrap();
    }
    cache
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache/get");

    for value_size in [1024, 8 * 1024, 64 * 1024] {
        let cache = populated_cache(4096, 32, value_size);
        let bytes = Bytes(1);
        group.throughput(Throughput::Bytes(value_size as u64));
        group.bench_with_input(BenchmarkId::new("memory", value_size), &value_size, |b, _| {
            let mut id = 0u64;
            b.iter(|| {
                let value = cache.get_object(1, id, &bytes).unwrap();
                black_box(value);
                id = (id + 1) % 32;
            });
        });
    }

    // 256 one-block objects cycling through 64 blocks: most gets promote
    let cache = populated_cache(64, 256, 4096);
    let bytes = Bytes(1);
    group.throughput(Throughput::Elements(1));
    group.bench_function("promote", |b| {
        let mut id = 0u64;
        b.iter(|| {
            let value = cache.get_object(1, id, &bytes).unwrap();
            black_box(value);
            id = (id + 1) % 256;
        });
    });

    group.finish();
}

fn bench_add_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache/add_remove");

    for value_size in [1024, 32 * 1024] {
        let cache = populated_cache(1024, 0, 0);
        let bytes = Bytes(1);
        let value = vec![0x5A; value_size];
        group.throughput(Throughput::Bytes(value_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(value_size), &value_size, |b, _| {
            b.iter(|| {
                cache.add_to_cache_group(1, 0);
                cache.add(0, black_box(&value), &bytes).unwrap();
                black_box(cache.remove(1, 0));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_get, bench_add_remove);
criterion_main!(benches);
