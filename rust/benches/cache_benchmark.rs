use blockcache::avl::{AvlIndex, BufferKey};
use blockcache::cache::BufferCache;
use blockcache::config::{CacheConfig, PoolConfig};
use blockcache::disk::{CompletionMode, DeviceId, DiskTable, RamDisk};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;

const DEVICE: DeviceId = DeviceId::new(1, 0);
const DISK_BLOCKS: u64 = 1024;

fn cache(buffers: usize, mode: CompletionMode) -> BufferCache {
    let disks = Arc::new(DiskTable::new());
    disks
        .register(DEVICE, Arc::new(RamDisk::with_mode(512, DISK_BLOCKS, mode)))
        .unwrap();
    BufferCache::init(CacheConfig::new(vec![PoolConfig::new(512, buffers)]), disks).unwrap()
}

/// Random reads over the whole disk with pools of growing size
fn benchmark_read_pool_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("random_reads");
    let pattern: Vec<u64> = (0..2000).map(|_| fastrand::u64(0..DISK_BLOCKS)).collect();

    for buffers in [8, 32, 128, 512] {
        let cache = cache(buffers, CompletionMode::Inline);
        group.bench_with_input(BenchmarkId::new("pool", buffers), &buffers, |b, _| {
            b.iter(|| {
                for &block in &pattern {
                    let handle = cache.read(DEVICE, block).unwrap();
                    black_box(handle.with_data(|data| data[0]));
                    cache.release(handle).unwrap();
                }
            })
        });
    }

    group.finish();
}

/// Dirtying blocks and waiting for the write-back task to drain them
fn benchmark_write_back(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_back");

    for (name, mode) in [("inline", CompletionMode::Inline), ("deferred", CompletionMode::Deferred)] {
        let cache = cache(64, mode);
        group.bench_function(BenchmarkId::new("release_modified_then_sync_device", name), |b| {
            b.iter(|| {
                for _ in 0..64 {
                    let handle = cache.get(DEVICE, fastrand::u64(0..DISK_BLOCKS)).unwrap();
                    handle.fill(&[0x5A; 16]);
                    cache.release_modified(handle).unwrap();
                }
                cache.sync_device(DEVICE).unwrap();
            })
        });
        group.bench_function(BenchmarkId::new("sync_each", name), |b| {
            b.iter(|| {
                let handle = cache.get(DEVICE, fastrand::u64(0..DISK_BLOCKS)).unwrap();
                cache.sync(handle).unwrap();
            })
        });
    }

    group.finish();
}

fn benchmark_index(c: &mut Criterion) {
    let mut group = c.benchmark_group("avl_index");

    for size in [64usize, 1024, 16384] {
        let mut keys: Vec<u64> = (0..size as u64).collect();
        fastrand::shuffle(&mut keys);
        group.bench_with_input(BenchmarkId::new("insert_remove", size), &size, |b, &size| {
            b.iter(|| {
                let mut index = AvlIndex::with_capacity(size);
                for (slot, &block) in keys.iter().enumerate() {
                    index.insert(slot, BufferKey::new(DEVICE, block)).unwrap();
                }
                for slot in 0..size {
                    index.remove(slot).unwrap();
                }
                black_box(index.len())
            })
        });

        let mut index = AvlIndex::with_capacity(size);
        for (slot, &block) in keys.iter().enumerate() {
            index.insert(slot, BufferKey::new(DEVICE, block)).unwrap();
        }
        group.bench_with_input(BenchmarkId::new("search", size), &size, |b, &size| {
            b.iter(|| black_box(index.search(BufferKey::new(DEVICE, fastrand::u64(0..size as u64)))))
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_read_pool_sizes, benchmark_write_back, benchmark_index);
criterion_main!(benches);
