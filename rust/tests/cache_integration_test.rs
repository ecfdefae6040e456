use blockcache::avl::BufferKey;
use blockcache::cache::BufferCache;
use blockcache::config::{CacheConfig, PoolConfig};
use blockcache::descriptor::BufferState;
use blockcache::disk::{DeviceId, DiskTable, FileDisk, RamDisk};
use blockcache::pool::PoolId;
use blockcache::show::ShowFilter;
use blockcache::{CacheError, ConfigError, IoError};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// End-to-end tests through the public cache API on memory and file backed disks

const DEV: DeviceId = DeviceId::new(3, 0);

fn ram_cache(buffers: usize) -> (BufferCache, Arc<RamDisk>) {
    let disks = Arc::new(DiskTable::new());
    let ram = Arc::new(RamDisk::new(512, 64));
    disks.register(DEV, ram.clone()).unwrap();
    let cache = BufferCache::init(CacheConfig::new(vec![PoolConfig::new(512, buffers)]), disks).unwrap();
    (cache, ram)
}

fn pattern(seed: u8) -> Vec<u8> {
    (0..512).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("blockcache-it-{}-{name}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    dir
}

#[test]
fn test_write_read_round_trip_under_eviction() {
    let (cache, ram) = ram_cache(4);
    let payload = pattern(7);

    let handle = cache.get(DEV, 10).unwrap();
    handle.fill(&payload);
    cache.release_modified(handle).unwrap();

    // Cycle unrelated blocks through the pool; only clean buffers get evicted.
    for block in 20..40 {
        let handle = cache.read(DEV, block).unwrap();
        cache.release(handle).unwrap();
    }

    cache.sync_device(DEV).unwrap();
    assert_eq!(ram.peek(10), payload);

    let handle = cache.read(DEV, 10).unwrap();
    assert_eq!(handle.data(), payload);
    cache.release(handle).unwrap();
    cache.check_consistency().unwrap();
}

#[test]
fn test_lru_eviction_order() {
    let (cache, _) = ram_cache(4);
    for block in 0..4 {
        let handle = cache.get(DEV, block).unwrap();
        cache.release(handle).unwrap();
    }
    let handle = cache.get(DEV, 4).unwrap();

    assert_eq!(cache.buffer_info(DEV, 0).unwrap(), None, "least recently used block goes first");
    for block in 1..4 {
        assert!(cache.buffer_info(DEV, block).unwrap().is_some());
    }
    assert_eq!(cache.stats().evictions, 1);
    cache.release(handle).unwrap();

    // Touching block 1 again moves it behind 2 and 3.
    let handle = cache.get(DEV, 1).unwrap();
    cache.release(handle).unwrap();
    let handle = cache.get(DEV, 5).unwrap();
    assert_eq!(cache.buffer_info(DEV, 2).unwrap(), None);
    assert!(cache.buffer_info(DEV, 1).unwrap().is_some());
    cache.release(handle).unwrap();
}

#[test]
fn test_shared_reference_scenario() {
    let disks = Arc::new(DiskTable::new());
    let dev = DeviceId::new(7, 0);
    disks.register(dev, Arc::new(RamDisk::new(512, 16))).unwrap();
    let cache = BufferCache::init(CacheConfig::new(vec![PoolConfig::new(512, 4)]), disks).unwrap();

    let h1 = cache.get(dev, 1).unwrap();
    assert_eq!(cache.buffer_info(dev, 1).unwrap().unwrap().use_count, 1);
    let h2 = cache.get(dev, 1).unwrap();
    let info = cache.buffer_info(dev, 1).unwrap().unwrap();
    assert_eq!(info.use_count, 2);
    assert_eq!(info.slot, cache.buffer_infos(None, ShowFilter::USED).unwrap()[0].slot);

    cache.release(h1).unwrap();
    let info = cache.buffer_info(dev, 1).unwrap().unwrap();
    assert_eq!(info.use_count, 1);
    assert_eq!(info.state, BufferState::InUse);
    assert_eq!(cache.pool_headers()[0].lru, 0);
    assert_eq!(cache.pool_headers()[0].admission, 3);

    cache.release(h2).unwrap();
    let info = cache.buffer_info(dev, 1).unwrap().unwrap();
    assert_eq!(info.use_count, 0);
    assert_eq!(info.state, BufferState::Clean);
    let header = cache.pool_headers()[0];
    assert_eq!(header.lru, 1);
    assert_eq!(header.admission, 4);
    cache.check_consistency().unwrap();
}

#[test]
fn test_cached_read_skips_device() {
    let (cache, ram) = ram_cache(4);
    ram.poke(2, b"on disk");

    let handle = cache.read(DEV, 2).unwrap();
    assert_eq!(&handle.data()[..7], b"on disk");
    cache.release(handle).unwrap();
    let handle = cache.read(DEV, 2).unwrap();
    cache.release(handle).unwrap();

    assert_eq!(ram.reads(), 1);
    let stats = cache.stats();
    assert_eq!(stats.reads, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
}

#[test]
fn test_get_does_not_read() {
    let (cache, ram) = ram_cache(4);
    let handle = cache.get(DEV, 3).unwrap();
    assert_eq!(ram.reads(), 0);
    assert!(!cache.buffer_info(DEV, 3).unwrap().unwrap().actual);
    cache.release(handle).unwrap();
}

#[test]
fn test_partitions_share_buffers() {
    let disks = Arc::new(DiskTable::new());
    let whole = DeviceId::new(8, 0);
    let part = DeviceId::new(8, 1);
    let ram = Arc::new(RamDisk::new(512, 100));
    disks.register(whole, ram.clone()).unwrap();
    disks.register_partition(part, whole, 50, 20).unwrap();
    assert!(matches!(
        disks.register_partition(DeviceId::new(8, 2), whole, 90, 20),
        Err(CacheError::BlockOutOfRange { .. })
    ));
    assert!(matches!(
        disks.register_partition(part, whole, 0, 1),
        Err(CacheError::DeviceExists(_))
    ));

    let cache = BufferCache::init(CacheConfig::new(vec![PoolConfig::new(512, 4)]), disks).unwrap();
    let handle = cache.get(part, 5).unwrap();
    assert_eq!(handle.key(), BufferKey::new(part, 5));
    handle.fill(b"partition data");
    cache.sync(handle).unwrap();
    assert_eq!(&ram.peek(55)[..14], b"partition data");

    // Same physical block through the whole disk: a cache hit.
    let handle = cache.read(whole, 55).unwrap();
    assert_eq!(&handle.data()[..14], b"partition data");
    assert_eq!(ram.reads(), 0);
    let info = cache.buffer_info(part, 5).unwrap().unwrap();
    assert_eq!(info.key, Some(BufferKey::new(whole, 55)));
    cache.release(handle).unwrap();

    assert!(matches!(
        cache.get(part, 20),
        Err(CacheError::BlockOutOfRange { block: 20, count: 20, .. })
    ));
    cache.sync_device(part).unwrap();
}

#[test]
fn test_invalid_arguments_leave_cache_untouched() {
    let disks = Arc::new(DiskTable::new());
    disks.register(DEV, Arc::new(RamDisk::new(512, 64))).unwrap();
    disks.register(DeviceId::new(4, 0), Arc::new(RamDisk::new(2048, 8))).unwrap();
    disks.register(DeviceId::new(5, 0), Arc::new(RamDisk::new(768, 8))).unwrap();
    let cache = BufferCache::init(CacheConfig::new(vec![PoolConfig::new(512, 2)]), disks).unwrap();

    assert!(matches!(
        cache.read(DeviceId::new(9, 9), 0),
        Err(CacheError::InvalidDevice(d)) if d == DeviceId::new(9, 9)
    ));
    assert!(matches!(
        cache.get(DEV, 64),
        Err(CacheError::BlockOutOfRange { block: 64, count: 64, .. })
    ));
    assert!(matches!(cache.get(DeviceId::new(4, 0), 0), Err(CacheError::PoolNotFound(2048))));
    assert!(matches!(cache.get(DeviceId::new(5, 0), 0), Err(CacheError::InvalidBlockSize(768))));
    assert!(matches!(
        cache.sync_device(DeviceId::new(9, 9)),
        Err(CacheError::InvalidDevice(_))
    ));

    assert_eq!(cache.stats(), Default::default());
    assert_eq!(cache.pool_headers()[0].free, 2);
    cache.check_consistency().unwrap();
}

#[test]
fn test_read_error_is_reported_and_recoverable() {
    let (cache, ram) = ram_cache(4);
    ram.fail_block(5);

    let err = cache.read(DEV, 5).unwrap_err();
    assert!(matches!(err, CacheError::Io { key, .. } if key == BufferKey::new(DEV, 5)));
    assert_eq!(err.io_error().map(|e| e.errno), Some(IoError::EIO));

    let info = cache.buffer_info(DEV, 5).unwrap().unwrap();
    assert_eq!(info.state, BufferState::Clean);
    assert!(!info.actual);
    assert_eq!(info.status, Some(IoError::EIO));
    cache.check_consistency().unwrap();

    ram.heal_block(5);
    ram.poke(5, b"healed");
    let handle = cache.read(DEV, 5).unwrap();
    assert_eq!(&handle.data()[..6], b"healed");
    cache.release(handle).unwrap();

    let stats = cache.stats();
    assert_eq!(stats.reads, 2);
    assert_eq!(stats.read_errors, 1);
}

#[test]
fn test_sync_reports_write_error() {
    let (cache, ram) = ram_cache(4);
    ram.fail_block(6);

    let handle = cache.get(DEV, 6).unwrap();
    handle.fill(b"lost");
    let err = cache.sync(handle).unwrap_err();
    assert_eq!(err.io_error(), Some(IoError::transfer()));

    // A failed write is not retried; the buffer is no longer modified.
    let info = cache.buffer_info(DEV, 6).unwrap().unwrap();
    assert!(!info.modified);
    assert_eq!(info.state, BufferState::Clean);
    cache.sync_device(DEV).unwrap();

    let stats = cache.stats();
    assert_eq!(stats.writes, 1);
    assert_eq!(stats.write_errors, 1);
    cache.check_consistency().unwrap();
}

#[test]
fn test_sync_writes_through() {
    let (cache, ram) = ram_cache(2);
    for block in 0..8u64 {
        let handle = cache.get(DEV, block).unwrap();
        handle.fill(&pattern(block as u8));
        cache.sync(handle).unwrap();
        assert_eq!(ram.peek(block), pattern(block as u8));
    }
    assert_eq!(ram.writes(), 8);
    assert!(cache.buffer_infos(None, ShowFilter::MODIFIED).unwrap().is_empty());
}

#[test]
fn test_dirty_buffer_keeps_content_when_reacquired() {
    let (cache, ram) = ram_cache(4);
    let handle = cache.get(DEV, 12).unwrap();
    handle.fill(b"first");
    cache.release_modified(handle).unwrap();

    let handle = cache.read(DEV, 12).unwrap();
    assert_eq!(&handle.data()[..5], b"first");
    handle.fill(b"second");
    cache.release_modified(handle).unwrap();

    cache.sync_device(DEV).unwrap();
    assert_eq!(&ram.peek(12)[..6], b"second");
    assert_eq!(ram.reads(), 0);
}

#[test]
fn test_shutdown_drains_dirty_buffers() {
    let (cache, ram) = ram_cache(32);
    for block in 0..32u64 {
        let handle = cache.get(DEV, block).unwrap();
        handle.fill(&pattern(block as u8));
        cache.release_modified(handle).unwrap();
    }
    cache.shutdown();
    for block in 0..32u64 {
        assert_eq!(ram.peek(block), pattern(block as u8));
    }
}

#[test]
fn test_dropped_handle_is_released() {
    let (cache, _) = ram_cache(1);
    {
        let handle = cache.get(DEV, 0).unwrap();
        handle.fill(b"dropped");
    }
    // Dropping releases unmodified, so the buffer is reusable right away.
    let handle = cache.get(DEV, 1).unwrap();
    assert_eq!(cache.buffer_info(DEV, 0).unwrap(), None);
    cache.release(handle).unwrap();
}

#[test]
fn test_mem_area_backs_the_pool() {
    let disks = Arc::new(DiskTable::new());
    disks.register(DEV, Arc::new(RamDisk::new(512, 8))).unwrap();
    let area = vec![0x5Au8; 512 * 2];
    let config = CacheConfig::new(vec![PoolConfig::new(512, 2).with_mem_area(area)]);
    let cache = BufferCache::init(config, disks).unwrap();

    let handle = cache.get(DEV, 0).unwrap();
    assert!(handle.data().iter().all(|&b| b == 0x5A));
    cache.release(handle).unwrap();
}

#[test]
fn test_init_errors() {
    let disks = Arc::new(DiskTable::new());
    assert!(matches!(
        BufferCache::init(CacheConfig::new(vec![]), disks.clone()),
        Err(CacheError::Config(ConfigError::NoPools))
    ));
    let bad_area = PoolConfig::new(512, 2).with_mem_area(vec![0; 100]);
    assert!(matches!(
        BufferCache::init(CacheConfig::new(vec![PoolConfig::new(512, 1), bad_area]), disks.clone()),
        Err(CacheError::Config(ConfigError::MemAreaSize { pool: 1, .. }))
    ));
    assert!(matches!(
        BufferCache::init(CacheConfig::new(vec![PoolConfig::new(512, 0)]), disks),
        Err(CacheError::Config(ConfigError::ZeroBlockCount { pool: 0 }))
    ));
}

#[test]
fn test_config_file_and_pool_lookup() {
    let dir = scratch_dir("config");
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join("cache.json");
    fs::write(
        &path,
        r#"{
            "pools": [
                { "block_size": 1024, "block_count": 8 },
                { "block_size": 512, "block_count": 16 },
                { "block_size": 4096, "block_count": 4 }
            ],
            "swapout": { "thread_name": "test-swapout" }
        }"#,
    )
    .unwrap();

    let config = CacheConfig::from_file(&path).unwrap();
    let cache = BufferCache::init(config, Arc::new(DiskTable::new())).unwrap();
    assert_eq!(cache.pool_count(), 3);
    assert_eq!(cache.find_pool_for_size(512).unwrap(), PoolId(1));
    assert_eq!(cache.find_pool_for_size(2048).unwrap(), PoolId(2));
    assert_eq!(cache.pool_info(PoolId(0)).unwrap().block_count, 8);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_small_device_blocks_in_larger_pool() {
    let disks = Arc::new(DiskTable::new());
    let ram = Arc::new(RamDisk::new(256, 16));
    disks.register(DEV, ram.clone()).unwrap();
    let cache = BufferCache::init(CacheConfig::new(vec![PoolConfig::new(1024, 2)]), disks).unwrap();

    let handle = cache.get(DEV, 3).unwrap();
    assert_eq!(handle.len(), 256);
    handle.fill(&[0xEE; 300]);
    cache.sync(handle).unwrap();
    assert_eq!(ram.peek(3), vec![0xEE; 256]);
    assert_eq!(ram.peek(4), vec![0; 256]);
}

#[test]
fn test_file_disk_persists_across_caches() {
    let dir = scratch_dir("filedisk");
    let path = dir.join("disk.img");

    {
        let disks = Arc::new(DiskTable::new());
        disks.register(DEV, Arc::new(FileDisk::create(&path, 512, 32).unwrap())).unwrap();
        let cache = BufferCache::init(CacheConfig::new(vec![PoolConfig::new(512, 4)]), disks).unwrap();
        for block in [0u64, 7, 31] {
            let handle = cache.get(DEV, block).unwrap();
            handle.fill(&pattern(block as u8));
            cache.release_modified(handle).unwrap();
        }
        cache.sync_device(DEV).unwrap();
        cache.shutdown();
    }

    let disks = Arc::new(DiskTable::new());
    disks.register(DEV, Arc::new(FileDisk::open(&path, 512).unwrap())).unwrap();
    let cache = BufferCache::init(CacheConfig::new(vec![PoolConfig::new(512, 4)]), disks).unwrap();
    for block in [0u64, 7, 31] {
        let handle = cache.read(DEV, block).unwrap();
        assert_eq!(handle.data(), pattern(block as u8));
        cache.release(handle).unwrap();
    }
    let handle = cache.read(DEV, 8).unwrap();
    assert!(handle.data().iter().all(|&b| b == 0));
    drop(handle);
    drop(cache);

    let _ = fs::remove_dir_all(&dir);
}
