//! # blockcache - Block Buffer Cache with Deferred Write-Back
//!
//! A cache of fixed-size block buffers sitting between filesystem code and
//! raw block devices. It maps `(device, block)` pairs to in-memory buffers,
//! serves repeated reads without repeated I/O, and writes modified buffers
//! back from a dedicated background thread.
//!
//! ## Features
//!
//! - **Pools by Block Size**: One pool of descriptors per configured block size; a device is
//!   served by the smallest pool whose buffers can hold its blocks
//! - **Balanced Index**: Cached blocks are found through an AVL tree per pool, also used to
//!   locate a device's modified buffers when syncing
//! - **LRU Eviction**: Clean idle buffers are recycled least recently used first; modified
//!   buffers are never evicted before they reach the device
//! - **Admission Backpressure**: Callers block while every buffer of a pool is referenced
//! - **Write-Back Task**: Modified buffers are written in the order they were released
//! - **Partitions**: Logical devices mapped onto a window of a physical disk share its buffers
//!
//! ## Basic Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use blockcache::cache::BufferCache;
//! use blockcache::config::{CacheConfig, PoolConfig};
//! use blockcache::disk::{DeviceId, DiskTable, RamDisk};
//!
//! let disks = Arc::new(DiskTable::new());
//! let dev = DeviceId::new(3, 0);
//! disks.register(dev, Arc::new(RamDisk::new(512, 64))).unwrap();
//!
//! let config = CacheConfig::new(vec![PoolConfig::new(512, 8)]);
//! let cache = BufferCache::init(config, disks).unwrap();
//!
//! // Overwrite block 10 entirely, no need to read it first
//! let handle = cache.get(dev, 10).unwrap();
//! handle.fill(b"hello, block");
//! cache.release_modified(handle).unwrap();
//!
//! // Wait for the write-back task to put it on the disk
//! cache.sync_device(dev).unwrap();
//!
//! let handle = cache.read(dev, 10).unwrap();
//! assert_eq!(&handle.data()[..12], b"hello, block");
//! cache.release(handle).unwrap();
//!
//! cache.shutdown();
//! ```
//!
//! ## Synchronous Writes
//!
//! [`cache::BufferCache::sync`] releases a buffer as modified and waits until
//! that content is on the device, reporting the transfer error if the write
//! failed:
//!
//! ```rust
//! use std::sync::Arc;
//! use blockcache::cache::BufferCache;
//! use blockcache::config::{CacheConfig, PoolConfig};
//! use blockcache::disk::{DeviceId, DiskTable, RamDisk};
//!
//! let disks = Arc::new(DiskTable::new());
//! let ram = Arc::new(RamDisk::new(1024, 16));
//! let dev = DeviceId::new(8, 0);
//! disks.register(dev, ram.clone()).unwrap();
//! let cache = BufferCache::init(CacheConfig::new(vec![PoolConfig::new(1024, 4)]), disks).unwrap();
//!
//! let handle = cache.read(dev, 2).unwrap();
//! handle.with_data(|data| data[0] = 0xA5);
//! cache.sync(handle).unwrap();
//! assert_eq!(ram.peek(2)[0], 0xA5);
//!
//! ram.fail_block(3);
//! let handle = cache.get(dev, 3).unwrap();
//! assert!(cache.sync(handle).is_err());
//! ```
//!
//! ## Configuration
//!
//! Pools can be described in JSON:
//!
//! ```rust
//! use blockcache::config::CacheConfig;
//!
//! let config = CacheConfig::from_json(r#"{
//!     "pools": [
//!         { "block_size": 512, "block_count": 256 },
//!         { "block_size": 4096, "block_count": 64 }
//!     ],
//!     "swapout": { "thread_name": "swapout", "stack_size": 65536 }
//! }"#).unwrap();
//! assert_eq!(config.pools.len(), 2);
//! ```
//!
//! ## Inspection
//!
//! [`show`] lists buffers with their state, filtered by any combination of `modified`,
//! `in_progress`, `actual` or `used`, and
//! [`cache::BufferCache::check_consistency`] verifies every list, counter
//! and index invariant.
//!
//! ## Performance Analysis
//!
//! ```bash
//! # Run standalone workload analysis
//! cargo run --bin benchmark_runner
//!
//! # Run criterion benchmarks
//! cargo bench
//! ```

pub mod avl;
pub mod cache;
pub mod chain;
pub mod config;
pub mod descriptor;
pub mod disk;
pub mod error;
pub mod pool;
pub mod show;
mod swapout;

pub use cache::{BufferCache, BufferHandle, CacheStats};
pub use error::{CacheError, ConfigError, IoError, Result};
