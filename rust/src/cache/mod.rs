//! The cache context: pools, the global dirty list, the write-back task and
//! the access API built on top of them.
//!
//! All bookkeeping lives behind one mutex. Critical sections never block;
//! every wait (admission, in-flight transfer, write completion) goes through
//! a condition variable that gives the lock up.

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::avl::BufferKey;
use crate::chain::Chain;
use crate::config::CacheConfig;
use crate::descriptor::{BufferState, Descriptor};
use crate::disk::{self, BlockData, BlockDevice, DeviceId, DiskTable, IoResult, RequestKind};
use crate::error::{CacheError, IoError, Result};
use crate::pool::{BufferPool, PoolId, PoolInfo, consistency_violation};
use crate::swapout;

/// Counters maintained under the cache lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub reads: u64,
    pub writes: u64,
    pub read_errors: u64,
    pub write_errors: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BufferId {
    pub(crate) pool: usize,
    pub(crate) slot: usize,
}

pub(crate) struct CacheState {
    pub(crate) pools: Vec<BufferPool>,
    // Dirty descriptors across all pools, by flat number (pool base + slot),
    // oldest first.
    pub(crate) dirty: Chain,
    pub(crate) flush_pending: usize,
    pub(crate) running: bool,
    pub(crate) writer_active: bool,
    pub(crate) stats: CacheStats,
}

impl CacheState {
    pub(crate) fn descriptor(&self, id: BufferId) -> &Descriptor {
        self.pools[id.pool].descriptor(id.slot)
    }

    pub(crate) fn descriptor_mut(&mut self, id: BufferId) -> &mut Descriptor {
        self.pools[id.pool].descriptor_mut(id.slot)
    }

    pub(crate) fn locate(&self, flat: usize) -> BufferId {
        self.pools
            .iter()
            .enumerate()
            .find(|(_, p)| flat >= p.base() && flat < p.base() + p.capacity())
            .map(|(pool, p)| BufferId {
                pool,
                slot: flat - p.base(),
            })
            .unwrap_or_else(|| consistency_violation(format_args!("no buffer numbered {flat}")))
    }
}

struct PoolSignals {
    admission: Condvar,
    transfer: Box<[Condvar]>,
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<CacheState>,
    pub(crate) flush: Condvar,
    signals: Vec<PoolSignals>,
    layout: Vec<PoolInfo>,
    pub(crate) disks: Arc<DiskTable>,
}

impl Shared {
    pub(crate) fn transfer_signal(&self, id: BufferId) -> &Condvar {
        &self.signals[id.pool].transfer[id.slot]
    }

    // find_or_assign returns a pinned descriptor holding `key`, with no
    // transfer in flight.
    fn find_or_assign(&self, state: &mut MutexGuard<'_, CacheState>, pool: usize, key: BufferKey) -> BufferId {
        loop {
            if let Some(slot) = state.pools[pool].search(key) {
                let id = BufferId { pool, slot };
                match state.descriptor(id).state() {
                    BufferState::Clean => state.pools[pool].claim_clean(slot),
                    BufferState::Dirty => {
                        let flat = state.pools[pool].base() + slot;
                        if !state.dirty.extract(flat) {
                            consistency_violation(format_args!("dirty buffer {key} missing from dirty list"));
                        }
                        state.flush_pending -= 1;
                    }
                    BufferState::InUse => {}
                    BufferState::Free => consistency_violation(format_args!("free buffer indexed as {key}")),
                }
                state.descriptor_mut(id).pin();
                state.stats.hits += 1;
                log::trace!("hit {key} in pool {pool} slot {slot}");
                while state.descriptor(id).is_in_progress() {
                    self.transfer_signal(id).wait(state);
                }
                return id;
            }

            if !state.pools[pool].take_token() {
                log::trace!("pool {pool} fully assigned, waiting for {key}");
                self.signals[pool].admission.wait(state);
                // Someone else may have brought the block in meanwhile.
                continue;
            }
            let Some((slot, evicted)) = state.pools[pool].recycle() else {
                log::warn!("pool {pool}: admission token but no reusable buffer, retrying {key}");
                state.pools[pool].return_token();
                self.signals[pool].admission.wait(state);
                continue;
            };
            if let Some(old) = evicted {
                state.stats.evictions += 1;
                log::debug!("evict {old} from pool {pool} slot {slot}");
            }
            state.pools[pool].assign(slot, key);
            state.stats.misses += 1;
            log::debug!("assign {key} to pool {pool} slot {slot}");
            return BufferId { pool, slot };
        }
    }

    // park files an unreferenced descriptor on the dirty list or its pool's
    // LRU list.
    pub(crate) fn park(&self, state: &mut CacheState, id: BufferId) {
        if state.descriptor(id).is_modified() {
            state.descriptor_mut(id).park();
            let flat = state.pools[id.pool].base() + id.slot;
            if let Err(e) = state.dirty.append(flat) {
                consistency_violation(e);
            }
            state.flush_pending += 1;
            if !state.writer_active {
                log::warn!("buffer {flat} dirtied with no write-back task running");
            }
            self.flush.notify_one();
        } else {
            state.pools[id.pool].park_clean(id.slot);
            self.signals[id.pool].admission.notify_all();
        }
    }

    // release_locked drops one reference, optionally declaring the content
    // changed first. Returns the descriptor's dirty generation.
    fn release_locked(&self, state: &mut CacheState, id: BufferId, modified: bool) -> Result<u64> {
        let underflow = CacheError::UseCountUnderflow {
            pool: PoolId(id.pool),
            slot: id.slot,
        };
        let descriptor = state.descriptor_mut(id);
        if descriptor.use_count() == 0 {
            return Err(underflow);
        }
        let generation = if modified {
            descriptor.mark_modified()
        } else {
            descriptor.dirty_generation()
        };
        if descriptor.unpin().map_err(|_| underflow)? == 0 {
            self.park(state, id);
        }
        Ok(generation)
    }

    pub(crate) fn release(&self, id: BufferId, modified: bool) -> Result<u64> {
        let mut state = self.state.lock();
        self.release_locked(&mut state, id, modified)
    }

    // wait_written blocks until the write carrying `generation` of `key` has
    // completed and returns its outcome.
    fn wait_written(
        &self,
        state: &mut MutexGuard<'_, CacheState>,
        id: BufferId,
        key: BufferKey,
        generation: u64,
    ) -> IoResult {
        loop {
            let descriptor = state.descriptor(id);
            // Recycling needs the write to have finished.
            if descriptor.key() != Some(key) {
                return Ok(());
            }
            if descriptor.written_generation() >= generation {
                return descriptor.status().map_or(Ok(()), Err);
            }
            if !state.writer_active {
                return Err(IoError::new(IoError::ENXIO, "write-back task not running"));
            }
            self.transfer_signal(id).wait(state);
        }
    }
}

/// A referenced buffer. Dropping the handle releases it unmodified.
pub struct BufferHandle {
    shared: Arc<Shared>,
    id: BufferId,
    key: BufferKey,
    data: BlockData,
    length: usize,
    released: bool,
}

impl BufferHandle {
    pub fn device(&self) -> DeviceId {
        self.key.device
    }

    pub fn block(&self) -> u64 {
        self.key.block
    }

    /// The key as the caller asked for it, before partition translation.
    pub fn key(&self) -> BufferKey {
        self.key
    }

    pub fn pool(&self) -> PoolId {
        PoolId(self.id.pool)
    }

    /// Usable bytes: the device block size, which may be smaller than the
    /// pool's buffers.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.data.lock();
        f(&mut data[..self.length])
    }

    pub fn data(&self) -> Vec<u8> {
        self.with_data(|data| data.to_vec())
    }

    /// Copies `bytes` into the start of the block.
    pub fn fill(&self, bytes: &[u8]) {
        self.with_data(|data| {
            let n = bytes.len().min(data.len());
            data[..n].copy_from_slice(&bytes[..n]);
        })
    }

    fn finish(mut self, modified: bool) -> Result<u64> {
        self.released = true;
        self.shared.release(self.id, modified)
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("key", &self.key)
            .field("pool", &self.id.pool)
            .field("slot", &self.id.slot)
            .field("length", &self.length)
            .finish()
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.shared.release(self.id, false) {
                log::error!("dropping handle for {}: {e}", self.key);
            }
        }
    }
}

struct Target {
    pool: usize,
    physical: BufferKey,
    length: usize,
    driver: Arc<dyn BlockDevice>,
}

/// Block buffer cache over the disks of a [`DiskTable`].
pub struct BufferCache {
    pub(crate) shared: Arc<Shared>,
    swapout: Option<JoinHandle<()>>,
}

impl BufferCache {
    /// Builds every configured pool and starts the write-back task. Nothing
    /// survives a failure.
    pub fn init(config: CacheConfig, disks: Arc<DiskTable>) -> Result<Self> {
        config.validate()?;
        let CacheConfig {
            pools: configs,
            swapout: writer,
        } = config;

        let mut pools = Vec::with_capacity(configs.len());
        let mut base = 0;
        for (i, pool_config) in configs.into_iter().enumerate() {
            let pool = BufferPool::new(PoolId(i), base, pool_config)?;
            base += pool.capacity();
            pools.push(pool);
        }
        let signals = pools
            .iter()
            .map(|p| PoolSignals {
                admission: Condvar::new(),
                transfer: (0..p.capacity()).map(|_| Condvar::new()).collect(),
            })
            .collect();
        let layout = pools.iter().map(BufferPool::info).collect();

        let shared = Arc::new(Shared {
            state: Mutex::new(CacheState {
                pools,
                dirty: Chain::with_capacity(base),
                flush_pending: 0,
                running: true,
                writer_active: true,
                stats: CacheStats::default(),
            }),
            flush: Condvar::new(),
            signals,
            layout,
            disks,
        });
        let handle = swapout::spawn(shared.clone(), &writer).map_err(CacheError::Spawn)?;
        log::info!(
            "buffer cache up: {} pools, {base} buffers, write-back task {:?}",
            shared.layout.len(),
            writer.thread_name
        );
        Ok(BufferCache {
            shared,
            swapout: Some(handle),
        })
    }

    pub fn disks(&self) -> &Arc<DiskTable> {
        &self.shared.disks
    }

    fn resolve(&self, device: DeviceId, block: u64) -> Result<Target> {
        let info = self
            .shared
            .disks
            .lookup(device)
            .ok_or(CacheError::InvalidDevice(device))?;
        if block >= info.size {
            return Err(CacheError::BlockOutOfRange {
                device,
                block,
                count: info.size,
            });
        }
        let pool = self.find_pool_for_size(info.block_size)?;
        Ok(Target {
            pool: pool.0,
            physical: BufferKey::new(info.physical, info.start + block),
            length: info.block_size,
            driver: info.driver,
        })
    }

    fn handle(&self, state: &CacheState, id: BufferId, key: BufferKey, length: usize) -> BufferHandle {
        BufferHandle {
            shared: self.shared.clone(),
            id,
            key,
            data: state.descriptor(id).data().clone(),
            length,
            released: false,
        }
    }

    /// References the buffer for `block` without reading it. The content is
    /// whatever the buffer held unless the block was already cached.
    pub fn get(&self, device: DeviceId, block: u64) -> Result<BufferHandle> {
        let target = self.resolve(device, block)?;
        let mut state = self.shared.state.lock();
        let id = self.shared.find_or_assign(&mut state, target.pool, target.physical);
        Ok(self.handle(&state, id, BufferKey::new(device, block), target.length))
    }

    /// References the buffer for `block`, reading it from the device first
    /// unless its content is already valid.
    pub fn read(&self, device: DeviceId, block: u64) -> Result<BufferHandle> {
        let target = self.resolve(device, block)?;
        let key = BufferKey::new(device, block);
        let mut state = self.shared.state.lock();
        let id = self.shared.find_or_assign(&mut state, target.pool, target.physical);
        loop {
            let descriptor = state.descriptor(id);
            if descriptor.is_actual() {
                break;
            }
            if descriptor.is_in_progress() {
                self.shared.transfer_signal(id).wait(&mut state);
                continue;
            }
            // Holders from `get` may write the buffer while the device is
            // busy, so the read lands in scratch storage first.
            let generation = descriptor.dirty_generation();
            let scratch: BlockData = Arc::new(Mutex::new(vec![0u8; target.length].into_boxed_slice()));
            state.descriptor_mut(id).begin_transfer();
            let status = MutexGuard::unlocked(&mut state, || {
                disk::transfer(
                    target.driver.as_ref(),
                    RequestKind::Read,
                    target.physical.block,
                    scratch.clone(),
                    target.length,
                )
            });
            state.stats.reads += 1;
            let descriptor = state.descriptor_mut(id);
            if descriptor.finish_read(generation, status) {
                descriptor.data().lock()[..target.length].copy_from_slice(&scratch.lock()[..target.length]);
            }
            self.shared.transfer_signal(id).notify_all();
            if let (Err(source), false) = (status, state.descriptor(id).is_actual()) {
                state.stats.read_errors += 1;
                log::warn!("read of {key} failed: {source}");
                self.shared.release_locked(&mut state, id, false)?;
                return Err(CacheError::Io { key, source });
            }
        }
        Ok(self.handle(&state, id, key, target.length))
    }

    pub fn release(&self, handle: BufferHandle) -> Result<()> {
        handle.finish(false).map(|_| ())
    }

    /// Releases the buffer after declaring its content changed; the
    /// write-back task will write it out.
    pub fn release_modified(&self, handle: BufferHandle) -> Result<()> {
        handle.finish(true).map(|_| ())
    }

    /// Like [`BufferCache::release_modified`], then waits until this
    /// content has reached the device.
    pub fn sync(&self, mut handle: BufferHandle) -> Result<()> {
        handle.released = true;
        let key = handle.key;
        let id = handle.id;
        let mut state = self.shared.state.lock();
        let physical = state
            .descriptor(id)
            .key()
            .unwrap_or_else(|| consistency_violation(format_args!("referenced buffer for {key} has no key")));
        let generation = self.shared.release_locked(&mut state, id, true)?;
        self.shared
            .wait_written(&mut state, id, physical, generation)
            .map_err(|source| CacheError::Io { key, source })
    }

    /// Waits until no buffer of `device` is modified. Every buffer modified
    /// when the call starts is waited for; buffers dirtied while it runs may
    /// or may not be. All of them are waited on even after a failure, and
    /// the first failure is returned.
    pub fn sync_device(&self, device: DeviceId) -> Result<()> {
        let info = self
            .shared
            .disks
            .lookup(device)
            .ok_or(CacheError::InvalidDevice(device))?;
        let Some((lo, hi)) = info.physical_range() else {
            return Ok(());
        };
        let mut state = self.shared.state.lock();
        let snapshot = |state: &CacheState, id: BufferId| {
            let descriptor = state.descriptor(id);
            match descriptor.key() {
                Some(key) => (id, key, descriptor.dirty_generation()),
                None => consistency_violation(format_args!("modified buffer without a key")),
            }
        };

        let mut pending: Vec<_> = state
            .pools
            .iter()
            .enumerate()
            .flat_map(|(pool, p)| {
                p.modified_in_range(info.physical, lo, hi)
                    .into_iter()
                    .map(move |slot| BufferId { pool, slot })
            })
            .map(|id| snapshot(&*state, id))
            .collect();
        log::debug!("sync {device}: {} modified buffers", pending.len());

        let mut first_error = None;
        loop {
            for (id, physical, generation) in pending.drain(..) {
                if let Err(source) = self.shared.wait_written(&mut state, id, physical, generation) {
                    let error = CacheError::Io {
                        key: BufferKey::new(device, physical.block - info.start),
                        source,
                    };
                    if !state.writer_active {
                        return Err(error);
                    }
                    first_error.get_or_insert(error);
                }
            }
            // Pick up whatever was dirtied meanwhile.
            let found = state.pools.iter().enumerate().find_map(|(pool, p)| {
                p.find_modified_in_range(info.physical, lo, hi)
                    .map(|slot| BufferId { pool, slot })
            });
            match found {
                Some(id) => pending.push(snapshot(&*state, id)),
                None => break,
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// The smallest pool whose buffers hold `size` bytes.
    pub fn find_pool_for_size(&self, size: usize) -> Result<PoolId> {
        if !size.is_power_of_two() {
            return Err(CacheError::InvalidBlockSize(size));
        }
        self.shared
            .layout
            .iter()
            .enumerate()
            .filter(|(_, info)| info.block_size >= size)
            .min_by_key(|(_, info)| info.block_size)
            .map(|(i, _)| PoolId(i))
            .ok_or(CacheError::PoolNotFound(size))
    }

    pub fn pool_info(&self, pool: PoolId) -> Result<PoolInfo> {
        self.shared
            .layout
            .get(pool.0)
            .copied()
            .ok_or(CacheError::InvalidPool(pool))
    }

    pub fn pool_count(&self) -> usize {
        self.shared.layout.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.shared.state.lock().stats
    }

    /// Stops the write-back task once the dirty list has drained.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(task) = self.swapout.take() else {
            return;
        };
        self.shared.state.lock().running = false;
        self.shared.flush.notify_all();
        if task.join().is_err() {
            log::error!("write-back task panicked");
        }
        log::info!("buffer cache down: {:?}", self.stats());
    }
}

impl Drop for BufferCache {
    fn drop(&mut self) {
        self.stop();
    }
}
