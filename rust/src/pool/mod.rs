use std::fmt;

use serde::{Deserialize, Serialize};

use crate::avl::{AvlIndex, BufferKey};
use crate::chain::Chain;
use crate::config::PoolConfig;
use crate::descriptor::{BufferState, Descriptor};
use crate::disk::DeviceId;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolId(pub usize);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub block_size: usize,
    pub block_count: usize,
}

// Bookkeeping that disagrees with itself means the lock discipline was
// broken somewhere; carrying on would hand out corrupted buffers.
pub(crate) fn consistency_violation(what: impl fmt::Display) -> ! {
    log::error!("buffer cache consistency violation: {what}");
    panic!("buffer cache consistency violation: {what}");
}

// A BufferPool owns every descriptor for one block size, the index over the
// keyed ones, the free and LRU lists, and the admission counter bounding how
// many descriptors may be taken out of {free, LRU} at once.
pub struct BufferPool {
    id: PoolId,
    block_size: usize,
    // flat number of slot 0, used by lists that span pools
    base: usize,
    descriptors: Vec<Descriptor>,
    index: AvlIndex,
    free: Chain,
    lru: Chain,
    admission: usize,
}

impl BufferPool {
    pub fn new(id: PoolId, base: usize, config: PoolConfig) -> Result<Self, ConfigError> {
        let PoolConfig {
            block_size,
            block_count,
            mem_area,
        } = config;
        let pool = id.0;
        let bytes = block_size
            .checked_mul(block_count)
            .ok_or(ConfigError::NoMemory { pool, bytes: usize::MAX })?;

        let mut descriptors = Vec::new();
        descriptors
            .try_reserve_exact(block_count)
            .map_err(|_| ConfigError::NoMemory { pool, bytes })?;
        match mem_area {
            Some(area) => {
                if area.len() != bytes {
                    return Err(ConfigError::MemAreaSize {
                        pool,
                        expected: bytes,
                        actual: area.len(),
                    });
                }
                for chunk in area.chunks_exact(block_size) {
                    descriptors.push(Descriptor::new(chunk.into()));
                }
            }
            None => {
                for _ in 0..block_count {
                    let mut storage = Vec::new();
                    storage
                        .try_reserve_exact(block_size)
                        .map_err(|_| ConfigError::NoMemory { pool, bytes })?;
                    storage.resize(block_size, 0);
                    descriptors.push(Descriptor::new(storage.into_boxed_slice()));
                }
            }
        }

        let mut free = Chain::with_capacity(block_count);
        for slot in 0..block_count {
            if let Err(e) = free.append(slot) {
                consistency_violation(e);
            }
        }
        log::debug!("pool {id}: {block_count} buffers of {block_size} bytes");
        Ok(BufferPool {
            id,
            block_size,
            base,
            descriptors,
            index: AvlIndex::with_capacity(block_count),
            free,
            lru: Chain::with_capacity(block_count),
            admission: block_count,
        })
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn capacity(&self) -> usize {
        self.descriptors.len()
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn info(&self) -> PoolInfo {
        PoolInfo {
            block_size: self.block_size,
            block_count: self.capacity(),
        }
    }

    pub fn admission(&self) -> usize {
        self.admission
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    // LRU members, least recently used first.
    pub fn lru_order(&self) -> Vec<usize> {
        self.lru.order()
    }

    pub fn descriptor(&self, slot: usize) -> &Descriptor {
        &self.descriptors[slot]
    }

    pub(crate) fn descriptor_mut(&mut self, slot: usize) -> &mut Descriptor {
        &mut self.descriptors[slot]
    }

    pub fn descriptors(&self) -> impl Iterator<Item = (usize, &Descriptor)> {
        self.descriptors.iter().enumerate()
    }

    pub fn search(&self, key: BufferKey) -> Option<usize> {
        self.index.search(key)
    }

    // find_modified_in_range returns some modified descriptor keyed inside
    // device/[lo, hi], if there is one.
    pub fn find_modified_in_range(&self, device: DeviceId, lo: u64, hi: u64) -> Option<usize> {
        let descriptors = &self.descriptors;
        self.index
            .find_in_range(device, lo, hi, |slot| descriptors[slot].is_modified())
            .unwrap_or_else(|e| consistency_violation(e))
    }

    // modified_in_range lists every modified descriptor keyed inside
    // device/[lo, hi].
    pub fn modified_in_range(&self, device: DeviceId, lo: u64, hi: u64) -> Vec<usize> {
        let mut found = Vec::new();
        let descriptors = &self.descriptors;
        self.index
            .find_in_range(device, lo, hi, |slot| {
                if descriptors[slot].is_modified() {
                    found.push(slot);
                }
                false
            })
            .unwrap_or_else(|e| consistency_violation(e));
        found
    }

    // take_token consumes one admission token if any is left.
    pub(crate) fn take_token(&mut self) -> bool {
        if self.admission == 0 {
            return false;
        }
        self.admission -= 1;
        true
    }

    pub(crate) fn return_token(&mut self) {
        self.admission += 1;
    }

    // claim_clean takes an idle clean descriptor off the LRU list for a new
    // holder, consuming the admission token it held.
    pub(crate) fn claim_clean(&mut self, slot: usize) {
        if !self.lru.extract(slot) {
            consistency_violation(format_args!("pool {}: clean slot {slot} missing from LRU", self.id));
        }
        if !self.take_token() {
            consistency_violation(format_args!("pool {}: LRU member without admission token", self.id));
        }
    }

    // recycle hands out a descriptor for a new key: a never-used one if
    // available, otherwise the least recently used clean one, which is
    // dropped from the index. The caller already holds the admission token.
    pub(crate) fn recycle(&mut self) -> Option<(usize, Option<BufferKey>)> {
        if let Some(slot) = self.free.pop_front() {
            return Some((slot, None));
        }
        let slot = self.lru.pop_front()?;
        let evicted = self
            .index
            .remove(slot)
            .unwrap_or_else(|e| consistency_violation(e));
        Some((slot, Some(evicted)))
    }

    pub(crate) fn assign(&mut self, slot: usize, key: BufferKey) {
        self.descriptors[slot].assign(key);
        if let Err(e) = self.index.insert(slot, key) {
            consistency_violation(e);
        }
    }

    // park_clean puts an unreferenced, unmodified descriptor on the LRU tail
    // and gives its admission token back.
    pub(crate) fn park_clean(&mut self, slot: usize) {
        let state = self.descriptors[slot].park();
        debug_assert_eq!(state, BufferState::Clean);
        if let Err(e) = self.lru.append(slot) {
            consistency_violation(e);
        }
        self.admission += 1;
    }

    // check verifies the pool's share of the cache invariants. Dirty-list
    // membership is checked by the owner of that list.
    pub fn check(&self) -> Result<(), String> {
        let id = self.id;
        self.index.validate().map_err(|e| format!("pool {id}: {e}"))?;
        let mut keyed = 0;
        for (slot, d) in self.descriptors() {
            let on_free = self.free.contains(slot);
            let on_lru = self.lru.contains(slot);
            if let Some(key) = d.key() {
                keyed += 1;
                if self.index.search(key) != Some(slot) {
                    return Err(format!("pool {id}: slot {slot} ({key}) is not indexed"));
                }
            }
            let ok = match d.state() {
                BufferState::Free => d.key().is_none() && d.use_count() == 0 && on_free && !on_lru,
                BufferState::Clean => {
                    d.key().is_some() && d.use_count() == 0 && !d.is_modified() && on_lru && !on_free
                }
                BufferState::Dirty => {
                    d.key().is_some() && d.use_count() == 0 && d.is_modified() && !on_lru && !on_free
                }
                BufferState::InUse => d.key().is_some() && d.use_count() > 0 && !on_lru && !on_free,
            };
            if !ok {
                return Err(format!(
                    "pool {id}: slot {slot} is {:?} with use count {}, modified {}, free list {on_free}, LRU {on_lru}",
                    d.state(),
                    d.use_count(),
                    d.is_modified()
                ));
            }
        }
        if keyed != self.index.len() {
            return Err(format!("pool {id}: {keyed} keyed slots, {} indexed", self.index.len()));
        }
        if self.admission != self.free.len() + self.lru.len() {
            return Err(format!(
                "pool {id}: {} admission tokens for {} free and {} LRU buffers",
                self.admission,
                self.free.len(),
                self.lru.len()
            ));
        }
        Ok(())
    }
}
