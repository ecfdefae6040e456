//! Inspection of the cache's buffers: per-buffer snapshots, per-pool
//! headers and a printable report, plus a full invariant check.

use std::fmt;
use std::ops::BitOr;

use serde::Serialize;

use crate::avl::BufferKey;
use crate::cache::{BufferCache, CacheState};
use crate::descriptor::{BufferState, Descriptor};
use crate::disk::DeviceId;
use crate::error::{CacheError, Result};
use crate::pool::{BufferPool, PoolId};

/// Snapshot of one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferInfo {
    pub pool: PoolId,
    pub slot: usize,
    pub key: Option<BufferKey>,
    pub state: BufferState,
    pub modified: bool,
    pub actual: bool,
    pub in_progress: bool,
    pub use_count: u32,
    /// errno of the last failed transfer.
    pub status: Option<i32>,
}

impl BufferInfo {
    fn capture(pool: PoolId, slot: usize, d: &Descriptor) -> Self {
        BufferInfo {
            pool,
            slot,
            key: d.key(),
            state: d.state(),
            modified: d.is_modified(),
            actual: d.is_actual(),
            in_progress: d.is_in_progress(),
            use_count: d.use_count(),
            status: d.status().map(|e| e.errno),
        }
    }
}

/// Selects buffers by their flags. Every flag that is set must hold; with no
/// flag set every buffer matches. Flags combine with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ShowFilter {
    pub modified: bool,
    pub in_progress: bool,
    pub actual: bool,
    pub used: bool,
}

impl ShowFilter {
    pub const ALL: ShowFilter = ShowFilter {
        modified: false,
        in_progress: false,
        actual: false,
        used: false,
    };
    pub const MODIFIED: ShowFilter = ShowFilter {
        modified: true,
        ..ShowFilter::ALL
    };
    pub const IN_PROGRESS: ShowFilter = ShowFilter {
        in_progress: true,
        ..ShowFilter::ALL
    };
    pub const ACTUAL: ShowFilter = ShowFilter {
        actual: true,
        ..ShowFilter::ALL
    };
    pub const USED: ShowFilter = ShowFilter {
        used: true,
        ..ShowFilter::ALL
    };

    pub fn matches(&self, info: &BufferInfo) -> bool {
        !(self.modified && !info.modified
            || self.in_progress && !info.in_progress
            || self.actual && !info.actual
            || self.used && info.use_count == 0)
    }
}

impl BitOr for ShowFilter {
    type Output = ShowFilter;

    fn bitor(self, rhs: ShowFilter) -> ShowFilter {
        ShowFilter {
            modified: self.modified || rhs.modified,
            in_progress: self.in_progress || rhs.in_progress,
            actual: self.actual || rhs.actual,
            used: self.used || rhs.used,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolHeader {
    pub pool: PoolId,
    pub block_size: usize,
    pub block_count: usize,
    pub free: usize,
    pub lru: usize,
    pub dirty: usize,
    pub in_use: usize,
    pub admission: usize,
}

impl PoolHeader {
    fn capture(pool: &BufferPool) -> Self {
        let count = |state: BufferState| pool.descriptors().filter(|(_, d)| d.state() == state).count();
        PoolHeader {
            pool: pool.id(),
            block_size: pool.block_size(),
            block_count: pool.capacity(),
            free: pool.free_len(),
            lru: pool.lru_order().len(),
            dirty: count(BufferState::Dirty),
            in_use: count(BufferState::InUse),
            admission: pool.admission(),
        }
    }
}

impl fmt::Display for PoolHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            " pool {:>3}: blksize={:>5} nblks={:>5} free={} lru={} mod={} used={} tokens={}",
            self.pool.0,
            self.block_size,
            self.block_count,
            self.free,
            self.lru,
            self.dirty,
            self.in_use,
            self.admission
        )
    }
}

/// Printable listing of the buffers matching a filter.
#[derive(Debug, Clone, Serialize)]
pub struct BufferReport {
    pub filter: ShowFilter,
    pub pools: Vec<(PoolHeader, Vec<BufferInfo>)>,
    pub suppressed: usize,
}

impl BufferReport {
    pub fn matched(&self) -> usize {
        self.pools.iter().map(|(_, buffers)| buffers.len()).sum()
    }
}

const RULE: &str = "------------------------------------------------------------------------------";

impl fmt::Display for BufferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (header, buffers) in &self.pools {
            writeln!(f, "{RULE}")?;
            writeln!(f, "{header}")?;
            writeln!(f, "{RULE}")?;
            writeln!(f, "INDEX CHN DEVICE    BLOCK USE STA ERRNO")?;
            for info in buffers {
                let chain = match info.state {
                    BufferState::Free => "FRE",
                    BufferState::Clean => "LRU",
                    BufferState::Dirty => "MOD",
                    BufferState::InUse => "---",
                };
                let (device, block) = match info.key {
                    Some(key) => (key.device.to_string(), key.block.to_string()),
                    None => ("-".to_string(), "-".to_string()),
                };
                writeln!(
                    f,
                    "{:>5} {chain} {device:<7} {block:>8} {:>3} {}{}{} {}",
                    info.slot,
                    info.use_count,
                    if info.modified { 'M' } else { '.' },
                    if info.in_progress { 'P' } else { '.' },
                    if info.actual { 'A' } else { '.' },
                    info.status.map_or_else(|| "-".to_string(), |errno| errno.to_string()),
                )?;
            }
        }
        writeln!(f, "{} buffers printed, {} suppressed", self.matched(), self.suppressed)
    }
}

fn check_state(state: &CacheState) -> std::result::Result<(), String> {
    for pool in &state.pools {
        pool.check()?;
        for (slot, d) in pool.descriptors() {
            let flat = pool.base() + slot;
            let on_dirty = state.dirty.contains(flat);
            if on_dirty != (d.state() == BufferState::Dirty) {
                return Err(format!(
                    "pool {}: slot {slot} is {:?} but dirty list membership is {on_dirty}",
                    pool.id(),
                    d.state()
                ));
            }
        }
    }
    if state.flush_pending != state.dirty.len() {
        return Err(format!(
            "{} flushes pending for {} dirty buffers",
            state.flush_pending,
            state.dirty.len()
        ));
    }
    Ok(())
}

impl BufferCache {
    /// Snapshots the buffers of `pool` (every pool if None) that pass
    /// `filter`.
    pub fn buffer_infos(&self, pool: Option<PoolId>, filter: ShowFilter) -> Result<Vec<BufferInfo>> {
        Ok(self
            .report(pool, filter)?
            .pools
            .into_iter()
            .flat_map(|(_, buffers)| buffers)
            .collect())
    }

    /// Snapshot of the buffer currently holding `device`/`block`, if cached.
    pub fn buffer_info(&self, device: DeviceId, block: u64) -> Result<Option<BufferInfo>> {
        let info = self
            .disks()
            .lookup(device)
            .ok_or(CacheError::InvalidDevice(device))?;
        let key = BufferKey::new(info.physical, info.start + block);
        let state = self.shared.state.lock();
        Ok(state.pools.iter().find_map(|p| {
            p.search(key)
                .map(|slot| BufferInfo::capture(p.id(), slot, p.descriptor(slot)))
        }))
    }

    pub fn pool_headers(&self) -> Vec<PoolHeader> {
        let state = self.shared.state.lock();
        state.pools.iter().map(PoolHeader::capture).collect()
    }

    pub fn report(&self, pool: Option<PoolId>, filter: ShowFilter) -> Result<BufferReport> {
        if let Some(id) = pool {
            self.pool_info(id)?;
        }
        let state = self.shared.state.lock();
        let mut report = BufferReport {
            filter,
            pools: Vec::new(),
            suppressed: 0,
        };
        for p in state.pools.iter().filter(|p| pool.is_none_or(|id| p.id() == id)) {
            let mut buffers = Vec::new();
            for (slot, d) in p.descriptors() {
                let info = BufferInfo::capture(p.id(), slot, d);
                if filter.matches(&info) {
                    buffers.push(info);
                } else {
                    report.suppressed += 1;
                }
            }
            report.pools.push((PoolHeader::capture(p), buffers));
        }
        Ok(report)
    }

    /// Verifies every bookkeeping invariant and describes the first one
    /// found broken.
    pub fn check_consistency(&self) -> std::result::Result<(), String> {
        check_state(&self.shared.state.lock())
    }
}
