//! The block device interface the cache consumes, plus a small disk table
//! mapping device numbers to drivers and logical partitions.
//!
//! A driver receives [`BlockRequest`]s through [`BlockDevice::submit`] and
//! reports completion by calling [`BlockRequest::complete`], possibly from a
//! different thread (the moral equivalent of an interrupt handler). The
//! completion callback never touches cache bookkeeping; it only resolves a
//! one-shot [`Completion`] the submitting thread is blocked on.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::mpsc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, IoError, Result};

mod filedisk;
mod ramdisk;

pub use filedisk::FileDisk;
pub use ramdisk::{CompletionMode, RamDisk};

/// Storage of one cached block, shared between the cache and the driver
/// while a transfer is outstanding.
pub type BlockData = Arc<Mutex<Box<[u8]>>>;

pub type IoResult = std::result::Result<(), IoError>;

/// Device number, split into major (driver) and minor (unit) parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub major: u32,
    pub minor: u32,
}

impl DeviceId {
    pub const fn new(major: u32, minor: u32) -> Self {
        DeviceId { major, minor }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Read,
    Write,
}

/// One scatter/gather element of a request.
#[derive(Debug, Clone)]
pub struct SgBuffer {
    pub length: usize,
    pub data: BlockData,
}

type DoneFn = Box<dyn FnOnce(IoResult) + Send>;

/// A transfer of `buffers.len()` consecutive blocks starting at `start`.
pub struct BlockRequest {
    pub kind: RequestKind,
    pub start: u64,
    pub buffers: Vec<SgBuffer>,
    done: DoneFn,
}

impl BlockRequest {
    pub fn new<F>(kind: RequestKind, start: u64, buffers: Vec<SgBuffer>, done: F) -> Self
    where
        F: FnOnce(IoResult) + Send + 'static,
    {
        BlockRequest {
            kind,
            start,
            buffers,
            done: Box::new(done),
        }
    }

    pub fn count(&self) -> u64 {
        self.buffers.len() as u64
    }

    /// Reports the outcome to whoever submitted the request.
    pub fn complete(self, status: IoResult) {
        (self.done)(status)
    }
}

impl fmt::Debug for BlockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRequest")
            .field("kind", &self.kind)
            .field("start", &self.start)
            .field("count", &self.buffers.len())
            .finish_non_exhaustive()
    }
}

pub trait BlockDevice: Send + Sync {
    fn block_size(&self) -> usize;

    fn block_count(&self) -> u64;

    /// Queues a transfer. On `Err` the request was refused and its
    /// completion callback will never run.
    fn submit(&self, request: BlockRequest) -> IoResult;
}

/// One-shot rendezvous between a submitter and a completion callback.
pub struct Completion {
    tx: mpsc::SyncSender<IoResult>,
    rx: mpsc::Receiver<IoResult>,
}

impl Completion {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        Completion { tx, rx }
    }

    pub fn callback(&self) -> impl FnOnce(IoResult) + Send + 'static {
        let tx = self.tx.clone();
        move |status| {
            // The waiter only goes away if it gave up on the request.
            let _ = tx.send(status);
        }
    }

    /// Blocks until the callback fires. A request dropped by its driver
    /// without completing counts as a failed transfer.
    pub fn wait(self) -> IoResult {
        drop(self.tx);
        self.rx
            .recv()
            .unwrap_or(Err(IoError::new(IoError::EIO, "request dropped by driver")))
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// Submits a single-block transfer and blocks until the driver completes it.
pub fn transfer(
    driver: &dyn BlockDevice,
    kind: RequestKind,
    block: u64,
    data: BlockData,
    length: usize,
) -> IoResult {
    let completion = Completion::new();
    let request = BlockRequest::new(
        kind,
        block,
        vec![SgBuffer { length, data }],
        completion.callback(),
    );
    driver.submit(request)?;
    completion.wait()
}

/// Resolved view of a device number: the physical disk it lives on and the
/// window of that disk it covers.
#[derive(Clone)]
pub struct DiskInfo {
    pub device: DeviceId,
    pub physical: DeviceId,
    pub start: u64,
    pub size: u64,
    pub block_size: usize,
    pub driver: Arc<dyn BlockDevice>,
}

impl DiskInfo {
    pub fn is_partition(&self) -> bool {
        self.device != self.physical
    }

    /// Inclusive physical block range, or None for an empty disk.
    pub fn physical_range(&self) -> Option<(u64, u64)> {
        (self.size > 0).then(|| (self.start, self.start + self.size - 1))
    }
}

impl fmt::Debug for DiskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskInfo")
            .field("device", &self.device)
            .field("physical", &self.physical)
            .field("start", &self.start)
            .field("size", &self.size)
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

enum DiskEntry {
    Physical(Arc<dyn BlockDevice>),
    Partition {
        physical: DeviceId,
        start: u64,
        size: u64,
    },
}

#[derive(Default)]
pub struct DiskTable {
    disks: RwLock<HashMap<DeviceId, DiskEntry>>,
}

impl DiskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, device: DeviceId, driver: Arc<dyn BlockDevice>) -> Result<()> {
        let mut disks = self.disks.write();
        if disks.contains_key(&device) {
            return Err(CacheError::DeviceExists(device));
        }
        log::debug!(
            "disk {device}: {} blocks of {} bytes",
            driver.block_count(),
            driver.block_size()
        );
        disks.insert(device, DiskEntry::Physical(driver));
        Ok(())
    }

    /// Registers `device` as blocks `start..start + size` of `physical`.
    pub fn register_partition(
        &self,
        device: DeviceId,
        physical: DeviceId,
        start: u64,
        size: u64,
    ) -> Result<()> {
        let mut disks = self.disks.write();
        if disks.contains_key(&device) {
            return Err(CacheError::DeviceExists(device));
        }
        let count = match disks.get(&physical) {
            Some(DiskEntry::Physical(driver)) => driver.block_count(),
            _ => return Err(CacheError::InvalidDevice(physical)),
        };
        let end = start.checked_add(size).filter(|end| *end <= count);
        if end.is_none() {
            return Err(CacheError::BlockOutOfRange {
                device: physical,
                block: start.saturating_add(size),
                count,
            });
        }
        log::debug!("partition {device}: blocks {start}..+{size} of {physical}");
        disks.insert(
            device,
            DiskEntry::Partition {
                physical,
                start,
                size,
            },
        );
        Ok(())
    }

    pub fn unregister(&self, device: DeviceId) -> bool {
        self.disks.write().remove(&device).is_some()
    }

    pub fn lookup(&self, device: DeviceId) -> Option<DiskInfo> {
        let disks = self.disks.read();
        match disks.get(&device)? {
            DiskEntry::Physical(driver) => Some(DiskInfo {
                device,
                physical: device,
                start: 0,
                size: driver.block_count(),
                block_size: driver.block_size(),
                driver: driver.clone(),
            }),
            DiskEntry::Partition {
                physical,
                start,
                size,
            } => match disks.get(physical)? {
                DiskEntry::Physical(driver) => Some(DiskInfo {
                    device,
                    physical: *physical,
                    start: *start,
                    size: *size,
                    block_size: driver.block_size(),
                    driver: driver.clone(),
                }),
                DiskEntry::Partition { .. } => None,
            },
        }
    }
}
