use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use super::{BlockDevice, BlockRequest, IoResult, RequestKind};
use crate::error::IoError;

/// How a [`RamDisk`] delivers completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// The callback runs inside `submit`, on the caller's thread.
    Inline,
    /// Requests queue up and a separate completion thread finishes them,
    /// the way an interrupt-driven controller would.
    Deferred,
}

struct RamDiskInner {
    block_size: usize,
    block_count: u64,
    blocks: Mutex<Vec<u8>>,
    faulty: Mutex<HashSet<u64>>,
    paused: Mutex<bool>,
    resumed: Condvar,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl RamDiskInner {
    fn wait_until_running(&self) {
        let mut paused = self.paused.lock();
        while *paused {
            self.resumed.wait(&mut paused);
        }
    }

    fn perform(&self, request: BlockRequest) {
        self.wait_until_running();
        let status = self.copy(&request);
        request.complete(status);
    }

    fn copy(&self, request: &BlockRequest) -> IoResult {
        let faulty = self.faulty.lock();
        let mut blocks = self.blocks.lock();
        for (i, sg) in request.buffers.iter().enumerate() {
            let block = request.start + i as u64;
            if faulty.contains(&block) {
                log::debug!("ramdisk: injected fault on block {block}");
                return Err(IoError::transfer());
            }
            let length = sg.length.min(self.block_size);
            let offset = block as usize * self.block_size;
            let mut data = sg.data.lock();
            match request.kind {
                RequestKind::Read => {
                    data[..length].copy_from_slice(&blocks[offset..offset + length]);
                    self.reads.fetch_add(1, Ordering::Relaxed);
                }
                RequestKind::Write => {
                    blocks[offset..offset + length].copy_from_slice(&data[..length]);
                    self.writes.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }
}

/// Memory-backed block device with fault injection and request counters.
pub struct RamDisk {
    inner: Arc<RamDiskInner>,
    queue: Option<mpsc::Sender<BlockRequest>>,
    worker: Option<JoinHandle<()>>,
}

impl RamDisk {
    /// A zero-filled disk completing requests inline.
    pub fn new(block_size: usize, block_count: u64) -> Self {
        Self::with_mode(block_size, block_count, CompletionMode::Inline)
    }

    pub fn with_mode(block_size: usize, block_count: u64, mode: CompletionMode) -> Self {
        let inner = Arc::new(RamDiskInner {
            block_size,
            block_count,
            blocks: Mutex::new(vec![0u8; block_size * block_count as usize]),
            faulty: Mutex::new(HashSet::new()),
            paused: Mutex::new(false),
            resumed: Condvar::new(),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        });
        let (queue, worker) = match mode {
            CompletionMode::Inline => (None, None),
            CompletionMode::Deferred => {
                let (tx, rx) = mpsc::channel::<BlockRequest>();
                let irq = inner.clone();
                let worker = thread::Builder::new()
                    .name("ramdisk-irq".to_string())
                    .spawn(move || {
                        for request in rx {
                            irq.perform(request);
                        }
                    })
                    .ok();
                // Without a completion thread fall back to inline delivery.
                match worker {
                    Some(worker) => (Some(tx), Some(worker)),
                    None => (None, None),
                }
            }
        };
        RamDisk {
            inner,
            queue,
            worker,
        }
    }

    /// Makes every transfer touching `block` fail until healed.
    pub fn fail_block(&self, block: u64) {
        self.inner.faulty.lock().insert(block);
    }

    pub fn heal_block(&self, block: u64) {
        self.inner.faulty.lock().remove(&block);
    }

    /// Holds back completions until [`RamDisk::resume`].
    pub fn pause(&self) {
        *self.inner.paused.lock() = true;
    }

    pub fn resume(&self) {
        *self.inner.paused.lock() = false;
        self.inner.resumed.notify_all();
    }

    /// Number of blocks read from the medium so far.
    pub fn reads(&self) -> u64 {
        self.inner.reads.load(Ordering::Relaxed)
    }

    /// Number of blocks written to the medium so far.
    pub fn writes(&self) -> u64 {
        self.inner.writes.load(Ordering::Relaxed)
    }

    /// Contents of `block` straight from the medium, bypassing any cache.
    pub fn peek(&self, block: u64) -> Vec<u8> {
        let offset = block as usize * self.inner.block_size;
        self.inner.blocks.lock()[offset..offset + self.inner.block_size].to_vec()
    }

    /// Overwrites `block` on the medium, bypassing any cache.
    pub fn poke(&self, block: u64, bytes: &[u8]) {
        let offset = block as usize * self.inner.block_size;
        let length = bytes.len().min(self.inner.block_size);
        self.inner.blocks.lock()[offset..offset + length].copy_from_slice(&bytes[..length]);
    }
}

impl BlockDevice for RamDisk {
    fn block_size(&self) -> usize {
        self.inner.block_size
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count
    }

    fn submit(&self, request: BlockRequest) -> IoResult {
        let in_range = request
            .start
            .checked_add(request.count())
            .is_some_and(|end| end <= self.inner.block_count);
        if !in_range {
            return Err(IoError::new(IoError::EINVAL, "request beyond end of disk"));
        }
        match &self.queue {
            Some(queue) => queue
                .send(request)
                .map_err(|_| IoError::new(IoError::ENXIO, "completion thread gone")),
            None => {
                self.inner.perform(request);
                Ok(())
            }
        }
    }
}

impl Drop for RamDisk {
    fn drop(&mut self) {
        self.resume();
        self.queue.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
