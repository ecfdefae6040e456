// The write-back task: one thread per cache draining the dirty list in FIFO
// order, one block at a time.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::avl::BufferKey;
use crate::cache::{BufferId, Shared};
use crate::config::SwapoutConfig;
use crate::disk::{self, BlockData, RequestKind};
use crate::error::IoError;
use crate::pool::consistency_violation;

struct Job {
    id: BufferId,
    key: BufferKey,
    generation: u64,
    data: BlockData,
}

pub(crate) fn spawn(shared: Arc<Shared>, config: &SwapoutConfig) -> io::Result<JoinHandle<()>> {
    let mut builder = thread::Builder::new().name(config.thread_name.clone());
    if let Some(size) = config.stack_size {
        builder = builder.stack_size(size);
    }
    builder.spawn(move || run(&shared))
}

fn run(shared: &Shared) {
    log::debug!("write-back task started");
    while let Some(job) = next_job(shared) {
        write_back(shared, job);
    }
    shared.state.lock().writer_active = false;
    log::debug!("write-back task stopped");
}

// next_job pins the oldest dirty buffer for writing. It returns None once
// the cache is shutting down and nothing is left to write.
fn next_job(shared: &Shared) -> Option<Job> {
    let mut state = shared.state.lock();
    loop {
        if let Some(flat) = state.dirty.pop_front() {
            state.flush_pending -= 1;
            let id = state.locate(flat);
            let descriptor = state.descriptor_mut(id);
            let Some(key) = descriptor.key() else {
                consistency_violation(format_args!("dirty buffer {flat} has no key"));
            };
            descriptor.pin();
            descriptor.begin_transfer();
            return Some(Job {
                id,
                key,
                generation: descriptor.dirty_generation(),
                data: descriptor.data().clone(),
            });
        }
        if !state.running {
            return None;
        }
        shared.flush.wait(&mut state);
    }
}

fn write_back(shared: &Shared, job: Job) {
    let Job {
        id,
        key,
        generation,
        data,
    } = job;
    let status = match shared.disks.lookup(key.device) {
        Some(info) => disk::transfer(info.driver.as_ref(), RequestKind::Write, key.block, data, info.block_size),
        None => Err(IoError::new(IoError::ENXIO, "device no longer registered")),
    };
    match status {
        Ok(()) => log::debug!("wrote back {key}"),
        Err(e) => log::warn!("write-back of {key} failed: {e}"),
    }

    let mut state = shared.state.lock();
    state.stats.writes += 1;
    if status.is_err() {
        state.stats.write_errors += 1;
    }
    let descriptor = state.descriptor_mut(id);
    descriptor.finish_write(generation, status);
    let remaining = descriptor
        .unpin()
        .unwrap_or_else(|_| consistency_violation(format_args!("write-back lost its reference on {key}")));
    shared.transfer_signal(id).notify_all();
    // Parking re-queues the buffer if it was changed again meanwhile.
    if remaining == 0 {
        shared.park(&mut state, id);
    }
}
