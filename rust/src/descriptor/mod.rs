use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::avl::BufferKey;
use crate::disk::{BlockData, IoResult};
use crate::error::IoError;

// Which list a descriptor sits on follows from its state: Free on the pool's
// free list, Clean on the pool's LRU list, Dirty on the global dirty list,
// InUse on none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferState {
    Free,
    Clean,
    Dirty,
    InUse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Underflow;

// A Descriptor is one cache slot: the storage for a single block plus the
// bookkeeping saying which block it holds and what shape it is in.
#[derive(Debug)]
pub struct Descriptor {
    key: Option<BufferKey>,
    state: BufferState,
    data: BlockData,
    modified: bool,
    actual: bool,
    in_progress: bool,
    use_count: u32,
    status: Option<IoError>,
    // Bumped every time a holder declares the content changed.
    dirty_generation: u64,
    // dirty_generation captured by the last completed write.
    written_generation: u64,
}

impl Descriptor {
    pub fn new(storage: Box<[u8]>) -> Self {
        Descriptor {
            key: None,
            state: BufferState::Free,
            data: Arc::new(Mutex::new(storage)),
            modified: false,
            actual: false,
            in_progress: false,
            use_count: 0,
            status: None,
            dirty_generation: 0,
            written_generation: 0,
        }
    }

    pub fn key(&self) -> Option<BufferKey> {
        self.key
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn data(&self) -> &BlockData {
        &self.data
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn is_actual(&self) -> bool {
        self.actual
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    // Outcome of the most recent transfer; None means it succeeded.
    pub fn status(&self) -> Option<IoError> {
        self.status
    }

    pub fn dirty_generation(&self) -> u64 {
        self.dirty_generation
    }

    pub fn written_generation(&self) -> u64 {
        self.written_generation
    }

    // assign binds the slot to `key` for its first holder. Content is arbitrary.
    pub(crate) fn assign(&mut self, key: BufferKey) {
        debug_assert!(matches!(self.state, BufferState::Free | BufferState::Clean));
        debug_assert_eq!(self.use_count, 0);
        self.key = Some(key);
        self.state = BufferState::InUse;
        self.modified = false;
        self.actual = false;
        self.in_progress = false;
        self.use_count = 1;
        self.status = None;
        // A recycled slot carries no pending write.
        self.written_generation = self.dirty_generation;
    }

    pub fn pin(&mut self) -> u32 {
        self.use_count += 1;
        self.state = BufferState::InUse;
        self.use_count
    }

    // unpin drops one reference and returns how many remain. Reaching zero
    // does not choose a list; the caller parks the descriptor.
    pub fn unpin(&mut self) -> Result<u32, Underflow> {
        self.use_count = self.use_count.checked_sub(1).ok_or(Underflow)?;
        Ok(self.use_count)
    }

    // park picks the idle state for an unreferenced descriptor.
    pub(crate) fn park(&mut self) -> BufferState {
        debug_assert_eq!(self.use_count, 0);
        self.state = if self.modified {
            BufferState::Dirty
        } else {
            BufferState::Clean
        };
        self.state
    }

    // mark_modified declares the content valid and changed, returning the new
    // dirty generation.
    pub fn mark_modified(&mut self) -> u64 {
        self.modified = true;
        self.actual = true;
        self.dirty_generation += 1;
        self.dirty_generation
    }

    pub(crate) fn begin_transfer(&mut self) {
        self.in_progress = true;
    }

    // finish_read records a read started when the buffer was at dirty
    // generation `generation`. It returns whether the transferred bytes may
    // be installed. A holder that wrote the buffer meanwhile wins: its
    // content stays, and a failed read no longer matters.
    pub(crate) fn finish_read(&mut self, generation: u64, status: IoResult) -> bool {
        self.in_progress = false;
        if self.actual || self.dirty_generation != generation {
            return false;
        }
        self.actual = status.is_ok();
        self.status = status.err();
        self.actual
    }

    // finish_write records a write that carried the content as of
    // `generation`. The buffer stays modified only if it was changed again
    // after that snapshot; a failed write is not retried.
    pub(crate) fn finish_write(&mut self, generation: u64, status: IoResult) {
        self.in_progress = false;
        self.status = status.err();
        self.written_generation = self.written_generation.max(generation);
        if self.dirty_generation == generation {
            self.modified = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DeviceId;

    fn descriptor() -> Descriptor {
        Descriptor::new(vec![0u8; 16].into_boxed_slice())
    }

    fn key(block: u64) -> BufferKey {
        BufferKey::new(DeviceId::new(1, 0), block)
    }

    #[test]
    fn test_descriptor_lifecycle() {
        let mut d = descriptor();
        assert_eq!(d.state(), BufferState::Free);
        assert_eq!(d.key(), None);

        d.assign(key(4));
        assert_eq!(d.state(), BufferState::InUse);
        assert_eq!(d.use_count(), 1);
        assert!(!d.is_actual());

        assert_eq!(d.pin(), 2);
        assert_eq!(d.unpin(), Ok(1));
        assert_eq!(d.unpin(), Ok(0));
        assert_eq!(d.park(), BufferState::Clean);
        assert_eq!(d.unpin(), Err(Underflow));
        assert_eq!(d.use_count(), 0);
    }

    #[test]
    fn test_modified_parks_dirty() {
        let mut d = descriptor();
        d.assign(key(1));
        assert_eq!(d.mark_modified(), 1);
        assert!(d.is_actual());
        d.unpin().unwrap();
        assert_eq!(d.park(), BufferState::Dirty);
    }

    #[test]
    fn test_write_completion_generations() {
        let mut d = descriptor();
        d.assign(key(1));
        let first = d.mark_modified();
        d.begin_transfer();
        // Changed again while the write was in flight.
        let second = d.mark_modified();
        d.finish_write(first, Ok(()));
        assert!(!d.is_in_progress());
        assert!(d.is_modified());
        assert_eq!(d.written_generation(), first);

        d.begin_transfer();
        d.finish_write(second, Ok(()));
        assert!(!d.is_modified());
        assert_eq!(d.written_generation(), second);
    }

    #[test]
    fn test_failed_write_is_not_retried() {
        let mut d = descriptor();
        d.assign(key(1));
        let generation = d.mark_modified();
        d.begin_transfer();
        d.finish_write(generation, Err(IoError::transfer()));
        assert!(!d.is_modified());
        assert_eq!(d.status(), Some(IoError::transfer()));
    }

    #[test]
    fn test_read_completion() {
        let mut d = descriptor();
        d.assign(key(1));
        d.begin_transfer();
        assert!(!d.finish_read(d.dirty_generation(), Err(IoError::transfer())));
        assert!(!d.is_actual());
        assert!(!d.is_in_progress());
        d.begin_transfer();
        assert!(d.finish_read(d.dirty_generation(), Ok(())));
        assert!(d.is_actual());
        assert_eq!(d.status(), None);
    }

    #[test]
    fn test_read_loses_to_concurrent_modification() {
        let mut d = descriptor();
        d.assign(key(1));
        d.begin_transfer();
        let started = d.dirty_generation();
        d.mark_modified();
        assert!(!d.finish_read(started, Err(IoError::transfer())));
        assert!(d.is_actual());
        assert!(d.is_modified());
        assert_eq!(d.status(), None);

        d.begin_transfer();
        let started = d.dirty_generation();
        assert!(!d.finish_read(started, Ok(())));
        assert!(d.is_modified());
    }

    #[test]
    fn test_data_is_shared() {
        let d = descriptor();
        let view = d.data().clone();
        view.lock()[0] = 42;
        assert_eq!(d.data().lock()[0], 42);
    }
}
