use thiserror::Error;

use crate::avl::BufferKey;
use crate::disk::DeviceId;
use crate::pool::PoolId;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Outcome of a failed device transfer, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{reason} (errno {errno})")]
pub struct IoError {
    pub errno: i32,
    pub reason: &'static str,
}

impl IoError {
    pub const EIO: i32 = 5;
    pub const ENXIO: i32 = 6;
    pub const EINVAL: i32 = 22;

    pub const fn new(errno: i32, reason: &'static str) -> Self {
        IoError { errno, reason }
    }

    pub const fn transfer() -> Self {
        IoError::new(Self::EIO, "transfer failed")
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no buffer pools configured")]
    NoPools,
    #[error("pool {pool}: block size must be non-zero")]
    ZeroBlockSize { pool: usize },
    #[error("pool {pool}: block count must be non-zero")]
    ZeroBlockCount { pool: usize },
    #[error("pool {pool}: memory area holds {actual} bytes, {expected} required")]
    MemAreaSize {
        pool: usize,
        expected: usize,
        actual: usize,
    },
    #[error("pool {pool}: cannot allocate {bytes} bytes of buffer memory")]
    NoMemory { pool: usize, bytes: usize },
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unknown device {0}")]
    InvalidDevice(DeviceId),
    #[error("block {block} is out of range for device {device} ({count} blocks)")]
    BlockOutOfRange {
        device: DeviceId,
        block: u64,
        count: u64,
    },
    #[error("block size {0} is not a power of two")]
    InvalidBlockSize(usize),
    #[error("no buffer pool serves block size {0}")]
    PoolNotFound(usize),
    #[error("buffer pool {0} is not configured")]
    InvalidPool(PoolId),
    #[error("device {0} is already registered")]
    DeviceExists(DeviceId),
    #[error("I/O error on {key}: {source}")]
    Io { key: BufferKey, source: IoError },
    #[error("buffer {slot} of pool {pool} released more times than it was acquired")]
    UseCountUnderflow { pool: PoolId, slot: usize },
    #[error("cannot spawn write-back task: {0}")]
    Spawn(std::io::Error),
}

impl CacheError {
    /// The device transfer error carried by this error, if any.
    pub fn io_error(&self) -> Option<IoError> {
        match self {
            CacheError::Io { source, .. } => Some(*source),
            _ => None,
        }
    }
}
