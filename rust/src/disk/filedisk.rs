use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::{BlockDevice, BlockRequest, IoResult, RequestKind};
use crate::error::IoError;

// A FileDisk is a block device backed by a regular host file, one block per
// `block_size` bytes. Transfers complete inline.
pub struct FileDisk {
    path: PathBuf,
    file: Mutex<File>,
    block_size: usize,
    block_count: u64,
}

impl FileDisk {
    // create makes (or truncates) a zero-filled image, creating parent directories.
    pub fn create<P: AsRef<Path>>(path: P, block_size: usize, block_count: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(block_size as u64 * block_count)?;
        Ok(FileDisk {
            path,
            file: Mutex::new(file),
            block_size,
            block_count,
        })
    }

    // open attaches to an existing image; trailing partial blocks are ignored.
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize) -> io::Result<Self> {
        if block_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero block size"));
        }
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let block_count = file.metadata()?.len() / block_size as u64;
        Ok(FileDisk {
            path,
            file: Mutex::new(file),
            block_size,
            block_count,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn copy(&self, request: &BlockRequest) -> io::Result<()> {
        let mut file = self.file.lock();
        for (i, sg) in request.buffers.iter().enumerate() {
            let offset = (request.start + i as u64) * self.block_size as u64;
            let length = sg.length.min(self.block_size);
            file.seek(SeekFrom::Start(offset))?;
            let mut data = sg.data.lock();
            match request.kind {
                RequestKind::Read => file.read_exact(&mut data[..length])?,
                RequestKind::Write => file.write_all(&data[..length])?,
            }
        }
        if request.kind == RequestKind::Write {
            file.flush()?;
        }
        Ok(())
    }
}

impl BlockDevice for FileDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn submit(&self, request: BlockRequest) -> IoResult {
        let in_range = request
            .start
            .checked_add(request.count())
            .is_some_and(|end| end <= self.block_count);
        if !in_range {
            return Err(IoError::new(IoError::EINVAL, "request beyond end of disk"));
        }
        let status = self.copy(&request).map_err(|e| {
            log::warn!("{}: host I/O failed: {e}", self.path.display());
            IoError::new(e.raw_os_error().unwrap_or(IoError::EIO), "host file I/O failed")
        });
        request.complete(status);
        Ok(())
    }
}
