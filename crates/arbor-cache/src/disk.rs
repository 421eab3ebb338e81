//! Disk manager for block-level file I/O.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use arbor_common::{ArborError, BlockNum, Result, StoreConfig};

/// Manages reading and writing fixed-size blocks in a single store file.
///
/// The file is preallocated to `num_blocks * block_size` bytes at creation
/// time; block addresses index directly into it.
pub struct DiskManager {
    /// Block size in bytes.
    block_size: usize,
    /// Total number of blocks in the store.
    num_blocks: u32,
    /// Enable fsync after writes.
    fsync_enabled: bool,
    /// The store file handle.
    file: Mutex<File>,
}

impl DiskManager {
    /// Creates a new store file, truncating any existing one.
    pub fn create(config: &StoreConfig) -> Result<Self> {
        config.validate()?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&config.path)?;
        file.set_len(config.num_blocks as u64 * config.block_size as u64)?;

        Ok(Self {
            block_size: config.block_size,
            num_blocks: config.num_blocks,
            fsync_enabled: config.fsync_enabled,
            file: Mutex::new(file),
        })
    }

    /// Opens an existing store file.
    ///
    /// The file length must match the configured geometry exactly.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;

        let file = OpenOptions::new().read(true).write(true).open(&config.path)?;

        let expected = config.num_blocks as u64 * config.block_size as u64;
        let actual = file.metadata()?.len();
        if actual != expected {
            return Err(ArborError::ConfigError(format!(
                "store file {} is {} bytes, expected {}",
                config.path.display(),
                actual,
                expected
            )));
        }

        Ok(Self {
            block_size: config.block_size,
            num_blocks: config.num_blocks,
            fsync_enabled: config.fsync_enabled,
            file: Mutex::new(file),
        })
    }

    /// Returns the block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the total number of blocks in the store.
    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    /// Checks that a block number addresses the store.
    fn check_range(&self, block: BlockNum) -> Result<()> {
        if block >= self.num_blocks {
            return Err(ArborError::BlockOutOfRange {
                block,
                num_blocks: self.num_blocks,
            });
        }
        Ok(())
    }

    /// Reads one block from disk.
    pub fn read_block(&self, block: BlockNum) -> Result<Box<[u8]>> {
        self.check_range(block)?;

        let mut file = self.file.lock();
        let offset = block as u64 * self.block_size as u64;
        file.seek(SeekFrom::Start(offset))?;

        let mut buffer = vec![0u8; self.block_size];
        file.read_exact(&mut buffer)?;

        Ok(buffer.into_boxed_slice())
    }

    /// Writes one block to disk.
    pub fn write_block(&self, block: BlockNum, data: &[u8]) -> Result<()> {
        self.check_range(block)?;

        if data.len() != self.block_size {
            return Err(ArborError::BlockSizeMismatch {
                expected: self.block_size,
                actual: data.len(),
            });
        }

        let mut file = self.file.lock();
        let offset = block as u64 * self.block_size as u64;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;

        if self.fsync_enabled {
            file.sync_all()?;
        }

        Ok(())
    }

    /// Flushes outstanding writes to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}
