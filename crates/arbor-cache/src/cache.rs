//! Write-back block cache with LRU eviction.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use arbor_common::{ArborError, BlockNum, Result, StoreConfig};

use crate::disk::DiskManager;

/// A cached copy of one block.
struct Frame {
    /// Block contents.
    data: Box<[u8]>,
    /// Whether the frame has been modified since it was loaded.
    dirty: bool,
    /// Logical timestamp of the last access, for LRU eviction.
    last_used: u64,
}

/// Frame table and access clock, protected by one lock.
struct CacheInner {
    frames: HashMap<BlockNum, Frame>,
    tick: u64,
}

/// Cache access counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Buffer cache over a block device.
///
/// Holds up to `capacity` blocks in memory, writing dirty frames back to
/// disk on eviction or [`flush`](BlockCache::flush). The cache also keeps
/// the allocation bitmap its client maintains through
/// [`notify_allocate`](BlockCache::notify_allocate) and
/// [`notify_deallocate`](BlockCache::notify_deallocate); the bitmap is
/// informational and is rebuilt by the client on attach.
pub struct BlockCache {
    disk: DiskManager,
    capacity: usize,
    inner: Mutex<CacheInner>,
    /// One bit per block, set while the block is allocated.
    allocated: Mutex<Vec<u64>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl BlockCache {
    /// Creates a cache over a freshly created store file.
    pub fn create(config: &StoreConfig) -> Result<Self> {
        let disk = DiskManager::create(config)?;
        Ok(Self::with_disk(disk, config.cache_frames))
    }

    /// Creates a cache over an existing store file.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let disk = DiskManager::open(config)?;
        Ok(Self::with_disk(disk, config.cache_frames))
    }

    fn with_disk(disk: DiskManager, capacity: usize) -> Self {
        let bitmap_words = (disk.num_blocks() as usize + 63) / 64;
        Self {
            disk,
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner {
                frames: HashMap::new(),
                tick: 0,
            }),
            allocated: Mutex::new(vec![0u64; bitmap_words]),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Returns the block size in bytes.
    pub fn block_size(&self) -> usize {
        self.disk.block_size()
    }

    /// Returns the total number of blocks in the store.
    pub fn num_blocks(&self) -> u32 {
        self.disk.num_blocks()
    }

    fn check_range(&self, block: BlockNum) -> Result<()> {
        if block >= self.disk.num_blocks() {
            return Err(ArborError::BlockOutOfRange {
                block,
                num_blocks: self.disk.num_blocks(),
            });
        }
        Ok(())
    }

    /// Evicts the least recently used frame if the cache is over capacity.
    ///
    /// `keep` is never evicted; it is the frame the caller is working on.
    fn evict_if_full(&self, inner: &mut CacheInner, keep: BlockNum) -> Result<()> {
        while inner.frames.len() >= self.capacity {
            let victim = inner
                .frames
                .iter()
                .filter(|(b, _)| **b != keep)
                .min_by_key(|(_, f)| f.last_used)
                .map(|(b, _)| *b);

            let Some(victim) = victim else {
                // Only the kept frame remains; capacity 1 degenerates to that.
                return Ok(());
            };

            if let Some(frame) = inner.frames.remove(&victim) {
                if frame.dirty {
                    self.disk.write_block(victim, &frame.data)?;
                }
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(block = victim, dirty = frame.dirty, "evicted cache frame");
            }
        }
        Ok(())
    }

    /// Reads one block, returning an owned copy of its contents.
    pub fn read_block(&self, block: BlockNum) -> Result<Box<[u8]>> {
        self.check_range(block)?;

        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(frame) = inner.frames.get_mut(&block) {
            frame.last_used = tick;
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(frame.data.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let data = self.disk.read_block(block)?;
        self.evict_if_full(&mut inner, block)?;
        inner.frames.insert(
            block,
            Frame {
                data: data.clone(),
                dirty: false,
                last_used: tick,
            },
        );
        Ok(data)
    }

    /// Writes one block through the cache.
    ///
    /// The frame is marked dirty and written back on eviction or flush.
    pub fn write_block(&self, block: BlockNum, data: &[u8]) -> Result<()> {
        self.check_range(block)?;
        if data.len() != self.disk.block_size() {
            return Err(ArborError::BlockSizeMismatch {
                expected: self.disk.block_size(),
                actual: data.len(),
            });
        }

        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(frame) = inner.frames.get_mut(&block) {
            frame.data.copy_from_slice(data);
            frame.dirty = true;
            frame.last_used = tick;
            return Ok(());
        }

        self.evict_if_full(&mut inner, block)?;
        inner.frames.insert(
            block,
            Frame {
                data: data.to_vec().into_boxed_slice(),
                dirty: true,
                last_used: tick,
            },
        );
        Ok(())
    }

    /// Writes every dirty frame back to disk and syncs the device.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        for (block, frame) in inner.frames.iter_mut() {
            if frame.dirty {
                self.disk.write_block(*block, &frame.data)?;
                frame.dirty = false;
            }
        }
        self.disk.sync()
    }

    /// Records that a block left the free list and is now in use.
    pub fn notify_allocate(&self, block: BlockNum) -> Result<()> {
        self.check_range(block)?;
        let mut bitmap = self.allocated.lock();
        bitmap[block as usize / 64] |= 1 << (block % 64);
        Ok(())
    }

    /// Records that a block returned to the free list.
    pub fn notify_deallocate(&self, block: BlockNum) -> Result<()> {
        self.check_range(block)?;
        let mut bitmap = self.allocated.lock();
        bitmap[block as usize / 64] &= !(1 << (block % 64));
        Ok(())
    }

    /// Returns true if the block is currently marked allocated.
    pub fn is_allocated(&self, block: BlockNum) -> bool {
        if block >= self.disk.num_blocks() {
            return false;
        }
        let bitmap = self.allocated.lock();
        bitmap[block as usize / 64] & (1 << (block % 64)) != 0
    }

    /// Returns the number of blocks currently marked allocated.
    pub fn allocated_count(&self) -> u32 {
        let bitmap = self.allocated.lock();
        bitmap.iter().map(|w| w.count_ones()).sum()
    }

    /// Returns cache access counters.
    pub fn stats(&self) -> BlockCacheStats {
        BlockCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
