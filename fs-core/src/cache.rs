//! Metadata block cache for AuroraFS
//!
//! A write-through LRU sitting in front of the block device. Inode-table
//! and extent-chain blocks go through it; file data does not.

use arrayref::array_ref;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::blockdev::{BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};

/// Default number of cached metadata blocks
pub const DEFAULT_CACHE_BLOCKS: usize = 256;

/// Cache hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Write-through LRU block cache
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    cache: Mutex<LruCache<u64, Box<[u8; BLOCK_SIZE]>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BlockCache {
    /// Create a new block cache holding up to `capacity` blocks
    pub fn new(device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            device,
            cache: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// The device this cache fronts
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Read a block from the cache or device
    pub async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidBlockSize(buf.len()));
        }

        let cached = self.cache.lock().get(&block_num).map(|block| **block);
        if let Some(block) = cached {
            buf.copy_from_slice(&block);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        // The lock is not held across the device read
        self.device.read_block(block_num, buf).await?;
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.cache
            .lock()
            .put(block_num, Box::new(*array_ref!(buf, 0, BLOCK_SIZE)));
        Ok(())
    }

    /// Write a block to the device, then refresh the cached copy
    pub async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidBlockSize(data.len()));
        }

        if let Err(e) = self.device.write_block(block_num, data).await {
            // The on-disk content is unknown now
            self.cache.lock().pop(&block_num);
            return Err(e);
        }
        self.cache
            .lock()
            .put(block_num, Box::new(*array_ref!(data, 0, BLOCK_SIZE)));
        Ok(())
    }

    /// Drop a block from the cache (it was freed or rewritten behind our back)
    pub fn invalidate(&self, block_num: u64) {
        self.cache.lock().pop(&block_num);
    }

    /// Drop every cached block
    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    /// Flush the underlying device
    pub async fn sync(&self) -> Result<()> {
        self.device.sync().await
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("cached", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::{FileBackedBlockDevice, MemoryBlockDevice};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_cache_read_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test_cache");
        let device = Arc::new(
            FileBackedBlockDevice::create(&path, 2 * BLOCK_SIZE as u64)
                .await
                .unwrap(),
        );
        let cache = BlockCache::new(device.clone(), 2);

        let test_data1 = [0xAA; BLOCK_SIZE];
        let test_data2 = [0x55; BLOCK_SIZE];
        cache.write_block(0, &test_data1).await.unwrap();
        cache.write_block(1, &test_data2).await.unwrap();

        let mut read_buf = [0u8; BLOCK_SIZE];
        cache.read_block(0, &mut read_buf).await.unwrap();
        assert_eq!(&read_buf, &test_data1);
        assert_eq!(cache.stats().hits, 1);

        // Write-through: the device already has it
        device.read_block(1, &mut read_buf).await.unwrap();
        assert_eq!(&read_buf, &test_data2);
    }

    #[tokio::test]
    async fn test_cache_eviction() {
        let device = Arc::new(MemoryBlockDevice::new(4 * BLOCK_SIZE as u64));
        let cache = BlockCache::new(device.clone(), 2);

        for i in 0..3u64 {
            cache.write_block(i, &[i as u8 + 1; BLOCK_SIZE]).await.unwrap();
        }
        assert_eq!(cache.len(), 2);

        // Block 0 was evicted but is still readable from the device
        let mut buf = [0u8; BLOCK_SIZE];
        cache.read_block(0, &mut buf).await.unwrap();
        assert_eq!(buf, [1u8; BLOCK_SIZE]);
        assert_eq!(cache.stats(), CacheStats { hits: 0, misses: 1 });
    }

    #[tokio::test]
    async fn test_invalidate_rereads_device() {
        let device = Arc::new(MemoryBlockDevice::new(2 * BLOCK_SIZE as u64));
        let cache = BlockCache::new(device.clone(), 4);

        cache.write_block(1, &[7u8; BLOCK_SIZE]).await.unwrap();
        device.write_block(1, &[9u8; BLOCK_SIZE]).await.unwrap();

        let mut buf = [0u8; BLOCK_SIZE];
        cache.read_block(1, &mut buf).await.unwrap();
        assert_eq!(buf, [7u8; BLOCK_SIZE]);

        cache.invalidate(1);
        cache.read_block(1, &mut buf).await.unwrap();
        assert_eq!(buf, [9u8; BLOCK_SIZE]);
    }
}
