//! RAM-backed block device

use async_trait::async_trait;
use parking_lot::RwLock;

use super::blockdev_trait::{check_request, BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};

/// A block device held entirely in memory
///
/// Used by the test suite and benchmarks, and handy for scratch volumes.
#[derive(Debug)]
pub struct MemoryBlockDevice {
    data: RwLock<Option<Vec<u8>>>,
    block_count: u64,
    read_only: bool,
}

impl MemoryBlockDevice {
    /// Create a zero-filled device of `size` bytes (rounded down to whole blocks)
    pub fn new(size: u64) -> Self {
        let block_count = size / BLOCK_SIZE as u64;
        Self {
            data: RwLock::new(Some(vec![0u8; (block_count as usize) * BLOCK_SIZE])),
            block_count,
            read_only: false,
        }
    }

    /// Wrap an existing image
    pub fn from_bytes(mut bytes: Vec<u8>) -> Self {
        let block_count = (bytes.len() / BLOCK_SIZE) as u64;
        bytes.truncate(block_count as usize * BLOCK_SIZE);
        Self {
            data: RwLock::new(Some(bytes)),
            block_count,
            read_only: false,
        }
    }

    /// Mark the device read-only
    pub fn into_read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Copy of the whole image, or `None` once closed
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        self.data.read().clone()
    }
}

#[async_trait]
impl BlockDevice for MemoryBlockDevice {
    async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        check_request(block_num, self.block_count, buf.len())?;
        let guard = self.data.read();
        let data = guard.as_ref().ok_or(BlockDeviceError::DeviceClosed)?;
        let start = block_num as usize * BLOCK_SIZE;
        buf.copy_from_slice(&data[start..start + BLOCK_SIZE]);
        Ok(())
    }

    async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        check_request(block_num, self.block_count, data.len())?;
        let mut guard = self.data.write();
        let image = guard.as_mut().ok_or(BlockDeviceError::DeviceClosed)?;
        let start = block_num as usize * BLOCK_SIZE;
        image[start..start + BLOCK_SIZE].copy_from_slice(data);
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    async fn sync(&self) -> Result<()> {
        if self.data.read().is_none() {
            return Err(BlockDeviceError::DeviceClosed);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        match self.data.write().take() {
            Some(_) => Ok(()),
            None => Err(BlockDeviceError::DeviceClosed),
        }
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
