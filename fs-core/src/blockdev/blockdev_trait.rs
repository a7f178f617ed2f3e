//! Block device boundary for AuroraFS
//!
//! AuroraFS never talks to a driver directly; every sector it touches goes
//! through [`BlockDevice`].

use std::io;
use thiserror::Error;

/// Block size in bytes (4KB). Fixed by the on-disk format.
pub const BLOCK_SIZE: usize = 4096;

/// Error type for block device operations
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid block number: {0}")]
    InvalidBlockNumber(u64),
    #[error("Invalid block size: {0} (expected {BLOCK_SIZE})")]
    InvalidBlockSize(usize),
    #[error("Device is read-only")]
    ReadOnly,
    #[error("Device is already closed")]
    DeviceClosed,
}

/// Result type for block device operations
pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// Raw block read/write surface a volume is mounted on
#[async_trait::async_trait]
pub trait BlockDevice: Send + Sync + 'static {
    /// Read block `block_num` into `buf` (exactly [`BLOCK_SIZE`] bytes)
    async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()>;

    /// Write exactly [`BLOCK_SIZE`] bytes to block `block_num`
    async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()>;

    /// Total number of addressable blocks
    fn block_count(&self) -> u64;

    /// Device size in bytes
    fn size_bytes(&self) -> u64 {
        self.block_count() * BLOCK_SIZE as u64
    }

    /// Flush pending writes to stable storage
    async fn sync(&self) -> Result<()>;

    /// Release the underlying handle; later calls fail with `DeviceClosed`
    async fn close(&mut self) -> Result<()>;

    /// Whether writes are rejected
    fn is_read_only(&self) -> bool {
        false
    }
}

/// Validate a block request against a device's geometry
pub(crate) fn check_request(block_num: u64, block_count: u64, len: usize) -> Result<()> {
    if block_num >= block_count {
        return Err(BlockDeviceError::InvalidBlockNumber(block_num));
    }
    if len != BLOCK_SIZE {
        return Err(BlockDeviceError::InvalidBlockSize(len));
    }
    Ok(())
}
