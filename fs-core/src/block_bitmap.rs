//! Block and inode allocation for AuroraFS
//!
//! Two persistent bitmaps: one bit per device block (metadata blocks are
//! permanently set) and one bit per inode. The free counters live next to the
//! bitmaps and change in the same call, so anyone holding the allocator sees
//! both agree. Every change marks the bitmap block it lands in dirty;
//! [`Allocator::flush`] writes only those blocks.

use std::collections::BTreeSet;

use crate::blockdev::{BlockDevice, BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::layout::{Layout, BITS_PER_BLOCK};

/// A fixed-length bitmap
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    bits: Vec<u8>,
    len: u64,
}

impl Bitmap {
    pub fn new(len: u64) -> Self {
        Self {
            bits: vec![0u8; ((len + 7) / 8) as usize],
            len,
        }
    }

    /// Build from persisted bytes; bits past `len` are ignored
    pub fn from_bytes(bytes: &[u8], len: u64) -> Self {
        let mut bitmap = Self::new(len);
        let n = bitmap.bits.len().min(bytes.len());
        bitmap.bits[..n].copy_from_slice(&bytes[..n]);
        if len % 8 != 0 {
            if let Some(last) = bitmap.bits.last_mut() {
                *last &= (1u8 << (len % 8)) - 1;
            }
        }
        bitmap
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, idx: u64) -> bool {
        idx < self.len && self.bits[(idx / 8) as usize] & (1 << (idx % 8)) != 0
    }

    pub fn set(&mut self, idx: u64) {
        if idx < self.len {
            self.bits[(idx / 8) as usize] |= 1 << (idx % 8);
        }
    }

    pub fn clear(&mut self, idx: u64) {
        if idx < self.len {
            self.bits[(idx / 8) as usize] &= !(1 << (idx % 8));
        }
    }

    pub fn count_set(&self) -> u64 {
        self.bits.iter().map(|b| b.count_ones() as u64).sum()
    }

    /// First run of `n` clear bits inside `[lo, hi)`, searching from `hint` and wrapping
    pub fn find_clear_run(&self, lo: u64, hi: u64, n: u64, hint: u64) -> Option<u64> {
        if n == 0 || hi <= lo || hi - lo < n {
            return None;
        }
        let hint = if hint < lo || hint >= hi { lo } else { hint };
        self.scan_run(hint, hi, n)
            .or_else(|| self.scan_run(lo, (hint + n - 1).min(hi), n))
    }

    fn scan_run(&self, from: u64, to: u64, n: u64) -> Option<u64> {
        let mut run_start = from;
        let mut run_len = 0;
        let mut idx = from;
        while idx < to {
            // Skip full bytes quickly
            if run_len == 0 && idx % 8 == 0 && self.bits[(idx / 8) as usize] == 0xFF {
                idx += 8;
                run_start = idx;
                continue;
            }
            if self.get(idx) {
                run_len = 0;
                run_start = idx + 1;
            } else {
                run_len += 1;
                if run_len == n {
                    return Some(run_start);
                }
            }
            idx += 1;
        }
        None
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmap")
            .field("len", &self.len)
            .field("set", &self.count_set())
            .finish()
    }
}

/// Free-space and free-inode allocator
#[derive(Debug, Clone)]
pub struct Allocator {
    blocks: Bitmap,
    inodes: Bitmap,
    data_start: u64,
    free_blocks: u64,
    free_inodes: u64,
    /// Next-fit cursor
    next_block: u64,
    /// Block bitmap blocks changed since the last store, relative to the region
    dirty_blocks: BTreeSet<u64>,
    dirty_inodes: BTreeSet<u64>,
}

impl Allocator {
    /// Allocator for a freshly formatted volume: only metadata blocks in use
    pub fn new(layout: &Layout) -> Self {
        let mut blocks = Bitmap::new(layout.total_blocks);
        for block in 0..layout.data_start {
            blocks.set(block);
        }
        Self {
            blocks,
            inodes: Bitmap::new(layout.total_inodes),
            data_start: layout.data_start,
            free_blocks: layout.total_blocks - layout.data_start,
            free_inodes: layout.total_inodes,
            next_block: layout.data_start,
            dirty_blocks: BTreeSet::new(),
            dirty_inodes: BTreeSet::new(),
        }
    }

    /// Load both bitmaps from disk
    pub async fn load(device: &dyn BlockDevice, layout: &Layout) -> Result<Self> {
        let block_bytes =
            read_region(device, layout.block_bitmap, layout.block_bitmap_blocks).await?;
        let inode_bytes =
            read_region(device, layout.inode_bitmap, layout.inode_bitmap_blocks).await?;

        let blocks = Bitmap::from_bytes(&block_bytes, layout.total_blocks);
        let inodes = Bitmap::from_bytes(&inode_bytes, layout.total_inodes);

        if (0..layout.data_start).any(|b| !blocks.get(b)) {
            return Err(Error::CorruptSuperblock(
                "block bitmap does not reserve the metadata region".to_string(),
            ));
        }

        let free_blocks = layout.total_blocks - blocks.count_set();
        let free_inodes = layout.total_inodes - inodes.count_set();
        log::info!(
            "ALLOC: loaded bitmaps, {} free blocks of {}, {} free inodes of {}",
            free_blocks,
            layout.total_blocks,
            free_inodes,
            layout.total_inodes
        );

        Ok(Self {
            blocks,
            inodes,
            data_start: layout.data_start,
            free_blocks,
            free_inodes,
            next_block: layout.data_start,
            dirty_blocks: BTreeSet::new(),
            dirty_inodes: BTreeSet::new(),
        })
    }

    /// Write both bitmaps to disk
    pub async fn store(&mut self, device: &dyn BlockDevice, layout: &Layout) -> Result<()> {
        write_region(
            device,
            layout.block_bitmap,
            layout.block_bitmap_blocks,
            self.blocks.as_bytes(),
        )
        .await?;
        write_region(
            device,
            layout.inode_bitmap,
            layout.inode_bitmap_blocks,
            self.inodes.as_bytes(),
        )
        .await?;
        self.dirty_blocks.clear();
        self.dirty_inodes.clear();
        log::debug!(
            "ALLOC: saved bitmaps, {} free blocks, {} free inodes",
            self.free_blocks,
            self.free_inodes
        );
        Ok(())
    }

    /// Write the bitmap blocks changed since the last store
    ///
    /// Returns the number of blocks written. A block stays dirty until its
    /// write succeeds.
    pub async fn flush(&mut self, device: &dyn BlockDevice, layout: &Layout) -> Result<usize> {
        let mut written = 0;
        while let Some(&idx) = self.dirty_blocks.first() {
            write_bitmap_block(device, layout.block_bitmap + idx, self.blocks.as_bytes(), idx)
                .await?;
            self.dirty_blocks.remove(&idx);
            written += 1;
        }
        while let Some(&idx) = self.dirty_inodes.first() {
            write_bitmap_block(device, layout.inode_bitmap + idx, self.inodes.as_bytes(), idx)
                .await?;
            self.dirty_inodes.remove(&idx);
            written += 1;
        }
        if written > 0 {
            log::trace!("ALLOC: flushed {} bitmap blocks", written);
        }
        Ok(written)
    }

    /// Whether any bitmap change is not on disk yet
    pub fn is_dirty(&self) -> bool {
        !self.dirty_blocks.is_empty() || !self.dirty_inodes.is_empty()
    }

    /// Mark `block` in use without searching, for rebuilding from a tree walk
    pub fn claim(&mut self, block: u64) -> Result<()> {
        if block < self.data_start || block >= self.blocks.len() {
            return Err(Error::invalid(format!(
                "block {} outside the data region",
                block
            )));
        }
        if !self.blocks.get(block) {
            self.blocks.set(block);
            self.free_blocks -= 1;
            self.dirty_blocks.insert(block / BITS_PER_BLOCK);
        }
        Ok(())
    }

    /// Mark inode `inode` in use, for rebuilding from a tree walk
    pub fn claim_inode(&mut self, inode: u64) -> Result<()> {
        if inode == 0 || inode > self.inodes.len() {
            return Err(Error::invalid(format!("inode {} out of range", inode)));
        }
        if !self.inodes.get(inode - 1) {
            self.inodes.set(inode - 1);
            self.free_inodes -= 1;
            self.dirty_inodes.insert((inode - 1) / BITS_PER_BLOCK);
        }
        Ok(())
    }

    /// Reserve `n` contiguous data blocks, returning the first
    pub fn allocate(&mut self, n: u64) -> Result<u64> {
        if n == 0 {
            return Err(Error::invalid("cannot allocate zero blocks"));
        }
        if self.free_blocks < n {
            log::warn!(
                "ALLOC: {} blocks requested, {} free",
                n,
                self.free_blocks
            );
            return Err(Error::NoFreeBlocks);
        }
        let start = self
            .blocks
            .find_clear_run(self.data_start, self.blocks.len(), n, self.next_block)
            .ok_or(Error::NoFreeBlocks)?;

        for block in start..start + n {
            self.blocks.set(block);
            self.dirty_blocks.insert(block / BITS_PER_BLOCK);
        }
        self.free_blocks -= n;
        self.next_block = start + n;
        log::debug!(
            "ALLOC: allocated blocks {}..{}, {} free",
            start,
            start + n,
            self.free_blocks
        );
        Ok(start)
    }

    /// Release `n` blocks starting at `start`
    pub fn free(&mut self, start: u64, n: u64) -> Result<()> {
        let end = start
            .checked_add(n)
            .ok_or_else(|| Error::invalid("block range overflows"))?;
        if start < self.data_start || end > self.blocks.len() {
            return Err(Error::invalid(format!(
                "blocks {}..{} outside the data region",
                start, end
            )));
        }
        if let Some(block) = (start..end).find(|&b| !self.blocks.get(b)) {
            return Err(Error::invalid(format!("block {} is already free", block)));
        }

        for block in start..end {
            self.blocks.clear(block);
            self.dirty_blocks.insert(block / BITS_PER_BLOCK);
        }
        self.free_blocks += n;
        log::debug!(
            "ALLOC: freed blocks {}..{}, {} free",
            start,
            end,
            self.free_blocks
        );
        Ok(())
    }

    pub fn is_allocated(&self, block: u64) -> bool {
        self.blocks.get(block)
    }

    /// Reserve an inode number (1-based)
    pub fn allocate_inode(&mut self) -> Result<u64> {
        if self.free_inodes == 0 {
            return Err(Error::NoFreeInodes);
        }
        let slot = self
            .inodes
            .find_clear_run(0, self.inodes.len(), 1, 0)
            .ok_or(Error::NoFreeInodes)?;
        self.inodes.set(slot);
        self.dirty_inodes.insert(slot / BITS_PER_BLOCK);
        self.free_inodes -= 1;
        log::debug!("ALLOC: allocated inode {}", slot + 1);
        Ok(slot + 1)
    }

    /// Release an inode number
    pub fn free_inode(&mut self, inode: u64) -> Result<()> {
        if inode == 0 || inode > self.inodes.len() {
            return Err(Error::invalid(format!("inode {} out of range", inode)));
        }
        if !self.inodes.get(inode - 1) {
            return Err(Error::invalid(format!("inode {} is already free", inode)));
        }
        self.inodes.clear(inode - 1);
        self.dirty_inodes.insert((inode - 1) / BITS_PER_BLOCK);
        self.free_inodes += 1;
        log::debug!("ALLOC: freed inode {}", inode);
        Ok(())
    }

    pub fn is_inode_allocated(&self, inode: u64) -> bool {
        inode != 0 && self.inodes.get(inode - 1)
    }

    pub fn free_blocks(&self) -> u64 {
        self.free_blocks
    }

    pub fn free_inodes(&self) -> u64 {
        self.free_inodes
    }

    pub fn total_blocks(&self) -> u64 {
        self.blocks.len()
    }

    pub fn total_inodes(&self) -> u64 {
        self.inodes.len()
    }

    /// Allocated blocks in the data region
    pub fn used_data_blocks(&self) -> u64 {
        self.blocks.len() - self.data_start - self.free_blocks
    }
}

async fn read_region(device: &dyn BlockDevice, start: u64, count: u64) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; count as usize * BLOCK_SIZE];
    for (i, chunk) in bytes.chunks_mut(BLOCK_SIZE).enumerate() {
        device.read_block(start + i as u64, chunk).await?;
    }
    Ok(bytes)
}

async fn write_region(device: &dyn BlockDevice, start: u64, count: u64, data: &[u8]) -> Result<()> {
    let mut block = vec![0u8; BLOCK_SIZE];
    for i in 0..count as usize {
        block.fill(0);
        let lo = (i * BLOCK_SIZE).min(data.len());
        let hi = ((i + 1) * BLOCK_SIZE).min(data.len());
        block[..hi - lo].copy_from_slice(&data[lo..hi]);
        device.write_block(start + i as u64, &block).await?;
    }
    Ok(())
}

/// Write bitmap block `idx` of `bits` to `target`
async fn write_bitmap_block(device: &dyn BlockDevice, target: u64, bits: &[u8], idx: u64) -> Result<()> {
    let mut block = vec![0u8; BLOCK_SIZE];
    let lo = (idx as usize * BLOCK_SIZE).min(bits.len());
    let hi = (lo + BLOCK_SIZE).min(bits.len());
    block[..hi - lo].copy_from_slice(&bits[lo..hi]);
    device.write_block(target, &block).await?;
    Ok(())
}
