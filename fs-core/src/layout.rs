//! Volume geometry, mkfs and inode-table I/O

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::block_bitmap::Allocator;
use crate::blockdev::{BlockDevice, BLOCK_SIZE};
use crate::cache::BlockCache;
use crate::error::{Error, Result};
use crate::format::{
    CompressionAlgorithm, EncryptionAlgorithm, FileKind, Features, Inode, Superblock,
    VolumeState, FORMAT_VERSION, INODES_PER_BLOCK, INODE_FLAG_HAS_KEY, INODE_SIZE, LABEL_LEN,
    ROOT_INODE,
};
use crate::modules::codec::{self, Key, VolumeKeys};

/// Bits tracked by one bitmap block
pub(crate) const BITS_PER_BLOCK: u64 = BLOCK_SIZE as u64 * 8;

/// Block numbers for important filesystem structures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Number of blocks in the volume
    pub total_blocks: u64,
    /// Number of inodes in the volume
    pub total_inodes: u64,
    /// Block number of the block bitmap
    pub block_bitmap: u64,
    /// Number of blocks in the block bitmap
    pub block_bitmap_blocks: u64,
    /// Block number of the inode bitmap
    pub inode_bitmap: u64,
    /// Number of blocks in the inode bitmap
    pub inode_bitmap_blocks: u64,
    /// Block number of the inode table
    pub inode_table: u64,
    /// Number of blocks in the inode table
    pub inode_table_blocks: u64,
    /// Block number of the first data block
    pub data_start: u64,
}

impl Layout {
    /// Calculate the layout for a volume of `total_blocks` blocks
    pub fn new(total_blocks: u64) -> Self {
        let total_inodes = total_blocks / 4;

        // Superblock is always at block 0
        let block_bitmap = 1;
        let block_bitmap_blocks = div_ceil(total_blocks, BITS_PER_BLOCK).max(1);

        let inode_bitmap = block_bitmap + block_bitmap_blocks;
        let inode_bitmap_blocks = div_ceil(total_inodes, BITS_PER_BLOCK).max(1);

        let inode_table = inode_bitmap + inode_bitmap_blocks;
        let inode_table_blocks = div_ceil(total_inodes, INODES_PER_BLOCK as u64).max(1);

        Self {
            total_blocks,
            total_inodes,
            block_bitmap,
            block_bitmap_blocks,
            inode_bitmap,
            inode_bitmap_blocks,
            inode_table,
            inode_table_blocks,
            data_start: inode_table + inode_table_blocks,
        }
    }

    /// Layout described by a decoded superblock, checked against the device
    pub fn from_superblock(sb: &Superblock, device_blocks: u64) -> Result<Self> {
        if sb.total_blocks > device_blocks {
            return Err(Error::CorruptSuperblock(format!(
                "superblock claims {} blocks, device has {}",
                sb.total_blocks, device_blocks
            )));
        }
        let layout = Self::new(sb.total_blocks);
        if layout.total_inodes != sb.total_inodes {
            return Err(Error::CorruptSuperblock(format!(
                "superblock claims {} inodes, geometry gives {}",
                sb.total_inodes, layout.total_inodes
            )));
        }
        if layout.data_start >= layout.total_blocks {
            return Err(Error::CorruptSuperblock(
                "volume has no data region".to_string(),
            ));
        }
        Ok(layout)
    }

    /// Blocks reserved for the superblock, bitmaps and inode table
    pub fn metadata_blocks(&self) -> u64 {
        self.data_start
    }

    /// Get the block number and byte offset for a given inode number
    pub fn inode_location(&self, inode: u64) -> Result<(u64, usize)> {
        if inode == 0 || inode > self.total_inodes {
            return Err(Error::invalid(format!("inode {} out of range", inode)));
        }
        let slot = inode - 1;
        let block = self.inode_table + slot / INODES_PER_BLOCK as u64;
        let offset = (slot % INODES_PER_BLOCK as u64) as usize * INODE_SIZE;
        Ok((block, offset))
    }

    /// Whether `block` lies in the data region
    pub fn is_data_block(&self, block: u64) -> bool {
        block >= self.data_start && block < self.total_blocks
    }
}

fn div_ceil(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}

/// Seconds since the UNIX epoch
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Parameters for [`format_volume`]
#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// Volume label (truncated to 64 bytes)
    pub label: String,
    /// Features to enable
    pub features: Features,
    /// Default compression, used when `Features::COMPRESS` is set
    pub compression: CompressionAlgorithm,
    /// Default encryption, used when `Features::ENCRYPT` is set
    pub encryption: EncryptionAlgorithm,
    /// Master key, required when `Features::ENCRYPT` is set
    pub master_key: Option<Key>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            label: "aurora".to_string(),
            features: Features::SNAPSHOT,
            compression: CompressionAlgorithm::Lz4,
            encryption: EncryptionAlgorithm::Aes256Gcm,
            master_key: None,
        }
    }
}

/// Write a fresh AuroraFS volume onto `device`
///
/// Zeroes the metadata region, writes both bitmaps, the root directory
/// inode and finally the superblock. Returns the superblock written.
pub async fn format_volume(
    device: Arc<dyn BlockDevice>,
    options: &FormatOptions,
) -> Result<Superblock> {
    if device.is_read_only() {
        return Err(Error::invalid("cannot format a read-only device"));
    }
    if options.label.len() > LABEL_LEN {
        log::warn!("FORMAT: label truncated to {} bytes", LABEL_LEN);
    }

    let total_blocks = device.block_count();
    let layout = Layout::new(total_blocks);
    if layout.total_inodes == 0 || layout.data_start + 1 > total_blocks {
        return Err(Error::invalid(format!(
            "device of {} blocks is too small (needs at least {})",
            total_blocks,
            layout.data_start + 1
        )));
    }

    let encrypt = options.features.contains(Features::ENCRYPT);
    let mut key_salt = [0u8; 16];
    let mut key_check = [0u8; 32];
    let mut keys = None;
    if encrypt {
        if options.encryption == EncryptionAlgorithm::None {
            return Err(Error::invalid("encrypt feature needs an encryption algorithm"));
        }
        let master = options
            .master_key
            .as_ref()
            .ok_or_else(|| Error::invalid("encrypt feature needs a master key"))?;
        codec::random_bytes(&mut key_salt)?;
        key_check = codec::key_verifier(master, &key_salt)?;
        keys = Some(VolumeKeys::derive(master, &key_salt)?);
    }

    let mut volume_id = [0u8; 16];
    codec::random_bytes(&mut volume_id)?;

    log::info!(
        "FORMAT: {} blocks, {} inodes, {} metadata blocks, features [{}]",
        total_blocks,
        layout.total_inodes,
        layout.metadata_blocks(),
        options.features.names().join(",")
    );

    // Zero the metadata region so stale inodes and bitmaps never leak through
    let zero = vec![0u8; BLOCK_SIZE];
    for block in 0..layout.data_start {
        device.write_block(block, &zero).await?;
    }

    let mut alloc = Allocator::new(&layout);
    let root = alloc.allocate_inode()?;
    debug_assert_eq!(root, ROOT_INODE);
    alloc.store(device.as_ref(), &layout).await?;

    let now = now_secs();
    let mut root_inode = Inode::new(ROOT_INODE, FileKind::Directory, 0o755, ROOT_INODE, now);
    if options.features.contains(Features::COMPRESS) {
        root_inode.compression = options.compression;
    }
    if let Some(keys) = &keys {
        root_inode.wrapped_key = codec::wrap_key(&keys.wrap, &codec::random_key()?)?;
        root_inode.encryption = options.encryption;
        root_inode.flags |= INODE_FLAG_HAS_KEY;
    }
    let cache = BlockCache::new(device.clone(), 4);
    write_inode(&cache, &layout, &root_inode).await?;

    let mut sb = Superblock {
        version: FORMAT_VERSION,
        block_size: BLOCK_SIZE as u32,
        total_blocks,
        free_blocks: alloc.free_blocks(),
        total_inodes: layout.total_inodes,
        free_inodes: alloc.free_inodes(),
        features: options.features,
        root_inode: ROOT_INODE,
        journal_inode: 0,
        dedup_inode: 0,
        snapshot_inode: 0,
        default_compression: if options.features.contains(Features::COMPRESS) {
            options.compression
        } else {
            CompressionAlgorithm::None
        },
        default_encryption: if encrypt {
            options.encryption
        } else {
            EncryptionAlgorithm::None
        },
        volume_id,
        label: [0u8; LABEL_LEN],
        created: now,
        last_mount: 0,
        last_write: now,
        mount_count: 0,
        state: VolumeState::Clean,
        active_snapshot: 0,
        next_snapshot_id: 1,
        key_salt,
        key_check,
    };
    sb.set_label(&options.label);

    device.write_block(0, &sb.encode()?).await?;
    device.sync().await?;

    log::info!(
        "FORMAT: volume {} ready, {} free blocks, {} free inodes",
        sb.volume_id_string(),
        sb.free_blocks,
        sb.free_inodes
    );
    Ok(sb)
}

/// Read and decode the superblock at block 0
pub async fn read_superblock(device: &dyn BlockDevice) -> Result<Superblock> {
    let mut block = vec![0u8; BLOCK_SIZE];
    device.read_block(0, &mut block).await?;
    Ok(Superblock::decode(&block)?)
}

/// Read an inode from the inode table
pub async fn read_inode(cache: &BlockCache, layout: &Layout, inode: u64) -> Result<Inode> {
    let (block, offset) = layout.inode_location(inode)?;
    let mut buf = vec![0u8; BLOCK_SIZE];
    cache.read_block(block, &mut buf).await?;
    match Inode::decode(&buf[offset..offset + INODE_SIZE])? {
        Some(found) if found.id == inode => Ok(found),
        Some(found) => Err(Error::format(format!(
            "inode slot {} holds inode {}",
            inode, found.id
        ))),
        None => Err(Error::NotFound),
    }
}

/// Write an inode into its inode-table slot
pub async fn write_inode(cache: &BlockCache, layout: &Layout, inode: &Inode) -> Result<()> {
    let (block, offset) = layout.inode_location(inode.id)?;
    let mut buf = vec![0u8; BLOCK_SIZE];
    cache.read_block(block, &mut buf).await?;
    buf[offset..offset + INODE_SIZE].copy_from_slice(&inode.encode()?);
    cache.write_block(block, &buf).await?;
    Ok(())
}

/// Zero an inode-table slot
pub async fn clear_inode(cache: &BlockCache, layout: &Layout, inode: u64) -> Result<()> {
    let (block, offset) = layout.inode_location(inode)?;
    let mut buf = vec![0u8; BLOCK_SIZE];
    cache.read_block(block, &mut buf).await?;
    buf[offset..offset + INODE_SIZE].fill(0);
    cache.write_block(block, &buf).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemoryBlockDevice;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_layout_for_4mib() {
        let layout = Layout::new(4 * MIB / BLOCK_SIZE as u64);
        assert_eq!(layout.total_blocks, 1024);
        assert_eq!(layout.total_inodes, 256);
        assert_eq!(layout.block_bitmap_blocks, 1);
        assert_eq!(layout.inode_bitmap_blocks, 1);
        assert_eq!(layout.inode_table_blocks, 16);
        assert_eq!(layout.data_start, 19);
    }

    #[test]
    fn test_inode_location() {
        let layout = Layout::new(1024);
        assert_eq!(layout.inode_location(1).unwrap(), (layout.inode_table, 0));
        assert_eq!(
            layout.inode_location(17).unwrap(),
            (layout.inode_table + 1, 0)
        );
        assert_eq!(
            layout.inode_location(18).unwrap(),
            (layout.inode_table + 1, INODE_SIZE)
        );
        assert!(layout.inode_location(0).is_err());
        assert!(layout.inode_location(257).is_err());
    }

    #[tokio::test]
    async fn test_format_counters() {
        let device = Arc::new(MemoryBlockDevice::new(4 * MIB));
        let sb = format_volume(device.clone(), &FormatOptions::default())
            .await
            .unwrap();

        assert_eq!(sb.total_blocks, 1024);
        assert_eq!(sb.free_blocks, 1024 - 19);
        assert_eq!(sb.total_inodes, 256);
        assert_eq!(sb.free_inodes, 255);

        let on_disk = read_superblock(device.as_ref()).await.unwrap();
        assert_eq!(on_disk, sb);

        let cache = BlockCache::new(device, 4);
        let root = read_inode(&cache, &Layout::new(1024), ROOT_INODE)
            .await
            .unwrap();
        assert!(root.is_dir());
        assert_eq!(root.refs, 1);
        assert_eq!(root.size, 0);
    }

    #[tokio::test]
    async fn test_format_rejects_tiny_device() {
        let device = Arc::new(MemoryBlockDevice::new(4 * BLOCK_SIZE as u64));
        let err = format_volume(device, &FormatOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_format_encrypt_needs_key() {
        let device = Arc::new(MemoryBlockDevice::new(MIB));
        let options = FormatOptions {
            features: Features::ENCRYPT,
            ..FormatOptions::default()
        };
        let err = format_volume(device, &options).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
