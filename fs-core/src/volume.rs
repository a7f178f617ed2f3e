//! Mount state and volume lifecycle
//!
//! [`MountState`] is everything a mounted volume keeps in memory. It is
//! created by a successful mount and dropped by unmount; a mount that fails
//! at any step returns before a `MountState` exists, so nothing leaks.

use serde::Serialize;
use std::sync::Arc;

use crate::block_bitmap::Allocator;
use crate::blockdev::{BlockDevice, BlockDeviceError, BLOCK_SIZE};
use crate::cache::{BlockCache, DEFAULT_CACHE_BLOCKS};
use crate::error::{Error, Result};
use crate::format::{Features, FileKind, Inode, Superblock, VolumeState};
use crate::layout::{self, now_secs, read_superblock, Layout};
use crate::modules::codec::{self, Key, VolumeKeys};
use crate::modules::dedup::{DedupIndex, DedupStats};
use crate::modules::journaling::Journal;
use crate::modules::snapshot::SnapshotTable;

/// Options for mounting a volume
#[derive(Clone)]
pub struct MountOptions {
    /// Master key; required by volumes with the encrypt feature
    pub master_key: Option<Key>,
    /// Byte-compare a dedup candidate before sharing it
    pub verify_dedup_hits: bool,
    /// Metadata blocks kept in the LRU cache
    pub cache_blocks: usize,
    /// Transaction log; required by volumes with the journal feature
    pub journal: Option<Arc<dyn Journal>>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            master_key: None,
            verify_dedup_hits: false,
            cache_blocks: DEFAULT_CACHE_BLOCKS,
            journal: None,
        }
    }
}

impl std::fmt::Debug for MountOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountOptions")
            .field("master_key", &self.master_key.map(|_| ".."))
            .field("verify_dedup_hits", &self.verify_dedup_hits)
            .field("cache_blocks", &self.cache_blocks)
            .field("journal", &self.journal.is_some())
            .finish()
    }
}

/// Volume summary returned by `statfs`
#[derive(Debug, Clone, Serialize)]
pub struct VolumeInfo {
    pub label: String,
    pub volume_id: String,
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub features: Vec<&'static str>,
    pub default_compression: &'static str,
    pub default_encryption: &'static str,
    pub state: &'static str,
    pub created: u64,
    pub last_mount: u64,
    pub mount_count: u32,
    pub root_inode: u64,
    pub active_snapshot: u64,
    pub snapshots: usize,
    /// Distinct data blocks in the reference ledger
    pub tracked_blocks: usize,
    pub dedup: DedupStats,
}

/// In-memory state of a mounted volume
pub(crate) struct MountState {
    pub device: Arc<dyn BlockDevice>,
    pub cache: BlockCache,
    pub layout: Layout,
    pub sb: Superblock,
    pub alloc: Allocator,
    pub dedup: DedupIndex,
    pub snapshots: SnapshotTable,
    pub keys: Option<VolumeKeys>,
    pub verify_dedup_hits: bool,
    pub read_only: bool,
}

impl MountState {
    /// Validate the volume on `device` and load its tables
    pub async fn mount(device: Arc<dyn BlockDevice>, options: &MountOptions) -> Result<Self> {
        let mut sb = read_superblock(device.as_ref()).await?;
        let layout = Layout::from_superblock(&sb, device.block_count())?;

        let unknown = sb.features.unknown_bits();
        if unknown != 0 {
            return Err(Error::CorruptSuperblock(format!(
                "unknown feature bits {:#x}",
                unknown
            )));
        }
        if sb.features.contains(Features::JOURNAL) && options.journal.is_none() {
            return Err(Error::FeatureDisabled("journal"));
        }

        let keys = if sb.features.contains(Features::ENCRYPT) {
            let master = options
                .master_key
                .as_ref()
                .ok_or_else(|| Error::CryptoFailure("volume needs a master key".to_string()))?;
            if codec::key_verifier(master, &sb.key_salt)? != sb.key_check {
                return Err(Error::CryptoFailure("wrong master key".to_string()));
            }
            Some(VolumeKeys::derive(master, &sb.key_salt)?)
        } else {
            None
        };

        let alloc = Allocator::load(device.as_ref(), &layout).await?;
        if alloc.free_blocks() != sb.free_blocks || alloc.free_inodes() != sb.free_inodes {
            log::warn!(
                "MOUNT: superblock counters ({} blocks, {} inodes) disagree with bitmaps ({}, {}), using bitmaps",
                sb.free_blocks,
                sb.free_inodes,
                alloc.free_blocks(),
                alloc.free_inodes()
            );
        }
        let unclean = sb.state == VolumeState::Mounted;
        if unclean {
            log::warn!("MOUNT: volume was not cleanly unmounted");
        }

        let read_only = device.is_read_only();
        let cache = BlockCache::new(device.clone(), options.cache_blocks);
        let dedup_enabled = sb.features.contains(Features::DEDUP);

        let mut state = Self {
            device,
            cache,
            layout,
            sb: sb.clone(),
            alloc,
            dedup: DedupIndex::new(false)?,
            snapshots: SnapshotTable::new(),
            keys,
            verify_dedup_hits: options.verify_dedup_hits,
            read_only,
        };

        let root = state.load_inode(sb.root_inode).await.map_err(|e| {
            Error::CorruptSuperblock(format!("root inode {} unreadable: {}", sb.root_inode, e))
        })?;
        if !root.is_dir() {
            return Err(Error::CorruptSuperblock(
                "root inode is not a directory".to_string(),
            ));
        }

        state.dedup = if sb.dedup_inode != 0 {
            let bytes = state.read_stream(sb.dedup_inode).await?;
            DedupIndex::from_bytes(&bytes, dedup_enabled)?
        } else {
            DedupIndex::new(dedup_enabled)?
        };
        if sb.snapshot_inode != 0 {
            let bytes = state.read_stream(sb.snapshot_inode).await?;
            state.snapshots = SnapshotTable::from_bytes(&bytes)?;
        }

        if unclean && !read_only {
            state.rebuild_references().await?;
        }

        if !read_only {
            sb.state = VolumeState::Mounted;
            sb.last_mount = now_secs();
            sb.mount_count = sb.mount_count.wrapping_add(1);
            // The rebuild may have placed the dedup table
            sb.dedup_inode = state.sb.dedup_inode;
            sb.snapshot_inode = state.sb.snapshot_inode;
            state.sb = sb;
            state.write_superblock().await?;
            state.device.sync().await?;
        }

        log::info!(
            "MOUNT: volume {} '{}' mounted{}, features [{}], {} free blocks",
            state.sb.volume_id_string(),
            state.sb.label(),
            if read_only { " read-only" } else { "" },
            state.sb.features.names().join(","),
            state.alloc.free_blocks()
        );
        Ok(state)
    }

    /// Flush everything and mark the volume clean
    pub async fn unmount(mut self) -> Result<()> {
        if !self.read_only {
            self.persist().await?;
            self.sb.state = VolumeState::Clean;
            self.write_superblock().await?;
            self.device.sync().await?;
        }
        self.dedup.release_table();
        log::info!("MOUNT: volume {} unmounted", self.sb.volume_id_string());
        Ok(())
    }

    /// Write tables, bitmaps and superblock, then sync the device
    pub async fn persist(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        if self.sb.dedup_inode != 0 || !self.dedup.is_empty() {
            let bytes = self.dedup.to_bytes()?;
            let inode = self.metadata_inode(MetaTable::Dedup).await?;
            self.write_stream(inode, &bytes).await?;
        }
        if self.sb.snapshot_inode != 0 || !self.snapshots.is_empty() {
            let bytes = self.snapshots.to_bytes()?;
            let inode = self.metadata_inode(MetaTable::Snapshots).await?;
            self.write_stream(inode, &bytes).await?;
        }
        self.flush_metadata().await?;
        self.device.sync().await?;
        Ok(())
    }

    /// Write changed bitmap blocks and the superblock
    ///
    /// Runs after every mutating operation, so the allocation state and the
    /// live root on disk never lag the inodes and extent chains, which are
    /// written through. Allocates nothing.
    pub async fn flush_metadata(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.alloc.flush(self.device.as_ref(), &self.layout).await?;
        self.write_superblock().await
    }

    /// Refresh the superblock counters and write block 0
    pub async fn write_superblock(&mut self) -> Result<()> {
        self.sb.free_blocks = self.alloc.free_blocks();
        self.sb.free_inodes = self.alloc.free_inodes();
        self.sb.last_write = now_secs();
        let block = self.sb.encode()?;
        self.device.write_block(0, &block).await?;
        Ok(())
    }

    /// Inode holding a metadata table, allocated on first use
    async fn metadata_inode(&mut self, table: MetaTable) -> Result<u64> {
        let existing = match table {
            MetaTable::Dedup => self.sb.dedup_inode,
            MetaTable::Snapshots => self.sb.snapshot_inode,
        };
        if existing != 0 {
            return Ok(existing);
        }

        let id = self.alloc.allocate_inode()?;
        let inode = Inode::new(id, FileKind::File, 0o600, 0, now_secs());
        if let Err(e) = self.store_inode(&inode).await {
            self.alloc.free_inode(id)?;
            return Err(e);
        }
        match table {
            MetaTable::Dedup => self.sb.dedup_inode = id,
            MetaTable::Snapshots => self.sb.snapshot_inode = id,
        }
        log::debug!("MOUNT: {:?} table stored in inode {}", table, id);
        Ok(id)
    }

    pub fn has_feature(&self, feature: Features) -> bool {
        self.sb.features.contains(feature)
    }

    /// Fail unless `feature` is enabled on this volume
    pub fn require(&self, feature: Features, name: &'static str) -> Result<()> {
        if self.has_feature(feature) {
            Ok(())
        } else {
            Err(Error::FeatureDisabled(name))
        }
    }

    pub fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::Device(BlockDeviceError::ReadOnly));
        }
        Ok(())
    }

    /// Live root directory inode
    pub fn root(&self) -> u64 {
        self.sb.root_inode
    }

    pub fn info(&self) -> VolumeInfo {
        VolumeInfo {
            label: self.sb.label(),
            volume_id: self.sb.volume_id_string(),
            block_size: BLOCK_SIZE as u32,
            total_blocks: self.sb.total_blocks,
            free_blocks: self.alloc.free_blocks(),
            total_inodes: self.sb.total_inodes,
            free_inodes: self.alloc.free_inodes(),
            features: self.sb.features.names(),
            default_compression: self.sb.default_compression.name(),
            default_encryption: self.sb.default_encryption.name(),
            state: self.sb.state.name(),
            created: self.sb.created,
            last_mount: self.sb.last_mount,
            mount_count: self.sb.mount_count,
            root_inode: self.sb.root_inode,
            active_snapshot: self.sb.active_snapshot,
            snapshots: self.snapshots.len(),
            tracked_blocks: self.dedup.len(),
            dedup: self.dedup.stats(),
        }
    }

    /// Bytes of data currently allocated on the volume
    pub fn used_bytes(&self) -> u64 {
        self.alloc.used_data_blocks() * BLOCK_SIZE as u64
    }
}

#[derive(Debug, Clone, Copy)]
enum MetaTable {
    Dedup,
    Snapshots,
}

/// Read the superblock of an unmounted volume
pub async fn probe(device: &dyn BlockDevice) -> Result<Superblock> {
    let sb = layout::read_superblock(device).await?;
    Layout::from_superblock(&sb, device.block_count())?;
    Ok(sb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemoryBlockDevice;
    use crate::layout::{format_volume, FormatOptions};

    const MIB: u64 = 1024 * 1024;

    async fn formatted(options: &FormatOptions) -> Arc<MemoryBlockDevice> {
        let device = Arc::new(MemoryBlockDevice::new(4 * MIB));
        format_volume(device.clone(), options).await.unwrap();
        device
    }

    #[tokio::test]
    async fn test_mount_updates_superblock() {
        let device = formatted(&FormatOptions::default()).await;
        let state = MountState::mount(device.clone(), &MountOptions::default())
            .await
            .unwrap();
        assert_eq!(state.sb.state, VolumeState::Mounted);
        assert_eq!(state.sb.mount_count, 1);
        state.unmount().await.unwrap();

        let sb = probe(device.as_ref()).await.unwrap();
        assert_eq!(sb.state, VolumeState::Clean);
        assert_eq!(sb.mount_count, 1);
        assert_eq!(sb.free_inodes, 255);
    }

    #[tokio::test]
    async fn test_journal_volume_needs_journal() {
        let options = FormatOptions {
            features: Features::SNAPSHOT | Features::JOURNAL,
            ..FormatOptions::default()
        };
        let device = formatted(&options).await;
        let err = MountState::mount(device, &MountOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::FeatureDisabled("journal")));
    }

    #[tokio::test]
    async fn test_encrypted_volume_checks_key() {
        let options = FormatOptions {
            features: Features::ENCRYPT,
            master_key: Some([5u8; 32]),
            ..FormatOptions::default()
        };
        let device = formatted(&options).await;

        let missing = MountState::mount(device.clone(), &MountOptions::default()).await;
        assert!(matches!(missing, Err(Error::CryptoFailure(_))));

        let wrong = MountOptions {
            master_key: Some([6u8; 32]),
            ..MountOptions::default()
        };
        assert!(matches!(
            MountState::mount(device.clone(), &wrong).await,
            Err(Error::CryptoFailure(_))
        ));

        let right = MountOptions {
            master_key: Some([5u8; 32]),
            ..MountOptions::default()
        };
        let state = MountState::mount(device, &right).await.unwrap();
        assert!(state.keys.is_some());
    }

    #[tokio::test]
    async fn test_dedup_table_allocated_only_when_enabled() {
        let device = formatted(&FormatOptions::default()).await;
        let state = MountState::mount(device, &MountOptions::default())
            .await
            .unwrap();
        assert!(!state.dedup.is_enabled());

        let options = FormatOptions {
            features: Features::DEDUP,
            ..FormatOptions::default()
        };
        let device = formatted(&options).await;
        let state = MountState::mount(device, &MountOptions::default())
            .await
            .unwrap();
        assert!(state.dedup.is_enabled());
    }
}
