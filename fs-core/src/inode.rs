//! Inode lifecycle
//!
//! Inodes are shared between the live tree and snapshots through `refs`.
//! A shared inode is never modified in place: the mutating path clones it
//! first (see `make_path_exclusive` in `dir.rs`).

use crate::error::{Error, Result};
use crate::format::{Features, FileKind, Inode, INODE_FLAG_HAS_KEY};
use crate::layout::{self, now_secs};
use crate::modules::codec::{self, Key};
use crate::volume::MountState;

impl MountState {
    pub(crate) async fn load_inode(&self, id: u64) -> Result<Inode> {
        layout::read_inode(&self.cache, &self.layout, id).await
    }

    pub(crate) async fn store_inode(&self, inode: &Inode) -> Result<()> {
        layout::write_inode(&self.cache, &self.layout, inode).await
    }

    /// Allocate and persist a fresh inode with one reference
    ///
    /// New inodes take the volume's default codecs. On an encrypted volume
    /// each one gets its own random content key, wrapped under the volume
    /// wrapping key.
    pub(crate) async fn new_inode(&mut self, kind: FileKind, perm: u32, parent: u64) -> Result<Inode> {
        let id = self.alloc.allocate_inode()?;
        match self.init_inode(id, kind, perm, parent).await {
            Ok(inode) => Ok(inode),
            Err(e) => {
                self.alloc.free_inode(id)?;
                Err(e)
            }
        }
    }

    async fn init_inode(&self, id: u64, kind: FileKind, perm: u32, parent: u64) -> Result<Inode> {
        let mut inode = Inode::new(id, kind, perm, parent, now_secs());
        if self.has_feature(Features::COMPRESS) {
            inode.compression = self.sb.default_compression;
        }
        if self.has_feature(Features::ENCRYPT) {
            let keys = self
                .keys
                .as_ref()
                .ok_or_else(|| Error::CryptoFailure("volume keys not loaded".to_string()))?;
            let file_key = codec::random_key()?;
            inode.wrapped_key = codec::wrap_key(&keys.wrap, &file_key)?;
            inode.encryption = self.sb.default_encryption;
            inode.flags |= INODE_FLAG_HAS_KEY;
        }
        self.store_inode(&inode).await?;
        Ok(inode)
    }

    /// Unwrapped content key of `inode`, if it has one
    pub(crate) fn file_key(&self, inode: &Inode) -> Result<Option<Key>> {
        if inode.flags & INODE_FLAG_HAS_KEY == 0 {
            return Ok(None);
        }
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| Error::CryptoFailure("volume keys not loaded".to_string()))?;
        codec::unwrap_key(&keys.wrap, &inode.wrapped_key).map(Some)
    }

    /// Take one more tree reference on inode `id`
    pub(crate) async fn retain_inode(&mut self, id: u64) -> Result<()> {
        let mut inode = self.load_inode(id).await?;
        inode.refs = inode
            .refs
            .checked_add(1)
            .ok_or_else(|| Error::invalid(format!("inode {} reference overflow", id)))?;
        self.store_inode(&inode).await
    }

    /// Private copy of a shared inode, parented under `parent`
    ///
    /// The copy shares every data block (each block's refcount goes up by
    /// one) and, for a directory, every child inode (each child's `refs`
    /// goes up by one). It starts with a single reference and a fresh
    /// extent chain.
    pub(crate) async fn clone_inode(&mut self, src: &Inode, parent: u64) -> Result<Inode> {
        let id = self.alloc.allocate_inode()?;
        let mut copy = src.clone();
        copy.id = id;
        copy.refs = 1;
        copy.extent_root = 0;
        copy.extent_count = 0;
        copy.parent = if src.parent == src.id { id } else { parent };

        let mut map = match self.load_extents(src).await {
            Ok(map) => map.detached(),
            Err(e) => {
                self.alloc.free_inode(id)?;
                return Err(e);
            }
        };
        if let Err(e) = self.store_extents(&mut copy, &mut map).await {
            self.alloc.free_inode(id)?;
            return Err(e);
        }
        for extent in map.extents.values() {
            if !extent.is_raw() {
                self.dedup.inc_refcount(extent.physical)?;
            }
        }

        if src.is_dir() {
            let dir = self.load_dir(src).await?;
            for child in dir.child_ids() {
                self.retain_inode(child).await?;
            }
        }
        self.store_inode(&copy).await?;
        log::debug!("INODE: cloned {} -> {} ({} extents)", src.id, id, copy.extent_count);
        Ok(copy)
    }

    /// Drop one tree reference on inode `id`
    ///
    /// An inode whose last reference goes away releases its children, its
    /// data blocks (through the reference ledger), its extent chain and its
    /// inode slot. Deep trees are handled with an explicit work list.
    pub(crate) async fn release_inode(&mut self, id: u64) -> Result<()> {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let mut inode = self.load_inode(id).await?;
            if inode.refs > 1 {
                inode.refs -= 1;
                self.store_inode(&inode).await?;
                continue;
            }

            if inode.is_dir() {
                let dir = self.load_dir(&inode).await?;
                pending.extend(dir.child_ids());
            }
            let map = self.load_extents(&inode).await?;
            for extent in map.extents.values() {
                self.release_extent(extent)?;
            }
            self.free_chain(&map.chain)?;

            layout::clear_inode(&self.cache, &self.layout, id).await?;
            self.alloc.free_inode(id)?;
            log::debug!("INODE: released {}", id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemoryBlockDevice;
    use crate::format::EncryptionAlgorithm;
    use crate::layout::{format_volume, FormatOptions};
    use crate::volume::MountOptions;
    use std::sync::Arc;

    async fn mounted(options: FormatOptions, mount: MountOptions) -> MountState {
        let device = Arc::new(MemoryBlockDevice::new(4 * 1024 * 1024));
        format_volume(device.clone(), &options).await.unwrap();
        MountState::mount(device, &mount).await.unwrap()
    }

    #[tokio::test]
    async fn test_new_inode_takes_volume_codecs() {
        let key = [1u8; 32];
        let options = FormatOptions {
            features: Features::COMPRESS | Features::ENCRYPT,
            master_key: Some(key),
            ..FormatOptions::default()
        };
        let mount = MountOptions {
            master_key: Some(key),
            ..MountOptions::default()
        };
        let mut state = mounted(options, mount).await;

        let a = state.new_inode(FileKind::File, 0o644, 1).await.unwrap();
        let b = state.new_inode(FileKind::File, 0o644, 1).await.unwrap();
        assert_eq!(a.compression, state.sb.default_compression);
        assert_eq!(a.encryption, EncryptionAlgorithm::Aes256Gcm);

        let ka = state.file_key(&a).unwrap().unwrap();
        let kb = state.file_key(&b).unwrap().unwrap();
        assert_ne!(ka, kb);
        assert_eq!(state.load_inode(a.id).await.unwrap(), a);
    }

    #[tokio::test]
    async fn test_release_frees_slot_and_blocks() {
        let mut state = mounted(FormatOptions::default(), MountOptions::default()).await;
        let free_blocks = state.alloc.free_blocks();
        let free_inodes = state.alloc.free_inodes();

        let mut file = state.new_inode(FileKind::File, 0o644, 1).await.unwrap();
        state.write_data(&mut file, 0, &[0x5Au8; 10_000]).await.unwrap();
        assert!(state.alloc.free_blocks() < free_blocks);

        state.retain_inode(file.id).await.unwrap();
        state.release_inode(file.id).await.unwrap();
        assert_eq!(state.load_inode(file.id).await.unwrap().refs, 1);

        state.release_inode(file.id).await.unwrap();
        assert_eq!(state.alloc.free_blocks(), free_blocks);
        assert_eq!(state.alloc.free_inodes(), free_inodes);
        assert!(matches!(state.load_inode(file.id).await, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn test_clone_shares_blocks() {
        let mut state = mounted(FormatOptions::default(), MountOptions::default()).await;
        let mut file = state.new_inode(FileKind::File, 0o644, 1).await.unwrap();
        state.write_data(&mut file, 0, b"shared bytes").await.unwrap();

        let copy = state.clone_inode(&file, 1).await.unwrap();
        let physical = state.load_extents(&file).await.unwrap().extents[&0].physical;
        assert_eq!(state.dedup.refcount(physical), Some(2));
        assert_eq!(
            state.read_data(&copy, 0, 64).await.unwrap(),
            b"shared bytes".to_vec()
        );

        state.release_inode(file.id).await.unwrap();
        assert_eq!(state.dedup.refcount(physical), Some(1));
        assert_eq!(
            state.read_data(&copy, 0, 64).await.unwrap(),
            b"shared bytes".to_vec()
        );
    }
}
