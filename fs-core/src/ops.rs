//! File-system operation surface
//!
//! [`FileSystemOps`] is the contract a dispatch layer routes path operations
//! through; [`AuroraFs`] implements it. Every call takes the mount-wide lock,
//! checks that a volume is mounted and then delegates to the mount state.
//! Mutating calls on a journaled volume are bracketed by the journal.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::blockdev::BlockDevice;
use crate::dir::{split_parent, split_path};
use crate::error::{Error, Result};
use crate::format::{Features, FileKind, Inode, S_IFMT};
use crate::layout::now_secs;
use crate::modules::checksums::ScrubReport;
use crate::modules::journaling::TxnId;
use crate::modules::snapshot::SnapshotInfo;
use crate::volume::{MountOptions, MountState, VolumeInfo};

const DEFAULT_FILE_PERM: u32 = 0o644;
const DEFAULT_DIR_PERM: u32 = 0o755;

/// One `readdir` result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub inode: u64,
    pub kind: FileKind,
}

/// Attributes of a file or directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStat {
    pub inode: u64,
    pub kind: &'static str,
    /// Permission bits
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blocks: u64,
    pub links: u16,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub compression: &'static str,
    pub encryption: &'static str,
    /// Hex SHA-256 over size and block hashes, empty for empty files
    pub content_hash: String,
}

impl FileStat {
    fn from_inode(inode: &Inode) -> Self {
        let content_hash = if inode.content_hash == [0u8; 32] {
            String::new()
        } else {
            inode
                .content_hash
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect()
        };
        Self {
            inode: inode.id,
            kind: if inode.is_dir() { "directory" } else { "file" },
            mode: inode.perm(),
            uid: inode.uid,
            gid: inode.gid,
            size: inode.size,
            blocks: inode.blocks,
            links: inode.links,
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
            compression: inode.compression.name(),
            encryption: inode.encryption.name(),
            content_hash,
        }
    }
}

/// Where one logical block of a file is stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtentInfo {
    /// Logical block index within the file
    pub logical: u64,
    pub physical: u64,
    /// Current reference count of the physical block
    pub refcount: u32,
    pub stored_size: u32,
    pub logical_size: u32,
    pub compression: &'static str,
    pub encryption: &'static str,
}

/// Generic file-system operation set
#[async_trait]
pub trait FileSystemOps: Send + Sync {
    /// Backend name
    fn name(&self) -> &'static str;

    /// Mount the volume on `device`
    async fn mount(&self, device: Arc<dyn BlockDevice>) -> Result<()>;

    /// Flush and release the mounted volume
    async fn unmount(&self) -> Result<()>;

    /// Resolve `path` to an inode number
    async fn lookup(&self, path: &str) -> Result<u64>;

    /// Create an empty file or directory at `path`
    async fn create(&self, path: &str, kind: FileKind) -> Result<u64>;

    /// Remove the file at `path`
    async fn unlink(&self, path: &str) -> Result<()>;

    /// Entry `index` of directory `dir`; `.` and `..` come first
    async fn readdir(&self, dir: u64, index: usize) -> Result<Option<DirEntryInfo>>;

    /// Create a directory with permission bits `mode`
    async fn mkdir(&self, path: &str, mode: u32) -> Result<u64>;

    /// Remove the empty directory at `path`
    async fn rmdir(&self, path: &str) -> Result<()>;

    async fn chmod(&self, path: &str, mode: u32) -> Result<()>;

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()>;

    /// Move `old` to `new`, replacing a compatible target
    async fn rename(&self, old: &str, new: &str) -> Result<()>;
}

/// An AuroraFS volume behind the mount-wide lock
pub struct AuroraFs {
    options: MountOptions,
    state: Mutex<Option<MountState>>,
}

impl AuroraFs {
    pub fn new(options: MountOptions) -> Self {
        Self {
            options,
            state: Mutex::new(None),
        }
    }

    pub async fn is_mounted(&self) -> bool {
        self.state.lock().await.is_some()
    }

    fn begin(&self, state: &MountState, op: &str) -> Result<Option<TxnId>> {
        match &self.options.journal {
            Some(journal) if state.has_feature(Features::JOURNAL) => journal.begin(op).map(Some),
            _ => Ok(None),
        }
    }

    /// Flush allocation state and close the journal transaction
    ///
    /// Failed operations have already undone their allocations in memory,
    /// so the bitmaps are flushed on both paths.
    async fn finish<T>(
        &self,
        state: &mut MountState,
        txn: Option<TxnId>,
        result: Result<T>,
    ) -> Result<T> {
        let result = match (result, state.flush_metadata().await) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), flushed) => {
                if let Err(flush) = flushed {
                    log::error!("MOUNT: metadata flush after a failed operation: {}", flush);
                }
                Err(e)
            }
        };
        let (Some(txn), Some(journal)) = (txn, &self.options.journal) else {
            return result;
        };
        match result {
            Ok(value) => {
                journal.commit(txn)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort) = journal.abort(txn) {
                    log::error!("JOURNAL: abort of {} failed: {}", txn, abort);
                }
                Err(e)
            }
        }
    }

    /// Read up to `len` bytes of the file at `path` starting at `offset`
    pub async fn read(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(Error::NotMounted)?;
        let inode = state.resolve_path(path).await?;
        if inode.is_dir() {
            return Err(Error::IsADirectory);
        }
        state.read_data(&inode, offset, len).await
    }

    /// Write `data` into the file at `path`, returning the bytes written
    pub async fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<usize> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(Error::NotMounted)?;
        state.ensure_writable()?;
        let txn = self.begin(state, "write")?;
        let result = state.write_path(path, offset, data).await;
        self.finish(state, txn, result).await
    }

    /// Set the size of the file at `path`
    pub async fn truncate(&self, path: &str, size: u64) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(Error::NotMounted)?;
        state.ensure_writable()?;
        let txn = self.begin(state, "truncate")?;
        let result = state.truncate_path(path, size).await;
        self.finish(state, txn, result).await
    }

    pub async fn stat(&self, path: &str) -> Result<FileStat> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(Error::NotMounted)?;
        let inode = state.resolve_path(path).await?;
        Ok(FileStat::from_inode(&inode))
    }

    pub async fn statfs(&self) -> Result<VolumeInfo> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(Error::NotMounted)?;
        Ok(state.info())
    }

    /// Persist tables, bitmaps and superblock without unmounting
    pub async fn sync(&self) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(Error::NotMounted)?;
        state.persist().await
    }

    /// Snapshot the live tree, returning the new snapshot id
    pub async fn create_snapshot(&self, name: &str, description: &str) -> Result<u64> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(Error::NotMounted)?;
        state.require(Features::SNAPSHOT, "snapshot")?;
        state.ensure_writable()?;
        let txn = self.begin(state, "snapshot-create")?;
        let result = state.create_snapshot(name, description).await;
        self.finish(state, txn, result).await
    }

    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(Error::NotMounted)?;
        state.list_snapshots()
    }

    pub async fn find_snapshot(&self, name: &str) -> Result<SnapshotInfo> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(Error::NotMounted)?;
        state.find_snapshot(name)
    }

    /// Make snapshot `id` the live tree
    pub async fn rollback_snapshot(&self, id: u64) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(Error::NotMounted)?;
        state.require(Features::SNAPSHOT, "snapshot")?;
        state.ensure_writable()?;
        let txn = self.begin(state, "snapshot-rollback")?;
        let result = state.rollback_snapshot(id).await;
        self.finish(state, txn, result).await
    }

    pub async fn delete_snapshot(&self, id: u64) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(Error::NotMounted)?;
        state.require(Features::SNAPSHOT, "snapshot")?;
        state.ensure_writable()?;
        let txn = self.begin(state, "snapshot-delete")?;
        let result = state.delete_snapshot(id).await;
        self.finish(state, txn, result).await
    }

    /// Block map of the file or directory at `path`
    pub async fn extents(&self, path: &str) -> Result<Vec<ExtentInfo>> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(Error::NotMounted)?;
        let inode = state.resolve_path(path).await?;
        let map = state.load_extents(&inode).await?;
        Ok(map
            .extents
            .values()
            .map(|extent| ExtentInfo {
                logical: extent.logical,
                physical: extent.physical,
                refcount: state.dedup.refcount(extent.physical).unwrap_or(0),
                stored_size: extent.stored_size,
                logical_size: extent.logical_size,
                compression: extent.compression.name(),
                encryption: extent.encryption.name(),
            })
            .collect())
    }

    /// Verify every reachable block and the reference counts
    pub async fn scrub(&self) -> Result<ScrubReport> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(Error::NotMounted)?;
        state.scrub().await
    }

    /// Other files in the live tree whose content equals the file at `path`
    pub async fn find_duplicates(&self, path: &str) -> Result<Vec<String>> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(Error::NotMounted)?;
        let target = state.resolve_path(path).await?;
        if target.is_dir() {
            return Err(Error::IsADirectory);
        }
        if target.size == 0 {
            return Ok(Vec::new());
        }
        Ok(state
            .walk_files()
            .await?
            .into_iter()
            .filter(|(_, inode)| {
                inode.id != target.id
                    && inode.size == target.size
                    && inode.content_hash == target.content_hash
            })
            .map(|(path, _)| path)
            .collect())
    }
}

#[async_trait]
impl FileSystemOps for AuroraFs {
    fn name(&self) -> &'static str {
        "aurorafs"
    }

    async fn mount(&self, device: Arc<dyn BlockDevice>) -> Result<()> {
        let mut guard = self.state.lock().await;
        if guard.is_some() {
            return Err(Error::AlreadyMounted);
        }
        let state = MountState::mount(device, &self.options).await?;
        *guard = Some(state);
        Ok(())
    }

    async fn unmount(&self) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard.take().ok_or(Error::NotMounted)?;
        state.unmount().await
    }

    async fn lookup(&self, path: &str) -> Result<u64> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(Error::NotMounted)?;
        Ok(state.resolve_path(path).await?.id)
    }

    async fn create(&self, path: &str, kind: FileKind) -> Result<u64> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(Error::NotMounted)?;
        state.ensure_writable()?;
        let perm = match kind {
            FileKind::File => DEFAULT_FILE_PERM,
            FileKind::Directory => DEFAULT_DIR_PERM,
        };
        let txn = self.begin(state, "create")?;
        let result = state.create_entry(path, kind, perm).await;
        self.finish(state, txn, result).await
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(Error::NotMounted)?;
        state.ensure_writable()?;
        let txn = self.begin(state, "unlink")?;
        let result = state.remove_entry(path, false).await;
        self.finish(state, txn, result).await
    }

    async fn readdir(&self, dir: u64, index: usize) -> Result<Option<DirEntryInfo>> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(Error::NotMounted)?;
        let inode = state.load_inode(dir).await?;
        if !inode.is_dir() {
            return Err(Error::NotADirectory);
        }
        let entry = match index {
            0 => Some((".".to_string(), inode.id)),
            1 => Some(("..".to_string(), state.live_parent(&inode).await?)),
            _ => {
                let listing = state.load_dir(&inode).await?;
                return Ok(listing.nth(index - 2).map(|(name, child, kind)| DirEntryInfo {
                    name: name.to_string(),
                    inode: child,
                    kind,
                }));
            }
        };
        Ok(entry.map(|(name, inode)| DirEntryInfo {
            name,
            inode,
            kind: FileKind::Directory,
        }))
    }

    async fn mkdir(&self, path: &str, mode: u32) -> Result<u64> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(Error::NotMounted)?;
        state.ensure_writable()?;
        let txn = self.begin(state, "mkdir")?;
        let result = state.create_entry(path, FileKind::Directory, mode).await;
        self.finish(state, txn, result).await
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(Error::NotMounted)?;
        state.ensure_writable()?;
        let txn = self.begin(state, "rmdir")?;
        let result = state.remove_entry(path, true).await;
        self.finish(state, txn, result).await
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(Error::NotMounted)?;
        state.ensure_writable()?;
        let txn = self.begin(state, "chmod")?;
        let result = state
            .update_attrs(path, |inode| {
                inode.mode = (inode.mode & S_IFMT) | (mode & 0o7777);
            })
            .await;
        self.finish(state, txn, result).await
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(Error::NotMounted)?;
        state.ensure_writable()?;
        let txn = self.begin(state, "chown")?;
        let result = state
            .update_attrs(path, |inode| {
                inode.uid = uid;
                inode.gid = gid;
            })
            .await;
        self.finish(state, txn, result).await
    }

    async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(Error::NotMounted)?;
        state.ensure_writable()?;
        let txn = self.begin(state, "rename")?;
        let result = state.rename_entry(old, new).await;
        self.finish(state, txn, result).await
    }
}

impl MountState {
    async fn create_entry(&mut self, path: &str, kind: FileKind, perm: u32) -> Result<u64> {
        let (parent_parts, name) = split_parent(path)?;
        let parent = self.resolve(&parent_parts).await?;
        if self.load_dir(&parent).await?.get(name).is_some() {
            return Err(Error::AlreadyExists);
        }

        let mut parent = self.make_path_exclusive(&parent_parts).await?;
        let mut dir = self.load_dir(&parent).await?;
        let child = self.new_inode(kind, perm, parent.id).await?;
        dir.insert(name, child.id, kind);
        if kind == FileKind::Directory {
            parent.links = parent.links.saturating_add(1);
        }
        if let Err(e) = self.store_dir(&mut parent, &dir).await {
            self.release_inode(child.id).await?;
            return Err(e);
        }
        log::debug!("OPS: created {} as inode {}", path, child.id);
        Ok(child.id)
    }

    /// Shared body of `unlink` (`dir == false`) and `rmdir`
    async fn remove_entry(&mut self, path: &str, dir: bool) -> Result<()> {
        let parts = split_path(path)?;
        let Some((name, parent_parts)) = parts.split_last() else {
            return Err(Error::invalid("cannot remove the root directory"));
        };
        let target = self.resolve(&parts).await?;
        match (dir, target.is_dir()) {
            (false, true) => return Err(Error::IsADirectory),
            (true, false) => return Err(Error::NotADirectory),
            (true, true) => {
                if !self.load_dir(&target).await?.is_empty() {
                    return Err(Error::DirectoryNotEmpty);
                }
            }
            (false, false) => {}
        }

        let mut parent = self.make_path_exclusive(parent_parts).await?;
        let mut listing = self.load_dir(&parent).await?;
        let (child, _) = listing.remove(name).ok_or(Error::NotFound)?;
        if dir {
            parent.links = parent.links.saturating_sub(1).max(2);
        }
        self.store_dir(&mut parent, &listing).await?;
        self.release_inode(child).await?;
        log::debug!("OPS: removed {} (inode {})", path, child);
        Ok(())
    }

    async fn update_attrs<F>(&mut self, path: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Inode) + Send,
    {
        let parts = split_path(path)?;
        self.resolve(&parts).await?;
        let mut inode = self.make_path_exclusive(&parts).await?;
        apply(&mut inode);
        inode.ctime = now_secs();
        self.store_inode(&inode).await
    }

    async fn write_path(&mut self, path: &str, offset: u64, data: &[u8]) -> Result<usize> {
        let parts = split_path(path)?;
        if self.resolve(&parts).await?.is_dir() {
            return Err(Error::IsADirectory);
        }
        let mut inode = self.make_path_exclusive(&parts).await?;
        self.write_data(&mut inode, offset, data).await
    }

    async fn truncate_path(&mut self, path: &str, size: u64) -> Result<()> {
        let parts = split_path(path)?;
        if self.resolve(&parts).await?.is_dir() {
            return Err(Error::IsADirectory);
        }
        let mut inode = self.make_path_exclusive(&parts).await?;
        self.truncate_data(&mut inode, size).await
    }

    async fn rename_entry(&mut self, old: &str, new: &str) -> Result<()> {
        let src_parts = split_path(old)?;
        let dst_parts = split_path(new)?;
        let (Some((src_name, src_parent)), Some((dst_name, dst_parent))) =
            (src_parts.split_last(), dst_parts.split_last())
        else {
            return Err(Error::invalid("cannot rename the root directory"));
        };

        let src = self.resolve(&src_parts).await?;
        if src_parts == dst_parts {
            return Ok(());
        }
        if src.is_dir() && dst_parts.starts_with(&src_parts) {
            return Err(Error::invalid(format!(
                "cannot move {} into its own subtree",
                old
            )));
        }

        let dst_dir = self.resolve(dst_parent).await?;
        let replaced = match self.load_dir(&dst_dir).await?.get(dst_name) {
            Some((id, _)) => {
                let existing = self.load_inode(id).await?;
                match (src.is_dir(), existing.is_dir()) {
                    (true, false) => return Err(Error::NotADirectory),
                    (false, true) => return Err(Error::IsADirectory),
                    (true, true) => {
                        if !self.load_dir(&existing).await?.is_empty() {
                            return Err(Error::DirectoryNotEmpty);
                        }
                    }
                    (false, false) => {}
                }
                Some(existing)
            }
            None => None,
        };
        let kind = if src.is_dir() {
            FileKind::Directory
        } else {
            FileKind::File
        };

        if src_parent == dst_parent {
            let mut parent = self.make_path_exclusive(src_parent).await?;
            let mut listing = self.load_dir(&parent).await?;
            let (child, _) = listing.remove(src_name).ok_or(Error::NotFound)?;
            let displaced = listing.remove(dst_name);
            listing.insert(dst_name, child, kind);
            if displaced.map_or(false, |(_, k)| k == FileKind::Directory) {
                parent.links = parent.links.saturating_sub(1).max(2);
            }
            self.store_dir(&mut parent, &listing).await?;
            if let Some((id, _)) = displaced {
                self.release_inode(id).await?;
            }
        } else {
            // Make both parents private first, then work on fresh copies
            // since either may be an ancestor of the other
            let src_id = self.make_path_exclusive(src_parent).await?.id;
            let dst_id = self.make_path_exclusive(dst_parent).await?.id;

            let mut from = self.load_inode(src_id).await?;
            let mut listing = self.load_dir(&from).await?;
            let (child, _) = listing.remove(src_name).ok_or(Error::NotFound)?;
            if kind == FileKind::Directory {
                from.links = from.links.saturating_sub(1).max(2);
            }
            self.store_dir(&mut from, &listing).await?;

            let mut to = self.load_inode(dst_id).await?;
            let mut listing = self.load_dir(&to).await?;
            let displaced = listing.remove(dst_name);
            listing.insert(dst_name, child, kind);
            let displaced_dir = displaced.map_or(false, |(_, k)| k == FileKind::Directory);
            if kind == FileKind::Directory && !displaced_dir {
                to.links = to.links.saturating_add(1);
            }
            self.store_dir(&mut to, &listing).await?;
            if let Some((id, _)) = displaced {
                self.release_inode(id).await?;
            }

            // Re-parents the moved inode, cloning it if a snapshot shares it
            self.make_path_exclusive(&dst_parts).await?;
        }

        log::debug!(
            "OPS: renamed {} -> {}{}",
            old,
            new,
            if replaced.is_some() { " (replaced target)" } else { "" }
        );
        Ok(())
    }
}
