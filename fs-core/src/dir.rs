//! Directories and path resolution
//!
//! A directory's entries are stored as its file data, so directory content
//! is compressed, encrypted, deduplicated and snapshotted exactly like file
//! content. In memory a directory is an ordered name map.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::format::{decode_dir_entries, encode_dir_entries, DirEntry, FileKind, Inode, MAX_NAME_LEN};
use crate::volume::MountState;

/// Decoded directory content
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Directory {
    entries: BTreeMap<String, (u64, FileKind)>,
}

impl Directory {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for entry in decode_dir_entries(bytes)? {
            let kind = entry.kind()?;
            if entries.insert(entry.name.clone(), (entry.inode, kind)).is_some() {
                return Err(Error::format(format!(
                    "directory lists '{}' twice",
                    entry.name
                )));
            }
        }
        Ok(Self { entries })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let records = self
            .entries
            .iter()
            .map(|(name, &(inode, kind))| DirEntry::new(inode, name, kind))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(encode_dir_entries(&records)?)
    }

    pub fn get(&self, name: &str) -> Option<(u64, FileKind)> {
        self.entries.get(name).copied()
    }

    pub fn insert(&mut self, name: &str, inode: u64, kind: FileKind) {
        self.entries.insert(name.to_string(), (inode, kind));
    }

    pub fn remove(&mut self, name: &str) -> Option<(u64, FileKind)> {
        self.entries.remove(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64, FileKind)> {
        self.entries
            .iter()
            .map(|(name, &(inode, kind))| (name.as_str(), inode, kind))
    }

    pub fn child_ids(&self) -> Vec<u64> {
        self.entries.values().map(|&(inode, _)| inode).collect()
    }

    /// Entry at `index` in name order
    pub fn nth(&self, index: usize) -> Option<(&str, u64, FileKind)> {
        self.iter().nth(index)
    }
}

/// Split an absolute path into its components
///
/// Empty components and `.` are skipped; `..` is refused.
pub(crate) fn split_path(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(Error::invalid(format!("path '{}' is not absolute", path)));
    }
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(Error::invalid("'..' is not supported in paths")),
            name if name.len() > MAX_NAME_LEN => {
                return Err(Error::invalid(format!(
                    "name of {} bytes exceeds {}",
                    name.len(),
                    MAX_NAME_LEN
                )))
            }
            name => parts.push(name),
        }
    }
    Ok(parts)
}

/// Split a path into its parent components and final name
pub(crate) fn split_parent(path: &str) -> Result<(Vec<&str>, &str)> {
    let mut parts = split_path(path)?;
    let name = parts
        .pop()
        .ok_or_else(|| Error::invalid("the root directory has no name"))?;
    Ok((parts, name))
}

impl MountState {
    pub(crate) async fn load_dir(&self, inode: &Inode) -> Result<Directory> {
        if !inode.is_dir() {
            return Err(Error::NotADirectory);
        }
        let bytes = self.read_data(inode, 0, inode.size as usize).await?;
        Directory::decode(&bytes)
    }

    pub(crate) async fn store_dir(&mut self, inode: &mut Inode, dir: &Directory) -> Result<()> {
        let bytes = dir.encode()?;
        self.replace_content(inode, &bytes).await
    }

    /// Resolve path components from the live root
    pub(crate) async fn resolve(&self, parts: &[&str]) -> Result<Inode> {
        let mut cur = self.load_inode(self.root()).await?;
        for name in parts {
            if !cur.is_dir() {
                return Err(Error::NotADirectory);
            }
            let dir = self.load_dir(&cur).await?;
            let (child, _) = dir.get(name).ok_or(Error::NotFound)?;
            cur = self.load_inode(child).await?;
        }
        Ok(cur)
    }

    pub(crate) async fn resolve_path(&self, path: &str) -> Result<Inode> {
        let parts = split_path(path)?;
        self.resolve(&parts).await
    }

    /// Live root, cloned first if a snapshot shares it
    async fn exclusive_root(&mut self) -> Result<Inode> {
        let mut root = self.load_inode(self.root()).await?;
        if root.refs <= 1 {
            return Ok(root);
        }
        let copy = self.clone_inode(&root, root.id).await?;
        root.refs -= 1;
        self.store_inode(&root).await?;
        self.sb.root_inode = copy.id;
        self.write_superblock().await?;
        log::debug!("SNAPSHOT: live root moved {} -> {}", root.id, copy.id);
        Ok(copy)
    }

    /// Resolve `parts` making every inode on the way private to the live tree
    ///
    /// Shared inodes along the path are cloned and their parent entries
    /// redirected, so the returned inode and all its ancestors can be
    /// modified in place without affecting any snapshot.
    pub(crate) async fn make_path_exclusive(&mut self, parts: &[&str]) -> Result<Inode> {
        let mut cur = self.exclusive_root().await?;
        for name in parts {
            if !cur.is_dir() {
                return Err(Error::NotADirectory);
            }
            let mut dir = self.load_dir(&cur).await?;
            let (child_id, kind) = dir.get(name).ok_or(Error::NotFound)?;
            let mut child = self.load_inode(child_id).await?;
            if child.refs > 1 {
                let copy = self.clone_inode(&child, cur.id).await?;
                child.refs -= 1;
                self.store_inode(&child).await?;
                dir.insert(name, copy.id, kind);
                self.store_dir(&mut cur, &dir).await?;
                child = copy;
            } else if child.parent != cur.id {
                child.parent = cur.id;
                self.store_inode(&child).await?;
            }
            cur = child;
        }
        Ok(cur)
    }

    /// Directory holding `dir` in the live tree
    ///
    /// The stored `parent` can name a snapshot's copy of the parent once the
    /// live path has been cloned away from it, so the live tree is searched.
    /// The root is its own parent; a directory only reachable through a
    /// snapshot keeps its stored parent.
    pub(crate) async fn live_parent(&self, dir: &Inode) -> Result<u64> {
        let root = self.root();
        if dir.id == root {
            return Ok(root);
        }
        if let Ok(parent) = self.load_inode(dir.parent).await {
            if self.is_live_dir(parent.id).await? && self.holds_dir(&parent, dir.id).await? {
                return Ok(parent.id);
            }
        }

        let mut pending = vec![root];
        while let Some(id) = pending.pop() {
            let inode = self.load_inode(id).await?;
            for (_, child, kind) in self.load_dir(&inode).await?.iter() {
                if kind != FileKind::Directory {
                    continue;
                }
                if child == dir.id {
                    return Ok(id);
                }
                pending.push(child);
            }
        }
        Ok(dir.parent)
    }

    async fn holds_dir(&self, parent: &Inode, child: u64) -> Result<bool> {
        if !parent.is_dir() {
            return Ok(false);
        }
        let listing = self.load_dir(parent).await?;
        let found = listing
            .iter()
            .any(|(_, id, kind)| id == child && kind == FileKind::Directory);
        Ok(found)
    }

    /// Whether directory `id` is reachable from the live root
    ///
    /// Follows stored parents upward, checking each link against the
    /// parent's listing, so a stale link ends the climb.
    async fn is_live_dir(&self, id: u64) -> Result<bool> {
        let root = self.root();
        let mut cur = id;
        let mut steps = 0u64;
        while cur != root {
            let inode = self.load_inode(cur).await?;
            if inode.parent == inode.id || steps > self.layout.total_inodes {
                return Ok(false);
            }
            let parent = match self.load_inode(inode.parent).await {
                Ok(parent) => parent,
                Err(Error::NotFound) => return Ok(false),
                Err(e) => return Err(e),
            };
            if !self.holds_dir(&parent, cur).await? {
                return Ok(false);
            }
            cur = parent.id;
            steps += 1;
        }
        Ok(true)
    }

    /// Every regular file in the live tree with its path
    pub(crate) async fn walk_files(&self) -> Result<Vec<(String, Inode)>> {
        let mut files = Vec::new();
        let mut pending = vec![(String::new(), self.root())];
        while let Some((prefix, id)) = pending.pop() {
            let inode = self.load_inode(id).await?;
            let dir = self.load_dir(&inode).await?;
            for (name, child, kind) in dir.iter() {
                let path = format!("{}/{}", prefix, name);
                match kind {
                    FileKind::Directory => pending.push((path, child)),
                    FileKind::File => files.push((path, self.load_inode(child).await?)),
                }
            }
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/").unwrap(), Vec::<&str>::new());
        assert_eq!(split_path("/a//b/./c/").unwrap(), vec!["a", "b", "c"]);
        assert!(split_path("relative").is_err());
        assert!(split_path("/a/../b").is_err());
        assert!(split_path(&format!("/{}", "x".repeat(256))).is_err());

        let (parent, name) = split_parent("/docs/readme").unwrap();
        assert_eq!(parent, vec!["docs"]);
        assert_eq!(name, "readme");
        assert!(split_parent("/").is_err());
    }

    #[test]
    fn test_directory_codec() {
        let mut dir = Directory::default();
        dir.insert("zeta", 9, FileKind::File);
        dir.insert("alpha", 4, FileKind::Directory);
        let bytes = dir.encode().unwrap();
        assert_eq!(bytes.len() % 8, 0);

        let back = Directory::decode(&bytes).unwrap();
        assert_eq!(back, dir);
        assert_eq!(back.nth(0), Some(("alpha", 4, FileKind::Directory)));
        assert_eq!(back.nth(1), Some(("zeta", 9, FileKind::File)));
        assert_eq!(back.nth(2), None);
        assert!(Directory::decode(&[]).unwrap().is_empty());
    }
}
