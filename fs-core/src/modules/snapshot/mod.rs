//! Snapshot management for AuroraFS
//!
//! A snapshot pins a root directory inode. Nothing is copied when it is
//! taken: the pin raises the root's `refs`, and the next mutation of the
//! live tree copies only the inodes on the path it touches. Data blocks stay
//! shared through the reference ledger until no tree needs them.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use std::io::{Cursor, Read, Write};

use crate::error::{Error, Result};
use crate::format::{
    Features, SnapshotFlags, SnapshotRecord, MAX_SNAPSHOTS, SNAPSHOT_DESCRIPTION_LEN,
    SNAPSHOT_NAME_LEN, SNAPSHOT_RECORD_SIZE,
};
use crate::layout::now_secs;
use crate::volume::MountState;

/// Snapshot table stream magic ("ASNP")
const TABLE_MAGIC: u32 = u32::from_le_bytes(*b"ASNP");
const TABLE_HEADER: usize = 16;

/// Snapshot summary for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub id: u64,
    pub name: String,
    pub description: String,
    /// Snapshot that was current when this one was taken (0 = none)
    pub parent: u64,
    /// Root directory inode pinned by the snapshot
    pub root_inode: u64,
    pub created: u64,
    /// Bytes in use on the volume when the snapshot was taken
    pub space_estimate: u64,
    pub read_only: bool,
    /// Whether this is the current snapshot
    pub active: bool,
}

/// The set of recorded snapshots, ordered by id
#[derive(Debug, Clone, Default)]
pub struct SnapshotTable {
    records: Vec<SnapshotRecord>,
}

impl SnapshotTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SnapshotRecord> {
        self.records.iter()
    }

    pub fn get(&self, id: u64) -> Option<&SnapshotRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn by_name(&self, name: &str) -> Option<&SnapshotRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    fn insert(&mut self, record: SnapshotRecord) {
        let pos = self.records.partition_point(|r| r.id < record.id);
        self.records.insert(pos, record);
    }

    fn remove(&mut self, id: u64) -> Option<SnapshotRecord> {
        let pos = self.records.iter().position(|r| r.id == id)?;
        Some(self.records.remove(pos))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(TABLE_HEADER + self.len() * SNAPSHOT_RECORD_SIZE);
        out.write_u32::<LittleEndian>(TABLE_MAGIC)?;
        out.write_u32::<LittleEndian>(self.len() as u32)?;
        out.write_u64::<LittleEndian>(0)?;
        for record in &self.records {
            out.write_all(&record.encode()?)?;
        }
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut table = Self::new();
        if bytes.is_empty() {
            return Ok(table);
        }
        let mut cursor = Cursor::new(bytes);
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != TABLE_MAGIC {
            return Err(Error::format(format!(
                "bad snapshot table magic {:#010x}",
                magic
            )));
        }
        let count = cursor.read_u32::<LittleEndian>()? as usize;
        let _reserved = cursor.read_u64::<LittleEndian>()?;
        if count > MAX_SNAPSHOTS {
            return Err(Error::format(format!("snapshot table claims {} records", count)));
        }

        let mut buf = [0u8; SNAPSHOT_RECORD_SIZE];
        for _ in 0..count {
            cursor.read_exact(&mut buf)?;
            let record = SnapshotRecord::decode(&buf)?;
            if table.get(record.id).is_some() {
                return Err(Error::format(format!("snapshot {} listed twice", record.id)));
            }
            table.insert(record);
        }
        Ok(table)
    }
}

impl MountState {
    fn require_snapshots(&self) -> Result<()> {
        self.require(Features::SNAPSHOT, "snapshot")
    }

    fn snapshot_info(&self, record: &SnapshotRecord) -> SnapshotInfo {
        SnapshotInfo {
            id: record.id,
            name: record.name.clone(),
            description: record.description.clone(),
            parent: record.parent,
            root_inode: record.root,
            created: record.created,
            space_estimate: record.space_estimate,
            read_only: record.flags.contains(SnapshotFlags::READ_ONLY),
            active: self.sb.active_snapshot == record.id,
        }
    }

    /// Capture the live root under `name`
    pub(crate) async fn create_snapshot(&mut self, name: &str, description: &str) -> Result<u64> {
        self.require_snapshots()?;
        if name.is_empty() || name.len() > SNAPSHOT_NAME_LEN {
            return Err(Error::invalid(format!(
                "snapshot name must be 1 to {} bytes",
                SNAPSHOT_NAME_LEN
            )));
        }
        if description.len() > SNAPSHOT_DESCRIPTION_LEN {
            return Err(Error::invalid(format!(
                "snapshot description exceeds {} bytes",
                SNAPSHOT_DESCRIPTION_LEN
            )));
        }
        if self.snapshots.by_name(name).is_some() {
            return Err(Error::AlreadyExists);
        }
        if self.snapshots.len() >= MAX_SNAPSHOTS {
            return Err(Error::invalid(format!(
                "snapshot table is full ({} snapshots)",
                MAX_SNAPSHOTS
            )));
        }

        let root = self.root();
        self.retain_inode(root).await?;

        let id = self.sb.next_snapshot_id;
        let record = SnapshotRecord {
            id,
            parent: self.sb.active_snapshot,
            root,
            created: now_secs(),
            space_estimate: self.used_bytes(),
            flags: SnapshotFlags::READ_ONLY,
            name: name.to_string(),
            description: description.to_string(),
        };
        self.snapshots.insert(record);
        self.sb.next_snapshot_id += 1;
        self.sb.active_snapshot = id;
        self.persist().await?;

        log::info!("SNAPSHOT: created {} '{}' pinning root {}", id, name, root);
        Ok(id)
    }

    /// Make snapshot `id`'s root the live root
    ///
    /// The previous live tree loses its root pin; whatever only it
    /// referenced is released.
    pub(crate) async fn rollback_snapshot(&mut self, id: u64) -> Result<()> {
        self.require_snapshots()?;
        let target = self.snapshots.get(id).ok_or(Error::NotFound)?.root;

        self.retain_inode(target).await?;
        let previous = self.root();
        self.sb.root_inode = target;
        self.sb.active_snapshot = id;
        self.write_superblock().await?;
        self.release_inode(previous).await?;

        for record in self.snapshots.records.iter_mut() {
            if record.id == id {
                record.flags.insert(SnapshotFlags::ROLLED_BACK);
            } else {
                record.flags.remove(SnapshotFlags::ROLLED_BACK);
            }
        }
        self.persist().await?;

        log::info!(
            "SNAPSHOT: rolled back to {} (root {} replaces {})",
            id,
            target,
            previous
        );
        Ok(())
    }

    /// Forget snapshot `id` and release what only it retained
    pub(crate) async fn delete_snapshot(&mut self, id: u64) -> Result<()> {
        self.require_snapshots()?;
        let record = self.snapshots.get(id).cloned().ok_or(Error::NotFound)?;

        self.release_inode(record.root).await?;
        self.snapshots.remove(id);
        for child in self.snapshots.records.iter_mut() {
            if child.parent == id {
                child.parent = record.parent;
            }
        }
        if self.sb.active_snapshot == id {
            self.sb.active_snapshot = record.parent;
        }
        self.persist().await?;

        log::info!("SNAPSHOT: deleted {} '{}'", id, record.name);
        Ok(())
    }

    pub(crate) fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        self.require_snapshots()?;
        Ok(self
            .snapshots
            .iter()
            .map(|record| self.snapshot_info(record))
            .collect())
    }

    pub(crate) fn find_snapshot(&self, name: &str) -> Result<SnapshotInfo> {
        self.require_snapshots()?;
        self.snapshots
            .by_name(name)
            .map(|record| self.snapshot_info(record))
            .ok_or(Error::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, name: &str) -> SnapshotRecord {
        SnapshotRecord {
            id,
            parent: id.saturating_sub(1),
            root: 40 + id,
            created: 1_700_000_000 + id,
            space_estimate: id * 4096,
            flags: SnapshotFlags::READ_ONLY,
            name: name.to_string(),
            description: format!("snapshot number {}", id),
        }
    }

    #[test]
    fn test_table_keeps_id_order() {
        let mut table = SnapshotTable::new();
        table.insert(record(3, "c"));
        table.insert(record(1, "a"));
        table.insert(record(2, "b"));
        let ids: Vec<u64> = table.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(table.by_name("b").unwrap().id, 2);

        assert_eq!(table.remove(2).unwrap().name, "b");
        assert!(table.get(2).is_none());
        assert!(table.remove(2).is_none());
    }

    #[test]
    fn test_table_stream() {
        let mut table = SnapshotTable::new();
        table.insert(record(1, "nightly"));
        table.insert(record(7, "before-upgrade"));
        let bytes = table.to_bytes().unwrap();
        assert_eq!(bytes.len(), TABLE_HEADER + 2 * SNAPSHOT_RECORD_SIZE);

        let back = SnapshotTable::from_bytes(&bytes).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.get(7).unwrap(), table.get(7).unwrap());
        assert!(SnapshotTable::from_bytes(&[]).unwrap().is_empty());

        let mut corrupt = bytes.clone();
        corrupt[TABLE_HEADER + 20] ^= 0xFF;
        assert!(matches!(
            SnapshotTable::from_bytes(&corrupt),
            Err(Error::Format(_))
        ));
    }
}
