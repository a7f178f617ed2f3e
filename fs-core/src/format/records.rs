//! Extent, dedup, snapshot and directory-entry records

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use super::{
    decode_fixed_str, encode_fixed_str, CompressionAlgorithm, EncryptionAlgorithm, FileKind,
    FormatError, BLOCK_SIZE, DEDUP_RECORD_SIZE, EXTENT_SIZE, SNAPSHOT_RECORD_SIZE,
};

/// Extent block magic ("AXT1")
const EXTENT_BLOCK_MAGIC: u32 = u32::from_le_bytes(*b"AXT1");
/// Extent block header: magic, count, next
const EXTENT_BLOCK_HEADER: usize = 16;
/// Extent records per extent block
pub const EXTENTS_PER_BLOCK: usize = (BLOCK_SIZE - EXTENT_BLOCK_HEADER) / EXTENT_SIZE;

/// Block is stored as-is and owned outside the reference ledger
pub const EXTENT_FLAG_RAW: u32 = 1 << 0;
/// Payload is encrypted under the volume data key rather than the file key
pub const EXTENT_FLAG_VOLUME_KEY: u32 = 1 << 1;

/// Longest file name a directory entry can hold
pub const MAX_NAME_LEN: usize = 255;
/// Width of the snapshot name field
pub const SNAPSHOT_NAME_LEN: usize = 64;
/// Width of the snapshot description field
pub const SNAPSHOT_DESCRIPTION_LEN: usize = 256;

/// One block of file data: where it lives and how to decode it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extent {
    /// Logical block index within the file
    pub logical: u64,
    /// Physical block number on the device
    pub physical: u64,
    /// Length in blocks
    pub length: u32,
    pub flags: u32,
    /// Block refcount observed when the record was last written
    pub refcount: u32,
    /// Bytes of stored payload (after compression)
    pub stored_size: u32,
    /// Bytes of logical data the payload expands to
    pub logical_size: u32,
    pub compression: CompressionAlgorithm,
    pub encryption: EncryptionAlgorithm,
    /// SHA-256 of the post-compression payload
    pub hash: [u8; 32],
    pub nonce: [u8; 12],
    pub tag: [u8; 16],
}

impl Extent {
    pub fn is_raw(&self) -> bool {
        self.flags & EXTENT_FLAG_RAW != 0
    }

    fn write_to<W: Write>(&self, w: &mut W) -> Result<(), FormatError> {
        w.write_u64::<LittleEndian>(self.logical)?;
        w.write_u64::<LittleEndian>(self.physical)?;
        w.write_u32::<LittleEndian>(self.length)?;
        w.write_u32::<LittleEndian>(self.flags)?;
        w.write_u32::<LittleEndian>(self.refcount)?;
        w.write_u32::<LittleEndian>(self.stored_size)?;
        w.write_u32::<LittleEndian>(self.logical_size)?;
        w.write_u8(self.compression as u8)?;
        w.write_u8(self.encryption as u8)?;
        w.write_all(&self.hash)?;
        w.write_all(&self.nonce)?;
        w.write_all(&self.tag)?;
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self, FormatError> {
        let logical = r.read_u64::<LittleEndian>()?;
        let physical = r.read_u64::<LittleEndian>()?;
        let length = r.read_u32::<LittleEndian>()?;
        let flags = r.read_u32::<LittleEndian>()?;
        let refcount = r.read_u32::<LittleEndian>()?;
        let stored_size = r.read_u32::<LittleEndian>()?;
        let logical_size = r.read_u32::<LittleEndian>()?;
        let compression = CompressionAlgorithm::from_raw(r.read_u8()?)?;
        let encryption = EncryptionAlgorithm::from_raw(r.read_u8()?)?;
        let mut hash = [0u8; 32];
        r.read_exact(&mut hash)?;
        let mut nonce = [0u8; 12];
        r.read_exact(&mut nonce)?;
        let mut tag = [0u8; 16];
        r.read_exact(&mut tag)?;

        if stored_size as usize > BLOCK_SIZE || logical_size as usize > BLOCK_SIZE {
            return Err(FormatError::InvalidRecord(format!(
                "extent {} sizes out of range ({} stored, {} logical)",
                logical, stored_size, logical_size
            )));
        }

        Ok(Self {
            logical,
            physical,
            length,
            flags,
            refcount,
            stored_size,
            logical_size,
            compression,
            encryption,
            hash,
            nonce,
            tag,
        })
    }
}

/// Encode one block of an extent chain
pub fn encode_extent_block(extents: &[Extent], next: u64) -> Result<Vec<u8>, FormatError> {
    if extents.len() > EXTENTS_PER_BLOCK {
        return Err(FormatError::InvalidRecord(format!(
            "{} extents do not fit one extent block",
            extents.len()
        )));
    }
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut cursor = Cursor::new(&mut buf[..]);
    cursor.write_u32::<LittleEndian>(EXTENT_BLOCK_MAGIC)?;
    cursor.write_u32::<LittleEndian>(extents.len() as u32)?;
    cursor.write_u64::<LittleEndian>(next)?;
    for (i, extent) in extents.iter().enumerate() {
        cursor.set_position((EXTENT_BLOCK_HEADER + i * EXTENT_SIZE) as u64);
        extent.write_to(&mut cursor)?;
    }
    Ok(buf)
}

/// Decode one block of an extent chain into its records and the next link
pub fn decode_extent_block(buf: &[u8]) -> Result<(Vec<Extent>, u64), FormatError> {
    let mut cursor = Cursor::new(buf);
    let magic = cursor.read_u32::<LittleEndian>()?;
    if magic != EXTENT_BLOCK_MAGIC {
        return Err(FormatError::InvalidRecord(format!(
            "bad extent block magic {:#010x}",
            magic
        )));
    }
    let count = cursor.read_u32::<LittleEndian>()? as usize;
    if count > EXTENTS_PER_BLOCK {
        return Err(FormatError::InvalidRecord(format!(
            "extent block claims {} records",
            count
        )));
    }
    let next = cursor.read_u64::<LittleEndian>()?;

    let mut extents = Vec::with_capacity(count);
    for i in 0..count {
        cursor.set_position((EXTENT_BLOCK_HEADER + i * EXTENT_SIZE) as u64);
        extents.push(Extent::read_from(&mut cursor)?);
    }
    Ok((extents, next))
}

/// Persisted dedup-table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupRecord {
    pub hash: [u8; 32],
    pub physical: u64,
    pub refcount: u32,
    pub stored_size: u32,
    pub logical_size: u32,
    pub compression: CompressionAlgorithm,
    pub encryption: EncryptionAlgorithm,
    /// Extent flags the block was written with
    pub flags: u32,
    pub nonce: [u8; 12],
    pub tag: [u8; 16],
    /// Next record index in the same bucket (`u32::MAX` ends the chain)
    pub next: u32,
}

impl DedupRecord {
    pub fn encode(&self) -> Result<[u8; DEDUP_RECORD_SIZE], FormatError> {
        let mut buf = [0u8; DEDUP_RECORD_SIZE];
        let mut w = Cursor::new(&mut buf[..]);
        w.write_all(&self.hash)?;
        w.write_u64::<LittleEndian>(self.physical)?;
        w.write_u32::<LittleEndian>(self.refcount)?;
        w.write_u32::<LittleEndian>(self.stored_size)?;
        w.write_u32::<LittleEndian>(self.logical_size)?;
        w.write_u8(self.compression as u8)?;
        w.write_u8(self.encryption as u8)?;
        w.write_u32::<LittleEndian>(self.flags)?;
        w.write_all(&self.nonce)?;
        w.write_all(&self.tag)?;
        w.write_u32::<LittleEndian>(self.next)?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        let mut r = Cursor::new(buf);
        let mut hash = [0u8; 32];
        r.read_exact(&mut hash)?;
        let physical = r.read_u64::<LittleEndian>()?;
        let refcount = r.read_u32::<LittleEndian>()?;
        let stored_size = r.read_u32::<LittleEndian>()?;
        let logical_size = r.read_u32::<LittleEndian>()?;
        let compression = CompressionAlgorithm::from_raw(r.read_u8()?)?;
        let encryption = EncryptionAlgorithm::from_raw(r.read_u8()?)?;
        let flags = r.read_u32::<LittleEndian>()?;
        let mut nonce = [0u8; 12];
        r.read_exact(&mut nonce)?;
        let mut tag = [0u8; 16];
        r.read_exact(&mut tag)?;
        let next = r.read_u32::<LittleEndian>()?;
        if refcount == 0 {
            return Err(FormatError::InvalidRecord(format!(
                "dedup record for block {} has zero refcount",
                physical
            )));
        }
        Ok(Self {
            hash,
            physical,
            refcount,
            stored_size,
            logical_size,
            compression,
            encryption,
            flags,
            nonce,
            tag,
            next,
        })
    }
}

/// Snapshot flag bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotFlags(pub u32);

impl SnapshotFlags {
    /// Snapshot contents are never modified in place
    pub const READ_ONLY: Self = Self(1 << 0);
    /// Snapshot was the target of the most recent rollback
    pub const ROLLED_BACK: Self = Self(1 << 1);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

/// A named capture of the root directory reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub id: u64,
    /// Snapshot that was active when this one was taken (0 = none)
    pub parent: u64,
    /// Root directory inode pinned by this snapshot
    pub root: u64,
    pub created: u64,
    /// Bytes in use on the volume when the snapshot was taken
    pub space_estimate: u64,
    pub flags: SnapshotFlags,
    pub name: String,
    pub description: String,
}

impl SnapshotRecord {
    pub fn encode(&self) -> Result<[u8; SNAPSHOT_RECORD_SIZE], FormatError> {
        let mut buf = [0u8; SNAPSHOT_RECORD_SIZE];
        let end = {
            let mut w = Cursor::new(&mut buf[..]);
            w.write_u64::<LittleEndian>(self.id)?;
            w.write_u64::<LittleEndian>(self.parent)?;
            w.write_u64::<LittleEndian>(self.root)?;
            w.write_u64::<LittleEndian>(self.created)?;
            w.write_u64::<LittleEndian>(self.space_estimate)?;
            w.write_u32::<LittleEndian>(self.flags.0)?;
            w.write_all(&encode_fixed_str::<SNAPSHOT_NAME_LEN>(&self.name))?;
            w.write_all(&encode_fixed_str::<SNAPSHOT_DESCRIPTION_LEN>(&self.description))?;
            w.position() as usize
        };
        let crc = crc32fast::hash(&buf[..end]);
        buf[end..end + 4].copy_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        let mut r = Cursor::new(buf);
        let id = r.read_u64::<LittleEndian>()?;
        let parent = r.read_u64::<LittleEndian>()?;
        let root = r.read_u64::<LittleEndian>()?;
        let created = r.read_u64::<LittleEndian>()?;
        let space_estimate = r.read_u64::<LittleEndian>()?;
        let flags = SnapshotFlags(r.read_u32::<LittleEndian>()?);
        let mut name = [0u8; SNAPSHOT_NAME_LEN];
        r.read_exact(&mut name)?;
        let mut description = [0u8; SNAPSHOT_DESCRIPTION_LEN];
        r.read_exact(&mut description)?;

        let end = r.position() as usize;
        let stored = r.read_u32::<LittleEndian>()?;
        let computed = crc32fast::hash(&buf[..end]);
        if stored != computed {
            return Err(FormatError::InvalidRecord(format!(
                "snapshot record {} checksum mismatch",
                id
            )));
        }

        Ok(Self {
            id,
            parent,
            root,
            created,
            space_estimate,
            flags,
            name: decode_fixed_str(&name),
            description: decode_fixed_str(&description),
        })
    }
}

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Inode number
    pub inode: u64,
    /// Length of this entry
    pub rec_len: u16,
    /// Length of name
    pub name_len: u8,
    /// File type
    pub file_type: u8,
    /// File name (variable length, up to 255 bytes)
    pub name: String,
}

impl DirEntry {
    /// Create a new directory entry
    pub fn new(inode: u64, name: &str, kind: FileKind) -> Result<Self, FormatError> {
        let name_bytes = name.as_bytes();
        if name_bytes.is_empty() || name_bytes.len() > MAX_NAME_LEN {
            return Err(FormatError::InvalidRecord(format!(
                "bad directory entry name length {}",
                name_bytes.len()
            )));
        }
        // header + name + NUL, padded to 8 bytes
        let unpadded = 12 + name_bytes.len() + 1;
        let rec_len = (unpadded + 7) & !7;

        Ok(Self {
            inode,
            rec_len: rec_len as u16,
            name_len: name_bytes.len() as u8,
            file_type: kind.to_dirent_type(),
            name: name.to_string(),
        })
    }

    pub fn kind(&self) -> Result<FileKind, FormatError> {
        FileKind::from_dirent_type(self.file_type)
    }

    /// Write directory entry to writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), FormatError> {
        writer.write_u64::<LittleEndian>(self.inode)?;
        writer.write_u16::<LittleEndian>(self.rec_len)?;
        writer.write_u8(self.name_len)?;
        writer.write_u8(self.file_type)?;
        writer.write_all(self.name.as_bytes())?;
        writer.write_u8(0)?;

        let pad_len = self.rec_len as usize - 12 - self.name_len as usize - 1;
        if pad_len > 0 {
            writer.write_all(&[0u8; 8][..pad_len])?;
        }
        Ok(())
    }
}

/// Serialise a directory's entries into its content bytes
pub fn encode_dir_entries(entries: &[DirEntry]) -> Result<Vec<u8>, FormatError> {
    let mut out = Vec::new();
    for entry in entries {
        entry.write_to(&mut out)?;
    }
    Ok(out)
}

/// Parse a directory's content bytes
pub fn decode_dir_entries(buf: &[u8]) -> Result<Vec<DirEntry>, FormatError> {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos + 12 <= buf.len() {
        let mut cursor = Cursor::new(&buf[pos..]);
        let inode = cursor.read_u64::<LittleEndian>()?;
        let rec_len = cursor.read_u16::<LittleEndian>()?;
        let name_len = cursor.read_u8()?;
        let file_type = cursor.read_u8()?;

        if inode == 0 && rec_len == 0 {
            break;
        }
        let rec = rec_len as usize;
        if rec < 12 + name_len as usize + 1 || pos + rec > buf.len() {
            return Err(FormatError::InvalidRecord(format!(
                "directory entry at offset {} has bad length {}",
                pos, rec_len
            )));
        }
        let name_bytes = &buf[pos + 12..pos + 12 + name_len as usize];
        let name = String::from_utf8(name_bytes.to_vec()).map_err(|_| {
            FormatError::InvalidRecord(format!("directory entry at offset {} is not UTF-8", pos))
        })?;
        entries.push(DirEntry {
            inode,
            rec_len,
            name_len,
            file_type,
            name,
        });
        pos += rec;
    }
    Ok(entries)
}
