//! On-disk inode record

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use super::{
    CompressionAlgorithm, EncryptionAlgorithm, FormatError, INODE_SIZE, WRAPPED_KEY_LEN,
};

/// File type bits of `mode`
pub const S_IFMT: u32 = 0o170000;
/// Directory
pub const S_IFDIR: u32 = 0o040000;
/// Regular file
pub const S_IFREG: u32 = 0o100000;

/// `wrapped_key` holds a per-file content key
pub const INODE_FLAG_HAS_KEY: u32 = 1 << 0;

/// What an inode describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    File,
    Directory,
}

impl FileKind {
    /// Directory-entry file type code
    pub fn to_dirent_type(self) -> u8 {
        match self {
            FileKind::File => 1,
            FileKind::Directory => 2,
        }
    }

    pub fn from_dirent_type(raw: u8) -> Result<Self, FormatError> {
        match raw {
            1 => Ok(FileKind::File),
            2 => Ok(FileKind::Directory),
            other => Err(FormatError::InvalidRecord(format!(
                "unknown directory entry type {}",
                other
            ))),
        }
    }

    fn mode_bits(self) -> u32 {
        match self {
            FileKind::File => S_IFREG,
            FileKind::Directory => S_IFDIR,
        }
    }
}

/// On-disk inode (256 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    /// Inode number (1-based, 0 marks a free slot)
    pub id: u64,
    /// File type and permission bits
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Logical size in bytes
    pub size: u64,
    /// Number of data blocks referenced by the extent map
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    /// Link count (1 for files, 2 + subdirectories for directories)
    pub links: u16,
    /// Tree references: directory entries plus root pins
    pub refs: u32,
    pub compression: CompressionAlgorithm,
    pub encryption: EncryptionAlgorithm,
    pub flags: u32,
    /// Per-file content key wrapped under the volume wrapping key
    pub wrapped_key: [u8; WRAPPED_KEY_LEN],
    /// First block of the extent chain (0 = no extents)
    pub extent_root: u64,
    pub extent_count: u32,
    /// Parent directory inode
    pub parent: u64,
    /// Whole-content hash (all zero until the file holds data)
    pub content_hash: [u8; 32],
}

impl Inode {
    /// Fresh inode with one tree reference
    pub fn new(id: u64, kind: FileKind, perm: u32, parent: u64, now: u64) -> Self {
        Self {
            id,
            mode: kind.mode_bits() | (perm & 0o7777),
            uid: 0,
            gid: 0,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            links: match kind {
                FileKind::File => 1,
                FileKind::Directory => 2,
            },
            refs: 1,
            compression: CompressionAlgorithm::None,
            encryption: EncryptionAlgorithm::None,
            flags: 0,
            wrapped_key: [0u8; WRAPPED_KEY_LEN],
            extent_root: 0,
            extent_count: 0,
            parent,
            content_hash: [0u8; 32],
        }
    }

    pub fn kind(&self) -> Result<FileKind, FormatError> {
        match self.mode & S_IFMT {
            S_IFDIR => Ok(FileKind::Directory),
            S_IFREG => Ok(FileKind::File),
            other => Err(FormatError::InvalidRecord(format!(
                "inode {} has unsupported type bits {:o}",
                self.id, other
            ))),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// Permission bits only
    pub fn perm(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Encode into exactly [`INODE_SIZE`] bytes
    pub fn encode(&self) -> Result<[u8; INODE_SIZE], FormatError> {
        let mut buf = [0u8; INODE_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);
        cursor.write_u64::<LittleEndian>(self.id)?;
        cursor.write_u32::<LittleEndian>(self.mode)?;
        cursor.write_u32::<LittleEndian>(self.uid)?;
        cursor.write_u32::<LittleEndian>(self.gid)?;
        cursor.write_u64::<LittleEndian>(self.size)?;
        cursor.write_u64::<LittleEndian>(self.blocks)?;
        cursor.write_u64::<LittleEndian>(self.atime)?;
        cursor.write_u64::<LittleEndian>(self.mtime)?;
        cursor.write_u64::<LittleEndian>(self.ctime)?;
        cursor.write_u16::<LittleEndian>(self.links)?;
        cursor.write_u32::<LittleEndian>(self.refs)?;
        cursor.write_u8(self.compression as u8)?;
        cursor.write_u8(self.encryption as u8)?;
        cursor.write_u32::<LittleEndian>(self.flags)?;
        cursor.write_all(&self.wrapped_key)?;
        cursor.write_u64::<LittleEndian>(self.extent_root)?;
        cursor.write_u32::<LittleEndian>(self.extent_count)?;
        cursor.write_u64::<LittleEndian>(self.parent)?;
        cursor.write_all(&self.content_hash)?;
        Ok(buf)
    }

    /// Decode an inode slot. Returns `None` for a free (zeroed) slot.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>, FormatError> {
        if buf.len() < INODE_SIZE {
            return Err(FormatError::InvalidRecord(format!(
                "short inode buffer ({} bytes)",
                buf.len()
            )));
        }
        let mut cursor = Cursor::new(buf);
        let id = cursor.read_u64::<LittleEndian>()?;
        if id == 0 {
            return Ok(None);
        }
        let mode = cursor.read_u32::<LittleEndian>()?;
        let uid = cursor.read_u32::<LittleEndian>()?;
        let gid = cursor.read_u32::<LittleEndian>()?;
        let size = cursor.read_u64::<LittleEndian>()?;
        let blocks = cursor.read_u64::<LittleEndian>()?;
        let atime = cursor.read_u64::<LittleEndian>()?;
        let mtime = cursor.read_u64::<LittleEndian>()?;
        let ctime = cursor.read_u64::<LittleEndian>()?;
        let links = cursor.read_u16::<LittleEndian>()?;
        let refs = cursor.read_u32::<LittleEndian>()?;
        let compression = CompressionAlgorithm::from_raw(cursor.read_u8()?)?;
        let encryption = EncryptionAlgorithm::from_raw(cursor.read_u8()?)?;
        let flags = cursor.read_u32::<LittleEndian>()?;
        let mut wrapped_key = [0u8; WRAPPED_KEY_LEN];
        cursor.read_exact(&mut wrapped_key)?;
        let extent_root = cursor.read_u64::<LittleEndian>()?;
        let extent_count = cursor.read_u32::<LittleEndian>()?;
        let parent = cursor.read_u64::<LittleEndian>()?;
        let mut content_hash = [0u8; 32];
        cursor.read_exact(&mut content_hash)?;

        Ok(Some(Self {
            id,
            mode,
            uid,
            gid,
            size,
            blocks,
            atime,
            mtime,
            ctime,
            links,
            refs,
            compression,
            encryption,
            flags,
            wrapped_key,
            extent_root,
            extent_count,
            parent,
            content_hash,
        }))
    }
}
