//! Superblock record (block 0)

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use super::{
    decode_fixed_str, encode_fixed_str, CompressionAlgorithm, EncryptionAlgorithm, Features,
    FormatError, BLOCK_SIZE, FORMAT_VERSION, LABEL_LEN, MAGIC,
};

/// Health state recorded in the superblock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum VolumeState {
    /// Cleanly unmounted
    Clean = 1,
    /// Mounted, or not cleanly unmounted
    Mounted = 2,
    /// An operation reported an integrity error
    Error = 3,
}

impl VolumeState {
    fn from_raw(raw: u16) -> Result<Self, FormatError> {
        match raw {
            1 => Ok(Self::Clean),
            2 => Ok(Self::Mounted),
            3 => Ok(Self::Error),
            other => Err(FormatError::InvalidSuperblock(format!(
                "unknown volume state {}",
                other
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Mounted => "mounted",
            Self::Error => "error",
        }
    }
}

/// Volume-wide metadata stored at block 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub version: u32,
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub features: Features,
    pub root_inode: u64,
    /// 0 until the journal inode is first needed
    pub journal_inode: u64,
    /// 0 until the dedup table is first persisted
    pub dedup_inode: u64,
    /// 0 until the snapshot table is first persisted
    pub snapshot_inode: u64,
    pub default_compression: CompressionAlgorithm,
    pub default_encryption: EncryptionAlgorithm,
    pub volume_id: [u8; 16],
    pub label: [u8; LABEL_LEN],
    pub created: u64,
    pub last_mount: u64,
    pub last_write: u64,
    pub mount_count: u32,
    pub state: VolumeState,
    pub active_snapshot: u64,
    pub next_snapshot_id: u64,
    pub key_salt: [u8; 16],
    pub key_check: [u8; 32],
}

impl Superblock {
    /// Volume label as a string
    pub fn label(&self) -> String {
        decode_fixed_str(&self.label)
    }

    pub fn set_label(&mut self, label: &str) {
        self.label = encode_fixed_str(label);
    }

    /// Volume id formatted as a UUID-style string
    pub fn volume_id_string(&self) -> String {
        let hex: String = self.volume_id.iter().map(|b| format!("{:02x}", b)).collect();
        format!(
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        )
    }

    /// Encode into a full, zero-padded block
    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        let mut cursor = Cursor::new(vec![0u8; BLOCK_SIZE]);
        cursor.write_all(MAGIC)?;
        cursor.write_u32::<LittleEndian>(self.version)?;
        cursor.write_u32::<LittleEndian>(self.block_size)?;
        cursor.write_u64::<LittleEndian>(self.total_blocks)?;
        cursor.write_u64::<LittleEndian>(self.free_blocks)?;
        cursor.write_u64::<LittleEndian>(self.total_inodes)?;
        cursor.write_u64::<LittleEndian>(self.free_inodes)?;
        cursor.write_u32::<LittleEndian>(self.features.0)?;
        cursor.write_u64::<LittleEndian>(self.root_inode)?;
        cursor.write_u64::<LittleEndian>(self.journal_inode)?;
        cursor.write_u64::<LittleEndian>(self.dedup_inode)?;
        cursor.write_u64::<LittleEndian>(self.snapshot_inode)?;
        cursor.write_u8(self.default_compression as u8)?;
        cursor.write_u8(self.default_encryption as u8)?;
        cursor.write_all(&self.volume_id)?;
        cursor.write_all(&self.label)?;
        cursor.write_u64::<LittleEndian>(self.created)?;
        cursor.write_u64::<LittleEndian>(self.last_mount)?;
        cursor.write_u64::<LittleEndian>(self.last_write)?;
        cursor.write_u32::<LittleEndian>(self.mount_count)?;
        cursor.write_u16::<LittleEndian>(self.state as u16)?;
        cursor.write_u64::<LittleEndian>(self.active_snapshot)?;
        cursor.write_u64::<LittleEndian>(self.next_snapshot_id)?;
        cursor.write_all(&self.key_salt)?;
        cursor.write_all(&self.key_check)?;

        let end = cursor.position() as usize;
        let checksum = crc32fast::hash(&cursor.get_ref()[..end]);
        cursor.write_u32::<LittleEndian>(checksum)?;

        Ok(cursor.into_inner())
    }

    /// Decode and validate a superblock read from block 0
    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < BLOCK_SIZE {
            return Err(FormatError::InvalidSuperblock(format!(
                "short superblock buffer ({} bytes)",
                buf.len()
            )));
        }
        let mut cursor = Cursor::new(buf);

        let mut magic = [0u8; 8];
        cursor.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        let version = cursor.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }

        let block_size = cursor.read_u32::<LittleEndian>()?;
        let total_blocks = cursor.read_u64::<LittleEndian>()?;
        let free_blocks = cursor.read_u64::<LittleEndian>()?;
        let total_inodes = cursor.read_u64::<LittleEndian>()?;
        let free_inodes = cursor.read_u64::<LittleEndian>()?;
        let features = Features(cursor.read_u32::<LittleEndian>()?);
        let root_inode = cursor.read_u64::<LittleEndian>()?;
        let journal_inode = cursor.read_u64::<LittleEndian>()?;
        let dedup_inode = cursor.read_u64::<LittleEndian>()?;
        let snapshot_inode = cursor.read_u64::<LittleEndian>()?;
        let compression_raw = cursor.read_u8()?;
        let encryption_raw = cursor.read_u8()?;
        let mut volume_id = [0u8; 16];
        cursor.read_exact(&mut volume_id)?;
        let mut label = [0u8; LABEL_LEN];
        cursor.read_exact(&mut label)?;
        let created = cursor.read_u64::<LittleEndian>()?;
        let last_mount = cursor.read_u64::<LittleEndian>()?;
        let last_write = cursor.read_u64::<LittleEndian>()?;
        let mount_count = cursor.read_u32::<LittleEndian>()?;
        let state_raw = cursor.read_u16::<LittleEndian>()?;
        let active_snapshot = cursor.read_u64::<LittleEndian>()?;
        let next_snapshot_id = cursor.read_u64::<LittleEndian>()?;
        let mut key_salt = [0u8; 16];
        cursor.read_exact(&mut key_salt)?;
        let mut key_check = [0u8; 32];
        cursor.read_exact(&mut key_check)?;

        let end = cursor.position() as usize;
        let stored = cursor.read_u32::<LittleEndian>()?;
        let computed = crc32fast::hash(&buf[..end]);
        if stored != computed {
            return Err(FormatError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let sb = Self {
            version,
            block_size,
            total_blocks,
            free_blocks,
            total_inodes,
            free_inodes,
            features,
            root_inode,
            journal_inode,
            dedup_inode,
            snapshot_inode,
            default_compression: CompressionAlgorithm::from_raw(compression_raw)
                .map_err(|e| FormatError::InvalidSuperblock(e.to_string()))?,
            default_encryption: EncryptionAlgorithm::from_raw(encryption_raw)
                .map_err(|e| FormatError::InvalidSuperblock(e.to_string()))?,
            volume_id,
            label,
            created,
            last_mount,
            last_write,
            mount_count,
            state: VolumeState::from_raw(state_raw)?,
            active_snapshot,
            next_snapshot_id,
            key_salt,
            key_check,
        };
        sb.validate()?;
        Ok(sb)
    }

    /// Check the counter and geometry invariants
    pub fn validate(&self) -> Result<(), FormatError> {
        if self.block_size as usize != BLOCK_SIZE {
            return Err(FormatError::InvalidSuperblock(format!(
                "block size {} (expected {})",
                self.block_size, BLOCK_SIZE
            )));
        }
        if self.free_blocks > self.total_blocks {
            return Err(FormatError::InvalidSuperblock(format!(
                "free blocks {} exceed total {}",
                self.free_blocks, self.total_blocks
            )));
        }
        if self.free_inodes > self.total_inodes {
            return Err(FormatError::InvalidSuperblock(format!(
                "free inodes {} exceed total {}",
                self.free_inodes, self.total_inodes
            )));
        }
        if self.root_inode == 0 || self.root_inode > self.total_inodes {
            return Err(FormatError::InvalidSuperblock(format!(
                "root inode {} out of range",
                self.root_inode
            )));
        }
        if self.features.unknown_bits() != 0 {
            return Err(FormatError::InvalidSuperblock(format!(
                "unknown feature bits {:#x}",
                self.features.unknown_bits()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ROOT_INODE;

    fn sample() -> Superblock {
        let mut sb = Superblock {
            version: FORMAT_VERSION,
            block_size: BLOCK_SIZE as u32,
            total_blocks: 1024,
            free_blocks: 1005,
            total_inodes: 256,
            free_inodes: 255,
            features: Features::DEDUP | Features::SNAPSHOT,
            root_inode: ROOT_INODE,
            journal_inode: 0,
            dedup_inode: 0,
            snapshot_inode: 0,
            default_compression: CompressionAlgorithm::Lz4,
            default_encryption: EncryptionAlgorithm::None,
            volume_id: [7u8; 16],
            label: [0u8; LABEL_LEN],
            created: 1_700_000_000,
            last_mount: 0,
            last_write: 1_700_000_000,
            mount_count: 0,
            state: VolumeState::Clean,
            active_snapshot: 0,
            next_snapshot_id: 1,
            key_salt: [0u8; 16],
            key_check: [0u8; 32],
        };
        sb.set_label("aurora");
        sb
    }

    #[test]
    fn test_superblock_roundtrip() {
        let sb = sample();
        let block = sb.encode().unwrap();
        assert_eq!(block.len(), BLOCK_SIZE);
        assert_eq!(&block[..8], MAGIC);

        let decoded = Superblock::decode(&block).unwrap();
        assert_eq!(decoded, sb);
        assert_eq!(decoded.label(), "aurora");
    }

    #[test]
    fn test_reserved_bytes_are_zero() {
        let block = sample().encode().unwrap();
        // Everything past the checksum is reserved
        assert!(block[512..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_bad_magic_checked_first() {
        let mut block = sample().encode().unwrap();
        block[0] = b'X';
        // Corrupt the version too; magic must win
        block[8] = 0xFF;
        assert!(matches!(Superblock::decode(&block), Err(FormatError::InvalidMagic)));
    }

    #[test]
    fn test_version_and_checksum_checks() {
        let mut block = sample().encode().unwrap();
        block[8] = 2;
        assert!(matches!(
            Superblock::decode(&block),
            Err(FormatError::UnsupportedVersion(2))
        ));

        let mut block = sample().encode().unwrap();
        block[20] ^= 0x01;
        assert!(matches!(
            Superblock::decode(&block),
            Err(FormatError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_counter_invariants() {
        let mut sb = sample();
        sb.free_blocks = sb.total_blocks + 1;
        let block = sb.encode().unwrap();
        assert!(matches!(
            Superblock::decode(&block),
            Err(FormatError::InvalidSuperblock(_))
        ));
    }

    #[test]
    fn test_volume_id_string() {
        let sb = sample();
        assert_eq!(
            sb.volume_id_string(),
            "07070707-0707-0707-0707-070707070707"
        );
    }
}
