//! AuroraFS on-disk format
//!
//! Byte-exact encodings for every structure AuroraFS persists. All integers
//! are little-endian. Encoders zero every reserved byte; decoders check the
//! magic and version before any other field is trusted.

use std::io;
use std::str::FromStr;
use thiserror::Error;

mod inode;
mod records;
mod superblock;

pub use self::inode::{FileKind, Inode, INODE_FLAG_HAS_KEY, S_IFDIR, S_IFMT, S_IFREG};
pub use self::records::{
    decode_dir_entries, decode_extent_block, encode_dir_entries, encode_extent_block, DedupRecord,
    DirEntry, Extent, SnapshotFlags, SnapshotRecord, EXTENTS_PER_BLOCK, EXTENT_FLAG_RAW,
    EXTENT_FLAG_VOLUME_KEY, MAX_NAME_LEN, SNAPSHOT_DESCRIPTION_LEN, SNAPSHOT_NAME_LEN,
};
pub use self::superblock::{Superblock, VolumeState};

pub use crate::blockdev::BLOCK_SIZE;

/// Magic tag at byte 0 of every AuroraFS volume
pub const MAGIC: &[u8; 8] = b"AURORAFS";
/// Current on-disk format version
pub const FORMAT_VERSION: u32 = 1;
/// Size of one on-disk inode
pub const INODE_SIZE: usize = 256;
/// Inodes stored per inode-table block
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
/// Inode number of the root directory of a freshly formatted volume
pub const ROOT_INODE: u64 = 1;
/// Size of one extent record
pub const EXTENT_SIZE: usize = 128;
/// Size of one dedup-table record
pub const DEDUP_RECORD_SIZE: usize = 96;
/// Size of one snapshot record
pub const SNAPSHOT_RECORD_SIZE: usize = 512;
/// Upper bound on recorded snapshots
pub const MAX_SNAPSHOTS: usize = 256;
/// Length of a wrapped per-file key (nonce + key + tag)
pub const WRAPPED_KEY_LEN: usize = 60;
/// Length of the volume label field
pub const LABEL_LEN: usize = 64;

/// Error type for record encoding and decoding
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid magic number")]
    InvalidMagic,
    #[error("Unsupported filesystem version: {0}")]
    UnsupportedVersion(u32),
    #[error("Superblock checksum mismatch: stored {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("Inconsistent superblock: {0}")]
    InvalidSuperblock(String),
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

/// Volume feature bitmask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Features(pub u32);

impl Features {
    pub const DEDUP: Self = Self(1 << 0);
    pub const COMPRESS: Self = Self(1 << 1);
    pub const SNAPSHOT: Self = Self(1 << 2);
    pub const ENCRYPT: Self = Self(1 << 3);
    pub const JOURNAL: Self = Self(1 << 4);
    pub const QUOTA: Self = Self(1 << 5);

    const NAMED: [(Self, &'static str); 6] = [
        (Self::DEDUP, "dedup"),
        (Self::COMPRESS, "compress"),
        (Self::SNAPSHOT, "snapshot"),
        (Self::ENCRYPT, "encrypt"),
        (Self::JOURNAL, "journal"),
        (Self::QUOTA, "quota"),
    ];

    /// No feature enabled
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether every bit of `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Bits this version of the format does not know about
    pub fn unknown_bits(self) -> u32 {
        let known = Self::NAMED.iter().fold(0, |acc, (f, _)| acc | f.0);
        self.0 & !known
    }

    /// Names of the enabled features, in bit order
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(f, _)| self.contains(*f))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl std::ops::BitOr for Features {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Block compression algorithm tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CompressionAlgorithm {
    #[default]
    None = 0,
    Lz4 = 1,
    Zstd = 2,
}

impl CompressionAlgorithm {
    pub fn from_raw(raw: u8) -> Result<Self, FormatError> {
        match raw {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            2 => Ok(Self::Zstd),
            other => Err(FormatError::InvalidRecord(format!(
                "unknown compression tag {}",
                other
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd),
            other => Err(FormatError::InvalidRecord(format!(
                "unknown compression algorithm '{}'",
                other
            ))),
        }
    }
}

/// Block encryption algorithm tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum EncryptionAlgorithm {
    #[default]
    None = 0,
    Aes256Gcm = 1,
}

impl EncryptionAlgorithm {
    pub fn from_raw(raw: u8) -> Result<Self, FormatError> {
        match raw {
            0 => Ok(Self::None),
            1 => Ok(Self::Aes256Gcm),
            other => Err(FormatError::InvalidRecord(format!(
                "unknown encryption tag {}",
                other
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Aes256Gcm => "aes-256-gcm",
        }
    }
}

/// Copy `s` into a zero-padded fixed-width field, truncating on a char boundary
pub(crate) fn encode_fixed_str<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let mut len = s.len().min(N);
    while !s.is_char_boundary(len) {
        len -= 1;
    }
    out[..len].copy_from_slice(&s.as_bytes()[..len]);
    out
}

/// Read a zero-padded fixed-width string field
pub(crate) fn decode_fixed_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_bits() {
        let mut features = Features::DEDUP | Features::SNAPSHOT;
        assert!(features.contains(Features::DEDUP));
        assert!(!features.contains(Features::ENCRYPT));
        assert_eq!(features.names(), vec!["dedup", "snapshot"]);

        features.remove(Features::DEDUP);
        features.insert(Features::QUOTA);
        assert_eq!(features.names(), vec!["snapshot", "quota"]);
        assert_eq!(Features(1 << 9).unknown_bits(), 1 << 9);
    }

    #[test]
    fn test_algorithm_tags() {
        assert_eq!(CompressionAlgorithm::from_raw(2).unwrap(), CompressionAlgorithm::Zstd);
        assert!(CompressionAlgorithm::from_raw(9).is_err());
        assert_eq!("LZ4".parse::<CompressionAlgorithm>().unwrap(), CompressionAlgorithm::Lz4);
        assert_eq!(EncryptionAlgorithm::from_raw(1).unwrap(), EncryptionAlgorithm::Aes256Gcm);
        assert!(EncryptionAlgorithm::from_raw(7).is_err());
    }

    #[test]
    fn test_fixed_str_truncates_on_char_boundary() {
        let field: [u8; 4] = encode_fixed_str("abcé");
        assert_eq!(decode_fixed_str(&field), "abc");
        let field: [u8; 8] = encode_fixed_str("vol");
        assert_eq!(&field, b"vol\0\0\0\0\0");
    }
}
