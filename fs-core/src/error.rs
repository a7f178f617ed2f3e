//! Error taxonomy for AuroraFS
//!
//! Every public operation returns [`Result`]. Lower layers (block devices,
//! record decoding) keep their own error enums and convert into [`Error`] at
//! the boundary.

use std::io;
use thiserror::Error;

use crate::blockdev::BlockDeviceError;
use crate::format::FormatError;

/// Unified error type returned by every volume operation
#[derive(Debug, Error)]
pub enum Error {
    /// The volume is not mounted
    #[error("volume is not mounted")]
    NotMounted,
    /// The volume is already mounted
    #[error("volume is already mounted")]
    AlreadyMounted,
    /// Bad magic, unsupported version, checksum or counter mismatch
    #[error("corrupt superblock: {0}")]
    CorruptSuperblock(String),
    /// An in-memory table could not be allocated
    #[error("out of memory")]
    OutOfMemory,
    /// The block allocator has no free blocks left
    #[error("no free blocks")]
    NoFreeBlocks,
    /// The inode allocator has no free inodes left
    #[error("no free inodes")]
    NoFreeInodes,
    /// Path component, inode, snapshot or index entry not found
    #[error("not found")]
    NotFound,
    /// A path component that must be a directory is not one
    #[error("not a directory")]
    NotADirectory,
    /// A file operation was attempted on a directory
    #[error("is a directory")]
    IsADirectory,
    /// `rmdir` on a directory that still has entries
    #[error("directory not empty")]
    DirectoryNotEmpty,
    /// Name already present in the target directory or snapshot table
    #[error("already exists")]
    AlreadyExists,
    /// The operation is gated by a feature bit that is unset
    #[error("feature disabled: {0}")]
    FeatureDisabled(&'static str),
    /// Key derivation, wrapping, encryption or authentication failed
    #[error("crypto failure: {0}")]
    CryptoFailure(String),
    /// Caller supplied an unusable argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Malformed on-disk record or unknown codec tag
    #[error("format error: {0}")]
    Format(String),
    /// Block device failure
    #[error("device error: {0}")]
    Device(#[from] BlockDeviceError),
    /// Host I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Shorthand for [`Error::InvalidArgument`]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Shorthand for [`Error::Format`]
    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    /// POSIX errno a dispatch layer should report for this error
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::NotMounted => libc::ENODEV,
            Error::AlreadyMounted => libc::EBUSY,
            Error::CorruptSuperblock(_) => libc::EINVAL,
            Error::OutOfMemory => libc::ENOMEM,
            Error::NoFreeBlocks => libc::ENOSPC,
            Error::NoFreeInodes => libc::ENOSPC,
            Error::NotFound => libc::ENOENT,
            Error::NotADirectory => libc::ENOTDIR,
            Error::IsADirectory => libc::EISDIR,
            Error::DirectoryNotEmpty => libc::ENOTEMPTY,
            Error::AlreadyExists => libc::EEXIST,
            Error::FeatureDisabled(_) => libc::EOPNOTSUPP,
            Error::CryptoFailure(_) => libc::EACCES,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::Format(_) => libc::EIO,
            Error::Device(_) => libc::EIO,
            Error::Io(_) => libc::EIO,
        }
    }
}

impl From<FormatError> for Error {
    fn from(err: FormatError) -> Self {
        match err {
            FormatError::Io(e) => Error::Io(e),
            FormatError::InvalidMagic
            | FormatError::UnsupportedVersion(_)
            | FormatError::ChecksumMismatch { .. }
            | FormatError::InvalidSuperblock(_) => Error::CorruptSuperblock(err.to_string()),
            FormatError::InvalidRecord(msg) => Error::Format(msg),
        }
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;
