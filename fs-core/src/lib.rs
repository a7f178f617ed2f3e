//! AuroraFS Core - a deduplicating, compressing, encrypting, snapshotting volume store
//!
//! This crate provides the on-disk format, the block allocator, the codec
//! pipeline, the reference-counted dedup index, the extent/inode manager,
//! snapshots and scrub, exposed through the [`FileSystemOps`] operation set
//! implemented by [`AuroraFs`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use aurorafs::{format_volume, AuroraFs, FileKind, FileSystemOps, FormatOptions, MountOptions};
//! use aurorafs::blockdev::MemoryBlockDevice;
//!
//! # async fn demo() -> aurorafs::Result<()> {
//! let device = Arc::new(MemoryBlockDevice::new(4 * 1024 * 1024));
//! format_volume(device.clone(), &FormatOptions::default()).await?;
//!
//! let fs = AuroraFs::new(MountOptions::default());
//! fs.mount(device).await?;
//! fs.create("/hello.txt", FileKind::File).await?;
//! fs.write("/hello.txt", 0, b"hello").await?;
//! fs.unmount().await?;
//! # Ok(())
//! # }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rust_2018_idioms)]

pub mod block_bitmap;
pub mod blockdev;
pub mod cache;
pub mod error;
pub mod format;
pub mod layout;
pub mod modules;
pub mod ops;
pub mod volume;

mod dir;
mod extent;
mod inode;

pub use error::{Error, Result};
pub use format::{CompressionAlgorithm, EncryptionAlgorithm, Features, FileKind};
pub use layout::{format_volume, FormatOptions};
pub use modules::codec::{derive_key, Key, KEY_LEN};
pub use modules::{MemoryJournal, ScrubReport, SnapshotInfo};
pub use ops::{AuroraFs, DirEntryInfo, ExtentInfo, FileStat, FileSystemOps};
pub use volume::{probe, MountOptions, VolumeInfo};

/// Re-export common types and traits
pub mod prelude {
    pub use crate::error::Result;
    pub use crate::ops::{AuroraFs, FileSystemOps};
}
