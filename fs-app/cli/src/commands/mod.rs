//! Subcommand implementations and the helpers they share

pub mod files;
pub mod format;
pub mod info;
pub mod scrub;
pub mod snapshot;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use log::debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aurorafs::blockdev::FileBackedBlockDevice;
use aurorafs::{derive_key, AuroraFs, FileSystemOps, Key, MountOptions};

/// Salt that turns the bytes of a key file into a master key
const KEY_FILE_SALT: &[u8] = b"aurorafs key file";

/// Image selection shared by every command that mounts a volume
#[derive(Args, Debug, Clone)]
pub struct VolumeArgs {
    /// Volume image file
    pub image: PathBuf,

    /// File holding the master key material for encrypted volumes
    #[arg(short = 'k', long = "key-file")]
    pub key_file: Option<PathBuf>,

    /// Re-read deduplicated blocks before sharing them
    #[arg(long)]
    pub verify_dedup: bool,
}

/// Read a key file and stretch its contents into a master key
pub fn load_key(path: &Path) -> Result<Key> {
    let material =
        std::fs::read(path).with_context(|| format!("Failed to read key file {:?}", path))?;
    if material.is_empty() {
        return Err(anyhow!("Key file {:?} is empty", path));
    }
    Ok(derive_key(&material, KEY_FILE_SALT)?)
}

/// Open the image and mount it
pub async fn open_volume(args: &VolumeArgs, read_only: bool) -> Result<AuroraFs> {
    let master_key = args.key_file.as_deref().map(load_key).transpose()?;
    let device = FileBackedBlockDevice::open(&args.image, read_only)
        .await
        .with_context(|| format!("Failed to open image {:?}", args.image))?;
    debug!("Opened {:?} ({} bytes)", args.image, device.size());

    let fs = AuroraFs::new(MountOptions {
        master_key,
        verify_dedup_hits: args.verify_dedup,
        ..MountOptions::default()
    });
    fs.mount(Arc::new(device))
        .await
        .with_context(|| format!("Failed to mount {:?}", args.image))?;
    Ok(fs)
}

/// Unmount, attaching the image name to any flush error
pub async fn close_volume(fs: AuroraFs, args: &VolumeArgs) -> Result<()> {
    fs.unmount()
        .await
        .with_context(|| format!("Failed to unmount {:?}", args.image))
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_time(secs: u64) -> String {
    if secs == 0 {
        return "never".to_string();
    }
    chrono::DateTime::<chrono::Utc>::from_timestamp(secs as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
