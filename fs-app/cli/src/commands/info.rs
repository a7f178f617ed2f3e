//! Volume summary

use anyhow::Result;
use clap::Parser;

use super::{close_volume, format_bytes, format_time, open_volume, VolumeArgs};

/// Show superblock and usage information
#[derive(Parser, Debug)]
#[command(about = "Show AuroraFS volume information")]
pub struct InfoArgs {
    #[command(flatten)]
    pub volume: VolumeArgs,

    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: InfoArgs) -> Result<()> {
    let fs = open_volume(&args.volume, true).await?;
    let info = fs.statfs().await?;
    close_volume(fs, &args.volume).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let block_size = info.block_size as u64;
    let used = info.total_blocks - info.free_blocks;
    println!("Volume {:?}", args.volume.image);
    println!("  Label:            {}", info.label);
    println!("  Volume ID:        {}", info.volume_id);
    println!("  State:            {}", info.state);
    println!(
        "  Features:         {}",
        if info.features.is_empty() {
            "none".to_string()
        } else {
            info.features.join(", ")
        }
    );
    println!("  Compression:      {}", info.default_compression);
    println!("  Encryption:       {}", info.default_encryption);
    println!(
        "  Blocks:           {} total, {} used ({})",
        info.total_blocks,
        used,
        format_bytes(used * block_size)
    );
    println!(
        "  Inodes:           {} total, {} free",
        info.total_inodes, info.free_inodes
    );
    println!("  Created:          {}", format_time(info.created));
    println!(
        "  Last mount:       {} ({} mounts)",
        format_time(info.last_mount),
        info.mount_count
    );
    println!("  Snapshots:        {}", info.snapshots);
    if info.active_snapshot != 0 {
        println!("  Active snapshot:  {}", info.active_snapshot);
    }
    println!("  Tracked blocks:   {}", info.tracked_blocks);
    println!(
        "  Dedup:            {} hits, {} misses, {} released",
        info.dedup.hits, info.dedup.misses, info.dedup.released
    );
    Ok(())
}
