//! Format command for creating AuroraFS volume images

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use aurorafs::blockdev::FileBackedBlockDevice;
use aurorafs::{format_volume, CompressionAlgorithm, Features, FormatOptions};

use super::{format_bytes, load_key};

/// Format an image file with AuroraFS
#[derive(Parser, Debug)]
#[command(about = "Create and format an AuroraFS volume image")]
pub struct FormatArgs {
    /// Image file to create
    pub image: PathBuf,

    /// Size of the volume in MiB
    #[arg(short, long = "size-mib", default_value_t = 64)]
    pub size_mib: u64,

    /// Volume label
    #[arg(short, long, default_value = "aurora")]
    pub label: String,

    /// Enable block deduplication
    #[arg(long)]
    pub dedup: bool,

    /// Enable compression with the given algorithm (lz4 or zstd)
    #[arg(long, value_name = "ALGORITHM")]
    pub compress: Option<String>,

    /// Encrypt file data; needs --key-file
    #[arg(long, requires = "key_file")]
    pub encrypt: bool,

    /// File holding the master key material
    #[arg(short = 'k', long = "key-file")]
    pub key_file: Option<PathBuf>,

    /// Disable snapshots
    #[arg(long)]
    pub no_snapshots: bool,

    /// Overwrite an existing image without confirmation
    #[arg(short, long)]
    pub force: bool,
}

impl FormatArgs {
    fn options(&self) -> Result<FormatOptions> {
        let mut options = FormatOptions {
            label: self.label.clone(),
            features: Features::empty(),
            ..FormatOptions::default()
        };
        if !self.no_snapshots {
            options.features.insert(Features::SNAPSHOT);
        }
        if self.dedup {
            options.features.insert(Features::DEDUP);
        }
        if let Some(name) = &self.compress {
            let algorithm: CompressionAlgorithm = name.parse()?;
            if algorithm == CompressionAlgorithm::None {
                return Err(anyhow!("--compress needs lz4 or zstd"));
            }
            options.features.insert(Features::COMPRESS);
            options.compression = algorithm;
        }
        if self.encrypt {
            let path = self
                .key_file
                .as_deref()
                .ok_or_else(|| anyhow!("--encrypt needs --key-file"))?;
            options.features.insert(Features::ENCRYPT);
            options.master_key = Some(load_key(path)?);
        }
        Ok(options)
    }
}

pub async fn run(args: FormatArgs) -> Result<()> {
    info!("AuroraFS Format Tool v{}", env!("CARGO_PKG_VERSION"));

    let options = args.options()?;
    let size = args
        .size_mib
        .checked_mul(1024 * 1024)
        .ok_or_else(|| anyhow!("Volume size of {} MiB is too large", args.size_mib))?;

    if args.image.exists() && !args.force {
        print!(
            "Image {:?} already exists and will be overwritten. Continue? (yes/no) ",
            args.image
        );
        std::io::stdout().flush()?;
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("yes") {
            println!("Format cancelled");
            return Ok(());
        }
    }

    let device = FileBackedBlockDevice::create(&args.image, size)
        .await
        .with_context(|| format!("Failed to create image {:?}", args.image))?;
    let sb = format_volume(Arc::new(device), &options)
        .await
        .with_context(|| format!("Failed to format {:?}", args.image))?;

    println!("Formatted {:?}", args.image);
    println!("  Label:        {}", sb.label());
    println!("  Size:         {}", format_bytes(size));
    println!("  Blocks:       {} ({} free)", sb.total_blocks, sb.free_blocks);
    println!("  Inodes:       {} ({} free)", sb.total_inodes, sb.free_inodes);
    println!("  Features:     {}", options.features.names().join(", "));
    Ok(())
}
