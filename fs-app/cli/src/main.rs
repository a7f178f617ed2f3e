//! AuroraFS Command Line Interface
//!
//! Formats, inspects and edits AuroraFS volume images.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};

mod commands;

/// AuroraFS - deduplicating, compressing, encrypting volume store with snapshots
#[derive(Parser)]
#[command(
    name = "aurorafs",
    about = "AuroraFS command-line interface",
    version = env!("CARGO_PKG_VERSION"),
    author = "AuroraFS Contributors"
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and format a volume image
    Format(commands::format::FormatArgs),

    /// Show volume information
    Info(commands::info::InfoArgs),

    /// List a directory
    Ls(commands::files::LsArgs),

    /// Create a directory
    Mkdir(commands::files::MkdirArgs),

    /// Remove a file or directory
    Rm(commands::files::RmArgs),

    /// Copy a host file into the volume
    Put(commands::files::PutArgs),

    /// Copy a file out of the volume
    Get(commands::files::GetArgs),

    /// Manage snapshots
    Snapshot(commands::snapshot::SnapshotArgs),

    /// Verify volume integrity
    Scrub(commands::scrub::ScrubArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .init();

    info!("AuroraFS CLI v{} starting...", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Format(args) => commands::format::run(args).await,
        Commands::Info(args) => commands::info::run(args).await,
        Commands::Ls(args) => commands::files::ls(args).await,
        Commands::Mkdir(args) => commands::files::mkdir(args).await,
        Commands::Rm(args) => commands::files::rm(args).await,
        Commands::Put(args) => commands::files::put(args).await,
        Commands::Get(args) => commands::files::get(args).await,
        Commands::Snapshot(args) => commands::snapshot::run(args).await,
        Commands::Scrub(args) => commands::scrub::run(args).await,
    }
}
