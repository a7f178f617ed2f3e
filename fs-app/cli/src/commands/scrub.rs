//! Scrub command for volume verification

use anyhow::{anyhow, Result};
use clap::Parser;
use log::{error, info};
use std::time::Instant;

use aurorafs::ScrubReport;

use super::{close_volume, format_time, open_volume, VolumeArgs};

/// Verify every reachable block and the reference ledger
#[derive(Parser, Debug)]
#[command(about = "Verify AuroraFS volume integrity")]
pub struct ScrubArgs {
    #[command(flatten)]
    pub volume: VolumeArgs,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: ScrubArgs) -> Result<()> {
    let fs = open_volume(&args.volume, true).await?;
    info!("Starting scrub of {:?}", args.volume.image);
    let start_time = Instant::now();
    let report = fs.scrub().await;
    close_volume(fs, &args.volume).await?;
    let report = report?;
    info!(
        "Scrub completed in {:.2} seconds",
        start_time.elapsed().as_secs_f64()
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if report.is_clean() {
        Ok(())
    } else {
        error!("Volume {:?} has integrity errors", args.volume.image);
        Err(anyhow!("scrub found errors"))
    }
}

fn print_report(report: &ScrubReport) {
    println!("Scrub report:");
    println!("  Started:              {}", format_time(report.started));
    println!("  Finished:             {}", format_time(report.finished));
    println!("  Inodes checked:       {}", report.inodes_checked);
    println!("  Blocks verified:      {}", report.blocks_verified);
    println!("  Hash mismatches:      {}", report.hash_mismatches);
    println!("  Crypto failures:      {}", report.crypto_failures);
    println!("  Read errors:          {}", report.read_errors);
    println!("  Refcount mismatches:  {}", report.refcount_mismatches);
    println!("  Inode ref mismatches: {}", report.inode_ref_mismatches);

    if report.is_clean() {
        println!("\nVolume is healthy, no errors found");
    }
}
