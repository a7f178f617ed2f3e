//! Snapshot command for managing AuroraFS snapshots

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::io::Write;

use aurorafs::{AuroraFs, SnapshotInfo};

use super::{close_volume, format_bytes, format_time, open_volume, VolumeArgs};

/// Manage snapshots
#[derive(Parser, Debug)]
#[command(about = "Manage AuroraFS snapshots")]
pub struct SnapshotArgs {
    #[command(flatten)]
    pub volume: VolumeArgs,

    #[command(subcommand)]
    pub command: SnapshotCommands,
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommands {
    /// Capture the current tree
    Create {
        /// Name for the snapshot
        name: String,

        /// Optional description
        #[arg(long, default_value = "")]
        description: String,
    },

    /// List all snapshots
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Delete a snapshot
    Delete {
        /// Name or ID of the snapshot to delete
        snapshot: String,
    },

    /// Make a snapshot's tree the live tree
    Rollback {
        /// Name or ID of the snapshot to roll back to
        snapshot: String,

        /// Roll back without confirmation
        #[arg(short, long)]
        force: bool,
    },
}

/// Accept either a numeric id or a snapshot name
async fn resolve(fs: &AuroraFs, snapshot: &str) -> Result<u64> {
    if let Ok(id) = snapshot.parse::<u64>() {
        return Ok(id);
    }
    let info = fs
        .find_snapshot(snapshot)
        .await
        .with_context(|| format!("Snapshot '{}' not found", snapshot))?;
    Ok(info.id)
}

pub async fn run(args: SnapshotArgs) -> Result<()> {
    let read_only = matches!(args.command, SnapshotCommands::List { .. });
    let fs = open_volume(&args.volume, read_only).await?;
    let result = execute(&fs, args.command).await;
    close_volume(fs, &args.volume).await?;
    result
}

async fn execute(fs: &AuroraFs, command: SnapshotCommands) -> Result<()> {
    match command {
        SnapshotCommands::Create { name, description } => {
            info!("Creating snapshot '{}'", name);
            let id = fs.create_snapshot(&name, &description).await?;
            println!("Created snapshot '{}' with ID {}", name, id);
        }

        SnapshotCommands::List { json } => {
            let snapshots = fs.list_snapshots().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshots)?);
            } else {
                print_table(&snapshots);
            }
        }

        SnapshotCommands::Delete { snapshot } => {
            let id = resolve(fs, &snapshot).await?;
            info!("Deleting snapshot ID {}", id);
            fs.delete_snapshot(id).await?;
            println!("Deleted snapshot {}", id);
        }

        SnapshotCommands::Rollback { snapshot, force } => {
            let id = resolve(fs, &snapshot).await?;
            if !force {
                println!("WARNING: Rolling back discards every change made after the snapshot was taken.");
                print!("Roll back to snapshot {}? (yes/no) ", snapshot);
                std::io::stdout().flush()?;

                let mut input = String::new();
                std::io::stdin().read_line(&mut input)?;
                if !input.trim().eq_ignore_ascii_case("yes") {
                    println!("Rollback cancelled");
                    return Ok(());
                }
            }

            info!("Rolling back to snapshot ID {}", id);
            fs.rollback_snapshot(id).await?;
            println!("Rolled back to snapshot {}", id);
        }
    }
    Ok(())
}

fn print_table(snapshots: &[SnapshotInfo]) {
    if snapshots.is_empty() {
        println!("No snapshots found");
        return;
    }

    println!(
        "{:<6} {:<20} {:<20} {:<8} {:<12} {}",
        "ID", "NAME", "CREATED", "PARENT", "SPACE", "DESCRIPTION"
    );
    println!("{}", "-".repeat(80));
    for snap in snapshots {
        let marker = if snap.active { "*" } else { "" };
        println!(
            "{:<6} {:<20} {:<20} {:<8} {:<12} {}",
            format!("{}{}", snap.id, marker),
            snap.name,
            format_time(snap.created),
            snap.parent,
            format_bytes(snap.space_estimate),
            snap.description
        );
    }
}
