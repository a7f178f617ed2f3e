//! File and directory commands: ls, mkdir, rm, put, get

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{debug, info};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

use aurorafs::{AuroraFs, DirEntryInfo, Error, FileKind, FileSystemOps};

use super::{close_volume, format_time, open_volume, VolumeArgs};

/// Transfer unit for put and get
const CHUNK_SIZE: usize = 1024 * 1024;

/// List a directory
#[derive(Parser, Debug)]
#[command(about = "List a directory inside the volume")]
pub struct LsArgs {
    #[command(flatten)]
    pub volume: VolumeArgs,

    /// Path inside the volume
    #[arg(default_value = "/")]
    pub path: String,

    /// Show attributes for each entry
    #[arg(short, long)]
    pub long: bool,
}

/// Create a directory
#[derive(Parser, Debug)]
#[command(about = "Create a directory inside the volume")]
pub struct MkdirArgs {
    #[command(flatten)]
    pub volume: VolumeArgs,

    pub path: String,

    /// Permission bits in octal
    #[arg(short, long, default_value = "755")]
    pub mode: String,

    /// Create missing parents too
    #[arg(short, long)]
    pub parents: bool,
}

/// Remove a file or directory
#[derive(Parser, Debug)]
#[command(about = "Remove a file or directory inside the volume")]
pub struct RmArgs {
    #[command(flatten)]
    pub volume: VolumeArgs,

    pub path: String,

    /// Remove directories and their contents
    #[arg(short, long)]
    pub recursive: bool,
}

/// Copy a host file into the volume
#[derive(Parser, Debug)]
#[command(about = "Copy a host file into the volume")]
pub struct PutArgs {
    #[command(flatten)]
    pub volume: VolumeArgs,

    /// Host file to read
    pub source: PathBuf,

    /// Destination path inside the volume
    pub dest: String,
}

/// Copy a file out of the volume
#[derive(Parser, Debug)]
#[command(about = "Copy a file out of the volume")]
pub struct GetArgs {
    #[command(flatten)]
    pub volume: VolumeArgs,

    /// Path inside the volume
    pub source: String,

    /// Host file to write; stdout when omitted
    pub dest: Option<PathBuf>,
}

fn join(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Entries of directory `dir`, without `.` and `..`
async fn list_dir(fs: &AuroraFs, dir: u64) -> Result<Vec<DirEntryInfo>> {
    let mut entries = Vec::new();
    let mut index = 2;
    while let Some(entry) = fs.readdir(dir, index).await? {
        entries.push(entry);
        index += 1;
    }
    Ok(entries)
}

pub async fn ls(args: LsArgs) -> Result<()> {
    let fs = open_volume(&args.volume, true).await?;
    let result = list_entries(&fs, &args).await;
    close_volume(fs, &args.volume).await?;
    result
}

async fn list_entries(fs: &AuroraFs, args: &LsArgs) -> Result<()> {
    let stat = fs.stat(&args.path).await?;
    if stat.kind != "directory" {
        println!("{:>10}  {}", stat.size, args.path);
        return Ok(());
    }

    for entry in list_dir(fs, stat.inode).await? {
        let suffix = if entry.kind == FileKind::Directory { "/" } else { "" };
        if args.long {
            let child = fs.stat(&join(&args.path, &entry.name)).await?;
            println!(
                "{:>6} {:04o} {:>5} {:>5} {:>10}  {}  {}{}",
                child.inode,
                child.mode,
                child.uid,
                child.gid,
                child.size,
                format_time(child.mtime),
                entry.name,
                suffix
            );
        } else {
            println!("{}{}", entry.name, suffix);
        }
    }
    Ok(())
}

pub async fn mkdir(args: MkdirArgs) -> Result<()> {
    let mode = u32::from_str_radix(&args.mode, 8)
        .map_err(|_| anyhow!("Invalid octal mode '{}'", args.mode))?;

    let fs = open_volume(&args.volume, false).await?;
    let result = make_dirs(&fs, &args, mode).await;
    close_volume(fs, &args.volume).await?;
    result
}

async fn make_dirs(fs: &AuroraFs, args: &MkdirArgs, mode: u32) -> Result<()> {
    if !args.parents {
        fs.mkdir(&args.path, mode).await?;
        return Ok(());
    }

    let mut current = String::new();
    for part in args.path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        match fs.mkdir(&current, mode).await {
            Ok(_) => debug!("Created {}", current),
            Err(Error::AlreadyExists) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Remove `root` and everything beneath it, deepest entries first
async fn remove_tree(fs: &AuroraFs, root: &str) -> Result<u64> {
    let mut pending = vec![(root.to_string(), false)];
    let mut removed = 0;
    while let Some((path, expanded)) = pending.pop() {
        let stat = fs.stat(&path).await?;
        if stat.kind != "directory" {
            fs.unlink(&path).await?;
        } else if expanded {
            fs.rmdir(&path).await?;
        } else {
            pending.push((path.clone(), true));
            for entry in list_dir(fs, stat.inode).await? {
                pending.push((join(&path, &entry.name), false));
            }
            continue;
        }
        removed += 1;
    }
    Ok(removed)
}

pub async fn rm(args: RmArgs) -> Result<()> {
    let fs = open_volume(&args.volume, false).await?;
    let result = remove_path(&fs, &args).await;
    close_volume(fs, &args.volume).await?;
    result
}

async fn remove_path(fs: &AuroraFs, args: &RmArgs) -> Result<()> {
    let stat = fs.stat(&args.path).await?;
    if stat.kind == "directory" {
        if args.recursive {
            let removed = remove_tree(fs, &args.path).await?;
            info!("Removed {} entries under {}", removed, args.path);
        } else {
            fs.rmdir(&args.path).await?;
        }
    } else {
        fs.unlink(&args.path).await?;
    }
    Ok(())
}

pub async fn put(args: PutArgs) -> Result<()> {
    let data = tokio::fs::read(&args.source)
        .await
        .with_context(|| format!("Failed to read {:?}", args.source))?;

    let fs = open_volume(&args.volume, false).await?;
    let result = copy_in(&fs, &args, &data).await;
    close_volume(fs, &args.volume).await?;
    result
}

async fn copy_in(fs: &AuroraFs, args: &PutArgs, data: &[u8]) -> Result<()> {
    match fs.create(&args.dest, FileKind::File).await {
        Ok(_) => {}
        Err(Error::AlreadyExists) => fs.truncate(&args.dest, 0).await?,
        Err(e) => return Err(e.into()),
    }

    let mut offset = 0u64;
    for chunk in data.chunks(CHUNK_SIZE) {
        offset += fs.write(&args.dest, offset, chunk).await? as u64;
    }
    info!("Copied {} bytes to {}", offset, args.dest);
    Ok(())
}

pub async fn get(args: GetArgs) -> Result<()> {
    let fs = open_volume(&args.volume, true).await?;
    let result = copy_out(&fs, &args).await;
    close_volume(fs, &args.volume).await?;
    result
}

async fn copy_out(fs: &AuroraFs, args: &GetArgs) -> Result<()> {
    let size = fs.stat(&args.source).await?.size;
    let mut out: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = match &args.dest {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create {:?}", path))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let mut offset = 0u64;
    while offset < size {
        let chunk = fs.read(&args.source, offset, CHUNK_SIZE).await?;
        if chunk.is_empty() {
            break;
        }
        out.write_all(&chunk).await?;
        offset += chunk.len() as u64;
    }
    out.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
    }
}
