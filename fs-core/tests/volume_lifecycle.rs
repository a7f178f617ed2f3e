//! Format, mount and unmount behaviour of whole volumes

use std::sync::Arc;

use aurorafs::blockdev::{BlockDevice, MemoryBlockDevice};
use aurorafs::modules::{Journal, TransactionState};
use aurorafs::{
    format_volume, probe, AuroraFs, Error, Features, FileKind, FileSystemOps, FormatOptions,
    MemoryJournal, MountOptions,
};

const MIB: u64 = 1024 * 1024;

fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}

async fn formatted(options: &FormatOptions) -> Arc<MemoryBlockDevice> {
    let device = Arc::new(MemoryBlockDevice::new(4 * MIB));
    format_volume(device.clone(), options).await.unwrap();
    device
}

#[tokio::test]
async fn test_format_geometry() {
    init_logging();
    let device = Arc::new(MemoryBlockDevice::new(4 * MIB));
    let sb = format_volume(device.clone(), &FormatOptions::default())
        .await
        .unwrap();

    assert_eq!(sb.total_blocks, 1024);
    assert_eq!(sb.total_inodes, 256);
    assert_eq!(sb.free_inodes, 255);
    // superblock, one block bitmap block, one inode bitmap block, 16 inode table blocks
    assert_eq!(sb.free_blocks, 1024 - 19);
    assert_eq!(sb.root_inode, 1);

    let probed = probe(device.as_ref()).await.unwrap();
    assert_eq!(probed.free_blocks, sb.free_blocks);
    assert!(probed.features.contains(Features::SNAPSHOT));
}

#[tokio::test]
async fn test_format_rejects_tiny_device() {
    let device = Arc::new(MemoryBlockDevice::new(3 * 4096));
    let err = format_volume(device, &FormatOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn test_mount_fails_closed_on_bad_magic() {
    init_logging();
    let blank = Arc::new(MemoryBlockDevice::new(4 * MIB));
    let fs = AuroraFs::new(MountOptions::default());
    assert!(matches!(
        fs.mount(blank).await,
        Err(Error::CorruptSuperblock(_))
    ));
    assert!(!fs.is_mounted().await);
    assert!(matches!(fs.unmount().await, Err(Error::NotMounted)));

    let device = formatted(&FormatOptions::default()).await;
    let mut bytes = device.to_bytes().unwrap();
    bytes[0] ^= 0xFF;
    let damaged = Arc::new(MemoryBlockDevice::from_bytes(bytes));
    assert!(matches!(
        fs.mount(damaged).await,
        Err(Error::CorruptSuperblock(_))
    ));
    assert!(matches!(fs.lookup("/").await, Err(Error::NotMounted)));
}

#[tokio::test]
async fn test_double_mount_is_refused() {
    let device = formatted(&FormatOptions::default()).await;
    let fs = AuroraFs::new(MountOptions::default());
    fs.mount(device.clone()).await.unwrap();
    assert!(matches!(fs.mount(device).await, Err(Error::AlreadyMounted)));
    fs.unmount().await.unwrap();
    assert!(!fs.is_mounted().await);
}

#[tokio::test]
async fn test_unmount_marks_clean_and_counts_mounts() {
    let device = formatted(&FormatOptions::default()).await;
    let fs = AuroraFs::new(MountOptions::default());
    for round in 1..=3u32 {
        fs.mount(device.clone()).await.unwrap();
        assert_eq!(fs.statfs().await.unwrap().state, "mounted");
        fs.unmount().await.unwrap();
        let sb = probe(device.as_ref()).await.unwrap();
        assert_eq!(sb.mount_count, round);
    }
}

#[tokio::test]
async fn test_encrypted_volume_needs_right_key() {
    init_logging();
    let key = [0x11u8; 32];
    let options = FormatOptions {
        features: Features::ENCRYPT | Features::COMPRESS | Features::SNAPSHOT,
        master_key: Some(key),
        ..FormatOptions::default()
    };
    let device = formatted(&options).await;
    let secret = b"TOP-SECRET-PAYLOAD ".repeat(100);

    let fs = AuroraFs::new(MountOptions {
        master_key: Some(key),
        ..MountOptions::default()
    });
    fs.mount(device.clone()).await.unwrap();
    fs.create("/secret", FileKind::File).await.unwrap();
    fs.write("/secret", 0, &secret).await.unwrap();
    assert_eq!(fs.stat("/secret").await.unwrap().encryption, "aes-256-gcm");
    fs.unmount().await.unwrap();

    let image = device.to_bytes().unwrap();
    assert!(!image
        .windows(b"TOP-SECRET".len())
        .any(|w| w == b"TOP-SECRET"));

    let wrong = AuroraFs::new(MountOptions {
        master_key: Some([0x22u8; 32]),
        ..MountOptions::default()
    });
    assert!(matches!(
        wrong.mount(device.clone()).await,
        Err(Error::CryptoFailure(_))
    ));
    assert!(!wrong.is_mounted().await);

    let keyless = AuroraFs::new(MountOptions::default());
    assert!(matches!(
        keyless.mount(device.clone()).await,
        Err(Error::CryptoFailure(_))
    ));

    fs.mount(device).await.unwrap();
    assert_eq!(fs.read("/secret", 0, secret.len()).await.unwrap(), secret);
    fs.unmount().await.unwrap();
}

#[tokio::test]
async fn test_journal_brackets_mutations() {
    let options = FormatOptions {
        features: Features::JOURNAL | Features::SNAPSHOT,
        ..FormatOptions::default()
    };
    let device = formatted(&options).await;

    let bare = AuroraFs::new(MountOptions::default());
    assert!(matches!(
        bare.mount(device.clone()).await,
        Err(Error::FeatureDisabled("journal"))
    ));

    let journal = Arc::new(MemoryJournal::new());
    let fs = AuroraFs::new(MountOptions {
        journal: Some(journal.clone() as Arc<dyn Journal>),
        ..MountOptions::default()
    });
    fs.mount(device).await.unwrap();

    fs.create("/a", FileKind::File).await.unwrap();
    fs.write("/a", 0, b"logged").await.unwrap();
    assert!(matches!(
        fs.create("/a", FileKind::File).await,
        Err(Error::AlreadyExists)
    ));
    fs.read("/a", 0, 16).await.unwrap();
    fs.lookup("/a").await.unwrap();

    assert_eq!(journal.count(TransactionState::Committed), 2);
    assert_eq!(journal.count(TransactionState::Aborted), 1);
    assert_eq!(journal.count(TransactionState::Active), 0);
    let ops: Vec<String> = journal.transactions().into_iter().map(|t| t.op).collect();
    assert_eq!(ops, vec!["create", "write", "create"]);
    fs.unmount().await.unwrap();
}

#[tokio::test]
async fn test_unjournaled_volume_ignores_journal() {
    let device = formatted(&FormatOptions::default()).await;
    let journal = Arc::new(MemoryJournal::new());
    let fs = AuroraFs::new(MountOptions {
        journal: Some(journal.clone() as Arc<dyn Journal>),
        ..MountOptions::default()
    });
    fs.mount(device).await.unwrap();
    fs.create("/a", FileKind::File).await.unwrap();
    assert!(journal.transactions().is_empty());
}

#[tokio::test]
async fn test_snapshot_calls_need_feature() {
    let options = FormatOptions {
        features: Features::empty(),
        ..FormatOptions::default()
    };
    let device = formatted(&options).await;
    let fs = AuroraFs::new(MountOptions::default());
    fs.mount(device).await.unwrap();
    let free = fs.statfs().await.unwrap().free_blocks;

    assert!(matches!(
        fs.create_snapshot("nightly", "").await,
        Err(Error::FeatureDisabled("snapshot"))
    ));
    assert!(matches!(
        fs.list_snapshots().await,
        Err(Error::FeatureDisabled("snapshot"))
    ));
    assert!(matches!(
        fs.rollback_snapshot(1).await,
        Err(Error::FeatureDisabled("snapshot"))
    ));
    assert!(matches!(
        fs.delete_snapshot(1).await,
        Err(Error::FeatureDisabled("snapshot"))
    ));
    assert_eq!(fs.statfs().await.unwrap().free_blocks, free);
}

#[tokio::test]
async fn test_counters_stay_in_range_when_full() {
    init_logging();
    let device = formatted(&FormatOptions {
        features: Features::empty(),
        ..FormatOptions::default()
    })
    .await;
    let fs = AuroraFs::new(MountOptions::default());
    fs.mount(device.clone()).await.unwrap();
    fs.create("/fill", FileKind::File).await.unwrap();

    let chunk: Vec<u8> = (0..64 * 4096u32).map(|i| (i * 7 + i / 4096) as u8).collect();
    let mut offset = 0u64;
    let err = loop {
        match fs.write("/fill", offset, &chunk).await {
            Ok(n) => offset += n as u64,
            Err(e) => break e,
        }
    };
    assert!(matches!(err, Error::NoFreeBlocks));

    let info = fs.statfs().await.unwrap();
    assert!(info.free_blocks <= info.total_blocks);
    assert!(info.free_inodes <= info.total_inodes);
    assert_eq!(fs.stat("/fill").await.unwrap().size, offset);

    // The failed write left nothing behind: the file shrinks back to empty
    fs.truncate("/fill", 0).await.unwrap();
    fs.unlink("/fill").await.unwrap();
    assert_eq!(fs.statfs().await.unwrap().free_blocks, 1024 - 19);
    fs.unmount().await.unwrap();

    let sb = probe(device.as_ref()).await.unwrap();
    assert_eq!(sb.free_blocks, 1024 - 19);
    assert_eq!(sb.free_inodes, 255);
    assert!(device.block_count() == sb.total_blocks);
}
