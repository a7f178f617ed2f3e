//! Reads and writes through the public operation set

use std::sync::Arc;

use aurorafs::blockdev::MemoryBlockDevice;
use aurorafs::{
    format_volume, AuroraFs, CompressionAlgorithm, Error, Features, FileKind, FileSystemOps,
    FormatOptions, MountOptions,
};
use rand::{rngs::StdRng, RngCore, SeedableRng};

const BLOCK: usize = 4096;

async fn setup_test_fs(options: FormatOptions) -> AuroraFs {
    let device = Arc::new(MemoryBlockDevice::new(8 * 1024 * 1024));
    let key = options.master_key;
    format_volume(device.clone(), &options).await.unwrap();
    let fs = AuroraFs::new(MountOptions {
        master_key: key,
        ..MountOptions::default()
    });
    fs.mount(device).await.unwrap();
    fs
}

fn feature_sets() -> Vec<FormatOptions> {
    vec![
        FormatOptions::default(),
        FormatOptions {
            features: Features::COMPRESS,
            compression: CompressionAlgorithm::Zstd,
            ..FormatOptions::default()
        },
        FormatOptions {
            features: Features::ENCRYPT | Features::COMPRESS,
            master_key: Some([9u8; 32]),
            ..FormatOptions::default()
        },
        FormatOptions {
            features: Features::DEDUP | Features::ENCRYPT | Features::SNAPSHOT,
            master_key: Some([9u8; 32]),
            ..FormatOptions::default()
        },
    ]
}

fn sample(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = vec![0u8; len];
    // Half random, half text, so compressible and incompressible blocks mix
    rng.fill_bytes(&mut out[..len / 2]);
    for (i, b) in out[len / 2..].iter_mut().enumerate() {
        *b = b"lorem ipsum dolor sit amet "[i % 27];
    }
    out
}

#[tokio::test]
async fn test_write_operation() {
    for options in feature_sets() {
        let fs = setup_test_fs(options).await;
        fs.create("/test.txt", FileKind::File).await.unwrap();
        let written = fs.write("/test.txt", 0, b"Hello, World!").await.unwrap();
        assert_eq!(written, 13);
        assert_eq!(
            fs.read("/test.txt", 0, 100).await.unwrap(),
            b"Hello, World!".to_vec()
        );
        fs.unmount().await.unwrap();
    }
}

#[tokio::test]
async fn test_multi_block_overwrites() {
    for options in feature_sets() {
        let fs = setup_test_fs(options).await;
        fs.create("/data", FileKind::File).await.unwrap();
        let mut model = sample(5 * BLOCK + 321, 1);
        fs.write("/data", 0, &model).await.unwrap();

        // Unaligned patch spanning three blocks
        let patch = sample(2 * BLOCK + 10, 2);
        let at = BLOCK + 4000;
        fs.write("/data", at as u64, &patch).await.unwrap();
        model[at..at + patch.len()].copy_from_slice(&patch);

        // Extend past the end
        let tail = b"appended";
        let end = model.len();
        fs.write("/data", end as u64, tail).await.unwrap();
        model.extend_from_slice(tail);

        assert_eq!(fs.read("/data", 0, model.len() + 100).await.unwrap(), model);
        assert_eq!(
            fs.read("/data", 3 * BLOCK as u64 + 7, 50).await.unwrap(),
            &model[3 * BLOCK + 7..3 * BLOCK + 57]
        );
        assert!(fs.read("/data", model.len() as u64, 10).await.unwrap().is_empty());
        assert_eq!(fs.stat("/data").await.unwrap().size, model.len() as u64);
        assert!(fs.scrub().await.unwrap().is_clean());
    }
}

#[tokio::test]
async fn test_sparse_write_and_truncate() {
    let fs = setup_test_fs(FormatOptions::default()).await;
    fs.create("/sparse", FileKind::File).await.unwrap();
    fs.write("/sparse", 10 * BLOCK as u64, b"far").await.unwrap();

    let stat = fs.stat("/sparse").await.unwrap();
    assert_eq!(stat.size, 10 * BLOCK as u64 + 3);
    assert_eq!(stat.blocks, 1);
    let head = fs.read("/sparse", 0, BLOCK).await.unwrap();
    assert!(head.iter().all(|&b| b == 0));

    fs.truncate("/sparse", 5).await.unwrap();
    assert_eq!(fs.stat("/sparse").await.unwrap().blocks, 0);
    assert_eq!(fs.read("/sparse", 0, 64).await.unwrap(), vec![0u8; 5]);

    fs.write("/sparse", 0, b"abcdefgh").await.unwrap();
    fs.truncate("/sparse", 3).await.unwrap();
    fs.truncate("/sparse", 6).await.unwrap();
    assert_eq!(fs.read("/sparse", 0, 64).await.unwrap(), b"abc\0\0\0".to_vec());
}

#[tokio::test]
async fn test_data_calls_reject_directories() {
    let fs = setup_test_fs(FormatOptions::default()).await;
    fs.mkdir("/dir", 0o755).await.unwrap();
    assert!(matches!(fs.write("/dir", 0, b"x").await, Err(Error::IsADirectory)));
    assert!(matches!(fs.read("/dir", 0, 1).await, Err(Error::IsADirectory)));
    assert!(matches!(fs.truncate("/dir", 0).await, Err(Error::IsADirectory)));
    assert!(matches!(fs.read("/missing", 0, 1).await, Err(Error::NotFound)));
    assert!(matches!(
        fs.create("/dir/sub/file", FileKind::File).await,
        Err(Error::NotFound)
    ));
    assert!(matches!(
        fs.create("relative", FileKind::File).await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_deep_tree_release() {
    let fs = setup_test_fs(FormatOptions::default()).await;
    let free_inodes = fs.statfs().await.unwrap().free_inodes;
    let free_blocks = fs.statfs().await.unwrap().free_blocks;

    let mut path = String::new();
    for depth in 0..8 {
        path.push_str(&format!("/d{}", depth));
        fs.mkdir(&path, 0o755).await.unwrap();
        let file = format!("{}/f", path);
        fs.create(&file, FileKind::File).await.unwrap();
        fs.write(&file, 0, &sample(BLOCK + 1, depth)).await.unwrap();
    }

    // Tear down leaf first
    for depth in (0..8).rev() {
        let dir: String = (0..=depth).map(|d| format!("/d{}", d)).collect();
        fs.unlink(&format!("{}/f", dir)).await.unwrap();
        fs.rmdir(&dir).await.unwrap();
    }
    let info = fs.statfs().await.unwrap();
    assert_eq!(info.free_inodes, free_inodes);
    assert_eq!(info.free_blocks, free_blocks);
}
