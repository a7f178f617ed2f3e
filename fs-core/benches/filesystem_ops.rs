use std::sync::Arc;

use aurorafs::blockdev::MemoryBlockDevice;
use aurorafs::{format_volume, AuroraFs, Features, FileKind, FileSystemOps, FormatOptions, MountOptions};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

const VOLUME_SIZE: u64 = 64 * 1024 * 1024;

fn mounted(rt: &Runtime, features: Features) -> AuroraFs {
    rt.block_on(async {
        let device = Arc::new(MemoryBlockDevice::new(VOLUME_SIZE));
        let options = FormatOptions {
            features,
            master_key: Some([7u8; 32]),
            ..FormatOptions::default()
        };
        format_volume(device.clone(), &options).await.unwrap();
        let fs = AuroraFs::new(MountOptions {
            master_key: Some([7u8; 32]),
            ..MountOptions::default()
        });
        fs.mount(device).await.unwrap();
        fs
    })
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u32).wrapping_mul(2654435761) as u8 ^ (i / 64) as u8).collect()
}

fn benchmark_writes(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let data = payload(64 * 1024);
    let mut group = c.benchmark_group("write_64k");
    group.throughput(Throughput::Bytes(data.len() as u64));

    for (name, features) in [
        ("plain", Features::empty()),
        ("lz4", Features::COMPRESS),
        ("aes_gcm", Features::ENCRYPT),
        ("all", Features::DEDUP | Features::COMPRESS | Features::ENCRYPT),
    ] {
        let fs = mounted(&rt, features);
        rt.block_on(fs.create("/bench", FileKind::File)).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(name), &data, |b, data| {
            b.iter(|| {
                rt.block_on(fs.write("/bench", 0, black_box(data))).unwrap();
            });
        });
    }
    group.finish();
}

fn benchmark_reads(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let data = payload(64 * 1024);
    let mut group = c.benchmark_group("read_64k");
    group.throughput(Throughput::Bytes(data.len() as u64));

    for (name, features) in [
        ("plain", Features::empty()),
        ("lz4", Features::COMPRESS),
        ("aes_gcm", Features::ENCRYPT),
    ] {
        let fs = mounted(&rt, features);
        rt.block_on(async {
            fs.create("/bench", FileKind::File).await.unwrap();
            fs.write("/bench", 0, &data).await.unwrap();
        });
        group.bench_function(name, |b| {
            b.iter(|| black_box(rt.block_on(fs.read("/bench", 0, data.len())).unwrap()));
        });
    }
    group.finish();
}

fn benchmark_dedup_hits(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let fs = mounted(&rt, Features::DEDUP);
    let block = payload(4096);
    rt.block_on(async {
        fs.create("/origin", FileKind::File).await.unwrap();
        fs.write("/origin", 0, &block).await.unwrap();
        fs.create("/copy", FileKind::File).await.unwrap();
    });

    c.bench_function("dedup_hit_4k", |b| {
        b.iter(|| {
            rt.block_on(fs.write("/copy", 0, black_box(&block))).unwrap();
        });
    });
}

criterion_group!(benches, benchmark_writes, benchmark_reads, benchmark_dedup_hits);
criterion_main!(benches);
