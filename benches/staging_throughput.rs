//! Staging ring benchmarks.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ringstage::backend::{HostDevice, TransferSubmission};
use ringstage::format::{TextureFormat, TextureRange, TextureType, Extent3D};
use ringstage::staging::{RingAllocator, StagingAllocator, StagingConfig};
use std::sync::Arc;

fn bench_ring_reserve_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_reserve_release");

    for size in [64u64, 1024, 16 * 1024] {
        let mut ring = RingAllocator::new(1024 * 1024, 16).unwrap();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let region = ring
                    .try_reserve(std::hint::black_box(size))
                    .unwrap()
                    .expect("ring has space");
                ring.release(region);
            });
        });
    }

    group.finish();
}

fn bench_linear_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("linear_writes");

    for size in [256usize, 4096, 64 * 1024] {
        let device = HostDevice::threaded();
        let buffer = device.create_buffer(size as u64);
        let staging = StagingAllocator::new(
            StagingConfig::new(1024 * 1024, 16).with_name("bench"),
            TransferSubmission::real(device.clone()),
        )
        .unwrap();
        let data = vec![0x5Au8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| {
                staging.stage_linear_write(buffer, 0, data).unwrap();
                staging.flush();
            });
        });
        staging.wait_idle().unwrap();
    }

    group.finish();
}

fn bench_image_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("image_writes");

    let device = HostDevice::threaded().with_row_pitch_alignment(256);
    let props = TextureFormat::Rgba8Unorm.properties();
    let image = device.create_image(TextureType::TwoD, props, Extent3D::new(256, 256, 1), 1, 1);
    let staging = StagingAllocator::new(
        StagingConfig::new(4 * 1024 * 1024, 16),
        TransferSubmission::real(device.clone()),
    )
    .unwrap();
    let data = vec![0x7Fu8; 256 * 256 * 4];
    let range = TextureRange::new_2d(0, 0, 256, 256);

    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("rgba_256x256_tiled", |b| {
        b.iter(|| {
            staging
                .stage_image_write(image, TextureType::TwoD, &range, &props, 0, &data)
                .unwrap();
        });
    });
    staging.wait_idle().unwrap();

    group.finish();
}

fn bench_concurrent_producers(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_producers");

    let device = HostDevice::threaded();
    let buffer = device.create_buffer(4 * 4096);
    let staging = Arc::new(
        StagingAllocator::new(
            StagingConfig::new(256 * 1024, 16),
            TransferSubmission::real(device.clone()),
        )
        .unwrap(),
    );

    group.throughput(Throughput::Elements(400));
    group.bench_function("4_threads_100_writes_each", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4u64)
                .map(|t| {
                    let staging = Arc::clone(&staging);
                    std::thread::spawn(move || {
                        let block = [t as u8; 4096];
                        for _ in 0..100 {
                            staging.stage_linear_write(buffer, t * 4096, &block).unwrap();
                        }
                    })
                })
                .collect();

            for h in handles {
                h.join().unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_ring_reserve_release,
    bench_linear_writes,
    bench_image_writes,
    bench_concurrent_producers
);
criterion_main!(benches);
