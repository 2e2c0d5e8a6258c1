//! Stress tests with a worker-thread backend and concurrent producers.
//!
//! Copies complete asynchronously here, so the allocator's blocking wait
//! path and its shared-use locking are exercised for real.

use ringstage::backend::{HostDevice, TransferSubmission};
use ringstage::staging::{StagingAllocator, StagingConfig};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn staging(device: &HostDevice, capacity: u32, name: &str) -> StagingAllocator {
    StagingAllocator::new(
        StagingConfig::new(capacity, 16).with_name(name),
        TransferSubmission::real(device.clone()),
    )
    .unwrap()
}

/// A single producer streaming far more than the ring holds.
#[test]
fn test_streaming_producer_stalls_and_recovers() {
    let device = HostDevice::threaded_with_latency(Duration::from_micros(200));
    let buffer = device.create_buffer(64 * 1024);
    let staging = staging(&device, 4096, "stream");

    for i in 0..64u64 {
        let block = vec![i as u8; 1024];
        staging.stage_linear_write(buffer, i * 1024, &block).unwrap();
    }
    staging.wait_idle().unwrap();

    let contents = device.buffer_contents(buffer).unwrap();
    for i in 0..64usize {
        assert!(contents[i * 1024..(i + 1) * 1024].iter().all(|&b| b == i as u8));
    }
    let stats = staging.stats();
    assert!(stats.stalls > 0);
    assert_eq!(stats.pinned_bytes, 0);
}

/// Several threads write disjoint buffer ranges through one allocator.
#[test]
fn test_concurrent_producers() {
    let device = HostDevice::threaded();
    let buffer = device.create_buffer(8 * 32 * 256);
    let staging = Arc::new(staging(&device, 2048, "shared"));

    let handles: Vec<_> = (0..8u64)
        .map(|producer| {
            let staging = Arc::clone(&staging);
            thread::spawn(move || {
                for i in 0..32u64 {
                    let offset = (producer * 32 + i) * 256;
                    let fill = (producer * 32 + i) as u8;
                    staging.stage_linear_write(buffer, offset, &[fill; 256]).unwrap();
                    if i % 5 == 0 {
                        staging.flush();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    staging.wait_idle().unwrap();

    let contents = device.buffer_contents(buffer).unwrap();
    for block in 0..256usize {
        let expected = block as u8;
        assert!(
            contents[block * 256..(block + 1) * 256]
                .iter()
                .all(|&b| b == expected),
            "block {} corrupted",
            block
        );
    }
    assert_eq!(staging.stats().transfers_issued, 256);
}

/// Readers and writers share the ring without corrupting each other.
#[test]
fn test_concurrent_readers_and_writers() {
    let device = HostDevice::threaded();
    let source: Vec<u8> = (0..4096).map(|i| (i % 239) as u8).collect();
    let readable = device.create_buffer_with(&source);
    let writable = device.create_buffer(4 * 1024);
    let staging = Arc::new(staging(&device, 1024, "mixed"));

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let staging = Arc::clone(&staging);
            let expected = source.clone();
            thread::spawn(move || {
                for round in 0..20usize {
                    let offset = (round * 128) % 3584;
                    let mut out = vec![0u8; 512];
                    staging
                        .stage_linear_read(readable, offset as u64, &mut out)
                        .unwrap();
                    assert_eq!(out, expected[offset..offset + 512]);
                }
            })
        })
        .collect();

    let writer = {
        let staging = Arc::clone(&staging);
        thread::spawn(move || {
            for i in 0..16u64 {
                staging
                    .stage_linear_write(writable, (i % 4) * 1024, &[i as u8; 1024])
                    .unwrap();
            }
        })
    };

    for reader in readers {
        reader.join().unwrap();
    }
    writer.join().unwrap();
    staging.wait_idle().unwrap();

    let contents = device.buffer_contents(writable).unwrap();
    for slot in 0..4usize {
        assert!(contents[slot * 1024..(slot + 1) * 1024]
            .iter()
            .all(|&b| b == 12 + slot as u8));
    }
}

/// Pinned regions stay disjoint while copies complete in the background.
#[test]
fn test_no_double_pin_under_async_completion() {
    let device = HostDevice::threaded_with_latency(Duration::from_micros(50));
    let buffer = device.create_buffer(4096);
    let staging = staging(&device, 4096, "pins");

    for step in 0..200usize {
        let size = 64 + (step * 97) % 1500;
        staging.stage_linear_write(buffer, 0, &vec![1u8; size]).unwrap();
        if step % 3 == 0 {
            staging.flush();
        }

        let pending = staging.pending_regions();
        for (i, a) in pending.iter().enumerate() {
            for b in &pending[i + 1..] {
                assert!(!a.region.overlaps(&b.region));
            }
        }
    }
}

/// Dropping the allocator waits for in-flight copies.
#[test]
fn test_drop_waits_for_in_flight_copies() {
    let device = HostDevice::threaded_with_latency(Duration::from_millis(2));
    let buffer = device.create_buffer(512);
    {
        let staging = staging(&device, 1024, "drop");
        staging.stage_linear_write(buffer, 0, &[9u8; 512]).unwrap();
    }
    assert_eq!(device.pending_count(), 0);
    assert_eq!(device.buffer_contents(buffer).unwrap(), vec![9u8; 512]);
}
