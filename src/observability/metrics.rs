//! Metrics collection using metrics-rs.

use crate::backend::TransferKind;
use metrics::{Counter, Gauge, Histogram, Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const BYTES_STAGED: &str = "ringstage_bytes_staged";
const TRANSFERS: &str = "ringstage_transfers";
const STALLS: &str = "ringstage_stalls";
const WRAPS: &str = "ringstage_wraps";
const PINNED_BYTES: &str = "ringstage_pinned_bytes";
const PENDING_TRANSFERS: &str = "ringstage_pending_transfers";
const STALL_TIME_NS: &str = "ringstage_stall_time_ns";

const KINDS: [TransferKind; 4] = [
    TransferKind::BufferWrite,
    TransferKind::BufferRead,
    TransferKind::ImageWrite,
    TransferKind::ImageRead,
];

/// Initialize metrics descriptions.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        BYTES_STAGED,
        Unit::Bytes,
        "Bytes copied through the staging ring"
    );
    metrics::describe_counter!(TRANSFERS, Unit::Count, "Staged transfers submitted");
    metrics::describe_counter!(
        STALLS,
        Unit::Count,
        "Reservations that waited on an in-flight fence"
    );
    metrics::describe_counter!(WRAPS, Unit::Count, "Reservations that wrapped to offset 0");
    metrics::describe_gauge!(
        PINNED_BYTES,
        Unit::Bytes,
        "Ring bytes pinned by unretired fences"
    );
    metrics::describe_gauge!(
        PENDING_TRANSFERS,
        Unit::Count,
        "Transfers awaiting fence retirement"
    );
    metrics::describe_histogram!(
        STALL_TIME_NS,
        Unit::Nanoseconds,
        "Time a producer spent waiting for ring space"
    );
}

/// Metric handles bound to one allocator's name.
#[derive(Clone)]
pub struct StagingMetrics {
    name: String,
    bytes_staged: Counter,
    transfers: [Counter; 4],
    stalls: Counter,
    wraps: Counter,
    pinned_bytes: Gauge,
    pending: Gauge,
    stall_time: Histogram,
}

impl StagingMetrics {
    /// Create handles labelled with `name`.
    pub fn new(name: &str) -> Self {
        let transfers = KINDS.map(|kind| {
            counter!(
                TRANSFERS,
                "allocator" => name.to_string(),
                "kind" => kind.as_str()
            )
        });
        Self {
            name: name.to_string(),
            bytes_staged: counter!(BYTES_STAGED, "allocator" => name.to_string()),
            transfers,
            stalls: counter!(STALLS, "allocator" => name.to_string()),
            wraps: counter!(WRAPS, "allocator" => name.to_string()),
            pinned_bytes: gauge!(PINNED_BYTES, "allocator" => name.to_string()),
            pending: gauge!(PENDING_TRANSFERS, "allocator" => name.to_string()),
            stall_time: histogram!(STALL_TIME_NS, "allocator" => name.to_string()),
        }
    }

    /// Record a submitted transfer of `bytes` caller bytes.
    #[inline]
    pub fn record_transfer(&self, kind: TransferKind, bytes: u64) {
        let index = KINDS.iter().position(|k| *k == kind).unwrap_or(0);
        self.transfers[index].increment(1);
        self.bytes_staged.increment(bytes);
    }

    /// Record a reservation that had to wait.
    #[inline]
    pub fn record_stall(&self, waited: Duration) {
        self.stalls.increment(1);
        self.stall_time.record(waited.as_nanos() as f64);
    }

    /// Record ring wraps since the last call.
    #[inline]
    pub fn record_wraps(&self, count: u64) {
        if count > 0 {
            self.wraps.increment(count);
        }
    }

    /// Publish the current ring occupancy.
    #[inline]
    pub fn record_occupancy(&self, pinned_bytes: u64, pending: usize) {
        self.pinned_bytes.set(pinned_bytes as f64);
        self.pending.set(pending as f64);
    }

    /// Start a stall timer that records on drop.
    pub fn start_stall(&self) -> StallTimer<'_> {
        StallTimer {
            start: Instant::now(),
            metrics: self,
        }
    }

    /// Allocator name the handles are labelled with.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Guard that records a stall when dropped.
pub struct StallTimer<'a> {
    start: Instant,
    metrics: &'a StagingMetrics,
}

impl StallTimer<'_> {
    /// Time spent so far.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for StallTimer<'_> {
    fn drop(&mut self) {
        self.metrics.record_stall(self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        init_metrics();
        // Idempotent
        init_metrics();
    }

    #[test]
    fn test_staging_metrics() {
        let metrics = StagingMetrics::new("test-ring");

        metrics.record_transfer(TransferKind::BufferWrite, 128);
        metrics.record_transfer(TransferKind::ImageRead, 64);
        metrics.record_wraps(0);
        metrics.record_wraps(2);
        metrics.record_occupancy(4096, 3);

        assert_eq!(metrics.name(), "test-ring");
    }

    #[test]
    fn test_stall_timer() {
        let metrics = StagingMetrics::new("stall-test");
        {
            let timer = metrics.start_stall();
            std::thread::sleep(Duration::from_millis(1));
            assert!(timer.elapsed() >= Duration::from_millis(1));
        }
    }
}
