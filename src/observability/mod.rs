//! Observability features: metrics and tracing.
//!
//! - **Metrics**: Counters, gauges, and histograms via `metrics-rs`
//! - **Tracing**: Structured logging and spans via `tracing`
//!
//! ## Metrics
//!
//! Every metric carries an `allocator` label with the allocator's name.
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `ringstage_bytes_staged` | Counter | Bytes copied through the ring |
//! | `ringstage_transfers` | Counter | Transfers submitted, labelled by `kind` |
//! | `ringstage_stalls` | Counter | Reservations that waited on a fence |
//! | `ringstage_wraps` | Counter | Reservations that wrapped to offset 0 |
//! | `ringstage_pinned_bytes` | Gauge | Ring bytes pinned by unretired fences |
//! | `ringstage_pending_transfers` | Gauge | Transfers awaiting retirement |
//! | `ringstage_stall_time_ns` | Histogram | Time spent waiting for ring space |
//!
//! ## Tracing
//!
//! Each `stage_*` call runs inside a `staged_transfer` span.
//!
//! ## Example
//!
//! ```rust
//! use ringstage::observability::init_metrics;
//!
//! // Call once at startup; install a metrics exporter to collect values
//! init_metrics();
//! ```

mod metrics;
mod tracing_support;

pub use metrics::{StagingMetrics, StallTimer, init_metrics};
pub use tracing_support::{
    instrument_transfer, span_transfer, trace_stall, trace_submission_error, trace_submitted,
};
