//! Tracing integration for staged transfers.

use crate::backend::{FenceId, TransferKind};
use std::time::Duration;
use tracing::{Level, Span, span};

/// Create a span for one staged transfer.
///
/// # Example
///
/// ```rust
/// use ringstage::backend::TransferKind;
/// use ringstage::observability::span_transfer;
///
/// let span = span_transfer("uploads", TransferKind::BufferWrite, 4096);
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_transfer(name: &str, kind: TransferKind, size: u64) -> Span {
    span!(
        Level::DEBUG,
        "staged_transfer",
        allocator = %name,
        kind = %kind,
        size = size
    )
}

/// Enter a transfer span and return the guard.
pub fn instrument_transfer(
    name: &str,
    kind: TransferKind,
    size: u64,
) -> tracing::span::EnteredSpan {
    span_transfer(name, kind, size).entered()
}

/// Log a submitted transfer.
#[inline]
pub fn trace_submitted(name: &str, kind: TransferKind, fence: FenceId, offset: u32, size: u32) {
    tracing::trace!(
        allocator = %name,
        kind = %kind,
        %fence,
        offset = offset,
        size = size,
        "transfer submitted"
    );
}

/// Log a producer stall.
#[inline]
pub fn trace_stall(name: &str, fence: FenceId, requested: u64, waited: Duration) {
    tracing::warn!(
        allocator = %name,
        %fence,
        requested = requested,
        waited_us = waited.as_micros() as u64,
        "staging ring full, producer stalled"
    );
}

/// Log a failed submission.
#[inline]
pub fn trace_submission_error(name: &str, kind: TransferKind, error: &dyn std::error::Error) {
    tracing::error!(
        allocator = %name,
        kind = %kind,
        error = %error,
        "transfer submission failed"
    );
}
