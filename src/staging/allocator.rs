//! The staging transfer allocator.
//!
//! Moves bytes between host memory and device resources through one
//! fixed-size scratch ring, pinning each ring region until the fence of the
//! copy that uses it retires.
//!
//! # Example
//!
//! ```rust
//! use ringstage::backend::{HostDevice, TransferSubmission};
//! use ringstage::staging::{StagingAllocator, StagingConfig};
//!
//! let device = HostDevice::manual();
//! let buffer = device.create_buffer(256);
//!
//! let staging = StagingAllocator::new(
//!     StagingConfig::new(1024, 16),
//!     TransferSubmission::real(device.clone()),
//! )?;
//! staging.stage_linear_write(buffer, 0, &[7u8; 256])?;
//!
//! let mut out = [0u8; 256];
//! staging.stage_linear_read(buffer, 0, &mut out)?;
//! assert_eq!(out, [7u8; 256]);
//! # Ok::<(), ringstage::error::Error>(())
//! ```
//!
//! # Locking
//!
//! All ring bookkeeping sits behind one mutex held across reserve, copy-in,
//! submit and record. Blocking waits on fences happen with the mutex
//! released. A read keeps its region pinned while it waits; its pending
//! entry is owned by the reader and only the reader releases it.

use super::config::StagingConfig;
use super::fence::FenceTracker;
use super::image::{ImageLayoutClass, ImageReadPlan, ImageWritePlan};
use super::ring::{RingAllocator, ScratchRegion};
use crate::backend::{
    BufferHandle, CopyCommand, FenceId, ImageHandle, ScratchSpan, TransferKind,
    TransferSubmission,
};
use crate::error::{Error, Result};
use crate::format::{FormatProperties, Rect2D, TextureRange, TextureType};
use crate::memory::ScratchMemory;
use crate::observability::{
    StagingMetrics, StallTimer, instrument_transfer, trace_stall, trace_submission_error,
    trace_submitted,
};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Callback invoked with every error a `stage_*` operation returns.
pub type ErrorHook = Arc<dyn Fn(&Error) + Send + Sync>;

// ============================================================================
// Bookkeeping types
// ============================================================================

/// A ring region pinned by an in-flight copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingTransfer {
    /// Fence that retires the copy.
    pub fence: FenceId,
    /// Pinned ring region.
    pub region: ScratchRegion,
    /// Kind of the copy.
    pub kind: TransferKind,
}

impl PendingTransfer {
    /// Reads are released by the reader after copying out, never by a sweep.
    #[inline]
    fn reader_owned(&self) -> bool {
        self.kind.is_read()
    }
}

/// Statistics about ring usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagingStats {
    /// Ring capacity in bytes.
    pub capacity: u32,
    /// Region alignment in bytes.
    pub alignment: u32,
    /// Bytes pinned by in-flight copies.
    pub pinned_bytes: u64,
    /// Copies awaiting fence retirement.
    pub pending_transfers: usize,
    /// Copies submitted since creation.
    pub transfers_issued: u64,
    /// Caller bytes moved through the ring since creation.
    pub bytes_staged: u64,
    /// Reservations that waited on a fence.
    pub stalls: u64,
    /// Reservations that wrapped to offset 0.
    pub wraps: u64,
}

impl StagingStats {
    /// Fraction of the ring currently pinned.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.pinned_bytes as f64 / self.capacity as f64
    }
}

struct StagingState {
    ring: RingAllocator,
    /// In-flight copies keyed by fence; key order is issuance order.
    pending: BTreeMap<FenceId, PendingTransfer>,
    transfers_issued: u64,
    bytes_staged: u64,
    stalls: u64,
    wraps_reported: u64,
    /// Set once the backend breaks fence ordering; every later reservation
    /// fails with it.
    faulted: Option<Error>,
}

impl StagingState {
    /// Release every sweepable entry whose fence is accepted by `retired`,
    /// stopping at the first fence that is not.
    fn retire_while(&mut self, mut retired: impl FnMut(FenceId) -> bool) -> usize {
        let done: SmallVec<[FenceId; 8]> = self
            .pending
            .values()
            .take_while(|p| retired(p.fence))
            .filter(|p| !p.reader_owned())
            .map(|p| p.fence)
            .collect();
        for fence in &done {
            if let Some(pending) = self.pending.remove(fence) {
                self.ring.release(pending.region);
            }
        }
        done.len()
    }
}

// ============================================================================
// StagingAllocator
// ============================================================================

/// Bounded staging transfer allocator.
///
/// Every operation takes `&self`; the allocator can be shared between
/// producer threads behind an `Arc`.
pub struct StagingAllocator {
    config: StagingConfig,
    scratch: ScratchMemory,
    fences: FenceTracker,
    state: Mutex<StagingState>,
    /// Signalled when a reader releases its region.
    space_freed: Condvar,
    metrics: StagingMetrics,
    error_hook: Option<ErrorHook>,
}

impl StagingAllocator {
    /// Create an allocator with `config`, submitting copies through
    /// `submission`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] if `config` fails validation.
    pub fn new(config: StagingConfig, submission: TransferSubmission) -> Result<Self> {
        Self::with_hook(config, submission, None)
    }

    /// Start building an allocator.
    pub fn builder(submission: TransferSubmission) -> StagingAllocatorBuilder {
        StagingAllocatorBuilder {
            config: StagingConfig::default(),
            submission,
            error_hook: None,
        }
    }

    fn with_hook(
        config: StagingConfig,
        submission: TransferSubmission,
        error_hook: Option<ErrorHook>,
    ) -> Result<Self> {
        config.validate()?;
        let ring = RingAllocator::new(config.capacity, config.alignment)?;
        let scratch = ScratchMemory::new(config.capacity)?;

        tracing::debug!(
            allocator = %config.name,
            capacity = config.capacity,
            alignment = config.alignment,
            backend = ?submission,
            "staging allocator created"
        );

        Ok(Self {
            metrics: StagingMetrics::new(&config.name),
            scratch,
            fences: FenceTracker::new(submission),
            state: Mutex::new(StagingState {
                ring,
                pending: BTreeMap::new(),
                transfers_issued: 0,
                bytes_staged: 0,
                stalls: 0,
                wraps_reported: 0,
                faulted: None,
            }),
            space_freed: Condvar::new(),
            error_hook,
            config,
        })
    }

    /// The allocator's configuration.
    pub fn config(&self) -> &StagingConfig {
        &self.config
    }

    /// Allocator name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Ring capacity in bytes.
    pub fn capacity(&self) -> u32 {
        self.config.capacity
    }

    /// The fence tracker copies are issued through.
    pub fn fences(&self) -> &FenceTracker {
        &self.fences
    }

    // ------------------------------------------------------------------------
    // Linear transfers
    // ------------------------------------------------------------------------

    /// Copy `data` into `destination` at `offset`.
    ///
    /// Returns once the copy is submitted; the ring region stays pinned until
    /// its fence retires. Waits for ring space if the ring is full.
    ///
    /// # Errors
    ///
    /// - [`Error::OversizedTransfer`] if `data` exceeds the ring capacity
    /// - [`Error::BackendSubmission`] if the copy cannot be submitted; the
    ///   region is returned to free space
    /// - [`Error::FenceOutOfOrder`] if the backend breaks fence ordering; the
    ///   region stays pinned and later transfers fail with the same error
    pub fn stage_linear_write(
        &self,
        destination: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let size = data.len() as u64;
        let _span = instrument_transfer(&self.config.name, TransferKind::BufferWrite, size);
        let result = self.linear_write(destination, offset, data);
        self.report(result)
    }

    fn linear_write(&self, destination: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let (mut state, region) = self.reserve(self.lock(), data.len() as u64)?;
        if let Err(e) = self.scratch.write(region.offset, data) {
            state.ring.release(region);
            return Err(e);
        }
        let command = CopyCommand::BufferWrite {
            source: self.span(region.offset, data.len() as u32),
            destination,
            offset,
        };
        self.submit(&mut state, command, region, data.len() as u64)?;
        Ok(())
    }

    /// Read `out.len()` bytes from `source` at `offset` into `out`.
    ///
    /// Blocks until the copy completes.
    ///
    /// # Errors
    ///
    /// - [`Error::OversizedTransfer`] if `out` exceeds the ring capacity
    /// - [`Error::BackendSubmission`] if the copy fails to submit or complete
    pub fn stage_linear_read(
        &self,
        source: BufferHandle,
        offset: u64,
        out: &mut [u8],
    ) -> Result<()> {
        let size = out.len() as u64;
        let _span = instrument_transfer(&self.config.name, TransferKind::BufferRead, size);
        let result = self.linear_read(source, offset, out);
        self.report(result)
    }

    fn linear_read(&self, source: BufferHandle, offset: u64, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        let len = out.len() as u64;
        let (mut state, region) = self.reserve(self.lock(), len)?;
        let command = CopyCommand::BufferRead {
            source,
            offset,
            destination: self.span(region.offset, len as u32),
        };
        let fence = self.submit(&mut state, command, region, len)?;
        drop(state);

        self.finish_read(fence, region, || self.scratch.read(region.offset, out))
    }

    /// Upload `data` of any size, split into pieces that fit the ring.
    ///
    /// Pieces are half the ring so one can be filled while the previous one
    /// is in flight.
    pub fn upload_buffer(
        &self,
        destination: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let chunk = self.chunk_size();
        for (index, piece) in data.chunks(chunk).enumerate() {
            let piece_offset = offset + (index * chunk) as u64;
            self.stage_linear_write(destination, piece_offset, piece)?;
        }
        Ok(())
    }

    /// Download into `out` of any size, split into pieces that fit the ring.
    pub fn download_buffer(
        &self,
        source: BufferHandle,
        offset: u64,
        out: &mut [u8],
    ) -> Result<()> {
        let chunk = self.chunk_size();
        for (index, piece) in out.chunks_mut(chunk).enumerate() {
            let piece_offset = offset + (index * chunk) as u64;
            self.stage_linear_read(source, piece_offset, piece)?;
        }
        Ok(())
    }

    fn chunk_size(&self) -> usize {
        let capacity = self.config.capacity;
        let alignment = self.config.alignment;
        if capacity >= 2 * alignment {
            ((capacity / 2) & !(alignment - 1)) as usize
        } else {
            capacity as usize
        }
    }

    // ------------------------------------------------------------------------
    // Image transfers
    // ------------------------------------------------------------------------

    /// Write `data` into the `range` of `image`.
    ///
    /// `data` holds the range level by level, then slice by slice (cube
    /// faces count as slices), then plane by plane. `bytes_per_row` of 0
    /// means rows are tightly packed. Rows are re-packed to the pitch the
    /// device expects, so the reservation can exceed `data.len()`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] for too little data, a bad row pitch or a
    ///   box that does not start on a block boundary
    /// - [`Error::OversizedTransfer`] if the re-packed range exceeds the ring
    /// - [`Error::BackendSubmission`] if the copy cannot be submitted
    pub fn stage_image_write(
        &self,
        image: ImageHandle,
        texture_type: TextureType,
        range: &TextureRange,
        format: &FormatProperties,
        bytes_per_row: u32,
        data: &[u8],
    ) -> Result<()> {
        if let Err(e) = format.validate() {
            return self.report(Err(e));
        }
        let size = format.bytes_per_range(texture_type, range);
        let _span = instrument_transfer(&self.config.name, TransferKind::ImageWrite, size);
        let result = self.image_write(image, texture_type, range, format, bytes_per_row, data);
        self.report(result)
    }

    fn image_write(
        &self,
        image: ImageHandle,
        texture_type: TextureType,
        range: &TextureRange,
        format: &FormatProperties,
        bytes_per_row: u32,
        data: &[u8],
    ) -> Result<()> {
        let layout = self.layout_for(format);
        let plan = ImageWritePlan::new(
            texture_type,
            range,
            format,
            bytes_per_row,
            layout,
            self.config.alignment,
        )?;
        if plan.is_empty() {
            return Ok(());
        }
        if (data.len() as u64) < plan.source_size {
            return Err(Error::InvalidRequest(format!(
                "image write needs {} source bytes, got {}",
                plan.source_size,
                data.len()
            )));
        }

        let (mut state, region) = self.reserve(self.lock(), plan.scratch_size)?;
        let packed = self
            .scratch
            .with_span_mut(region.offset, plan.scratch_size as u32, |bytes| {
                plan.pack(data, bytes)
            })
            .and_then(|packed| packed);
        if let Err(e) = packed {
            state.ring.release(region);
            return Err(e);
        }

        let command = CopyCommand::ImageWrite {
            scratch: self.scratch.clone(),
            image,
            format: *format,
            regions: plan.image_copies(region.offset),
        };
        self.submit(&mut state, command, region, plan.source_size)?;
        Ok(())
    }

    /// Read `rect` of mip `level`, array slice `layer` of `image` into `out`.
    ///
    /// `bytes_per_row` of 0 means `out` is tightly packed. With
    /// `flip_vertical` the last image row lands first in `out`. Blocks until
    /// the copy completes.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] for multi-planar formats, flipping
    ///   block-compressed rows, a bad row pitch or a too-small `out`
    /// - [`Error::OversizedTransfer`] if the rows exceed the ring
    /// - [`Error::BackendSubmission`] if the copy fails to submit or complete
    #[allow(clippy::too_many_arguments)]
    pub fn stage_image_read(
        &self,
        image: ImageHandle,
        level: u32,
        layer: u32,
        rect: Rect2D,
        format: &FormatProperties,
        out: &mut [u8],
        bytes_per_row: u32,
        flip_vertical: bool,
    ) -> Result<()> {
        let size = out.len() as u64;
        let _span = instrument_transfer(&self.config.name, TransferKind::ImageRead, size);
        let layout = self.layout_for(format);
        let result = ImageReadPlan::new(
            level,
            layer,
            rect,
            format,
            bytes_per_row,
            flip_vertical,
            layout,
            self.config.alignment,
        )
        .and_then(|plan| self.image_read(image, format, &plan, out));
        self.report(result)
    }

    fn image_read(
        &self,
        image: ImageHandle,
        format: &FormatProperties,
        plan: &ImageReadPlan,
        out: &mut [u8],
    ) -> Result<()> {
        if plan.is_empty() {
            return Ok(());
        }
        if (out.len() as u64) < plan.destination_size {
            return Err(Error::InvalidRequest(format!(
                "image read needs {} destination bytes, got {}",
                plan.destination_size,
                out.len()
            )));
        }

        let scratch_size = plan.scratch_size();
        let (mut state, region) = self.reserve(self.lock(), scratch_size)?;
        let command = CopyCommand::ImageRead {
            image,
            scratch: self.scratch.clone(),
            format: *format,
            region: plan.copy.image_copy(region.offset),
        };
        let fence = self.submit(&mut state, command, region, plan.destination_size)?;
        drop(state);

        self.finish_read(fence, region, || {
            self.scratch
                .with_span(region.offset, scratch_size as u32, |bytes| {
                    plan.unpack(bytes, out)
                })
                .and_then(|unpacked| unpacked)
        })
    }

    fn layout_for(&self, format: &FormatProperties) -> ImageLayoutClass {
        ImageLayoutClass::select(format, self.fences.row_pitch_alignment())
    }

    // ------------------------------------------------------------------------
    // Reclamation
    // ------------------------------------------------------------------------

    /// Reclaim every region whose fence has retired, without blocking.
    ///
    /// Returns the number of transfers reclaimed.
    pub fn flush(&self) -> usize {
        let mut state = self.lock();
        let reclaimed = state.retire_while(|fence| self.fences.is_complete(fence));
        self.publish(&mut state);
        drop(state);
        if reclaimed > 0 {
            self.space_freed.notify_all();
            tracing::trace!(allocator = %self.config.name, reclaimed, "flushed staging ring");
        }
        reclaimed
    }

    /// Block until every submitted write has retired and reclaim the ring.
    ///
    /// Reads still waiting in other threads keep their regions.
    pub fn wait_idle(&self) -> Result<()> {
        let newest = self
            .lock()
            .pending
            .values()
            .rev()
            .find(|p| !p.reader_owned())
            .map(|p| p.fence);
        let Some(fence) = newest else {
            return Ok(());
        };

        self.fences.wait_until_complete(fence)?;
        let mut state = self.lock();
        state.retire_while(|f| f <= fence);
        self.publish(&mut state);
        drop(state);
        self.space_freed.notify_all();
        Ok(())
    }

    /// Current usage statistics.
    pub fn stats(&self) -> StagingStats {
        let state = self.lock();
        StagingStats {
            capacity: state.ring.capacity(),
            alignment: state.ring.alignment(),
            pinned_bytes: state.ring.in_use(),
            pending_transfers: state.pending.len(),
            transfers_issued: state.transfers_issued,
            bytes_staged: state.bytes_staged,
            stalls: state.stalls,
            wraps: state.ring.wraps(),
        }
    }

    /// In-flight copies, oldest first.
    pub fn pending_regions(&self) -> Vec<PendingTransfer> {
        self.lock().pending.values().copied().collect()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, StagingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn span(&self, offset: u32, len: u32) -> ScratchSpan {
        ScratchSpan {
            memory: self.scratch.clone(),
            offset,
            len,
        }
    }

    /// Reserve `size` bytes, waiting on the oldest in-flight copy until the
    /// region fits. The lock is released while waiting.
    fn reserve<'a>(
        &'a self,
        mut state: MutexGuard<'a, StagingState>,
        size: u64,
    ) -> Result<(MutexGuard<'a, StagingState>, ScratchRegion)> {
        let mut stall: Option<(StallTimer<'_>, FenceId)> = None;
        loop {
            if let Some(fault) = &state.faulted {
                return Err(fault.clone());
            }
            if let Some(region) = state.ring.try_reserve(size)? {
                if let Some((timer, fence)) = &stall {
                    trace_stall(&self.config.name, *fence, size, timer.elapsed());
                }
                return Ok((state, region));
            }

            let Some(oldest) = state.pending.values().next().copied() else {
                return Err(Error::InvalidRequest(format!(
                    "{} bytes do not fit an idle staging ring",
                    size
                )));
            };
            if stall.is_none() {
                state.stalls += 1;
                tracing::debug!(
                    allocator = %self.config.name,
                    requested = size,
                    oldest = %oldest.fence,
                    "staging ring full, waiting for oldest transfer"
                );
            }
            let timer = match stall.take() {
                Some((timer, _)) => timer,
                None => self.metrics.start_stall(),
            };
            stall = Some((timer, oldest.fence));

            if oldest.reader_owned() {
                // The reader releases its region after copying out.
                state = self
                    .space_freed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            }

            drop(state);
            self.fences.wait_until_complete(oldest.fence)?;
            state = self.lock();
            state.retire_while(|fence| fence <= oldest.fence);
        }
    }

    /// Submit `command` for `region` and pin the region under the new fence.
    fn submit(
        &self,
        state: &mut StagingState,
        command: CopyCommand,
        region: ScratchRegion,
        bytes: u64,
    ) -> Result<FenceId> {
        let kind = command.kind();
        let fence = match self.fences.issue(command) {
            Ok(fence) => fence,
            Err(e) => {
                if matches!(e, Error::FenceOutOfOrder { .. }) {
                    // The device owns the region with no fence to retire it.
                    state.faulted = Some(e.clone());
                } else {
                    state.ring.release(region);
                }
                trace_submission_error(&self.config.name, kind, &e);
                return Err(e);
            }
        };

        state.pending.insert(
            fence,
            PendingTransfer {
                fence,
                region,
                kind,
            },
        );
        state.transfers_issued += 1;
        state.bytes_staged += bytes;
        self.metrics.record_transfer(kind, bytes);
        self.publish(state);
        trace_submitted(&self.config.name, kind, fence, region.offset, region.size);
        Ok(fence)
    }

    /// Wait for a read's fence, copy out, then release its region.
    fn finish_read(
        &self,
        fence: FenceId,
        region: ScratchRegion,
        copy_out: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        let result = self
            .fences
            .wait_until_complete(fence)
            .and_then(|()| copy_out());

        let mut state = self.lock();
        state.pending.remove(&fence);
        state.ring.release(region);
        // Earlier writes retired with this fence.
        if result.is_ok() {
            state.retire_while(|f| f <= fence);
        }
        self.publish(&mut state);
        drop(state);
        self.space_freed.notify_all();
        result
    }

    fn publish(&self, state: &mut StagingState) {
        let wraps = state.ring.wraps();
        self.metrics.record_wraps(wraps - state.wraps_reported);
        state.wraps_reported = wraps;
        self.metrics
            .record_occupancy(state.ring.in_use(), state.pending.len());
    }

    fn report<T>(&self, result: Result<T>) -> Result<T> {
        if let (Err(e), Some(hook)) = (&result, &self.error_hook) {
            hook(e);
        }
        result
    }
}

impl Drop for StagingAllocator {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            tracing::warn!(
                allocator = %self.config.name,
                error = %e,
                "staging allocator dropped with unfinished transfers"
            );
        }
    }
}

impl fmt::Debug for StagingAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingAllocator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .field("backend", self.fences.submission())
            .finish()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`StagingAllocator`].
///
/// # Example
///
/// ```rust
/// use ringstage::backend::{HostDevice, TransferSubmission};
/// use ringstage::staging::StagingAllocator;
///
/// let staging = StagingAllocator::builder(TransferSubmission::real(HostDevice::manual()))
///     .name("uploads")
///     .capacity(64 * 1024)
///     .on_error(|e| eprintln!("staging error: {e}"))
///     .build()?;
/// assert_eq!(staging.name(), "uploads");
/// # Ok::<(), ringstage::error::Error>(())
/// ```
pub struct StagingAllocatorBuilder {
    config: StagingConfig,
    submission: TransferSubmission,
    error_hook: Option<ErrorHook>,
}

impl StagingAllocatorBuilder {
    /// Replace the whole configuration.
    pub fn config(mut self, config: StagingConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the allocator name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the ring capacity.
    pub fn capacity(mut self, capacity: u32) -> Self {
        self.config.capacity = capacity;
        self
    }

    /// Set the region alignment.
    pub fn alignment(mut self, alignment: u32) -> Self {
        self.config.alignment = alignment;
        self
    }

    /// Call `hook` with every error a `stage_*` operation returns.
    pub fn on_error(mut self, hook: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.error_hook = Some(Arc::new(hook));
        self
    }

    /// Create the allocator.
    pub fn build(self) -> Result<StagingAllocator> {
        StagingAllocator::with_hook(self.config, self.submission, self.error_hook)
    }
}
