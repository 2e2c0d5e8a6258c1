//! In-process reference backend.
//!
//! [`HostDevice`] keeps "device" buffers and images in host memory and
//! executes [`CopyCommand`]s against them, honouring the same FIFO fence
//! contract a GPU transfer queue gives. It backs the test suite and is a
//! usable software fallback.
//!
//! Two execution modes are available:
//!
//! - [`HostDevice::manual`]: copies queue up and run only when the owner
//!   retires them (`complete_next`, `complete_all`) or when a fence is
//!   waited on. Deterministic, suited to tests that need to observe pinned
//!   regions.
//! - [`HostDevice::threaded`]: a worker thread drains a channel of commands
//!   and signals completion through a condition variable, so waiters block
//!   instead of spinning.

use super::{BufferHandle, CopyCommand, FenceId, ImageCopy, ImageHandle, TransferBackend};
use crate::error::{Error, Result};
use crate::format::{Extent3D, FormatProperties, TextureType};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

type Submission = (FenceId, CopyCommand);

/// Host-memory device executing staged copies.
///
/// Cloning yields another handle to the same device, so tests can keep one
/// handle for inspection while the allocator owns another.
///
/// # Example
///
/// ```rust
/// use ringstage::backend::HostDevice;
///
/// let device = HostDevice::manual();
/// let buffer = device.create_buffer(64);
/// assert_eq!(device.buffer_contents(buffer).unwrap().len(), 64);
/// ```
#[derive(Clone)]
pub struct HostDevice {
    shared: Arc<HostShared>,
    worker: Option<Arc<Worker>>,
}

struct HostShared {
    state: Mutex<HostState>,
    /// Signalled whenever the completed fence value advances.
    retired: Condvar,
}

impl HostShared {
    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Worker {
    sender: Option<kanal::Sender<Submission>>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop.
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct HostImage {
    format: FormatProperties,
    extent: Extent3D,
    mip_levels: u32,
    array_slices: u32,
    /// Tightly packed storage keyed by (mip, slice, plane).
    subresources: HashMap<(u32, u32, u32), Vec<u8>>,
}

impl HostImage {
    fn new(
        texture_type: TextureType,
        format: FormatProperties,
        extent: Extent3D,
        mip_levels: u32,
        layers: u32,
    ) -> Self {
        let extent = match texture_type {
            TextureType::ThreeD => extent,
            _ => Extent3D::new(extent.width, extent.height, 1),
        };
        let mip_levels = mip_levels.max(1);
        let array_slices = layers.max(1) * texture_type.faces_per_layer();

        let mut subresources = HashMap::new();
        for mip in 0..mip_levels {
            let level = extent.at_mip_level(mip);
            for slice in 0..array_slices {
                for plane in 0..format.plane_count() {
                    let size = format.bytes_per_plane(plane, level) as usize;
                    subresources.insert((mip, slice, plane), vec![0u8; size]);
                }
            }
        }

        Self {
            format,
            extent,
            mip_levels,
            array_slices,
            subresources,
        }
    }

    /// Validate a region and return the extent of its mip level.
    fn check_region(&self, copy: &ImageCopy) -> Result<Extent3D> {
        if copy.mip_level >= self.mip_levels {
            return Err(Error::InvalidRequest(format!(
                "mip level {} out of range ({} levels)",
                copy.mip_level, self.mip_levels
            )));
        }
        if copy.array_slice >= self.array_slices {
            return Err(Error::InvalidRequest(format!(
                "array slice {} out of range ({} slices)",
                copy.array_slice, self.array_slices
            )));
        }
        if copy.plane >= self.format.plane_count() {
            return Err(Error::InvalidRequest(format!(
                "plane {} out of range ({} planes)",
                copy.plane,
                self.format.plane_count()
            )));
        }

        let level = self.extent.at_mip_level(copy.mip_level);
        let fits = |offset: u32, len: u32, limit: u32| offset as u64 + len as u64 <= limit as u64;
        if !fits(copy.offset.x, copy.extent.width, level.width)
            || !fits(copy.offset.y, copy.extent.height, level.height)
            || !fits(copy.offset.z, copy.extent.depth, level.depth)
        {
            return Err(Error::InvalidRequest(format!(
                "region {:?}+{:?} outside mip {} extent {:?}",
                copy.offset, copy.extent, copy.mip_level, level
            )));
        }
        Ok(level)
    }
}

/// Visit every block row of `copy` as (scratch position relative to the
/// region start, position inside the subresource, bytes in the row).
fn for_each_row(
    format: &FormatProperties,
    copy: &ImageCopy,
    level: Extent3D,
    mut f: impl FnMut(usize, usize, usize) -> Result<()>,
) -> Result<()> {
    let plane = format.plane(copy.plane);
    let image_row_bytes = format.bytes_per_row(copy.plane, level.width) as usize;
    let image_rows = format.blocks_y(copy.plane, level.height) as usize;

    let block_x = (copy.offset.x / plane.subsample_x / format.block_width) as usize;
    let block_y = (copy.offset.y / plane.subsample_y / format.block_height) as usize;
    let block_z = (copy.offset.z / format.block_depth) as usize;

    let row_bytes = format.bytes_per_row(copy.plane, copy.extent.width) as usize;
    let rows = format.blocks_y(copy.plane, copy.extent.height) as usize;
    let slices = format.blocks_z(copy.extent.depth) as usize;
    let pitch = copy.row_pitch as usize;
    let rows_per_slice = copy.rows_per_slice as usize;

    for z in 0..slices {
        for row in 0..rows {
            let scratch_pos = (z * rows_per_slice + row) * pitch;
            let image_pos = ((block_z + z) * image_rows + block_y + row) * image_row_bytes
                + block_x * plane.bytes_per_block as usize;
            f(scratch_pos, image_pos, row_bytes)?;
        }
    }
    Ok(())
}

fn out_of_bounds(what: &str) -> Error {
    Error::InvalidRequest(format!("{} access out of bounds", what))
}

struct HostState {
    buffers: HashMap<BufferHandle, Vec<u8>>,
    images: HashMap<ImageHandle, HostImage>,
    next_handle: u64,
    last_issued: u64,
    last_completed: u64,
    /// Commands awaiting execution in manual mode.
    queued: VecDeque<Submission>,
    fail_next: Option<String>,
    lost: Option<String>,
    row_pitch_alignment: u32,
    copies_executed: u64,
}

impl HostState {
    fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            images: HashMap::new(),
            next_handle: 1,
            last_issued: 0,
            last_completed: 0,
            queued: VecDeque::new(),
            fail_next: None,
            lost: None,
            row_pitch_alignment: 1,
            copies_executed: 0,
        }
    }

    fn buffer_span(&self, handle: BufferHandle, offset: u64, len: u32) -> Result<()> {
        let buffer = self
            .buffers
            .get(&handle)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown buffer {:?}", handle)))?;
        if offset + len as u64 > buffer.len() as u64 {
            return Err(Error::InvalidRequest(format!(
                "buffer range [{}, {}) exceeds {:?} size {}",
                offset,
                offset + len as u64,
                handle,
                buffer.len()
            )));
        }
        Ok(())
    }

    fn image(&self, handle: ImageHandle) -> Result<&HostImage> {
        self.images
            .get(&handle)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown image {:?}", handle)))
    }

    /// Reject commands the device could never execute.
    fn validate(&self, command: &CopyCommand) -> Result<()> {
        match command {
            CopyCommand::BufferWrite {
                source,
                destination,
                offset,
            } => self.buffer_span(*destination, *offset, source.len),
            CopyCommand::BufferRead {
                source,
                offset,
                destination,
            } => self.buffer_span(*source, *offset, destination.len),
            CopyCommand::ImageWrite { image, regions, .. } => {
                let image = self.image(*image)?;
                for region in regions {
                    image.check_region(region)?;
                }
                Ok(())
            }
            CopyCommand::ImageRead { image, region, .. } => {
                self.image(*image)?.check_region(region).map(|_| ())
            }
        }
    }

    fn execute(&mut self, command: &CopyCommand) -> Result<()> {
        match command {
            CopyCommand::BufferWrite {
                source,
                destination,
                offset,
            } => {
                self.buffer_span(*destination, *offset, source.len)?;
                let buffer = self
                    .buffers
                    .get_mut(destination)
                    .ok_or_else(|| out_of_bounds("buffer"))?;
                let start = *offset as usize;
                source.memory.read(
                    source.offset,
                    &mut buffer[start..start + source.len as usize],
                )?;
            }
            CopyCommand::BufferRead {
                source,
                offset,
                destination,
            } => {
                self.buffer_span(*source, *offset, destination.len)?;
                let buffer = self.buffers.get(source).ok_or_else(|| out_of_bounds("buffer"))?;
                let start = *offset as usize;
                destination.memory.write(
                    destination.offset,
                    &buffer[start..start + destination.len as usize],
                )?;
            }
            CopyCommand::ImageWrite {
                scratch,
                image,
                format,
                regions,
            } => {
                let host_image = self
                    .images
                    .get_mut(image)
                    .ok_or_else(|| Error::InvalidRequest(format!("unknown image {:?}", image)))?;
                for region in regions {
                    let level = host_image.check_region(region)?;
                    let key = (region.mip_level, region.array_slice, region.plane);
                    let target = host_image
                        .subresources
                        .get_mut(&key)
                        .ok_or_else(|| out_of_bounds("image"))?;
                    let span_len = region.scratch_len(format) as u32;
                    scratch.with_span(region.scratch_offset, span_len, |bytes| {
                        for_each_row(format, region, level, |src, dst, len| {
                            let from = bytes
                                .get(src..src + len)
                                .ok_or_else(|| out_of_bounds("scratch"))?;
                            let to = target
                                .get_mut(dst..dst + len)
                                .ok_or_else(|| out_of_bounds("image"))?;
                            to.copy_from_slice(from);
                            Ok(())
                        })
                    })??;
                }
            }
            CopyCommand::ImageRead {
                image,
                scratch,
                format,
                region,
            } => {
                let host_image = self.image(*image)?;
                let level = host_image.check_region(region)?;
                let key = (region.mip_level, region.array_slice, region.plane);
                let source = host_image
                    .subresources
                    .get(&key)
                    .ok_or_else(|| out_of_bounds("image"))?;
                let span_len = region.scratch_len(format) as u32;
                scratch.with_span_mut(region.scratch_offset, span_len, |bytes| {
                    for_each_row(format, region, level, |dst, src, len| {
                        let from = source
                            .get(src..src + len)
                            .ok_or_else(|| out_of_bounds("image"))?;
                        let to = bytes
                            .get_mut(dst..dst + len)
                            .ok_or_else(|| out_of_bounds("scratch"))?;
                        to.copy_from_slice(from);
                        Ok(())
                    })
                })??;
            }
        }
        self.copies_executed += 1;
        Ok(())
    }

    /// Execute one queued command and advance the completed fence.
    fn retire_next(&mut self) -> Option<FenceId> {
        let (fence, command) = self.queued.pop_front()?;
        if let Err(e) = self.execute(&command) {
            tracing::error!(%fence, error = %e, "host device copy failed");
            self.lost = Some(e.to_string());
        }
        self.last_completed = fence.0;
        Some(fence)
    }
}

impl HostDevice {
    /// A device whose copies run only when retired or waited on.
    pub fn manual() -> Self {
        Self {
            shared: Arc::new(HostShared {
                state: Mutex::new(HostState::new()),
                retired: Condvar::new(),
            }),
            worker: None,
        }
    }

    /// A device executing copies on a worker thread.
    pub fn threaded() -> Self {
        Self::spawn(None)
    }

    /// A threaded device that sleeps `latency` before each copy.
    ///
    /// Makes producer stalls observable in tests and benches.
    pub fn threaded_with_latency(latency: Duration) -> Self {
        Self::spawn(Some(latency))
    }

    fn spawn(latency: Option<Duration>) -> Self {
        let shared = Arc::new(HostShared {
            state: Mutex::new(HostState::new()),
            retired: Condvar::new(),
        });
        let (sender, receiver) = kanal::unbounded::<Submission>();

        let worker_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("ringstage-host-device".into())
            .spawn(move || run_worker(worker_shared, receiver, latency))
            .ok();
        if thread.is_none() {
            tracing::warn!("failed to spawn host device worker; submissions will fail");
        }

        Self {
            shared,
            worker: Some(Arc::new(Worker {
                sender: thread.as_ref().map(|_| sender),
                thread,
            })),
        }
    }

    /// Require image row pitches to be multiples of `alignment`.
    pub fn with_row_pitch_alignment(self, alignment: u32) -> Self {
        self.shared.lock().row_pitch_alignment = alignment.max(1);
        self
    }

    fn next_handle(state: &mut HostState) -> u64 {
        let handle = state.next_handle;
        state.next_handle += 1;
        handle
    }

    /// Create a zero-filled device buffer.
    pub fn create_buffer(&self, size: u64) -> BufferHandle {
        let mut state = self.shared.lock();
        let handle = BufferHandle(Self::next_handle(&mut state));
        state.buffers.insert(handle, vec![0u8; size as usize]);
        handle
    }

    /// Create a device buffer holding `data`.
    pub fn create_buffer_with(&self, data: &[u8]) -> BufferHandle {
        let mut state = self.shared.lock();
        let handle = BufferHandle(Self::next_handle(&mut state));
        state.buffers.insert(handle, data.to_vec());
        handle
    }

    /// Snapshot of a buffer's contents.
    pub fn buffer_contents(&self, handle: BufferHandle) -> Option<Vec<u8>> {
        self.shared.lock().buffers.get(&handle).cloned()
    }

    /// Create a zero-filled device image.
    ///
    /// `extent.depth` is only honoured for [`TextureType::ThreeD`]; `layers`
    /// counts cube maps, not faces.
    pub fn create_image(
        &self,
        texture_type: TextureType,
        format: FormatProperties,
        extent: Extent3D,
        mip_levels: u32,
        layers: u32,
    ) -> ImageHandle {
        let mut state = self.shared.lock();
        let handle = ImageHandle(Self::next_handle(&mut state));
        state.images.insert(
            handle,
            HostImage::new(texture_type, format, extent, mip_levels, layers),
        );
        handle
    }

    /// Tightly packed contents of one image subresource plane.
    pub fn image_subresource(
        &self,
        handle: ImageHandle,
        mip_level: u32,
        array_slice: u32,
        plane: u32,
    ) -> Option<Vec<u8>> {
        let state = self.shared.lock();
        state
            .images
            .get(&handle)?
            .subresources
            .get(&(mip_level, array_slice, plane))
            .cloned()
    }

    /// Overwrite one image subresource plane with tightly packed `data`.
    pub fn set_image_subresource(
        &self,
        handle: ImageHandle,
        mip_level: u32,
        array_slice: u32,
        plane: u32,
        data: &[u8],
    ) -> Result<()> {
        let mut state = self.shared.lock();
        let target = state
            .images
            .get_mut(&handle)
            .and_then(|image| image.subresources.get_mut(&(mip_level, array_slice, plane)))
            .ok_or_else(|| {
                Error::InvalidRequest(format!(
                    "no subresource ({}, {}, {}) on {:?}",
                    mip_level, array_slice, plane, handle
                ))
            })?;
        if target.len() != data.len() {
            return Err(Error::InvalidRequest(format!(
                "subresource holds {} bytes, got {}",
                target.len(),
                data.len()
            )));
        }
        target.copy_from_slice(data);
        Ok(())
    }

    /// Make the next submission fail with `message`.
    pub fn fail_next_submission(&self, message: impl Into<String>) {
        self.shared.lock().fail_next = Some(message.into());
    }

    /// Mark the device lost; later submissions and waits fail.
    pub fn lose_device(&self, message: impl Into<String>) {
        self.shared.lock().lost = Some(message.into());
        self.shared.retired.notify_all();
    }

    /// Execute the oldest queued copy (manual mode).
    ///
    /// Returns the fence that retired, or `None` when nothing is queued or
    /// the device is threaded.
    pub fn complete_next(&self) -> Option<FenceId> {
        let fence = self.shared.lock().retire_next();
        if fence.is_some() {
            self.shared.retired.notify_all();
        }
        fence
    }

    /// Retire every fence up to and including `fence`.
    pub fn complete_through(&self, fence: FenceId) -> Result<()> {
        self.wait(fence)
    }

    /// Retire everything submitted so far.
    pub fn complete_all(&self) -> Result<()> {
        match self.last_issued() {
            Some(fence) => self.wait(fence),
            None => Ok(()),
        }
    }

    /// Number of submitted copies not yet retired.
    pub fn pending_count(&self) -> u64 {
        let state = self.shared.lock();
        state.last_issued - state.last_completed
    }

    /// Most recently issued fence.
    pub fn last_issued(&self) -> Option<FenceId> {
        let issued = self.shared.lock().last_issued;
        (issued > 0).then_some(FenceId(issued))
    }

    /// Most recently retired fence.
    pub fn last_completed(&self) -> Option<FenceId> {
        let completed = self.shared.lock().last_completed;
        (completed > 0).then_some(FenceId(completed))
    }

    /// Total copies executed.
    pub fn copies_executed(&self) -> u64 {
        self.shared.lock().copies_executed
    }
}

fn run_worker(
    shared: Arc<HostShared>,
    receiver: kanal::Receiver<Submission>,
    latency: Option<Duration>,
) {
    while let Ok((fence, command)) = receiver.recv() {
        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }
        let mut state = shared.lock();
        if let Err(e) = state.execute(&command) {
            tracing::error!(%fence, error = %e, "host device copy failed");
            state.lost = Some(e.to_string());
        }
        state.last_completed = fence.0;
        drop(state);
        shared.retired.notify_all();
    }
    tracing::trace!("host device worker stopped");
}

impl TransferBackend for HostDevice {
    fn issue_copy(&self, command: CopyCommand) -> Result<FenceId> {
        let mut state = self.shared.lock();
        if let Some(message) = state.fail_next.take() {
            return Err(Error::BackendSubmission(message));
        }
        if let Some(lost) = &state.lost {
            return Err(Error::BackendSubmission(format!("device lost: {}", lost)));
        }
        state.validate(&command)?;

        let fence = FenceId(state.last_issued + 1);
        match &self.worker {
            None => state.queued.push_back((fence, command)),
            Some(worker) => {
                let sender = worker.sender.as_ref().ok_or_else(|| {
                    Error::BackendSubmission("host device worker is not running".into())
                })?;
                sender.send((fence, command)).map_err(|e| {
                    Error::BackendSubmission(format!("host device worker stopped: {}", e))
                })?;
            }
        }
        state.last_issued = fence.0;
        tracing::trace!(%fence, "host device accepted copy");
        Ok(fence)
    }

    fn is_complete(&self, fence: FenceId) -> bool {
        fence.0 <= self.shared.lock().last_completed
    }

    fn wait(&self, fence: FenceId) -> Result<()> {
        let mut state = self.shared.lock();
        if fence.0 > state.last_issued {
            return Err(Error::InvalidRequest(format!("{} was never issued", fence)));
        }
        if state.last_completed >= fence.0 {
            return Ok(());
        }

        loop {
            if state.last_completed >= fence.0 {
                break;
            }
            if let Some(lost) = &state.lost {
                return Err(Error::BackendSubmission(format!("device lost: {}", lost)));
            }
            if self.worker.is_none() {
                // Manual mode: the waiter drives the device forward.
                if state.retire_next().is_none() {
                    return Err(Error::BackendSubmission(format!(
                        "{} cannot retire: queue drained",
                        fence
                    )));
                }
            } else {
                state = self
                    .shared
                    .retired
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }

        let failed = state.lost.clone();
        drop(state);
        self.shared.retired.notify_all();
        match failed {
            Some(lost) => Err(Error::BackendSubmission(format!("device lost: {}", lost))),
            None => Ok(()),
        }
    }

    fn row_pitch_alignment(&self) -> u32 {
        self.shared.lock().row_pitch_alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScratchSpan;
    use crate::format::{Offset3D, TextureFormat};
    use crate::memory::ScratchMemory;
    use smallvec::smallvec;

    fn upload(scratch: &ScratchMemory, offset: u32, len: u32, buffer: BufferHandle) -> CopyCommand {
        CopyCommand::BufferWrite {
            source: ScratchSpan {
                memory: scratch.clone(),
                offset,
                len,
            },
            destination: buffer,
            offset: 0,
        }
    }

    #[test]
    fn test_manual_copies_wait_for_retirement() {
        let device = HostDevice::manual();
        let scratch = ScratchMemory::new(64).unwrap();
        let buffer = device.create_buffer(4);
        scratch.write(0, &[1, 2, 3, 4]).unwrap();

        let fence = device.issue_copy(upload(&scratch, 0, 4, buffer)).unwrap();
        assert!(!device.is_complete(fence));
        assert_eq!(device.buffer_contents(buffer).unwrap(), vec![0, 0, 0, 0]);
        assert_eq!(device.pending_count(), 1);

        assert_eq!(device.complete_next(), Some(fence));
        assert!(device.is_complete(fence));
        assert_eq!(device.buffer_contents(buffer).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(device.complete_next(), None);
    }

    #[test]
    fn test_fences_increase_and_retire_in_order() {
        let device = HostDevice::manual();
        let scratch = ScratchMemory::new(64).unwrap();
        let buffer = device.create_buffer(16);

        let fences: Vec<_> = (0..4)
            .map(|_| device.issue_copy(upload(&scratch, 0, 16, buffer)).unwrap())
            .collect();
        assert!(fences.windows(2).all(|w| w[0] < w[1]));

        device.wait(fences[2]).unwrap();
        assert!(device.is_complete(fences[0]));
        assert!(device.is_complete(fences[1]));
        assert!(device.is_complete(fences[2]));
        assert!(!device.is_complete(fences[3]));
    }

    #[test]
    fn test_threaded_wait_blocks_until_done() {
        let device = HostDevice::threaded_with_latency(Duration::from_millis(5));
        let scratch = ScratchMemory::new(64).unwrap();
        let buffer = device.create_buffer(8);
        scratch.write(0, b"threaded").unwrap();

        let fence = device.issue_copy(upload(&scratch, 0, 8, buffer)).unwrap();
        device.wait(fence).unwrap();
        assert!(device.is_complete(fence));
        assert_eq!(device.buffer_contents(buffer).unwrap(), b"threaded".to_vec());
        assert_eq!(device.copies_executed(), 1);
    }

    #[test]
    fn test_validation_rejects_bad_commands() {
        let device = HostDevice::manual();
        let scratch = ScratchMemory::new(64).unwrap();
        let buffer = device.create_buffer(4);

        let err = device.issue_copy(upload(&scratch, 0, 8, buffer)).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let err = device
            .issue_copy(upload(&scratch, 0, 4, BufferHandle(999)))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(device.last_issued(), None);
    }

    #[test]
    fn test_injected_failure() {
        let device = HostDevice::manual();
        let scratch = ScratchMemory::new(64).unwrap();
        let buffer = device.create_buffer(4);

        device.fail_next_submission("out of command buffers");
        let err = device.issue_copy(upload(&scratch, 0, 4, buffer)).unwrap_err();
        assert_eq!(err, Error::BackendSubmission("out of command buffers".into()));

        // Only the next submission fails
        assert!(device.issue_copy(upload(&scratch, 0, 4, buffer)).is_ok());
    }

    #[test]
    fn test_lost_device_fails_waits() {
        let device = HostDevice::manual();
        let scratch = ScratchMemory::new(64).unwrap();
        let buffer = device.create_buffer(4);

        let fence = device.issue_copy(upload(&scratch, 0, 4, buffer)).unwrap();
        device.lose_device("gpu hang");
        assert!(device.wait(fence).unwrap_err().is_backend());
        assert!(device.issue_copy(upload(&scratch, 0, 4, buffer)).is_err());
    }

    #[test]
    fn test_wait_on_unissued_fence_fails() {
        let device = HostDevice::manual();
        assert!(device.wait(FenceId(3)).is_err());
    }

    #[test]
    fn test_image_write_and_read_rows() {
        let device = HostDevice::manual();
        let format = TextureFormat::R8Unorm.properties();
        let image = device.create_image(TextureType::TwoD, format, Extent3D::new(4, 4, 1), 1, 1);
        let scratch = ScratchMemory::new(64).unwrap();

        // 2x2 box at (1,1), rows padded to 8 bytes in scratch
        scratch.write(0, &[1, 2]).unwrap();
        scratch.write(8, &[3, 4]).unwrap();
        let region = ImageCopy {
            scratch_offset: 0,
            row_pitch: 8,
            rows_per_slice: 2,
            plane: 0,
            mip_level: 0,
            array_slice: 0,
            offset: Offset3D { x: 1, y: 1, z: 0 },
            extent: Extent3D::new(2, 2, 1),
        };
        let fence = device
            .issue_copy(CopyCommand::ImageWrite {
                scratch: scratch.clone(),
                image,
                format,
                regions: smallvec![region],
            })
            .unwrap();
        device.wait(fence).unwrap();

        let texels = device.image_subresource(image, 0, 0, 0).unwrap();
        assert_eq!(
            texels,
            vec![0, 0, 0, 0, 0, 1, 2, 0, 0, 3, 4, 0, 0, 0, 0, 0]
        );

        let readback = ImageCopy {
            scratch_offset: 32,
            ..region
        };
        let fence = device
            .issue_copy(CopyCommand::ImageRead {
                image,
                scratch: scratch.clone(),
                format,
                region: readback,
            })
            .unwrap();
        device.wait(fence).unwrap();

        let mut rows = [0u8; 10];
        scratch.read(32, &mut rows).unwrap();
        assert_eq!(&rows[0..2], &[1, 2]);
        assert_eq!(&rows[8..10], &[3, 4]);
    }

    #[test]
    fn test_image_region_out_of_bounds() {
        let device = HostDevice::manual();
        let format = TextureFormat::Rgba8Unorm.properties();
        let image = device.create_image(TextureType::TwoD, format, Extent3D::new(4, 4, 1), 1, 1);
        let scratch = ScratchMemory::new(256).unwrap();

        let region = ImageCopy {
            scratch_offset: 0,
            row_pitch: 16,
            rows_per_slice: 4,
            plane: 0,
            mip_level: 1,
            array_slice: 0,
            offset: Offset3D::default(),
            extent: Extent3D::new(4, 4, 1),
        };
        let err = device
            .issue_copy(CopyCommand::ImageWrite {
                scratch,
                image,
                format,
                regions: smallvec![region],
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_row_pitch_alignment_setting() {
        let device = HostDevice::manual().with_row_pitch_alignment(256);
        assert_eq!(device.row_pitch_alignment(), 256);
        assert_eq!(HostDevice::manual().row_pitch_alignment(), 1);
    }
}
