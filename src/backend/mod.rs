//! Transfer submission: the device-side contract the staging allocator drives.
//!
//! The staging allocator never talks to a device API directly. It records
//! copies as [`CopyCommand`]s and hands them to a [`TransferBackend`], which
//! executes them asynchronously and answers for completion through
//! monotonically increasing [`FenceId`]s.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  CopyCommand   ┌──────────────────┐
//! │ StagingAllocator │───────────────▶│ TransferBackend  │
//! │  (ring + fences) │◀───────────────│ (device queue)   │
//! └──────────────────┘    FenceId     └──────────────────┘
//! ```
//!
//! # Contract
//!
//! - `issue_copy` returns fences in strictly increasing order
//! - fences retire in the order they were issued (FIFO completion)
//! - `wait` blocks without spinning until the fence retires
//!
//! [`TransferSubmission`] selects between a real backend and the
//! [`TransferSubmission::Asserting`] stand-in at construction time.

mod host;

#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use host::HostDevice;

use crate::error::{Error, Result};
use crate::format::{Extent3D, FormatProperties, Offset3D};
use crate::memory::ScratchMemory;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Handles
// ============================================================================

/// Completion handle for one submitted copy.
///
/// Fence values increase with every submission; a higher value never retires
/// before a lower one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FenceId(pub u64);

impl FenceId {
    /// Raw fence value.
    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fence#{}", self.0)
    }
}

/// Opaque handle to a device-resident linear buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferHandle(pub u64);

/// Opaque handle to a device-resident image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageHandle(pub u64);

// ============================================================================
// Copy commands
// ============================================================================

/// A byte span inside the staging scratch memory.
#[derive(Clone, Debug)]
pub struct ScratchSpan {
    /// Scratch memory the span lives in.
    pub memory: ScratchMemory,
    /// Byte offset of the span.
    pub offset: u32,
    /// Length of the span in bytes.
    pub len: u32,
}

/// One buffer<->image copy region, addressed like `VkBufferImageCopy`.
///
/// `offset` and `extent` are in texels of the full-resolution image; backends
/// derive plane coordinates from the plane's subsampling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageCopy {
    /// Absolute byte offset of the first row inside scratch memory.
    pub scratch_offset: u32,
    /// Bytes between consecutive block rows inside scratch memory.
    pub row_pitch: u32,
    /// Block rows per depth slice inside scratch memory.
    pub rows_per_slice: u32,
    /// Plane index (0 for single-plane formats).
    pub plane: u32,
    /// Mip level.
    pub mip_level: u32,
    /// Array slice (cube faces count as slices).
    pub array_slice: u32,
    /// Texel offset inside the subresource.
    pub offset: Offset3D,
    /// Texel extent of the copied box.
    pub extent: Extent3D,
}

impl ImageCopy {
    /// Scratch bytes this region spans.
    pub fn scratch_len(&self, format: &FormatProperties) -> u64 {
        self.row_pitch as u64
            * self.rows_per_slice as u64
            * format.blocks_z(self.extent.depth) as u64
    }
}

/// Kind of a staged transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransferKind {
    /// Host to device linear buffer.
    BufferWrite,
    /// Device linear buffer to host.
    BufferRead,
    /// Host to device image.
    ImageWrite,
    /// Device image to host.
    ImageRead,
}

impl TransferKind {
    /// Stable name used for logging and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BufferWrite => "buffer_write",
            Self::BufferRead => "buffer_read",
            Self::ImageWrite => "image_write",
            Self::ImageRead => "image_read",
        }
    }

    /// Whether data flows from the device back to the host.
    #[inline]
    pub fn is_read(&self) -> bool {
        matches!(self, Self::BufferRead | Self::ImageRead)
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A copy between scratch memory and a device resource.
#[derive(Clone, Debug)]
pub enum CopyCommand {
    /// Scratch span to linear buffer.
    BufferWrite {
        /// Source bytes in scratch memory.
        source: ScratchSpan,
        /// Destination buffer.
        destination: BufferHandle,
        /// Byte offset inside the destination buffer.
        offset: u64,
    },
    /// Linear buffer to scratch span.
    BufferRead {
        /// Source buffer.
        source: BufferHandle,
        /// Byte offset inside the source buffer.
        offset: u64,
        /// Destination bytes in scratch memory.
        destination: ScratchSpan,
    },
    /// Scratch regions to image subresources.
    ImageWrite {
        /// Scratch memory holding the re-packed rows.
        scratch: ScratchMemory,
        /// Destination image.
        image: ImageHandle,
        /// Format of the image.
        format: FormatProperties,
        /// Per-subresource copies.
        regions: SmallVec<[ImageCopy; 4]>,
    },
    /// Image subresource to scratch region.
    ImageRead {
        /// Source image.
        image: ImageHandle,
        /// Scratch memory receiving the rows.
        scratch: ScratchMemory,
        /// Format of the image.
        format: FormatProperties,
        /// The copied region.
        region: ImageCopy,
    },
}

impl CopyCommand {
    /// Kind of transfer this command performs.
    pub fn kind(&self) -> TransferKind {
        match self {
            Self::BufferWrite { .. } => TransferKind::BufferWrite,
            Self::BufferRead { .. } => TransferKind::BufferRead,
            Self::ImageWrite { .. } => TransferKind::ImageWrite,
            Self::ImageRead { .. } => TransferKind::ImageRead,
        }
    }

    /// Scratch bytes the command reads or writes.
    pub fn scratch_bytes(&self) -> u64 {
        match self {
            Self::BufferWrite { source, .. } => source.len as u64,
            Self::BufferRead { destination, .. } => destination.len as u64,
            Self::ImageWrite {
                format, regions, ..
            } => regions.iter().map(|r| r.scratch_len(format)).sum(),
            Self::ImageRead { format, region, .. } => region.scratch_len(format),
        }
    }
}

// ============================================================================
// Backend trait
// ============================================================================

/// Device-side primitive that performs staged copies.
///
/// Implementations must issue fences in increasing order and retire them in
/// that same order.
pub trait TransferBackend: Send + Sync {
    /// Record and submit a copy. Returns the fence that retires it.
    fn issue_copy(&self, command: CopyCommand) -> Result<FenceId>;

    /// Non-blocking completion query.
    fn is_complete(&self, fence: FenceId) -> bool;

    /// Block until `fence` retires.
    ///
    /// Must yield the thread while waiting rather than spin.
    fn wait(&self, fence: FenceId) -> Result<()>;

    /// Row pitch alignment the device expects for image copies.
    ///
    /// A value above 1 selects the tiled re-packing path.
    fn row_pitch_alignment(&self) -> u32 {
        1
    }
}

/// The transfer capability an allocator is constructed with.
///
/// `Asserting` stands in where no device is attached: every submission fails
/// loudly with [`Error::BackendSubmission`], and with nothing ever issued every
/// fence reads as complete.
#[derive(Clone, Default)]
pub enum TransferSubmission {
    /// A live backend.
    Real(Arc<dyn TransferBackend>),
    /// Stand-in that rejects every submission.
    #[default]
    Asserting,
}

impl TransferSubmission {
    /// Wrap a backend.
    pub fn real(backend: impl TransferBackend + 'static) -> Self {
        Self::Real(Arc::new(backend))
    }

    /// Whether a live backend is attached.
    #[inline]
    pub fn is_real(&self) -> bool {
        matches!(self, Self::Real(_))
    }

    /// Submit a copy.
    pub fn issue_copy(&self, command: CopyCommand) -> Result<FenceId> {
        match self {
            Self::Real(backend) => backend.issue_copy(command),
            Self::Asserting => {
                tracing::error!(
                    kind = %command.kind(),
                    "copy issued without a transfer backend"
                );
                Err(Error::BackendSubmission(format!(
                    "no transfer backend attached ({} rejected)",
                    command.kind()
                )))
            }
        }
    }

    /// Non-blocking completion query.
    pub fn is_complete(&self, fence: FenceId) -> bool {
        match self {
            Self::Real(backend) => backend.is_complete(fence),
            Self::Asserting => true,
        }
    }

    /// Block until `fence` retires.
    pub fn wait(&self, fence: FenceId) -> Result<()> {
        match self {
            Self::Real(backend) => backend.wait(fence),
            Self::Asserting => Ok(()),
        }
    }

    /// Row pitch alignment for image copies.
    pub fn row_pitch_alignment(&self) -> u32 {
        match self {
            Self::Real(backend) => backend.row_pitch_alignment().max(1),
            Self::Asserting => 1,
        }
    }
}

impl fmt::Debug for TransferSubmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Real(_) => f.write_str("TransferSubmission::Real"),
            Self::Asserting => f.write_str("TransferSubmission::Asserting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_command(scratch: &ScratchMemory) -> CopyCommand {
        CopyCommand::BufferWrite {
            source: ScratchSpan {
                memory: scratch.clone(),
                offset: 0,
                len: 8,
            },
            destination: BufferHandle(1),
            offset: 0,
        }
    }

    #[test]
    fn test_asserting_rejects_submission() {
        let scratch = ScratchMemory::new(16).unwrap();
        let submission = TransferSubmission::Asserting;
        assert!(!submission.is_real());

        let err = submission.issue_copy(write_command(&scratch)).unwrap_err();
        assert!(err.is_backend());
        assert!(submission.is_complete(FenceId(42)));
        assert!(submission.wait(FenceId(42)).is_ok());
    }

    #[test]
    fn test_real_delegates() {
        let scratch = ScratchMemory::new(16).unwrap();
        let device = HostDevice::manual();
        let buffer = device.create_buffer(8);
        let submission = TransferSubmission::real(device.clone());
        assert!(submission.is_real());

        let command = CopyCommand::BufferWrite {
            source: ScratchSpan {
                memory: scratch.clone(),
                offset: 0,
                len: 8,
            },
            destination: buffer,
            offset: 0,
        };
        let fence = submission.issue_copy(command).unwrap();
        assert!(!submission.is_complete(fence));
        submission.wait(fence).unwrap();
        assert!(submission.is_complete(fence));
    }

    #[test]
    fn test_command_kind_and_size() {
        let scratch = ScratchMemory::new(16).unwrap();
        let command = write_command(&scratch);
        assert_eq!(command.kind(), TransferKind::BufferWrite);
        assert_eq!(command.scratch_bytes(), 8);
        assert!(!command.kind().is_read());
        assert!(TransferKind::ImageRead.is_read());
    }

    #[test]
    fn test_fence_ordering() {
        assert!(FenceId(1) < FenceId(2));
        assert_eq!(FenceId(7).to_string(), "fence#7");
    }
}
