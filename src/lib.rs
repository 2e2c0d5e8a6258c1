//! # ringstage
//!
//! A bounded staging transfer allocator for moving data between host memory
//! and device-resident buffers and images.
//!
//! Transfers are funneled through a fixed-size circular scratch ring. Each
//! ring region stays pinned until the fence of the copy that uses it retires,
//! so a region is never handed out while the device may still read it.
//!
//! ## Features
//!
//! - **Ring allocation**: aligned regions, wraparound, FIFO reclamation
//! - **Fence gating**: regions reclaimed by `flush` or by waiting on the
//!   oldest in-flight copy when the ring is full
//! - **Image transfers**: row re-packing for tiled devices, whole-block
//!   sizing for compressed formats, mip chains, cube faces, NV12/I420 planes
//! - **Pluggable backends**: any [`TransferBackend`](backend::TransferBackend);
//!   an in-process [`HostDevice`](backend::HostDevice) ships for tests
//!
//! ## Quick Start
//!
//! ```rust
//! use ringstage::prelude::*;
//!
//! let device = HostDevice::manual();
//! let buffer = device.create_buffer(4096);
//!
//! let staging = StagingAllocator::builder(TransferSubmission::real(device.clone()))
//!     .name("uploads")
//!     .capacity(64 * 1024)
//!     .build()?;
//!
//! staging.stage_linear_write(buffer, 0, &[0xAB; 4096])?;
//! staging.flush();
//! # Ok::<(), ringstage::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![forbid(unsafe_code)]

pub mod backend;
pub mod error;
pub mod format;
pub mod memory;
pub mod observability;
pub mod staging;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::backend::{
        BufferHandle, FenceId, HostDevice, ImageHandle, TransferBackend, TransferKind,
        TransferSubmission,
    };
    pub use crate::error::{Error, Result};
    pub use crate::format::{
        Extent3D, FormatProperties, Rect2D, TextureFormat, TextureRange, TextureType,
    };
    pub use crate::staging::{StagingAllocator, StagingConfig, StagingStats};
}

pub use error::{Error, Result};
