//! Staged transfers through a bounded scratch ring.
//!
//! # Architecture
//!
//! ```text
//!            stage_linear_write / stage_image_write
//!                           │
//!                           ▼
//! ┌───────────────────────────────────────────────────┐
//! │ StagingAllocator                                  │
//! │   RingAllocator ──reserve──▶ ScratchRegion        │
//! │        ▲                          │ copy in       │
//! │        │ release                  ▼               │
//! │   pending: FenceId → region ◀── FenceTracker.issue│
//! └───────────────────────────────────────────────────┘
//!                           │ CopyCommand
//!                           ▼
//!                   TransferSubmission
//! ```
//!
//! A region moves `Free → Reserved → Pinned(fence) → Free`. It becomes free
//! again only once its fence is seen complete, either by [`StagingAllocator::flush`]
//! or by a producer that waits on the oldest fence for space.
//!
//! Fences retire in issue order, so waiting on the oldest pinned fence
//! always frees the region at the tail of the ring first.

mod allocator;
mod config;
pub mod defaults;
mod fence;
mod image;
mod ring;

pub use allocator::{
    ErrorHook, PendingTransfer, StagingAllocator, StagingAllocatorBuilder, StagingStats,
};
pub use config::StagingConfig;
pub use fence::FenceTracker;
pub use image::{ImageLayoutClass, ImageReadPlan, ImageWritePlan, PlannedCopy};
pub use ring::{RingAllocator, ScratchRegion};
