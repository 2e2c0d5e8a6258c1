//! Default staging ring sizes.
//!
//! # Usage
//!
//! ```rust
//! use ringstage::staging::{defaults, StagingConfig};
//!
//! let config = StagingConfig::default()
//!     .with_capacity(defaults::FRAME_1080P_CAPACITY);
//! assert!(config.validate().is_ok());
//! ```

// =============================================================================
// Capacities (bytes)
// =============================================================================

/// Default ring capacity (16 MiB).
pub const DEFAULT_CAPACITY: u32 = 16 * 1024 * 1024;

/// Ring large enough for one 1080p RGBA frame per transfer (8 MiB).
pub const FRAME_1080P_CAPACITY: u32 = 8 * 1024 * 1024;

/// Ring large enough for one 4K RGBA frame per transfer (32 MiB).
pub const FRAME_4K_CAPACITY: u32 = 32 * 1024 * 1024;

// =============================================================================
// Alignment
// =============================================================================

/// Default region alignment.
///
/// 16 bytes holds a whole BC7/BC3/ASTC block and every uncompressed texel
/// size up to RGBA32F.
pub const DEFAULT_ALIGNMENT: u32 = 16;

/// Default allocator name used in logs and metric labels.
pub const DEFAULT_NAME: &str = "staging";
