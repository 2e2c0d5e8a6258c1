//! Staging allocator configuration.

use super::defaults;
use super::ring::check_geometry;
use crate::error::Result;

/// Creation-time settings of a [`StagingAllocator`](super::StagingAllocator).
///
/// Fixed for the allocator's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingConfig {
    /// Name used on log events and as a metric label (default: "staging").
    pub name: String,
    /// Ring capacity in bytes (default: 16 MiB).
    pub capacity: u32,
    /// Region alignment in bytes, a power of two (default: 16).
    ///
    /// Image transfers need an alignment that is a multiple of the format's
    /// block size (the texel size for uncompressed formats). With an
    /// alignment of 1 only 1-byte-texel images can be staged; others fail
    /// with `InvalidRequest`. Linear transfers accept any alignment.
    pub alignment: u32,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            name: defaults::DEFAULT_NAME.to_string(),
            capacity: defaults::DEFAULT_CAPACITY,
            alignment: defaults::DEFAULT_ALIGNMENT,
        }
    }
}

impl StagingConfig {
    /// Config with the given capacity and alignment.
    pub fn new(capacity: u32, alignment: u32) -> Self {
        Self {
            capacity,
            alignment,
            ..Self::default()
        }
    }

    /// Set the allocator name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the ring capacity.
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the region alignment.
    pub fn with_alignment(mut self, alignment: u32) -> Self {
        self.alignment = alignment;
        self
    }

    /// Check the settings.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`](crate::error::Error::InvalidConfig) if the
    /// capacity is 0, the alignment is not a power of two, or the capacity
    /// is not a multiple of the alignment.
    pub fn validate(&self) -> Result<()> {
        check_geometry(self.capacity, self.alignment)
    }
}
