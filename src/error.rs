//! Error types for ringstage.

use thiserror::Error;

/// Result type alias using ringstage's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for staging operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A single transfer needs more scratch space than the whole ring holds.
    ///
    /// This is a configuration error: enlarge the ring or split the transfer.
    #[error("transfer of {requested} bytes exceeds staging ring capacity of {capacity} bytes")]
    OversizedTransfer {
        /// Aligned size the transfer needed.
        requested: u64,
        /// Total ring capacity.
        capacity: u32,
    },

    /// The transfer backend refused or failed to execute a copy.
    #[error("transfer submission failed: {0}")]
    BackendSubmission(String),

    /// The backend accepted a copy but returned a fence that does not follow
    /// the last one issued.
    ///
    /// The copy's scratch region stays pinned and the allocator refuses
    /// further transfers.
    #[error("backend issued fence#{fence} after fence#{previous}")]
    FenceOutOfOrder {
        /// Fence the backend returned.
        fence: u64,
        /// Highest fence issued before it.
        previous: u64,
    },

    /// Allocator configuration was rejected.
    #[error("invalid staging configuration: {0}")]
    InvalidConfig(String),

    /// Request arguments are inconsistent (short source, bad range, unknown handle).
    #[error("invalid transfer request: {0}")]
    InvalidRequest(String),
}

impl Error {
    /// Whether this error was raised by the backend rather than by validation.
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            Self::BackendSubmission(_) | Self::FenceOutOfOrder { .. }
        )
    }
}
