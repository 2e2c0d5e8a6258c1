//! Fence bookkeeping on top of a [`TransferSubmission`].

use crate::backend::{CopyCommand, FenceId, TransferSubmission};
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// Issues copies and answers completion queries.
///
/// Remembers the highest fence seen to retire so that repeated queries for
/// old fences never reach the backend, and rejects a backend that hands out
/// fences out of order.
#[derive(Debug)]
pub struct FenceTracker {
    submission: TransferSubmission,
    last_issued: AtomicU64,
    retired_through: AtomicU64,
}

impl FenceTracker {
    /// Track fences from `submission`.
    pub fn new(submission: TransferSubmission) -> Self {
        Self {
            submission,
            last_issued: AtomicU64::new(0),
            retired_through: AtomicU64::new(0),
        }
    }

    /// The underlying submission capability.
    pub fn submission(&self) -> &TransferSubmission {
        &self.submission
    }

    /// Submit `command` and return its fence.
    ///
    /// # Errors
    ///
    /// Propagates backend failures. A fence not strictly greater than the
    /// last one issued is reported as [`Error::FenceOutOfOrder`]; the backend
    /// has accepted that copy.
    pub fn issue(&self, command: CopyCommand) -> Result<FenceId> {
        let fence = self.submission.issue_copy(command)?;
        let previous = self.last_issued.fetch_max(fence.0, Ordering::AcqRel);
        if fence.0 <= previous {
            return Err(Error::FenceOutOfOrder {
                fence: fence.0,
                previous,
            });
        }
        Ok(fence)
    }

    /// Non-blocking completion query.
    pub fn is_complete(&self, fence: FenceId) -> bool {
        if fence.0 <= self.retired_through.load(Ordering::Acquire) {
            return true;
        }
        let done = self.submission.is_complete(fence);
        if done {
            self.mark_retired(fence);
        }
        done
    }

    /// Block until `fence` retires.
    pub fn wait_until_complete(&self, fence: FenceId) -> Result<()> {
        if fence.0 <= self.retired_through.load(Ordering::Acquire) {
            return Ok(());
        }
        self.submission.wait(fence)?;
        self.mark_retired(fence);
        Ok(())
    }

    /// Highest fence known to have retired.
    pub fn retired_through(&self) -> FenceId {
        FenceId(self.retired_through.load(Ordering::Acquire))
    }

    /// Highest fence issued so far.
    pub fn last_issued(&self) -> FenceId {
        FenceId(self.last_issued.load(Ordering::Acquire))
    }

    /// Row pitch alignment for image copies.
    pub fn row_pitch_alignment(&self) -> u32 {
        self.submission.row_pitch_alignment()
    }

    fn mark_retired(&self, fence: FenceId) {
        // Only meaningful for fences this tracker issued.
        let issued = self.last_issued.load(Ordering::Acquire);
        self.retired_through
            .fetch_max(fence.0.min(issued), Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferHandle, HostDevice, ScratchSpan};
    use crate::memory::ScratchMemory;

    fn command(scratch: &ScratchMemory, buffer: BufferHandle) -> CopyCommand {
        CopyCommand::BufferWrite {
            source: ScratchSpan {
                memory: scratch.clone(),
                offset: 0,
                len: 4,
            },
            destination: buffer,
            offset: 0,
        }
    }

    #[test]
    fn test_issue_and_wait() {
        let device = HostDevice::manual();
        let buffer = device.create_buffer(4);
        let scratch = ScratchMemory::new(16).unwrap();
        let tracker = FenceTracker::new(TransferSubmission::real(device.clone()));

        let first = tracker.issue(command(&scratch, buffer)).unwrap();
        let second = tracker.issue(command(&scratch, buffer)).unwrap();
        assert!(first < second);
        assert_eq!(tracker.last_issued(), second);
        assert!(!tracker.is_complete(first));

        tracker.wait_until_complete(first).unwrap();
        assert!(tracker.is_complete(first));
        assert_eq!(tracker.retired_through(), first);
        assert!(!tracker.is_complete(second));

        device.complete_all().unwrap();
        assert!(tracker.is_complete(second));
        assert_eq!(tracker.retired_through(), second);
    }

    #[test]
    fn test_asserting_submission_errors() {
        let scratch = ScratchMemory::new(16).unwrap();
        let tracker = FenceTracker::new(TransferSubmission::Asserting);
        let err = tracker.issue(command(&scratch, BufferHandle(1))).unwrap_err();
        assert!(err.is_backend());
        assert_eq!(tracker.last_issued(), FenceId(0));
    }
}
