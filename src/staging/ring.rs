//! Circular region bookkeeping over a fixed-capacity scratch range.
//!
//! `RingAllocator` only tracks offsets; it never touches memory. Regions are
//! handed out front to back and reclaimed oldest first, wrapping to offset 0
//! once the end of the ring is reached.
//!
//! # Layout
//!
//! ```text
//!   not wrapped                         wrapped
//! ┌────┬───────────┬────────┐       ┌───────┬──────┬──────────┬───┐
//! │free│ live ...  │  free  │       │ live  │ free │ live ... │gap│
//! └────┴───────────┴────────┘       └───────┴──────┴──────────┴───┘
//!      ^tail       ^front                   ^front ^tail
//! ```
//!
//! `tail` is the start of the oldest live region. When `front == tail` with
//! live regions the ring is full. The gap left behind by a wrap is reclaimed
//! once the tail passes it.

use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::fmt;

/// A byte range `[offset, offset + size)` inside the scratch ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScratchRegion {
    /// Start offset.
    pub offset: u32,
    /// Aligned size in bytes.
    pub size: u32,
}

impl ScratchRegion {
    /// Create a region.
    pub const fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }

    /// One past the last byte.
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.size as u64
    }

    /// Whether two regions share at least one byte.
    pub fn overlaps(&self, other: &ScratchRegion) -> bool {
        self.size > 0
            && other.size > 0
            && (self.offset as u64) < other.end()
            && (other.offset as u64) < self.end()
    }
}

impl fmt::Display for ScratchRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.offset, self.end())
    }
}

#[derive(Debug)]
struct LiveRegion {
    region: ScratchRegion,
    /// Front offset before this region was carved, for rollback.
    front_before: u32,
    released: bool,
}

/// Region allocator for the staging ring.
#[derive(Debug)]
pub struct RingAllocator {
    capacity: u32,
    alignment: u32,
    front: u32,
    /// Live regions in allocation order.
    live: VecDeque<LiveRegion>,
    in_use: u64,
    wraps: u64,
}

impl RingAllocator {
    /// Create a ring of `capacity` bytes handing out `alignment`-aligned regions.
    ///
    /// # Errors
    ///
    /// Fails if `capacity` is 0, `alignment` is not a power of two, or
    /// `capacity` is not a multiple of `alignment`.
    pub fn new(capacity: u32, alignment: u32) -> Result<Self> {
        check_geometry(capacity, alignment)?;

        Ok(Self {
            capacity,
            alignment,
            front: 0,
            live: VecDeque::new(),
            in_use: 0,
            wraps: 0,
        })
    }

    /// Total ring size in bytes.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Region alignment in bytes.
    #[inline]
    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    /// Offset the next region will be carved from (before wrapping).
    #[inline]
    pub fn front_offset(&self) -> u32 {
        self.front
    }

    /// Bytes held by live regions.
    #[inline]
    pub fn in_use(&self) -> u64 {
        self.in_use
    }

    /// Number of times a reservation skipped to offset 0.
    #[inline]
    pub fn wraps(&self) -> u64 {
        self.wraps
    }

    /// Whether no region is live.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Live regions, oldest first.
    pub fn live_regions(&self) -> impl Iterator<Item = ScratchRegion> + '_ {
        self.live.iter().filter(|l| !l.released).map(|l| l.region)
    }

    /// Round `size` up to the ring alignment.
    #[inline]
    pub fn aligned_size(&self, size: u64) -> u64 {
        let mask = self.alignment as u64 - 1;
        (size + mask) & !mask
    }

    /// Fail with [`Error::OversizedTransfer`] if `size` can never fit.
    pub fn check_fits(&self, size: u64) -> Result<u64> {
        let aligned = self.aligned_size(size);
        if aligned > self.capacity as u64 {
            return Err(Error::OversizedTransfer {
                requested: aligned,
                capacity: self.capacity,
            });
        }
        Ok(aligned)
    }

    /// Carve an aligned region of at least `size` bytes.
    ///
    /// Returns `Ok(None)` when the free space ahead of the front is too
    /// small right now; the caller must reclaim regions and retry.
    ///
    /// # Errors
    ///
    /// [`Error::OversizedTransfer`] if the aligned size exceeds the capacity.
    /// State is left untouched in that case.
    pub fn try_reserve(&mut self, size: u64) -> Result<Option<ScratchRegion>> {
        let aligned = self.check_fits(size)?;
        if aligned == 0 {
            return Ok(Some(ScratchRegion::new(self.front, 0)));
        }
        let size = aligned as u32;
        let capacity = self.capacity as u64;
        let fits_at = |offset: u32, limit: u64| offset as u64 + size as u64 <= limit;

        let offset = match self.live.front() {
            None if fits_at(self.front, capacity) => self.front,
            None => 0,
            Some(oldest) => {
                let tail = oldest.region.offset;
                if self.front > tail {
                    if fits_at(self.front, capacity) {
                        self.front
                    } else if fits_at(0, tail as u64) {
                        0
                    } else {
                        return Ok(None);
                    }
                } else if self.front < tail && fits_at(self.front, tail as u64) {
                    self.front
                } else {
                    return Ok(None);
                }
            }
        };

        if offset != self.front {
            self.wraps += 1;
            tracing::debug!(
                front = self.front,
                size,
                "staging ring wrapped to offset 0"
            );
        }

        let region = ScratchRegion::new(offset, size);
        self.live.push_back(LiveRegion {
            region,
            front_before: self.front,
            released: false,
        });
        self.front = ((offset as u64 + size as u64) % capacity) as u32;
        self.in_use += size as u64;
        tracing::trace!(%region, front = self.front, "reserved staging region");
        Ok(Some(region))
    }

    /// Return a region to free space.
    ///
    /// Regions are reclaimed oldest first; a released region behind an older
    /// live one is held until the older one goes. Releasing the most recent
    /// region rolls the front back. Returns false for unknown regions.
    pub fn release(&mut self, region: ScratchRegion) -> bool {
        if region.size == 0 {
            return true;
        }
        let Some(entry) = self
            .live
            .iter_mut()
            .find(|l| !l.released && l.region == region)
        else {
            return false;
        };
        entry.released = true;
        self.in_use -= region.size as u64;

        while self.live.back().is_some_and(|l| l.released) {
            if let Some(newest) = self.live.pop_back() {
                self.front = newest.front_before;
            }
        }
        while self.live.front().is_some_and(|l| l.released) {
            self.live.pop_front();
        }
        if self.live.is_empty() {
            self.front = 0;
        }
        true
    }
}

/// Check a ring geometry: non-zero capacity, power-of-two alignment, and a
/// capacity that is a whole number of aligned units.
pub(crate) fn check_geometry(capacity: u32, alignment: u32) -> Result<()> {
    if capacity == 0 {
        return Err(Error::InvalidConfig("capacity must be > 0".into()));
    }
    if !alignment.is_power_of_two() {
        return Err(Error::InvalidConfig(format!(
            "alignment {} is not a power of two",
            alignment
        )));
    }
    if capacity % alignment != 0 {
        return Err(Error::InvalidConfig(format!(
            "capacity {} is not a multiple of alignment {}",
            capacity, alignment
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserve(ring: &mut RingAllocator, size: u64) -> ScratchRegion {
        ring.try_reserve(size).unwrap().unwrap()
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(RingAllocator::new(0, 16).is_err());
        assert!(RingAllocator::new(1024, 12).is_err());
        assert!(RingAllocator::new(1000, 16).is_err());
        assert!(RingAllocator::new(1024, 1).is_ok());
    }

    #[test]
    fn test_aligned_size() {
        let ring = RingAllocator::new(1024, 16).unwrap();
        assert_eq!(ring.aligned_size(0), 0);
        assert_eq!(ring.aligned_size(1), 16);
        assert_eq!(ring.aligned_size(16), 16);
        assert_eq!(ring.aligned_size(600), 608);
        // Idempotent
        assert_eq!(ring.aligned_size(ring.aligned_size(601)), 608);
    }

    #[test]
    fn test_sequential_reservations() {
        let mut ring = RingAllocator::new(1024, 16).unwrap();
        assert_eq!(reserve(&mut ring, 100), ScratchRegion::new(0, 112));
        assert_eq!(reserve(&mut ring, 16), ScratchRegion::new(112, 16));
        assert_eq!(ring.front_offset(), 128);
        assert_eq!(ring.in_use(), 128);
    }

    #[test]
    fn test_oversized_leaves_state_untouched() {
        let mut ring = RingAllocator::new(1024, 16).unwrap();
        reserve(&mut ring, 100);
        let err = ring.try_reserve(1025).unwrap_err();
        assert_eq!(
            err,
            Error::OversizedTransfer {
                requested: 1040,
                capacity: 1024
            }
        );
        assert_eq!(ring.front_offset(), 112);
        assert_eq!(ring.live_regions().count(), 1);
    }

    #[test]
    fn test_full_capacity_on_empty_ring() {
        let mut ring = RingAllocator::new(1024, 16).unwrap();
        assert_eq!(reserve(&mut ring, 1024), ScratchRegion::new(0, 1024));
        // Full: front wrapped onto the tail
        assert_eq!(ring.front_offset(), 0);
        assert!(ring.try_reserve(16).unwrap().is_none());

        assert!(ring.release(ScratchRegion::new(0, 1024)));
        assert!(ring.is_empty());
        assert_eq!(reserve(&mut ring, 16), ScratchRegion::new(0, 16));
    }

    #[test]
    fn test_insufficient_space_returns_none() {
        let mut ring = RingAllocator::new(1024, 16).unwrap();
        let first = reserve(&mut ring, 600);
        assert_eq!(first, ScratchRegion::new(0, 608));
        // 416 bytes ahead, nothing behind the tail
        assert!(ring.try_reserve(500).unwrap().is_none());

        ring.release(first);
        assert_eq!(reserve(&mut ring, 500), ScratchRegion::new(0, 512));
    }

    #[test]
    fn test_wrap_when_tail_has_moved() {
        let mut ring = RingAllocator::new(1024, 16).unwrap();
        let a = reserve(&mut ring, 400);
        let b = reserve(&mut ring, 400);
        assert_eq!(b, ScratchRegion::new(400, 400));
        ring.release(a);

        // 224 bytes ahead is too small; [0, 400) behind fits
        let c = reserve(&mut ring, 300);
        assert_eq!(c, ScratchRegion::new(0, 304));
        assert_eq!(ring.wraps(), 1);
        assert!(!c.overlaps(&b));

        // Only [304, 400) is free while b is live
        assert!(ring.try_reserve(112).unwrap().is_none());
        assert_eq!(reserve(&mut ring, 96), ScratchRegion::new(304, 96));

        // Releasing b reclaims the gap at the end of the ring
        ring.release(b);
        assert_eq!(reserve(&mut ring, 600), ScratchRegion::new(400, 608));
    }

    #[test]
    fn test_out_of_order_release_waits_for_tail() {
        let mut ring = RingAllocator::new(256, 16).unwrap();
        let a = reserve(&mut ring, 64);
        let b = reserve(&mut ring, 64);
        let c = reserve(&mut ring, 64);

        // b is released but a still pins the tail
        assert!(ring.release(b));
        assert_eq!(ring.live_regions().collect::<Vec<_>>(), vec![a, c]);
        assert_eq!(ring.in_use(), 128);

        ring.release(a);
        assert_eq!(ring.live_regions().collect::<Vec<_>>(), vec![c]);
    }

    #[test]
    fn test_releasing_newest_rolls_front_back() {
        let mut ring = RingAllocator::new(256, 16).unwrap();
        let a = reserve(&mut ring, 64);
        let b = reserve(&mut ring, 64);
        assert_eq!(ring.front_offset(), 128);

        ring.release(b);
        assert_eq!(ring.front_offset(), 64);
        assert_eq!(reserve(&mut ring, 16), ScratchRegion::new(64, 16));
        assert!(!ring.release(b));
        let _ = a;
    }

    #[test]
    fn test_wrap_rollback_restores_front() {
        let mut ring = RingAllocator::new(256, 16).unwrap();
        let a = reserve(&mut ring, 128);
        let b = reserve(&mut ring, 96);
        ring.release(a);

        // 32 bytes ahead, wrap to 0
        let c = reserve(&mut ring, 64);
        assert_eq!(c.offset, 0);
        ring.release(c);
        assert_eq!(ring.front_offset(), 224);
        let _ = b;
    }

    #[test]
    fn test_zero_size_reservation() {
        let mut ring = RingAllocator::new(256, 16).unwrap();
        let empty = reserve(&mut ring, 0);
        assert_eq!(empty.size, 0);
        assert!(ring.is_empty());
        assert!(ring.release(empty));
    }

    #[test]
    fn test_half_capacity_wraparound() {
        let mut ring = RingAllocator::new(1000, 1).unwrap();
        let mut previous: Option<ScratchRegion> = None;
        for _ in 0..6 {
            let region = match ring.try_reserve(500).unwrap() {
                Some(region) => region,
                None => {
                    let oldest = ring.live_regions().next().unwrap();
                    ring.release(oldest);
                    reserve(&mut ring, 500)
                }
            };
            assert!(region.end() <= 1000);
            if let Some(prev) = previous {
                assert!(!region.overlaps(&prev));
            }
            previous = Some(region);
        }
    }

    #[test]
    fn test_region_overlap() {
        let a = ScratchRegion::new(0, 16);
        assert!(a.overlaps(&ScratchRegion::new(15, 4)));
        assert!(!a.overlaps(&ScratchRegion::new(16, 4)));
        assert!(!a.overlaps(&ScratchRegion::new(4, 0)));
        assert_eq!(a.to_string(), "[0, 16)");
    }
}
