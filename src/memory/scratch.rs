//! Host-visible scratch memory backing the staging ring.

use crate::error::{Error, Result};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Host-visible memory the device can also read and write.
///
/// The staging allocator owns the ring built on top of this memory. Copy
/// commands carry a clone of the handle so a backend can reach the bytes when
/// it executes a transfer, the way a device reads a mapped staging buffer.
/// Callers of the `stage*` operations never see it.
///
/// # Example
///
/// ```rust
/// use ringstage::memory::ScratchMemory;
///
/// let scratch = ScratchMemory::new(1024).unwrap();
/// assert_eq!(scratch.len(), 1024);
/// ```
#[derive(Clone)]
pub struct ScratchMemory {
    /// Contiguous allocation that is never reallocated.
    data: Arc<Mutex<Box<[u8]>>>,
    len: u32,
}

impl ScratchMemory {
    /// Allocate zero-initialised scratch memory.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is 0.
    pub fn new(size: u32) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidConfig(
                "scratch size must be greater than 0".into(),
            ));
        }

        let data = vec![0u8; size as usize].into_boxed_slice();

        Ok(Self {
            data: Arc::new(Mutex::new(data)),
            len: size,
        })
    }

    /// Size in bytes.
    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Always false; zero-sized scratch cannot be created.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether two handles refer to the same allocation.
    pub fn same_memory(&self, other: &ScratchMemory) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_span(&self, offset: u32, len: usize) -> Result<()> {
        let end = offset as u64 + len as u64;
        if end > self.len as u64 {
            return Err(Error::InvalidRequest(format!(
                "scratch span [{}, {}) exceeds scratch size {}",
                offset, end, self.len
            )));
        }
        Ok(())
    }

    /// Copy `data` into the scratch memory at `offset`.
    pub fn write(&self, offset: u32, data: &[u8]) -> Result<()> {
        self.check_span(offset, data.len())?;
        let start = offset as usize;
        self.lock()[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copy bytes at `offset` into `out`.
    pub fn read(&self, offset: u32, out: &mut [u8]) -> Result<()> {
        self.check_span(offset, out.len())?;
        let start = offset as usize;
        out.copy_from_slice(&self.lock()[start..start + out.len()]);
        Ok(())
    }

    /// Run `f` over the `len` bytes starting at `offset`.
    ///
    /// Used for row re-packing, where many small writes land in one span.
    pub fn with_span_mut<R>(
        &self,
        offset: u32,
        len: u32,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        self.check_span(offset, len as usize)?;
        let start = offset as usize;
        let mut guard = self.lock();
        Ok(f(&mut guard[start..start + len as usize]))
    }

    /// Run `f` over the `len` bytes starting at `offset`, read-only.
    pub fn with_span<R>(&self, offset: u32, len: u32, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.check_span(offset, len as usize)?;
        let start = offset as usize;
        let guard = self.lock();
        Ok(f(&guard[start..start + len as usize]))
    }
}

impl fmt::Debug for ScratchMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchMemory").field("len", &self.len).finish()
    }
}
