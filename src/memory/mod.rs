//! Host-visible scratch memory.
//!
//! The staging ring lives in a single [`ScratchMemory`] allocation that both
//! the allocator (copy in, copy out) and the backend (device side of a copy)
//! reach through cloned handles.

mod scratch;

pub use scratch::ScratchMemory;
