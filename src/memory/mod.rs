//! Off-Heap Memory Module
//!
//! Records are not stored as Rust values inside the hash table. Instead every
//! record lives in a block owned by a [`MemoryManager`] and the table only
//! holds an opaque [`Handle`] to it. This keeps the table itself a flat array
//! of integers, makes resizing cheap (only handles move), and lets the
//! allocator be swapped for a native or file-backed one without touching the
//! table code.
//!
//! ## Handles
//!
//! A handle is an integer key into the manager. `0` is reserved as the
//! empty-slot sentinel ([`Handle::NULL`]) and is never returned by a
//! successful allocation.
//!
//! ## Byte order
//!
//! The typed accessors read and write little-endian integers.

pub mod arena;

pub use arena::ArenaMemory;

use crate::error::Result;
use std::fmt;

/// Opaque reference to an off-heap allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Handle(u64);

impl Handle {
    /// The empty-slot sentinel.
    pub const NULL: Handle = Handle(0);

    /// Wraps a raw handle value.
    pub const fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    /// Returns the raw handle value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true for the empty-slot sentinel.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The memory manager capability used by entry records and segments.
///
/// Implementations must be safe to call concurrently from many segments.
/// Allocation failure is reported as [`crate::Error::OutOfMemory`] and is
/// never retried by callers.
pub trait MemoryManager: Send + Sync + fmt::Debug {
    /// Allocates a zeroed block of `size` bytes.
    fn allocate(&self, size: usize) -> Result<Handle>;

    /// Resizes a block, preserving its leading bytes.
    ///
    /// The returned handle may differ from `handle`; the old handle must not
    /// be used afterwards.
    fn reallocate(&self, handle: Handle, new_size: usize) -> Result<Handle>;

    /// Frees a block.
    fn release(&self, handle: Handle) -> Result<()>;

    /// Returns the usable size of a block.
    fn size_of(&self, handle: Handle) -> Result<usize>;

    /// Copies `dst.len()` bytes starting at `offset` out of the block.
    fn read_bytes(&self, handle: Handle, offset: usize, dst: &mut [u8]) -> Result<()>;

    /// Copies `src` into the block starting at `offset`.
    fn write_bytes(&self, handle: Handle, offset: usize, src: &[u8]) -> Result<()>;

    fn read_u32(&self, handle: Handle, offset: usize) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(handle, offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, handle: Handle, offset: usize) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(handle, offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u32(&self, handle: Handle, offset: usize, value: u32) -> Result<()> {
        self.write_bytes(handle, offset, &value.to_le_bytes())
    }

    fn write_u64(&self, handle: Handle, offset: usize, value: u64) -> Result<()> {
        self.write_bytes(handle, offset, &value.to_le_bytes())
    }
}
