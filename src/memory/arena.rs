//! Handle Arena
//!
//! [`ArenaMemory`] is the default [`MemoryManager`]. Blocks are plain byte
//! buffers kept in a sharded concurrent map keyed by handle, so segments on
//! different threads only contend when their handles hash to the same map
//! shard.
//!
//! Each block is allocated with some headroom (rounded up to a power of two)
//! so that small in-place updates can reuse the same handle. Growing past the
//! headroom moves the block to a fresh handle.

use super::{Handle, MemoryManager};
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::trace;

/// Smallest block capacity handed out, in bytes.
const MIN_BLOCK: usize = 16;

/// Thread-safe arena of off-heap blocks addressed by [`Handle`].
#[derive(Debug)]
pub struct ArenaMemory {
    /// Live blocks; the vector length is the usable size.
    blocks: DashMap<u64, Vec<u8>>,

    /// Next handle value. Starts at 1 so 0 stays the null sentinel.
    next_handle: AtomicU64,

    /// Sum of the usable sizes of all live blocks.
    allocated_bytes: AtomicUsize,

    /// Optional ceiling on `allocated_bytes`.
    limit: Option<usize>,

    /// Lifetime counters.
    allocations: AtomicU64,
    releases: AtomicU64,
}

impl Default for ArenaMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl ArenaMemory {
    /// Creates an unbounded arena.
    pub fn new() -> Self {
        Self {
            blocks: DashMap::new(),
            next_handle: AtomicU64::new(1),
            allocated_bytes: AtomicUsize::new(0),
            limit: None,
            allocations: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        }
    }

    /// Creates an arena that fails allocations once `limit` bytes are live.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new()
        }
    }

    /// Number of blocks currently allocated.
    pub fn live_allocations(&self) -> usize {
        self.blocks.len()
    }

    /// Bytes currently allocated, counting usable sizes only.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    /// Total allocations and releases performed so far.
    pub fn lifetime_counts(&self) -> (u64, u64) {
        (
            self.allocations.load(Ordering::Relaxed),
            self.releases.load(Ordering::Relaxed),
        )
    }

    /// Reserves `delta` bytes against the limit.
    fn reserve(&self, delta: usize) -> Result<()> {
        match self.limit {
            None => {
                self.allocated_bytes.fetch_add(delta, Ordering::Relaxed);
                Ok(())
            }
            Some(limit) => self
                .allocated_bytes
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    current.checked_add(delta).filter(|next| *next <= limit)
                })
                .map(|_| ())
                .map_err(|_| Error::OutOfMemory {
                    requested: delta,
                    limit,
                }),
        }
    }

    fn unreserve(&self, delta: usize) {
        self.allocated_bytes.fetch_sub(delta, Ordering::Relaxed);
    }

    fn new_block(size: usize) -> Vec<u8> {
        let mut block = Vec::with_capacity(size.max(MIN_BLOCK).next_power_of_two());
        block.resize(size, 0);
        block
    }

    fn check_bounds(handle: Handle, block: &[u8], offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= block.len() => Ok(()),
            _ => Err(Error::OutOfBounds {
                handle,
                offset,
                len,
                size: block.len(),
            }),
        }
    }
}

impl MemoryManager for ArenaMemory {
    fn allocate(&self, size: usize) -> Result<Handle> {
        self.reserve(size)?;

        let raw = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.blocks.insert(raw, Self::new_block(size));
        self.allocations.fetch_add(1, Ordering::Relaxed);

        trace!(handle = raw, size, "allocated block");
        Ok(Handle::from_raw(raw))
    }

    fn reallocate(&self, handle: Handle, new_size: usize) -> Result<Handle> {
        let old_size = self.size_of(handle)?;

        if new_size > old_size {
            self.reserve(new_size - old_size)?;
        }

        // Fits in the existing headroom: resize in place.
        {
            let mut block = self
                .blocks
                .get_mut(&handle.as_u64())
                .ok_or(Error::InvalidHandle(handle))?;
            if new_size <= block.capacity() {
                block.resize(new_size, 0);
                drop(block);
                if new_size < old_size {
                    self.unreserve(old_size - new_size);
                }
                return Ok(handle);
            }
        }

        // Otherwise move to a fresh handle.
        let (_, old) = self
            .blocks
            .remove(&handle.as_u64())
            .ok_or(Error::InvalidHandle(handle))?;
        let mut block = Self::new_block(new_size);
        let keep = old.len().min(new_size);
        block[..keep].copy_from_slice(&old[..keep]);

        let raw = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.blocks.insert(raw, block);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.releases.fetch_add(1, Ordering::Relaxed);

        trace!(old = %handle, new = raw, new_size, "moved block on reallocate");
        Ok(Handle::from_raw(raw))
    }

    fn release(&self, handle: Handle) -> Result<()> {
        let (_, block) = self
            .blocks
            .remove(&handle.as_u64())
            .ok_or(Error::InvalidHandle(handle))?;
        self.unreserve(block.len());
        self.releases.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn size_of(&self, handle: Handle) -> Result<usize> {
        self.blocks
            .get(&handle.as_u64())
            .map(|block| block.len())
            .ok_or(Error::InvalidHandle(handle))
    }

    fn read_bytes(&self, handle: Handle, offset: usize, dst: &mut [u8]) -> Result<()> {
        let block = self
            .blocks
            .get(&handle.as_u64())
            .ok_or(Error::InvalidHandle(handle))?;
        Self::check_bounds(handle, &block, offset, dst.len())?;
        dst.copy_from_slice(&block[offset..offset + dst.len()]);
        Ok(())
    }

    fn write_bytes(&self, handle: Handle, offset: usize, src: &[u8]) -> Result<()> {
        let mut block = self
            .blocks
            .get_mut(&handle.as_u64())
            .ok_or(Error::InvalidHandle(handle))?;
        Self::check_bounds(handle, &block, offset, src.len())?;
        block[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_allocate_never_returns_null() {
        let mem = ArenaMemory::new();
        let h = mem.allocate(0).unwrap();
        assert!(!h.is_null());
        assert_eq!(mem.size_of(h).unwrap(), 0);
    }

    #[test]
    fn test_typed_read_write() {
        let mem = ArenaMemory::new();
        let h = mem.allocate(16).unwrap();

        mem.write_u32(h, 0, 0xDEAD_BEEF).unwrap();
        mem.write_u64(h, 4, u64::MAX - 1).unwrap();
        mem.write_bytes(h, 12, &[1, 2, 3, 4]).unwrap();

        assert_eq!(mem.read_u32(h, 0).unwrap(), 0xDEAD_BEEF);
        assert_eq!(mem.read_u64(h, 4).unwrap(), u64::MAX - 1);
        let mut tail = [0u8; 4];
        mem.read_bytes(h, 12, &mut tail).unwrap();
        assert_eq!(tail, [1, 2, 3, 4]);
    }

    #[test]
    fn test_out_of_bounds_access() {
        let mem = ArenaMemory::new();
        let h = mem.allocate(8).unwrap();
        assert!(matches!(
            mem.write_u64(h, 4, 1),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(matches!(
            mem.read_u32(h, usize::MAX),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_release_then_use_is_invalid() {
        let mem = ArenaMemory::new();
        let h = mem.allocate(8).unwrap();
        mem.release(h).unwrap();

        assert_eq!(mem.release(h), Err(Error::InvalidHandle(h)));
        assert_eq!(mem.read_u32(h, 0), Err(Error::InvalidHandle(h)));
        assert_eq!(mem.live_allocations(), 0);
        assert_eq!(mem.allocated_bytes(), 0);
    }

    #[test]
    fn test_reallocate_in_place_and_moved() {
        let mem = ArenaMemory::new();
        let h = mem.allocate(20).unwrap();
        mem.write_bytes(h, 0, b"0123456789").unwrap();

        // 20 bytes was given 32 bytes of capacity.
        let same = mem.reallocate(h, 30).unwrap();
        assert_eq!(same, h);

        let moved = mem.reallocate(h, 100).unwrap();
        assert_ne!(moved, h);
        assert_eq!(mem.size_of(h), Err(Error::InvalidHandle(h)));

        let mut head = [0u8; 10];
        mem.read_bytes(moved, 0, &mut head).unwrap();
        assert_eq!(&head, b"0123456789");
        assert_eq!(mem.allocated_bytes(), 100);
        assert_eq!(mem.live_allocations(), 1);
    }

    #[test]
    fn test_limit_is_enforced() {
        let mem = ArenaMemory::with_limit(64);
        let a = mem.allocate(40).unwrap();
        assert!(matches!(
            mem.allocate(40),
            Err(Error::OutOfMemory { requested: 40, limit: 64 })
        ));
        assert!(mem.reallocate(a, 80).is_err());

        mem.release(a).unwrap();
        assert!(mem.allocate(64).is_ok());
    }

    #[test]
    fn test_concurrent_allocations() {
        let mem = Arc::new(ArenaMemory::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let mem = Arc::clone(&mem);
            handles.push(thread::spawn(move || {
                for i in 0..1000usize {
                    let h = mem.allocate(i % 64).unwrap();
                    if i % 2 == 0 {
                        mem.release(h).unwrap();
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(mem.live_allocations(), 8 * 500);
        let (allocs, releases) = mem.lifetime_counts();
        assert_eq!(allocs, 8000);
        assert_eq!(releases, 4000);
    }
}
