//! Entry Record Format
//!
//! Every stored entity is one off-heap block with a fixed header followed by
//! the codec's payload bytes:
//!
//! ```text
//! offset  size  field
//! 0       4     payload length (u32)
//! 4       8     created at, unix millis (u64)
//! 12      4     ttl millis (u32, FOREVER = u32::MAX)
//! 16      n     payload
//! ```
//!
//! Integers are little-endian. The header can be inspected through the
//! memory manager without copying the payload, which is what expiry checks
//! and capacity accounting do.
//!
//! A record has no lock of its own. Reading or mutating one is only safe
//! while the owning segment's lock is held.

use crate::error::{Error, Result};
use crate::memory::{Handle, MemoryManager};
use bytes::Bytes;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const OFFSET_PAYLOAD_LENGTH: usize = 0;
pub const OFFSET_CREATED_AT: usize = 4;
pub const OFFSET_TTL: usize = 12;
pub const OFFSET_PAYLOAD: usize = 16;

/// Size of the record header in bytes.
pub const HEADER_SIZE: usize = OFFSET_PAYLOAD;

/// TTL value meaning "never expires".
pub const FOREVER: u32 = u32::MAX;

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Converts a duration to a record TTL.
///
/// `None` maps to [`FOREVER`]. Durations that do not fit below the sentinel
/// are rejected rather than silently becoming permanent.
pub fn ttl_millis(ttl: Option<Duration>) -> Result<u32> {
    match ttl {
        None => Ok(FOREVER),
        Some(d) => u32::try_from(d.as_millis())
            .ok()
            .filter(|ms| *ms != FOREVER)
            .ok_or_else(|| Error::InvalidArgument(format!("ttl {d:?} is too large"))),
    }
}

/// Whether a record created at `created_at` with `ttl` is expired at `now`.
#[inline]
pub fn expired_at(created_at: u64, ttl: u32, now: u64) -> bool {
    if ttl == FOREVER {
        return false;
    }
    created_at
        .checked_add(u64::from(ttl))
        .map_or(false, |deadline| now >= deadline)
}

/// An entry envelope, either about to be written or read back from memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    payload: Bytes,
    created_at: u64,
    ttl: u32,
    handle: Handle,
}

impl EntryRecord {
    /// Creates a transient record that has not been written off-heap yet.
    pub fn for_write(payload: Bytes, ttl: u32) -> Self {
        Self {
            payload,
            created_at: now_millis(),
            ttl,
            handle: Handle::NULL,
        }
    }

    /// Reads an existing record back from the memory manager.
    pub fn for_read(mem: &dyn MemoryManager, handle: Handle) -> Result<Self> {
        let len = mem.read_u32(handle, OFFSET_PAYLOAD_LENGTH)? as usize;
        let created_at = mem.read_u64(handle, OFFSET_CREATED_AT)?;
        let ttl = mem.read_u32(handle, OFFSET_TTL)?;

        let mut payload = vec![0u8; len];
        mem.read_bytes(handle, OFFSET_PAYLOAD, &mut payload)?;

        Ok(Self {
            payload: Bytes::from(payload),
            created_at,
            ttl,
            handle,
        })
    }

    /// Writes the record into a fresh allocation and returns its handle.
    pub fn dump(&mut self, mem: &dyn MemoryManager) -> Result<Handle> {
        let handle = mem.allocate(self.bytes_occupied())?;
        if let Err(e) = self.flush(mem, handle) {
            let _ = mem.release(handle);
            return Err(e);
        }
        self.handle = handle;
        Ok(handle)
    }

    /// Rewrites the record over an existing allocation.
    ///
    /// The allocation is resized first, which may move it. The returned
    /// handle replaces `existing`; the old value must be discarded.
    pub fn dump_at(&mut self, mem: &dyn MemoryManager, existing: Handle) -> Result<Handle> {
        let handle = mem.reallocate(existing, self.bytes_occupied())?;
        self.flush(mem, handle)?;
        self.handle = handle;
        Ok(handle)
    }

    fn flush(&self, mem: &dyn MemoryManager, handle: Handle) -> Result<()> {
        let len = u32::try_from(self.payload.len()).map_err(|_| {
            Error::InvalidArgument(format!("payload of {} bytes", self.payload.len()))
        })?;
        mem.write_u32(handle, OFFSET_PAYLOAD_LENGTH, len)?;
        mem.write_u64(handle, OFFSET_CREATED_AT, self.created_at)?;
        mem.write_u32(handle, OFFSET_TTL, self.ttl)?;
        mem.write_bytes(handle, OFFSET_PAYLOAD, &self.payload)
    }

    /// Frees the record's allocation.
    pub fn release(self, mem: &dyn MemoryManager) -> Result<()> {
        if self.handle.is_null() {
            return Err(Error::InvalidHandle(self.handle));
        }
        mem.release(self.handle)
    }

    /// Header plus payload size.
    #[inline]
    pub fn bytes_occupied(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    /// Handle of the off-heap copy, or [`Handle::NULL`] before the first dump.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        expired_at(self.created_at, self.ttl, now)
    }

    /// Checks expiry from the header alone.
    pub fn is_expired(mem: &dyn MemoryManager, handle: Handle, now: u64) -> Result<bool> {
        let created_at = mem.read_u64(handle, OFFSET_CREATED_AT)?;
        let ttl = mem.read_u32(handle, OFFSET_TTL)?;
        Ok(expired_at(created_at, ttl, now))
    }

    /// Header plus payload size of a stored record.
    pub fn occupied_at(mem: &dyn MemoryManager, handle: Handle) -> Result<usize> {
        Ok(HEADER_SIZE + mem.read_u32(handle, OFFSET_PAYLOAD_LENGTH)? as usize)
    }

    /// Copies the payload of a stored record.
    pub fn read_payload(mem: &dyn MemoryManager, handle: Handle) -> Result<Bytes> {
        let len = mem.read_u32(handle, OFFSET_PAYLOAD_LENGTH)? as usize;
        let mut payload = vec![0u8; len];
        mem.read_bytes(handle, OFFSET_PAYLOAD, &mut payload)?;
        Ok(Bytes::from(payload))
    }
}
