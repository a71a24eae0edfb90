//! Error Types
//!
//! All fallible operations in segstore return [`Result`]. The variants are
//! split by how a caller is expected to react:
//!
//! - [`Error::OutOfMemory`] is fatal. The memory manager never retries and
//!   callers should not either; off-heap state may be partially built.
//! - [`Error::CapacityExceeded`] is a rejection raised *before* any off-heap
//!   allocation happens. It carries the serialized payload for diagnostics.
//! - [`Error::InvalidHandle`], [`Error::InvalidArgument`] and
//!   [`Error::InvalidConfig`] signal misuse and are raised eagerly.
//! - [`Error::Codec`] reports bytes that do not decode against a schema.

use crate::memory::Handle;
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur inside the storage engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// The memory manager could not satisfy an allocation.
    #[error("off-heap allocation of {requested} bytes failed (limit {limit} bytes)")]
    OutOfMemory { requested: usize, limit: usize },

    /// A handle that is not live was passed to the memory manager.
    #[error("invalid off-heap handle: {0}")]
    InvalidHandle(Handle),

    /// A read or write fell outside the bounds of an allocation.
    #[error("access of {len} bytes at offset {offset} is outside allocation {handle} of {size} bytes")]
    OutOfBounds {
        handle: Handle,
        offset: usize,
        len: usize,
        size: usize,
    },

    /// The configured byte or item limit of the set would be exceeded.
    #[error("store limit exceeded ({reason}); rejected payload of {} bytes", .payload.len())]
    CapacityExceeded { reason: String, payload: Bytes },

    /// Payload bytes could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An argument passed to a public operation is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Returns true for errors after which the process should stop using the store.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::OutOfMemory { .. } | Error::OutOfBounds { .. })
    }
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_exceeded_carries_payload() {
        let err = Error::CapacityExceeded {
            reason: "max_items 1".to_string(),
            payload: Bytes::from_static(b"abc"),
        };
        assert!(err.to_string().contains("3 bytes"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_out_of_memory_is_fatal() {
        let err = Error::OutOfMemory {
            requested: 64,
            limit: 32,
        };
        assert!(err.is_fatal());
    }
}
