//! # segstore - A Segmented Off-Heap Hash Set
//!
//! segstore is the storage engine of a keyed entity store. Entities are kept
//! as serialized records in blocks handed out by a memory manager, and a
//! segmented open-addressing table maps each primary key to its block.
//!
//! ## Features
//!
//! - **Point operations**: `contains`, `get`, `put`, `remove` by primary key
//! - **Fetch-by-example**: scan for entries matching a sparse template,
//!   comparing payload bytes without deserializing them
//! - **TTL**: entries expire lazily when touched, or via a background sweeper,
//!   with at-most-once notification to an expiration listener
//! - **Sharded locking**: each segment has its own `RwLock`; reads run in
//!   parallel, writes to different segments never contend
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                             SegmentedSet                                │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ EntityCodec │───>│ find_segment│───>│  Segment    │ (RwLock)         │
//! │  │ (read_key)  │    │  (probing)  │    │ linear probe│                  │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘                  │
//! │                                               │ handles                 │
//! │                                               ▼                         │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐   │
//! │  │  Expiry     │<───│              MemoryManager                   │   │
//! │  │  Notifier   │    │  [len|created|ttl|payload] [len|created|...] │   │
//! │  └──────┬──────┘    └──────────────────────────────────────────────┘   │
//! │         ▼                                                               │
//! │  ┌─────────────────────────────────────────────────┐                    │
//! │  │ Executor ──> ExpirationListener                 │                    │
//! │  └─────────────────────────────────────────────────┘                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`memory`]: handles and the memory manager capability, plus an arena
//! - [`codec`]: the entity codec capability, plus a tagged tuple codec
//! - [`storage`]: records, segments, the segmented set, expiry
//! - [`config`]: sizing, limits, sweeper and notifier settings
//! - [`error`]: error types
//!
//! ## Design Highlights
//!
//! ### Handles, not pointers
//!
//! Segments store integer handles into the memory manager. Moving entries
//! during a resize or a deletion sweep only moves integers; payloads never
//! move and are never owned by the table.
//!
//! ### No tombstones
//!
//! Deleting from a linear-probing table re-homes the rest of the cluster, so
//! lookups never have to skip over dead slots.

pub mod codec;
pub mod config;
pub mod error;
pub mod memory;
pub mod storage;

// Re-export commonly used types for convenience
pub use codec::{EntityCodec, MatchResult};
pub use config::{NotifierConfig, StoreConfig, SweeperConfig};
pub use error::{Error, Result};
pub use memory::{ArenaMemory, Handle, MemoryManager};
pub use storage::{EntryRecord, ExpirySweeper, SegmentedSet, FOREVER};

/// Version of segstore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
