//! Storage Engine Module
//!
//! This module provides the segmented off-heap hash set and everything it
//! needs around it: the record envelope, per-segment tables, expiry
//! notification and the optional background sweeper.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        SegmentedSet                          │
//! │  slots: [ - | Seg | - | - | Seg | - | Seg | ... ]            │
//! │              │               │         │                     │
//! │          ┌───┴────┐      ┌───┴────┐ ┌──┴─────┐               │
//! │          │ RwLock │      │ RwLock │ │ RwLock │               │
//! │          │ handles│      │ handles│ │ handles│               │
//! │          └───┬────┘      └───┬────┘ └──┬─────┘               │
//! └──────────────┼───────────────┼─────────┼─────────────────────┘
//!                ▼               ▼         ▼
//!        ┌──────────────────────────────────────────┐
//!        │ MemoryManager: [hdr|payload] [hdr|...]   │
//!        └──────────────────────────────────────────┘
//!                ▲
//!   lazy expiry ─┴─> ExpiryNotifier ──> Executor ──> ExpirationListener
//! ```
//!
//! ## Example
//!
//! ```
//! use segstore::codec::{Entity, EntityCodec, FieldKind, Schema, Template, TupleCodec, Value};
//! use segstore::config::StoreConfig;
//! use segstore::storage::{SegmentedSet, FOREVER};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let codec = Arc::new(TupleCodec::new(
//!     Schema::new("Session", "token", FieldKind::Str).field("user", FieldKind::Int),
//! ));
//! let set = SegmentedSet::new(Arc::clone(&codec), StoreConfig::default()).unwrap();
//!
//! let session = Entity::new(vec![Value::from("abc123"), Value::Int(7)]);
//! set.put_entity(&session, Some(Duration::from_secs(3600))).unwrap();
//!
//! // Raw bytes work too; the key is read from the payload.
//! let payload = codec
//!     .serialize(&Entity::new(vec![Value::from("def456"), Value::Int(7)]))
//!     .unwrap();
//! set.put(payload, FOREVER).unwrap();
//!
//! let for_user = set.fetch_by_example(&Template::any().with(1, 7i64)).unwrap();
//! assert_eq!(for_user.len(), 2);
//! ```

pub mod expiry;
pub mod record;
pub mod segment;
pub mod set;
pub mod sweeper;

// Re-export commonly used types
pub use expiry::{
    ExpirationListener, ExpiredEvent, ExpiredValue, ExpiryNotifier, Executor, InlineExecutor,
    QueueExecutor, Task,
};
pub use record::{EntryRecord, FOREVER, HEADER_SIZE};
pub use segment::Segment;
pub use set::{RehashKind, SegmentedSet, SetCounters, SetStats};
pub use sweeper::ExpirySweeper;
