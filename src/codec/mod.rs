//! Entity Codec Module
//!
//! The storage engine never materialises entities on its hot paths. It only
//! needs three things from the payload bytes of a record:
//!
//! 1. the primary key, to probe and compare slots
//! 2. a yes/no answer to "does this payload match a sparse template"
//! 3. full (de)serialization, only at the API boundary and for expiry events
//!
//! [`EntityCodec`] is that capability. A codec is built once per persistent
//! type and shared by every segment of the set that stores the type.

pub mod tuple;

pub use tuple::{Entity, FieldKind, Schema, Template, TupleCodec, Value};

use crate::error::Result;
use bytes::Bytes;
use std::fmt;
use std::hash::Hash;

/// Outcome of comparing a payload against a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// Every non-wildcard field of the template equals the payload's field.
    Matched,
    /// At least one non-wildcard field differs.
    Mismatched,
}

impl MatchResult {
    #[inline]
    pub fn is_match(self) -> bool {
        self == MatchResult::Matched
    }
}

/// Per-type binary codec operating directly on payload bytes.
///
/// Implementations receive payloads as shared slices, so they cannot move a
/// read cursor or otherwise mutate the caller's buffer.
pub trait EntityCodec: Send + Sync + 'static {
    /// Primary key recovered from payload bytes.
    type Key: Hash + Eq + Clone + fmt::Debug + Send + Sync;

    /// Materialised entity.
    type Entity: Clone + fmt::Debug + Send + 'static;

    /// Sparse example used for fetch-by-example. Unset fields are wildcards.
    type Template: fmt::Debug + Send + Sync;

    /// Name of the persistent type, reported with expiry events.
    fn type_name(&self) -> &str;

    /// Reads the primary key out of a payload.
    fn read_key(&self, payload: &[u8]) -> Result<Self::Key>;

    /// Primary key of a materialised entity.
    fn key_of(&self, entity: &Self::Entity) -> Result<Self::Key>;

    /// Compares a payload against a template without deserializing it.
    fn matches(&self, payload: &[u8], template: &Self::Template) -> Result<MatchResult>;

    fn serialize(&self, entity: &Self::Entity) -> Result<Bytes>;

    fn deserialize(&self, payload: &[u8]) -> Result<Self::Entity>;
}
