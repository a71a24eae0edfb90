//! Segmented Set
//!
//! The top-level storage structure: a fixed array of `max_segments` slots,
//! of which `min_segments` hold a [`Segment`]. Segments are placed once, at
//! construction, by probing forward from a randomly seeded hash of their
//! ordinal. A key is routed by probing forward (with wrap-around) from
//! `hash(key) % max_segments` to the first populated slot, so routing is a
//! pure function of the key and the placement.
//!
//! ```text
//!  slot:   0    1    2    3    4    5    6    7   ...  max-1
//!        [ -  | S0 | -  | -  | S1 | -  | S2 | -  | ... | -  ]
//!               ^              ^
//!   hash%max=2 -+--> probes 2,3,4: lands on S1
//! ```
//!
//! The set owns its segments, keeps an atomic item and byte count across
//! all of them, enforces the optional byte and item limits before any
//! off-heap allocation (segments reserve against the shared counters under
//! their write lock, so concurrent puts cannot overshoot), and watches the item count for crossings of the
//! rehash thresholds. Crossing a threshold only marks a rehash as due and
//! logs it; the segment count never changes after construction.
//!
//! Cross-segment operations (`match_bytes`, `evict_expired`, `destroy`)
//! visit segments one at a time and take no global lock, so their result is
//! not a linearizable snapshot.

use super::expiry::ExpiryNotifier;
use super::record::{ttl_millis, EntryRecord};
use super::segment::{hash_key, Segment};
use crate::codec::EntityCodec;
use crate::config::StoreConfig;
use crate::error::Result;
use crate::memory::{ArenaMemory, MemoryManager};
use bytes::Bytes;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const REHASH_NONE: u8 = 0;
const REHASH_GROW: u8 = 1;
const REHASH_SHRINK: u8 = 2;

/// Direction of a global rehash that has been detected as due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RehashKind {
    /// The item count reached the upper threshold.
    Grow,
    /// The item count fell to the lower threshold.
    Shrink,
}

/// Item, byte and expiry counters shared by a set and all its segments.
#[derive(Debug)]
pub struct SetCounters {
    items: AtomicUsize,
    bytes: AtomicUsize,
    expired: AtomicU64,
    /// `(upper, lower)` item thresholds, if rehash detection is enabled.
    thresholds: Option<(usize, usize)>,
    max_bytes: Option<usize>,
    max_items: Option<usize>,
    rehash: AtomicU8,
}

impl Default for SetCounters {
    fn default() -> Self {
        Self::new(None)
    }
}

impl SetCounters {
    pub fn new(thresholds: Option<(usize, usize)>) -> Self {
        Self {
            items: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            expired: AtomicU64::new(0),
            thresholds,
            max_bytes: None,
            max_items: None,
            rehash: AtomicU8::new(REHASH_NONE),
        }
    }

    /// Enforces byte and item limits on every reservation.
    pub fn with_limits(mut self, max_bytes: Option<usize>, max_items: Option<usize>) -> Self {
        self.max_bytes = max_bytes;
        self.max_items = max_items;
        self
    }

    pub fn items(&self) -> usize {
        self.items.load(Ordering::Acquire)
    }

    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    pub fn rehash_due(&self) -> Option<RehashKind> {
        match self.rehash.load(Ordering::Acquire) {
            REHASH_GROW => Some(RehashKind::Grow),
            REHASH_SHRINK => Some(RehashKind::Shrink),
            _ => None,
        }
    }

    /// Reserves room for a new entry, admitting it only if neither limit
    /// would be exceeded. Returns the item count including the new entry.
    pub(crate) fn reserve_insert(&self, bytes: usize) -> std::result::Result<usize, String> {
        let previous = match self.max_items {
            Some(max_items) => self
                .items
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < max_items).then_some(n + 1)
                })
                .map_err(|_| format!("max_items {max_items} reached"))?,
            None => self.items.fetch_add(1, Ordering::AcqRel),
        };
        if let Err(reason) = self.reserve_bytes(bytes) {
            self.items.fetch_sub(1, Ordering::AcqRel);
            return Err(reason);
        }
        Ok(previous + 1)
    }

    /// Reserves the size difference of an overwrite. Shrinking is always admitted.
    pub(crate) fn reserve_replace(
        &self,
        old_bytes: usize,
        new_bytes: usize,
    ) -> std::result::Result<(), String> {
        if new_bytes > old_bytes {
            self.reserve_bytes(new_bytes - old_bytes)
        } else {
            self.bytes.fetch_sub(old_bytes - new_bytes, Ordering::AcqRel);
            Ok(())
        }
    }

    fn reserve_bytes(&self, bytes: usize) -> std::result::Result<(), String> {
        match self.max_bytes {
            Some(max_bytes) => self
                .bytes
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                    used.checked_add(bytes).filter(|&total| total <= max_bytes)
                })
                .map(|_| ())
                .map_err(|used| format!("{used} + {bytes} bytes exceeds max_bytes {max_bytes}")),
            None => {
                self.bytes.fetch_add(bytes, Ordering::AcqRel);
                Ok(())
            }
        }
    }

    /// Undoes a [`Self::reserve_insert`] whose entry was never stored.
    pub(crate) fn cancel_insert(&self, bytes: usize) {
        self.bytes.fetch_sub(bytes, Ordering::AcqRel);
        self.items.fetch_sub(1, Ordering::AcqRel);
    }

    /// Undoes a [`Self::reserve_replace`] whose overwrite failed.
    pub(crate) fn cancel_replace(&self, old_bytes: usize, new_bytes: usize) {
        if new_bytes > old_bytes {
            self.bytes.fetch_sub(new_bytes - old_bytes, Ordering::AcqRel);
        } else {
            self.bytes.fetch_add(old_bytes - new_bytes, Ordering::AcqRel);
        }
    }

    /// Records that a reserved insert was stored, `items` being the count
    /// returned by its reservation.
    pub(crate) fn insert_committed(&self, items: usize) {
        if let Some((upper, _)) = self.thresholds {
            if items == upper {
                self.mark_rehash(REHASH_GROW, items);
            }
        }
    }

    pub(crate) fn entry_removed(&self, bytes: usize) {
        self.bytes.fetch_sub(bytes, Ordering::AcqRel);
        let items = self.items.fetch_sub(1, Ordering::AcqRel) - 1;
        if let Some((_, lower)) = self.thresholds {
            if items == lower {
                self.mark_rehash(REHASH_SHRINK, items);
            }
        }
    }

    pub(crate) fn entry_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    fn mark_rehash(&self, kind: u8, items: usize) {
        let previous = self.rehash.swap(kind, Ordering::AcqRel);
        if previous != kind {
            // TODO: redistribute keys into a resized segment array and publish it atomically.
            warn!(
                items,
                direction = if kind == REHASH_GROW { "grow" } else { "shrink" },
                "Global rehash is due but not performed"
            );
        }
    }
}

/// Point-in-time statistics of a set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetStats {
    pub items: usize,
    pub bytes: usize,
    pub segments: usize,
    pub gets: u64,
    pub puts: u64,
    pub removes: u64,
    pub expired: u64,
    pub rehash_due: Option<RehashKind>,
}

/// Concurrent segmented off-heap hash set of entries keyed by the codec's
/// primary key.
///
/// # Example
///
/// ```
/// use segstore::codec::{Entity, FieldKind, Schema, TupleCodec, Value};
/// use segstore::config::StoreConfig;
/// use segstore::storage::SegmentedSet;
/// use std::sync::Arc;
///
/// let codec = Arc::new(TupleCodec::new(
///     Schema::new("User", "id", FieldKind::Int).field("name", FieldKind::Str),
/// ));
/// let set = SegmentedSet::new(codec, StoreConfig::default()).unwrap();
///
/// let ariz = Entity::new(vec![Value::Int(1), Value::from("Ariz")]);
/// set.put_entity(&ariz, None).unwrap();
/// assert_eq!(set.get_entity(&Value::Int(1)).unwrap(), Some(ariz));
/// ```
pub struct SegmentedSet<C: EntityCodec> {
    slots: Vec<Option<Segment<C>>>,
    segment_count: usize,
    codec: Arc<C>,
    mem: Arc<dyn MemoryManager>,
    notifier: Arc<ExpiryNotifier<C>>,
    counters: Arc<SetCounters>,
    config: StoreConfig,

    get_count: AtomicU64,
    put_count: AtomicU64,
    remove_count: AtomicU64,
}

impl<C: EntityCodec> fmt::Debug for SegmentedSet<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentedSet")
            .field("type_name", &self.codec.type_name())
            .field("segments", &self.segment_count)
            .field("items", &self.counters.items())
            .field("bytes", &self.counters.bytes())
            .finish()
    }
}

impl<C: EntityCodec> SegmentedSet<C> {
    /// Creates a set over a private [`ArenaMemory`] with no expiry listener.
    pub fn new(codec: Arc<C>, config: StoreConfig) -> Result<Self> {
        let notifier = ExpiryNotifier::new(Arc::clone(&codec));
        Self::with_parts(codec, config, Arc::new(ArenaMemory::new()), notifier)
    }

    /// Creates a set over the given memory manager and notifier.
    pub fn with_parts(
        codec: Arc<C>,
        config: StoreConfig,
        mem: Arc<dyn MemoryManager>,
        notifier: ExpiryNotifier<C>,
    ) -> Result<Self> {
        config.validate()?;

        let counters = Arc::new(
            SetCounters::new(Some((config.upper_threshold(), config.lower_threshold())))
                .with_limits(config.max_bytes, config.max_items),
        );
        let notifier = Arc::new(notifier);

        let placement = RandomState::new();
        let mut slots: Vec<Option<Segment<C>>> = (0..config.max_segments).map(|_| None).collect();
        for ordinal in 0..config.min_segments {
            let mut slot = (placement.hash_one(ordinal) % config.max_segments as u64) as usize;
            while slots[slot].is_some() {
                slot = (slot + 1) % config.max_segments;
            }
            slots[slot] = Some(Segment::new(
                config.segment_capacity,
                Arc::clone(&mem),
                Arc::clone(&codec),
                Arc::clone(&notifier),
                Arc::clone(&counters),
            ));
        }

        info!(
            type_name = codec.type_name(),
            segments = config.min_segments,
            slots = config.max_segments,
            segment_capacity = config.segment_capacity,
            "Segmented set initialized"
        );

        Ok(Self {
            slots,
            segment_count: config.min_segments,
            codec,
            mem,
            notifier,
            counters,
            config,
            get_count: AtomicU64::new(0),
            put_count: AtomicU64::new(0),
            remove_count: AtomicU64::new(0),
        })
    }

    /// Routes a key to its segment.
    fn find_segment(&self, key: &C::Key) -> &Segment<C> {
        let max = self.slots.len();
        let start = (hash_key(key) % max as u64) as usize;
        for step in 0..max {
            if let Some(segment) = &self.slots[(start + step) % max] {
                return segment;
            }
        }
        unreachable!("no segment populated among {max} slots")
    }

    /// Index of the slot serving `key`; exposed for routing tests.
    #[cfg(test)]
    fn segment_slot(&self, key: &C::Key) -> usize {
        let target: *const Segment<C> = self.find_segment(key);
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| std::ptr::eq(s, target)))
            .unwrap_or(usize::MAX)
    }

    pub fn codec(&self) -> &Arc<C> {
        &self.codec
    }

    pub fn memory(&self) -> &Arc<dyn MemoryManager> {
        &self.mem
    }

    pub fn notifier(&self) -> &Arc<ExpiryNotifier<C>> {
        &self.notifier
    }

    /// Stores a serialized entity. The key is read from the payload.
    ///
    /// `ttl` is in milliseconds, [`super::FOREVER`] for no expiry. Returns
    /// the bytes occupied by a replaced entry, or 0 for a new key. A put
    /// that would take the set past `max_bytes` or `max_items` fails with
    /// [`crate::Error::CapacityExceeded`] before anything is allocated.
    pub fn put(&self, payload: Bytes, ttl: u32) -> Result<usize> {
        self.put_count.fetch_add(1, Ordering::Relaxed);

        let key = self.codec.read_key(&payload)?;
        let record = EntryRecord::for_write(payload, ttl);
        self.find_segment(&key).put(&key, record)
    }

    /// Serializes and stores an entity.
    pub fn put_entity(&self, entity: &C::Entity, ttl: Option<Duration>) -> Result<usize> {
        let ttl = ttl_millis(ttl)?;
        let payload = self.codec.serialize(entity)?;
        self.put(payload, ttl)
    }

    pub fn contains(&self, key: &C::Key) -> Result<bool> {
        self.find_segment(key).contains(key)
    }

    pub fn get_record(&self, key: &C::Key) -> Result<Option<EntryRecord>> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.find_segment(key).get_record(key)
    }

    pub fn get_bytes(&self, key: &C::Key) -> Result<Option<Bytes>> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.find_segment(key).get_bytes(key)
    }

    pub fn get_entity(&self, key: &C::Key) -> Result<Option<C::Entity>> {
        self.get_bytes(key)?
            .map(|payload| self.codec.deserialize(&payload))
            .transpose()
    }

    /// Removes `key`, returning the bytes freed (0 if absent).
    pub fn remove(&self, key: &C::Key) -> Result<usize> {
        self.remove_count.fetch_add(1, Ordering::Relaxed);
        self.find_segment(key).remove(key)
    }

    fn segments(&self) -> impl Iterator<Item = &Segment<C>> {
        self.slots.iter().flatten()
    }

    /// Payloads of every live entry matching `template`, across all segments.
    pub fn match_bytes(&self, template: &C::Template) -> Result<Vec<Bytes>> {
        let mut matched = Vec::new();
        for segment in self.segments() {
            matched.extend(segment.match_template(template)?);
        }
        Ok(matched)
    }

    /// Fetch-by-example: deserialized entities matching `template`.
    pub fn fetch_by_example(&self, template: &C::Template) -> Result<Vec<C::Entity>> {
        self.match_bytes(template)?
            .iter()
            .map(|payload| self.codec.deserialize(payload))
            .collect()
    }

    /// Evicts every expired entry in every segment.
    pub fn evict_expired(&self) -> Result<usize> {
        let mut evicted = 0;
        for segment in self.segments() {
            evicted += segment.evict_expired()?;
        }
        Ok(evicted)
    }

    /// Releases every entry in every segment.
    pub fn destroy(&self) -> Result<()> {
        let mut result = Ok(());
        for segment in self.segments() {
            if let Err(e) = segment.destroy() {
                result = Err(e);
            }
        }
        info!(type_name = self.codec.type_name(), "Segmented set destroyed");
        result
    }

    /// Number of entries, including expired entries not yet evicted.
    pub fn len(&self) -> usize {
        self.counters.items()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Header plus payload bytes of all entries.
    pub fn bytes_used(&self) -> usize {
        self.counters.bytes()
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    /// A global rehash detected as due, if any.
    pub fn rehash_due(&self) -> Option<RehashKind> {
        self.counters.rehash_due()
    }

    pub fn stats(&self) -> SetStats {
        SetStats {
            items: self.counters.items(),
            bytes: self.counters.bytes(),
            segments: self.segment_count,
            gets: self.get_count.load(Ordering::Relaxed),
            puts: self.put_count.load(Ordering::Relaxed),
            removes: self.remove_count.load(Ordering::Relaxed),
            expired: self.counters.expired(),
            rehash_due: self.counters.rehash_due(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Entity, FieldKind, Schema, Template, TupleCodec, Value};
    use crate::error::Error;
    use crate::storage::expiry::{ExpirationListener, ExpiredEvent, InlineExecutor};
    use crate::storage::record::{FOREVER, HEADER_SIZE};
    use std::collections::HashSet;
    use std::thread;

    fn codec() -> Arc<TupleCodec> {
        Arc::new(TupleCodec::new(
            Schema::new("Product", "sku", FieldKind::Str)
                .field("price", FieldKind::Int)
                .field("in_stock", FieldKind::Bool),
        ))
    }

    fn product(sku: &str, price: i64, in_stock: bool) -> Entity {
        Entity::new(vec![
            Value::from(sku),
            Value::Int(price),
            Value::Bool(in_stock),
        ])
    }

    fn new_set(config: StoreConfig) -> (SegmentedSet<TupleCodec>, Arc<ArenaMemory>) {
        let codec = codec();
        let mem = Arc::new(ArenaMemory::new());
        let notifier = ExpiryNotifier::new(Arc::clone(&codec));
        let set = SegmentedSet::with_parts(codec, config, mem.clone(), notifier).unwrap();
        (set, mem)
    }

    fn sku(s: &str) -> Value {
        Value::from(s)
    }

    #[test]
    fn test_segments_are_placed() {
        let (set, _) = new_set(StoreConfig {
            min_segments: 8,
            max_segments: 32,
            ..Default::default()
        });
        assert_eq!(set.segment_count(), 8);
        assert_eq!(set.slots.iter().filter(|s| s.is_some()).count(), 8);
    }

    #[test]
    fn test_every_slot_populated_when_min_equals_max() {
        let (set, _) = new_set(StoreConfig {
            min_segments: 4,
            max_segments: 4,
            ..Default::default()
        });
        assert!(set.slots.iter().all(Option::is_some));
    }

    #[test]
    fn test_routing_is_stable() {
        let (set, _) = new_set(StoreConfig::default());
        for i in 0..200 {
            let key = sku(&format!("k{i}"));
            assert_eq!(set.segment_slot(&key), set.segment_slot(&key));
            assert_ne!(set.segment_slot(&key), usize::MAX);
        }
    }

    #[test]
    fn test_put_get_remove_scenario() {
        let (set, mem) = new_set(StoreConfig::default());
        let payload = set.codec().serialize(&product("a", 1, true)).unwrap();

        assert_eq!(set.put(payload.clone(), FOREVER).unwrap(), 0);
        assert_eq!(set.get_bytes(&sku("a")).unwrap(), Some(payload.clone()));

        assert_eq!(set.remove(&sku("a")).unwrap(), payload.len() + HEADER_SIZE);
        assert_eq!(set.get_bytes(&sku("a")).unwrap(), None);
        assert!(!set.contains(&sku("a")).unwrap());
        assert_eq!(set.remove(&sku("a")).unwrap(), 0);
        assert!(set.is_empty());
        assert_eq!(set.bytes_used(), 0);
        assert_eq!(mem.live_allocations(), 0);
    }

    #[test]
    fn test_entity_api_and_overwrite() {
        let (set, _) = new_set(StoreConfig::default());
        set.put_entity(&product("p1", 100, true), None).unwrap();
        let replaced = set.put_entity(&product("p1", 120, false), None).unwrap();

        assert!(replaced > HEADER_SIZE);
        assert_eq!(set.len(), 1);
        assert_eq!(
            set.get_entity(&sku("p1")).unwrap(),
            Some(product("p1", 120, false))
        );
        let record = set.get_record(&sku("p1")).unwrap().unwrap();
        assert_eq!(record.ttl(), FOREVER);
        assert_eq!(set.bytes_used(), record.bytes_occupied());
    }

    #[test]
    fn test_fetch_by_example() {
        let (set, _) = new_set(StoreConfig::default());
        for i in 0..50 {
            set.put_entity(&product(&format!("p{i}"), i % 5, i % 2 == 0), None)
                .unwrap();
        }

        assert_eq!(set.fetch_by_example(&Template::any()).unwrap().len(), 50);

        let one = set.fetch_by_example(&Template::by_key("p7")).unwrap();
        assert_eq!(one, vec![product("p7", 2, false)]);

        let cheap_in_stock = set
            .fetch_by_example(&Template::any().with(1, 0i64).with(2, true))
            .unwrap();
        assert_eq!(cheap_in_stock.len(), 5);

        // Matching key but mismatched scalar.
        assert!(set
            .fetch_by_example(&Template::by_key("p7").with(1, 3i64))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_byte_limit_rejects_before_allocation() {
        let (set, mem) = new_set(StoreConfig {
            max_bytes: Some(100),
            ..Default::default()
        });
        set.put_entity(&product("a", 1, true), None).unwrap();
        let used = set.bytes_used();
        let allocations = mem.live_allocations();

        let big = Entity::new(vec![Value::from("b".repeat(200)), Value::Int(1), Value::Bool(true)]);
        match set.put_entity(&big, None) {
            Err(Error::CapacityExceeded { payload, .. }) => {
                assert_eq!(set.codec().deserialize(&payload).unwrap(), big);
            }
            other => panic!("expected CapacityExceeded, got {other:?}"),
        }
        assert_eq!(set.bytes_used(), used);
        assert_eq!(mem.live_allocations(), allocations);
    }

    fn note(id: &str, text: &str) -> Entity {
        Entity::new(vec![Value::from(id), Value::from(text)])
    }

    #[test]
    fn test_byte_limit_admits_shrinking_overwrite() {
        let codec = Arc::new(TupleCodec::new(
            Schema::new("Note", "id", FieldKind::Str).field("text", FieldKind::Str),
        ));
        let large = codec.serialize(&note("a", &"x".repeat(50))).unwrap();
        let small = codec.serialize(&note("a", "x")).unwrap();
        let limit = large.len() + HEADER_SIZE + 10;
        let set = SegmentedSet::new(
            Arc::clone(&codec),
            StoreConfig {
                max_bytes: Some(limit),
                ..Default::default()
            },
        )
        .unwrap();

        set.put(large.clone(), FOREVER).unwrap();
        assert!(set.bytes_used() + small.len() + HEADER_SIZE > limit);
        assert_eq!(set.put(small.clone(), FOREVER).unwrap(), large.len() + HEADER_SIZE);
        assert_eq!(set.bytes_used(), small.len() + HEADER_SIZE);

        set.put(large.clone(), FOREVER).unwrap();
        assert_eq!(set.bytes_used(), large.len() + HEADER_SIZE);

        let other = codec.serialize(&note("b", &"x".repeat(20))).unwrap();
        assert!(matches!(
            set.put(other, FOREVER),
            Err(Error::CapacityExceeded { .. })
        ));
        let larger = codec.serialize(&note("a", &"x".repeat(61))).unwrap();
        assert!(matches!(
            set.put(larger, FOREVER),
            Err(Error::CapacityExceeded { .. })
        ));
        assert_eq!(set.get_bytes(&Value::from("a")).unwrap(), Some(large));
        assert_eq!(set.len(), 1);
    }

    fn concurrent_accepted(set: &Arc<SegmentedSet<TupleCodec>>, threads: i64, per_thread: i64) -> usize {
        let accepted = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let set = Arc::clone(set);
                let accepted = Arc::clone(&accepted);
                thread::spawn(move || {
                    for i in 0..per_thread {
                        match set.put_entity(&product(&format!("t{t}-{i:04}"), i, true), None) {
                            Ok(_) => {
                                accepted.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(Error::CapacityExceeded { .. }) => {}
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        accepted.load(Ordering::Relaxed)
    }

    #[test]
    fn test_item_limit_holds_under_concurrent_puts() {
        let (set, mem) = new_set(StoreConfig {
            max_items: Some(100),
            ..Default::default()
        });
        let set = Arc::new(set);

        assert_eq!(concurrent_accepted(&set, 8, 200), 100);
        assert_eq!(set.len(), 100);
        assert_eq!(mem.live_allocations(), 100);
    }

    #[test]
    fn test_byte_limit_holds_under_concurrent_puts() {
        let record_size = codec()
            .serialize(&product("t0-0000", 0, true))
            .unwrap()
            .len()
            + HEADER_SIZE;
        let (set, mem) = new_set(StoreConfig {
            max_bytes: Some(record_size * 37),
            ..Default::default()
        });
        let set = Arc::new(set);

        assert_eq!(concurrent_accepted(&set, 8, 200), 37);
        assert_eq!(set.bytes_used(), record_size * 37);
        assert_eq!(mem.live_allocations(), 37);
    }

    #[test]
    fn test_item_limit_allows_overwrite() {
        let (set, _) = new_set(StoreConfig {
            max_items: Some(2),
            ..Default::default()
        });
        set.put_entity(&product("a", 1, true), None).unwrap();
        set.put_entity(&product("b", 1, true), None).unwrap();

        assert!(matches!(
            set.put_entity(&product("c", 1, true), None),
            Err(Error::CapacityExceeded { .. })
        ));
        assert!(set.put_entity(&product("a", 2, true), None).is_ok());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_out_of_memory_propagates() {
        let codec = codec();
        let notifier = ExpiryNotifier::new(Arc::clone(&codec));
        let set = SegmentedSet::with_parts(
            codec,
            StoreConfig::default(),
            Arc::new(ArenaMemory::with_limit(64)),
            notifier,
        )
        .unwrap();

        set.put_entity(&product("a", 1, true), None).unwrap();
        let err = set
            .put_entity(&product(&"x".repeat(100), 1, true), None)
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_rehash_detection() {
        let (set, _) = new_set(StoreConfig {
            nominal_capacity: 100,
            ..Default::default()
        });
        for i in 0..74 {
            set.put_entity(&product(&format!("k{i}"), 0, true), None)
                .unwrap();
        }
        assert_eq!(set.rehash_due(), None);

        set.put_entity(&product("k74", 0, true), None).unwrap();
        assert_eq!(set.rehash_due(), Some(RehashKind::Grow));

        for i in 0..60 {
            set.remove(&sku(&format!("k{i}"))).unwrap();
        }
        assert_eq!(set.len(), 15);
        assert_eq!(set.rehash_due(), Some(RehashKind::Shrink));
        assert_eq!(set.segment_count(), StoreConfig::default().min_segments);
    }

    #[derive(Default)]
    struct Collect {
        keys: parking_lot::Mutex<Vec<Value>>,
    }

    impl ExpirationListener<Entity> for Collect {
        fn wants_full_entity(&self) -> bool {
            true
        }

        fn on_expired(&self, event: ExpiredEvent<Entity>) {
            if let crate::storage::ExpiredValue::Entity(e) = event.value {
                self.keys.lock().push(e.fields[0].clone());
            }
        }
    }

    #[test]
    fn test_expiry_across_segments() {
        let codec = codec();
        let listener = Arc::new(Collect::default());
        let notifier = ExpiryNotifier::new(Arc::clone(&codec))
            .with_listener(listener.clone(), Arc::new(InlineExecutor));
        let mem = Arc::new(ArenaMemory::new());
        let set =
            SegmentedSet::with_parts(codec, StoreConfig::default(), mem.clone(), notifier).unwrap();

        for i in 0..20 {
            set.put_entity(
                &product(&format!("t{i}"), 0, true),
                Some(Duration::from_millis(1)),
            )
            .unwrap();
        }
        set.put_entity(&product("keep", 0, true), None).unwrap();

        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(set.evict_expired().unwrap(), 20);
        assert_eq!(set.evict_expired().unwrap(), 0);
        assert_eq!(set.len(), 1);
        assert_eq!(set.stats().expired, 20);
        assert_eq!(listener.keys.lock().len(), 20);
        assert_eq!(mem.live_allocations(), 1);
    }

    #[test]
    fn test_concurrent_disjoint_keys() {
        let (set, mem) = new_set(StoreConfig::default());
        let set = Arc::new(set);
        let threads = 8;
        let per_thread = 10_000;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let set = Arc::clone(&set);
                thread::spawn(move || {
                    for i in 0..per_thread {
                        let key = format!("t{t}-{i}");
                        set.put_entity(&product(&key, i, true), None).unwrap();
                        if i % 3 == 0 {
                            assert!(set.remove(&sku(&key)).unwrap() > 0);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let kept: usize = (0..per_thread).filter(|i| i % 3 != 0).count() * threads;
        assert_eq!(set.len(), kept);
        assert_eq!(mem.live_allocations(), kept);

        let all: HashSet<_> = set
            .fetch_by_example(&Template::any())
            .unwrap()
            .into_iter()
            .map(|e| e.fields[0].clone())
            .collect();
        assert_eq!(all.len(), kept);

        set.destroy().unwrap();
        assert_eq!(mem.live_allocations(), 0);
        assert_eq!(set.len(), 0);
        assert_eq!(set.bytes_used(), 0);
    }

    #[test]
    fn test_stats() {
        let (set, _) = new_set(StoreConfig::default());
        set.put_entity(&product("s", 1, true), None).unwrap();
        set.get_bytes(&sku("s")).unwrap();
        set.remove(&sku("s")).unwrap();

        let stats = set.stats();
        assert_eq!(stats.puts, 1);
        assert_eq!(stats.gets, 1);
        assert_eq!(stats.removes, 1);
        assert_eq!(stats.items, 0);
        assert_eq!(stats.segments, 16);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = SegmentedSet::new(
            codec(),
            StoreConfig {
                segment_capacity: 3,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
