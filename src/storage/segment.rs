//! Segment: Open-Addressing Handle Table
//!
//! A segment is one independently locked shard of the set. It stores nothing
//! but record handles in a power-of-two array and resolves collisions by
//! forward linear probing. Keys are not stored in the table; they are read
//! back out of each record's payload through the codec whenever a slot has
//! to be compared or re-homed.
//!
//! ## Locking
//!
//! Every public operation holds the segment's `RwLock` for its whole
//! probe sequence. Lookups and scans take the read lock, everything that
//! changes the slot array takes the write lock. A lookup that finds an
//! expired record drops the read lock and evicts under the write lock,
//! re-checking expiry first because another thread may have raced it.
//!
//! ## Deletion
//!
//! Linear probing cannot simply clear a slot: keys that collided past it
//! would become unreachable. After freeing a slot, the rest of its cluster
//! (every occupied slot up to the next empty one) is lifted out and
//! re-inserted from its home index. No tombstones are ever written.
//!
//! ## Sizing
//!
//! ```text
//! put:    count >= capacity / 2  ->  grow to capacity * 2 (before inserting)
//! remove: count == capacity / 8  ->  shrink to capacity / 2 (after sweeping)
//! ```
//!
//! A segment never shrinks below the capacity it was created with.

use super::expiry::ExpiryNotifier;
use super::record::{now_millis, EntryRecord};
use super::set::SetCounters;
use crate::codec::EntityCodec;
use crate::error::{Error, Result};
use crate::memory::{Handle, MemoryManager};
use bytes::Bytes;
use parking_lot::RwLock;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, trace};

/// Hashes a key with the deterministic default hasher.
#[inline]
pub fn hash_key<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// 64-bit finalizer (murmur3 fmix64). Spreads entropy into the low bits so
/// that masking by a power-of-two capacity does not cluster weak hashes.
#[inline]
pub fn mix(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

fn rejected(reason: String, record: &EntryRecord) -> Error {
    Error::CapacityExceeded {
        reason,
        payload: record.payload().clone(),
    }
}

/// The slot array and its occupancy.
struct Table {
    slots: Vec<Handle>,
    count: usize,
}

impl Table {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![Handle::NULL; capacity],
            count: 0,
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn mask(&self) -> usize {
        self.slots.len() - 1
    }
}

/// One independently locked shard of a [`super::SegmentedSet`].
pub struct Segment<C: EntityCodec> {
    table: RwLock<Table>,
    min_capacity: usize,
    mem: Arc<dyn MemoryManager>,
    codec: Arc<C>,
    notifier: Arc<ExpiryNotifier<C>>,
    counters: Arc<SetCounters>,
}

impl<C: EntityCodec> fmt::Debug for Segment<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.read();
        f.debug_struct("Segment")
            .field("capacity", &table.capacity())
            .field("count", &table.count)
            .finish()
    }
}

impl<C: EntityCodec> Segment<C> {
    /// Creates an empty segment. `capacity` must be a power of two >= 2.
    pub fn new(
        capacity: usize,
        mem: Arc<dyn MemoryManager>,
        codec: Arc<C>,
        notifier: Arc<ExpiryNotifier<C>>,
        counters: Arc<SetCounters>,
    ) -> Self {
        assert!(
            capacity >= 2 && capacity.is_power_of_two(),
            "segment capacity {capacity} must be a power of two >= 2"
        );
        Self {
            table: RwLock::new(Table::with_capacity(capacity)),
            min_capacity: capacity,
            mem,
            codec,
            notifier,
            counters,
        }
    }

    /// Number of live (possibly expired but not yet evicted) entries.
    pub fn len(&self) -> usize {
        self.table.read().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current slot capacity.
    pub fn capacity(&self) -> usize {
        self.table.read().capacity()
    }

    #[inline]
    fn home(key: &C::Key, mask: usize) -> usize {
        (mix(hash_key(key)) as usize) & mask
    }

    fn key_at(&self, handle: Handle) -> Result<C::Key> {
        let payload = EntryRecord::read_payload(self.mem.as_ref(), handle)?;
        self.codec.read_key(&payload)
    }

    /// Probes for `key`. Returns its slot, or the first empty slot on the
    /// probe path as `Err`.
    fn probe(&self, table: &Table, key: &C::Key) -> Result<std::result::Result<usize, usize>> {
        let mask = table.mask();
        let mut index = Self::home(key, mask);

        for _ in 0..table.capacity() {
            let handle = table.slots[index];
            if handle.is_null() {
                return Ok(Err(index));
            }
            if self.key_at(handle)? == *key {
                return Ok(Ok(index));
            }
            index = (index + 1) & mask;
        }

        // Load factor stays below one half, so a full wrap means corruption.
        unreachable!("segment of capacity {} has no empty slot", table.capacity())
    }

    fn find(&self, table: &Table, key: &C::Key) -> Result<Option<usize>> {
        Ok(self.probe(table, key)?.ok())
    }

    /// Places a handle in the first empty slot of its probe path. No
    /// allocation and no key comparison; the caller guarantees uniqueness.
    fn insert_handle(slots: &mut [Handle], key: &C::Key, handle: Handle) {
        let mask = slots.len() - 1;
        let mut index = Self::home(key, mask);
        while !slots[index].is_null() {
            index = (index + 1) & mask;
        }
        slots[index] = handle;
    }

    /// Returns true if `key` is present and not expired.
    pub fn contains(&self, key: &C::Key) -> Result<bool> {
        let expired = {
            let table = self.table.read();
            match self.find(&table, key)? {
                None => return Ok(false),
                Some(index) => {
                    EntryRecord::is_expired(self.mem.as_ref(), table.slots[index], now_millis())?
                }
            }
        };

        if expired {
            self.evict_if_expired(key)?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Reads the full record stored under `key`.
    pub fn get_record(&self, key: &C::Key) -> Result<Option<EntryRecord>> {
        let record = {
            let table = self.table.read();
            match self.find(&table, key)? {
                None => return Ok(None),
                Some(index) => EntryRecord::for_read(self.mem.as_ref(), table.slots[index])?,
            }
        };

        if record.is_expired_at(now_millis()) {
            self.evict_if_expired(key)?;
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Reads only the payload stored under `key`.
    pub fn get_bytes(&self, key: &C::Key) -> Result<Option<Bytes>> {
        Ok(self.get_record(key)?.map(EntryRecord::into_payload))
    }

    /// Stores `record` under `key`, replacing any previous entry.
    ///
    /// Room is reserved against the set's limits before the record is
    /// written, and the reservation is undone if writing fails. Returns the
    /// bytes occupied by the replaced entry, or 0 if the key was new.
    pub fn put(&self, key: &C::Key, mut record: EntryRecord) -> Result<usize> {
        let mut table = self.table.write();
        let occupied = record.bytes_occupied();

        if let Ok(index) = self.probe(&table, key)? {
            let old = table.slots[index];
            let previous = EntryRecord::occupied_at(self.mem.as_ref(), old)?;
            self.counters
                .reserve_replace(previous, occupied)
                .map_err(|reason| rejected(reason, &record))?;
            match record.dump_at(self.mem.as_ref(), old) {
                Ok(handle) => table.slots[index] = handle,
                Err(e) => {
                    self.counters.cancel_replace(previous, occupied);
                    return Err(e);
                }
            }
            trace!(?key, index, previous, "overwrote entry");
            return Ok(previous);
        }

        let items = self
            .counters
            .reserve_insert(occupied)
            .map_err(|reason| rejected(reason, &record))?;
        if let Err(e) = self.insert_locked(&mut table, key, &mut record) {
            self.counters.cancel_insert(occupied);
            return Err(e);
        }
        self.counters.insert_committed(items);
        trace!(?key, "inserted entry");
        Ok(0)
    }

    /// Writes a record for an absent key, growing the table first if it is
    /// half full.
    fn insert_locked(&self, table: &mut Table, key: &C::Key, record: &mut EntryRecord) -> Result<()> {
        if table.count >= table.capacity() / 2 {
            let grown = table.capacity() * 2;
            self.resize_locked(table, grown)?;
        }
        let handle = record.dump(self.mem.as_ref())?;
        Self::insert_handle(&mut table.slots, key, handle);
        table.count += 1;
        Ok(())
    }

    /// Removes `key`. Returns the bytes freed, or 0 if it was absent.
    pub fn remove(&self, key: &C::Key) -> Result<usize> {
        let mut table = self.table.write();
        match self.find(&table, key)? {
            None => Ok(0),
            Some(index) => Ok(self.remove_at(&mut table, index)?.0),
        }
    }

    /// Frees the entry at `index`, then re-homes the rest of its cluster.
    ///
    /// Returns the bytes freed and the removed record's ttl.
    fn remove_at(&self, table: &mut Table, index: usize) -> Result<(usize, u32)> {
        let handle = table.slots[index];
        let freed = EntryRecord::occupied_at(self.mem.as_ref(), handle)?;
        let ttl = self.mem.read_u32(handle, super::record::OFFSET_TTL)?;

        self.mem.release(handle)?;
        table.slots[index] = Handle::NULL;
        table.count -= 1;
        self.counters.entry_removed(freed);

        self.back_shift(table, index)?;

        if table.count > 0
            && table.count <= table.capacity() / 8
            && table.capacity() / 2 >= self.min_capacity
        {
            let shrunk = table.capacity() / 2;
            self.resize_locked(table, shrunk)?;
        }

        Ok((freed, ttl))
    }

    /// Lifts every occupied slot following `vacated` (up to the next empty
    /// slot) and re-inserts it from its home index.
    fn back_shift(&self, table: &mut Table, vacated: usize) -> Result<()> {
        let mask = table.mask();
        let mut index = (vacated + 1) & mask;
        let mut moved = 0usize;

        while !table.slots[index].is_null() {
            let handle = table.slots[index];
            let key = self.key_at(handle)?;
            table.slots[index] = Handle::NULL;
            Self::insert_handle(&mut table.slots, &key, handle);

            moved += 1;
            index = (index + 1) & mask;
        }

        if moved > 0 {
            trace!(vacated, moved, "back-shift sweep");
        }
        Ok(())
    }

    /// Rebuilds the slot array at `capacity`, re-reading every key from its
    /// payload. The old array is only replaced once every handle is placed.
    fn resize_locked(&self, table: &mut Table, capacity: usize) -> Result<()> {
        let mut slots = vec![Handle::NULL; capacity];
        for &handle in table.slots.iter().filter(|h| !h.is_null()) {
            let key = self.key_at(handle)?;
            Self::insert_handle(&mut slots, &key, handle);
        }

        debug!(
            from = table.capacity(),
            to = capacity,
            entries = table.count,
            "Resized segment"
        );
        table.slots = slots;
        Ok(())
    }

    /// Evicts `key` if, under the write lock, it is still present and
    /// expired. Notifies only if this call freed the entry.
    fn evict_if_expired(&self, key: &C::Key) -> Result<bool> {
        let evicted = {
            let mut table = self.table.write();
            let Some(index) = self.find(&table, key)? else {
                return Ok(false);
            };
            let handle = table.slots[index];
            if !EntryRecord::is_expired(self.mem.as_ref(), handle, now_millis())? {
                return Ok(false);
            }
            let payload = EntryRecord::read_payload(self.mem.as_ref(), handle)?;
            let (freed, ttl) = self.remove_at(&mut table, index)?;
            (freed > 0).then_some((payload, ttl))
        };

        match evicted {
            Some((payload, ttl)) => {
                self.counters.entry_expired();
                trace!(?key, "evicted expired entry");
                self.notifier.notify(payload, ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Collects payloads matching `template`. Expired entries met during the
    /// scan are evicted afterwards instead of being returned.
    pub fn match_template(&self, template: &C::Template) -> Result<Vec<Bytes>> {
        let mut matched = Vec::new();
        let mut expired = Vec::new();

        {
            let table = self.table.read();
            let now = now_millis();
            for &handle in table.slots.iter().filter(|h| !h.is_null()) {
                let record = EntryRecord::for_read(self.mem.as_ref(), handle)?;
                if record.is_expired_at(now) {
                    expired.push(self.codec.read_key(record.payload())?);
                } else if self.codec.matches(record.payload(), template)?.is_match() {
                    matched.push(record.into_payload());
                }
            }
        }

        for key in &expired {
            self.evict_if_expired(key)?;
        }
        Ok(matched)
    }

    /// Evicts every expired entry. Returns how many this call removed.
    pub fn evict_expired(&self) -> Result<usize> {
        let expired = {
            let table = self.table.read();
            let now = now_millis();
            let mut keys = Vec::new();
            for &handle in table.slots.iter().filter(|h| !h.is_null()) {
                if EntryRecord::is_expired(self.mem.as_ref(), handle, now)? {
                    keys.push(self.key_at(handle)?);
                }
            }
            keys
        };

        let mut evicted = 0;
        for key in &expired {
            if self.evict_if_expired(key)? {
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    /// Releases every record and resets the segment to its initial capacity.
    pub fn destroy(&self) -> Result<()> {
        let mut table = self.table.write();
        self.release_all(&mut table)
    }

    fn release_all(&self, table: &mut Table) -> Result<()> {
        let mut result = Ok(());
        for slot in table.slots.iter_mut().filter(|h| !h.is_null()) {
            let handle = std::mem::replace(slot, Handle::NULL);
            let freed = EntryRecord::occupied_at(self.mem.as_ref(), handle).unwrap_or(0);
            if let Err(e) = self.mem.release(handle) {
                result = Err(e);
            }
            self.counters.entry_removed(freed);
        }
        *table = Table::with_capacity(self.min_capacity);
        result
    }
}

impl<C: EntityCodec> Drop for Segment<C> {
    fn drop(&mut self) {
        let table = self.table.get_mut();
        if table.count > 0 {
            let mut table = std::mem::replace(table, Table::with_capacity(2));
            let _ = self.release_all(&mut table);
        }
    }
}
