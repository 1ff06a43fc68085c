//! Bounded Concurrent State Store
//!
//! Fixed-capacity hash table shared by every core on the packet path.
//! Backs both the pacing state and the accounting partitions.
//!
//! # Design
//!
//! - Slots are preallocated once; the table never grows
//! - Open addressing with linear probing, tombstones on removal
//! - Scans are capped at [`MAX_SCAN`] slots; a key that finds
//!   no free slot in its window is rejected like a full table
//! - A tombstone that ends a run of occupied slots is turned back into an empty slot,
//!   so churn does not lengthen misses
//! - Atomic slot state for lock-free probing
//! - Per-entry lock held only for the duration of one read or write
//! - Entry count is reserved with a CAS before a slot is claimed, so the
//!   configured maximum is a hard bound

use parking_lot::RwLock;
use shaper_common::{ShaperError, ShaperResult};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

/// Most slots any single operation visits
pub const MAX_SCAN: usize = 128;

/// Write semantics for [`BoundedMap::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Create or overwrite
    Any,
    /// Overwrite only; fails with `KeyNotFound` if absent
    Exist,
    /// Create only; fails with `KeyExists` if present
    NotExist,
}

/// Slot state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Empty = 0,
    /// Claimed by an inserter, key not yet visible
    Reserved = 1,
    Occupied = 2,
    Deleted = 3,
}

/// Table entry
#[repr(C, align(64))] // Cache-line aligned
struct Entry<K, V> {
    state: AtomicU8,
    hash: AtomicU64,
    slot: RwLock<Option<(K, V)>>,
}

impl<K, V> Entry<K, V> {
    fn empty() -> Self {
        Self {
            state: AtomicU8::new(EntryState::Empty as u8),
            hash: AtomicU64::new(0),
            slot: RwLock::new(None),
        }
    }
}

/// FNV-1a, fast and well distributed for small integer keys
struct FnvHasher(u64);

impl FnvHasher {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    fn new() -> Self {
        Self(Self::OFFSET)
    }
}

impl Hasher for FnvHasher {
    #[inline(always)]
    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= *byte as u64;
            self.0 = self.0.wrapping_mul(Self::PRIME);
        }
    }

    #[inline(always)]
    fn finish(&self) -> u64 {
        self.0
    }
}

#[inline(always)]
fn hash_key<K: Hash>(key: &K) -> u64 {
    let mut hasher = FnvHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Bounded concurrent map
///
/// Safe for unsynchronized callers on any number of cores. Operations on
/// different keys never wait on each other except for hash collisions in
/// the same slot. Two concurrent first inserts of the same key may each
/// claim a slot; lookups resolve to the first in scan order and the
/// duplicate ages out through [`BoundedMap::retain`] or `remove`. The same
/// holds for a key inserted just behind a run that a concurrent removal
/// is clearing.
///
/// # Performance
/// - Lookup: O(1), never more than [`MAX_SCAN`] slots
/// - Insert: O(1), fails instead of growing
pub struct BoundedMap<K, V> {
    entries: Box<[Entry<K, V>]>,
    mask: usize,
    scan_limit: usize,
    max_entries: usize,
    count: AtomicUsize,
}

impl<K, V> BoundedMap<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    /// Create a map holding at most `max_entries` keys
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        // Keep load factor at or below 75%
        let size = (max_entries + max_entries / 3 + 1).next_power_of_two();
        let entries = (0..size).map(|_| Entry::empty()).collect::<Vec<_>>();

        Self {
            entries: entries.into_boxed_slice(),
            mask: size - 1,
            scan_limit: size.min(MAX_SCAN),
            max_entries,
            count: AtomicUsize::new(0),
        }
    }

    /// Slots visited for `hash`, in order
    #[inline(always)]
    fn scan(&self, hash: u64) -> impl Iterator<Item = (usize, &Entry<K, V>)> + '_ {
        let home = hash as usize;
        (0..self.scan_limit).map(move |step| {
            let idx = home.wrapping_add(step) & self.mask;
            (idx, &self.entries[idx])
        })
    }

    /// Find the slot currently holding `key`
    #[inline]
    fn find(&self, key: &K, hash: u64) -> Option<(usize, &Entry<K, V>)> {
        for (idx, entry) in self.scan(hash) {
            let state = entry.state.load(Ordering::Acquire);

            if state == EntryState::Empty as u8 {
                return None;
            }

            if state == EntryState::Occupied as u8
                && entry.hash.load(Ordering::Relaxed) == hash
                && matches!(&*entry.slot.read(), Some((k, _)) if k == key)
            {
                return Some((idx, entry));
            }
        }

        None
    }

    /// Tombstone the slot at `idx`, whose lock the caller holds and has
    /// already emptied, then clear the run of tombstones it may end.
    fn release(&self, idx: usize) {
        self.entries[idx].state.store(EntryState::Deleted as u8, Ordering::Release);
        self.count.fetch_sub(1, Ordering::Relaxed);

        let next = &self.entries[(idx + 1) & self.mask];
        if next.state.load(Ordering::Acquire) != EntryState::Empty as u8 {
            return;
        }

        // No lookup continues past an empty slot, so the tombstones before it
        // are dead weight
        let mut idx = idx;
        for _ in 0..self.entries.len() {
            let cleared = self.entries[idx].state.compare_exchange(
                EntryState::Deleted as u8,
                EntryState::Empty as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
            if cleared.is_err() {
                break;
            }
            idx = idx.wrapping_sub(1) & self.mask;
        }
    }

    /// Reserve room for one more key
    #[inline]
    fn reserve(&self) -> ShaperResult<()> {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            if current >= self.max_entries {
                return Err(ShaperError::StoreFull {
                    capacity: self.max_entries,
                });
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Claim a free slot for a key known to be absent
    fn insert_new(&self, key: K, hash: u64, value: V) -> ShaperResult<()> {
        self.reserve()?;

        for (_, entry) in self.scan(hash) {
            let state = entry.state.load(Ordering::Acquire);

            if (state == EntryState::Empty as u8 || state == EntryState::Deleted as u8)
                && entry
                    .state
                    .compare_exchange(
                        state,
                        EntryState::Reserved as u8,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                *entry.slot.write() = Some((key, value));
                entry.hash.store(hash, Ordering::Release);
                entry.state.store(EntryState::Occupied as u8, Ordering::Release);
                return Ok(());
            }
        }

        // Window exhausted
        self.count.fetch_sub(1, Ordering::Relaxed);
        Err(ShaperError::StoreFull {
            capacity: self.max_entries,
        })
    }

    /// Lookup value by key
    #[inline]
    pub fn get(&self, key: &K) -> Option<V> {
        let (_, entry) = self.find(key, hash_key(key))?;
        let slot = entry.slot.read();
        match &*slot {
            Some((k, v)) if k == key => Some(*v),
            _ => None,
        }
    }

    /// Write `value` under `key` according to `mode`
    #[inline]
    pub fn upsert(&self, key: K, value: V, mode: UpdateMode) -> ShaperResult<()> {
        let hash = hash_key(&key);

        if let Some((_, entry)) = self.find(&key, hash) {
            let mut slot = entry.slot.write();
            if let Some((k, v)) = slot.as_mut() {
                if *k == key {
                    if mode == UpdateMode::NotExist {
                        return Err(ShaperError::KeyExists);
                    }
                    *v = value;
                    return Ok(());
                }
            }
            // Removed between scan and lock
        }

        if mode == UpdateMode::Exist {
            return Err(ShaperError::KeyNotFound);
        }
        self.insert_new(key, hash, value)
    }

    /// Read-modify-write one entry under its lock.
    ///
    /// `f` sees the current value (`None` if absent) and returns the value
    /// to store, or `None` to leave the entry untouched. Returns what was
    /// stored. The first insert of a key is not serialized against a
    /// concurrent first insert of the same key.
    #[inline]
    pub fn update_with<F>(&self, key: K, f: F) -> ShaperResult<Option<V>>
    where
        F: FnOnce(Option<V>) -> Option<V>,
    {
        let hash = hash_key(&key);

        if let Some((_, entry)) = self.find(&key, hash) {
            let mut slot = entry.slot.write();
            if let Some((k, v)) = slot.as_mut() {
                if *k == key {
                    let next = f(Some(*v));
                    if let Some(new) = next {
                        *v = new;
                    }
                    return Ok(next);
                }
            }
        }

        match f(None) {
            Some(new) => {
                self.insert_new(key, hash, new)?;
                Ok(Some(new))
            }
            None => Ok(None),
        }
    }

    /// Remove key, returning its value
    pub fn remove(&self, key: &K) -> Option<V> {
        let (idx, entry) = self.find(key, hash_key(key))?;
        let mut slot = entry.slot.write();
        match slot.take() {
            Some((k, v)) if k == *key => {
                self.release(idx);
                Some(v)
            }
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Remove every entry for which `keep` returns false.
    /// Returns the number removed.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut removed = 0;
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.state.load(Ordering::Acquire) != EntryState::Occupied as u8 {
                continue;
            }
            let mut slot = entry.slot.write();
            let evict = matches!(&*slot, Some((k, v)) if !keep(k, v));
            if evict {
                *slot = None;
                self.release(idx);
                removed += 1;
            }
        }
        removed
    }

    /// Copy out all entries
    pub fn snapshot(&self) -> Vec<(K, V)> {
        self.entries
            .iter()
            .filter(|e| e.state.load(Ordering::Acquire) == EntryState::Occupied as u8)
            .filter_map(|e| *e.slot.read())
            .collect()
    }

    /// Remove and return all entries
    pub fn drain(&self) -> Vec<(K, V)> {
        let mut out = Vec::new();
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.state.load(Ordering::Acquire) != EntryState::Occupied as u8 {
                continue;
            }
            let mut slot = entry.slot.write();
            if let Some(pair) = slot.take() {
                self.release(idx);
                out.push(pair);
            }
        }
        out
    }

    /// Current entry count
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum entry count
    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    /// Occupancy as a fraction of capacity
    pub fn load_factor(&self) -> f64 {
        self.len() as f64 / self.max_entries as f64
    }
}
