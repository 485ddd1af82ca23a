//! A concurrent map from `u32` keys to values, using two-choice cuckoo hashing.

use crate::error::{InsertError, Result};
use crate::rehash::RehashGate;
use crate::slot::Entry;
use crate::table::{Table, MAX_SLOT_ATTEMPTS};
use crate::util::round_capacity;
use parking_lot::{RwLock, RwLockReadGuard};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// The result of a single attempt to insert under the shared lock.
enum Attempt<V> {
    /// The entry was stored.
    Placed,
    /// The key is already in a primary slot.
    Duplicate(Entry<V>),
    /// The key is in a staging chain, so it is being moved by another thread,
    /// and the attempt needs to start again.
    InFlight(Entry<V>),
    /// No free slot was found within the displacement budget. The entry is the
    /// one which was left without a slot, and its key is in the staging chain
    /// of the slot it was last evicted from.
    Homeless(Entry<V>),
}

/// The result of a lookup under the shared lock.
enum Probe<R, F> {
    /// The key was found, with the result of the accessor.
    Found(R),
    /// The key is in neither candidate slot, nor either staging chain.
    Absent,
    /// The key is in a staging chain, so the lookup needs to start again. The
    /// accessor is handed back since it was not used.
    InFlight(F),
}

/// A concurrent hash map which uses two-choice cuckoo hashing, with `u32` keys.
///
/// Each key has one candidate slot in each of two halves of the table, so
/// lookups only ever look at two slots. Insertions which find both candidates
/// occupied evict an occupant to its other candidate, and so on, until a free
/// slot is found, or the displacement budget runs out and the table is
/// rehashed (grown, if it is at half load, otherwise reseeded).
///
/// # Threading
///
/// The map *is* thread-safe, and all operations can be performed from any
/// number of threads. Operations take a shared hold on a global reader/writer
/// lock and then lock the (at most two) slots they touch, so operations on
/// different keys run in parallel. Only a rehash takes the exclusive hold,
/// during which every other operation blocks.
///
/// Keys which are being displaced are recorded in the staging chain of the slot
/// they were evicted from. A lookup which finds its key in a chain rather than
/// in a slot starts again, so a key which is being moved is never reported as
/// missing.
///
/// # Limitations
///
/// The map is blocking rather than lock-free. Values can't be borrowed out of
/// the map, since they may be moved or removed by other threads, so access is
/// either through a closure ([`CuckooMap::get_with`]) or by cloning
/// ([`CuckooMap::get`]).
pub struct CuckooMap<V> {
    /// Slot storage, behind the global reader/writer lock.
    table: RwLock<Table<V>>,
    /// Number of elements in the map.
    len: AtomicU64,
    /// Admission for the single rehashing thread.
    gate: RehashGate,
}

impl<V> CuckooMap<V> {
    /// The default initial number of slots, across both halves.
    pub const INITIAL_SIZE: usize = 32;

    /// The number of rehashes a single insertion will request before failing.
    pub const MAX_INSERT_RETRIES: usize = 0xffff;

    /// Creates an empty map with [`CuckooMap::INITIAL_SIZE`] slots.
    pub fn new() -> CuckooMap<V> {
        Self::with_capacity(Self::INITIAL_SIZE)
    }

    /// Creates an empty map with space for at least `capacity` slots. The
    /// capacity is rounded up to a power of two, and is never less than
    /// [`CuckooMap::INITIAL_SIZE`].
    ///
    /// Since the table grows once it is at half load, this holds `capacity / 2`
    /// elements before growing.
    pub fn with_capacity(capacity: usize) -> CuckooMap<V> {
        CuckooMap {
            table: RwLock::new(Table::with_capacity(round_capacity(
                capacity,
                Self::INITIAL_SIZE,
            ))),
            len: AtomicU64::new(0),
            gate: RehashGate::default(),
        }
    }

    /// Returns the number of slots in the map.
    pub fn capacity(&self) -> usize {
        self.read_table().capacity()
    }

    /// Returns the number of elements in the map.
    pub fn len(&self) -> u64 {
        let _table = self.read_table();
        self.len.load(Ordering::Acquire)
    }

    /// Returns true if the map contains no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts the `key` and `value` into the map.
    ///
    /// # Errors
    ///
    /// Returns [`InsertError::DuplicateKey`] with the `key` and `value` if the
    /// key is already in the map, in which case the stored value is unchanged.
    ///
    /// Returns [`InsertError::RetriesExhausted`] if no slot could be found after
    /// [`CuckooMap::MAX_INSERT_RETRIES`] rehashes. This is not expected to
    /// happen in practice.
    pub fn insert(&self, key: u32, value: V) -> Result<(), V> {
        let mut entry = Entry::new(key, value);
        let mut rehashes = 0;
        loop {
            let table = self.read_table();
            match self.try_insert(&table, entry, rehashes > 0) {
                Attempt::Placed => return Ok(()),
                Attempt::Duplicate(Entry { key, value }) => {
                    return Err(InsertError::DuplicateKey { key, value });
                }
                Attempt::InFlight(in_flight) => {
                    drop(table);
                    entry = in_flight;
                    std::thread::yield_now();
                }
                Attempt::Homeless(homeless) => {
                    entry = homeless;
                    rehashes += 1;
                    self.rehash(table);
                    if rehashes > Self::MAX_INSERT_RETRIES {
                        return Err(self.abandon(entry));
                    }
                }
            }
        }
    }

    /// Removes the `key` from the map, returning the value for it if it was in
    /// the map.
    pub fn remove(&self, key: u32) -> Option<V> {
        let value = self
            .access(key, |entry| entry.take().map(|entry| entry.value))
            .flatten();
        if value.is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        value
    }

    /// Calls `f` with a reference to the value for `key`, returning the result,
    /// or `None` if the key is not in the map.
    ///
    /// The slot for the key is locked while `f` runs, so `f` should be short,
    /// and must not access the map.
    pub fn get_with<R, F>(&self, key: u32, f: F) -> Option<R>
    where
        F: FnOnce(&V) -> R,
    {
        self.access(key, |entry| entry.as_ref().map(|entry| f(&entry.value)))
            .flatten()
    }

    /// Returns a clone of the value for `key`, or `None` if the key is not in
    /// the map.
    pub fn get(&self, key: u32) -> Option<V>
    where
        V: Clone,
    {
        self.get_with(key, V::clone)
    }

    /// Returns true if the map contains the `key`.
    pub fn contains_key(&self, key: u32) -> bool {
        self.get_with(key, |_| ()).is_some()
    }

    /// Takes a shared hold on the table, first waiting for any rehash to finish.
    fn read_table(&self) -> RwLockReadGuard<'_, Table<V>> {
        self.gate.wait_idle();
        self.table.read()
    }

    /// Calls `f` with the entry for `key`, starting again while the key is
    /// being moved.
    ///
    /// # Returns
    ///
    /// The result of `f`, or `None` if the key is not in the map.
    fn access<R, F>(&self, key: u32, f: F) -> Option<R>
    where
        F: FnOnce(&mut Option<Entry<V>>) -> R,
    {
        let mut f = f;
        loop {
            let table = self.read_table();
            match Self::probe(&table, key, f) {
                Probe::Found(result) => return Some(result),
                Probe::Absent => return None,
                Probe::InFlight(unused) => {
                    drop(table);
                    f = unused;
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Looks for `key` in its two candidate slots, calling `f` with the entry
    /// if it is found.
    ///
    /// Both slots are locked, half 0 first, for the duration.
    fn probe<R, F>(table: &Table<V>, key: u32, f: F) -> Probe<R, F>
    where
        F: FnOnce(&mut Option<Entry<V>>) -> R,
    {
        let (h0, h1) = table.candidates(key);
        let mut slot0 = table.slot(h0).lock();
        let mut slot1 = table.slot(h1).lock();

        if slot0.holds(key) {
            return Probe::Found(f(slot0.entry_mut()));
        }
        if slot1.holds(key) {
            return Probe::Found(f(slot1.entry_mut()));
        }
        if slot0.chain_contains(key) || slot1.chain_contains(key) {
            return Probe::InFlight(f);
        }
        Probe::Absent
    }

    /// Makes a single attempt to insert the `entry`, displacing occupants
    /// between the halves until a free slot is found or the displacement budget
    /// is used up.
    ///
    /// A fresh key is counted as soon as it is stored in its first slot, since
    /// from then on it is visible to lookups (from a slot, or from a chain while
    /// it is being displaced).
    ///
    /// # Arguments
    ///
    /// * `table`   - The table, with a shared hold.
    /// * `entry`   - The entry to insert.
    /// * `resumed` - If this attempt follows a homeless one. The entry may then
    ///               be one which was displaced by an earlier attempt, and its
    ///               key is parked in the staging chain of one of its candidate
    ///               slots: half 0 if a rehash ran in between, otherwise the
    ///               slot it was last evicted from.
    fn try_insert(&self, table: &Table<V>, entry: Entry<V>, resumed: bool) -> Attempt<V> {
        let key = entry.key;
        let (h0, h1) = table.candidates(key);

        let mut in_flight = Some(entry);
        {
            let mut slot0 = table.slot(h0).lock();
            {
                let mut slot1 = table.slot(h1).lock();
                if resumed {
                    slot0.remove_chain_entry(key);
                    slot1.remove_chain_entry(key);
                }
                if slot0.holds(key) || slot1.holds(key) {
                    return Self::unplaced(in_flight, Attempt::Duplicate);
                }
                // A resumed key can only be chained by this insertion, so only a
                // fresh key can be in flight elsewhere.
                if !resumed && (slot0.chain_contains(key) || slot1.chain_contains(key)) {
                    return Self::unplaced(in_flight, Attempt::InFlight);
                }
            }
            slot0.swap_with(&mut in_flight);
            if !resumed {
                self.len.fetch_add(1, Ordering::AcqRel);
            }
        }

        let mut previous = h0;
        for attempt in 1..MAX_SLOT_ATTEMPTS {
            let displaced = match &in_flight {
                Some(entry) => entry.key,
                None => return Attempt::Placed,
            };

            let index = table.index(attempt & 1, displaced);
            table.slot(index).lock().swap_with(&mut in_flight);

            // The displaced key is now in a slot, so it no longer needs to be
            // visible from the chain of the slot it was evicted from.
            table.slot(previous).lock().remove_chain_entry(displaced);
            previous = index;
        }

        Self::unplaced(in_flight, Attempt::Homeless)
    }

    /// Maps the entry in flight to an attempt result, which is
    /// [`Attempt::Placed`] if there is no entry left.
    #[inline]
    fn unplaced(in_flight: Option<Entry<V>>, kind: fn(Entry<V>) -> Attempt<V>) -> Attempt<V> {
        match in_flight {
            Some(entry) => kind(entry),
            None => Attempt::Placed,
        }
    }

    /// Rehashes the table, or waits for a rehash by another thread, after an
    /// insertion ran out of slots. The shared hold on the table is released,
    /// and the caller must take a new one.
    fn rehash(&self, table: RwLockReadGuard<'_, Table<V>>) {
        drop(table);

        if !self.gate.try_begin() {
            self.gate.wait_idle();
            return;
        }

        debug!("cuckoo map insertion out of slots, rehashing");
        {
            let mut table = self.table.write();
            table.rehash(self.len.load(Ordering::Acquire));
        }
        self.gate.finish();
    }

    /// Gives up on the homeless `entry`, removing its key from the staging
    /// chain it was parked in so that lookups see it as missing.
    fn abandon(&self, entry: Entry<V>) -> InsertError<V> {
        let key = entry.key;
        {
            let table = self.read_table();
            let (h0, h1) = table.candidates(key);
            let mut slot0 = table.slot(h0).lock();
            let mut slot1 = table.slot(h1).lock();
            slot0.remove_chain_entry(key);
            slot1.remove_chain_entry(key);
        }
        // The entry was counted when it was first stored.
        self.len.fetch_sub(1, Ordering::AcqRel);

        warn!(
            key,
            retries = Self::MAX_INSERT_RETRIES,
            "cuckoo map insertion abandoned"
        );
        InsertError::RetriesExhausted {
            key,
            value: entry.value,
        }
    }
}

impl<V> Default for CuckooMap<V> {
    fn default() -> CuckooMap<V> {
        CuckooMap::new()
    }
}

impl<V> fmt::Debug for CuckooMap<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CuckooMap")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
