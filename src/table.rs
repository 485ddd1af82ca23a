//! The slot storage for the map, split into the two halves which each key has
//! a candidate slot in, and the single writer redistribution used when the
//! storage is grown or reseeded.

use crate::hashfunc::HashFunc;
use crate::slot::{Entry, Slot};
use crate::util::try_allocate_slots;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

/// The max number of slots the table can grow to.
pub(crate) const MAX_CAPACITY: u64 = 1 << 32;

/// The number of times an insertion will evict an occupant to its other
/// candidate slot before giving up and requesting a rehash.
pub(crate) const MAX_KICKS: usize = 31;

/// The number of slots which an insertion will try, across both halves. This
/// is the first slot, plus all kicks.
pub(crate) const MAX_SLOT_ATTEMPTS: usize = MAX_KICKS + 1;

/// The load, as a fraction of capacity, at which a rehash grows the table
/// rather than reseeding it.
pub(crate) const MAX_LOAD_FACTOR: f64 = 0.5;

/// The number of times a grown table is reseeded when redistribution hits a
/// cuckoo cycle, before growth is abandoned.
pub(crate) const MAX_REDISTRIBUTE_ATTEMPTS: usize = 1024;

/// Returns true if `len` elements puts a table of `capacity` slots at or over
/// [`MAX_LOAD_FACTOR`].
#[inline]
fn at_max_load(len: u64, capacity: usize) -> bool {
    len as f64 >= capacity as f64 * MAX_LOAD_FACTOR
}

/// One of the two logical cuckoo tables. A half is a view into a range of the
/// backing array of a [`Table`], with its own hash function.
#[derive(Clone, Debug)]
pub(crate) struct TableHalf {
    /// Index of the first slot of the half in the backing array.
    offset: usize,
    /// Hash function for the half, which also tracks the half's size.
    hash: HashFunc,
}

impl TableHalf {
    /// Creates a half of `size` slots starting at `offset` in the backing array.
    fn new(offset: usize, size: usize) -> TableHalf {
        TableHalf {
            offset,
            hash: HashFunc::new(size),
        }
    }

    /// Returns the index in the backing array of the slot for `key`.
    #[inline]
    pub(crate) fn index(&self, key: u32) -> usize {
        self.offset + self.hash.hash(key) as usize
    }

    /// Returns the number of slots in the half.
    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.hash.size()
    }

    /// Reseeds the hash function for the half.
    fn reseed(&mut self) {
        self.hash.reseed();
    }

    /// Moves the half to `offset`, resizes it to `size` slots, and reseeds it.
    fn resize(&mut self, offset: usize, size: usize) {
        self.offset = offset;
        self.hash.reseed_for_size(size);
    }

    /// Moves every entry and every staging chain key out of this half's range
    /// of `slots`.
    ///
    /// # Arguments
    ///
    /// * `slots`   - The backing array the half is a view into.
    /// * `entries` - Vector to append the occupied entries to.
    /// * `chained` - Vector to append the keys from the staging chains to.
    fn drain<V>(
        &self,
        slots: &mut [Mutex<Slot<V>>],
        entries: &mut Vec<Entry<V>>,
        chained: &mut Vec<u32>,
    ) {
        for slot in &mut slots[self.offset..self.offset + self.size()] {
            let slot = slot.get_mut();
            if let Some(entry) = slot.take() {
                entries.push(entry);
            }
            slot.drain_chain(chained);
        }
    }
}

/// The outcome of a single writer insertion.
enum Placement<V> {
    /// The entry (and every entry it displaced) found a free slot.
    Placed,
    /// The insertion ran out of slot attempts, and this entry was left without
    /// a slot.
    Homeless(Entry<V>),
}

/// Slot storage for the map. A single backing array is split in two halves,
/// so that growth reallocates once for both halves.
///
/// Shared access allows the slots to be locked individually, while exclusive
/// access (`&mut Table`) is only given to the single rehashing thread, which
/// then touches slots without locking them.
pub(crate) struct Table<V> {
    /// The backing array for both halves.
    slots: Vec<Mutex<Slot<V>>>,
    /// The two halves; half 0 is the first half of `slots`.
    halves: [TableHalf; 2],
}

impl<V> Table<V> {
    /// Creates a table with `capacity` slots.
    ///
    /// # Assertations
    ///
    /// This will assert if `capacity` is not a power of two which is at least 2.
    pub(crate) fn with_capacity(capacity: usize) -> Table<V> {
        assert!(capacity >= 2 && capacity.is_power_of_two());
        let half_size = capacity / 2;
        Table {
            slots: (0..capacity).map(|_| Mutex::default()).collect(),
            halves: [TableHalf::new(0, half_size), TableHalf::new(half_size, half_size)],
        }
    }

    /// Returns the total number of slots in the table.
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the two candidate slot indices for `key`, for half 0 and half 1.
    #[inline]
    pub(crate) fn candidates(&self, key: u32) -> (usize, usize) {
        (self.halves[0].index(key), self.halves[1].index(key))
    }

    /// Returns the candidate slot index for `key` in the `half`.
    #[inline]
    pub(crate) fn index(&self, half: usize, key: u32) -> usize {
        self.halves[half].index(key)
    }

    /// Returns the slot at `index`.
    #[inline]
    pub(crate) fn slot(&self, index: usize) -> &Mutex<Slot<V>> {
        &self.slots[index]
    }

    /// Returns the slot at `index` for a thread with exclusive access.
    #[inline]
    fn slot_mut(&mut self, index: usize) -> &mut Slot<V> {
        self.slots[index].get_mut()
    }

    /// Records `key` in the staging chain of its half 0 slot. This is where an
    /// insertion which resumes after a rehash looks for its own key.
    fn park(&mut self, key: u32) {
        let index = self.halves[0].index(key);
        self.slot_mut(index).push_chain_entry(key);
    }

    /// Rebuilds the table, either growing it (if `len` elements puts it at or
    /// over the max load factor, and it is not at max capacity) or reseeding it
    /// at the current size, and then replaying every entry into it.
    ///
    /// Keys in staging chains belong to insertions which are waiting for this
    /// rehash to finish; they are parked again once all entries are placed.
    pub(crate) fn rehash(&mut self, len: u64) {
        self.rehash_with(len, MAX_REDISTRIBUTE_ATTEMPTS);
    }

    /// Rehashes the table as [`Table::rehash`] does, abandoning growth after
    /// `max_attempts` failed redistributions into the grown storage.
    fn rehash_with(&mut self, len: u64, max_attempts: usize) {
        let old_capacity = self.capacity();
        let (entries, chained) = self.drain();

        let should_grow = at_max_load(len, old_capacity) && (old_capacity as u64) < MAX_CAPACITY;
        let entries = if should_grow {
            match self.grow(entries, max_attempts) {
                Ok(()) => None,
                Err(entries) => Some(entries),
            }
        } else {
            Some(entries)
        };

        if let Some(entries) = entries {
            self.reseed_in_place(entries);
        }

        for key in chained {
            self.park(key);
        }

        debug!(
            old_capacity,
            new_capacity = self.capacity(),
            len,
            "cuckoo map rehash complete"
        );
    }

    /// Takes every entry and staging chain key out of the table.
    fn drain(&mut self) -> (Vec<Entry<V>>, Vec<u32>) {
        let mut entries = Vec::new();
        let mut chained = Vec::new();
        let Table { slots, halves } = self;
        for half in halves.iter() {
            half.drain(slots, &mut entries, &mut chained);
        }
        (entries, chained)
    }

    /// Doubles the size of the table and redistributes the `entries` into it.
    /// If the allocation fails, or a placement can't be found within
    /// `max_attempts` reseeds, the previous (empty) storage is restored and the
    /// entries are returned.
    fn grow(&mut self, entries: Vec<Entry<V>>, max_attempts: usize) -> Result<(), Vec<Entry<V>>> {
        match self.capacity().checked_mul(2) {
            Some(new_capacity) => self.grow_to(new_capacity, entries, max_attempts),
            None => Err(entries),
        }
    }

    /// Replaces the (empty) storage with `new_capacity` slots and redistributes
    /// the `entries` into it, restoring the previous storage on failure.
    fn grow_to(
        &mut self,
        new_capacity: usize,
        entries: Vec<Entry<V>>,
        max_attempts: usize,
    ) -> Result<(), Vec<Entry<V>>> {
        let slots = match try_allocate_slots(new_capacity) {
            Ok(slots) => slots,
            Err(err) => {
                warn!(new_capacity, %err, "cuckoo map growth allocation failed, reseeding in place");
                return Err(entries);
            }
        };

        let old_slots = std::mem::replace(&mut self.slots, slots);
        let old_halves = self.halves.clone();
        let half_size = new_capacity / 2;
        self.halves[0].resize(0, half_size);
        self.halves[1].resize(half_size, half_size);

        match self.redistribute(entries, max_attempts) {
            Ok(attempts) => {
                trace!(attempts, new_capacity, "cuckoo map grown");
                Ok(())
            }
            Err(entries) => {
                warn!(
                    new_capacity,
                    attempts = max_attempts,
                    "cuckoo map growth abandoned, reseeding in place"
                );
                self.slots = old_slots;
                self.halves = old_halves;
                Err(entries)
            }
        }
    }

    /// Reseeds both halves and redistributes the `entries`, until every entry
    /// is placed.
    fn reseed_in_place(&mut self, mut entries: Vec<Entry<V>>) {
        loop {
            self.reseed();
            match self.redistribute(entries, MAX_REDISTRIBUTE_ATTEMPTS) {
                Ok(_) => return,
                Err(remaining) => {
                    warn!(
                        capacity = self.capacity(),
                        attempts = MAX_REDISTRIBUTE_ATTEMPTS,
                        "cuckoo map still cycling after reseeding in place"
                    );
                    entries = remaining;
                }
            }
        }
    }

    /// Places all `entries` into the (empty) table, reseeding both halves and
    /// starting again whenever a cuckoo cycle prevents a placement.
    ///
    /// # Returns
    ///
    /// The number of attempts it took on success, otherwise all the entries
    /// after `max_attempts` failed attempts, with the table left empty.
    fn redistribute(
        &mut self,
        mut entries: Vec<Entry<V>>,
        max_attempts: usize,
    ) -> Result<usize, Vec<Entry<V>>> {
        for attempt in 1..=max_attempts {
            match self.try_place_all(entries) {
                Ok(()) => return Ok(attempt),
                Err(remaining) => {
                    trace!(attempt, "cuckoo cycle during redistribution, reseeding");
                    entries = remaining;
                    self.reseed();
                }
            }
        }
        Err(entries)
    }

    /// Tries to place all `entries` with the current hash functions. On a
    /// cycle, every entry (including those already placed) is taken back out
    /// of the table and returned.
    fn try_place_all(&mut self, entries: Vec<Entry<V>>) -> Result<(), Vec<Entry<V>>> {
        let mut pending = entries.into_iter();
        while let Some(entry) = pending.next() {
            if let Placement::Homeless(homeless) = self.insert_exclusive(entry) {
                let (mut entries, _) = self.drain();
                entries.push(homeless);
                entries.extend(pending);
                return Err(entries);
            }
        }
        Ok(())
    }

    /// Inserts the `entry` into the table without locking, alternating between
    /// the halves as entries are displaced.
    fn insert_exclusive(&mut self, entry: Entry<V>) -> Placement<V> {
        let mut in_flight = Some(entry);
        for attempt in 0..MAX_SLOT_ATTEMPTS {
            let key = match &in_flight {
                Some(entry) => entry.key,
                None => return Placement::Placed,
            };
            let index = self.halves[attempt & 1].index(key);
            self.slot_mut(index).swap_no_chain(&mut in_flight);
        }
        match in_flight {
            Some(entry) => Placement::Homeless(entry),
            None => Placement::Placed,
        }
    }

    /// Reseeds both halves.
    fn reseed(&mut self) {
        for half in self.halves.iter_mut() {
            half.reseed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys_in(table: &mut Table<u64>) -> Vec<u32> {
        let mut keys = Vec::new();
        for slot in table.slots.iter_mut() {
            if let Some(entry) = slot.get_mut().entry_mut() {
                keys.push(entry.key);
            }
        }
        keys.sort_unstable();
        keys
    }

    fn fill(table: &mut Table<u64>, keys: std::ops::Range<u32>) {
        let entries = keys.map(|key| Entry::new(key, key as u64 * 10)).collect();
        table.reseed_in_place(entries);
    }

    #[test]
    fn halves_partition_backing_array() {
        let table = Table::<u64>::with_capacity(32);
        assert_eq!(table.capacity(), 32);
        for key in 0..1000u32 {
            let (h0, h1) = table.candidates(key);
            assert!(h0 < 16);
            assert!((16..32).contains(&h1));
            assert_eq!(h0, table.index(0, key));
            assert_eq!(h1, table.index(1, key));
        }
    }

    #[test]
    fn entries_are_found_in_candidate_slots() {
        let mut table = Table::<u64>::with_capacity(64);
        fill(&mut table, 0..16);

        for key in 0..16u32 {
            let (h0, h1) = table.candidates(key);
            let found = [h0, h1].iter().any(|index| table.slot(*index).lock().holds(key));
            assert!(found, "key {} not in a candidate slot", key);
        }
        assert_eq!(keys_in(&mut table), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn rehash_grows_at_load_factor() {
        let mut table = Table::<u64>::with_capacity(32);
        fill(&mut table, 0..16);

        table.rehash(16);
        assert_eq!(table.capacity(), 64);
        assert_eq!(keys_in(&mut table), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn rehash_below_load_factor_reseeds_in_place() {
        let mut table = Table::<u64>::with_capacity(32);
        fill(&mut table, 0..8);

        table.rehash(8);
        assert_eq!(table.capacity(), 32);
        assert_eq!(keys_in(&mut table), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn rehash_preserves_values() {
        let mut table = Table::<u64>::with_capacity(32);
        fill(&mut table, 0..12);
        table.rehash(16);

        for slot in table.slots.iter_mut() {
            if let Some(entry) = slot.get_mut().entry_mut() {
                assert_eq!(entry.value, entry.key as u64 * 10);
            }
        }
    }

    #[test]
    fn rehash_reparks_chained_keys() {
        let mut table = Table::<u64>::with_capacity(32);
        fill(&mut table, 0..4);
        table.slot_mut(3).push_chain_entry(100);
        table.slot_mut(20).push_chain_entry(200);

        table.rehash(4);

        for key in [100u32, 200] {
            let index = table.index(0, key);
            assert!(table.slot_mut(index).chain_contains(key));
        }
        let chained: usize = table.slots.iter_mut().map(|s| s.get_mut().chain_len()).sum();
        assert_eq!(chained, 2);
    }

    #[test]
    fn load_factor_threshold() {
        assert!(!at_max_load(15, 32));
        assert!(at_max_load(16, 32));
        assert!(at_max_load(17, 32));
        assert_eq!(MAX_SLOT_ATTEMPTS, MAX_KICKS + 1);
    }

    #[test]
    fn abandoned_growth_keeps_capacity_and_entries() {
        let mut table = Table::<u64>::with_capacity(32);
        fill(&mut table, 0..16);

        // No redistribution attempts are allowed, so growth is always abandoned.
        table.rehash_with(16, 0);

        assert_eq!(table.capacity(), 32);
        assert_eq!(table.halves[0].size(), 16);
        assert_eq!(table.halves[1].size(), 16);
        assert_eq!(keys_in(&mut table), (0..16).collect::<Vec<_>>());
        for key in 0..16u32 {
            let (h0, h1) = table.candidates(key);
            assert!(h0 < 16 && (16..32).contains(&h1));
            let found = [h0, h1].iter().any(|index| table.slot(*index).lock().holds(key));
            assert!(found, "key {} not in a candidate slot", key);
        }
    }

    #[test]
    fn failed_growth_allocation_restores_storage() {
        let mut table = Table::<u64>::with_capacity(32);
        fill(&mut table, 0..16);
        table.slot_mut(5).push_chain_entry(100);

        let (entries, chained) = table.drain();
        assert_eq!(chained, vec![100]);

        // Far too many slots to ever allocate.
        let entries = match table.grow_to(1 << 62, entries, MAX_REDISTRIBUTE_ATTEMPTS) {
            Ok(()) => panic!("allocation of 2^62 slots succeeded"),
            Err(entries) => entries,
        };
        assert_eq!(entries.len(), 16);
        assert_eq!(table.capacity(), 32);
        assert!(table.halves[1].index(0) >= 16);

        table.reseed_in_place(entries);
        for key in chained {
            table.park(key);
        }
        assert_eq!(table.capacity(), 32);
        assert_eq!(keys_in(&mut table), (0..16).collect::<Vec<_>>());
        let index = table.index(0, 100);
        assert!(table.slot_mut(index).chain_contains(100));
    }

    #[test]
    fn insert_exclusive_reports_homeless_entry() {
        // With a single slot per half, a third key can never be placed.
        let mut table = Table::<u64>::with_capacity(2);
        assert!(matches!(table.insert_exclusive(Entry::new(1, 1)), Placement::Placed));
        assert!(matches!(table.insert_exclusive(Entry::new(2, 2)), Placement::Placed));
        match table.insert_exclusive(Entry::new(3, 3)) {
            Placement::Homeless(entry) => assert!(entry.key >= 1 && entry.key <= 3),
            Placement::Placed => panic!("third key placed in a two slot table"),
        }
    }

    #[test]
    fn redistribute_gives_up_after_max_attempts() {
        let mut table = Table::<u64>::with_capacity(2);
        let entries = (0..3).map(|key| Entry::new(key, key as u64)).collect();
        match table.redistribute(entries, 4) {
            Ok(_) => panic!("three keys placed in a two slot table"),
            Err(entries) => {
                let mut keys: Vec<_> = entries.iter().map(|e| e.key).collect();
                keys.sort_unstable();
                assert_eq!(keys, vec![0, 1, 2]);
            }
        }
        assert!(keys_in(&mut table).is_empty());
    }
}
