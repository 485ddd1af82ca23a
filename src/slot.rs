//! Storage cells for the map, and the staging chains which keep displaced keys
//! visible to lookups while they are being moved.

/// A key-value pair stored in a [`Slot`], or carried by an insertion while it
/// looks for a home.
#[derive(Debug)]
pub(crate) struct Entry<V> {
    /// The key for the entry.
    pub(crate) key: u32,
    /// The value associated with the key.
    pub(crate) value: V,
}

impl<V> Entry<V> {
    /// Creates a new entry from the `key` and `value`.
    pub(crate) fn new(key: u32, value: V) -> Entry<V> {
        Entry { key, value }
    }
}

/// A node in the staging chain of a [`Slot`]. Each node records a key which
/// was evicted from the slot and has not yet been confirmed in its new home.
///
/// Only the key is recorded. Lookups which find a key in a chain retry rather
/// than read from the chain, so the value stays with the insertion carrying it.
#[derive(Debug)]
struct ChainNode {
    key: u32,
    next: Option<Box<ChainNode>>,
}

/// A single cell of the table.
///
/// Every method here must only be called while the slot's lock is held (or
/// through exclusive access to the whole table during a rehash). The slot
/// never takes any lock itself.
#[derive(Debug)]
pub(crate) struct Slot<V> {
    /// The entry for the slot, `None` when the slot is free.
    entry: Option<Entry<V>>,
    /// Head of the staging chain of keys displaced out of this slot.
    chain: Option<Box<ChainNode>>,
}

impl<V> Default for Slot<V> {
    fn default() -> Slot<V> {
        Slot {
            entry: None,
            chain: None,
        }
    }
}

impl<V> Slot<V> {
    /// Returns true if the slot is occupied by `key`. Chains are not checked.
    #[inline]
    pub(crate) fn holds(&self, key: u32) -> bool {
        matches!(&self.entry, Some(entry) if entry.key == key)
    }

    /// Returns true if the slot is free.
    #[cfg(test)]
    pub(crate) fn is_free(&self) -> bool {
        self.entry.is_none()
    }

    /// Returns a mutable reference to the slot's entry.
    #[inline]
    pub(crate) fn entry_mut(&mut self) -> &mut Option<Entry<V>> {
        &mut self.entry
    }

    /// Takes the entry out of the slot, leaving it free.
    #[inline]
    pub(crate) fn take(&mut self) -> Option<Entry<V>> {
        self.entry.take()
    }

    /// Exchanges the entry in this slot with `incoming`. If the slot was
    /// occupied, the evicted key (which `incoming` now holds) is pushed onto the
    /// front of this slot's staging chain, so that a concurrent lookup for it
    /// still sees it as present until the displacement completes.
    ///
    /// # Arguments
    ///
    /// * `incoming` - The entry to store. On return, holds the previous
    ///                occupant, or `None` if the slot was free.
    pub(crate) fn swap_with(&mut self, incoming: &mut Option<Entry<V>>) {
        self.swap_no_chain(incoming);
        if let Some(evicted) = incoming {
            self.push_chain_entry(evicted.key);
        }
    }

    /// Exchanges the entry in this slot with `incoming` without recording the
    /// evicted key. Only valid when no other thread can observe the table.
    #[inline]
    pub(crate) fn swap_no_chain(&mut self, incoming: &mut Option<Entry<V>>) {
        std::mem::swap(&mut self.entry, incoming);
    }

    /// Pushes `key` onto the front of the staging chain.
    pub(crate) fn push_chain_entry(&mut self, key: u32) {
        let next = self.chain.take();
        self.chain = Some(Box::new(ChainNode { key, next }));
    }

    /// Removes the first chain entry for `key`, if there is one.
    pub(crate) fn remove_chain_entry(&mut self, key: u32) {
        let mut link = &mut self.chain;
        while link.as_ref().is_some_and(|node| node.key != key) {
            if let Some(node) = link {
                link = &mut node.next;
            }
        }
        if let Some(node) = link.take() {
            *link = node.next;
        }
    }

    /// Returns true if `key` is in the staging chain.
    pub(crate) fn chain_contains(&self, key: u32) -> bool {
        let mut link = &self.chain;
        while let Some(node) = link {
            if node.key == key {
                return true;
            }
            link = &node.next;
        }
        false
    }

    /// Detaches every key from the staging chain, appending them to `keys`.
    pub(crate) fn drain_chain(&mut self, keys: &mut Vec<u32>) {
        let mut link = self.chain.take();
        while let Some(mut node) = link {
            keys.push(node.key);
            link = node.next.take();
        }
    }

    /// Returns the number of keys in the staging chain.
    #[cfg(test)]
    pub(crate) fn chain_len(&self) -> usize {
        let mut len = 0;
        let mut link = &self.chain;
        while let Some(node) = link {
            len += 1;
            link = &node.next;
        }
        len
    }
}

impl<V> Drop for Slot<V> {
    fn drop(&mut self) {
        // Unlink iteratively so that a long chain can't overflow the stack.
        let mut link = self.chain.take();
        while let Some(mut node) = link {
            link = node.next.take();
        }
    }
}
