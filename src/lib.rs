//! A concurrent hash map with `u32` keys which uses two-choice cuckoo hashing,
//! with lock-coordinated resizing.
//!
//! All map operations can be used concurrently from any number of threads.
//! The interface has been kept close to `std::collections::HashMap`, with a
//! few differences so that concurrent operations are always correct:
//!
//! * [`CuckooMap::insert`] does not replace an existing value. Inserting a key
//!   which is present returns [`InsertError::DuplicateKey`], which hands the
//!   rejected value back.
//! * [`CuckooMap::get`] returns a clone of the value, and
//!   [`CuckooMap::get_with`] gives a closure access to a reference to it, since
//!   a reference can't outlive the slot lock while other threads move entries.
//! * All methods take `&self`, so the map can be shared with an `Arc`.
//!
//! # Design
//!
//! The map stores its slots in a single array which is split into two halves,
//! each with its own hash function from a universal family. A key can only be
//! in one of two slots, one per half, so lookups lock and check exactly two
//! slots.
//!
//! An insertion which finds the slot in the first half occupied swaps its entry
//! in, and carries the evicted entry to that entry's slot in the other half,
//! and so on, for up to 31 displacements. While an entry is being carried its
//! key is recorded in the *staging chain* of the slot it was evicted from, and
//! a lookup which finds its key in a chain starts again rather than reporting
//! the key as missing.
//!
//! # Resizing
//!
//! When an insertion runs out of displacements, it asks to rehash the map. A
//! single thread is admitted as the rehasher; it takes the exclusive hold on
//! the map, and either doubles the table (when it is at half load, up to
//! `2^32` slots) or draws new hash functions and redistributes every entry in
//! place. All other threads block until the rehash is finished, and then
//! retry.
//!
//! If the allocation for a larger table fails, or the entries can't be placed
//! into it after 1024 reseeds, the map keeps its current size and is reseeded
//! instead, so growth failures are never visible to callers.
//!
//! # Limitations
//!
//! Keys are always `u32`. The map does not support iteration. Operations
//! block under contention, and every operation blocks while a rehash runs.
//!
//! # Logging
//!
//! Rehashes are reported through [`tracing`] at `debug` level, and failed
//! growth at `warn` level. The crate never installs a subscriber.
//!
//! # Examples
//!
//! ```
//! use cuckoomap::CuckooMap;
//! use std::sync::Arc;
//!
//! let map = Arc::new(CuckooMap::new());
//! let threads: Vec<_> = (0..4u32)
//!     .map(|t| {
//!         let map = map.clone();
//!         std::thread::spawn(move || {
//!             for key in t * 100..(t + 1) * 100 {
//!                 map.insert(key, key as u64).unwrap();
//!             }
//!         })
//!     })
//!     .collect();
//! for t in threads {
//!     t.join().unwrap();
//! }
//!
//! assert_eq!(map.len(), 400);
//! assert_eq!(map.get(42), Some(42));
//! assert!(map.insert(42, 0).unwrap_err().is_duplicate());
//! assert_eq!(map.remove(42), Some(42));
//! assert!(!map.contains_key(42));
//! ```

pub mod cuckoomap;
pub mod error;
mod hashfunc;
mod rehash;
mod slot;
mod table;
mod util;

pub use cuckoomap::CuckooMap;
pub use error::{InsertError, Result};
