//! Errors returned by [`CuckooMap`](crate::CuckooMap) operations.

use thiserror::Error;

/// Result type for insertions into a [`CuckooMap`](crate::CuckooMap).
pub type Result<T, V> = std::result::Result<T, InsertError<V>>;

/// Error for a failed insertion. Both variants hand back the key and value
/// which were not stored, so that the value is never lost.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum InsertError<V> {
    /// The key is already in the map. The stored value is left unchanged.
    #[error("key {key} is already present in the map")]
    DuplicateKey { key: u32, value: V },

    /// The insertion could not find a slot after the max number of rehashes.
    ///
    /// The entry returned is the one which was left without a slot, which is
    /// not necessarily the one which was passed to the insertion: the
    /// insertion may have stored its own entry by displacing this one. Either
    /// way, the returned entry is no longer in the map.
    #[error("no slot found for key {key} after the max number of rehashes")]
    RetriesExhausted { key: u32, value: V },
}

impl<V> InsertError<V> {
    /// Returns the key which was not stored.
    pub fn key(&self) -> u32 {
        match self {
            InsertError::DuplicateKey { key, .. } | InsertError::RetriesExhausted { key, .. } => *key,
        }
    }

    /// Consumes the error, returning the value which was not stored.
    pub fn into_value(self) -> V {
        match self {
            InsertError::DuplicateKey { value, .. } | InsertError::RetriesExhausted { value, .. } => {
                value
            }
        }
    }

    /// Returns true if the error is for a key which is already present.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, InsertError::DuplicateKey { .. })
    }
}
