//! Allocation and sizing helpers for the table's backing storage.

use crate::slot::Slot;
use parking_lot::Mutex;
use std::collections::TryReserveError;

/// Allocates `count` free, unlocked slots.
///
/// Unlike `vec!`, this reports allocation failure to the caller rather than
/// aborting, so that a failed growth can fall back to the existing storage.
pub(crate) fn try_allocate_slots<V>(count: usize) -> Result<Vec<Mutex<Slot<V>>>, TryReserveError> {
    let mut slots = Vec::new();
    slots.try_reserve_exact(count)?;
    slots.resize_with(count, Default::default);
    Ok(slots)
}

/// Rounds `capacity` up to a power of two which is at least `min`.
#[inline]
pub(crate) fn round_capacity(capacity: usize, min: usize) -> usize {
    capacity.max(min).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_free_slots() {
        let slots = try_allocate_slots::<u64>(64).unwrap();
        assert_eq!(slots.len(), 64);
        assert!(slots.iter().all(|slot| slot.lock().is_free()));
    }

    #[test]
    fn allocation_failure_is_reported() {
        assert!(try_allocate_slots::<u64>(usize::MAX / 2).is_err());
    }

    #[test]
    fn capacity_rounding() {
        assert_eq!(round_capacity(0, 32), 32);
        assert_eq!(round_capacity(33, 32), 64);
        assert_eq!(round_capacity(64, 32), 64);
        assert_eq!(round_capacity(1000, 32), 1024);
    }
}
