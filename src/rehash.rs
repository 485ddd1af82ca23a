//! Coordination for the single thread which is allowed to rehash the map.

use atomic::Atomic;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::Ordering;

/// The state of the rehash protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RehashState {
    /// No thread is rehashing, operations proceed under the shared lock.
    Idle,
    /// A single thread has been admitted to rehash the map. It may still be
    /// waiting for the exclusive lock.
    Rehashing,
}

/// Gate which admits a single rehashing thread, and which blocks every other
/// thread that needs to wait for the rehash to finish.
///
/// The state, not the map's reader/writer lock, is what guarantees that there
/// is only one rehasher: the admitted thread releases its shared hold on the
/// table before acquiring the exclusive hold, and other threads may interleave
/// in between.
pub(crate) struct RehashGate {
    state: Atomic<RehashState>,
    /// Held while the state moves back to idle, and while waiting for it to.
    lock: Mutex<()>,
    idle: Condvar,
}

impl Default for RehashGate {
    fn default() -> RehashGate {
        RehashGate {
            state: Atomic::new(RehashState::Idle),
            lock: Mutex::new(()),
            idle: Condvar::new(),
        }
    }
}

impl RehashGate {
    /// Tries to move from idle to rehashing. Returns true if the calling thread
    /// is now the rehasher, and must call [`RehashGate::finish`] when done.
    pub(crate) fn try_begin(&self) -> bool {
        self.state
            .compare_exchange(
                RehashState::Idle,
                RehashState::Rehashing,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Moves back to idle and wakes every waiting thread.
    pub(crate) fn finish(&self) {
        let _guard = self.lock.lock();
        self.state.store(RehashState::Idle, Ordering::Release);
        self.idle.notify_all();
    }

    /// Returns true if a rehash is in progress.
    #[inline]
    pub(crate) fn is_rehashing(&self) -> bool {
        self.state.load(Ordering::Acquire) == RehashState::Rehashing
    }

    /// Blocks until no rehash is in progress. The caller must not hold any
    /// lock on the table.
    pub(crate) fn wait_idle(&self) {
        if !self.is_rehashing() {
            return;
        }

        let mut guard = self.lock.lock();
        while self.is_rehashing() {
            self.idle.wait(&mut guard);
        }
    }
}
