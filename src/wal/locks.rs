//! Non-blocking shared/exclusive locks for the WAL.
//!
//! Every lock is a single atomic word:
//!
//! ```text
//!  0   unlocked
//!  n   held shared by n connections
//! -1   held exclusively
//! ```
//!
//! Acquisition never waits. A conflicting request fails with `Error::Busy`
//! and the caller decides whether to retry.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::common::{Error, Result};

use super::WAL_NREADER;

const EXCLUSIVE: i32 = -1;

#[derive(Debug, Default)]
pub struct LockSlot {
    state: AtomicI32,
}

impl LockSlot {
    pub const fn new() -> Self {
        Self {
            state: AtomicI32::new(0),
        }
    }

    /// # Errors
    /// Returns `Error::Busy` if the slot is held exclusively.
    pub fn try_lock_shared(&self) -> Result<()> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == EXCLUSIVE {
                return Err(Error::Busy);
            }
            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// # Errors
    /// Returns `Error::Busy` if the slot is held in any mode.
    pub fn try_lock_exclusive(&self) -> Result<()> {
        self.state
            .compare_exchange(0, EXCLUSIVE, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::Busy)
    }

    pub fn unlock_shared(&self) {
        let prev = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "shared unlock of a slot not held shared");
    }

    pub fn unlock_exclusive(&self) {
        let prev = self.state.swap(0, Ordering::AcqRel);
        debug_assert_eq!(prev, EXCLUSIVE, "exclusive unlock of a slot not held exclusively");
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) != 0
    }
}

/// The lock table shared by every connection to one WAL.
#[derive(Debug, Default)]
pub struct WalLocks {
    /// Held exclusively by the single writer.
    pub writer: LockSlot,
    /// Held exclusively while a checkpoint runs.
    pub checkpointer: LockSlot,
    /// Held exclusively while the index is rebuilt from the log.
    pub recover: LockSlot,
    /// One per read mark. Readers hold theirs shared; writers and
    /// checkpointers take them exclusively to change or inspect a mark.
    pub read: [LockSlot; WAL_NREADER],
}

impl WalLocks {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_shared_locks_stack() {
        let slot = LockSlot::new();
        slot.try_lock_shared().unwrap();
        slot.try_lock_shared().unwrap();
        assert!(matches!(slot.try_lock_exclusive(), Err(Error::Busy)));

        slot.unlock_shared();
        assert!(slot.is_locked());
        slot.unlock_shared();
        assert!(!slot.is_locked());
        slot.try_lock_exclusive().unwrap();
    }

    #[test]
    fn test_exclusive_blocks_everything() {
        let slot = LockSlot::new();
        slot.try_lock_exclusive().unwrap();
        assert!(matches!(slot.try_lock_shared(), Err(Error::Busy)));
        assert!(matches!(slot.try_lock_exclusive(), Err(Error::Busy)));
        slot.unlock_exclusive();
        slot.try_lock_shared().unwrap();
    }

    #[test]
    fn test_single_exclusive_winner() {
        let slot = Arc::new(LockSlot::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let slot = Arc::clone(&slot);
                thread::spawn(move || slot.try_lock_exclusive().is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_lock_table_layout() {
        let locks = WalLocks::new();
        assert_eq!(locks.read.len(), WAL_NREADER);
        locks.read[3].try_lock_exclusive().unwrap();
        locks.read[4].try_lock_exclusive().unwrap();
        assert!(!locks.writer.is_locked());
    }
}
