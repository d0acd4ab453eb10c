//! Per-chunk mutual exclusion for the physical write path.
//!
//! A chunk is locked for exactly as long as one flush is writing it. Waiters
//! park on a condition variable and are all woken when any chunk unlocks,
//! then re-check their own key.

use crate::error::Result;
use crate::region::ChunkPos;

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

#[derive(Default)]
pub struct ChunkLocks {
    held: Mutex<HashSet<ChunkPos>>,
    released: Condvar,
}

impl ChunkLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `pos` is free, then takes it.
    pub fn lock(&self, pos: ChunkPos) -> Result<ChunkLockGuard<'_>> {
        let mut held = self.held.lock()?;
        while held.contains(&pos) {
            held = self.released.wait(held)?;
        }
        held.insert(pos);
        Ok(ChunkLockGuard { locks: self, pos })
    }

    /// Takes `pos` if nobody holds it.
    pub fn try_lock(&self, pos: ChunkPos) -> Result<Option<ChunkLockGuard<'_>>> {
        let mut held = self.held.lock()?;
        if !held.insert(pos) {
            return Ok(None);
        }
        Ok(Some(ChunkLockGuard { locks: self, pos }))
    }

    /// Blocks until `pos` is free without taking it.
    pub fn wait_unlocked(&self, pos: ChunkPos) -> Result<()> {
        let mut held = self.held.lock()?;
        while held.contains(&pos) {
            held = self.released.wait(held)?;
        }
        Ok(())
    }

    pub fn is_locked(&self, pos: ChunkPos) -> Result<bool> {
        Ok(self.held.lock()?.contains(&pos))
    }

    pub fn held_count(&self) -> Result<usize> {
        Ok(self.held.lock()?.len())
    }

    fn unlock(&self, pos: ChunkPos) {
        // Recover the set from a poisoned lock; leaving the key in place
        // would wedge every later writer of this chunk.
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&pos);
        drop(held);
        self.released.notify_all();
    }
}

/// Releases its chunk on drop, including when the holder unwinds.
pub struct ChunkLockGuard<'a> {
    locks: &'a ChunkLocks,
    pos: ChunkPos,
}

impl ChunkLockGuard<'_> {
    pub fn pos(&self) -> ChunkPos {
        self.pos
    }
}

impl Drop for ChunkLockGuard<'_> {
    fn drop(&mut self) {
        self.locks.unlock(self.pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_lock_and_release() -> Result<()> {
        let locks = ChunkLocks::new();
        let pos = ChunkPos::new(1, 2);

        let guard = locks.lock(pos)?;
        assert_eq!(guard.pos(), pos);
        assert!(locks.is_locked(pos)?);
        assert!(locks.try_lock(pos)?.is_none());
        assert!(locks.try_lock(ChunkPos::new(2, 1))?.is_some());

        drop(guard);
        assert!(!locks.is_locked(pos)?);
        assert_eq!(locks.held_count()?, 0);
        Ok(())
    }

    #[test]
    fn test_lock_blocks_until_released() {
        let locks = Arc::new(ChunkLocks::new());
        let pos = ChunkPos::new(0, 0);
        let acquired = Arc::new(AtomicBool::new(false));

        let guard = locks.lock(pos).expect("Failed to lock");
        let waiter = {
            let locks = Arc::clone(&locks);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _guard = locks.lock(pos).expect("Failed to lock");
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        drop(guard);
        waiter.join().expect("waiter panicked");
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_exclusive_under_contention() {
        let locks = Arc::new(ChunkLocks::new());
        let pos = ChunkPos::new(-7, 3);
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _guard = locks.lock(pos).expect("Failed to lock");
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("worker panicked");
        }
        assert_eq!(locks.held_count().expect("held"), 0);
    }

    #[test]
    fn test_guard_releases_on_panic() {
        let locks = Arc::new(ChunkLocks::new());
        let pos = ChunkPos::new(9, 9);

        let result = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                let _guard = locks.lock(pos).expect("Failed to lock");
                panic!("write failed mid-flush");
            })
            .join()
        };

        assert!(result.is_err());
        assert!(!locks.is_locked(pos).expect("is_locked"));
        locks.wait_unlocked(pos).expect("wait");
    }
}
