use crate::probe::cpu_count;
use std::collections::HashMap;
use std::mem;
use std::sync::{Mutex, PoisonError};

/// A fixed arena of stream slot indices.
///
/// Applications that run one stream per worker use the pool to hand out
/// slot numbers (and with them, backing file names) without a central
/// registry. A slot is either free, held by a live [`PoolSlot`] guard,
/// or parked: handed to another process and waiting for that process to
/// be reaped. Parking keys are folded to 16 bits to match the range an
/// exit-status channel can carry.
pub struct MfdPool {
    state: Mutex<PoolState>,
    capacity: usize,
}

struct PoolState {
    free: Vec<usize>,
    parked: HashMap<u16, Vec<usize>>,
}

/// Guard for one acquired slot. Dropping it returns the slot to the
/// pool; [`MfdPool::pre_release`] instead parks it under a process key.
pub struct PoolSlot<'pool> {
    pool: &'pool MfdPool,
    index: usize,
}

impl MfdPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                // Reversed so acquisition hands out low indices first.
                free: (0..capacity).rev().collect(),
                parked: HashMap::new(),
            }),
            capacity,
        }
    }

    /// One slot per online CPU.
    pub fn with_default_capacity() -> Self {
        Self::new(cpu_count())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots neither held nor parked.
    pub fn available(&self) -> usize {
        self.lock_state().free.len()
    }

    /// Claim a free slot, or `None` when every slot is held or parked.
    pub fn acquire(&self) -> Option<PoolSlot<'_>> {
        let index = self.lock_state().free.pop()?;
        Some(PoolSlot { pool: self, index })
    }

    /// Park `slot` under the key of a process that now owns it. The slot
    /// stays out of circulation until [`finalize_release`] is called with
    /// the same key, typically after the process has been reaped.
    ///
    /// [`finalize_release`]: Self::finalize_release
    pub fn pre_release(&self, slot: PoolSlot<'_>, pid: u32) {
        assert!(
            std::ptr::eq(slot.pool, self),
            "slot belongs to a different pool"
        );
        let key = (pid & 0xffff) as u16;
        self.lock_state().parked.entry(key).or_default().push(slot.index);
        // The guard must not run its drop; the slot is parked, not free.
        mem::forget(slot);
    }

    /// Return every slot parked under `pid` to circulation. Returns how
    /// many slots were reclaimed; 0 when the key holds nothing.
    pub fn finalize_release(&self, pid: u32) -> usize {
        let key = (pid & 0xffff) as u16;
        let mut state = self.lock_state();
        match state.parked.remove(&key) {
            Some(indices) => {
                let count = indices.len();
                state.free.extend(indices);
                count
            }
            None => 0,
        }
    }

    fn release(&self, index: usize) {
        self.lock_state().free.push(index);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        // A panic while holding the lock leaves plain index lists behind,
        // which stay valid.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PoolSlot<'_> {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for PoolSlot<'_> {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_exhausted() {
        let pool = MfdPool::new(2);
        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        assert_eq!(first.index(), 0, "Low indices are handed out first");
        assert_eq!(second.index(), 1);
        assert!(
            pool.acquire().is_none(),
            "An exhausted pool should hand out nothing"
        );
    }

    #[test]
    fn test_dropped_slots_return_to_the_pool() {
        let pool = MfdPool::new(1);
        let slot = pool.acquire().unwrap();
        assert_eq!(pool.available(), 0);

        drop(slot);
        assert_eq!(pool.available(), 1, "Dropping the guard frees the slot");
        assert_eq!(pool.acquire().unwrap().index(), 0);
    }

    #[test]
    fn test_pre_release_parks_until_finalized() {
        let pool = MfdPool::new(1);
        let slot = pool.acquire().unwrap();
        pool.pre_release(slot, 4242);

        assert_eq!(pool.available(), 0, "A parked slot is not free");
        assert!(pool.acquire().is_none());

        assert_eq!(pool.finalize_release(4242), 1);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.acquire().unwrap().index(), 0);
    }

    #[test]
    fn test_finalize_with_unknown_pid_reclaims_nothing() {
        let pool = MfdPool::new(4);
        assert_eq!(pool.finalize_release(777), 0);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_pid_keys_fold_to_sixteen_bits() {
        let pool = MfdPool::new(2);
        let slot = pool.acquire().unwrap();
        pool.pre_release(slot, 0x0001_0005);

        assert_eq!(
            pool.finalize_release(0x0005),
            1,
            "Keys compare by their low 16 bits"
        );
    }

    #[test]
    fn test_multiple_slots_park_under_one_key() {
        let pool = MfdPool::new(3);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.pre_release(a, 9);
        pool.pre_release(b, 9);

        assert_eq!(pool.available(), 1);
        assert_eq!(pool.finalize_release(9), 2);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_default_capacity_tracks_cpus() {
        let pool = MfdPool::with_default_capacity();
        assert_eq!(pool.capacity(), cpu_count());
        assert!(pool.capacity() >= 1);
    }
}
