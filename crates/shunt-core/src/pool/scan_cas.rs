//! Slot-array pool claimed by a rotating CAS scan.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Owned, Shared};

use super::connection::BackendConnection;
use super::ConnectionPool;

/// Fixed-size slot array; borrowers claim an idle connection by winning its
/// Idle -> Busy CAS in place.
///
/// The slot array never moves a connection on acquire or release: the state
/// CAS alone decides ownership, and the rotating start index spreads
/// contending borrowers across the array instead of piling them onto slot
/// zero. `offer` scans from index zero, which concentrates connections at
/// low indices over time; a known, minor contention hotspot.
pub struct ScanCasPool {
    slots: Box<[Atomic<Arc<BackendConnection>>]>,
    count: AtomicUsize,
    capacity: usize,
    scan_index: AtomicUsize,
}

impl ScanCasPool {
    /// Creates an empty pool with `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "pool capacity must be > 0");
        let slots = (0..capacity)
            .map(|_| Atomic::null())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            count: AtomicUsize::new(0),
            capacity,
            scan_index: AtomicUsize::new(0),
        }
    }
}

impl ConnectionPool for ScanCasPool {
    fn acquire(&self) -> Option<Arc<BackendConnection>> {
        let guard = epoch::pin();
        let start = self.scan_index.fetch_add(1, Ordering::Relaxed) % self.capacity;

        for i in 0..self.capacity {
            let idx = (start + i) % self.capacity;
            let shared = self.slots[idx].load(Ordering::Acquire, &guard);
            // SAFETY: the slot cell stays allocated while the guard is
            // pinned; `remove` defers destruction past every active pin.
            if let Some(conn) = unsafe { shared.as_ref() } {
                if conn.try_acquire() {
                    // The connection stays in its slot; the Busy state is
                    // what keeps other borrowers off it.
                    return Some(Arc::clone(conn));
                }
            }
        }
        None
    }

    fn release(&self, conn: Arc<BackendConnection>) {
        // The connection never left its slot, so a successful Busy -> Idle
        // transition is the entire hand-back. A failed transition means the
        // caller did not hold it Busy; leave the pool untouched.
        let _ = conn.release();
    }

    fn offer(&self, conn: Arc<BackendConnection>) -> bool {
        let guard = epoch::pin();
        let mut owned = Owned::new(conn);
        for slot in self.slots.iter() {
            match slot.compare_exchange(
                Shared::null(),
                owned,
                Ordering::AcqRel,
                Ordering::Acquire,
                &guard,
            ) {
                Ok(_) => {
                    self.count.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(e) => owned = e.new,
            }
        }
        // Pool full; dropping `owned` drops the offered reference.
        false
    }

    fn remove(&self, conn: &Arc<BackendConnection>) -> bool {
        let guard = epoch::pin();
        for slot in self.slots.iter() {
            let shared = slot.load(Ordering::Acquire, &guard);
            // SAFETY: guard-pinned dereference, as in `acquire`.
            let hit = unsafe { shared.as_ref() }.is_some_and(|c| Arc::ptr_eq(c, conn));
            if hit
                && slot
                    .compare_exchange(
                        shared,
                        Shared::null(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        &guard,
                    )
                    .is_ok()
            {
                self.count.fetch_sub(1, Ordering::Relaxed);
                // SAFETY: the CAS made the cell unreachable from the slot
                // array; destruction waits for concurrent readers to unpin.
                unsafe { guard.defer_destroy(shared) };
                return true;
            }
        }
        false
    }

    fn size(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for ScanCasPool {
    fn drop(&mut self) {
        // SAFETY: `&mut self` excludes concurrent pool users, so the
        // unprotected guard cannot race a pinned reader.
        let guard = unsafe { epoch::unprotected() };
        for slot in self.slots.iter() {
            let shared = slot.swap(Shared::null(), Ordering::AcqRel, guard);
            if !shared.is_null() {
                // SAFETY: sole owner of the swapped-out cell.
                drop(unsafe { shared.into_owned() });
            }
        }
    }
}

impl std::fmt::Debug for ScanCasPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanCasPool")
            .field("size", &self.size())
            .field("capacity", &self.capacity)
            .finish()
    }
}
