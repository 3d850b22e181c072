//! Ring-buffer pool with padded producer/consumer sequences.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use super::connection::BackendConnection;
use super::padded::PaddedCounter;
use super::ConnectionPool;

/// Disruptor-style ring of connection slots.
///
/// Capacity is rounded up to the next power of two so `seq & mask` replaces
/// the modulo on every hot-path index computation. The producer sequence
/// (release/offer side) and consumer sequence (acquire side) live in
/// [`PaddedCounter`]s on distinct cache lines, so the two sides never
/// invalidate each other's cached sequence.
///
/// Unlike [`ScanCasPool`](super::ScanCasPool), a borrowed connection leaves
/// the ring entirely and is re-inserted on release, so `size` shrinks while
/// connections are out on loan.
pub struct RingPool {
    ring: Box<[Atomic<Arc<BackendConnection>>]>,
    capacity: usize,
    mask: usize,
    consumer: PaddedCounter,
    producer: PaddedCounter,
}

impl RingPool {
    /// Creates an empty ring, rounding `requested` up to a power of two.
    ///
    /// # Panics
    ///
    /// Panics if `requested` is zero.
    #[must_use]
    pub fn new(requested: usize) -> Self {
        assert!(requested > 0, "pool capacity must be > 0");
        let capacity = requested.next_power_of_two();
        let ring = (0..capacity)
            .map(|_| Atomic::null())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            ring,
            capacity,
            mask: capacity - 1,
            consumer: PaddedCounter::new(0),
            producer: PaddedCounter::new(0),
        }
    }

    /// Installs `cell` into the first empty slot at or after `idx`.
    ///
    /// Returns the cell on failure so the caller decides its fate. Forward
    /// probing keeps a connection in the bag even when its primary slot was
    /// taken while it was out of the ring.
    fn install<'g>(
        &self,
        idx: usize,
        mut cell: Shared<'g, Arc<BackendConnection>>,
        guard: &'g Guard,
    ) -> Result<(), Shared<'g, Arc<BackendConnection>>> {
        for i in 0..self.capacity {
            let probe = (idx + i) & self.mask;
            match self.ring[probe].compare_exchange(
                Shared::null(),
                cell,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => return Ok(()),
                Err(e) => cell = e.new,
            }
        }
        Err(cell)
    }
}

impl ConnectionPool for RingPool {
    fn acquire(&self) -> Option<Arc<BackendConnection>> {
        let guard = epoch::pin();
        for _ in 0..self.capacity {
            let seq = self.consumer.fetch_add(1);
            let idx = seq as usize & self.mask;

            let taken = self.ring[idx].swap(Shared::null(), Ordering::AcqRel, &guard);
            if taken.is_null() {
                continue;
            }
            // SAFETY: we own the swapped-out cell; the pin keeps it valid
            // while we inspect it.
            let conn = unsafe { taken.deref() };
            if conn.try_acquire() {
                let conn = Arc::clone(conn);
                // SAFETY: the cell is no longer reachable from the ring.
                unsafe { guard.defer_destroy(taken) };
                return Some(conn);
            }
            // Extracted but not Idle (Busy borrower elsewhere, or Stale
            // awaiting the janitor): put it back and keep spinning.
            if let Err(orphan) = self.install(idx, taken, &guard) {
                // Ring completely full with this cell still in hand; park
                // the connection Busy so it is never left Idle outside the
                // pool.
                // SAFETY: as above, we own the cell.
                unsafe { orphan.deref() }.try_acquire();
                unsafe { guard.defer_destroy(orphan) };
            }
        }
        None
    }

    fn release(&self, conn: Arc<BackendConnection>) {
        if !conn.release() {
            // Not held Busy by the caller; refuse to publish it.
            return;
        }
        let guard = epoch::pin();
        let seq = self.producer.fetch_add(1);
        let idx = seq as usize & self.mask;
        let cell = Owned::new(conn).into_shared(&guard);
        if let Err(orphan) = self.install(idx, cell, &guard) {
            // Logically impossible in steady state: more releases than the
            // ring holds. Take the connection back out of circulation.
            // SAFETY: install returned ownership of the cell to us.
            unsafe { orphan.deref() }.try_acquire();
            unsafe { guard.defer_destroy(orphan) };
        }
    }

    fn offer(&self, conn: Arc<BackendConnection>) -> bool {
        let guard = epoch::pin();
        let seq = self.producer.fetch_add(1);
        let idx = seq as usize & self.mask;
        let cell = Owned::new(conn).into_shared(&guard);
        match self.install(idx, cell, &guard) {
            Ok(()) => true,
            Err(orphan) => {
                // SAFETY: ownership came back to us; drop the rejected cell.
                drop(unsafe { orphan.into_owned() });
                false
            }
        }
    }

    fn remove(&self, conn: &Arc<BackendConnection>) -> bool {
        let guard = epoch::pin();
        for slot in self.ring.iter() {
            let shared = slot.load(Ordering::Acquire, &guard);
            // SAFETY: guard-pinned dereference; removal elsewhere defers
            // destruction past this pin.
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
                // SAFETY: the CAS unlinked the cell.
                unsafe { guard.defer_destroy(shared) };
                return true;
            }
        }
        false
    }

    fn size(&self) -> usize {
        let guard = epoch::pin();
        self.ring
            .iter()
            .filter(|slot| !slot.load(Ordering::Acquire, &guard).is_null())
            .count()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for RingPool {
    fn drop(&mut self) {
        // SAFETY: `&mut self` excludes concurrent pool users, so the
        // unprotected guard cannot race a pinned reader.
        let guard = unsafe { epoch::unprotected() };
        for slot in self.ring.iter() {
            let shared = slot.swap(Shared::null(), Ordering::AcqRel, guard);
            if !shared.is_null() {
                // SAFETY: sole owner of the swapped-out cell.
                drop(unsafe { shared.into_owned() });
            }
        }
    }
}

impl std::fmt::Debug for RingPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingPool")
            .field("size", &self.size())
            .field("capacity", &self.capacity)
            .finish()
    }
}
