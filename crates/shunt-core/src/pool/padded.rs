//! Cache-line isolated sequence counter.

use std::sync::atomic::{AtomicU64, Ordering};

/// A 64-bit monotonic counter that owns an entire cache line.
///
/// [`RingPool`](super::RingPool) keeps one of these for the producer side
/// and one for the consumer side. If both sequences shared a line, every
/// producer increment would invalidate the consumer's cached copy and vice
/// versa, even though the two values are logically independent (false
/// sharing). The `align(64)` attribute places the value at the start of its
/// own line and the trailing filler keeps any neighbouring field off it, so
/// two adjacent `PaddedCounter`s never touch the same line.
#[repr(C, align(64))]
pub struct PaddedCounter {
    value: AtomicU64,
    _filler: [u8; 56],
}

// Layout check: exactly one line, line-aligned.
const _: () = assert!(std::mem::size_of::<PaddedCounter>() == 64);
const _: () = assert!(std::mem::align_of::<PaddedCounter>() == 64);

impl PaddedCounter {
    /// Creates a counter starting at `initial`.
    #[must_use]
    pub const fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
            _filler: [0; 56],
        }
    }

    /// Returns the current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Unconditionally stores `new`.
    pub fn set(&self, new: u64) {
        self.value.store(new, Ordering::Release);
    }

    /// Atomically adds `n` and returns the previous value.
    #[inline]
    pub fn fetch_add(&self, n: u64) -> u64 {
        self.value.fetch_add(n, Ordering::AcqRel)
    }

    /// Atomically replaces `expected` with `new`.
    ///
    /// Returns `true` if the counter held `expected` and the swap happened.
    pub fn compare_and_set(&self, expected: u64, new: u64) -> bool {
        self.value
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl std::fmt::Debug for PaddedCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PaddedCounter").field(&self.get()).finish()
    }
}
