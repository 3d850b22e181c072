//! Pre-allocated pool of direct byte buffers.
//!
//! Every buffer the hot path reads into comes from here. All memory is
//! allocated once at startup; acquire and release are bounded lock-free
//! scans over an atomic slot array, so a worker thread never allocates and
//! never blocks while shuttling bytes.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Alignment of every pooled buffer. Matches the cache line so reads and
/// writes never straddle a line boundary at the buffer head.
const BUFFER_ALIGN: usize = 64;

/// A fixed-capacity byte buffer backed by a raw aligned allocation.
///
/// The Rust rendition of a direct buffer: the storage is requested straight
/// from the global allocator with an explicit layout, handed out by pointer,
/// and untouched by any container growth logic. `len` tracks how many bytes
/// of the capacity are filled.
pub struct DirectBuf {
    ptr: NonNull<u8>,
    cap: usize,
    len: usize,
}

// SAFETY: the buffer exclusively owns its allocation; moving it between
// threads moves that ownership with it.
unsafe impl Send for DirectBuf {}

impl DirectBuf {
    /// Allocates a zeroed buffer of `cap` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `cap` is zero or the layout is invalid.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        assert!(cap > 0, "buffer capacity must be > 0");
        let layout = Layout::from_size_align(cap, BUFFER_ALIGN).expect("valid buffer layout");
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout);
        };
        Self { ptr, cap, len: 0 }
    }

    /// Total capacity in bytes.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.cap
    }

    /// Number of filled bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` when no bytes are filled.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Resets the filled region to empty. The storage is not zeroed.
    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Records that the first `len` bytes now hold data.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the capacity.
    #[inline]
    pub fn set_filled(&mut self, len: usize) {
        assert!(len <= self.cap, "filled length exceeds buffer capacity");
        self.len = len;
    }

    /// The filled region.
    #[inline]
    #[must_use]
    pub fn filled(&self) -> &[u8] {
        // SAFETY: `len <= cap` and the allocation was zero-initialized, so
        // the first `len` bytes are always initialized.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The whole capacity as a writable slice, for reading from a socket.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the allocation is `cap` bytes and zero-initialized.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.cap) }
    }
}

impl Drop for DirectBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.cap, BUFFER_ALIGN).expect("valid buffer layout");
        // SAFETY: `ptr` came from `alloc_zeroed` with this exact layout and
        // is freed exactly once, here.
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

impl std::fmt::Debug for DirectBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectBuf")
            .field("capacity", &self.cap)
            .field("len", &self.len)
            .finish()
    }
}

/// Fixed-size pool of identical [`DirectBuf`]s.
///
/// Slots are raw atomic pointers. `acquire` swaps the first occupied slot
/// to empty and takes ownership of the buffer; `release` CAS-installs the
/// buffer into the first empty slot. Both are O(pool size) worst case with
/// a bounded number of steps per slot, never block, and never allocate.
pub struct DirectBufferPool {
    slots: Box<[AtomicPtr<DirectBuf>]>,
    buffer_capacity: usize,
}

impl DirectBufferPool {
    /// Allocates `pool_size` buffers of `buffer_capacity` bytes each.
    ///
    /// All allocation happens here; the pool never grows or shrinks.
    ///
    /// # Panics
    ///
    /// Panics if either argument is zero.
    #[must_use]
    pub fn new(pool_size: usize, buffer_capacity: usize) -> Self {
        assert!(pool_size > 0, "pool size must be > 0");
        let slots = (0..pool_size)
            .map(|_| AtomicPtr::new(Box::into_raw(Box::new(DirectBuf::new(buffer_capacity)))))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            buffer_capacity,
        }
    }

    /// Takes a buffer out of the pool, cleared and ready for a fresh read.
    ///
    /// Returns `None` when every slot is empty (all buffers in flight).
    #[must_use]
    pub fn acquire(&self) -> Option<DirectBuf> {
        for slot in self.slots.iter() {
            let raw = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !raw.is_null() {
                // SAFETY: the swap transferred sole ownership of the boxed
                // buffer from the slot to us.
                let mut buf = *unsafe { Box::from_raw(raw) };
                buf.clear();
                return Some(buf);
            }
        }
        None
    }

    /// Returns a buffer to the first empty slot.
    ///
    /// If no slot is empty the buffer is dropped; the pool is sized at
    /// least as large as the number of concurrent in-flight reads, so a
    /// full pool means the buffer was not one of ours to begin with.
    pub fn release(&self, mut buf: DirectBuf) {
        debug_assert_eq!(buf.capacity(), self.buffer_capacity);
        buf.clear();
        let raw = Box::into_raw(Box::new(buf));
        for slot in self.slots.iter() {
            if slot
                .compare_exchange(std::ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
        // SAFETY: no slot accepted the pointer, so we still own it.
        drop(unsafe { Box::from_raw(raw) });
    }

    /// Acquires a buffer behind a guard that releases it on drop.
    ///
    /// The hot path uses this so every exit path, early returns and error
    /// branches included, hands the buffer back.
    #[must_use]
    pub fn lease(&self) -> Option<BufLease<'_>> {
        self.acquire().map(|buf| BufLease {
            pool: self,
            buf: Some(buf),
        })
    }

    /// Number of slots.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.slots.len()
    }

    /// Capacity of each pooled buffer in bytes.
    #[must_use]
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Buffers currently resting in the pool. Snapshot only.
    #[must_use]
    pub fn available(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !slot.load(Ordering::Acquire).is_null())
            .count()
    }
}

impl Drop for DirectBufferPool {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let raw = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !raw.is_null() {
                // SAFETY: `&mut self` excludes concurrent pool users; the
                // slot held the only pointer to this buffer.
                drop(unsafe { Box::from_raw(raw) });
            }
        }
    }
}

impl std::fmt::Debug for DirectBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectBufferPool")
            .field("pool_size", &self.pool_size())
            .field("buffer_capacity", &self.buffer_capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// Scoped handle to a pooled buffer; returns it to the pool on drop.
pub struct BufLease<'a> {
    pool: &'a DirectBufferPool,
    buf: Option<DirectBuf>,
}

impl Deref for BufLease<'_> {
    type Target = DirectBuf;

    fn deref(&self) -> &DirectBuf {
        self.buf.as_ref().expect("lease holds a buffer until drop")
    }
}

impl DerefMut for BufLease<'_> {
    fn deref_mut(&mut self) -> &mut DirectBuf {
        self.buf.as_mut().expect("lease holds a buffer until drop")
    }
}

impl Drop for BufLease<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_hands_out_cleared_buffers() {
        let pool = DirectBufferPool::new(2, 128);
        let mut buf = pool.acquire().unwrap();
        assert_eq!(buf.capacity(), 128);
        assert!(buf.is_empty());

        buf.as_mut_slice()[..5].copy_from_slice(b"hello");
        buf.set_filled(5);
        assert_eq!(buf.filled(), b"hello");

        pool.release(buf);
        let buf = pool.acquire().unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_pool_exhaustion_returns_none() {
        let pool = DirectBufferPool::new(2, 64);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_balanced_acquire_release_leaks_nothing() {
        let pool = Arc::new(DirectBufferPool::new(8, 64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for _ in 0..1_000 {
                    if let Some(buf) = pool.acquire() {
                        pool.release(buf);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn test_lease_releases_on_every_exit_path() {
        let pool = DirectBufferPool::new(1, 64);
        {
            let mut lease = pool.lease().unwrap();
            lease.as_mut_slice()[0] = 1;
            lease.set_filled(1);
            assert!(pool.lease().is_none());
        }
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_release_to_full_pool_discards() {
        let pool = DirectBufferPool::new(1, 64);
        let stray = DirectBuf::new(64);
        pool.release(stray);
        assert_eq!(pool.available(), 1);
    }
}
