//! Synchronization primitives for the allocator, plus stable per-thread
//! identity.
//!
//! The class mutex serializes list surgery and empty-queue harvests, and the
//! design wants every acquisition classified as fast (uncontended) or
//! contended without any clock calls. Instead of wrapping a general-purpose
//! lock and probing it from the outside, [`SpinMutex`] is that probe: the
//! one-shot CAS that classifies the acquisition is also the acquisition
//! itself, and the two counters live next to the lock word. The core is
//! no_std and must never allocate on a lock path, so the state is a single
//! `AtomicBool` plus the counters.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A test-and-set spin mutex that classifies and counts its acquisitions.
///
/// `lock()` attempts exactly one CAS; success is tallied as a fast
/// acquisition, anything else as contended before falling into the spin
/// loop. The counts feed the per-class lock statistics directly.
pub struct SpinMutex<T> {
    locked: AtomicBool,
    fast: AtomicU64,
    contended: AtomicU64,
    data: UnsafeCell<T>,
}

impl<T> SpinMutex<T> {
    pub const fn new(val: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            fast: AtomicU64::new(0),
            contended: AtomicU64::new(0),
            data: UnsafeCell::new(val),
        }
    }

    /// Acquire the mutex, tallying the acquisition as fast or contended.
    #[inline]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        if self.grab() {
            self.fast.fetch_add(1, Ordering::Relaxed);
        } else {
            self.contended.fetch_add(1, Ordering::Relaxed);
            self.lock_contended();
        }
        SpinMutexGuard { owner: self }
    }

    /// Acquire only if the mutex is free right now. Counted as a fast
    /// acquisition; failures are not counted (the caller never waited).
    #[inline]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        if self.grab() {
            self.fast.fetch_add(1, Ordering::Relaxed);
            Some(SpinMutexGuard { owner: self })
        } else {
            None
        }
    }

    /// (fast acquisitions, contended acquisitions) so far.
    pub fn contention(&self) -> (u64, u64) {
        (
            self.fast.load(Ordering::Relaxed),
            self.contended.load(Ordering::Relaxed),
        )
    }

    /// The one-shot classifying CAS.
    #[inline]
    fn grab(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[cold]
    fn lock_contended(&self) {
        loop {
            // Wait with plain loads; retry the CAS only after observing the
            // lock free.
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    #[inline]
    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

/// RAII guard for [`SpinMutex`]. Releases the lock on drop.
pub struct SpinMutexGuard<'a, T> {
    owner: &'a SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.owner.data.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.owner.data.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.owner.release();
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "nightly")] {
        #[thread_local]
        static THREAD_ANCHOR: u8 = 0;

        /// A stable identifier for the calling thread.
        ///
        /// The address of a thread-local is unique per live thread and never
        /// changes, which is all the allocator needs: owner-thread checks in
        /// epoch domains and a scan-offset seed for contention diffusion.
        #[inline]
        pub fn thread_id() -> usize {
            core::ptr::from_ref(&THREAD_ANCHOR) as usize
        }
    } else if #[cfg(feature = "std")] {
        std::thread_local! {
            static THREAD_ANCHOR: u8 = const { 0 };
        }

        /// A stable identifier for the calling thread.
        ///
        /// The address of a thread-local is unique per live thread and never
        /// changes, which is all the allocator needs: owner-thread checks in
        /// epoch domains and a scan-offset seed for contention diffusion.
        #[inline]
        pub fn thread_id() -> usize {
            THREAD_ANCHOR
                .try_with(|anchor| core::ptr::from_ref(anchor) as usize)
                .unwrap_or(0)
        }
    } else {
        /// Without TLS support every thread reports id 0: owner checks pass
        /// trivially and scan offsets collapse to sequential order.
        #[inline]
        pub fn thread_id() -> usize {
            0
        }
    }
}

/// Mix a thread id into a well-spread seed for scan-offset derivation.
///
/// Thread ids are addresses and therefore aligned; multiply by a golden-ratio
/// constant so the high bits vary between threads.
#[inline]
pub fn thread_seed() -> usize {
    thread_id().wrapping_mul(0x9E37_79B9_7F4A_7C15)
}
