//! OS platform abstraction for virtual memory and the monotonic clock.
//!
//! Provides `page_alloc` / `page_dealloc` / `page_decommit` wrapping the
//! platform virtual memory APIs (mmap/madvise on Unix, VirtualAlloc on
//! Windows), and `monotonic_micros` for epoch age stamps.

cfg_if::cfg_if! {
    if #[cfg(miri)] {
        mod miri;
        use miri as imp;
    } else if #[cfg(unix)] {
        mod unix;
        use unix as imp;
    } else if #[cfg(windows)] {
        mod windows;
        use windows as imp;
    }
}

/// Allocate `size` bytes of virtual memory, aligned to the allocator page
/// size. Returns null on failure. Memory is zero-initialized by the OS.
///
/// # Safety
/// Caller must eventually call `page_dealloc` with the returned pointer and
/// the same `size`.
#[inline]
pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    unsafe { imp::page_alloc(size) }
}

/// Free virtual memory previously allocated by `page_alloc`.
///
/// # Safety
/// `ptr` must have been returned by `page_alloc`, and `size` must match the
/// original allocation size.
#[inline]
pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    unsafe { imp::page_dealloc(ptr, size) }
}

/// Decommit pages: drop physical residency but keep the virtual range
/// mapped. On Unix this is madvise(MADV_DONTNEED); on Windows MEM_DECOMMIT.
///
/// Returns `false` if the OS rejected the hint, so callers can count
/// failures. The range stays valid to touch either way; decommitted pages
/// read back as zero.
///
/// # Safety
/// `ptr` and `size` must refer to a range within a live `page_alloc`
/// allocation.
#[inline]
pub unsafe fn page_decommit(ptr: *mut u8, size: usize) -> bool {
    unsafe { imp::page_decommit(ptr, size) }
}

/// Recommit previously decommitted pages.
///
/// # Safety
/// `ptr` and `size` must refer to a range within a live `page_alloc`
/// allocation that was previously decommitted.
#[inline]
pub unsafe fn page_recommit(ptr: *mut u8, size: usize) {
    unsafe { imp::page_recommit(ptr, size) }
}

/// Monotonic clock in microseconds. Used only for epoch metadata (open
/// timestamps and ages), never on allocation paths. Returns 0 where no
/// monotonic source is available (miri).
#[inline]
pub fn monotonic_micros() -> u64 {
    imp::monotonic_micros()
}
