//! Miri platform shim backed by std::alloc.
//!
//! Miri cannot execute mmap or madvise, so pages come from the system
//! allocator instead. The decommit hint is emulated by zero-filling the
//! range: a decommitted page on Linux reads back as zeroes, and the
//! empty-queue drain's zeroed-header recovery paths only get exercised
//! under Miri if the shim behaves the same way.

extern crate alloc;

use core::alloc::Layout;

use crate::config::PAGE_SIZE;

fn page_layout(size: usize) -> Layout {
    // All callers request multiples of the allocator page, which is a
    // power of two; this cannot fail for them.
    Layout::from_size_align(size, PAGE_SIZE).expect("bad page layout")
}

pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    unsafe { alloc::alloc::alloc_zeroed(page_layout(size)) }
}

pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    unsafe { alloc::alloc::dealloc(ptr, page_layout(size)) };
}

pub unsafe fn page_decommit(ptr: *mut u8, size: usize) -> bool {
    // The kernel would drop the physical pages and fault in zeroes on the
    // next touch; the closest observable equivalent is an immediate wipe.
    unsafe { core::ptr::write_bytes(ptr, 0, size) };
    true
}

pub unsafe fn page_recommit(_ptr: *mut u8, _size: usize) {}

pub fn monotonic_micros() -> u64 {
    0
}
