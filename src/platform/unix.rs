//! Unix virtual memory implementation using mmap/madvise, plus
//! clock_gettime for the monotonic clock.

use core::ffi::c_void;

use crate::config::PAGE_SIZE;

const PROT_READ: i32 = 0x1;
const PROT_WRITE: i32 = 0x2;
const MAP_PRIVATE: i32 = 0x02;
const MAP_ANONYMOUS: i32 = 0x20;
const MAP_FAILED: *mut c_void = !0usize as *mut c_void;
const MADV_DONTNEED: i32 = 4;

const CLOCK_MONOTONIC: i32 = 1;

#[repr(C)]
struct Timespec {
    tv_sec: i64,
    tv_nsec: i64,
}

unsafe extern "C" {
    fn mmap(
        addr: *mut c_void,
        length: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    ) -> *mut c_void;

    fn munmap(addr: *mut c_void, length: usize) -> i32;

    fn madvise(addr: *mut c_void, length: usize, advice: i32) -> i32;

    fn clock_gettime(clockid: i32, tp: *mut Timespec) -> i32;
}

pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    // Slab headers sit at the page base and handle decoding rebuilds slot
    // addresses from that base, so it must be PAGE_SIZE-aligned. mmap only
    // promises system-page alignment (4 KiB on Linux, while the allocator
    // page defaults to 8 KiB): reserve one extra allocator page, keep the
    // first aligned window inside the reservation, and hand back the rest.
    let reserve = size + PAGE_SIZE;
    let raw = unsafe {
        mmap(
            core::ptr::null_mut(),
            reserve,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if raw == MAP_FAILED {
        return core::ptr::null_mut();
    }

    let base = raw as usize;
    let window = (base + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let lead = window - base;
    let tail = reserve - lead - size;
    if lead > 0 {
        unsafe { munmap(base as *mut c_void, lead) };
    }
    if tail > 0 {
        unsafe { munmap((window + size) as *mut c_void, tail) };
    }

    window as *mut u8
}

pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    unsafe { munmap(ptr as *mut c_void, size) };
}

pub unsafe fn page_decommit(ptr: *mut u8, size: usize) -> bool {
    unsafe { madvise(ptr as *mut c_void, size, MADV_DONTNEED) == 0 }
}

pub unsafe fn page_recommit(ptr: *mut u8, size: usize) {
    // madvise MADV_DONTNEED doesn't unmap; touching the pages again
    // automatically recommits them. Nothing to do.
    let _ = (ptr, size);
}

pub fn monotonic_micros() -> u64 {
    let mut ts = Timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { clock_gettime(CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    (ts.tv_sec as u64) * 1_000_000 + (ts.tv_nsec as u64) / 1_000
}
