#![no_std]
#![cfg_attr(feature = "nightly", feature(thread_local))]

//! epochalloc: a lifetime-aware slab allocator for small fixed-size objects.
//!
//! Allocations made during the same application-defined phase (an *epoch*)
//! land in the same physical pages, so an entire phase can be reclaimed as a
//! unit. The design has three layers:
//! - Per-size-class slab pools with a lock-free fast path (bitmap CAS against
//!   a published current-partial slab)
//! - A 16-slot epoch ring with ACTIVE/CLOSING lifecycle states and a
//!   monotonic era counter
//! - A slab registry providing ABA-safe 64-bit handles via per-slab
//!   generation counters
//!
//! Emptied slabs are recycled continuously through a lock-free queue;
//! `epoch_close` additionally returns physical pages to the OS with a
//! decommit hint while retaining the virtual mappings, so stale handles
//! never fault.
//!
//! # Usage
//!
//! ```ignore
//! let alloc = epochalloc::EpochAlloc::new();
//! let e = alloc.epoch_current();
//! let a = alloc.alloc(128, e).unwrap();
//! assert!(alloc.free(a.handle));
//! alloc.epoch_advance();
//! alloc.epoch_close(e).unwrap();
//! ```

#[cfg(test)]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod allocator;
pub mod config;
#[cfg(any(feature = "std", feature = "nightly"))]
pub mod domain;
pub mod epoch;
pub mod handle;
pub mod platform;
pub mod pool;
pub mod registry;
pub mod size_class;
pub mod slab;
pub mod stats;
pub mod sync;

pub use allocator::{AllocError, Allocation, CloseError, CloseReport, EpochAlloc};
pub use config::{EPOCH_COUNT, PAGE_SHIFT, PAGE_SIZE};
#[cfg(any(feature = "std", feature = "nightly"))]
pub use domain::EpochDomain;
pub use epoch::{EpochId, EpochState};
pub use handle::Handle;
