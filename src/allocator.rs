//! Top-level allocator: one registry, one epoch ring, one pool per size
//! class, and the public surface tying them together.
//!
//! Instances are self-contained: handles from one `EpochAlloc` never
//! validate against another (their registries disagree), and teardown
//! releases every page the instance ever mapped.

use crate::config::PAGE_SIZE;
use crate::epoch::{EpochId, EpochRing, EpochState, LabelBuf};
use crate::handle::Handle;
use crate::platform;
use crate::pool::SizeClassPool;
use crate::registry::SlabRegistry;
use crate::size_class::{self, NUM_SIZE_CLASSES};
use core::fmt;
use core::ptr::NonNull;

/// Why an allocation request failed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllocError {
    /// Size is zero or above the maximum supported object size.
    UnsupportedSize,
    /// The target epoch is CLOSING.
    EpochClosed,
    /// The epoch index is not a valid ring index.
    InvalidEpoch,
    /// Id space exhausted or the OS refused a backing page.
    OutOfMemory,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            AllocError::UnsupportedSize => "unsupported allocation size",
            AllocError::EpochClosed => "epoch is closing",
            AllocError::InvalidEpoch => "epoch index out of range",
            AllocError::OutOfMemory => "out of memory",
        };
        f.write_str(msg)
    }
}

/// Why `epoch_close` refused to run.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CloseError {
    /// The epoch index is not a valid ring index.
    InvalidEpoch,
    /// The epoch is still ACTIVE; advance past it first.
    NotClosing,
}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            CloseError::InvalidEpoch => "epoch index out of range",
            CloseError::NotClosing => "epoch is not closing",
        };
        f.write_str(msg)
    }
}

/// A successful allocation: the slot pointer and the handle that frees it.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Allocation {
    pub ptr: NonNull<u8>,
    pub handle: Handle,
}

/// What one `epoch_close` accomplished.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct CloseReport {
    /// Empty slabs moved off the epoch's lists into the recycle cache.
    pub slabs_reclaimed: usize,
    /// Bytes handed back to the OS via decommit hints.
    pub bytes_decommitted: usize,
    /// Estimated resident bytes before and after the close.
    pub rss_before: usize,
    pub rss_after: usize,
}

/// Number of bytes reserved in front of `malloc`-style allocations to stash
/// the handle.
const PREFIX_BYTES: usize = 8;

/// A lifetime-aware slab allocator instance.
///
/// All methods take `&self`; the type is `Sync` and any thread may allocate,
/// free, or advance epochs concurrently.
pub struct EpochAlloc {
    registry: SlabRegistry,
    ring: EpochRing,
    /// One pool per size class; index 0 is the sentinel class and unused.
    pools: [SizeClassPool; NUM_SIZE_CLASSES],
}

/// Per-process instance counter feeding registry generation salts.
static INSTANCE_SEED: core::sync::atomic::AtomicU32 = core::sync::atomic::AtomicU32::new(0);

impl EpochAlloc {
    pub fn new() -> Self {
        let mut pools = [const { SizeClassPool::new(0) }; NUM_SIZE_CLASSES];
        let mut class = 1;
        while class < NUM_SIZE_CLASSES {
            pools[class] = SizeClassPool::new(class);
            class += 1;
        }
        let registry = SlabRegistry::new();
        // Distinct per instance; an odd multiplier is invertible mod 2^24,
        // so salts stay distinct under the handle's generation mask and
        // handles can never validate against a sibling allocator.
        let seed = INSTANCE_SEED
            .fetch_add(1, core::sync::atomic::Ordering::Relaxed)
            .wrapping_add(1);
        registry.set_salt(seed.wrapping_mul(0x9E37_79B9));
        Self {
            registry,
            ring: EpochRing::new(),
            pools,
        }
    }

    /// Allocate `size` bytes in `epoch`. Fails without side effects on a
    /// CLOSING epoch, an out-of-range size or epoch, or OOM.
    pub fn alloc(&self, size: usize, epoch: EpochId) -> Result<Allocation, AllocError> {
        let class = size_class::size_to_class(size);
        if class == 0 {
            return Err(AllocError::UnsupportedSize);
        }
        if !EpochRing::in_range(epoch) {
            return Err(AllocError::InvalidEpoch);
        }
        let pool = &self.pools[class];
        if self.ring.state(epoch) != EpochState::Active {
            pool.counters
                .slowpath_closed
                .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
            return Err(AllocError::EpochClosed);
        }
        let era = self.ring.era(epoch);
        pool.allocate(epoch, era, &self.registry)
            .map(|(ptr, handle)| Allocation { ptr, handle })
    }

    /// Free a previously-returned handle. Returns `false` for stale,
    /// foreign, double-freed or torn handles; never crashes on any handle
    /// value.
    pub fn free(&self, handle: Handle) -> bool {
        let class = handle.class();
        if class == 0 || class >= NUM_SIZE_CLASSES {
            return false;
        }
        self.pools[class].free(handle, &self.registry)
    }

    /// malloc-style sugar: the handle is stashed in an 8-byte prefix in
    /// front of the returned pointer, so the allocation can be released
    /// with [`free_ptr`](Self::free_ptr) alone. Returns null on failure.
    pub fn malloc(&self, size: usize, epoch: EpochId) -> *mut u8 {
        let Some(total) = size.checked_add(PREFIX_BYTES) else {
            return core::ptr::null_mut();
        };
        match self.alloc(total, epoch) {
            Ok(allocation) => unsafe {
                let base = allocation.ptr.as_ptr();
                base.cast::<u64>().write_unaligned(allocation.handle.raw());
                base.add(PREFIX_BYTES)
            },
            Err(_) => core::ptr::null_mut(),
        }
    }

    /// Free a pointer returned by [`malloc`](Self::malloc).
    ///
    /// # Safety
    /// `ptr` must be null or a value returned by `malloc` on this allocator
    /// that has not been passed to `free_ptr` since. (A double `free_ptr`
    /// reads the prefix of a freed slot; it is rejected unless the slot has
    /// since been reallocated.)
    pub unsafe fn free_ptr(&self, ptr: *mut u8) -> bool {
        if ptr.is_null() {
            return false;
        }
        let raw = unsafe { ptr.sub(PREFIX_BYTES).cast::<u64>().read_unaligned() };
        match Handle::from_raw(raw) {
            Some(handle) => self.free(handle),
            None => false,
        }
    }

    /// Ring index of the currently-ACTIVE epoch.
    #[inline]
    pub fn epoch_current(&self) -> EpochId {
        self.ring.current()
    }

    /// Close the current epoch and activate the next ring slot. Returns the
    /// newly-ACTIVE ring index.
    pub fn epoch_advance(&self) -> EpochId {
        let (closed, activated) = self.ring.advance();
        for pool in &self.pools[1..] {
            pool.clear_current(closed);
        }
        activated
    }

    /// Reclaim an epoch's free slabs and return their pages to the OS. The
    /// epoch must be CLOSING. Closing an already-closed epoch is a no-op
    /// that reports zero reclaimed slabs.
    pub fn epoch_close(&self, epoch: EpochId) -> Result<CloseReport, CloseError> {
        if !EpochRing::in_range(epoch) {
            return Err(CloseError::InvalidEpoch);
        }
        if self.ring.state(epoch) != EpochState::Closing {
            return Err(CloseError::NotClosing);
        }
        let rss_before = self.rss_estimate();
        let mut report = CloseReport {
            rss_before,
            ..CloseReport::default()
        };
        for pool in &self.pools[1..] {
            let (reclaimed, bytes) = pool.close_epoch(epoch, &self.registry);
            report.slabs_reclaimed += reclaimed;
            report.bytes_decommitted += bytes;
        }
        report.rss_after = self.rss_estimate();
        Ok(report)
    }

    /// State of a ring slot.
    pub fn epoch_state(&self, epoch: EpochId) -> EpochState {
        self.ring.state(epoch)
    }

    /// Era currently stamped on a ring slot.
    pub fn epoch_era(&self, epoch: EpochId) -> u64 {
        self.ring.era(epoch)
    }

    pub fn epoch_set_label(&self, epoch: EpochId, label: &str) {
        self.ring.set_label(epoch, label);
    }

    pub fn epoch_label(&self, epoch: EpochId) -> LabelBuf {
        self.ring.label(epoch)
    }

    pub fn epoch_set_label_id(&self, epoch: EpochId, id: u8) {
        self.ring.set_label_id(epoch, id);
    }

    pub fn epoch_inc_refcount(&self, epoch: EpochId) {
        self.ring.refcount_inc(epoch);
    }

    pub fn epoch_dec_refcount(&self, epoch: EpochId) {
        self.ring.refcount_dec(epoch);
    }

    pub fn epoch_get_refcount(&self, epoch: EpochId) -> u32 {
        self.ring.refcount(epoch)
    }

    /// Estimated resident bytes across every pool (mapped minus
    /// decommitted).
    pub fn rss_estimate(&self) -> usize {
        let mut total = 0u64;
        for pool in &self.pools[1..] {
            total += pool
                .counters
                .bytes_committed
                .load(core::sync::atomic::Ordering::Relaxed);
        }
        total as usize
    }

    pub(crate) fn ring(&self) -> &EpochRing {
        &self.ring
    }

    pub(crate) fn registry(&self) -> &SlabRegistry {
        &self.registry
    }

    pub(crate) fn pools(&self) -> &[SizeClassPool] {
        &self.pools
    }
}

impl Default for EpochAlloc {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EpochAlloc {
    fn drop(&mut self) {
        // Every page the instance mapped has a live registry entry (recycled
        // slabs keep theirs, with a bumped generation). This is the only
        // point where slab pages are unmapped.
        for id in 0..self.registry.ids_allocated() {
            let slab = self.registry.slab_ptr(id);
            if !slab.is_null() {
                unsafe { platform::page_dealloc(slab.cast(), PAGE_SIZE) };
            }
        }
        // The registry's own chunk pages are released by its Drop.
    }
}

// SAFETY: all shared state is atomics or SpinMutex-guarded; raw pointers
// refer to pages owned by this instance for its whole lifetime.
unsafe impl Send for EpochAlloc {}
unsafe impl Sync for EpochAlloc {}
