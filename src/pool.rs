//! Per-size-class slab pools: the allocator's hot paths.
//!
//! Each pool owns every slab of its class. Allocation reads the epoch's
//! published current-partial slab and claims a bitmap slot lock-free; the
//! slow path runs under the class mutex and harvests the empty queue,
//! consults the recycle cache, or maps a new page. Frees are lock-free
//! except for FULL->PARTIAL list moves.
//!
//! Recycling is continuous: a free that empties a slab pushes it onto the
//! lock-free empty queue, and any later mutex holder drains the queue into
//! the cache. Coupling recycling to epoch close instead would turn
//! long-lived epochs under churn into slow-path lock convoys; liveness here
//! must not depend on reclamation policy.

use crate::allocator::AllocError;
use crate::config::{
    CACHE_CAPACITY, EPOCH_COUNT, PAGE_SIZE, SCAN_DISABLE_PERMILLE, SCAN_DWELL_HEARTBEATS,
    SCAN_ENABLE_PERMILLE, SCAN_HEARTBEAT_MASK,
};
use crate::epoch::EpochId;
use crate::handle::Handle;
use crate::platform;
use crate::registry::SlabRegistry;
use crate::slab::{FreeOutcome, ListTag, Slab, SlabList};
use crate::sync::{SpinMutex, thread_seed};
use core::ptr;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering, fence};

/// Per-class observability counters. All loads and stores are relaxed; the
/// pool's own synchronization provides correctness ordering, these are
/// monitoring only.
pub struct ClassCounters {
    /// Allocation requests routed to this class.
    pub allocs: AtomicU64,
    /// Successful frees.
    pub frees: AtomicU64,
    /// Frees rejected as stale/foreign/double.
    pub free_invalid: AtomicU64,
    /// Allocations that entered the slow path.
    pub slowpath_hits: AtomicU64,
    /// Allocations rejected because the epoch was CLOSING.
    pub slowpath_closed: AtomicU64,
    /// Fresh pages mapped from the OS.
    pub new_pages: AtomicU64,
    /// Slabs adopted from the recycle cache.
    pub cache_pops: AtomicU64,
    /// Slabs adopted from the overflow list.
    pub overflow_pops: AtomicU64,
    /// Pushes onto the lock-free empty queue.
    pub empty_pushes: AtomicU64,
    /// Slabs taken off the empty queue by a harvest.
    pub empty_harvests: AtomicU64,
    /// Emptied slabs placed into the bounded cache.
    pub recycled_to_cache: AtomicU64,
    /// Emptied slabs spilled to the overflow list.
    pub recycled_to_overflow: AtomicU64,
    /// Decommit hints issued.
    pub decommit_calls: AtomicU64,
    /// Bytes covered by successful decommit hints.
    pub decommit_bytes: AtomicU64,
    /// Decommit hints the OS rejected.
    pub decommit_failures: AtomicU64,
    /// Bitmap claim attempts on the allocation path.
    pub alloc_cas_attempts: AtomicU64,
    /// Failed bitmap CASes on the allocation path.
    pub alloc_cas_retries: AtomicU64,
    /// Failed bitmap CASes on the free path.
    pub free_cas_retries: AtomicU64,
    /// Fast-path attempts to retire a full current-partial pointer.
    pub current_cas_attempts: AtomicU64,
    /// Lost races on those attempts.
    pub current_cas_failures: AtomicU64,
    /// Zombie partial repairs (free_count/bitmap disagreement).
    pub zombie_repairs: AtomicU64,
    /// Pages this pool has ever mapped.
    pub pages_mapped: AtomicU64,
    /// Estimated resident bytes (mapped minus decommitted).
    pub bytes_committed: AtomicU64,
}

impl ClassCounters {
    const fn new() -> Self {
        Self {
            allocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            free_invalid: AtomicU64::new(0),
            slowpath_hits: AtomicU64::new(0),
            slowpath_closed: AtomicU64::new(0),
            new_pages: AtomicU64::new(0),
            cache_pops: AtomicU64::new(0),
            overflow_pops: AtomicU64::new(0),
            empty_pushes: AtomicU64::new(0),
            empty_harvests: AtomicU64::new(0),
            recycled_to_cache: AtomicU64::new(0),
            recycled_to_overflow: AtomicU64::new(0),
            decommit_calls: AtomicU64::new(0),
            decommit_bytes: AtomicU64::new(0),
            decommit_failures: AtomicU64::new(0),
            alloc_cas_attempts: AtomicU64::new(0),
            alloc_cas_retries: AtomicU64::new(0),
            free_cas_retries: AtomicU64::new(0),
            current_cas_attempts: AtomicU64::new(0),
            current_cas_failures: AtomicU64::new(0),
            zombie_repairs: AtomicU64::new(0),
            pages_mapped: AtomicU64::new(0),
            bytes_committed: AtomicU64::new(0),
        }
    }

    #[inline]
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn add(counter: &AtomicU64, val: u64) {
        counter.fetch_add(val, Ordering::Relaxed);
    }
}

/// Adaptive bitmap-scan state. Mode decisions happen on heartbeats sampled
/// from the allocation counter at power-of-two boundaries, so no clocks are
/// involved; the dwell counter provides hysteresis against flapping.
struct ScanControl {
    randomized: AtomicBool,
    last_attempts: AtomicU64,
    last_retries: AtomicU64,
    dwell: AtomicU32,
}

impl ScanControl {
    const fn new() -> Self {
        Self {
            randomized: AtomicBool::new(false),
            last_attempts: AtomicU64::new(0),
            last_retries: AtomicU64::new(0),
            dwell: AtomicU32::new(0),
        }
    }
}

/// A slab parked in the bounded recycle cache. The header of a decommitted
/// entry is gone (the kernel zeroes the page lazily), so the cache records
/// identity here rather than in the page.
#[derive(Clone, Copy)]
struct CachedSlab {
    page: *mut u8,
    id: u32,
    decommitted: bool,
}

impl CachedSlab {
    const fn vacant() -> Self {
        Self {
            page: ptr::null_mut(),
            id: 0,
            decommitted: false,
        }
    }
}

/// List state guarded by the class mutex.
pub(crate) struct PoolLists {
    partial: [SlabList; EPOCH_COUNT],
    full: [SlabList; EPOCH_COUNT],
    cache: [CachedSlab; CACHE_CAPACITY],
    cache_len: usize,
    overflow: SlabList,
}

// SAFETY: PoolLists is only accessed through the pool's SpinMutex. The raw
// pointers refer to pages that outlive any thread.
unsafe impl Send for PoolLists {}

impl PoolLists {
    const fn new() -> Self {
        Self {
            partial: [const { SlabList::new(ListTag::Partial) }; EPOCH_COUNT],
            full: [const { SlabList::new(ListTag::Full) }; EPOCH_COUNT],
            cache: [CachedSlab::vacant(); CACHE_CAPACITY],
            cache_len: 0,
            overflow: SlabList::new(ListTag::Overflow),
        }
    }
}

/// Pool state for one size class.
pub struct SizeClassPool {
    /// Size class index this pool manages.
    class: usize,
    /// Per-epoch publication pointer: the slab allocations should try first.
    current: [AtomicPtr<Slab>; EPOCH_COUNT],
    /// Head of the lock-free empty-slab stack. Producers are free paths;
    /// the sole consumer is whoever holds the class mutex.
    empty_head: AtomicPtr<Slab>,
    lists: SpinMutex<PoolLists>,
    pub(crate) counters: ClassCounters,
    scan: ScanControl,
}

impl SizeClassPool {
    pub const fn new(class: usize) -> Self {
        Self {
            class,
            current: [const { AtomicPtr::new(ptr::null_mut()) }; EPOCH_COUNT],
            empty_head: AtomicPtr::new(ptr::null_mut()),
            lists: SpinMutex::new(PoolLists::new()),
            counters: ClassCounters::new(),
            scan: ScanControl::new(),
        }
    }

    #[inline]
    pub fn class(&self) -> usize {
        self.class
    }

    /// Allocate one slot in `epoch`. `era` is stamped onto any slab adopted
    /// on the way. The caller has already verified the epoch is ACTIVE.
    #[inline]
    pub fn allocate(
        &self,
        epoch: EpochId,
        era: u64,
        registry: &SlabRegistry,
    ) -> Result<(NonNull<u8>, Handle), AllocError> {
        let n = self.counters.allocs.fetch_add(1, Ordering::Relaxed);
        if n & SCAN_HEARTBEAT_MASK == 0 {
            self.scan_heartbeat();
        }

        let cur = self.current[epoch as usize].load(Ordering::Acquire);
        if !cur.is_null() {
            let slab = unsafe { &*cur };
            if let Some(out) = self.try_claim(slab) {
                return Ok(out);
            }
            // The published slab raced to full. Retire the pointer so other
            // fast paths skip straight to the slow path.
            ClassCounters::inc(&self.counters.current_cas_attempts);
            if self.current[epoch as usize]
                .compare_exchange(cur, ptr::null_mut(), Ordering::Relaxed, Ordering::Relaxed)
                .is_err()
            {
                ClassCounters::inc(&self.counters.current_cas_failures);
            }
        }

        self.allocate_slow(epoch, era, registry)
    }

    /// One bitmap claim attempt against `slab`, with CAS accounting.
    #[inline]
    fn try_claim(&self, slab: &Slab) -> Option<(NonNull<u8>, Handle)> {
        let mut retries = 0;
        let slot = slab.try_allocate(self.scan_start(slab), &mut retries);
        ClassCounters::add(&self.counters.alloc_cas_retries, retries);
        match slot {
            Some(slot) => {
                ClassCounters::add(&self.counters.alloc_cas_attempts, retries + 1);
                let handle = Handle::pack(
                    slab.slab_id,
                    slab.generation.load(Ordering::Relaxed),
                    slot,
                    self.class,
                );
                Some((unsafe { NonNull::new_unchecked(slab.slot_ptr(slot)) }, handle))
            }
            None => {
                ClassCounters::add(&self.counters.alloc_cas_attempts, retries);
                None
            }
        }
    }

    #[cold]
    fn allocate_slow(
        &self,
        epoch: EpochId,
        era: u64,
        registry: &SlabRegistry,
    ) -> Result<(NonNull<u8>, Handle), AllocError> {
        ClassCounters::inc(&self.counters.slowpath_hits);
        let mut lists = self.lists.lock();

        // Another thread may have published a usable slab while we waited.
        let cur = self.current[epoch as usize].load(Ordering::Acquire);
        if !cur.is_null() {
            if let Some(out) = self.try_claim(unsafe { &*cur }) {
                return Ok(out);
            }
            let _ = self.current[epoch as usize].compare_exchange(
                cur,
                ptr::null_mut(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }

        unsafe { self.harvest_empty_queue(&mut lists, registry, None) };

        loop {
            // Publish the first usable partial-list slab.
            loop {
                let head = lists.partial[epoch as usize].head();
                if head.is_null() {
                    break;
                }
                if unsafe { (*head).free_count.load(Ordering::Relaxed) } == 0 {
                    unsafe { self.move_to_full(&mut lists, head) };
                    continue;
                }
                unsafe { (*head).published = true };
                self.current[epoch as usize].store(head, Ordering::Release);
                let slab = unsafe { &*head };
                if let Some(out) = self.try_claim(slab) {
                    return Ok(out);
                }
                // free_count reported free slots but a full sweep found
                // none. Re-check for stability before treating it as a
                // zombie; an in-flight allocation elsewhere resolves in a
                // couple of instructions.
                fence(Ordering::Acquire);
                if slab.free_count.load(Ordering::Relaxed) > 0
                    && slab.allocated_slots() == slab.slot_count
                {
                    ClassCounters::inc(&self.counters.zombie_repairs);
                }
                self.current[epoch as usize].store(ptr::null_mut(), Ordering::Relaxed);
                unsafe { self.move_to_full(&mut lists, head) };
            }

            let slab = self.adopt_fresh_slab(&mut lists, epoch, era, registry)?;
            unsafe { (*slab).published = true };
            self.current[epoch as usize].store(slab, Ordering::Release);
            if let Some(out) = self.try_claim(unsafe { &*slab }) {
                return Ok(out);
            }
            // Every slot of a fresh slab was raced away; go around again.
        }
    }

    /// Move a slab from its epoch's partial list to the full list.
    ///
    /// # Safety
    /// Caller holds the class mutex and `slab` is on the partial list.
    unsafe fn move_to_full(&self, lists: &mut PoolLists, slab: *mut Slab) {
        unsafe {
            let epoch = (*slab).epoch as usize;
            lists.partial[epoch].detach(slab);
            lists.full[epoch].attach(slab);
        }
    }

    /// Obtain a slab for `epoch`: recycle cache first, then overflow, then
    /// a fresh OS page. The slab is initialized, attached to the epoch's
    /// partial list and tagged, but not yet published.
    fn adopt_fresh_slab(
        &self,
        lists: &mut PoolLists,
        epoch: EpochId,
        era: u64,
        registry: &SlabRegistry,
    ) -> Result<*mut Slab, AllocError> {
        let slab = if lists.cache_len > 0 {
            lists.cache_len -= 1;
            let entry = lists.cache[lists.cache_len];
            lists.cache[lists.cache_len] = CachedSlab::vacant();
            ClassCounters::inc(&self.counters.cache_pops);
            if entry.decommitted {
                // Unix recommits on first touch; Windows needs the explicit
                // call before the header rebuild below writes to the page.
                unsafe { platform::page_recommit(entry.page, PAGE_SIZE) };
                ClassCounters::add(&self.counters.bytes_committed, PAGE_SIZE as u64);
            }
            // The registry entry stayed live across the cache; its
            // generation was bumped on the way in, so handles minted from
            // this incarnation are fresh.
            let generation = registry.generation(entry.id);
            unsafe { Slab::init(entry.page, entry.id, generation, self.class, epoch, era) }
        } else if !lists.overflow.is_empty() {
            let slab = unsafe { lists.overflow.take_head() };
            ClassCounters::inc(&self.counters.overflow_pops);
            let id = unsafe { (*slab).slab_id };
            let generation = registry.generation(id);
            unsafe { Slab::init(slab.cast(), id, generation, self.class, epoch, era) }
        } else {
            let page = unsafe { platform::page_alloc(PAGE_SIZE) };
            if page.is_null() {
                return Err(AllocError::OutOfMemory);
            }
            let Some(id) = registry.allocate_id() else {
                // Never registered, so unmapping here doesn't violate the
                // pages-stay-mapped rule.
                unsafe { platform::page_dealloc(page, PAGE_SIZE) };
                return Err(AllocError::OutOfMemory);
            };
            let generation = registry.generation(id);
            let slab = unsafe { Slab::init(page, id, generation, self.class, epoch, era) };
            registry.publish(id, slab);
            ClassCounters::inc(&self.counters.new_pages);
            ClassCounters::inc(&self.counters.pages_mapped);
            ClassCounters::add(&self.counters.bytes_committed, PAGE_SIZE as u64);
            slab
        };

        unsafe { lists.partial[epoch as usize].attach(slab) };
        Ok(slab)
    }

    /// Free the slot named by a registry-validated handle.
    pub fn free(&self, handle: Handle, registry: &SlabRegistry) -> bool {
        let Some(slab_ptr) = registry.lookup(handle.slab_id(), handle.generation()) else {
            ClassCounters::inc(&self.counters.free_invalid);
            return false;
        };
        let slab = unsafe { &*slab_ptr };
        if slab.class as usize != self.class {
            // Generation matched but the class bits disagree: torn handle.
            ClassCounters::inc(&self.counters.free_invalid);
            return false;
        }

        let mut retries = 0;
        let outcome = slab.free_slot(handle.slot(), &mut retries);
        ClassCounters::add(&self.counters.free_cas_retries, retries);
        match outcome {
            FreeOutcome::Invalid => {
                ClassCounters::inc(&self.counters.free_invalid);
                false
            }
            FreeOutcome::Freed {
                was_full,
                now_empty,
            } => {
                ClassCounters::inc(&self.counters.frees);
                if was_full {
                    let mut lists = self.lists.lock();
                    // Recheck under the mutex; a harvest may have moved it.
                    unsafe {
                        if (*slab_ptr).list == ListTag::Full {
                            let epoch = (*slab_ptr).epoch as usize;
                            lists.full[epoch].detach(slab_ptr);
                            lists.partial[epoch].attach(slab_ptr);
                        }
                    }
                }
                if now_empty {
                    self.push_empty(slab_ptr);
                }
                true
            }
        }
    }

    /// Push a just-emptied slab onto the lock-free empty queue. Safe for
    /// concurrent producers; the flag swap keeps each slab enqueued at most
    /// once.
    fn push_empty(&self, slab_ptr: *mut Slab) {
        let slab = unsafe { &*slab_ptr };
        if slab.on_empty_queue.swap(true, Ordering::AcqRel) {
            return;
        }
        ClassCounters::inc(&self.counters.empty_pushes);
        let mut head = self.empty_head.load(Ordering::Relaxed);
        loop {
            slab.next_empty.store(head, Ordering::Relaxed);
            match self.empty_head.compare_exchange_weak(
                head,
                slab_ptr,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }
    }

    /// Detach the whole empty queue and recycle each slab into the cache or
    /// overflow list. `close_epoch` marks a close-time drain: slabs of that
    /// epoch may be decommitted even if they were published, because the
    /// caller has asserted reclamation is safe.
    ///
    /// Returns (slabs recycled for `close_epoch`, bytes decommitted for it).
    ///
    /// # Safety
    /// Caller holds the class mutex (`lists` is the guarded state).
    unsafe fn harvest_empty_queue(
        &self,
        lists: &mut PoolLists,
        registry: &SlabRegistry,
        close_epoch: Option<EpochId>,
    ) -> (usize, usize) {
        let mut reclaimed = 0;
        let mut bytes = 0;
        let mut chain = self.empty_head.swap(ptr::null_mut(), Ordering::Acquire);
        while !chain.is_null() {
            let slab_ptr = chain;
            let slab = unsafe { &*slab_ptr };
            chain = slab.next_empty.load(Ordering::Relaxed);
            slab.next_empty.store(ptr::null_mut(), Ordering::Relaxed);
            ClassCounters::inc(&self.counters.empty_harvests);

            // A close may have recycled this slab straight off its list
            // while it sat in the queue; a decommitted header reads as
            // zeroes. Validate identity through the registry before
            // trusting any header field.
            if registry.slab_ptr(slab.slab_id) != slab_ptr {
                continue;
            }
            if !matches!(slab.list, ListTag::Partial | ListTag::Full) {
                slab.on_empty_queue.store(false, Ordering::Relaxed);
                continue;
            }
            slab.on_empty_queue.store(false, Ordering::Relaxed);
            // Emptied slabs can be refilled before harvest; empty queue
            // entries are hints, not ownership.
            if slab.free_count.load(Ordering::Relaxed) != slab.slot_count {
                continue;
            }

            let slab_epoch = slab.epoch;
            // Never recycle a slab that is still published: lock-free
            // claimants may be mid-claim against it. It stays on its list
            // and is re-pushed when it empties again after unpublication.
            if self.current[slab_epoch as usize].load(Ordering::Relaxed) == slab_ptr {
                continue;
            }

            let decommit_ok = !slab.published || close_epoch == Some(slab_epoch);
            let freed = unsafe { self.recycle(lists, slab_ptr, registry, decommit_ok) };
            if close_epoch == Some(slab_epoch) {
                reclaimed += 1;
                bytes += freed;
            }
        }
        (reclaimed, bytes)
    }

    /// Move an empty slab off its list into the cache (or overflow), bumping
    /// its registry generation so surviving handles fail validation. Returns
    /// the number of bytes decommitted (0 or PAGE_SIZE).
    ///
    /// # Safety
    /// Caller holds the class mutex; `slab_ptr` is an empty slab on the
    /// partial or full list.
    unsafe fn recycle(
        &self,
        lists: &mut PoolLists,
        slab_ptr: *mut Slab,
        registry: &SlabRegistry,
        decommit_ok: bool,
    ) -> usize {
        unsafe {
            let epoch = (*slab_ptr).epoch as usize;
            match (*slab_ptr).list {
                ListTag::Partial => lists.partial[epoch].detach(slab_ptr),
                ListTag::Full => lists.full[epoch].detach(slab_ptr),
                _ => {}
            }

            let id = (*slab_ptr).slab_id;
            let new_generation = registry.bump_generation(id);
            (*slab_ptr).generation.store(new_generation, Ordering::Relaxed);

            if lists.cache_len < CACHE_CAPACITY {
                // Header writes must precede the decommit hint; afterwards
                // any touch of the page would recommit it.
                (*slab_ptr).list = ListTag::Cache;
                let mut decommitted = false;
                if decommit_ok {
                    ClassCounters::inc(&self.counters.decommit_calls);
                    if platform::page_decommit(slab_ptr.cast(), PAGE_SIZE) {
                        ClassCounters::add(&self.counters.decommit_bytes, PAGE_SIZE as u64);
                        self.counters
                            .bytes_committed
                            .fetch_sub(PAGE_SIZE as u64, Ordering::Relaxed);
                        decommitted = true;
                    } else {
                        ClassCounters::inc(&self.counters.decommit_failures);
                    }
                }
                lists.cache[lists.cache_len] = CachedSlab {
                    page: slab_ptr.cast(),
                    id,
                    decommitted,
                };
                lists.cache_len += 1;
                ClassCounters::inc(&self.counters.recycled_to_cache);
                if decommitted { PAGE_SIZE } else { 0 }
            } else {
                lists.overflow.attach(slab_ptr);
                ClassCounters::inc(&self.counters.recycled_to_overflow);
                0
            }
        }
    }

    /// Reclaim `epoch`'s free slabs: drain the empty queue, then sweep the
    /// epoch's partial and full lists. Slabs with live objects stay in
    /// place for a later close. Returns (slabs reclaimed, bytes
    /// decommitted).
    pub fn close_epoch(&self, epoch: EpochId, registry: &SlabRegistry) -> (usize, usize) {
        let mut lists = self.lists.lock();
        self.current[epoch as usize].store(ptr::null_mut(), Ordering::Release);

        let (mut reclaimed, mut bytes) =
            unsafe { self.harvest_empty_queue(&mut lists, registry, Some(epoch)) };

        for which in 0..2 {
            let mut cur = if which == 0 {
                lists.partial[epoch as usize].head()
            } else {
                lists.full[epoch as usize].head()
            };
            while !cur.is_null() {
                let next = unsafe { (*cur).next };
                let slab = unsafe { &*cur };
                // A slab on the empty queue belongs to the next drain; the
                // queue linkage must stay intact.
                if slab.free_count.load(Ordering::Relaxed) == slab.slot_count
                    && !slab.on_empty_queue.load(Ordering::Relaxed)
                {
                    bytes += unsafe { self.recycle(&mut lists, cur, registry, true) };
                    reclaimed += 1;
                }
                cur = next;
            }
        }
        (reclaimed, bytes)
    }

    /// Null the publication pointer for an epoch that just went CLOSING.
    pub fn clear_current(&self, epoch: EpochId) {
        self.current[epoch as usize].store(ptr::null_mut(), Ordering::Release);
    }

    /// (fast, contended) acquisition counts of the class mutex.
    pub(crate) fn lock_stats(&self) -> (u64, u64) {
        self.lists.contention()
    }

    /// Word offset to start bitmap scans at. Sequential in the default mode
    /// for cache locality; derived from the thread identity in randomized
    /// mode to diffuse CAS collisions.
    #[inline]
    fn scan_start(&self, slab: &Slab) -> usize {
        let words = slab.words();
        // A stale pointer can reach a decommitted header, which reads as
        // zero words; try_allocate then reports full without scanning.
        if words > 1 && self.scan.randomized.load(Ordering::Relaxed) {
            (thread_seed() >> 16) % words
        } else {
            0
        }
    }

    /// Evaluate the windowed CAS-retry rate and switch scan modes with
    /// hysteresis. Called every 2^18 allocations from the fast path.
    pub(crate) fn scan_heartbeat(&self) {
        let attempts = self.counters.alloc_cas_attempts.load(Ordering::Relaxed);
        let retries = self.counters.alloc_cas_retries.load(Ordering::Relaxed);
        let prev_attempts = self.scan.last_attempts.swap(attempts, Ordering::Relaxed);
        let prev_retries = self.scan.last_retries.swap(retries, Ordering::Relaxed);
        let window_attempts = attempts.wrapping_sub(prev_attempts);
        let window_retries = retries.wrapping_sub(prev_retries);
        if window_attempts == 0 {
            return;
        }
        let rate = window_retries.saturating_mul(1000) / window_attempts;

        let dwell = self.scan.dwell.load(Ordering::Relaxed);
        if dwell > 0 {
            self.scan.dwell.store(dwell - 1, Ordering::Relaxed);
            return;
        }
        let randomized = self.scan.randomized.load(Ordering::Relaxed);
        if !randomized && rate > SCAN_ENABLE_PERMILLE {
            self.scan.randomized.store(true, Ordering::Relaxed);
            self.scan.dwell.store(SCAN_DWELL_HEARTBEATS, Ordering::Relaxed);
        } else if randomized && rate < SCAN_DISABLE_PERMILLE {
            self.scan.randomized.store(false, Ordering::Relaxed);
            self.scan.dwell.store(SCAN_DWELL_HEARTBEATS, Ordering::Relaxed);
        }
    }

    /// Whether randomized-start scanning is currently enabled.
    pub fn scan_randomized(&self) -> bool {
        self.scan.randomized.load(Ordering::Relaxed)
    }

    /// (partial slabs, full slabs, reclaimable slabs, current published)
    /// for one epoch. Takes the class mutex.
    pub(crate) fn epoch_snapshot(&self, epoch: EpochId) -> (usize, usize, usize, bool) {
        let lists = self.lists.lock();
        let partial = lists.partial[epoch as usize].len();
        let full = lists.full[epoch as usize].len();
        let mut reclaimable = 0;
        for head in [
            lists.partial[epoch as usize].head(),
            lists.full[epoch as usize].head(),
        ] {
            let mut cur = head;
            while !cur.is_null() {
                let slab = unsafe { &*cur };
                if slab.free_count.load(Ordering::Relaxed) == slab.slot_count {
                    reclaimable += 1;
                }
                cur = slab.next;
            }
        }
        let current_set = !self.current[epoch as usize].load(Ordering::Acquire).is_null();
        (partial, full, reclaimable, current_set)
    }

    /// (total partial, total full, cache length, overflow length) across
    /// all epochs. Takes the class mutex.
    pub(crate) fn list_totals(&self) -> (usize, usize, usize, usize) {
        let lists = self.lists.lock();
        let mut partial = 0;
        let mut full = 0;
        for e in 0..EPOCH_COUNT {
            partial += lists.partial[e].len();
            full += lists.full[e].len();
        }
        (partial, full, lists.cache_len, lists.overflow.len())
    }
}
