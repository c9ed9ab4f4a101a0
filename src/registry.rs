//! Slab registry: compact id -> (backing pointer, generation) table.
//!
//! Handle validation and ABA protection live here. The table is two-level:
//! a fixed root of chunk pointers with lazily OS-allocated chunks, so the
//! 22-bit id space costs nothing until used. Reads are lock-free (AtomicPtr
//! with Acquire); id allocation takes a small dedicated mutex; generation
//! and pointer writes happen under the owning class mutex.
//!
//! The lookup protocol reads the pointer first, then the generation, both
//! with acquire. Retire/recycle bumps the generation before a slab can be
//! republished, so if the generation still matches, the observed pointer is
//! the current incarnation.

use crate::config::PAGE_SIZE;
use crate::handle::{GENERATION_MASK, MAX_SLAB_IDS};
use crate::platform;
use crate::slab::Slab;
use crate::sync::SpinMutex;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use static_assertions::const_assert_eq;

const ROOT_BITS: usize = 10;
const CHUNK_BITS: usize = 12;

const ROOT_LEN: usize = 1 << ROOT_BITS; // 1024
const CHUNK_LEN: usize = 1 << CHUNK_BITS; // 4096

const CHUNK_MASK: u32 = (1 << CHUNK_BITS) - 1;

const_assert_eq!(ROOT_BITS + CHUNK_BITS, crate::handle::SLAB_ID_BITS as usize);

/// Sentinel terminating the free-id list.
const NO_FREE_ID: u32 = u32::MAX;

/// One registry entry.
#[repr(C)]
pub struct RegistrySlot {
    /// Current backing page, or null when the slot is vacant.
    slab: AtomicPtr<Slab>,
    /// Monotonic per-slot generation. Handles carry the low 24 bits.
    generation: AtomicU32,
    /// Link for the free-id list; valid only while the id is free.
    next_free: AtomicU32,
}

#[repr(C)]
struct Chunk {
    slots: [RegistrySlot; CHUNK_LEN],
}

struct IdAlloc {
    /// Next never-used id.
    next_id: u32,
    /// Head of the free-id recycling list, or NO_FREE_ID.
    free_head: u32,
}

/// Dense id-addressed table of slabs with per-slot generations.
pub struct SlabRegistry {
    root: [AtomicPtr<Chunk>; ROOT_LEN],
    ids: SpinMutex<IdAlloc>,
    /// Slots with a non-null backing pointer.
    live: AtomicU32,
    /// Starting generation for never-used ids. Seeded per allocator
    /// instance so handles from one instance fail validation in another
    /// even at identical (id, slot) coordinates.
    salt: AtomicU32,
}

// AtomicPtr is Send+Sync and chunk memory outlives every thread using it.
unsafe impl Send for SlabRegistry {}
unsafe impl Sync for SlabRegistry {}

impl Default for SlabRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SlabRegistry {
    pub const fn new() -> Self {
        Self {
            root: [const { AtomicPtr::new(ptr::null_mut()) }; ROOT_LEN],
            ids: SpinMutex::new(IdAlloc {
                next_id: 0,
                free_head: NO_FREE_ID,
            }),
            live: AtomicU32::new(0),
            salt: AtomicU32::new(0),
        }
    }

    /// Set the starting generation for ids that have never been handed out.
    /// Call before the first `allocate_id`.
    pub fn set_salt(&self, salt: u32) {
        self.salt.store(salt, Ordering::Relaxed);
    }

    #[inline]
    fn slot(&self, id: u32) -> Option<&RegistrySlot> {
        if id >= MAX_SLAB_IDS {
            return None;
        }
        let chunk = self.root[(id >> CHUNK_BITS) as usize].load(Ordering::Acquire);
        if chunk.is_null() {
            return None;
        }
        Some(unsafe { &(*chunk).slots[(id & CHUNK_MASK) as usize] })
    }

    /// Ensure the chunk covering `id` exists. Called only under the id
    /// mutex, so stores cannot race.
    fn ensure_chunk(&self, id: u32) -> bool {
        let root_idx = (id >> CHUNK_BITS) as usize;
        let existing = self.root[root_idx].load(Ordering::Acquire);
        if !existing.is_null() {
            return true;
        }
        let size = core::mem::size_of::<Chunk>();
        let alloc_size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        // page_alloc returns zeroed memory: null pointers, generation 0.
        let chunk = unsafe { platform::page_alloc(alloc_size) }.cast::<Chunk>();
        if chunk.is_null() {
            return false;
        }
        self.root[root_idx].store(chunk, Ordering::Release);
        true
    }

    /// Allocate a slab id, reusing a previously-retired id if one exists.
    ///
    /// Returns `None` when the 22-bit id space is exhausted or the chunk
    /// backing the id cannot be mapped.
    pub fn allocate_id(&self) -> Option<u32> {
        let mut ids = self.ids.lock();
        if ids.free_head != NO_FREE_ID {
            let id = ids.free_head;
            // The chunk for a recycled id always exists.
            let slot = self.slot(id)?;
            ids.free_head = slot.next_free.load(Ordering::Relaxed);
            return Some(id);
        }
        if ids.next_id >= MAX_SLAB_IDS {
            return None;
        }
        let id = ids.next_id;
        if !self.ensure_chunk(id) {
            return None;
        }
        ids.next_id += 1;
        // Fresh slots start at the instance salt instead of the chunk's
        // zeroed generation.
        if let Some(slot) = self.slot(id) {
            slot.generation
                .store(self.salt.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        Some(id)
    }

    /// Store the backing pointer for `id` with release ordering, making the
    /// slab visible to lock-free lookups.
    pub fn publish(&self, id: u32, slab: *mut Slab) {
        if let Some(slot) = self.slot(id) {
            let prev = slot.slab.swap(slab, Ordering::Release);
            if prev.is_null() && !slab.is_null() {
                self.live.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Bump the generation for `id` so every outstanding handle minted
    /// against the previous generation fails validation. Returns the new
    /// generation.
    pub fn bump_generation(&self, id: u32) -> u32 {
        match self.slot(id) {
            Some(slot) => slot.generation.fetch_add(1, Ordering::Release).wrapping_add(1),
            None => 0,
        }
    }

    /// Current generation for `id` (0 for unknown ids).
    pub fn generation(&self, id: u32) -> u32 {
        self.slot(id)
            .map(|s| s.generation.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Validate a handle's (id, generation) pair, returning the slab
    /// pointer on success.
    ///
    /// This is the canonical rejection point for stale, double-freed and
    /// foreign handles. It never panics for any id or generation value.
    #[inline]
    pub fn lookup(&self, id: u32, expected_generation: u32) -> Option<*mut Slab> {
        let slot = self.slot(id)?;
        // Pointer first, generation second. If the generation still
        // matches, the pointer is the matching incarnation.
        let slab = slot.slab.load(Ordering::Acquire);
        if slab.is_null() {
            return None;
        }
        let generation = slot.generation.load(Ordering::Acquire);
        if generation & GENERATION_MASK != expected_generation & GENERATION_MASK {
            return None;
        }
        Some(slab)
    }

    /// Clear the backing pointer, bump the generation and optionally push
    /// the id onto the free list for reuse.
    pub fn retire(&self, id: u32, recycle_id: bool) {
        let Some(slot) = self.slot(id) else { return };
        let prev = slot.slab.swap(ptr::null_mut(), Ordering::Release);
        slot.generation.fetch_add(1, Ordering::Release);
        if !prev.is_null() {
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
        if recycle_id {
            let mut ids = self.ids.lock();
            slot.next_free.store(ids.free_head, Ordering::Relaxed);
            ids.free_head = id;
        }
    }

    /// Number of slots currently holding a backing pointer.
    pub fn live_slabs(&self) -> u32 {
        self.live.load(Ordering::Relaxed)
    }

    /// Upper bound of ids handed out so far.
    pub fn ids_allocated(&self) -> u32 {
        self.ids.lock().next_id
    }

    /// Raw pointer stored for `id`, without generation validation. Used by
    /// allocator teardown to find every mapped page.
    pub(crate) fn slab_ptr(&self, id: u32) -> *mut Slab {
        self.slot(id)
            .map(|s| s.slab.load(Ordering::Acquire))
            .unwrap_or(ptr::null_mut())
    }
}

impl Drop for SlabRegistry {
    fn drop(&mut self) {
        let size = core::mem::size_of::<Chunk>();
        let alloc_size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        for entry in &self.root {
            let chunk = entry.load(Ordering::Acquire);
            if !chunk.is_null() {
                unsafe { platform::page_dealloc(chunk.cast(), alloc_size) };
            }
        }
    }
}
