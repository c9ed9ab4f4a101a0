//! Slab headers, bitmap slot allocation, and the intrusive slab list.
//!
//! A slab is one backing page: the header sits at the start of the page,
//! followed by the allocation bitmap (inside the header struct), followed by
//! aligned slot storage at [`SLOT_BASE_OFFSET`]. Slab metadata therefore
//! lives and dies with its page; a decommitted page loses its header and is
//! fully re-initialized on reuse.

use crate::config::{BITMAP_WORDS, PAGE_SIZE, SLOT_BASE_OFFSET};
use crate::size_class;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use static_assertions::const_assert;

/// Tag stamped into every live slab header.
pub const SLAB_MAGIC: u64 = 0x4550_4F43_534C_4142; // "EPOCSLAB"

/// Which pool list a slab currently belongs to. Mutated only under the
/// owning class mutex.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ListTag {
    /// Not on any list (freshly mapped, or mid-transfer).
    None = 0,
    /// On its epoch's partial list (has free slots).
    Partial = 1,
    /// On its epoch's full list.
    Full = 2,
    /// In the pool's bounded recycle cache.
    Cache = 3,
    /// On the pool's unbounded overflow list.
    Overflow = 4,
}

/// Result of freeing one slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FreeOutcome {
    /// The bit was already clear (double free) or the slot index is out of
    /// range (torn handle).
    Invalid,
    /// The slot was freed.
    Freed {
        /// This free took the slab from zero free slots to one.
        was_full: bool,
        /// This free made every slot free.
        now_empty: bool,
    },
}

/// Metadata at the start of every slab page.
///
/// Fields fall into three synchronization domains:
/// - atomics (`bitmap`, `free_count`, `generation`, `on_empty_queue`,
///   `next_empty`) are touched by lock-free alloc/free paths
/// - plain fields after `magic` are written during header init and mutated
///   only under the owning class mutex
/// - `prev`/`next` are list linkage owned by the class mutex
#[repr(C)]
pub struct Slab {
    pub magic: u64,
    /// Object size for this slab's class.
    pub obj_size: u32,
    /// Number of usable slots (N).
    pub slot_count: u32,
    /// Size class index.
    pub class: u32,
    /// Registry index for this page. Assigned once, never changes.
    pub slab_id: u32,
    /// Epoch ring slot this slab was adopted into.
    pub epoch: u32,
    /// List membership tag (class mutex).
    pub list: ListTag,
    /// True once this slab has been exposed via current-partial publication
    /// (class mutex).
    pub published: bool,
    /// Era captured at adoption (class mutex).
    pub era: u64,
    /// Copy of the registry generation, used to mint handles on the fast
    /// path without a registry read. Stored relaxed; updated under the class
    /// mutex while the slab is unreachable from fast paths.
    pub generation: AtomicU32,
    /// Free slots remaining. `popcount(bitmap) + free_count == slot_count`
    /// holds whenever the class mutex is held.
    pub free_count: AtomicU32,
    /// Allocation bitmap; bit set = slot allocated. Bits at and above
    /// `slot_count` are permanently set so full-word scans skip them.
    pub bitmap: [AtomicU32; BITMAP_WORDS],
    /// Guards against double-insertion into the pool's empty queue.
    pub on_empty_queue: AtomicBool,
    /// Link for the pool's lock-free empty queue.
    pub next_empty: AtomicPtr<Slab>,
    /// Previous slab in the partial/full/overflow intrusive list.
    pub prev: *mut Slab,
    /// Next slab in the partial/full/overflow intrusive list.
    pub next: *mut Slab,
}

// The header and bitmap must fit in the reserved region before slot storage.
const_assert!(core::mem::size_of::<Slab>() <= SLOT_BASE_OFFSET);

impl Slab {
    /// Initialize a slab header in `page`, making every slot free.
    ///
    /// Returns the header pointer (same address as `page`).
    ///
    /// # Safety
    ///
    /// `page` must be a live, writable allocation of `PAGE_SIZE` bytes owned
    /// by the caller, aligned to `PAGE_SIZE`, with no other thread holding a
    /// claim on its contents. The caller must hold the owning class mutex.
    pub unsafe fn init(
        page: *mut u8,
        slab_id: u32,
        generation: u32,
        class: usize,
        epoch: u32,
        era: u64,
    ) -> *mut Slab {
        let info = size_class::class_info(class);
        let slab = page.cast::<Slab>();
        unsafe {
            ptr::write(
                slab,
                Slab {
                    magic: SLAB_MAGIC,
                    obj_size: info.size as u32,
                    slot_count: info.slot_count as u32,
                    class: class as u32,
                    slab_id,
                    epoch,
                    list: ListTag::None,
                    published: false,
                    era,
                    generation: AtomicU32::new(generation),
                    free_count: AtomicU32::new(info.slot_count as u32),
                    bitmap: [const { AtomicU32::new(0) }; BITMAP_WORDS],
                    on_empty_queue: AtomicBool::new(false),
                    next_empty: AtomicPtr::new(ptr::null_mut()),
                    prev: ptr::null_mut(),
                    next: ptr::null_mut(),
                },
            );
            // Mark out-of-range bits allocated so scans never claim them.
            let slab = &*slab;
            for w in 0..slab.words() {
                let valid = slab.valid_mask(w);
                slab.bitmap[w].store(!valid, Ordering::Relaxed);
            }
        }
        slab
    }

    /// Base address of the backing page.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        ptr::from_ref(self) as *mut u8
    }

    /// Address of slot `slot`.
    #[inline]
    pub fn slot_ptr(&self, slot: u32) -> *mut u8 {
        debug_assert!(slot < self.slot_count);
        unsafe {
            self.base()
                .add(SLOT_BASE_OFFSET + slot as usize * self.obj_size as usize)
        }
    }

    /// Number of bitmap words covering `slot_count` slots.
    #[inline]
    pub fn words(&self) -> usize {
        (self.slot_count as usize).div_ceil(32)
    }

    /// Mask of bits in word `w` that correspond to real slots.
    #[inline]
    fn valid_mask(&self, w: usize) -> u32 {
        let base = w as u32 * 32;
        if base + 32 <= self.slot_count {
            u32::MAX
        } else {
            (1u32 << (self.slot_count - base)) - 1
        }
    }

    /// Claim the lowest free slot, scanning words starting at `start_word`.
    ///
    /// Increments `retries` once per failed CAS. Returns `None` when every
    /// word was fully set over a complete sweep (slab full).
    #[inline]
    pub fn try_allocate(&self, start_word: usize, retries: &mut u64) -> Option<u32> {
        let words = self.words();
        for k in 0..words {
            let w = (start_word + k) % words;
            let word = &self.bitmap[w];
            loop {
                let cur = word.load(Ordering::Relaxed);
                if cur == u32::MAX {
                    break;
                }
                let bit = (!cur).trailing_zeros();
                if word
                    .compare_exchange_weak(
                        cur,
                        cur | (1 << bit),
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    self.free_count.fetch_sub(1, Ordering::Relaxed);
                    return Some(w as u32 * 32 + bit);
                }
                *retries += 1;
            }
        }
        None
    }

    /// Free the slot named by `slot`, detecting double frees.
    ///
    /// Increments `retries` once per failed CAS.
    #[inline]
    pub fn free_slot(&self, slot: u32, retries: &mut u64) -> FreeOutcome {
        if slot >= self.slot_count {
            return FreeOutcome::Invalid;
        }
        let w = (slot / 32) as usize;
        let mask = 1u32 << (slot % 32);
        let word = &self.bitmap[w];
        loop {
            let cur = word.load(Ordering::Relaxed);
            if cur & mask == 0 {
                return FreeOutcome::Invalid;
            }
            if word
                .compare_exchange_weak(cur, cur & !mask, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            *retries += 1;
        }
        let prev_free = self.free_count.fetch_add(1, Ordering::AcqRel);
        FreeOutcome::Freed {
            was_full: prev_free == 0,
            now_empty: prev_free + 1 == self.slot_count,
        }
    }

    /// Number of allocated slots according to the bitmap (sentinel bits
    /// excluded). Only meaningful under the owning class mutex.
    pub fn allocated_slots(&self) -> u32 {
        let mut count = 0;
        for w in 0..self.words() {
            let word = self.bitmap[w].load(Ordering::Relaxed);
            count += (word & self.valid_mask(w)).count_ones();
        }
        count
    }

    /// Whether every slot is free.
    #[inline]
    pub fn is_unused(&self) -> bool {
        self.free_count.load(Ordering::Relaxed) == self.slot_count
    }
}

/// An intrusive list of slabs that owns its members' membership tag.
///
/// Slabs migrate between the per-epoch partial and full lists and the
/// overflow list only under the class mutex, and the free and recycle paths
/// dispatch on the header's [`ListTag`] to find out where a slab currently
/// is. Centralizing the tag here keeps that dispatch trustworthy: attaching
/// stamps the list's tag into the header, detaching resets it to
/// [`ListTag::None`], and a tag/list mismatch is a bookkeeping bug that
/// aborts checked builds.
pub struct SlabList {
    head: *mut Slab,
    len: usize,
    tag: ListTag,
}

impl SlabList {
    pub const fn new(tag: ListTag) -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
            tag,
        }
    }

    /// First slab on the list, or null. Walk with the headers' `next`
    /// pointers under the class mutex.
    #[inline]
    pub fn head(&self) -> *mut Slab {
        self.head
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Put `slab` at the front of the list and stamp the list's tag into
    /// its header.
    ///
    /// # Safety
    ///
    /// Caller holds the class mutex; `slab` is a live header that is on no
    /// list (`ListTag::None`, null linkage).
    pub unsafe fn attach(&mut self, slab: *mut Slab) {
        unsafe {
            debug_assert_eq!((*slab).list, ListTag::None);
            debug_assert!((*slab).prev.is_null() && (*slab).next.is_null());
            (*slab).list = self.tag;
            (*slab).next = self.head;
            if !self.head.is_null() {
                (*self.head).prev = slab;
            }
            self.head = slab;
            self.len += 1;
        }
    }

    /// Unlink `slab` and reset its header tag to [`ListTag::None`].
    ///
    /// # Safety
    ///
    /// Caller holds the class mutex; `slab` is on this list (its header
    /// carries this list's tag).
    pub unsafe fn detach(&mut self, slab: *mut Slab) {
        unsafe {
            debug_assert_eq!((*slab).list, self.tag);
            let prev = (*slab).prev;
            let next = (*slab).next;
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*slab).prev = ptr::null_mut();
            (*slab).next = ptr::null_mut();
            (*slab).list = ListTag::None;
            self.len -= 1;
        }
    }

    /// Detach and return the head slab, or null when the list is empty.
    /// The returned header is untagged and ready for re-adoption.
    ///
    /// # Safety
    ///
    /// Caller holds the class mutex.
    pub unsafe fn take_head(&mut self) -> *mut Slab {
        let slab = self.head;
        if !slab.is_null() {
            unsafe { self.detach(slab) };
        }
        slab
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::platform;
    use crate::size_class::NUM_SIZE_CLASSES;
    use alloc::vec::Vec;

    fn with_slab<F: FnOnce(&Slab)>(class: usize, f: F) {
        unsafe {
            let page = platform::page_alloc(PAGE_SIZE);
            assert!(!page.is_null());
            let slab = Slab::init(page, 7, 3, class, 0, 1);
            f(&*slab);
            platform::page_dealloc(page, PAGE_SIZE);
        }
    }

    #[test]
    fn test_init_state() {
        with_slab(1, |slab| {
            assert_eq!(slab.magic, SLAB_MAGIC);
            assert_eq!(slab.slab_id, 7);
            assert_eq!(slab.generation.load(Ordering::Relaxed), 3);
            assert_eq!(slab.list, ListTag::None);
            assert!(!slab.published);
            assert!(slab.is_unused());
            assert_eq!(slab.allocated_slots(), 0);
        });
    }

    #[test]
    fn test_allocate_all_then_full() {
        with_slab(1, |slab| {
            let n = slab.slot_count;
            let mut retries = 0;
            for expect in 0..n {
                let slot = slab.try_allocate(0, &mut retries).unwrap();
                // Sequential scan hands out slots in order
                assert_eq!(slot, expect);
            }
            assert_eq!(slab.free_count.load(Ordering::Relaxed), 0);
            assert!(slab.try_allocate(0, &mut retries).is_none());
            assert_eq!(slab.allocated_slots(), n);
        });
    }

    #[test]
    fn test_free_roundtrip_and_double_free() {
        with_slab(2, |slab| {
            let mut retries = 0;
            let slot = slab.try_allocate(0, &mut retries).unwrap();
            match slab.free_slot(slot, &mut retries) {
                FreeOutcome::Freed { now_empty, .. } => assert!(now_empty),
                other => panic!("unexpected outcome {:?}", other),
            }
            // Second free of the same slot is rejected
            assert_eq!(slab.free_slot(slot, &mut retries), FreeOutcome::Invalid);
        });
    }

    #[test]
    fn test_free_out_of_range_slot() {
        with_slab(1, |slab| {
            let mut retries = 0;
            assert_eq!(
                slab.free_slot(slab.slot_count, &mut retries),
                FreeOutcome::Invalid
            );
            assert_eq!(slab.free_slot(255, &mut retries), FreeOutcome::Invalid);
        });
    }

    #[test]
    fn test_was_full_and_now_empty_transitions() {
        with_slab(NUM_SIZE_CLASSES - 1, |slab| {
            let n = slab.slot_count;
            let mut retries = 0;
            let mut slots = alloc::vec::Vec::new();
            for _ in 0..n {
                slots.push(slab.try_allocate(0, &mut retries).unwrap());
            }
            // First free leaves FULL
            let first = slots.pop().unwrap();
            match slab.free_slot(first, &mut retries) {
                FreeOutcome::Freed {
                    was_full,
                    now_empty,
                } => {
                    assert!(was_full);
                    assert_eq!(now_empty, n == 1);
                }
                other => panic!("unexpected outcome {:?}", other),
            }
            // Free the rest; the last one empties the slab
            while let Some(slot) = slots.pop() {
                match slab.free_slot(slot, &mut retries) {
                    FreeOutcome::Freed {
                        was_full,
                        now_empty,
                    } => {
                        assert!(!was_full);
                        assert_eq!(now_empty, slots.is_empty());
                    }
                    other => panic!("unexpected outcome {:?}", other),
                }
            }
            assert!(slab.is_unused());
        });
    }

    #[test]
    fn test_randomized_start_still_finds_all_slots() {
        with_slab(3, |slab| {
            let n = slab.slot_count;
            let mut retries = 0;
            let words = slab.words();
            for i in 0..n {
                assert!(
                    slab.try_allocate(i as usize % words, &mut retries).is_some(),
                    "slot {} not found",
                    i
                );
            }
            assert!(slab.try_allocate(1, &mut retries).is_none());
        });
    }

    #[test]
    fn test_slot_ptrs_disjoint_and_in_page() {
        with_slab(1, |slab| {
            let base = slab.base() as usize;
            for slot in 0..slab.slot_count {
                let p = slab.slot_ptr(slot) as usize;
                assert!(p >= base + SLOT_BASE_OFFSET);
                assert!(p + slab.obj_size as usize <= base + PAGE_SIZE);
                if slot > 0 {
                    assert_eq!(
                        p,
                        slab.slot_ptr(slot - 1) as usize + slab.obj_size as usize
                    );
                }
            }
        });
    }

    #[test]
    fn test_concurrent_claims_unique() {
        use std::collections::HashSet;
        use std::sync::Arc;
        use std::sync::atomic::AtomicUsize;

        unsafe {
            let page = platform::page_alloc(PAGE_SIZE);
            assert!(!page.is_null());
            let slab_ptr = Slab::init(page, 0, 0, 1, 0, 1) as usize;
            let n = (*(slab_ptr as *const Slab)).slot_count as usize;
            let claimed = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..4)
                .map(|tid| {
                    let claimed = Arc::clone(&claimed);
                    std::thread::spawn(move || {
                        let slab = &*(slab_ptr as *const Slab);
                        let mut retries = 0;
                        let mut got = Vec::new();
                        while let Some(slot) = slab.try_allocate(tid, &mut retries) {
                            got.push(slot);
                            claimed.fetch_add(1, Ordering::Relaxed);
                        }
                        got
                    })
                })
                .collect();

            let mut all = HashSet::new();
            for h in handles {
                for slot in h.join().unwrap() {
                    assert!(all.insert(slot), "slot {} claimed twice", slot);
                }
            }
            assert_eq!(all.len(), n);
            platform::page_dealloc(page, PAGE_SIZE);
        }
    }

    #[test]
    fn test_list_owns_membership_tag() {
        let mut partial = SlabList::new(ListTag::Partial);
        let mut full = SlabList::new(ListTag::Full);
        assert!(partial.is_empty());

        unsafe {
            let pages: Vec<_> = (0..3)
                .map(|i| {
                    let page = platform::page_alloc(PAGE_SIZE);
                    assert!(!page.is_null());
                    Slab::init(page, i, 0, 1, 0, 1)
                })
                .collect();
            let (s1, s2, s3) = (pages[0], pages[1], pages[2]);

            for &s in &pages {
                assert_eq!((*s).list, ListTag::None);
                partial.attach(s);
                assert_eq!((*s).list, ListTag::Partial);
            }
            assert_eq!(partial.len(), 3);
            assert_eq!(partial.head(), s3);

            // A partial-to-full migration is a detach/attach pair that
            // retags the header.
            partial.detach(s2);
            assert_eq!((*s2).list, ListTag::None);
            full.attach(s2);
            assert_eq!((*s2).list, ListTag::Full);
            assert_eq!(partial.len(), 2);
            assert_eq!((*s3).next, s1);

            // take_head hands back an untagged header ready for adoption.
            let adopted = partial.take_head();
            assert_eq!(adopted, s3);
            assert_eq!((*adopted).list, ListTag::None);
            assert!((*adopted).prev.is_null() && (*adopted).next.is_null());

            assert_eq!(partial.take_head(), s1);
            assert!(partial.take_head().is_null());
            assert!(partial.is_empty());

            full.detach(s2);
            for page in pages {
                platform::page_dealloc(page.cast(), PAGE_SIZE);
            }
        }
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic]
    fn test_detach_from_wrong_list_aborts_checked() {
        let mut partial = SlabList::new(ListTag::Partial);
        let mut full = SlabList::new(ListTag::Full);
        unsafe {
            let page = platform::page_alloc(PAGE_SIZE);
            assert!(!page.is_null());
            let slab = Slab::init(page, 0, 0, 1, 0, 1);
            partial.attach(slab);
            full.detach(slab); // header carries the partial tag
        }
    }
}
