//! Adversarial handle tests: double frees, foreign and stale handles, torn
//! bits. None of these may crash; all must be rejected with `false`.

use epochalloc::{EpochAlloc, Handle};

#[test]
fn double_free_rejected() {
    let alloc = EpochAlloc::new();
    let e = alloc.epoch_current();
    let a = alloc.alloc(128, e).unwrap();
    assert!(alloc.free(a.handle));
    assert!(!alloc.free(a.handle));
    assert!(!alloc.free(a.handle));
}

#[test]
fn foreign_allocator_handle_rejected() {
    let a = EpochAlloc::new();
    let b = EpochAlloc::new();
    let ea = a.epoch_current();
    let eb = b.epoch_current();

    // Both allocators hold live slabs at the same (id, slot) coordinates;
    // only the per-instance generation salt tells them apart.
    let on_a = a.alloc(64, ea).unwrap();
    let on_b = b.alloc(64, eb).unwrap();
    assert_eq!(on_a.handle.slab_id(), on_b.handle.slab_id());

    assert!(!b.free(on_a.handle));
    assert!(!a.free(on_b.handle));

    // The owners can still free normally.
    assert!(a.free(on_a.handle));
    assert!(b.free(on_b.handle));
}

#[test]
fn stale_generation_rejected_after_recycle() {
    let alloc = EpochAlloc::new();
    let e = alloc.epoch_current();
    let slots = alloc.stats_class(1).unwrap().slots_per_slab;

    // Fill one slab, remember its handles, free everything, reclaim.
    let stale: Vec<_> = (0..slots)
        .map(|_| alloc.alloc(64, e).unwrap().handle)
        .collect();
    for &h in &stale {
        assert!(alloc.free(h));
    }
    alloc.epoch_advance();
    alloc.epoch_close(e).unwrap();

    // Reuse the page in the next epoch. Every old handle targets the same
    // slab id but a dead generation.
    let e1 = alloc.epoch_current();
    let fresh = alloc.alloc(64, e1).unwrap();
    assert_eq!(fresh.handle.slab_id(), stale[0].slab_id());
    for h in stale {
        assert!(!alloc.free(h), "stale handle {:?} must be rejected", h);
    }
    assert!(alloc.free(fresh.handle));
}

#[test]
fn torn_handles_rejected() {
    let alloc = EpochAlloc::new();
    let e = alloc.epoch_current();
    let a = alloc.alloc(256, e).unwrap();
    let raw = a.handle.raw();

    // Flip every field in turn; none of the variants may free the slot or
    // crash.
    for shift in [2u32, 10, 18, 42] {
        for width in 0..3 {
            let mutated = raw ^ (1u64 << (shift + width));
            if let Some(h) = Handle::from_raw(mutated) {
                assert!(!alloc.free(h), "torn handle {mutated:#x} accepted");
            }
        }
    }
    // Version-bit damage is rejected at decode time.
    assert!(Handle::from_raw(raw ^ 0b01).is_none());

    // The original is still live exactly once.
    assert!(alloc.free(a.handle));
    assert!(!alloc.free(a.handle));
}

#[test]
fn garbage_raw_words_never_crash() {
    let alloc = EpochAlloc::new();
    let e = alloc.epoch_current();
    let a = alloc.alloc(64, e).unwrap();

    let mut x = 0x243F_6A88_85A3_08D3u64; // arbitrary bits, deterministic
    for _ in 0..10_000 {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        if let Some(h) = Handle::from_raw(x) {
            // Whatever the bits decode to, the registry check must hold.
            if h == a.handle {
                continue;
            }
            assert!(!alloc.free(h));
        }
    }
    assert!(alloc.free(a.handle));
}

#[test]
fn handle_survives_transport_as_u64() {
    let alloc = EpochAlloc::new();
    let e = alloc.epoch_current();
    let a = alloc.alloc(384, e).unwrap();

    // Round-trip the handle through its wire form, as an external
    // collaborator would.
    let wire = a.handle.raw();
    let back = Handle::from_raw(wire).unwrap();
    assert_eq!(back, a.handle);
    assert_eq!(back.class(), a.handle.class());
    assert!(alloc.free(back));
}

#[test]
fn free_with_wrong_slot_bits_rejected() {
    let alloc = EpochAlloc::new();
    let e = alloc.epoch_current();
    let a = alloc.alloc(768, e).unwrap();
    let h = a.handle;

    // Same slab and generation, different (unallocated) slot.
    let sibling = Handle::pack(h.slab_id(), h.generation(), h.slot() + 1, h.class());
    assert!(!alloc.free(sibling), "unallocated sibling slot freed");

    // An out-of-range slot index on a valid slab.
    let bogus = Handle::pack(h.slab_id(), h.generation(), 255, h.class());
    assert!(!alloc.free(bogus));

    assert!(alloc.free(h));
}
