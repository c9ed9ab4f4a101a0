//! End-to-end epoch lifecycle scenarios: phase reclamation, ring wrap with
//! era capture, and close idempotence.

use epochalloc::{EpochAlloc, EpochState, PAGE_SIZE};

#[test]
fn epoch_reclaim_ten_thousand_objects() {
    let alloc = EpochAlloc::new();
    let e = alloc.epoch_current();

    let count: usize = 10_000;
    let handles: Vec<_> = (0..count)
        .map(|_| alloc.alloc(128, e).unwrap().handle)
        .collect();
    let class = handles[0].class();
    let slots_per_slab = alloc.stats_class(class).unwrap().slots_per_slab;
    let min_slabs = count.div_ceil(slots_per_slab);

    for h in handles {
        assert!(alloc.free(h));
    }

    alloc.epoch_advance();
    let report = alloc.epoch_close(e).unwrap();
    assert!(
        report.slabs_reclaimed >= min_slabs,
        "expected at least {} reclaimable slabs, got {}",
        min_slabs,
        report.slabs_reclaimed
    );

    let class_stats = alloc.stats_class(class).unwrap();
    assert!(
        class_stats.cache_len + class_stats.overflow_len >= min_slabs,
        "recyclable slabs missing from cache/overflow"
    );

    let stats = alloc.stats_global();
    assert!(stats.decommit_calls > 0);
    assert!(report.bytes_decommitted > 0);
    assert!(report.rss_after < report.rss_before);
}

#[test]
fn ring_wrap_era_blocks_stale_domain_close() {
    let alloc = EpochAlloc::new();
    let e = alloc.epoch_current();

    // Capture a domain against the current incarnation of ring slot e.
    let d = alloc.domain_wrap(e, true).unwrap();
    assert!(d.enter());
    let captured_era = d.era();

    // Advance the full ring: each epoch gets one allocation that is freed
    // immediately, then the ring wraps back to slot e under a newer era.
    for _ in 0..epochalloc::EPOCH_COUNT {
        let cur = alloc.epoch_current();
        let a = alloc.alloc(96, cur).unwrap();
        assert!(alloc.free(a.handle));
        alloc.epoch_advance();
    }
    assert_eq!(alloc.epoch_current(), e);
    assert!(alloc.epoch_era(e) > captured_era);
    assert!(!d.era_matches());

    // Give the new incarnation a reclaimable slab, then advance past it so
    // a close would have something to do.
    let a = alloc.alloc(96, e).unwrap();
    let class = a.handle.class();
    assert!(alloc.free(a.handle));
    alloc.epoch_advance();

    // The stale domain must refuse both close paths.
    assert!(d.force_close().is_none());
    assert!(d.exit()); // auto-close armed, but the era no longer matches

    let per_class = alloc.stats_epoch(class, e).unwrap();
    assert_eq!(
        per_class.reclaimable_slabs, 1,
        "stale domain must not reclaim the new incarnation"
    );

    // A direct close still works.
    let report = alloc.epoch_close(e).unwrap();
    assert!(report.slabs_reclaimed >= 1);
}

#[test]
fn advance_twice_leaves_two_closable_epochs() {
    let alloc = EpochAlloc::new();
    let e0 = alloc.epoch_current();
    let a0 = alloc.alloc(64, e0).unwrap();
    assert!(alloc.free(a0.handle));

    let e1 = alloc.epoch_advance();
    let a1 = alloc.alloc(64, e1).unwrap();
    assert!(alloc.free(a1.handle));
    let e2 = alloc.epoch_advance();
    assert_ne!(e2, e0);

    assert_eq!(alloc.epoch_state(e0), EpochState::Closing);
    assert_eq!(alloc.epoch_state(e1), EpochState::Closing);

    let r0 = alloc.epoch_close(e0).unwrap();
    let r1 = alloc.epoch_close(e1).unwrap();
    assert!(r0.slabs_reclaimed >= 1);
    assert!(r1.slabs_reclaimed >= 1);

    // Closing again finds nothing and changes nothing.
    assert_eq!(alloc.epoch_close(e0).unwrap().slabs_reclaimed, 0);
    assert_eq!(alloc.epoch_state(e0), EpochState::Closing);
}

#[test]
fn close_leaves_live_slabs_for_later() {
    let alloc = EpochAlloc::new();
    let e = alloc.epoch_current();

    // Two slabs: one fully freed, one with a survivor.
    let slots = alloc.stats_class(1).unwrap().slots_per_slab;
    let first: Vec<_> = (0..slots)
        .map(|_| alloc.alloc(64, e).unwrap().handle)
        .collect();
    let survivor = alloc.alloc(64, e).unwrap().handle;
    for h in first {
        assert!(alloc.free(h));
    }

    alloc.epoch_advance();
    let report = alloc.epoch_close(e).unwrap();
    assert_eq!(report.slabs_reclaimed, 1);

    // The survivor's slab stayed in place and the handle is still live.
    let per_class = alloc.stats_epoch(1, e).unwrap();
    assert_eq!(per_class.partial_slabs + per_class.full_slabs, 1);
    assert!(alloc.free(survivor));

    // Now the second close reclaims it.
    let report = alloc.epoch_close(e).unwrap();
    assert_eq!(report.slabs_reclaimed, 1);
}

#[test]
fn reclaimed_pages_are_reused_not_remapped() {
    let alloc = EpochAlloc::new();
    let e0 = alloc.epoch_current();

    let first_wave: Vec<_> = (0..500)
        .map(|_| alloc.alloc(256, e0).unwrap().handle)
        .collect();
    for h in first_wave {
        assert!(alloc.free(h));
    }

    alloc.epoch_advance();
    alloc.epoch_close(e0).unwrap();
    let registered_before = alloc.stats_global().slabs_registered;

    // The next phase's allocations must come from the recycle cache and
    // overflow list, not fresh OS pages.
    let e1 = alloc.epoch_current();
    let second_wave: Vec<_> = (0..500)
        .map(|_| alloc.alloc(256, e1).unwrap().handle)
        .collect();
    assert_eq!(
        alloc.stats_global().slabs_registered,
        registered_before,
        "phase reuse must not register new pages"
    );
    for h in second_wave {
        assert!(alloc.free(h));
    }
}

#[test]
fn epoch_age_and_metadata() {
    let alloc = EpochAlloc::new();
    let e = alloc.epoch_current();
    alloc.epoch_set_label(e, "ingest");
    alloc.epoch_inc_refcount(e);

    let stats = alloc.stats_epoch_global(e).unwrap();
    assert_eq!(stats.state, EpochState::Active);
    assert_eq!(stats.label_str(), "ingest");
    assert_eq!(stats.refcount, 1);
    assert_eq!(stats.era, alloc.epoch_era(e));

    alloc.epoch_dec_refcount(e);
    assert_eq!(alloc.epoch_get_refcount(e), 0);
}

#[test]
fn rss_drops_by_cache_capacity_after_phase() {
    let alloc = EpochAlloc::new();
    let e = alloc.epoch_current();

    let handles: Vec<_> = (0..2000)
        .map(|_| alloc.alloc(512, e).unwrap().handle)
        .collect();
    let peak = alloc.stats_global().rss_bytes;
    assert!(peak >= 100 * PAGE_SIZE as u64);

    for h in handles {
        assert!(alloc.free(h));
    }
    alloc.epoch_advance();
    let report = alloc.epoch_close(e).unwrap();

    // The bounded cache takes the decommit hint; overflow spillover keeps
    // its pages (and headers) resident for cheap reuse.
    let cache_capacity = epochalloc::config::CACHE_CAPACITY;
    assert_eq!(
        report.bytes_decommitted,
        cache_capacity * PAGE_SIZE,
        "every cache-bound slab should be decommitted"
    );
    let after = alloc.stats_global().rss_bytes;
    assert_eq!(after, peak - (cache_capacity * PAGE_SIZE) as u64);
}
