//! Observability snapshots.
//!
//! All counter loads use `Relaxed` ordering — they are observational only
//! and never used as synchronization. Individual fields are each atomically
//! read, but a snapshot as a whole is not globally consistent: concurrent
//! allocations may race between loads. For monitoring purposes this is
//! always sufficient.
//!
//! The allocator itself performs no I/O and emits no logs; external
//! collaborators (exporters, dashboards) serialize these snapshots however
//! they choose.

use crate::allocator::EpochAlloc;
use crate::config::EPOCH_COUNT;
use crate::epoch::{EpochId, EpochState, LABEL_CAP, NO_LABEL_ID};
use crate::size_class::NUM_SIZE_CLASSES;
use core::sync::atomic::Ordering;

/// Process-wide aggregates across every pool and the epoch ring.
#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalStats {
    /// Slab ids handed out so far (high-water mark).
    pub slabs_registered: u32,
    /// Registry slots currently holding a backing page.
    pub slabs_live: u32,
    /// Estimated resident bytes (mapped minus decommitted).
    pub rss_bytes: u64,
    /// Total allocations across all classes.
    pub alloc_count: u64,
    /// Total successful frees across all classes.
    pub free_count: u64,
    /// Total slow-path entries across all classes.
    pub slowpath_hits: u64,
    /// Decommit hints issued / bytes released / hints rejected.
    pub decommit_calls: u64,
    pub decommit_bytes: u64,
    pub decommit_failures: u64,
    /// Ring index of the ACTIVE epoch.
    pub current_epoch: EpochId,
    /// Number of ACTIVE and CLOSING ring slots.
    pub active_epochs: u32,
    pub closing_epochs: u32,
    /// Highest era handed out so far.
    pub latest_era: u64,
}

/// One size class's counters and list occupancy.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClassStats {
    pub object_size: usize,
    pub slots_per_slab: usize,
    pub alloc_count: u64,
    pub free_count: u64,
    pub free_invalid: u64,
    pub slowpath_hits: u64,
    /// Slow-path entries caused by a CLOSING epoch (the request failed).
    pub slowpath_closed: u64,
    /// Slow-path resolutions by source.
    pub new_pages: u64,
    pub cache_pops: u64,
    pub overflow_pops: u64,
    pub empty_pushes: u64,
    pub empty_harvests: u64,
    pub recycled_to_cache: u64,
    pub recycled_to_overflow: u64,
    pub decommit_calls: u64,
    pub decommit_bytes: u64,
    pub decommit_failures: u64,
    pub alloc_cas_attempts: u64,
    pub alloc_cas_retries: u64,
    pub free_cas_retries: u64,
    pub lock_fast: u64,
    pub lock_contended: u64,
    pub current_cas_attempts: u64,
    pub current_cas_failures: u64,
    pub zombie_repairs: u64,
    pub pages_mapped: u64,
    pub bytes_committed: u64,
    /// List occupancy across all epochs, measured under the class mutex.
    pub partial_slabs: usize,
    pub full_slabs: usize,
    pub cache_len: usize,
    pub overflow_len: usize,
    /// Whether randomized-start bitmap scanning is engaged.
    pub scan_randomized: bool,
}

/// One (size class, epoch) pair's slab occupancy.
#[derive(Clone, Copy, Debug, Default)]
pub struct EpochClassStats {
    pub partial_slabs: usize,
    pub full_slabs: usize,
    /// Slabs on the lists with every slot free.
    pub reclaimable_slabs: usize,
    /// Whether a current-partial slab is published for this pair.
    pub current_published: bool,
}

/// One epoch's state and aggregate occupancy across all classes.
#[derive(Clone, Copy, Debug)]
pub struct EpochStats {
    pub state: EpochState,
    pub era: u64,
    /// Microseconds since activation (0 where no clock is available).
    pub age_micros: u64,
    /// Number of domains currently holding the epoch open.
    pub refcount: u32,
    pub label: [u8; LABEL_CAP],
    pub label_len: u8,
    /// Compact label id, or `None`.
    pub label_id: Option<u8>,
    pub partial_slabs: usize,
    pub full_slabs: usize,
    pub reclaimable_slabs: usize,
    /// Estimated resident bytes attributable to this epoch's slabs.
    pub est_rss_bytes: u64,
}

impl EpochStats {
    pub fn label_str(&self) -> &str {
        core::str::from_utf8(&self.label[..self.label_len as usize]).unwrap_or("")
    }
}

impl EpochAlloc {
    /// Process-wide aggregate snapshot.
    pub fn stats_global(&self) -> GlobalStats {
        let mut stats = GlobalStats {
            slabs_registered: self.registry().ids_allocated(),
            slabs_live: self.registry().live_slabs(),
            current_epoch: self.ring().current(),
            latest_era: self.ring().latest_era(),
            ..GlobalStats::default()
        };
        for pool in &self.pools()[1..] {
            let c = &pool.counters;
            stats.rss_bytes += c.bytes_committed.load(Ordering::Relaxed);
            stats.alloc_count += c.allocs.load(Ordering::Relaxed);
            stats.free_count += c.frees.load(Ordering::Relaxed);
            stats.slowpath_hits += c.slowpath_hits.load(Ordering::Relaxed);
            stats.decommit_calls += c.decommit_calls.load(Ordering::Relaxed);
            stats.decommit_bytes += c.decommit_bytes.load(Ordering::Relaxed);
            stats.decommit_failures += c.decommit_failures.load(Ordering::Relaxed);
        }
        let (active, closing) = self.ring().state_counts();
        stats.active_epochs = active;
        stats.closing_epochs = closing;
        stats
    }

    /// Per-size-class snapshot, or `None` for the sentinel/out-of-range
    /// index.
    pub fn stats_class(&self, class: usize) -> Option<ClassStats> {
        if class == 0 || class >= NUM_SIZE_CLASSES {
            return None;
        }
        let pool = &self.pools()[class];
        let info = crate::size_class::class_info(class);
        let c = &pool.counters;
        let (lock_fast, lock_contended) = pool.lock_stats();
        let (partial_slabs, full_slabs, cache_len, overflow_len) = pool.list_totals();
        Some(ClassStats {
            object_size: info.size,
            slots_per_slab: info.slot_count,
            alloc_count: c.allocs.load(Ordering::Relaxed),
            free_count: c.frees.load(Ordering::Relaxed),
            free_invalid: c.free_invalid.load(Ordering::Relaxed),
            slowpath_hits: c.slowpath_hits.load(Ordering::Relaxed),
            slowpath_closed: c.slowpath_closed.load(Ordering::Relaxed),
            new_pages: c.new_pages.load(Ordering::Relaxed),
            cache_pops: c.cache_pops.load(Ordering::Relaxed),
            overflow_pops: c.overflow_pops.load(Ordering::Relaxed),
            empty_pushes: c.empty_pushes.load(Ordering::Relaxed),
            empty_harvests: c.empty_harvests.load(Ordering::Relaxed),
            recycled_to_cache: c.recycled_to_cache.load(Ordering::Relaxed),
            recycled_to_overflow: c.recycled_to_overflow.load(Ordering::Relaxed),
            decommit_calls: c.decommit_calls.load(Ordering::Relaxed),
            decommit_bytes: c.decommit_bytes.load(Ordering::Relaxed),
            decommit_failures: c.decommit_failures.load(Ordering::Relaxed),
            alloc_cas_attempts: c.alloc_cas_attempts.load(Ordering::Relaxed),
            alloc_cas_retries: c.alloc_cas_retries.load(Ordering::Relaxed),
            free_cas_retries: c.free_cas_retries.load(Ordering::Relaxed),
            lock_fast,
            lock_contended,
            current_cas_attempts: c.current_cas_attempts.load(Ordering::Relaxed),
            current_cas_failures: c.current_cas_failures.load(Ordering::Relaxed),
            zombie_repairs: c.zombie_repairs.load(Ordering::Relaxed),
            pages_mapped: c.pages_mapped.load(Ordering::Relaxed),
            bytes_committed: c.bytes_committed.load(Ordering::Relaxed),
            partial_slabs,
            full_slabs,
            cache_len,
            overflow_len,
            scan_randomized: pool.scan_randomized(),
        })
    }

    /// Snapshot of one (size class, epoch) pair.
    pub fn stats_epoch(&self, class: usize, epoch: EpochId) -> Option<EpochClassStats> {
        if class == 0 || class >= NUM_SIZE_CLASSES || epoch as usize >= EPOCH_COUNT {
            return None;
        }
        let (partial_slabs, full_slabs, reclaimable_slabs, current_published) =
            self.pools()[class].epoch_snapshot(epoch);
        Some(EpochClassStats {
            partial_slabs,
            full_slabs,
            reclaimable_slabs,
            current_published,
        })
    }

    /// Snapshot of one epoch aggregated across all size classes.
    pub fn stats_epoch_global(&self, epoch: EpochId) -> Option<EpochStats> {
        if epoch as usize >= EPOCH_COUNT {
            return None;
        }
        let ring = self.ring();
        let label = ring.label(epoch);
        let mut label_bytes = [0u8; LABEL_CAP];
        let label_str = label.as_str();
        label_bytes[..label_str.len()].copy_from_slice(label_str.as_bytes());
        let label_id = match ring.label_id(epoch) {
            NO_LABEL_ID => None,
            id => Some(id),
        };

        let mut partial_slabs = 0;
        let mut full_slabs = 0;
        let mut reclaimable_slabs = 0;
        for pool in &self.pools()[1..] {
            let (partial, full, reclaimable, _) = pool.epoch_snapshot(epoch);
            partial_slabs += partial;
            full_slabs += full;
            reclaimable_slabs += reclaimable;
        }

        Some(EpochStats {
            state: ring.state(epoch),
            era: ring.era(epoch),
            age_micros: ring.age_micros(epoch),
            refcount: ring.refcount(epoch),
            label: label_bytes,
            label_len: label_str.len() as u8,
            label_id,
            partial_slabs,
            full_slabs,
            reclaimable_slabs,
            est_rss_bytes: ((partial_slabs + full_slabs) * crate::config::PAGE_SIZE) as u64,
        })
    }
}
