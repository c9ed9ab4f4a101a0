//! Epoch domains: thread-local RAII scopes binding an epoch to an
//! application boundary (a request, a frame, a transaction).
//!
//! A domain captures (epoch id, era) at creation. Entering a domain
//! increments the epoch's global refcount on the local 0->1 transition;
//! exiting decrements it on 1->0 and, for auto-close domains, closes the
//! epoch once it is CLOSING and the captured era still matches. The era
//! check is what makes ring reuse safe: a domain captured before a full
//! ring wrap must never close the slot's new incarnation.
//!
//! Domains are single-threaded objects composed through a fixed-depth
//! per-thread LIFO stack. Cross-thread use and non-LIFO exits are caller
//! contract violations: they abort in checked builds and fail soft (no
//! state change) in release builds.

use crate::allocator::{CloseReport, EpochAlloc};
use crate::config::MAX_DOMAIN_DEPTH;
use crate::epoch::{EpochId, EpochRing};
use crate::sync::thread_id;
use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr;

#[derive(Clone, Copy)]
struct StackEntry {
    domain: *const (),
    epoch: EpochId,
}

struct DomainStack {
    depth: usize,
    entries: [StackEntry; MAX_DOMAIN_DEPTH],
}

impl DomainStack {
    const fn new() -> Self {
        Self {
            depth: 0,
            entries: [StackEntry {
                domain: ptr::null(),
                epoch: 0,
            }; MAX_DOMAIN_DEPTH],
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "nightly")] {
        use core::cell::UnsafeCell;

        #[thread_local]
        static STACK: UnsafeCell<DomainStack> = UnsafeCell::new(DomainStack::new());

        #[inline]
        fn with_stack<R>(f: impl FnOnce(&mut DomainStack) -> R) -> Option<R> {
            // SAFETY: the stack is thread-local and never re-entered; f
            // receives the only live reference.
            Some(f(unsafe { &mut *STACK.get() }))
        }
    } else {
        use core::cell::UnsafeCell;

        std::thread_local! {
            static STACK: UnsafeCell<DomainStack> = const { UnsafeCell::new(DomainStack::new()) };
        }

        #[inline]
        fn with_stack<R>(f: impl FnOnce(&mut DomainStack) -> R) -> Option<R> {
            // try_with: during thread shutdown the TLS slot may already be
            // destroyed; domain operations then fail soft.
            STACK
                .try_with(|cell| {
                    // SAFETY: thread-local and never re-entered.
                    f(unsafe { &mut *cell.get() })
                })
                .ok()
        }
    }
}

/// Epoch bound to the top entry of the calling thread's domain stack, or
/// `None` when no domain is entered.
pub fn current_epoch() -> Option<EpochId> {
    with_stack(|stack| {
        if stack.depth == 0 {
            None
        } else {
            Some(stack.entries[stack.depth - 1].epoch)
        }
    })
    .flatten()
}

/// A thread-local scope over one epoch. Not `Send`: every operation must
/// happen on the creating thread.
pub struct EpochDomain<'a> {
    alloc: &'a EpochAlloc,
    epoch: EpochId,
    era: u64,
    local_refs: Cell<u32>,
    owner: usize,
    auto_close: bool,
    _not_send: PhantomData<*mut ()>,
}

impl<'a> EpochDomain<'a> {
    /// Bind a domain to the currently-ACTIVE epoch.
    pub fn new(alloc: &'a EpochAlloc) -> Self {
        let epoch = alloc.epoch_current();
        Self {
            alloc,
            epoch,
            era: alloc.epoch_era(epoch),
            local_refs: Cell::new(0),
            owner: thread_id(),
            auto_close: false,
            _not_send: PhantomData,
        }
    }

    /// Bind a domain to an explicit ring slot, optionally closing it when
    /// the last exit drops the refcount to zero. Returns `None` for an
    /// out-of-range index.
    pub fn wrap(alloc: &'a EpochAlloc, epoch: EpochId, auto_close: bool) -> Option<Self> {
        if !EpochRing::in_range(epoch) {
            return None;
        }
        Some(Self {
            alloc,
            epoch,
            era: alloc.epoch_era(epoch),
            local_refs: Cell::new(0),
            owner: thread_id(),
            auto_close,
            _not_send: PhantomData,
        })
    }

    #[inline]
    pub fn epoch(&self) -> EpochId {
        self.epoch
    }

    /// Era captured when the domain was created.
    #[inline]
    pub fn era(&self) -> u64 {
        self.era
    }

    /// Local nesting depth.
    #[inline]
    pub fn depth(&self) -> u32 {
        self.local_refs.get()
    }

    /// Whether the bound ring slot still carries the captured era.
    #[inline]
    pub fn era_matches(&self) -> bool {
        self.alloc.epoch_era(self.epoch) == self.era
    }

    #[inline]
    fn owner_ok(&self) -> bool {
        thread_id() == self.owner
    }

    /// Push this domain onto the thread's stack. The local 0->1 transition
    /// increments the epoch's global refcount.
    pub fn enter(&self) -> bool {
        debug_assert!(self.owner_ok(), "epoch domain entered off its owner thread");
        if !self.owner_ok() {
            return false;
        }
        let pushed = with_stack(|stack| {
            if stack.depth >= MAX_DOMAIN_DEPTH {
                return false;
            }
            stack.entries[stack.depth] = StackEntry {
                domain: ptr::from_ref(self).cast(),
                epoch: self.epoch,
            };
            stack.depth += 1;
            true
        })
        .unwrap_or(false);
        debug_assert!(pushed, "epoch domain nesting exceeded MAX_DOMAIN_DEPTH");
        if !pushed {
            return false;
        }
        let refs = self.local_refs.get();
        // A stale-era domain must not touch the reused slot's refcount;
        // its contribution belonged to the previous incarnation.
        if refs == 0 && self.era_matches() {
            self.alloc.epoch_inc_refcount(self.epoch);
        }
        self.local_refs.set(refs + 1);
        true
    }

    /// Pop this domain off the thread's stack. Exits must mirror entries in
    /// LIFO order. The local 1->0 transition decrements the epoch's global
    /// refcount and fires auto-close when armed and the era still matches.
    pub fn exit(&self) -> bool {
        debug_assert!(self.owner_ok(), "epoch domain exited off its owner thread");
        if !self.owner_ok() || self.local_refs.get() == 0 {
            debug_assert!(self.local_refs.get() > 0, "domain exit without enter");
            return false;
        }
        let popped = with_stack(|stack| {
            if stack.depth == 0 {
                return false;
            }
            if stack.entries[stack.depth - 1].domain != ptr::from_ref(self).cast() {
                return false;
            }
            stack.depth -= 1;
            true
        })
        .unwrap_or(false);
        debug_assert!(popped, "non-LIFO epoch domain exit");
        if !popped {
            return false;
        }
        let refs = self.local_refs.get() - 1;
        self.local_refs.set(refs);
        if refs == 0 && self.era_matches() {
            self.alloc.epoch_dec_refcount(self.epoch);
            if self.auto_close {
                // Only succeeds once the epoch has been advanced past;
                // an ACTIVE epoch is left alone.
                let _ = self.alloc.epoch_close(self.epoch);
            }
        }
        true
    }

    /// Close the bound epoch now, regardless of the auto-close flag, but
    /// never across an era change: after ring reuse the slot belongs to a
    /// newer phase. Returns `None` when the era no longer matches or the
    /// epoch is not CLOSING.
    pub fn force_close(&self) -> Option<CloseReport> {
        if !self.era_matches() {
            return None;
        }
        self.alloc.epoch_close(self.epoch).ok()
    }
}

impl Drop for EpochDomain<'_> {
    fn drop(&mut self) {
        #[cfg(feature = "std")]
        if std::thread::panicking() {
            return;
        }
        debug_assert!(
            self.local_refs.get() == 0,
            "epoch domain destroyed while still entered"
        );
    }
}

impl EpochAlloc {
    /// Create a domain bound to the currently-ACTIVE epoch.
    pub fn domain_create(&self) -> EpochDomain<'_> {
        EpochDomain::new(self)
    }

    /// Create a domain bound to an explicit ring slot.
    pub fn domain_wrap(&self, epoch: EpochId, auto_close: bool) -> Option<EpochDomain<'_>> {
        EpochDomain::wrap(self, epoch, auto_close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EPOCH_COUNT;

    #[test]
    fn test_enter_exit_mirrors_refcount() {
        let alloc = EpochAlloc::new();
        let d = alloc.domain_create();
        let e = d.epoch();
        assert_eq!(alloc.epoch_get_refcount(e), 0);
        assert!(d.enter());
        assert_eq!(alloc.epoch_get_refcount(e), 1);
        assert_eq!(current_epoch(), Some(e));

        // Re-entering the same domain nests without another global count
        assert!(d.enter());
        assert_eq!(d.depth(), 2);
        assert_eq!(alloc.epoch_get_refcount(e), 1);

        assert!(d.exit());
        assert_eq!(alloc.epoch_get_refcount(e), 1);
        assert!(d.exit());
        assert_eq!(alloc.epoch_get_refcount(e), 0);
        assert_eq!(current_epoch(), None);
    }

    #[test]
    fn test_distinct_domains_nest_lifo() {
        let alloc = EpochAlloc::new();
        let outer = alloc.domain_create();
        alloc.epoch_advance();
        let inner = alloc.domain_create();
        assert_ne!(outer.epoch(), inner.epoch());

        assert!(outer.enter());
        assert!(inner.enter());
        assert_eq!(current_epoch(), Some(inner.epoch()));
        assert!(inner.exit());
        assert_eq!(current_epoch(), Some(outer.epoch()));
        assert!(outer.exit());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "non-LIFO")]
    fn test_non_lifo_exit_aborts_checked() {
        let alloc = EpochAlloc::new();
        let a = alloc.domain_create();
        let b = alloc.domain_create();
        assert!(a.enter());
        assert!(b.enter());
        let _ = a.exit(); // b is on top: contract violation
    }

    #[test]
    fn test_domain_is_not_send_or_sync() {
        // Cross-thread use is rejected at compile time; the runtime owner
        // check only backstops unsafe pointer smuggling.
        static_assertions::assert_not_impl_any!(EpochDomain<'static>: Send, Sync);
    }

    #[test]
    fn test_max_nesting_depth() {
        let alloc = EpochAlloc::new();
        let d = alloc.domain_create();
        for i in 0..MAX_DOMAIN_DEPTH {
            assert!(d.enter(), "enter {} should succeed", i + 1);
        }
        assert_eq!(d.depth(), MAX_DOMAIN_DEPTH as u32);
        for _ in 0..MAX_DOMAIN_DEPTH {
            assert!(d.exit());
        }
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "MAX_DOMAIN_DEPTH")]
    fn test_overdeep_nesting_aborts_checked() {
        let alloc = EpochAlloc::new();
        let d = alloc.domain_create();
        for _ in 0..MAX_DOMAIN_DEPTH {
            assert!(d.enter());
        }
        let _ = d.enter(); // 33rd: contract violation
    }

    #[test]
    fn test_auto_close_fires_after_advance() {
        let alloc = EpochAlloc::new();
        let e = alloc.epoch_current();
        let a = alloc.alloc(128, e).unwrap();
        assert!(alloc.free(a.handle));

        let d = alloc.domain_wrap(e, true).unwrap();
        assert!(d.enter());
        alloc.epoch_advance();
        assert!(d.exit()); // refcount 0 + era match: auto-close runs

        // A manual close afterwards finds nothing left
        let report = alloc.epoch_close(e).unwrap();
        assert_eq!(report.slabs_reclaimed, 0);
    }

    #[test]
    fn test_auto_close_skipped_while_active() {
        let alloc = EpochAlloc::new();
        let e = alloc.epoch_current();
        let d = alloc.domain_wrap(e, true).unwrap();
        assert!(d.enter());
        assert!(d.exit());
        // The epoch was never advanced; it must still be ACTIVE
        assert_eq!(alloc.epoch_state(e), crate::epoch::EpochState::Active);
    }

    #[test]
    fn test_era_mismatch_blocks_closes() {
        let alloc = EpochAlloc::new();
        let e = alloc.epoch_current();
        let d = alloc.domain_wrap(e, true).unwrap();
        assert!(d.enter());

        // Wrap the ring fully: slot e is reused under a newer era
        for _ in 0..EPOCH_COUNT {
            alloc.epoch_advance();
        }
        assert!(!d.era_matches());
        assert!(d.force_close().is_none());

        let allocation = alloc.alloc(64, alloc.epoch_current()).unwrap();
        assert!(d.exit()); // must NOT close the new incarnation
        assert_eq!(
            alloc.epoch_state(alloc.epoch_current()),
            crate::epoch::EpochState::Active
        );
        assert!(alloc.free(allocation.handle));
    }

    #[test]
    fn test_wrap_rejects_out_of_range() {
        let alloc = EpochAlloc::new();
        assert!(alloc.domain_wrap(EPOCH_COUNT as u32, false).is_none());
    }

    #[test]
    fn test_domains_are_per_thread() {
        let alloc = EpochAlloc::new();
        let d = alloc.domain_create();
        assert!(d.enter());
        // Another thread sees an empty stack
        std::thread::scope(|s| {
            let h = s.spawn(|| current_epoch());
            assert_eq!(h.join().unwrap(), None);
        });
        assert!(d.exit());
    }
}
