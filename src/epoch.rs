//! Epoch ring: a fixed cyclic set of temporal allocation phases.
//!
//! Each of the 16 ring slots carries a lifecycle state (ACTIVE/CLOSING), a
//! monotonic era stamped at every activation, a domain refcount, an open
//! timestamp and an optional label. The ring index wraps; the era never
//! does, which is what lets epoch domains detect that a ring slot has been
//! reused since they captured it.

use crate::config::EPOCH_COUNT;
use crate::platform;
use crate::sync::SpinMutex;
use core::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

/// Ring index of an epoch, 0..EPOCH_COUNT.
pub type EpochId = u32;

/// Lifecycle state of an epoch slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum EpochState {
    /// Closed or never activated; allocation requests are refused and the
    /// epoch is eligible for `epoch_close` reclamation.
    Closing = 0,
    /// The single epoch currently accepting allocations.
    Active = 1,
}

/// Maximum label length in bytes.
pub const LABEL_CAP: usize = 32;

/// Sentinel for "no compact label id assigned".
pub const NO_LABEL_ID: u8 = u8::MAX;

/// A fixed-capacity epoch label.
#[derive(Clone, Copy)]
pub struct LabelBuf {
    len: u8,
    bytes: [u8; LABEL_CAP],
}

impl LabelBuf {
    pub const fn empty() -> Self {
        Self {
            len: 0,
            bytes: [0; LABEL_CAP],
        }
    }

    /// Copy from `s`, truncating to [`LABEL_CAP`] on a char boundary.
    pub fn set(&mut self, s: &str) {
        let mut end = s.len().min(LABEL_CAP);
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        self.bytes[..end].copy_from_slice(&s.as_bytes()[..end]);
        self.len = end as u8;
    }

    pub fn as_str(&self) -> &str {
        // Only ever filled from `set`, which preserves UTF-8 boundaries.
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct EpochSlot {
    state: AtomicU8,
    era: AtomicU64,
    /// Number of domains currently holding this epoch open. Distinct from
    /// any allocation count: it tracks scopes, not objects.
    refcount: AtomicU32,
    opened_at_micros: AtomicU64,
    label: SpinMutex<LabelBuf>,
    label_id: AtomicU8,
}

impl EpochSlot {
    const fn new() -> Self {
        Self {
            state: AtomicU8::new(EpochState::Closing as u8),
            era: AtomicU64::new(0),
            refcount: AtomicU32::new(0),
            opened_at_micros: AtomicU64::new(0),
            label: SpinMutex::new(LabelBuf::empty()),
            label_id: AtomicU8::new(NO_LABEL_ID),
        }
    }
}

/// The cyclic set of epochs plus the monotonic era counter.
pub struct EpochRing {
    slots: [EpochSlot; EPOCH_COUNT],
    current: AtomicU32,
    era_counter: AtomicU64,
}

impl EpochRing {
    /// A ring with slot 0 ACTIVE at era 1 and every other slot CLOSING.
    pub fn new() -> Self {
        let ring = Self {
            slots: [const { EpochSlot::new() }; EPOCH_COUNT],
            current: AtomicU32::new(0),
            era_counter: AtomicU64::new(1),
        };
        let slot = &ring.slots[0];
        slot.era.store(1, Ordering::Relaxed);
        slot.opened_at_micros
            .store(platform::monotonic_micros(), Ordering::Relaxed);
        slot.state.store(EpochState::Active as u8, Ordering::Release);
        ring
    }

    /// Ring index of the currently-ACTIVE epoch.
    #[inline]
    pub fn current(&self) -> EpochId {
        self.current.load(Ordering::Acquire)
    }

    #[inline]
    pub fn in_range(epoch: EpochId) -> bool {
        (epoch as usize) < EPOCH_COUNT
    }

    /// Lifecycle state, acquire-paired with the release stores in
    /// [`advance`](Self::advance). Out-of-range indices read as CLOSING.
    #[inline]
    pub fn state(&self, epoch: EpochId) -> EpochState {
        if !Self::in_range(epoch) {
            return EpochState::Closing;
        }
        if self.slots[epoch as usize].state.load(Ordering::Acquire) == EpochState::Active as u8 {
            EpochState::Active
        } else {
            EpochState::Closing
        }
    }

    /// Era currently stamped on a ring slot (0 for out-of-range indices).
    #[inline]
    pub fn era(&self, epoch: EpochId) -> u64 {
        if !Self::in_range(epoch) {
            return 0;
        }
        self.slots[epoch as usize].era.load(Ordering::Acquire)
    }

    /// Highest era handed out so far.
    #[inline]
    pub fn latest_era(&self) -> u64 {
        self.era_counter.load(Ordering::Relaxed)
    }

    /// Close the current epoch and activate the next ring slot with a fresh
    /// era and reset metadata. Returns (closed, activated).
    pub fn advance(&self) -> (EpochId, EpochId) {
        let old = self.current.load(Ordering::Relaxed);
        self.slots[old as usize]
            .state
            .store(EpochState::Closing as u8, Ordering::Release);

        let next = (old + 1) % EPOCH_COUNT as u32;
        let era = self.era_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let slot = &self.slots[next as usize];
        slot.era.store(era, Ordering::Release);
        slot.refcount.store(0, Ordering::Relaxed);
        slot.label_id.store(NO_LABEL_ID, Ordering::Relaxed);
        *slot.label.lock() = LabelBuf::empty();
        slot.opened_at_micros
            .store(platform::monotonic_micros(), Ordering::Relaxed);
        slot.state.store(EpochState::Active as u8, Ordering::Release);
        self.current.store(next, Ordering::Release);
        (old, next)
    }

    pub fn refcount_inc(&self, epoch: EpochId) {
        if Self::in_range(epoch) {
            self.slots[epoch as usize]
                .refcount
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn refcount_dec(&self, epoch: EpochId) {
        if Self::in_range(epoch) {
            // Saturating: a stray decrement (stale caller) must not wrap.
            let _ = self.slots[epoch as usize].refcount.fetch_update(
                Ordering::Relaxed,
                Ordering::Relaxed,
                |v| v.checked_sub(1),
            );
        }
    }

    pub fn refcount(&self, epoch: EpochId) -> u32 {
        if !Self::in_range(epoch) {
            return 0;
        }
        self.slots[epoch as usize].refcount.load(Ordering::Relaxed)
    }

    pub fn set_label(&self, epoch: EpochId, label: &str) {
        if Self::in_range(epoch) {
            self.slots[epoch as usize].label.lock().set(label);
        }
    }

    pub fn label(&self, epoch: EpochId) -> LabelBuf {
        if !Self::in_range(epoch) {
            return LabelBuf::empty();
        }
        *self.slots[epoch as usize].label.lock()
    }

    /// Assign a compact label id (0..EPOCH_COUNT) or [`NO_LABEL_ID`].
    pub fn set_label_id(&self, epoch: EpochId, id: u8) {
        if Self::in_range(epoch) {
            self.slots[epoch as usize].label_id.store(id, Ordering::Relaxed);
        }
    }

    pub fn label_id(&self, epoch: EpochId) -> u8 {
        if !Self::in_range(epoch) {
            return NO_LABEL_ID;
        }
        self.slots[epoch as usize].label_id.load(Ordering::Relaxed)
    }

    /// Microseconds since the epoch was last activated (0 when the clock is
    /// unavailable).
    pub fn age_micros(&self, epoch: EpochId) -> u64 {
        if !Self::in_range(epoch) {
            return 0;
        }
        let opened = self.slots[epoch as usize]
            .opened_at_micros
            .load(Ordering::Relaxed);
        platform::monotonic_micros().saturating_sub(opened)
    }

    /// Number of epochs currently in each state, as (active, closing).
    pub fn state_counts(&self) -> (u32, u32) {
        let mut active = 0;
        for slot in &self.slots {
            if slot.state.load(Ordering::Acquire) == EpochState::Active as u8 {
                active += 1;
            }
        }
        (active, EPOCH_COUNT as u32 - active)
    }
}

impl Default for EpochRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let ring = EpochRing::new();
        assert_eq!(ring.current(), 0);
        assert_eq!(ring.state(0), EpochState::Active);
        assert_eq!(ring.era(0), 1);
        for e in 1..EPOCH_COUNT as u32 {
            assert_eq!(ring.state(e), EpochState::Closing);
            assert_eq!(ring.era(e), 0);
        }
        assert_eq!(ring.state_counts(), (1, EPOCH_COUNT as u32 - 1));
    }

    #[test]
    fn test_advance_moves_ring_index() {
        let ring = EpochRing::new();
        let (old, new) = ring.advance();
        assert_eq!(old, 0);
        assert_eq!(new, 1);
        assert_eq!(ring.current(), 1);
        assert_eq!(ring.state(0), EpochState::Closing);
        assert_eq!(ring.state(1), EpochState::Active);
        // Exactly one ACTIVE at any time
        assert_eq!(ring.state_counts().0, 1);
    }

    #[test]
    fn test_era_strictly_increases_across_wrap() {
        let ring = EpochRing::new();
        let era_at_0 = ring.era(0);
        let mut last_era = era_at_0;
        for _ in 0..EPOCH_COUNT {
            let (_, new) = ring.advance();
            let era = ring.era(new);
            assert!(era > last_era);
            last_era = era;
        }
        // Wrapped back to slot 0 with a strictly newer era
        assert_eq!(ring.current(), 0);
        assert!(ring.era(0) > era_at_0);
    }

    #[test]
    fn test_metadata_reset_on_activation() {
        let ring = EpochRing::new();
        ring.set_label(0, "request");
        ring.set_label_id(0, 3);
        ring.refcount_inc(0);
        assert_eq!(ring.label(0).as_str(), "request");
        assert_eq!(ring.label_id(0), 3);
        assert_eq!(ring.refcount(0), 1);

        // Cycle all the way around; slot 0 gets reset on reactivation
        for _ in 0..EPOCH_COUNT {
            ring.advance();
        }
        assert!(ring.label(0).is_empty());
        assert_eq!(ring.label_id(0), NO_LABEL_ID);
        assert_eq!(ring.refcount(0), 0);
    }

    #[test]
    fn test_label_truncates_on_char_boundary() {
        let ring = EpochRing::new();
        // 31 ASCII bytes + one 2-byte char straddling the cap
        let mut s = std::string::String::new();
        for _ in 0..31 {
            s.push('x');
        }
        s.push('é');
        ring.set_label(0, &s);
        let label = ring.label(0);
        assert_eq!(label.as_str().len(), 31);
        assert!(label.as_str().chars().all(|c| c == 'x'));
    }

    #[test]
    fn test_out_of_range_epoch_is_harmless() {
        let ring = EpochRing::new();
        let bogus = EPOCH_COUNT as u32 + 5;
        assert_eq!(ring.state(bogus), EpochState::Closing);
        assert_eq!(ring.era(bogus), 0);
        assert_eq!(ring.refcount(bogus), 0);
        ring.refcount_inc(bogus);
        ring.refcount_dec(bogus);
        ring.set_label(bogus, "nope");
        assert!(ring.label(bogus).is_empty());
    }
}
