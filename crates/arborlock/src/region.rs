//! Per-node ticket-based spin admission primitive.
//!
//! A [`RegionGuard`] provides shared/exclusive mutual exclusion over one
//! node's fields using a single composite `AtomicU64` ticket counter — no
//! heap allocation, no OS primitives, strictly FIFO admission.
//!
//! ## Protocol
//!
//! The 64-bit word is split into a "free" half (tickets issued, upper 32
//! bits) and a "current" half (tickets retired, lower 32 bits). Each half
//! subdivides into a 16-bit total sub-counter and a 16-bit exclusive
//! sub-counter:
//!
//! ```text
//! [ free.total:16 | free.exclusive:16 | current.total:16 | current.exclusive:16 ]
//! ```
//!
//! Entry issues a ticket with one `fetch_add` on the free half; the caller
//! then spins until admitted:
//!
//! - a shared ticket is admitted once every exclusive ticket issued before
//!   it has retired (`current.exclusive` catches up to the exclusive count
//!   sampled at issue time), so shared holders overlap freely;
//! - an exclusive ticket is admitted once every ticket issued before it has
//!   retired (`current.total` catches up), so exclusive holders serialize
//!   against everyone.
//!
//! Exit retires the ticket by advancing the current half by the same
//! increment used at entry. Counter comparisons use wrapping subtraction
//! within a bounded active window, so the counters never need resetting.
//!
//! Regions are NOT reentrant: entering the same guard twice on one thread
//! with an exclusive ticket in between deadlocks, exactly like a ticket
//! spinlock.
//!
//! ## Metrics
//!
//! - `arborlock_region_enters_total`: successful admissions.
//! - `arborlock_region_spins_total`: spin iterations while waiting.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// ---------------------------------------------------------------------------
// Global metrics (lock-free, Relaxed ordering)
// ---------------------------------------------------------------------------

static ARBORLOCK_REGION_ENTERS_TOTAL: AtomicU64 = AtomicU64::new(0);
static ARBORLOCK_REGION_SPINS_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Snapshot of region guard metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegionMetrics {
    pub arborlock_region_enters_total: u64,
    pub arborlock_region_spins_total: u64,
}

/// Read current region guard metrics.
#[must_use]
pub fn region_metrics() -> RegionMetrics {
    RegionMetrics {
        arborlock_region_enters_total: ARBORLOCK_REGION_ENTERS_TOTAL.load(Ordering::Relaxed),
        arborlock_region_spins_total: ARBORLOCK_REGION_SPINS_TOTAL.load(Ordering::Relaxed),
    }
}

/// Reset metrics (for tests).
pub fn reset_region_metrics() {
    ARBORLOCK_REGION_ENTERS_TOTAL.store(0, Ordering::Relaxed);
    ARBORLOCK_REGION_SPINS_TOTAL.store(0, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// CacheAligned<T>
// ---------------------------------------------------------------------------

/// Transparent wrapper forcing cache-line alignment of the ticket word so
/// adjacent node slots do not false-share.
#[derive(Default)]
#[repr(align(64))]
pub struct CacheAligned<T> {
    value: T,
}

impl<T> CacheAligned<T> {
    /// Wrap `value` with cache-line alignment.
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> std::ops::Deref for CacheAligned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> std::ops::DerefMut for CacheAligned<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CacheAligned<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Ticket word layout
// ---------------------------------------------------------------------------

const FREE_TOTAL_UNIT: u64 = 1 << 48;
const FREE_EXCLUSIVE_UNIT: u64 = 1 << 32;
const CURRENT_TOTAL_UNIT: u64 = 1 << 16;
const CURRENT_EXCLUSIVE_UNIT: u64 = 1;

/// Spins between `yield_now` calls once the fast window is exhausted.
const SPINS_BEFORE_YIELD: u32 = 64;

#[inline]
fn free_total(word: u64) -> u16 {
    (word >> 48) as u16
}

#[inline]
fn free_exclusive(word: u64) -> u16 {
    (word >> 32) as u16
}

#[inline]
fn current_total(word: u64) -> u16 {
    (word >> 16) as u16
}

#[inline]
fn current_exclusive(word: u64) -> u16 {
    word as u16
}

/// Wraparound-safe "has `current` caught up to `ticket`" test. The active
/// window is bounded by the number of in-flight tickets (far below 2^16),
/// so a wrapping difference of zero is unambiguous.
#[inline]
fn caught_up(current: u16, ticket: u16) -> bool {
    current.wrapping_sub(ticket) == 0
}

// ---------------------------------------------------------------------------
// RegionGuard
// ---------------------------------------------------------------------------

/// Ticket-based spin admission counter guarding one node's fields.
pub struct RegionGuard {
    word: CacheAligned<AtomicU64>,
}

impl RegionGuard {
    /// Create a guard with no tickets outstanding.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: CacheAligned::new(AtomicU64::new(0)),
        }
    }

    /// Take a shared ticket and spin until admitted. Shared holders overlap;
    /// they are only ordered against exclusive tickets.
    #[inline]
    pub fn enter_shared(&self) -> Region<'_> {
        self.enter(false)
    }

    /// Take an exclusive ticket and spin until admitted. Serializes against
    /// every ticket issued earlier.
    #[inline]
    pub fn enter_exclusive(&self) -> Region<'_> {
        self.enter(true)
    }

    fn enter(&self, exclusive: bool) -> Region<'_> {
        let increment = if exclusive {
            FREE_TOTAL_UNIT | FREE_EXCLUSIVE_UNIT
        } else {
            FREE_TOTAL_UNIT
        };
        let issued = self.word.fetch_add(increment, Ordering::AcqRel);
        let ticket_total = free_total(issued);
        let ticket_exclusive = free_exclusive(issued);

        let mut spins: u32 = 0;
        loop {
            let word = self.word.load(Ordering::Acquire);
            let admitted = if exclusive {
                caught_up(current_total(word), ticket_total)
            } else {
                caught_up(current_exclusive(word), ticket_exclusive)
            };
            if admitted {
                break;
            }
            spins += 1;
            if spins.is_multiple_of(SPINS_BEFORE_YIELD) {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }

        ARBORLOCK_REGION_ENTERS_TOTAL.fetch_add(1, Ordering::Relaxed);
        if spins > 0 {
            ARBORLOCK_REGION_SPINS_TOTAL.fetch_add(u64::from(spins), Ordering::Relaxed);
            if spins >= SPINS_BEFORE_YIELD {
                tracing::trace!(spins, exclusive, "contended region entry");
            }
        }

        Region {
            guard: self,
            exclusive,
        }
    }

    /// Retire a ticket, admitting the next one in line.
    fn exit(&self, exclusive: bool) {
        let increment = if exclusive {
            CURRENT_TOTAL_UNIT | CURRENT_EXCLUSIVE_UNIT
        } else {
            CURRENT_TOTAL_UNIT
        };
        self.word.fetch_add(increment, Ordering::Release);
    }

    /// True if no ticket is currently held or waiting. Diagnostic only;
    /// the answer can be stale by the time the caller looks at it.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        let word = self.word.load(Ordering::Acquire);
        caught_up(current_total(word), free_total(word))
            && caught_up(current_exclusive(word), free_exclusive(word))
    }
}

impl Default for RegionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RegionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let word = self.word.load(Ordering::Relaxed);
        f.debug_struct("RegionGuard")
            .field("free_total", &free_total(word))
            .field("free_exclusive", &free_exclusive(word))
            .field("current_total", &current_total(word))
            .field("current_exclusive", &current_exclusive(word))
            .finish()
    }
}

/// An admitted ticket. Dropping it retires the ticket and admits the next
/// caller in FIFO order.
pub struct Region<'a> {
    guard: &'a RegionGuard,
    exclusive: bool,
}

impl Region<'_> {
    /// Whether this region was entered exclusively.
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

impl Drop for Region<'_> {
    fn drop(&mut self) {
        self.guard.exit(self.exclusive);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn test_uncontended_shared_entry() {
        let guard = RegionGuard::new();
        let a = guard.enter_shared();
        let b = guard.enter_shared();
        assert!(!a.is_exclusive());
        assert!(!b.is_exclusive());
        drop(a);
        drop(b);
        assert!(guard.is_quiescent());
    }

    #[test]
    fn test_exclusive_entry_round_trip() {
        let guard = RegionGuard::new();
        {
            let region = guard.enter_exclusive();
            assert!(region.is_exclusive());
            assert!(!guard.is_quiescent());
        }
        assert!(guard.is_quiescent());
    }

    #[test]
    fn test_shared_tickets_overlap() {
        // Both shared regions must be admitted at the same time; if shared
        // tickets serialized, holding one while entering the other would
        // deadlock rather than return.
        let guard = RegionGuard::new();
        let first = guard.enter_shared();
        let second = guard.enter_shared();
        drop(second);
        drop(first);
    }

    #[test]
    fn test_exclusive_excludes_shared_under_threads() {
        let guard = Arc::new(RegionGuard::new());
        let in_exclusive = Arc::new(AtomicU32::new(0));
        let violations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for worker in 0..8_u32 {
            let guard = Arc::clone(&guard);
            let in_exclusive = Arc::clone(&in_exclusive);
            let violations = Arc::clone(&violations);
            handles.push(thread::spawn(move || {
                for round in 0..500_u32 {
                    if (worker + round) % 3 == 0 {
                        let _region = guard.enter_exclusive();
                        let before = in_exclusive.fetch_add(1, Ordering::SeqCst);
                        if before != 0 {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        in_exclusive.fetch_sub(1, Ordering::SeqCst);
                    } else {
                        let _region = guard.enter_shared();
                        if in_exclusive.load(Ordering::SeqCst) != 0 {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().expect("worker panicked");
        }

        assert_eq!(
            violations.load(Ordering::SeqCst),
            0,
            "exclusive region admitted concurrently with another ticket"
        );
        assert!(guard.is_quiescent());
    }

    #[test]
    fn test_wraparound_survives_many_tickets() {
        // Push the 16-bit sub-counters through several wraps.
        let guard = RegionGuard::new();
        for _ in 0..(u32::from(u16::MAX) + 500) {
            let region = guard.enter_exclusive();
            drop(region);
        }
        assert!(guard.is_quiescent());
        let region = guard.enter_shared();
        drop(region);
        assert!(guard.is_quiescent());
    }

    #[test]
    fn test_metrics_advance() {
        reset_region_metrics();
        let guard = RegionGuard::new();
        drop(guard.enter_shared());
        drop(guard.enter_exclusive());
        let metrics = region_metrics();
        assert!(metrics.arborlock_region_enters_total >= 2);
    }
}
