//! Bounded free-list recycling of node slots.
//!
//! Releasing or cancelling a lock retires its arena slot; the pool keeps up
//! to `capacity` retired slot indices for reuse so a steady request/release
//! workload allocates nothing after warm-up. The pool is owned by its
//! manager — never a process-wide singleton — so independent managers stay
//! composable and testable.
//!
//! ## Metrics
//!
//! - `arborlock_pool_takes_total`: successful `try_take` calls.
//! - `arborlock_pool_returns_total`: slots accepted back.
//! - `arborlock_pool_drops_total`: slots refused because the pool was full
//!   (the slot is permanently retired; its generation was already bumped).

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

// ---------------------------------------------------------------------------
// Global metrics (lock-free, Relaxed ordering)
// ---------------------------------------------------------------------------

static ARBORLOCK_POOL_TAKES_TOTAL: AtomicU64 = AtomicU64::new(0);
static ARBORLOCK_POOL_RETURNS_TOTAL: AtomicU64 = AtomicU64::new(0);
static ARBORLOCK_POOL_DROPS_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Snapshot of node pool metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolMetrics {
    pub arborlock_pool_takes_total: u64,
    pub arborlock_pool_returns_total: u64,
    pub arborlock_pool_drops_total: u64,
}

/// Read current node pool metrics.
#[must_use]
pub fn pool_metrics() -> PoolMetrics {
    PoolMetrics {
        arborlock_pool_takes_total: ARBORLOCK_POOL_TAKES_TOTAL.load(Ordering::Relaxed),
        arborlock_pool_returns_total: ARBORLOCK_POOL_RETURNS_TOTAL.load(Ordering::Relaxed),
        arborlock_pool_drops_total: ARBORLOCK_POOL_DROPS_TOTAL.load(Ordering::Relaxed),
    }
}

/// Reset metrics (for tests).
pub fn reset_pool_metrics() {
    ARBORLOCK_POOL_TAKES_TOTAL.store(0, Ordering::Relaxed);
    ARBORLOCK_POOL_RETURNS_TOTAL.store(0, Ordering::Relaxed);
    ARBORLOCK_POOL_DROPS_TOTAL.store(0, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// NodePool
// ---------------------------------------------------------------------------

/// Bounded LIFO free list of retired arena slot indices.
pub(crate) struct NodePool {
    free: Mutex<Vec<u32>>,
    capacity: usize,
}

impl NodePool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Pop a recycled slot index, most recently returned first (LIFO keeps
    /// the hot slot's cache lines warm).
    pub(crate) fn try_take(&self) -> Option<u32> {
        let taken = self.free.lock().pop();
        if taken.is_some() {
            ARBORLOCK_POOL_TAKES_TOTAL.fetch_add(1, Ordering::Relaxed);
        }
        taken
    }

    /// Offer a retired slot index back. Returns `false` when the pool is at
    /// capacity; the caller must treat the slot as permanently retired.
    pub(crate) fn try_return(&self, index: u32) -> bool {
        let mut free = self.free.lock();
        if free.len() >= self.capacity {
            drop(free);
            ARBORLOCK_POOL_DROPS_TOTAL.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        free.push(index);
        drop(free);
        ARBORLOCK_POOL_RETURNS_TOTAL.fetch_add(1, Ordering::Relaxed);
        true
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.free.lock().len()
    }

    #[must_use]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for NodePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodePool")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_from_empty_pool() {
        let pool = NodePool::new(4);
        assert_eq!(pool.try_take(), None);
    }

    #[test]
    fn test_lifo_reuse_order() {
        let pool = NodePool::new(4);
        assert!(pool.try_return(1));
        assert!(pool.try_return(2));
        assert_eq!(pool.try_take(), Some(2), "most recently returned first");
        assert_eq!(pool.try_take(), Some(1));
        assert_eq!(pool.try_take(), None);
    }

    #[test]
    fn test_capacity_bound_refuses_overflow() {
        let pool = NodePool::new(2);
        assert!(pool.try_return(1));
        assert!(pool.try_return(2));
        assert!(!pool.try_return(3), "full pool must refuse");
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn test_zero_capacity_pool_always_refuses() {
        let pool = NodePool::new(0);
        assert!(!pool.try_return(7));
        assert_eq!(pool.try_take(), None);
    }
}
