//! The lock manager: owns the permanently granted root, the arena and
//! pool, the binding table, and the work queue; exposes the public
//! request/lock API.

use std::sync::Arc;

use serde::Serialize;

use crate::arena::NodeRef;
use crate::binding::{self, BindingContext};
use crate::handle::{self, Lock, Request};
use crate::node::LockTree;
use crate::state::LockMode;
use crate::work::{InlineWorkQueue, WorkQueue};
use arborlock_error::LockError;

// ---------------------------------------------------------------------------
// ManagerConfig
// ---------------------------------------------------------------------------

/// Sizing knobs for a [`LockManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ManagerConfig {
    /// Maximum retired node slots kept for reuse.
    pub pool_capacity: usize,
    /// Arena chunks allocated up front (one chunk holds 64 slots).
    pub initial_chunks: usize,
}

impl ManagerConfig {
    pub const DEFAULT_POOL_CAPACITY: usize = 256;
    pub const DEFAULT_INITIAL_CHUNKS: usize = 1;

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// [`LockError::InvalidConfig`] when no arena chunk would exist for the
    /// root node.
    pub fn validate(self) -> Result<(), LockError> {
        if self.initial_chunks == 0 {
            return Err(LockError::InvalidConfig {
                reason: "initial_chunks must be at least 1",
            });
        }
        Ok(())
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            pool_capacity: Self::DEFAULT_POOL_CAPACITY,
            initial_chunks: Self::DEFAULT_INITIAL_CHUNKS,
        }
    }
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

/// Internals shared between the manager and every handle it mints.
pub(crate) struct ManagerShared {
    pub(crate) tree: LockTree,
    pub(crate) binding: BindingContext,
}

/// Hierarchical multi-granularity lock manager.
///
/// Owns a permanently granted root node; every request nests under the
/// calling context's bound lock, or the root when nothing is bound.
/// Cloning is cheap and clones address the same tree.
#[derive(Clone)]
pub struct LockManager {
    shared: Arc<ManagerShared>,
}

impl LockManager {
    /// A manager with default sizing and inline continuation dispatch.
    #[must_use]
    pub fn new() -> Self {
        Self::with_work_queue(ManagerConfig::default(), Arc::new(InlineWorkQueue))
            .expect("default configuration is valid")
    }

    /// A manager with explicit sizing.
    ///
    /// # Errors
    ///
    /// [`LockError::InvalidConfig`] from [`ManagerConfig::validate`].
    pub fn with_config(config: ManagerConfig) -> Result<Self, LockError> {
        Self::with_work_queue(config, Arc::new(InlineWorkQueue))
    }

    /// A manager dispatching resolution continuations to `work` — e.g. a
    /// [`crate::ThreadedWorkQueue`] to keep caller logic off the
    /// releasing thread.
    ///
    /// # Errors
    ///
    /// [`LockError::InvalidConfig`] from [`ManagerConfig::validate`].
    pub fn with_work_queue(
        config: ManagerConfig,
        work: Arc<dyn WorkQueue>,
    ) -> Result<Self, LockError> {
        config.validate()?;
        let shared = ManagerShared {
            tree: LockTree::new(config.pool_capacity, config.initial_chunks, work),
            binding: BindingContext::new(binding::allocate_manager_id()),
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Queue a lock request of `mode` under the calling context's bound
    /// lock (the root when nothing is bound). Never blocks; the returned
    /// [`Request`] may already be granted.
    pub fn request_lock(&self, mode: LockMode) -> Request {
        let parent = self.resolve_parent();
        let node = self.shared.tree.new_request(parent, mode);
        Request::new(Arc::clone(&self.shared), node)
    }

    /// Fast, non-queueing path: the lock is granted only if that can
    /// happen immediately, without the node ever being visible as Pending.
    #[must_use]
    pub fn try_get_lock(&self, mode: LockMode) -> Option<Lock> {
        let parent = self.resolve_parent();
        let node = self.shared.tree.try_acquire_immediate(parent, mode)?;
        Some(handle::lock_from_parts(Arc::clone(&self.shared), node))
    }

    /// The structural parent for a new request: the bound node when its
    /// handle is still live, otherwise the root (clearing a binding whose
    /// lock completed its lifecycle on another thread).
    fn resolve_parent(&self) -> NodeRef {
        match self.shared.binding.current() {
            Some(bound) => {
                if self.shared.tree.arena().get(bound).is_some() {
                    bound
                } else {
                    self.shared.binding.clear_if(bound);
                    self.shared.tree.root()
                }
            }
            None => self.shared.tree.root(),
        }
    }

    /// Retired slots currently pooled for reuse.
    #[must_use]
    pub fn pooled_nodes(&self) -> usize {
        self.shared.tree.pool().len()
    }

    /// Slots the arena has handed out at least once.
    #[must_use]
    pub fn node_slots(&self) -> u32 {
        self.shared.tree.arena().slot_count()
    }

    /// Walk the whole tree checking the structural invariants. Intended
    /// for tests and debugging on a quiesced manager; concurrent mutation
    /// produces spurious reports.
    ///
    /// # Errors
    ///
    /// A human-readable description of the first violation found.
    pub fn validate_tree(&self) -> Result<crate::invariants::TreeStats, String> {
        crate::invariants::validate(&self.shared.tree)
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("node_slots", &self.node_slots())
            .field("pooled_nodes", &self.pooled_nodes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        ManagerConfig::default().validate().expect("default valid");
    }

    #[test]
    fn test_zero_chunks_rejected() {
        let config = ManagerConfig {
            pool_capacity: 4,
            initial_chunks: 0,
        };
        assert_eq!(
            config.validate(),
            Err(LockError::InvalidConfig {
                reason: "initial_chunks must be at least 1",
            })
        );
        assert!(LockManager::with_config(config).is_err());
    }

    #[test]
    fn test_clones_share_the_tree() {
        let manager = LockManager::new();
        let clone = manager.clone();

        let exclusive = manager.try_get_lock(LockMode::Exclusive).expect("fast path");
        assert!(
            clone.try_get_lock(LockMode::Exclusive).is_none(),
            "clone must observe the same tree"
        );
        exclusive.release().expect("release");
        assert!(clone.try_get_lock(LockMode::Exclusive).is_some());
    }
}
