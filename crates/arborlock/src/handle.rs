//! Public handle facade: [`Request`], [`Lock`], and [`UpgradeRequest`].
//!
//! Handles are light tokens — a generation-checked node reference plus a
//! shared pointer to the manager internals — so they are `Send + Sync` and
//! cheap to pass around. A handle whose node was recycled (its lifecycle
//! completed and the slot went back to the pool) fails generation
//! validation and reports [`LockError::StaleHandle`] rather than aliasing
//! an unrelated lock.
//!
//! Obtaining the eventual lock never needs a distinct "async tree": the
//! synchronous path busy-polls the same lock-free status word a registered
//! continuation observes, so [`Request::wait`] spins briefly and then parks
//! on a continuation.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::arena::{NodeRef, NodeSlot};
use crate::manager::ManagerShared;
use crate::state::{LockMode, LockStatus};
use arborlock_error::LockError;

/// Spins on the status word before falling back to a parked continuation.
const WAIT_SPIN_LIMIT: u32 = 256;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A queued lock request: pending, cancelable, and resolvable into a
/// [`Lock`] once granted.
#[derive(Clone)]
pub struct Request {
    shared: Arc<ManagerShared>,
    node: NodeRef,
}

impl Request {
    pub(crate) fn new(shared: Arc<ManagerShared>, node: NodeRef) -> Self {
        Self { shared, node }
    }

    fn status(&self) -> Option<LockStatus> {
        self.shared
            .tree
            .arena()
            .get(self.node)
            .map(NodeSlot::status)
    }

    /// Still queued behind incompatible siblings or ancestors.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status() == Some(LockStatus::Pending)
    }

    /// Resolved to a granted lock.
    #[must_use]
    pub fn is_granted(&self) -> bool {
        self.status() == Some(LockStatus::Granted)
    }

    /// Resolved by cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.status() == Some(LockStatus::Cancelled)
    }

    /// Cancel a still-pending request. Returns `true` when this call won
    /// the race against the grant cascade; a no-op (`false`) when the
    /// request already resolved either way.
    pub fn cancel(&self) -> bool {
        self.shared.tree.cancel(self.node)
    }

    /// Register a continuation that fires exactly once when the request
    /// resolves (granted or cancelled), or immediately when it already has.
    /// Continuations run on the manager's work queue, never inline under
    /// the resolving thread's tree regions.
    ///
    /// A handle that went stale (the node finished its whole lifecycle and
    /// was recycled) observes `LockStatus::Released`.
    pub fn on_completed<F>(&self, continuation: F)
    where
        F: FnOnce(LockStatus) + Send + 'static,
    {
        let Some(slot) = self.shared.tree.arena().get(self.node) else {
            self.shared
                .tree
                .dispatch_resolution(Box::new(continuation), LockStatus::Released);
            return;
        };
        if let Some((waiter, status)) = slot.push_resolve_waiter(Box::new(continuation)) {
            self.shared.tree.dispatch_resolution(waiter, status);
        }
    }

    /// Block until the request resolves: a bounded busy-spin on the status
    /// word, then a parked continuation.
    pub fn wait(&self) {
        for spin in 0..WAIT_SPIN_LIMIT {
            match self.status() {
                Some(LockStatus::Pending) => {
                    if spin % 16 == 15 {
                        std::thread::yield_now();
                    } else {
                        std::hint::spin_loop();
                    }
                }
                _ => return,
            }
        }

        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&gate);
        self.on_completed(move |_| {
            let (done, condvar) = &*signal;
            *done.lock() = true;
            condvar.notify_all();
        });
        let (done, condvar) = &*gate;
        let mut resolved = done.lock();
        while !*resolved {
            condvar.wait(&mut resolved);
        }
    }

    /// The granted lock. Idempotent after resolution: every call on a
    /// granted request observes an equally valid [`Lock`].
    ///
    /// # Errors
    ///
    /// [`LockError::RequestCancelled`] when the request resolved to
    /// Cancelled, [`LockError::RequestPending`] before resolution, and
    /// [`LockError::StaleHandle`] once the node was recycled.
    pub fn get_lock(&self) -> Result<Lock, LockError> {
        match self.status() {
            Some(LockStatus::Granted) => Ok(Lock {
                shared: Arc::clone(&self.shared),
                node: self.node,
            }),
            Some(LockStatus::Cancelled) => Err(LockError::RequestCancelled),
            Some(LockStatus::Pending) => Err(LockError::RequestPending),
            Some(status) => Err(LockError::UnexpectedStatus {
                expected: LockStatus::Granted.name(),
                actual: status.name(),
            }),
            None => Err(LockError::StaleHandle),
        }
    }

    /// Convenience: wait for resolution, then take the lock.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`get_lock`](Self::get_lock).
    pub fn lock(&self) -> Result<Lock, LockError> {
        self.wait();
        self.get_lock()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("node", &self.node.index)
            .field("status", &self.status().map(LockStatus::name))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Lock
// ---------------------------------------------------------------------------

/// A granted lock: releasable, upgradeable (when requested Upgradeable),
/// and bindable as the current context's nesting scope.
pub struct Lock {
    shared: Arc<ManagerShared>,
    node: NodeRef,
}

impl Lock {
    /// The mode the lock currently behaves as. `None` once the handle is
    /// stale.
    #[must_use]
    pub fn mode(&self) -> Option<LockMode> {
        self.shared
            .tree
            .arena()
            .get(self.node)
            .map(NodeSlot::effective_mode)
    }

    /// Whether the lock currently excludes its siblings.
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.mode() == Some(LockMode::Exclusive)
    }

    /// Release the lock: detaches the node, reparents its children to its
    /// former parent preserving order, retriggers the grant cascade for
    /// newly unblocked siblings, and recycles the node.
    ///
    /// # Errors
    ///
    /// [`LockError::UnexpectedStatus`] on double release while the slot is
    /// still live; [`LockError::StaleHandle`] once it has been recycled.
    pub fn release(&self) -> Result<(), LockError> {
        let result = self.shared.tree.release(self.node);
        if result.is_ok() {
            self.shared.binding.clear_if(self.node);
        }
        result
    }

    /// Ask an Upgradeable lock to become Exclusive. Satisfied synchronously
    /// when no granted sibling blocks it at any level; otherwise the
    /// intention stands and resolves through the cascade once the blockers
    /// release.
    ///
    /// # Errors
    ///
    /// [`LockError::NotUpgradeable`] for Shared/Exclusive locks,
    /// [`LockError::UpgradePending`] when an upgrade is already
    /// outstanding.
    pub fn upgrade(&self) -> Result<UpgradeRequest, LockError> {
        self.shared.tree.upgrade(self.node)?;
        Ok(UpgradeRequest {
            shared: Arc::clone(&self.shared),
            node: self.node,
        })
    }

    /// Revoke a standing upgrade (or demote a satisfied one), letting
    /// blocked siblings grant again.
    ///
    /// # Errors
    ///
    /// [`LockError::NotDowngradeable`] without a standing upgrade.
    pub fn downgrade(&self) -> Result<(), LockError> {
        self.shared.tree.downgrade(self.node)
    }

    /// Record this lock as the calling context's current nesting scope, so
    /// subsequent requests on this context nest under it.
    ///
    /// # Errors
    ///
    /// [`LockError::BindOrder`] unless this lock's parent is the currently
    /// bound lock (or this lock hangs off the root and nothing is bound).
    pub fn bind(&self) -> Result<(), LockError> {
        let Some(slot) = self.shared.tree.arena().get(self.node) else {
            return Err(LockError::StaleHandle);
        };
        let status = slot.status();
        if status != LockStatus::Granted {
            return Err(LockError::UnexpectedStatus {
                expected: LockStatus::Granted.name(),
                actual: status.name(),
            });
        }
        let parent = slot.parent();
        let permitted = match self.shared.binding.current() {
            Some(bound) => parent == Some(bound),
            None => parent == Some(self.shared.tree.root()),
        };
        if !permitted {
            return Err(LockError::BindOrder);
        }
        self.shared.binding.set(self.node);
        Ok(())
    }

    /// Pop the binding back to this lock's parent.
    ///
    /// # Errors
    ///
    /// [`LockError::NotBound`] when this lock is not the current binding.
    pub fn unbind(&self) -> Result<(), LockError> {
        if self.shared.binding.current() != Some(self.node) {
            return Err(LockError::NotBound);
        }
        let parent = self
            .shared
            .tree
            .arena()
            .get(self.node)
            .and_then(NodeSlot::parent);
        let restored = parent.filter(|&p| p != self.shared.tree.root());
        self.shared.binding.replace(restored);
        Ok(())
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("node", &self.node.index)
            .field("mode", &self.mode().map(LockMode::name))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// UpgradeRequest
// ---------------------------------------------------------------------------

/// A standing request that an Upgradeable lock become Exclusive.
#[derive(Clone)]
pub struct UpgradeRequest {
    shared: Arc<ManagerShared>,
    node: NodeRef,
}

impl UpgradeRequest {
    /// Whether the upgrade has taken effect.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        self.shared
            .tree
            .arena()
            .get(self.node)
            .is_some_and(|slot| slot.effective_mode() == LockMode::Exclusive)
    }

    /// Register a continuation fired exactly once with `true` when the
    /// upgrade is satisfied, or `false` when it is abandoned (downgrade or
    /// release before satisfaction).
    pub fn on_completed<F>(&self, continuation: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let Some(slot) = self.shared.tree.arena().get(self.node) else {
            self.shared
                .tree
                .dispatch_upgrade(Box::new(continuation), false);
            return;
        };
        if let Some((waiter, satisfied)) = slot.push_upgrade_waiter(Box::new(continuation)) {
            self.shared.tree.dispatch_upgrade(waiter, satisfied);
        }
    }

    /// Block until the upgrade is satisfied or abandoned.
    pub fn wait(&self) {
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&gate);
        self.on_completed(move |_| {
            let (done, condvar) = &*signal;
            *done.lock() = true;
            condvar.notify_all();
        });
        let (done, condvar) = &*gate;
        let mut resolved = done.lock();
        while !*resolved {
            condvar.wait(&mut resolved);
        }
    }
}

impl std::fmt::Debug for UpgradeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeRequest")
            .field("node", &self.node.index)
            .field("satisfied", &self.is_satisfied())
            .finish()
    }
}

// free function so the manager can mint Lock values without exposing fields
pub(crate) fn lock_from_parts(shared: Arc<ManagerShared>, node: NodeRef) -> Lock {
    Lock { shared, node }
}
