//! Binding context: which lock the current logical call context holds.
//!
//! Reentrant nesting is explicit here, never inferred from thread identity:
//! a caller that holds a lock *binds* it, and subsequent requests on the
//! same context nest under the bound node. Binding is only permitted when
//! the candidate's parent is the currently bound node (or the candidate
//! hangs directly off the root and nothing is bound), so reentrant descent
//! is strictly hierarchical; unbinding pops back to the parent.
//!
//! The slot is keyed per manager instance, so independent managers sharing
//! a thread never alias each other's bindings. Managers get their ids from
//! a monotonic process-wide counter.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::arena::NodeRef;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// manager id → currently bound node on this thread.
    static BOUND: RefCell<HashMap<u64, NodeRef>> = RefCell::new(HashMap::new());
}

/// Allocate a process-unique manager id.
pub(crate) fn allocate_manager_id() -> u64 {
    NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Per-manager view of the calling context's binding slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BindingContext {
    manager_id: u64,
}

impl BindingContext {
    pub(crate) fn new(manager_id: u64) -> Self {
        Self { manager_id }
    }

    /// The node bound on the current context, if any.
    pub(crate) fn current(&self) -> Option<NodeRef> {
        BOUND.with(|slot| slot.borrow().get(&self.manager_id).copied())
    }

    /// Record `node` as the current binding.
    pub(crate) fn set(&self, node: NodeRef) {
        BOUND.with(|slot| {
            slot.borrow_mut().insert(self.manager_id, node);
        });
    }

    /// Replace the binding, or clear it entirely.
    pub(crate) fn replace(&self, node: Option<NodeRef>) {
        BOUND.with(|slot| {
            let mut map = slot.borrow_mut();
            match node {
                Some(node) => {
                    map.insert(self.manager_id, node);
                }
                None => {
                    map.remove(&self.manager_id);
                }
            }
        });
    }

    /// Drop a binding that turned out to be stale (its node was recycled).
    pub(crate) fn clear_if(&self, node: NodeRef) {
        BOUND.with(|slot| {
            let mut map = slot.borrow_mut();
            if map.get(&self.manager_id) == Some(&node) {
                map.remove(&self.manager_id);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_ids_are_unique() {
        let a = allocate_manager_id();
        let b = allocate_manager_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_bindings_are_per_manager() {
        let first = BindingContext::new(allocate_manager_id());
        let second = BindingContext::new(allocate_manager_id());
        let node = NodeRef::new(3, 1);

        first.set(node);
        assert_eq!(first.current(), Some(node));
        assert_eq!(second.current(), None, "managers must not alias bindings");

        first.replace(None);
        assert_eq!(first.current(), None);
    }

    #[test]
    fn test_bindings_are_per_thread() {
        let context = BindingContext::new(allocate_manager_id());
        context.set(NodeRef::new(5, 1));

        let manager_id = context.manager_id;
        std::thread::spawn(move || {
            let remote = BindingContext::new(manager_id);
            assert_eq!(remote.current(), None, "bindings never cross threads");
        })
        .join()
        .expect("spawned thread panicked");

        assert_eq!(context.current(), Some(NodeRef::new(5, 1)));
    }

    #[test]
    fn test_clear_if_only_matches_exact_node() {
        let context = BindingContext::new(allocate_manager_id());
        let bound = NodeRef::new(7, 1);
        context.set(bound);

        context.clear_if(NodeRef::new(7, 2));
        assert_eq!(context.current(), Some(bound), "generation mismatch keeps binding");

        context.clear_if(bound);
        assert_eq!(context.current(), None);
    }
}
