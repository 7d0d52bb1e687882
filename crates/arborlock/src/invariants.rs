//! Structural invariant enforcement: a whole-tree walker used by tests and
//! debugging sessions.
//!
//! The checks mirror what the algorithms maintain:
//!
//! - children of one parent form a symmetric doubly linked chain;
//! - a node is Granted only if its entire ancestor chain is Granted;
//! - among siblings at most one effectively-Exclusive node is Granted
//!   (grant-time ordering relative to it is not re-checked here: a release
//!   splices children into the parent's chain with their statuses
//!   preserved, because compatibility was already validated relative to
//!   the removed node's slot);
//! - a Pending node has no children and no elevation;
//! - `depth` is the parent's depth plus one.
//!
//! The walker takes no regions: run it on a quiesced manager. A concurrent
//! mutation produces spurious reports, not unsoundness.

use serde::Serialize;

use crate::arena::NodeRef;
use crate::node::LockTree;
use crate::state::{LockMode, LockStatus};

/// Tally returned by a successful validation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TreeStats {
    pub nodes: u32,
    pub granted: u32,
    pub pending: u32,
    pub max_depth: u32,
}

/// Walk the tree from the root, checking every structural invariant.
pub(crate) fn validate(tree: &LockTree) -> Result<TreeStats, String> {
    let arena = tree.arena();
    let mut stats = TreeStats::default();
    let mut stack: Vec<NodeRef> = vec![tree.root()];

    while let Some(node) = stack.pop() {
        let slot = arena
            .get(node)
            .ok_or_else(|| format!("node {} is linked but recycled", node.index))?;
        stats.nodes += 1;
        let status = slot.status();
        match status {
            LockStatus::Granted => stats.granted += 1,
            LockStatus::Pending => stats.pending += 1,
            other => {
                return Err(format!(
                    "node {} is linked with terminal status {}",
                    node.index,
                    other.name()
                ));
            }
        }

        if status == LockStatus::Granted {
            if let Some(parent) = slot.parent() {
                let pstatus = arena
                    .get(parent)
                    .ok_or_else(|| format!("node {} has recycled parent", node.index))?
                    .status();
                if pstatus != LockStatus::Granted {
                    return Err(format!(
                        "granted node {} under {} parent {}",
                        node.index,
                        pstatus.name(),
                        parent.index
                    ));
                }
            }
        } else {
            if slot.first_child().is_some() {
                return Err(format!("pending node {} has children", node.index));
            }
            if slot.effective_mode() == LockMode::Exclusive
                && slot.mode() == LockMode::Upgradeable
            {
                return Err(format!("pending node {} is elevated", node.index));
            }
        }
        stats.max_depth = stats.max_depth.max(slot.depth());

        // child chain symmetry plus the sibling exclusivity rule
        let mut expected_prev: Option<NodeRef> = None;
        let mut exclusive_granted: Option<NodeRef> = None;
        let mut cursor = slot.first_child();
        while let Some(child) = cursor {
            let cslot = arena
                .get(child)
                .ok_or_else(|| format!("child {} of {} is recycled", child.index, node.index))?;
            if cslot.parent() != Some(node) {
                return Err(format!(
                    "child {} does not point back at parent {}",
                    child.index, node.index
                ));
            }
            if cslot.prev() != expected_prev {
                return Err(format!("broken prev link at child {}", child.index));
            }
            if cslot.depth() != slot.depth() + 1 {
                return Err(format!(
                    "child {} depth {} under parent depth {}",
                    child.index,
                    cslot.depth(),
                    slot.depth()
                ));
            }
            if cslot.status() == LockStatus::Granted
                && cslot.effective_mode() == LockMode::Exclusive
            {
                if let Some(other) = exclusive_granted {
                    return Err(format!(
                        "two granted exclusive siblings: {} and {}",
                        other.index, child.index
                    ));
                }
                exclusive_granted = Some(child);
            }
            stack.push(child);
            expected_prev = Some(child);
            cursor = cslot.next();
        }
        if slot.last_child() != expected_prev {
            return Err(format!(
                "last_child of {} does not match chain tail",
                node.index
            ));
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::work::InlineWorkQueue;

    fn tree() -> LockTree {
        LockTree::new(16, 1, Arc::new(InlineWorkQueue))
    }

    #[test]
    fn test_empty_tree_validates() {
        let t = tree();
        let stats = validate(&t).expect("root alone is valid");
        assert_eq!(stats.nodes, 1);
        assert_eq!(stats.granted, 1);
    }

    #[test]
    fn test_mixed_tree_validates() {
        let t = tree();
        let root = t.root();
        let a = t.new_request(root, LockMode::Shared);
        let _b = t.new_request(root, LockMode::Upgradeable);
        let _x = t.new_request(root, LockMode::Exclusive);
        let _nested = t.new_request(a, LockMode::Shared);

        let stats = validate(&t).expect("valid tree");
        assert_eq!(stats.nodes, 5);
        assert_eq!(stats.pending, 1, "the exclusive queues behind the grants");
        assert_eq!(stats.max_depth, 2);
    }

    #[test]
    fn test_validates_after_churn() {
        let t = tree();
        let root = t.root();
        let a = t.new_request(root, LockMode::Shared);
        let b = t.new_request(root, LockMode::Shared);
        let c = t.new_request(a, LockMode::Exclusive);
        let p = t.new_request(root, LockMode::Exclusive);
        t.release(a).expect("release with a child");
        assert!(t.cancel(p), "pending request cancels");

        // c kept its grant through the splice and now sits beside b
        let stats = validate(&t).expect("valid after reparent and cancel");
        assert_eq!(stats.nodes, 3, "root plus the two survivors");
        assert_eq!(stats.max_depth, 1);
        t.release(c).expect("release");
        t.release(b).expect("release");
    }
}
