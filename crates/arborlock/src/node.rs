//! The lock tree: append ordering, the grant cascade, upgrade/downgrade
//! propagation, and release/cancel with reparenting.
//!
//! ## Region discipline
//!
//! The tree is the only shared mutable resource. The rules:
//!
//! - A parent's exclusive region guards its child chain (`first_child`,
//!   `last_child`, and every child's `prev`/`next`/`parent`) *and* every
//!   grant, flip, or relocation decision among those children. Serializing
//!   sibling decisions through the parent is what makes the compatibility
//!   checks race-free.
//! - A node's own exclusive region guards its child chain during the
//!   release splice.
//! - Multi-node walks (the ancestor path during upgrade/downgrade) acquire
//!   regions strictly root-to-leaf and re-validate the expected parent link
//!   after each acquisition, retrying from the top if a concurrent reparent
//!   hit. Every multi-acquisition in this module descends, so no
//!   lock-order inversion exists.
//! - Status transitions are a single CAS on the packed state word; the
//!   cancel-vs-grant race needs no region at all.
//!
//! Cascade work is driven by an explicit worklist, never recursion, so deep
//! or wide trees cannot overflow the stack. Continuations are dispatched to
//! the work queue only after the triggering region has been dropped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use smallvec::SmallVec;

use crate::arena::{NodeArena, NodeRef, NodeSlot, ResolveFn, UpgradeFn};
use crate::pool::NodePool;
use crate::state::{self, LockMode, LockStatus};
use crate::work::WorkQueue;
use arborlock_error::LockError;

// ---------------------------------------------------------------------------
// Global metrics (lock-free, Relaxed ordering)
// ---------------------------------------------------------------------------

static ARBORLOCK_GRANTS_TOTAL: AtomicU64 = AtomicU64::new(0);
static ARBORLOCK_CASCADE_STEPS_TOTAL: AtomicU64 = AtomicU64::new(0);
static ARBORLOCK_UPGRADES_SATISFIED_TOTAL: AtomicU64 = AtomicU64::new(0);
static ARBORLOCK_RELEASES_TOTAL: AtomicU64 = AtomicU64::new(0);
static ARBORLOCK_CANCELS_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Snapshot of lock tree metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TreeMetrics {
    pub arborlock_grants_total: u64,
    pub arborlock_cascade_steps_total: u64,
    pub arborlock_upgrades_satisfied_total: u64,
    pub arborlock_releases_total: u64,
    pub arborlock_cancels_total: u64,
}

/// Read current lock tree metrics.
#[must_use]
pub fn tree_metrics() -> TreeMetrics {
    TreeMetrics {
        arborlock_grants_total: ARBORLOCK_GRANTS_TOTAL.load(Ordering::Relaxed),
        arborlock_cascade_steps_total: ARBORLOCK_CASCADE_STEPS_TOTAL.load(Ordering::Relaxed),
        arborlock_upgrades_satisfied_total: ARBORLOCK_UPGRADES_SATISFIED_TOTAL
            .load(Ordering::Relaxed),
        arborlock_releases_total: ARBORLOCK_RELEASES_TOTAL.load(Ordering::Relaxed),
        arborlock_cancels_total: ARBORLOCK_CANCELS_TOTAL.load(Ordering::Relaxed),
    }
}

/// Reset metrics (for tests).
pub fn reset_tree_metrics() {
    ARBORLOCK_GRANTS_TOTAL.store(0, Ordering::Relaxed);
    ARBORLOCK_CASCADE_STEPS_TOTAL.store(0, Ordering::Relaxed);
    ARBORLOCK_UPGRADES_SATISFIED_TOTAL.store(0, Ordering::Relaxed);
    ARBORLOCK_RELEASES_TOTAL.store(0, Ordering::Relaxed);
    ARBORLOCK_CANCELS_TOTAL.store(0, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// LockTree
// ---------------------------------------------------------------------------

/// The node tree plus its allocation plumbing. One per manager.
pub(crate) struct LockTree {
    arena: NodeArena,
    pool: NodePool,
    root: NodeRef,
    work: Arc<dyn WorkQueue>,
}

impl LockTree {
    pub(crate) fn new(pool_capacity: usize, initial_chunks: usize, work: Arc<dyn WorkQueue>) -> Self {
        let arena = NodeArena::new(initial_chunks);
        let root_index = arena.push_new();
        let root = arena.initialize_root(root_index);
        Self {
            arena,
            pool: NodePool::new(pool_capacity),
            root,
            work,
        }
    }

    pub(crate) fn root(&self) -> NodeRef {
        self.root
    }

    pub(crate) fn arena(&self) -> &NodeArena {
        &self.arena
    }

    pub(crate) fn pool(&self) -> &NodePool {
        &self.pool
    }

    // -----------------------------------------------------------------------
    // Request creation
    // -----------------------------------------------------------------------

    /// Create a new Pending node of `mode` under `parent_hint`, falling back
    /// up the ancestor chain (ultimately to the root) when a concurrent
    /// release invalidated the chosen parent, then run the grant cascade.
    /// Never blocks beyond region admission.
    pub(crate) fn new_request(&self, parent_hint: NodeRef, mode: LockMode) -> NodeRef {
        let index = self.pool.try_take().unwrap_or_else(|| self.arena.push_new());
        let node = self.arena.initialize(index, mode);
        let slot = self.arena.slot(index);

        let mut parent = parent_hint;
        loop {
            let Some(pslot) = self.arena.get(parent) else {
                parent = self.root;
                continue;
            };
            let pregion = pslot.region.enter_exclusive();
            if pslot.generation() != parent.generation {
                drop(pregion);
                parent = self.root;
                continue;
            }
            if pslot.status() != LockStatus::Granted {
                // released underneath us: retry against the grandparent
                let fallback = pslot.parent().unwrap_or(self.root);
                drop(pregion);
                tracing::trace!(
                    node = node.index,
                    parent = parent.index,
                    "append parent no longer granted, retrying above"
                );
                parent = fallback;
                continue;
            }
            self.link_child(pslot, parent, node, slot, mode);
            drop(pregion);
            break;
        }

        tracing::debug!(
            node = node.index,
            parent = parent.index,
            mode = mode.name(),
            "lock requested"
        );
        self.cascade_from(node);
        node
    }

    /// Non-queueing fast path: grant `mode` under `parent_hint` only if it
    /// is grantable this instant, linking the node already Granted so it is
    /// never visible as Pending. Insertion never unblocks a sibling, so no
    /// cascade is needed.
    pub(crate) fn try_acquire_immediate(
        &self,
        parent_hint: NodeRef,
        mode: LockMode,
    ) -> Option<NodeRef> {
        let mut parent = parent_hint;
        loop {
            let Some(pslot) = self.arena.get(parent) else {
                parent = self.root;
                continue;
            };
            let pregion = pslot.region.enter_exclusive();
            if pslot.generation() != parent.generation {
                drop(pregion);
                parent = self.root;
                continue;
            }
            if pslot.status() != LockStatus::Granted {
                let fallback = pslot.parent().unwrap_or(self.root);
                drop(pregion);
                parent = fallback;
                continue;
            }

            let grantable = match mode {
                LockMode::Exclusive => pslot.first_child().is_none(),
                LockMode::Shared => match self.shared_insert_predecessor(pslot) {
                    None => true,
                    Some(prev_ref) => {
                        self.predecessor_admits(self.arena.slot(prev_ref.index), mode)
                    }
                },
                LockMode::Upgradeable => match pslot.last_child() {
                    None => true,
                    Some(prev_ref) => {
                        self.predecessor_admits(self.arena.slot(prev_ref.index), mode)
                    }
                },
            };
            if !grantable {
                drop(pregion);
                return None;
            }

            let index = self.pool.try_take().unwrap_or_else(|| self.arena.push_new());
            let node = self.arena.initialize(index, mode);
            let slot = self.arena.slot(index);
            slot.transition(LockStatus::Pending, LockStatus::Granted)
                .expect("freshly allocated node cannot be contended");
            self.link_child(pslot, parent, node, slot, mode);
            drop(pregion);

            ARBORLOCK_GRANTS_TOTAL.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                node = node.index,
                parent = parent.index,
                mode = mode.name(),
                "lock acquired on fast path"
            );
            return Some(node);
        }
    }

    /// Link `node` into `pslot`'s child chain per the insertion rules.
    /// Caller holds the parent's exclusive region.
    ///
    /// Exclusive and Upgradeable children go to the strict FIFO tail;
    /// Shared children are inserted before the trailing run of still-pending
    /// Upgradeable children. The tail rule keeps at most one pending
    /// Upgradeable at the very end of the chain, which is what makes later
    /// upgrade resolution correct; when two Upgradeables queue concurrently
    /// the most recent insertion wins the trailing slot.
    fn link_child(
        &self,
        pslot: &NodeSlot,
        parent: NodeRef,
        node: NodeRef,
        slot: &NodeSlot,
        mode: LockMode,
    ) {
        slot.set_parent(Some(parent));
        slot.set_depth(pslot.depth() + 1);

        let insert_before = match mode {
            LockMode::Exclusive | LockMode::Upgradeable => None,
            LockMode::Shared => self.trailing_pending_upgradeable_run(pslot),
        };

        match insert_before {
            None => {
                // tail append
                let old_last = pslot.last_child();
                slot.set_prev(old_last);
                slot.set_next(None);
                match old_last {
                    Some(last) => self.arena.slot(last.index).set_next(Some(node)),
                    None => pslot.set_first_child(Some(node)),
                }
                pslot.set_last_child(Some(node));
            }
            Some(before) => {
                let bslot = self.arena.slot(before.index);
                let old_prev = bslot.prev();
                slot.set_prev(old_prev);
                slot.set_next(Some(before));
                bslot.set_prev(Some(node));
                match old_prev {
                    Some(prev) => self.arena.slot(prev.index).set_next(Some(node)),
                    None => pslot.set_first_child(Some(node)),
                }
            }
        }
    }

    /// First node of the trailing run of still-pending Upgradeable children,
    /// or `None` when the chain ends with something else.
    fn trailing_pending_upgradeable_run(&self, pslot: &NodeSlot) -> Option<NodeRef> {
        let mut run_head = None;
        let mut cursor = pslot.last_child();
        while let Some(candidate) = cursor {
            let slot = self.arena.slot(candidate.index);
            if slot.mode() == LockMode::Upgradeable && slot.status() == LockStatus::Pending {
                run_head = Some(candidate);
                cursor = slot.prev();
            } else {
                break;
            }
        }
        run_head
    }

    /// The predecessor a Shared insertion would see: the node just before
    /// the trailing pending-Upgradeable run.
    fn shared_insert_predecessor(&self, pslot: &NodeSlot) -> Option<NodeRef> {
        match self.trailing_pending_upgradeable_run(pslot) {
            Some(run_head) => self.arena.slot(run_head.index).prev(),
            None => pslot.last_child(),
        }
    }

    // -----------------------------------------------------------------------
    // Grant cascade
    // -----------------------------------------------------------------------

    /// Walk the wavefront of possibly-unblocked nodes starting at `start`:
    /// depth-first into children, then across next-siblings. Each step runs
    /// under the visited node's parent exclusive region; continuations are
    /// handed to the work queue after the region drops.
    pub(crate) fn cascade_from(&self, start: NodeRef) {
        let mut work: VecDeque<NodeRef> = VecDeque::new();
        work.push_back(start);

        while let Some(node) = work.pop_front() {
            ARBORLOCK_CASCADE_STEPS_TOTAL.fetch_add(1, Ordering::Relaxed);
            let Some(slot) = self.arena.get(node) else {
                continue;
            };
            let Some(parent) = slot.parent() else {
                // the root: permanently granted, only its children matter
                if let Some(first) = slot.first_child() {
                    work.push_back(first);
                }
                continue;
            };
            let Some(pslot) = self.arena.get(parent) else {
                continue;
            };

            let mut fired: SmallVec<[(ResolveFn, LockStatus); 2]> = SmallVec::new();
            let mut upgraded: SmallVec<[UpgradeFn; 1]> = SmallVec::new();
            {
                let pregion = pslot.region.enter_exclusive();
                if pslot.generation() != parent.generation || slot.generation() != node.generation
                {
                    continue;
                }
                if slot.parent() != Some(parent) {
                    // reparented mid-flight: revisit with the fresh parent
                    drop(pregion);
                    work.push_back(node);
                    continue;
                }

                match slot.status() {
                    LockStatus::Pending => {
                        if self.eligible(pslot, slot)
                            && slot
                                .transition(LockStatus::Pending, LockStatus::Granted)
                                .is_ok()
                        {
                            ARBORLOCK_GRANTS_TOTAL.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(
                                node = node.index,
                                mode = slot.mode().name(),
                                "lock granted"
                            );
                            for waiter in slot.take_resolve_waiters() {
                                fired.push((waiter, LockStatus::Granted));
                            }
                            self.maybe_elevate(slot, node, &mut upgraded);
                            if let Some(first) = slot.first_child() {
                                work.push_back(first);
                            }
                            if let Some(next) = slot.next() {
                                work.push_back(next);
                            }
                        }
                        // ineligible, or lost the CAS to a cancel: this
                        // branch of the wavefront stops here
                    }
                    LockStatus::Granted => {
                        self.maybe_elevate(slot, node, &mut upgraded);
                        if let Some(first) = slot.first_child() {
                            work.push_back(first);
                        }
                        if let Some(next) = slot.next() {
                            work.push_back(next);
                        }
                    }
                    LockStatus::Cancelled | LockStatus::Released | LockStatus::Free => {}
                }
            }
            self.dispatch_resolutions(fired);
            self.dispatch_upgrades(upgraded, true);
        }
    }

    /// Grant eligibility for a Pending node. Caller holds the parent's
    /// exclusive region.
    fn eligible(&self, pslot: &NodeSlot, slot: &NodeSlot) -> bool {
        if pslot.status() != LockStatus::Granted {
            return false;
        }
        let mode = slot.mode();
        match slot.prev() {
            Some(prev_ref) => {
                if mode == LockMode::Exclusive {
                    return false;
                }
                self.predecessor_admits(self.arena.slot(prev_ref.index), mode)
            }
            None => match mode {
                LockMode::Exclusive => !self.has_granted_successor(slot),
                LockMode::Shared | LockMode::Upgradeable => true,
            },
        }
    }

    /// Whether a Shared/Upgradeable node may be granted behind `prev`.
    fn predecessor_admits(&self, prev: &NodeSlot, mode: LockMode) -> bool {
        let word = prev.word();
        if state::status_of(word) != LockStatus::Granted {
            return false;
        }
        if state::effective_mode_of(word) == LockMode::Exclusive {
            return false;
        }
        if state::mode_of(word) == LockMode::Upgradeable {
            // a standing upgrade intention conflicts with every new grant
            // behind it, and two Upgradeable siblings never coexist Granted
            if prev.exclusive_requests() > 0 || mode == LockMode::Upgradeable {
                return false;
            }
        }
        true
    }

    fn has_granted_successor(&self, slot: &NodeSlot) -> bool {
        let mut cursor = slot.next();
        while let Some(candidate) = cursor {
            let s = self.arena.slot(candidate.index);
            if s.status() == LockStatus::Granted {
                return true;
            }
            cursor = s.next();
        }
        false
    }

    fn has_granted_predecessor(&self, slot: &NodeSlot) -> bool {
        let mut cursor = slot.prev();
        while let Some(candidate) = cursor {
            let s = self.arena.slot(candidate.index);
            if s.status() == LockStatus::Granted {
                return true;
            }
            cursor = s.prev();
        }
        false
    }

    /// Flip a Granted Upgradeable node to Exclusive when an upgrade is
    /// standing and the node is the sole granted sibling. Caller holds the
    /// parent's exclusive region.
    fn maybe_elevate(
        &self,
        slot: &NodeSlot,
        node: NodeRef,
        upgraded: &mut SmallVec<[UpgradeFn; 1]>,
    ) {
        let word = slot.word();
        if state::status_of(word) != LockStatus::Granted
            || state::mode_of(word) != LockMode::Upgradeable
            || state::elevated_of(word)
            || slot.exclusive_requests() == 0
            || self.has_granted_predecessor(slot)
            || self.has_granted_successor(slot)
        {
            return;
        }
        slot.set_elevated(true);
        ARBORLOCK_UPGRADES_SATISFIED_TOTAL.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(node = node.index, "upgradeable lock elevated to exclusive");
        upgraded.extend(slot.take_upgrade_waiters());
    }

    // -----------------------------------------------------------------------
    // Upgrade / downgrade
    // -----------------------------------------------------------------------

    /// Request that a Granted Upgradeable node become Exclusive. Returns
    /// `Ok(true)` when satisfied synchronously; `Ok(false)` leaves the
    /// intention standing for the cascade to satisfy once the blocking
    /// grants release.
    pub(crate) fn upgrade(&self, node: NodeRef) -> Result<bool, LockError> {
        let (path, regions) = self
            .lock_ancestor_path(node)
            .ok_or(LockError::StaleHandle)?;
        let slot = self.arena.slot(node.index);

        let status = slot.status();
        if status != LockStatus::Granted {
            drop(regions);
            return Err(LockError::UnexpectedStatus {
                expected: LockStatus::Granted.name(),
                actual: status.name(),
            });
        }
        if slot.mode() != LockMode::Upgradeable {
            let mode = slot.effective_mode();
            drop(regions);
            return Err(LockError::NotUpgradeable { mode: mode.name() });
        }
        if slot.self_exclusive() {
            drop(regions);
            return Err(LockError::UpgradePending);
        }

        slot.set_self_exclusive(true);
        slot.add_exclusive_request();
        // one intention unit on every ancestor below the root: a child
        // borrows one count from its parent while upgraded
        for ancestor in &path[1..path.len() - 1] {
            self.arena.slot(ancestor.index).add_exclusive_request();
        }

        // walk from the node outward; Shared levels are transparent, the
        // root has no siblings, Upgradeable levels with standing intentions
        // flip where unblocked and relocate where blocked
        let mut cascade_starts: SmallVec<[NodeRef; 2]> = SmallVec::new();
        let mut upgraded: SmallVec<[UpgradeFn; 1]> = SmallVec::new();
        let mut satisfied = false;
        for (level, reference) in path[..path.len() - 1].iter().enumerate() {
            let wslot = self.arena.slot(reference.index);
            let word = wslot.word();
            let wants_flip = if level == 0 {
                true
            } else {
                state::mode_of(word) == LockMode::Upgradeable
                    && !state::elevated_of(word)
                    && wslot.exclusive_requests() > 0
            };
            if !wants_flip {
                continue;
            }
            let blocked =
                self.has_granted_predecessor(wslot) || self.has_granted_successor(wslot);
            if blocked {
                let parent = path[level + 1];
                let pslot = self.arena.slot(parent.index);
                self.relocate_past_granted(pslot, *reference, wslot);
                if let Some(first) = pslot.first_child() {
                    cascade_starts.push(first);
                }
            } else {
                wslot.set_elevated(true);
                ARBORLOCK_UPGRADES_SATISFIED_TOTAL.fetch_add(1, Ordering::Relaxed);
                // an ancestor may have had its own blocked upgrade that
                // this flip just satisfied; its waiters fire here, not in
                // a cascade that would find the bit already set
                upgraded.extend(wslot.take_upgrade_waiters());
                if level == 0 {
                    satisfied = true;
                }
            }
        }
        drop(regions);

        tracing::debug!(node = node.index, satisfied, "upgrade requested");
        for start in cascade_starts {
            self.cascade_from(start);
        }
        self.dispatch_upgrades(upgraded, true);
        Ok(satisfied)
    }

    /// Revoke a standing upgrade (or demote a satisfied one): clears the
    /// intention on the node and every ancestor, un-flipping each level
    /// whose count reaches zero and re-triggering the cascade on its next
    /// sibling.
    pub(crate) fn downgrade(&self, node: NodeRef) -> Result<(), LockError> {
        let (path, regions) = self
            .lock_ancestor_path(node)
            .ok_or(LockError::StaleHandle)?;
        let slot = self.arena.slot(node.index);

        let status = slot.status();
        if status != LockStatus::Granted {
            drop(regions);
            return Err(LockError::UnexpectedStatus {
                expected: LockStatus::Granted.name(),
                actual: status.name(),
            });
        }
        if !slot.self_exclusive() {
            drop(regions);
            return Err(LockError::NotDowngradeable);
        }
        slot.set_self_exclusive(false);

        let mut cascade_starts: SmallVec<[NodeRef; 2]> = SmallVec::new();
        let mut abandoned: SmallVec<[UpgradeFn; 1]> = SmallVec::new();
        self.retract_one_unit(&path, &mut cascade_starts);
        // waiters that never saw the flip are abandoned, exactly once
        abandoned.extend(slot.take_upgrade_waiters());
        drop(regions);

        tracing::debug!(node = node.index, "downgraded");
        for start in cascade_starts {
            self.cascade_from(start);
        }
        self.dispatch_upgrades(abandoned, false);
        Ok(())
    }

    /// Remove one intention unit from every non-root level of `path`,
    /// un-flipping levels that drop to zero. Caller holds the path regions.
    fn retract_one_unit(
        &self,
        path: &[NodeRef],
        cascade_starts: &mut SmallVec<[NodeRef; 2]>,
    ) {
        for reference in &path[..path.len() - 1] {
            let wslot = self.arena.slot(reference.index);
            let remaining = wslot.remove_exclusive_request();
            let word = wslot.word();
            // a Released level keeps its stale elevated bit; it dies with
            // the slot and grants never consult non-Granted siblings
            if remaining == 0
                && state::elevated_of(word)
                && state::status_of(word) == LockStatus::Granted
            {
                wslot.set_elevated(false);
                tracing::trace!(node = reference.index, "elevation dropped");
                if let Some(next) = wslot.next() {
                    cascade_starts.push(next);
                }
            }
        }
    }

    /// Move `wslot` to sit immediately after its last Granted successor,
    /// just before the run of pending successors it is not blocked by.
    /// Mirrors the tail rule so the released blocker's `next` is the
    /// upgrading node. Caller holds the parent's exclusive region.
    fn relocate_past_granted(&self, pslot: &NodeSlot, node: NodeRef, wslot: &NodeSlot) {
        let mut last_granted = None;
        let mut cursor = wslot.next();
        while let Some(candidate) = cursor {
            let s = self.arena.slot(candidate.index);
            if s.status() == LockStatus::Granted {
                last_granted = Some(candidate);
            }
            cursor = s.next();
        }
        let Some(anchor) = last_granted else {
            return;
        };

        // unlink from the current position
        let prev = wslot.prev();
        let next = wslot.next();
        match prev {
            Some(p) => self.arena.slot(p.index).set_next(next),
            None => pslot.set_first_child(next),
        }
        match next {
            Some(n) => self.arena.slot(n.index).set_prev(prev),
            None => pslot.set_last_child(prev),
        }

        // splice back in right after the last granted successor
        let aslot = self.arena.slot(anchor.index);
        let after = aslot.next();
        wslot.set_prev(Some(anchor));
        wslot.set_next(after);
        aslot.set_next(Some(node));
        match after {
            Some(n) => self.arena.slot(n.index).set_prev(Some(node)),
            None => pslot.set_last_child(Some(node)),
        }
        tracing::trace!(
            node = node.index,
            anchor = anchor.index,
            "relocated behind granted blockers"
        );
    }

    /// Acquire exclusive regions on every ancestor of `node`, root first,
    /// re-validating each parent link after acquisition and restarting from
    /// the top when a concurrent reparent invalidated the captured path.
    /// Returns the leaf-first path (`path[0] == node`, `path.last() ==`
    /// root) plus the held regions. `None` only for a stale handle.
    fn lock_ancestor_path(
        &self,
        node: NodeRef,
    ) -> Option<(Vec<NodeRef>, Vec<crate::region::Region<'_>>)> {
        'retry: loop {
            self.arena.get(node)?;
            let mut path = vec![node];
            let mut cursor = self.arena.slot(node.index).parent();
            while let Some(ancestor) = cursor {
                let Some(aslot) = self.arena.get(ancestor) else {
                    continue 'retry;
                };
                path.push(ancestor);
                cursor = aslot.parent();
            }

            let mut regions = Vec::with_capacity(path.len() - 1);
            for level in (1..path.len()).rev() {
                let holder = path[level];
                let hslot = self.arena.slot(holder.index);
                let region = hslot.region.enter_exclusive();
                let child = path[level - 1];
                let cslot = self.arena.slot(child.index);
                if hslot.generation() != holder.generation
                    || cslot.generation() != child.generation
                    || cslot.parent() != Some(holder)
                {
                    drop(region);
                    drop(regions);
                    continue 'retry;
                }
                regions.push(region);
            }
            return Some((path, regions));
        }
    }

    // -----------------------------------------------------------------------
    // Release / cancel
    // -----------------------------------------------------------------------

    /// Release a Granted node: CAS to Released, splice its children into
    /// its former parent's chain at its former position (relative order
    /// preserved), retrigger the cascade at that position, and recycle the
    /// slot.
    pub(crate) fn release(&self, node: NodeRef) -> Result<(), LockError> {
        if node == self.root {
            return Err(LockError::UnexpectedStatus {
                expected: LockStatus::Granted.name(),
                actual: "root",
            });
        }
        let Some(slot) = self.arena.get(node) else {
            return Err(LockError::StaleHandle);
        };
        if let Err(word) = slot.transition(LockStatus::Granted, LockStatus::Released) {
            return Err(LockError::UnexpectedStatus {
                expected: LockStatus::Granted.name(),
                actual: state::status_of(word).name(),
            });
        }
        ARBORLOCK_RELEASES_TOTAL.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(node = node.index, "lock released");

        let mut fired: SmallVec<[(ResolveFn, LockStatus); 2]> = SmallVec::new();
        for waiter in slot.take_resolve_waiters() {
            fired.push((waiter, LockStatus::Released));
        }
        let abandoned = slot.take_upgrade_waiters();

        // the node's own standing intention unit leaves with it; the units
        // its descendants planted on the ancestors stay valid because they
        // flow through to the same ancestors after the splice
        let mut cascade_starts: SmallVec<[NodeRef; 2]> = SmallVec::new();
        if slot.self_exclusive() {
            slot.set_self_exclusive(false);
            if let Some((path, regions)) = self.lock_ancestor_path(node) {
                self.retract_one_unit(&path, &mut cascade_starts);
                drop(regions);
            }
        }

        let promoted = self.detach_and_splice(node, slot);
        if let Some(start) = promoted {
            cascade_starts.push(start);
        }
        for start in cascade_starts {
            self.cascade_from(start);
        }
        self.dispatch_resolutions(fired);
        self.dispatch_upgrades(abandoned, false);

        self.recycle(node.index);
        Ok(())
    }

    /// Cancel a Pending node. Returns `false` when the node already
    /// resolved (or the handle is stale) — cancellation is a no-op then.
    pub(crate) fn cancel(&self, node: NodeRef) -> bool {
        let Some(slot) = self.arena.get(node) else {
            return false;
        };
        if slot.transition(LockStatus::Pending, LockStatus::Cancelled).is_err() {
            return false;
        }
        ARBORLOCK_CANCELS_TOTAL.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(node = node.index, "request cancelled");

        let mut fired: SmallVec<[(ResolveFn, LockStatus); 2]> = SmallVec::new();
        for waiter in slot.take_resolve_waiters() {
            fired.push((waiter, LockStatus::Cancelled));
        }

        // a Pending node can have no children (children only attach under
        // Granted parents), so the detach is a plain unlink
        let promoted = self.detach_and_splice(node, slot);
        if let Some(start) = promoted {
            self.cascade_from(start);
        }
        self.dispatch_resolutions(fired);

        self.recycle(node.index);
        true
    }

    /// Unlink `node` from its parent's chain, splicing its children (if
    /// any) into its former position. Returns the node now occupying that
    /// position, the cascade restart point. Acquires the parent's then the
    /// node's exclusive regions.
    fn detach_and_splice(&self, node: NodeRef, slot: &NodeSlot) -> Option<NodeRef> {
        loop {
            let parent = slot
                .parent()
                .expect("non-root node must be linked while terminal-but-unrecycled");
            let pslot = self.arena.slot(parent.index);
            let pregion = pslot.region.enter_exclusive();
            if pslot.generation() != parent.generation || slot.parent() != Some(parent) {
                drop(pregion);
                continue;
            }
            let nregion = slot.region.enter_exclusive();

            let first = slot.first_child();
            let last = slot.last_child();
            let prev = slot.prev();
            let next = slot.next();

            let promoted = if let Some(first) = first {
                let last = last.expect("first_child implies last_child");
                // re-point the moved children at the grandparent
                let mut cursor = Some(first);
                while let Some(child) = cursor {
                    let cslot = self.arena.slot(child.index);
                    cslot.set_parent(Some(parent));
                    cursor = cslot.next();
                }
                match prev {
                    Some(p) => self.arena.slot(p.index).set_next(Some(first)),
                    None => pslot.set_first_child(Some(first)),
                }
                self.arena.slot(first.index).set_prev(prev);
                match next {
                    Some(n) => self.arena.slot(n.index).set_prev(Some(last)),
                    None => pslot.set_last_child(Some(last)),
                }
                self.arena.slot(last.index).set_next(next);
                self.rewrite_depths(first, next, pslot.depth() + 1);
                Some(first)
            } else {
                match prev {
                    Some(p) => self.arena.slot(p.index).set_next(next),
                    None => pslot.set_first_child(next),
                }
                match next {
                    Some(n) => self.arena.slot(n.index).set_prev(prev),
                    None => pslot.set_last_child(prev),
                }
                next
            };

            slot.set_first_child(None);
            slot.set_last_child(None);
            slot.set_prev(None);
            slot.set_next(None);
            drop(nregion);
            drop(pregion);
            return promoted;
        }
    }

    /// Rewrite depths across the spliced-in subtrees (`from` up to but not
    /// including `until` on the sibling chain). Depth is bookkeeping for
    /// diagnostics; concurrent appends may observe a transiently stale
    /// value, which the quiescent invariant validator tolerates.
    fn rewrite_depths(&self, from: NodeRef, until: Option<NodeRef>, depth: u32) {
        let mut stack: Vec<(NodeRef, u32)> = Vec::new();
        let mut cursor = Some(from);
        while let Some(sibling) = cursor {
            if Some(sibling) == until {
                break;
            }
            stack.push((sibling, depth));
            cursor = self.arena.slot(sibling.index).next();
        }
        while let Some((reference, d)) = stack.pop() {
            let s = self.arena.slot(reference.index);
            s.set_depth(d);
            let mut child = s.first_child();
            while let Some(c) = child {
                stack.push((c, d + 1));
                child = self.arena.slot(c.index).next();
            }
        }
    }

    fn recycle(&self, index: u32) {
        self.arena.retire(index);
        // a refused return permanently retires the slot; the generation
        // bump already invalidated every outstanding handle
        let _ = self.pool.try_return(index);
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn dispatch_resolutions(&self, fired: SmallVec<[(ResolveFn, LockStatus); 2]>) {
        for (waiter, status) in fired {
            self.work.enqueue(Box::new(move || waiter(status)));
        }
    }

    pub(crate) fn dispatch_upgrades(&self, fired: SmallVec<[UpgradeFn; 1]>, satisfied: bool) {
        for waiter in fired {
            self.work.enqueue(Box::new(move || waiter(satisfied)));
        }
    }

    /// Dispatch a single resolution continuation that raced registration.
    pub(crate) fn dispatch_resolution(&self, waiter: ResolveFn, status: LockStatus) {
        self.work.enqueue(Box::new(move || waiter(status)));
    }

    /// Dispatch a single upgrade continuation that raced registration.
    pub(crate) fn dispatch_upgrade(&self, waiter: UpgradeFn, satisfied: bool) {
        self.work.enqueue(Box::new(move || waiter(satisfied)));
    }
}

impl std::fmt::Debug for LockTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTree")
            .field("slots", &self.arena.slot_count())
            .field("pooled", &self.pool.len())
            .finish()
    }
}
