//! Node storage: generation-checked handles, the all-atomic node slot, and
//! a chunked stable-address arena.
//!
//! The tree's parent/child/sibling graph is cyclic (parent ↔ children), so
//! nodes are never linked by owning pointers. All nodes live in a central
//! [`NodeArena`] and refer to each other through [`NodeRef`] handles — a
//! 32-bit slot index plus the 32-bit generation the slot carried when the
//! handle was minted. Recycling a slot bumps its generation, so a stale
//! handle fails validation instead of aliasing an unrelated lock.
//!
//! Slots are backed by boxed chunks that are never moved or freed while the
//! arena lives, which is what makes handing out `&NodeSlot` across the
//! growth mutex sound.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::region::RegionGuard;
use crate::state::{self, LockMode, LockStatus};

/// Slots per arena chunk.
pub(crate) const ARENA_CHUNK: usize = 64;

/// Continuation fired once when a request resolves (granted, cancelled) or
/// its lock reaches a terminal state (released).
pub(crate) type ResolveFn = Box<dyn FnOnce(LockStatus) + Send + 'static>;

/// Continuation fired once when an outstanding upgrade is satisfied (`true`)
/// or abandoned by downgrade/release (`false`).
pub(crate) type UpgradeFn = Box<dyn FnOnce(bool) + Send + 'static>;

// ---------------------------------------------------------------------------
// NodeRef
// ---------------------------------------------------------------------------

const LINK_NONE: u64 = u64::MAX;

/// Generation-checked handle to a node slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl NodeRef {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    const fn from_bits(bits: u64) -> Option<Self> {
        if bits == LINK_NONE {
            None
        } else {
            Some(Self {
                index: bits as u32,
                generation: (bits >> 32) as u32,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// One structural link: an atomic packed `NodeRef` or none. The atomicity
/// is per-field; chain consistency across fields comes from the region
/// discipline (a parent's exclusive region guards its child chain).
struct Link(AtomicU64);

impl Link {
    const fn empty() -> Self {
        Self(AtomicU64::new(LINK_NONE))
    }

    #[inline]
    fn get(&self) -> Option<NodeRef> {
        NodeRef::from_bits(self.0.load(Ordering::Acquire))
    }

    #[inline]
    fn set(&self, target: Option<NodeRef>) {
        let bits = target.map_or(LINK_NONE, NodeRef::to_bits);
        self.0.store(bits, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// NodeSlot
// ---------------------------------------------------------------------------

/// One node of the lock tree. Every field is safe to touch concurrently;
/// which touches are *meaningful* is defined by the region discipline in
/// the tree module.
pub(crate) struct NodeSlot {
    /// Admission primitive for this node's fields.
    pub(crate) region: RegionGuard,
    /// Packed status/mode/elevated/generation word.
    word: AtomicU64,
    parent: Link,
    first_child: Link,
    last_child: Link,
    prev: Link,
    next: Link,
    depth: AtomicU32,
    /// Outstanding reasons this node (or a descendant borrowing its slot)
    /// wants to be exclusive.
    exclusive_requests: AtomicU32,
    /// Set by an explicit `upgrade()` on this node.
    self_exclusive: AtomicBool,
    resolve_waiters: Mutex<SmallVec<[ResolveFn; 2]>>,
    upgrade_waiters: Mutex<SmallVec<[UpgradeFn; 1]>>,
}

impl NodeSlot {
    fn new() -> Self {
        Self {
            region: RegionGuard::new(),
            word: AtomicU64::new(state::pack(LockStatus::Free, LockMode::Shared, false, 0)),
            parent: Link::empty(),
            first_child: Link::empty(),
            last_child: Link::empty(),
            prev: Link::empty(),
            next: Link::empty(),
            depth: AtomicU32::new(0),
            exclusive_requests: AtomicU32::new(0),
            self_exclusive: AtomicBool::new(false),
            resolve_waiters: Mutex::new(SmallVec::new()),
            upgrade_waiters: Mutex::new(SmallVec::new()),
        }
    }

    // -- state word --

    #[inline]
    pub(crate) fn word(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn status(&self) -> LockStatus {
        state::status_of(self.word())
    }

    #[inline]
    pub(crate) fn mode(&self) -> LockMode {
        state::mode_of(self.word())
    }

    #[inline]
    pub(crate) fn effective_mode(&self) -> LockMode {
        state::effective_mode_of(self.word())
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        state::generation_of(self.word())
    }

    /// One-shot CAS of the status field, preserving every other bit.
    /// Returns the prior word on success, or `Err` with the conflicting
    /// word when the status was not `expected`. This is the only place the
    /// cancel-vs-grant race is decided.
    pub(crate) fn transition(
        &self,
        expected: LockStatus,
        target: LockStatus,
    ) -> Result<u64, u64> {
        let mut word = self.word();
        loop {
            if state::status_of(word) != expected {
                return Err(word);
            }
            let replacement = state::with_status(word, target);
            match self.word.compare_exchange_weak(
                word,
                replacement,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prior) => return Ok(prior),
                Err(actual) => word = actual,
            }
        }
    }

    /// Set or clear the elevated bit. Only meaningful while Granted; the
    /// caller holds the parent's exclusive region, so no other thread is
    /// deciding grants or flips for this sibling chain concurrently.
    pub(crate) fn set_elevated(&self, elevated: bool) {
        let mut word = self.word();
        loop {
            debug_assert_eq!(state::status_of(word), LockStatus::Granted);
            let replacement = state::with_elevated(word, elevated);
            match self.word.compare_exchange_weak(
                word,
                replacement,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => word = actual,
            }
        }
    }

    // -- links --

    #[inline]
    pub(crate) fn parent(&self) -> Option<NodeRef> {
        self.parent.get()
    }

    #[inline]
    pub(crate) fn first_child(&self) -> Option<NodeRef> {
        self.first_child.get()
    }

    #[inline]
    pub(crate) fn last_child(&self) -> Option<NodeRef> {
        self.last_child.get()
    }

    #[inline]
    pub(crate) fn prev(&self) -> Option<NodeRef> {
        self.prev.get()
    }

    #[inline]
    pub(crate) fn next(&self) -> Option<NodeRef> {
        self.next.get()
    }

    pub(crate) fn set_parent(&self, target: Option<NodeRef>) {
        self.parent.set(target);
    }

    pub(crate) fn set_first_child(&self, target: Option<NodeRef>) {
        self.first_child.set(target);
    }

    pub(crate) fn set_last_child(&self, target: Option<NodeRef>) {
        self.last_child.set(target);
    }

    pub(crate) fn set_prev(&self, target: Option<NodeRef>) {
        self.prev.set(target);
    }

    pub(crate) fn set_next(&self, target: Option<NodeRef>) {
        self.next.set(target);
    }

    // -- bookkeeping --

    #[inline]
    pub(crate) fn depth(&self) -> u32 {
        self.depth.load(Ordering::Acquire)
    }

    pub(crate) fn set_depth(&self, depth: u32) {
        self.depth.store(depth, Ordering::Release);
    }

    #[inline]
    pub(crate) fn exclusive_requests(&self) -> u32 {
        self.exclusive_requests.load(Ordering::Acquire)
    }

    pub(crate) fn add_exclusive_request(&self) -> u32 {
        self.exclusive_requests.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn remove_exclusive_request(&self) -> u32 {
        let prior = self.exclusive_requests.fetch_sub(1, Ordering::AcqRel);
        assert!(prior > 0, "exclusive request count underflow");
        prior - 1
    }

    #[inline]
    pub(crate) fn self_exclusive(&self) -> bool {
        self.self_exclusive.load(Ordering::Acquire)
    }

    pub(crate) fn set_self_exclusive(&self, value: bool) {
        self.self_exclusive.store(value, Ordering::Release);
    }

    // -- continuation queues --

    /// Register a resolution continuation. Returns the continuation back
    /// when the node has already resolved, so the caller dispatches it
    /// immediately with the observed status; otherwise it is queued and the
    /// resolving thread will drain it. The status re-check happens under
    /// the queue mutex, so a racing resolver cannot strand a waiter.
    pub(crate) fn push_resolve_waiter(
        &self,
        waiter: ResolveFn,
    ) -> Option<(ResolveFn, LockStatus)> {
        let mut queue = self.resolve_waiters.lock();
        let status = self.status();
        if status == LockStatus::Pending {
            queue.push(waiter);
            None
        } else {
            Some((waiter, status))
        }
    }

    /// Drain the resolution queue. Called by whichever thread performed the
    /// resolving transition, after the CAS.
    pub(crate) fn take_resolve_waiters(&self) -> SmallVec<[ResolveFn; 2]> {
        std::mem::take(&mut *self.resolve_waiters.lock())
    }

    /// Register an upgrade continuation; same once-only discipline as
    /// [`push_resolve_waiter`](Self::push_resolve_waiter).
    pub(crate) fn push_upgrade_waiter(&self, waiter: UpgradeFn) -> Option<(UpgradeFn, bool)> {
        let mut queue = self.upgrade_waiters.lock();
        let word = self.word();
        if state::elevated_of(word) {
            Some((waiter, true))
        } else if !self.self_exclusive() || state::status_of(word).is_terminal() {
            Some((waiter, false))
        } else {
            queue.push(waiter);
            None
        }
    }

    pub(crate) fn take_upgrade_waiters(&self) -> SmallVec<[UpgradeFn; 1]> {
        std::mem::take(&mut *self.upgrade_waiters.lock())
    }
}

// ---------------------------------------------------------------------------
// NodeArena
// ---------------------------------------------------------------------------

/// Chunked slab of node slots with stable addresses.
pub(crate) struct NodeArena {
    /// Growth-guarded chunk list. Chunks are never dropped or moved while
    /// the arena lives.
    chunks: Mutex<Vec<Box<[NodeSlot]>>>,
    /// Number of slots handed out at least once.
    slot_count: AtomicU32,
}

impl NodeArena {
    pub(crate) fn new(initial_chunks: usize) -> Self {
        let chunks = (0..initial_chunks.max(1))
            .map(|_| Self::new_chunk())
            .collect();
        Self {
            chunks: Mutex::new(chunks),
            slot_count: AtomicU32::new(0),
        }
    }

    fn new_chunk() -> Box<[NodeSlot]> {
        (0..ARENA_CHUNK)
            .map(|_| NodeSlot::new())
            .collect::<Vec<_>>()
            .into_boxed_slice()
    }

    /// Slots handed out at least once (recycled slots included).
    pub(crate) fn slot_count(&self) -> u32 {
        self.slot_count.load(Ordering::Acquire)
    }

    /// Resolve a raw index. Panics on out-of-range: indices only come from
    /// this arena, so a miss is a structural corruption, not a caller error.
    pub(crate) fn slot(&self, index: u32) -> &NodeSlot {
        let chunk_idx = index as usize / ARENA_CHUNK;
        let offset = index as usize % ARENA_CHUNK;
        let chunks = self.chunks.lock();
        assert!(
            chunk_idx < chunks.len(),
            "node index {index} beyond arena ({} chunks)",
            chunks.len()
        );
        let ptr: *const NodeSlot = &raw const chunks[chunk_idx][offset];
        drop(chunks);
        // SAFETY: chunks are boxed slices that are never dropped, shrunk, or
        // moved for the arena's lifetime (growth only pushes new boxes), so
        // the slot address remains valid for the `&self` borrow we return.
        unsafe { &*ptr }
    }

    /// Resolve a handle, validating the generation. `None` for stale or
    /// foreign handles. Generation and status come from one load of the
    /// state word, so the validation cannot straddle a recycle.
    pub(crate) fn get(&self, node: NodeRef) -> Option<&NodeSlot> {
        if node.index >= self.slot_count() {
            return None;
        }
        let slot = self.slot(node.index);
        let word = slot.word();
        if state::generation_of(word) == node.generation
            && state::status_of(word) != LockStatus::Free
        {
            Some(slot)
        } else {
            None
        }
    }

    /// Hand out a fresh, never-used slot index, growing by one chunk when
    /// the current chunks are exhausted.
    pub(crate) fn push_new(&self) -> u32 {
        let mut chunks = self.chunks.lock();
        let index = self.slot_count.load(Ordering::Acquire);
        let capacity = chunks.len() * ARENA_CHUNK;
        if index as usize == capacity {
            chunks.push(Self::new_chunk());
        }
        self.slot_count.store(index + 1, Ordering::Release);
        index
    }

    /// Stamp a recycled or fresh slot as a new Pending node. Asserts the
    /// slot is actually free: handing out a live slot twice is a double
    /// allocation and is never tolerated.
    pub(crate) fn initialize(&self, index: u32, mode: LockMode) -> NodeRef {
        let slot = self.slot(index);
        let word = slot.word();
        assert_eq!(
            state::status_of(word),
            LockStatus::Free,
            "double allocation of node slot {index}"
        );
        let generation = state::generation_of(word);
        slot.word.store(
            state::pack(LockStatus::Pending, mode, false, generation),
            Ordering::Release,
        );
        NodeRef::new(index, generation)
    }

    /// Zero a terminal slot and bump its generation so every outstanding
    /// handle goes stale. The caller is responsible for having unlinked the
    /// node first.
    pub(crate) fn retire(&self, index: u32) {
        let slot = self.slot(index);
        let word = slot.word();
        let status = state::status_of(word);
        assert!(
            status.is_terminal(),
            "retiring node slot {index} in non-terminal status {}",
            status.name()
        );
        slot.set_parent(None);
        slot.set_first_child(None);
        slot.set_last_child(None);
        slot.set_prev(None);
        slot.set_next(None);
        slot.set_depth(0);
        slot.exclusive_requests.store(0, Ordering::Release);
        slot.set_self_exclusive(false);
        debug_assert!(slot.resolve_waiters.lock().is_empty());
        debug_assert!(slot.upgrade_waiters.lock().is_empty());
        let next_generation = state::generation_of(word).wrapping_add(1);
        slot.word.store(
            state::pack(LockStatus::Free, LockMode::Shared, false, next_generation),
            Ordering::Release,
        );
    }

    /// Stamp the root slot: permanently Granted, exclusive-capable scope.
    pub(crate) fn initialize_root(&self, index: u32) -> NodeRef {
        let slot = self.slot(index);
        let generation = slot.generation();
        slot.word.store(
            state::pack(LockStatus::Granted, LockMode::Exclusive, false, generation),
            Ordering::Release,
        );
        slot.set_depth(0);
        NodeRef::new(index, generation)
    }
}

impl std::fmt::Debug for NodeArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeArena")
            .field("slot_count", &self.slot_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_ref_bits_round_trip() {
        let node = NodeRef::new(17, 0xBEEF);
        assert_eq!(NodeRef::from_bits(node.to_bits()), Some(node));
        assert_eq!(NodeRef::from_bits(LINK_NONE), None);
    }

    #[test]
    fn test_allocate_initialize_retire_reuse() {
        let arena = NodeArena::new(1);
        let index = arena.push_new();
        let node = arena.initialize(index, LockMode::Shared);
        assert_eq!(arena.get(node).map(NodeSlot::status), Some(LockStatus::Pending));

        let slot = arena.slot(index);
        slot.transition(LockStatus::Pending, LockStatus::Cancelled)
            .expect("pending node must cancel");
        arena.retire(index);

        assert!(arena.get(node).is_none(), "stale handle must not resolve");

        let again = arena.initialize(index, LockMode::Exclusive);
        assert_ne!(again.generation, node.generation);
        assert_eq!(arena.get(again).map(NodeSlot::mode), Some(LockMode::Exclusive));
    }

    #[test]
    fn test_arena_grows_past_one_chunk() {
        let arena = NodeArena::new(1);
        let mut refs = Vec::new();
        for _ in 0..(ARENA_CHUNK * 2 + 3) {
            let index = arena.push_new();
            refs.push(arena.initialize(index, LockMode::Shared));
        }
        assert_eq!(arena.slot_count() as usize, ARENA_CHUNK * 2 + 3);
        for node in refs {
            assert!(arena.get(node).is_some());
        }
    }

    #[test]
    fn test_slot_addresses_survive_growth() {
        let arena = NodeArena::new(1);
        let first = arena.push_new();
        let before = std::ptr::from_ref(arena.slot(first));
        for _ in 0..(ARENA_CHUNK * 4) {
            arena.push_new();
        }
        let after = std::ptr::from_ref(arena.slot(first));
        assert_eq!(before, after, "slot must not move when the arena grows");
    }

    #[test]
    fn test_transition_decides_races() {
        let arena = NodeArena::new(1);
        let index = arena.push_new();
        arena.initialize(index, LockMode::Shared);
        let slot = arena.slot(index);

        slot.transition(LockStatus::Pending, LockStatus::Granted)
            .expect("first transition wins");
        let lost = slot.transition(LockStatus::Pending, LockStatus::Cancelled);
        assert!(lost.is_err(), "second transition must observe the winner");
        assert_eq!(slot.status(), LockStatus::Granted);
    }

    #[test]
    fn test_resolve_waiter_immediate_when_resolved() {
        let arena = NodeArena::new(1);
        let index = arena.push_new();
        arena.initialize(index, LockMode::Shared);
        let slot = arena.slot(index);

        assert!(
            slot.push_resolve_waiter(Box::new(|_| {})).is_none(),
            "pending node queues the waiter"
        );
        slot.transition(LockStatus::Pending, LockStatus::Granted)
            .expect("grant");
        let immediate = slot.push_resolve_waiter(Box::new(|_| {}));
        match immediate {
            Some((_, status)) => assert_eq!(status, LockStatus::Granted),
            None => panic!("resolved node must hand the waiter back"),
        }
        assert_eq!(slot.take_resolve_waiters().len(), 1);
    }

    #[test]
    #[should_panic(expected = "double allocation")]
    fn test_double_initialize_panics() {
        let arena = NodeArena::new(1);
        let index = arena.push_new();
        arena.initialize(index, LockMode::Shared);
        arena.initialize(index, LockMode::Shared);
    }
}
