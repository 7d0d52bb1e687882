//! Acceptance scenarios for the lock manager, driven entirely through the
//! public API.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use arborlock::{LockError, LockManager, LockMode, LockStatus};

#[test]
fn scenario_shared_then_exclusive_fifo() {
    let manager = LockManager::new();

    let a = manager.request_lock(LockMode::Shared);
    assert!(a.is_granted(), "shared under the root grants immediately");

    let b = manager.request_lock(LockMode::Exclusive);
    assert!(b.is_pending(), "exclusive queues behind the shared holder");

    a.get_lock().expect("granted").release().expect("release");
    assert!(b.is_granted(), "release cascades the grant to the exclusive");
    b.get_lock().expect("granted").release().expect("release");

    manager.validate_tree().expect("tree is clean");
}

#[test]
fn scenario_upgradeable_blocked_by_shared() {
    let manager = LockManager::new();

    let u = manager.request_lock(LockMode::Upgradeable);
    assert!(u.is_granted(), "upgradeable grants as shared-compatible");
    let u_lock = u.get_lock().expect("granted");

    let s = manager.request_lock(LockMode::Shared);
    assert!(s.is_granted(), "shared coexists with the upgradeable");

    let upgrade = u_lock.upgrade().expect("upgradeable lock upgrades");
    assert!(
        !upgrade.is_satisfied(),
        "upgrade stays pending while the shared blocker is granted"
    );
    assert_eq!(u_lock.mode(), Some(LockMode::Upgradeable));

    s.get_lock().expect("granted").release().expect("release");
    assert!(upgrade.is_satisfied(), "blocker release satisfies the upgrade");
    assert!(u_lock.is_exclusive());

    u_lock.release().expect("release");
    manager.validate_tree().expect("tree is clean");
}

#[test]
fn scenario_binding_nests_and_validates_order() {
    let manager = LockManager::new();

    let l1 = manager
        .request_lock(LockMode::Shared)
        .get_lock()
        .expect("granted");
    l1.bind().expect("parent is the root, nothing else bound");

    let l2 = manager
        .request_lock(LockMode::Exclusive)
        .get_lock()
        .expect("granted under the bound lock");
    let stats = manager.validate_tree().expect("tree is clean");
    assert_eq!(stats.max_depth, 2, "l2 nests under l1, not beside it");

    assert_eq!(
        l2.unbind(),
        Err(LockError::NotBound),
        "unbinding something that is not the current binding is rejected"
    );

    // binding l2 is legal exactly while l1 is the current binding
    l1.unbind().expect("l1 is bound");
    assert_eq!(
        l2.bind(),
        Err(LockError::BindOrder),
        "binding must be rejected when the parent is not the current binding"
    );
    l1.bind().expect("rebind");
    l2.bind().expect("hierarchical descent");
    l2.unbind().expect("pop to l1");
    l1.unbind().expect("pop to nothing");

    l2.release().expect("release");
    l1.release().expect("release");
}

#[test]
fn scenario_get_lock_is_idempotent_observation() {
    let manager = LockManager::new();
    let request = manager.request_lock(LockMode::Shared);
    request.wait();

    let first = request.get_lock().expect("granted");
    let second = request.get_lock().expect("observation, not re-acquisition");
    assert_eq!(first.mode(), Some(LockMode::Shared));
    assert_eq!(second.mode(), Some(LockMode::Shared));

    first.release().expect("release through either handle");
    assert!(
        second.release().is_err(),
        "the node released once; the second handle observes that"
    );
}

#[test]
fn scenario_cancel_leaves_successors_unaffected() {
    let manager = LockManager::new();

    let holder = manager.request_lock(LockMode::Exclusive);
    let doomed = manager.request_lock(LockMode::Shared);
    let survivor = manager.request_lock(LockMode::Shared);
    assert!(doomed.is_pending());

    assert!(doomed.cancel(), "pending request cancels");
    assert!(!doomed.cancel(), "cancel is a no-op once resolved");
    assert!(doomed.is_cancelled());
    assert_eq!(doomed.get_lock().unwrap_err(), LockError::RequestCancelled);

    holder.get_lock().expect("granted").release().expect("release");
    assert!(
        survivor.is_granted(),
        "the cancelled node's former successor grants as if it was never there"
    );
    survivor.get_lock().expect("granted").release().expect("release");
}

#[test]
fn scenario_release_reparents_children() {
    let manager = LockManager::new();

    let parent = manager
        .request_lock(LockMode::Shared)
        .get_lock()
        .expect("granted");
    parent.bind().expect("bind");
    let inner_a = manager.request_lock(LockMode::Shared);
    let inner_b = manager.request_lock(LockMode::Shared);
    assert!(inner_a.is_granted());
    assert!(inner_b.is_granted());
    parent.unbind().expect("unbind");

    parent.release().expect("release with live children");
    assert!(inner_a.is_granted(), "reparented child keeps its grant");
    assert!(inner_b.is_granted(), "reparented child keeps its grant");

    let stats = manager.validate_tree().expect("tree is clean");
    assert_eq!(stats.max_depth, 1, "children moved up to the root");

    inner_a.get_lock().expect("granted").release().expect("release");
    inner_b.get_lock().expect("granted").release().expect("release");
}

#[test]
fn scenario_try_get_lock_never_queues() {
    let manager = LockManager::new();

    let exclusive = manager
        .try_get_lock(LockMode::Exclusive)
        .expect("empty tree grants immediately");
    assert!(
        manager.try_get_lock(LockMode::Shared).is_none(),
        "fast path refuses rather than queueing"
    );
    exclusive.release().expect("release");

    let shared = manager.try_get_lock(LockMode::Shared).expect("granted");
    let upgradeable = manager
        .try_get_lock(LockMode::Upgradeable)
        .expect("coexists with shared");
    assert!(
        manager.try_get_lock(LockMode::Upgradeable).is_none(),
        "two upgradeables never coexist granted"
    );
    shared.release().expect("release");
    upgradeable.release().expect("release");
}

#[test]
fn scenario_on_completed_fires_exactly_once() {
    let manager = LockManager::new();
    let fired = Arc::new(AtomicUsize::new(0));

    let holder = manager.request_lock(LockMode::Exclusive);
    let waiter = manager.request_lock(LockMode::Shared);
    let observed_granted = Arc::new(AtomicBool::new(false));
    {
        let fired = Arc::clone(&fired);
        let observed_granted = Arc::clone(&observed_granted);
        waiter.on_completed(move |status| {
            fired.fetch_add(1, Ordering::SeqCst);
            observed_granted.store(status == LockStatus::Granted, Ordering::SeqCst);
        });
    }
    assert_eq!(fired.load(Ordering::SeqCst), 0, "nothing fires while pending");

    holder.get_lock().expect("granted").release().expect("release");
    assert_eq!(fired.load(Ordering::SeqCst), 1, "resolution fires the continuation");
    assert!(observed_granted.load(Ordering::SeqCst));

    // registering after resolution fires immediately
    {
        let fired = Arc::clone(&fired);
        waiter.on_completed(move |_| {
            fired.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    waiter.get_lock().expect("granted").release().expect("release");
}

#[test]
fn scenario_upgrade_continuation_and_downgrade() {
    let manager = LockManager::new();

    let u = manager
        .request_lock(LockMode::Upgradeable)
        .get_lock()
        .expect("granted");
    let blocker = manager.request_lock(LockMode::Shared);
    assert!(blocker.is_granted());

    let upgrade = u.upgrade().expect("upgrade");
    assert_eq!(
        u.upgrade().unwrap_err(),
        LockError::UpgradePending,
        "a second upgrade on the same lock is rejected while one stands"
    );

    let satisfied = Arc::new(AtomicBool::new(false));
    {
        let satisfied = Arc::clone(&satisfied);
        upgrade.on_completed(move |outcome| {
            satisfied.store(outcome, Ordering::SeqCst);
        });
    }

    blocker.get_lock().expect("granted").release().expect("release");
    upgrade.wait();
    assert!(satisfied.load(Ordering::SeqCst), "continuation observed satisfaction");
    assert!(u.is_exclusive());

    u.downgrade().expect("demote the satisfied upgrade");
    assert_eq!(u.mode(), Some(LockMode::Upgradeable));
    assert_eq!(
        u.downgrade(),
        Err(LockError::NotDowngradeable),
        "nothing left to downgrade"
    );
    u.release().expect("release");
}

#[test]
fn scenario_unrelated_subtrees_run_in_parallel() {
    let manager = LockManager::new();

    let left = manager
        .request_lock(LockMode::Shared)
        .get_lock()
        .expect("granted");
    let right = manager
        .request_lock(LockMode::Shared)
        .get_lock()
        .expect("granted");

    left.bind().expect("bind left");
    let left_writer = manager.request_lock(LockMode::Exclusive);
    assert!(left_writer.is_granted(), "sole child of the left subtree");
    left.unbind().expect("unbind");

    right.bind().expect("bind right");
    let right_writer = manager.request_lock(LockMode::Exclusive);
    assert!(
        right_writer.is_granted(),
        "the right subtree is untouched by the left one's writer"
    );
    right.unbind().expect("unbind");

    for request in [left_writer, right_writer] {
        request.get_lock().expect("granted").release().expect("release");
    }
    left.release().expect("release");
    right.release().expect("release");
    manager.validate_tree().expect("tree is clean");
}

#[test]
fn scenario_managers_are_isolated() {
    let first = LockManager::new();
    let second = LockManager::new();

    let exclusive = first
        .try_get_lock(LockMode::Exclusive)
        .expect("first manager grants");
    assert!(
        second.try_get_lock(LockMode::Exclusive).is_some(),
        "a second manager has its own tree and its own root"
    );
    exclusive.release().expect("release");
}

#[test]
fn scenario_pool_recycles_slots() {
    let manager = LockManager::new();
    let before = manager.node_slots();

    for _ in 0..64 {
        let lock = manager
            .request_lock(LockMode::Exclusive)
            .get_lock()
            .expect("granted");
        lock.release().expect("release");
    }

    assert!(
        manager.node_slots() <= before + 1,
        "steady request/release churn reuses one pooled slot"
    );
    assert!(manager.pooled_nodes() >= 1);
}

mod ordering_properties {
    use super::*;
    use proptest::prelude::*;

    fn mode_strategy() -> impl Strategy<Value = LockMode> {
        prop_oneof![
            Just(LockMode::Shared),
            Just(LockMode::Upgradeable),
            Just(LockMode::Exclusive),
        ]
    }

    proptest! {
        /// Whatever the request sequence, the tree invariants hold at every
        /// step, and releasing everything drains the tree back to the root.
        #[test]
        fn prop_invariants_hold_under_request_release_churn(
            modes in proptest::collection::vec(mode_strategy(), 1..24),
            release_order in proptest::collection::vec(any::<u8>(), 1..24),
        ) {
            let manager = LockManager::new();
            let mut requests: Vec<_> =
                modes.iter().map(|&mode| manager.request_lock(mode)).collect();
            manager.validate_tree().expect("valid while queued");

            let mut spin = 0usize;
            while !requests.is_empty() {
                let pick = release_order
                    .get(spin % release_order.len())
                    .copied()
                    .unwrap_or(0) as usize
                    % requests.len();
                spin += 1;
                let request = requests.remove(pick);
                if request.is_granted() {
                    request.get_lock().expect("granted").release().expect("release");
                } else if !request.cancel() {
                    // resolved between the check and the cancel: release it
                    request.get_lock().expect("granted").release().expect("release");
                }
                manager.validate_tree().expect("valid after each resolution");
            }

            let stats = manager.validate_tree().expect("valid when drained");
            prop_assert_eq!(stats.nodes, 1, "only the root remains");
        }

        /// At most one exclusive sibling is ever granted, and it is never
        /// granted while any other sibling grant is live.
        #[test]
        fn prop_exclusive_is_sole_grant(modes in proptest::collection::vec(mode_strategy(), 1..16)) {
            let manager = LockManager::new();
            let requests: Vec<_> =
                modes.iter().map(|&mode| manager.request_lock(mode)).collect();

            let granted_exclusive = requests
                .iter()
                .filter(|r| {
                    r.is_granted()
                        && r.get_lock().expect("granted").is_exclusive()
                })
                .count();
            let granted_total = requests.iter().filter(|r| r.is_granted()).count();
            prop_assert!(granted_exclusive <= 1);
            if granted_exclusive == 1 {
                prop_assert_eq!(granted_total, 1, "an exclusive grant stands alone");
            }

            for request in &requests {
                if !request.cancel() {
                    request.get_lock().expect("granted").release().expect("release");
                }
            }
            let stats = manager.validate_tree().expect("drained");
            prop_assert_eq!(stats.nodes, 1);
        }
    }
}
