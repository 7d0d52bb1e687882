use thiserror::Error;

/// Primary error type for arborlock operations.
///
/// Structured variants for the failure classes the lock manager can surface:
/// misuse of the handle API (binding order, upgrade on the wrong mode,
/// double release), cancellation observed through `get_lock`, and stale or
/// foreign handles rejected by generation validation.
///
/// Transient conditions — a ticket still spinning, a request still pending
/// in the queue — are never errors; only terminal states are observable
/// results.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    // === Binding ===
    /// Binding a lock whose parent is not the currently bound lock.
    #[error("cannot bind: parent lock is not the currently bound lock")]
    BindOrder,

    /// Unbinding a lock that is not the current binding.
    #[error("cannot unbind: lock is not the currently bound lock")]
    NotBound,

    // === Upgrade / downgrade ===
    /// `upgrade()` on a lock that is not upgradeable.
    #[error("cannot upgrade a {mode} lock")]
    NotUpgradeable { mode: &'static str },

    /// `upgrade()` while a previous upgrade on the same lock is outstanding.
    #[error("an upgrade is already outstanding for this lock")]
    UpgradePending,

    /// `downgrade()` without a standing upgrade to revoke.
    #[error("cannot downgrade: no upgrade was requested on this lock")]
    NotDowngradeable,

    // === Status transitions ===
    /// A release/cancel attempted against the wrong prior status, including
    /// double release.
    #[error("invalid status transition: expected {expected}, found {actual}")]
    UnexpectedStatus {
        expected: &'static str,
        actual: &'static str,
    },

    /// `get_lock()` on a request that has not resolved yet.
    #[error("request is still pending")]
    RequestPending,

    /// `get_lock()` on a request that resolved to Cancelled.
    #[error("operation was canceled: request resolved to cancelled")]
    RequestCancelled,

    // === Handles ===
    /// A handle whose node slot was recycled, or one minted by a different
    /// manager instance.
    #[error("stale or foreign lock handle")]
    StaleHandle,

    // === Configuration ===
    /// Manager configuration rejected by validation.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: &'static str },
}
