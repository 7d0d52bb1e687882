//! Hierarchical, multi-granularity lock manager.
//!
//! Locks form a dynamically growing tree: a child lock nests inside the
//! scope of a parent lock, database-style intention locking applied to
//! in-process concurrency. Unrelated subtrees run fully in parallel,
//! siblings compete per mode compatibility (Shared / Upgradeable /
//! Exclusive), and a caller already holding a lock can acquire nested
//! child locks without deadlocking on itself — reentrancy is explicit
//! binding, never thread identity.
//!
//! ```
//! use arborlock::{LockManager, LockMode};
//!
//! let manager = LockManager::new();
//!
//! let shared = manager.request_lock(LockMode::Shared).lock().unwrap();
//! let writer = manager.request_lock(LockMode::Exclusive);
//! assert!(writer.is_pending(), "queued behind the shared holder");
//!
//! shared.release().unwrap();
//! let writer = writer.lock().unwrap();
//! writer.release().unwrap();
//! ```

mod arena;
mod binding;
mod invariants;
mod node;
mod pool;

pub mod handle;
pub mod manager;
pub mod region;
pub mod state;
pub mod work;

pub use arborlock_error::LockError;
pub use handle::{Lock, Request, UpgradeRequest};
pub use invariants::TreeStats;
pub use manager::{LockManager, ManagerConfig};
pub use node::{TreeMetrics, reset_tree_metrics, tree_metrics};
pub use pool::{PoolMetrics, pool_metrics, reset_pool_metrics};
pub use region::{
    CacheAligned, Region, RegionGuard, RegionMetrics, region_metrics, reset_region_metrics,
};
pub use state::{LockMode, LockStatus};
pub use work::{InlineWorkQueue, ThreadedWorkQueue, WorkItem, WorkQueue};
