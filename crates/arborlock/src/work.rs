//! Work-item queue abstraction for continuation dispatch.
//!
//! The grant cascade resolves continuations on whichever caller thread
//! performed the triggering mutation. Those continuations run arbitrary
//! caller logic, so they are handed to a [`WorkQueue`] rather than invoked
//! under the cascade: the resolving thread is never captured by caller
//! code, and call-stack depth stays bounded across long sibling chains.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

/// A unit of deferred work.
pub type WorkItem = Box<dyn FnOnce() + Send + 'static>;

/// Consumer-provided dispatch target for resolution continuations.
pub trait WorkQueue: Send + Sync + 'static {
    /// Accept a work item for eventual execution. Must not block for long;
    /// the caller may be inside the grant cascade.
    fn enqueue(&self, job: WorkItem);
}

// ---------------------------------------------------------------------------
// InlineWorkQueue
// ---------------------------------------------------------------------------

/// Runs each item immediately on the enqueuing thread.
///
/// The cascade only dispatches after dropping its admission regions, so
/// inline execution is safe; the trade-off is that continuation logic runs
/// on the releasing thread. The default for tests and simple embeddings.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineWorkQueue;

impl WorkQueue for InlineWorkQueue {
    fn enqueue(&self, job: WorkItem) {
        job();
    }
}

// ---------------------------------------------------------------------------
// ThreadedWorkQueue
// ---------------------------------------------------------------------------

struct ThreadedInner {
    queue: Mutex<ThreadedState>,
    available: Condvar,
}

struct ThreadedState {
    jobs: Vec<WorkItem>,
    shutdown: bool,
}

/// A single worker thread draining a FIFO of work items.
///
/// Dropping the queue signals shutdown and joins the worker after it
/// finishes the items already queued.
pub struct ThreadedWorkQueue {
    inner: Arc<ThreadedInner>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadedWorkQueue {
    #[must_use]
    pub fn new() -> Self {
        let inner = Arc::new(ThreadedInner {
            queue: Mutex::new(ThreadedState {
                jobs: Vec::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });
        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("arborlock-work".into())
            .spawn(move || Self::run(&worker_inner))
            .expect("failed to spawn arborlock worker thread");
        Self {
            inner,
            worker: Some(worker),
        }
    }

    fn run(inner: &ThreadedInner) {
        loop {
            let batch = {
                let mut state = inner.queue.lock();
                while state.jobs.is_empty() && !state.shutdown {
                    inner.available.wait(&mut state);
                }
                if state.jobs.is_empty() && state.shutdown {
                    return;
                }
                std::mem::take(&mut state.jobs)
            };
            for job in batch {
                job();
            }
        }
    }
}

impl Default for ThreadedWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue for ThreadedWorkQueue {
    fn enqueue(&self, job: WorkItem) {
        let mut state = self.inner.queue.lock();
        state.jobs.push(job);
        drop(state);
        self.inner.available.notify_one();
    }
}

impl Drop for ThreadedWorkQueue {
    fn drop(&mut self) {
        self.inner.queue.lock().shutdown = true;
        self.inner.available.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for ThreadedWorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedWorkQueue")
            .field("pending", &self.inner.queue.lock().jobs.len())
            .finish()
    }
}
