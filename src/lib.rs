//! A long-lived pool of worker threads that cooperatively pull tasks from
//! a shared queue.
//!
//! The pool is built once with [`PoolBuilder`] and then managed through
//! [`ThreadPool`]: it can grow or shrink to an exact size
//! ([`ThreadPool::initialize`]), give up a single worker on demand
//! ([`ThreadPool::stop_one`]), and tear down cleanly
//! ([`ThreadPool::destroy`], also run on drop). Workers block on a shared
//! condition variable while the queue is empty and drain it when woken.
//!
//! The queue itself is pluggable: anything implementing [`TaskQueue`] can
//! back the pool, and a two-bin FIFO ([`FifoQueue`]) is used by default.
//! Task disposal follows ownership: a detached task is destroyed by the
//! worker that ran it, a task attached to a [`TaskGroup`] stays owned by
//! the group.
//!
//! ```
//! let pool = ptl::PoolBuilder::new().num_threads(2).build().unwrap();
//! let group = ptl::TaskGroup::new();
//! pool.submit_in_group(&group, || println!("hello from a worker"));
//! group.wait();
//! ```
//!
//! Setting the `PTL_VERBOSE` environment variable to 1 or 2 prints
//! lifecycle diagnostics to stderr.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

#[macro_use]
mod log;

mod context;
mod pool;
mod queue;
mod registry;
mod task;
mod thread_pool;
mod unwind;

pub use crate::context::WorkerContext;
pub use crate::queue::{FifoQueue, TaskQueue};
pub use crate::task::{PoolTask, TaskGroup, TaskHandle};
pub use crate::thread_pool::ThreadPool;

/// Per-worker initializer, invoked once on each worker thread before it
/// enters its loop. May be invoked on several threads in parallel.
type InitHandler = dyn Fn() + Send + Sync;

/// Maps a worker index to the CPU it should be pinned to.
type AffinityPolicy = dyn Fn(usize) -> usize + Send + Sync;

/// Returns the calling thread's process-wide worker index. The first
/// thread ever to ask is the master and receives index 0.
pub fn this_thread_id() -> usize {
    registry::self_index()
}

/// Configures and builds a [`ThreadPool`].
pub struct PoolBuilder {
    /// Worker count; 0 means one worker per logical CPU.
    num_threads: usize,

    /// The shared task queue; a [`FifoQueue`] sized to the worker count
    /// is created when none is supplied.
    queue: Option<Arc<dyn TaskQueue>>,

    /// Closure run once on every worker before its loop.
    init_handler: Option<Arc<InitHandler>>,

    /// Worker-index-to-CPU pinning policy; workers run unpinned without
    /// one.
    affinity: Option<Box<AffinityPolicy>>,
}

impl Default for PoolBuilder {
    fn default() -> PoolBuilder {
        PoolBuilder {
            num_threads: 0,
            queue: None,
            init_handler: None,
            affinity: None,
        }
    }
}

impl PoolBuilder {
    pub fn new() -> PoolBuilder {
        PoolBuilder::default()
    }

    /// Sets the number of workers. Zero (the default) selects one worker
    /// per logical CPU.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Backs the pool with a caller-supplied queue instead of the default
    /// FIFO.
    pub fn task_queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Sets a closure run once on each worker thread before it starts
    /// pulling tasks.
    pub fn init_handler<F>(mut self, init: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.init_handler = Some(Arc::new(init));
        self
    }

    /// Sets the CPU pinning policy (worker index to CPU id). Pinning is
    /// best effort: failures are logged and the worker runs unpinned.
    pub fn affinity<F>(mut self, policy: F) -> Self
    where
        F: Fn(usize) -> usize + Send + Sync + 'static,
    {
        self.affinity = Some(Box::new(policy));
        self
    }

    /// Builds the pool and starts its workers.
    pub fn build(self) -> Result<ThreadPool, PoolError> {
        ThreadPool::build(self)
    }

    fn get_num_threads(&self) -> usize {
        if self.num_threads > 0 {
            self.num_threads
        } else {
            num_cpus::get()
        }
    }

    fn take_queue(&mut self) -> Option<Arc<dyn TaskQueue>> {
        self.queue.take()
    }

    fn take_init_handler(&mut self) -> Option<Arc<InitHandler>> {
        self.init_handler.take()
    }

    fn take_affinity(&mut self) -> Option<Box<AffinityPolicy>> {
        self.affinity.take()
    }
}

impl fmt::Debug for PoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("num_threads", &self.num_threads)
            .field("queue", &self.queue.as_ref().map(|_| "<queue>"))
            .field("init_handler", &self.init_handler.as_ref().map(|_| "<closure>"))
            .field("affinity", &self.affinity.as_ref().map(|_| "<closure>"))
            .finish()
    }
}

/// Fatal pool error.
#[derive(Debug)]
pub struct PoolError {
    kind: ErrorKind,
}

#[derive(Debug)]
enum ErrorKind {
    /// The joined-flags vector fell out of step with the worker list;
    /// joining would be unsound from here.
    MembershipMismatch { joined: usize, threads: usize },
}

impl PoolError {
    pub(crate) fn membership_mismatch(joined: usize, threads: usize) -> PoolError {
        PoolError {
            kind: ErrorKind::MembershipMismatch { joined, threads },
        }
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::MembershipMismatch { joined, threads } => write!(
                f,
                "pool bookkeeping out of sync: {} joined flags vs {} worker threads",
                joined, threads
            ),
        }
    }
}

impl Error for PoolError {}
