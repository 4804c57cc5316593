//! The public face of the pool.

use std::fmt;
use std::sync::Arc;

use crate::context::WorkerContext;
use crate::log::Event;
use crate::pool::Pool;
use crate::queue::{FifoQueue, TaskQueue};
use crate::registry;
use crate::task::{TaskGroup, TaskHandle};
use crate::{PoolBuilder, PoolError};

mod test;

/// A pool of worker threads pulling tasks from a shared queue.
///
/// The handle is deliberately not `Clone`: the constructing thread is the
/// master and the only legal caller of the lifecycle operations
/// (`initialize`, `stop_one`, `destroy`). Dropping the handle tears the
/// pool down if it is still alive.
pub struct ThreadPool {
    pool: Arc<Pool>,
}

impl ThreadPool {
    pub(crate) fn build(mut builder: PoolBuilder) -> Result<ThreadPool, PoolError> {
        let num_threads = builder.get_num_threads();
        let queue = builder
            .take_queue()
            .unwrap_or_else(|| Arc::new(FifoQueue::new(num_threads)) as Arc<dyn TaskQueue>);

        // Claim the master's registry slot before any worker is started,
        // so the first thread in the process ends up at index 0.
        let master_index = registry::self_index();
        if master_index != 0 {
            log!(2, Event::ForeignConstruction { index: master_index });
        }

        let init_fn = builder
            .take_init_handler()
            .unwrap_or_else(|| Arc::new(|| {}) as Arc<crate::InitHandler>);
        let pool = Arc::new(Pool::new(queue, master_index, init_fn, builder.take_affinity()));
        WorkerContext::install(&pool, true);
        pool.initialize(num_threads)?;
        Ok(ThreadPool { pool })
    }

    /// Grows or shrinks the pool to exactly `proposed` workers and
    /// returns the resulting size. `proposed < 1` is a no-op returning 0.
    pub fn initialize(&self, proposed: usize) -> Result<usize, PoolError> {
        self.pool.initialize(proposed)
    }

    /// Stops every worker and joins them. Calling it again is a no-op.
    pub fn destroy(&self) -> Result<usize, PoolError> {
        self.pool.destroy()
    }

    /// Asks one (non-deterministic) worker to exit and returns the new
    /// pool size once it has acknowledged.
    pub fn stop_one(&self) -> usize {
        self.pool.stop_one()
    }

    /// True once `initialize` has run, including after `destroy`.
    pub fn is_initialized(&self) -> bool {
        self.pool.is_initialized()
    }

    /// Current number of live workers, excluding the master.
    pub fn pool_size(&self) -> usize {
        self.pool.size()
    }

    /// Workers not currently blocked on the task condvar. Diagnostic.
    pub fn awake_count(&self) -> usize {
        self.pool.awake_count()
    }

    /// Replaces the per-worker initializer. Affects workers started after
    /// this call.
    pub fn set_init_fn<F>(&self, init: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.pool.set_init_fn(Arc::new(init));
    }

    /// The shared task queue.
    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        self.pool.queue()
    }

    /// Enqueues a detached task and wakes one worker. The task is
    /// destroyed by whichever worker runs it.
    pub fn submit<F>(&self, body: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.queue().push(TaskHandle::detached(body));
        self.pool.notify_one();
    }

    /// Enqueues a task owned by `group` and wakes one worker. The group
    /// retains the task after execution; use [`TaskGroup::wait`] to block
    /// until it has run.
    pub fn submit_in_group<F>(&self, group: &Arc<TaskGroup>, body: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.queue().push(TaskHandle::grouped(group, body));
        self.pool.notify_one();
    }

    /// Whether the calling thread belongs to this pool (as master or
    /// worker).
    pub fn current_thread_in_pool(&self) -> bool {
        WorkerContext::with(|cx| {
            cx.pool()
                .map_or(false, |pool| Arc::ptr_eq(&pool, &self.pool))
        })
        .unwrap_or(false)
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("pool_size", &self.pool.size())
            .field("initialized", &self.pool.is_initialized())
            .finish()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if self.pool.is_alive() {
            let _ = self.pool.destroy();
        }
    }
}
