//! Per-thread worker bookkeeping.
//!
//! Every thread that enters a pool (the master included) carries exactly
//! one `WorkerContext`, stored in a thread local and created when the
//! thread joins the pool. It is only ever touched by its owning thread;
//! all access goes through [`WorkerContext::with`].

use std::cell::RefCell;
use std::mem;
use std::sync::{Arc, Weak};

use crate::pool::Pool;
use crate::queue::TaskQueue;

thread_local! {
    static WORKER_CONTEXT: RefCell<Option<WorkerContext>> = RefCell::new(None);
}

pub struct WorkerContext {
    is_master: bool,
    within_task: bool,
    task_depth: usize,
    pool: Weak<Pool>,
    current_queue: Arc<dyn TaskQueue>,
    queue_stack: Vec<Arc<dyn TaskQueue>>,
}

impl WorkerContext {
    /// Binds a fresh context for the current thread to `pool`. Replaces
    /// any previous context (a thread can only serve one pool at a time).
    pub(crate) fn install(pool: &Arc<Pool>, is_master: bool) {
        let context = WorkerContext {
            is_master,
            within_task: false,
            task_depth: 0,
            pool: Arc::downgrade(pool),
            current_queue: pool.queue().clone(),
            queue_stack: Vec::new(),
        };
        WORKER_CONTEXT.with(|slot| *slot.borrow_mut() = Some(context));
    }

    /// Runs `f` against the calling thread's context, or returns `None`
    /// if this thread never entered a pool.
    pub fn with<R>(f: impl FnOnce(&mut WorkerContext) -> R) -> Option<R> {
        WORKER_CONTEXT.with(|slot| slot.borrow_mut().as_mut().map(f))
    }

    /// True only on the thread that constructed the pool.
    pub fn is_master(&self) -> bool {
        self.is_master
    }

    /// Reentrancy guard: true while this worker is invoking tasks. Task
    /// bodies that submit and join can check this to take an inline
    /// execution path instead of blocking the worker on work only it can
    /// run.
    pub fn within_task(&self) -> bool {
        self.within_task
    }

    pub(crate) fn set_within_task(&mut self, within: bool) {
        self.within_task = within;
    }

    /// Nesting depth of task execution on this thread.
    pub fn task_depth(&self) -> usize {
        self.task_depth
    }

    pub(crate) fn enter_task(&mut self) {
        self.task_depth += 1;
    }

    pub(crate) fn leave_task(&mut self) {
        self.task_depth = self.task_depth.saturating_sub(1);
    }

    /// The queue this worker is currently bound to.
    pub fn current_queue(&self) -> Arc<dyn TaskQueue> {
        self.current_queue.clone()
    }

    /// Temporarily rebinds the worker to `queue`; the previous binding is
    /// pushed and restored by [`unbind_queue`](Self::unbind_queue).
    pub fn bind_queue(&mut self, queue: Arc<dyn TaskQueue>) {
        let previous = mem::replace(&mut self.current_queue, queue);
        self.queue_stack.push(previous);
    }

    /// Restores the queue binding saved by the matching
    /// [`bind_queue`](Self::bind_queue). No-op if nothing was pushed.
    pub fn unbind_queue(&mut self) {
        if let Some(previous) = self.queue_stack.pop() {
            self.current_queue = previous;
        }
    }

    pub(crate) fn pool(&self) -> Option<Arc<Pool>> {
        self.pool.upgrade()
    }
}
