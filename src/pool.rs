//! Pool core: lifecycle state machine, membership bookkeeping, and the
//! worker main loop.
//!
//! Control flows from the master into the workers through exactly three
//! channels: the pool-state atomic, the task mutex + condvar pair, and
//! the stop-token list. The task mutex guards everything the condvar
//! protocol must observe consistently: the membership vectors, the stop
//! tokens, and the acknowledgement list. It is never held across user
//! code or a queue pop.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use crate::context::WorkerContext;
use crate::log::Event;
use crate::queue::TaskQueue;
use crate::registry;
use crate::task::TaskHandle;
use crate::unwind;
use crate::{AffinityPolicy, InitHandler, PoolError};

/// Pool lifecycle states, in monotonic order. PARTIAL is transient: it is
/// entered while a single-worker stop is in flight and cleared back to
/// STARTED once the acknowledgement has been consumed. The pool is alive
/// in STARTED and PARTIAL.
pub(crate) const NONINIT: usize = 0;
pub(crate) const STARTED: usize = 1;
pub(crate) const PARTIAL: usize = 2;
pub(crate) const STOPPED: usize = 3;

/// Everything the task mutex guards. The first three vectors stay
/// index-aligned at every public entry and exit of the pool; a mismatch
/// is a fatal bookkeeping error.
#[derive(Default)]
struct Membership {
    worker_ids: Vec<ThreadId>,
    joined: Vec<bool>,
    handles: Vec<JoinHandle<()>>,
    stop_tokens: Vec<bool>,
    acked: VecDeque<ThreadId>,
}

impl Membership {
    fn aligned(&self) -> bool {
        self.joined.len() == self.worker_ids.len() && self.handles.len() == self.worker_ids.len()
    }
}

pub(crate) struct Pool {
    state: AtomicUsize,
    pool_size: AtomicUsize,
    master_index: usize,
    /// Workers not currently blocked on the condvar. Diagnostic only,
    /// clamped to `[0, pool_size]`.
    awake_count: AtomicUsize,
    members: Mutex<Membership>,
    task_cv: Condvar,
    queue: Arc<dyn TaskQueue>,
    init_fn: Mutex<Arc<InitHandler>>,
    affinity: Option<Box<AffinityPolicy>>,
}

impl Pool {
    pub(crate) fn new(
        queue: Arc<dyn TaskQueue>,
        master_index: usize,
        init_fn: Arc<InitHandler>,
        affinity: Option<Box<AffinityPolicy>>,
    ) -> Pool {
        Pool {
            state: AtomicUsize::new(NONINIT),
            pool_size: AtomicUsize::new(0),
            master_index,
            awake_count: AtomicUsize::new(0),
            members: Mutex::new(Membership::default()),
            task_cv: Condvar::new(),
            queue,
            init_fn: Mutex::new(init_fn),
            affinity,
        }
    }

    pub(crate) fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    pub(crate) fn size(&self) -> usize {
        self.pool_size.load(Ordering::Relaxed)
    }

    pub(crate) fn awake_count(&self) -> usize {
        self.awake_count.load(Ordering::Relaxed)
    }

    pub(crate) fn is_alive(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), STARTED | PARTIAL)
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Acquire) != NONINIT
    }

    pub(crate) fn set_init_fn(&self, init_fn: Arc<InitHandler>) {
        *self.init_fn.lock().unwrap() = init_fn;
    }

    /// Wakes one waiter. Producers call this after a push.
    pub(crate) fn notify_one(&self) {
        let _members = self.members.lock().unwrap();
        self.task_cv.notify_one();
    }

    /// Grows or shrinks the pool to exactly `proposed` workers. Spawn
    /// failures are logged and skipped; the membership invariant is
    /// checked afterwards and a violation is fatal.
    pub(crate) fn initialize(self: &Arc<Self>, proposed: usize) -> Result<usize, PoolError> {
        if proposed < 1 {
            return Ok(0);
        }

        let was_alive = self.is_alive();
        if !was_alive {
            self.state.store(STARTED, Ordering::Release);
        }

        let current = self.size();
        if was_alive {
            if current > proposed {
                while self.stop_one() > proposed {}
                log!(1, Event::PoolInitialized { size: self.size() });
                return Ok(self.size());
            } else if current == proposed {
                return Ok(current);
            }
        }

        for i in current..proposed {
            let index = self.master_index + i + 1;
            let pool = Arc::clone(self);
            let spawned = thread::Builder::new()
                .name(format!("ptl-worker-{}", index))
                .spawn(move || Pool::worker_entry(pool, Some(index)));
            match spawned {
                Ok(handle) => {
                    let mut members = self.members.lock().unwrap();
                    members.worker_ids.push(handle.thread().id());
                    members.joined.push(false);
                    members.handles.push(handle);
                    drop(members);
                    self.pool_size.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    // Transient thread-creation failure: keep going with
                    // the workers we can get.
                    log!(
                        1,
                        Event::SpawnFailed {
                            index,
                            kind: err.kind()
                        }
                    );
                    continue;
                }
            }
        }

        let members = self.members.lock().unwrap();
        if !members.aligned() {
            return Err(PoolError::membership_mismatch(
                members.joined.len(),
                members.worker_ids.len(),
            ));
        }
        drop(members);

        log!(1, Event::PoolInitialized { size: self.size() });
        Ok(self.size())
    }

    /// Asks one worker to exit; which one is non-deterministic. Blocks
    /// until a volunteer has acknowledged, so the returned size never
    /// lags the true membership. Master-only.
    pub(crate) fn stop_one(&self) -> usize {
        if !self.is_alive() || self.size() == 0 {
            return 0;
        }

        self.state.store(PARTIAL, Ordering::Release);

        let mut members = self.members.lock().unwrap();
        members.stop_tokens.push(true);
        self.task_cv.notify_one();
        log!(1, Event::StopRequested { pool_size: self.size() });

        while members.acked.is_empty() {
            members = self.task_cv.wait(members).unwrap();
        }

        let mut to_join = Vec::new();
        while let Some(tid) = members.acked.pop_front() {
            if let Some(pos) = members.worker_ids.iter().position(|id| *id == tid) {
                members.worker_ids.remove(pos);
                members.joined.pop();
                to_join.push(members.handles.remove(pos));
            }
            registry::forget(&tid);
        }
        let remaining = members.worker_ids.len();
        self.pool_size.store(remaining, Ordering::Relaxed);
        drop(members);

        // The volunteers have already left their loops; these joins are
        // only the final thread teardown.
        for handle in to_join {
            let _ = handle.join();
        }

        let _ = self
            .state
            .compare_exchange(PARTIAL, STARTED, Ordering::AcqRel, Ordering::Relaxed);

        remaining
    }

    /// Full teardown: stops every worker and joins them. Safe to call
    /// twice; the second call is a no-op returning 0. Once the STOPPED
    /// store lands, no worker dequeues another task.
    pub(crate) fn destroy(&self) -> Result<usize, PoolError> {
        let previous = self.state.swap(STOPPED, Ordering::AcqRel);

        {
            let _members = self.members.lock().unwrap();
            self.task_cv.notify_all();
        }

        if previous != STARTED && previous != PARTIAL {
            return Ok(0);
        }

        let handles = {
            let mut members = self.members.lock().unwrap();
            if !members.aligned() {
                return Err(PoolError::membership_mismatch(
                    members.joined.len(),
                    members.worker_ids.len(),
                ));
            }
            for tid in &members.worker_ids {
                registry::forget(tid);
            }
            members.handles.drain(..).collect::<Vec<_>>()
        };

        // Covers workers that reached the condvar after the first
        // broadcast. Must not hold the task mutex while joining: waking
        // workers reacquire it on their way out.
        {
            let _members = self.members.lock().unwrap();
            self.task_cv.notify_all();
        }

        for handle in handles {
            let _ = handle.join();
        }

        let mut members = self.members.lock().unwrap();
        for joined in members.joined.iter_mut() {
            *joined = true;
        }
        members.worker_ids.clear();
        members.joined.clear();
        members.stop_tokens.clear();
        members.acked.clear();
        drop(members);
        self.pool_size.store(0, Ordering::Relaxed);

        log!(
            1,
            Event::PoolDestroyed {
                master: self.master_index
            }
        );
        Ok(0)
    }

    /// Entry point for every worker thread.
    pub(crate) fn worker_entry(pool: Arc<Pool>, hint: Option<usize>) {
        let index = registry::assign(thread::current().id(), hint);
        WorkerContext::install(&pool, false);
        pool.pin_current_thread(index);
        let queue = WorkerContext::with(|cx| cx.current_queue())
            .expect("worker context was just installed");

        // Panics past this point are pool bugs, not task failures; the
        // membership bookkeeping cannot survive a half-dead worker.
        let abort_guard = unwind::AbortIfPanic;
        pool.main_loop(queue, index);
        mem::forget(abort_guard);
    }

    fn main_loop(&self, queue: Arc<dyn TaskQueue>, index: usize) {
        self.awake_inc();

        let init = self.init_fn.lock().unwrap().clone();
        if unwind::halt_unwinding(|| init()).is_err() {
            log!(1, Event::InitHandlerPanicked { index });
        }
        log!(2, Event::WorkerStarted { index });

        debug_assert!(
            WorkerContext::with(|cx| Arc::ptr_eq(&cx.current_queue(), &self.queue))
                .unwrap_or(false)
        );

        // Warmup dequeue: give one task a chance to run before the first
        // condvar wait, so lazy per-thread setup inside task bodies
        // happens up front.
        WorkerContext::with(|cx| cx.set_within_task(true));
        if let Some(task) = queue.get_task() {
            self.run_task(index, task);
        }
        WorkerContext::with(|cx| cx.set_within_task(false));

        let tid = thread::current().id();
        let awake_at_exit = self.run_loop(&queue, tid, index);

        // A worker that left straight out of the condvar already gave up
        // its awake slot before sleeping.
        if awake_at_exit {
            self.awake_dec();
        }
        log!(2, Event::WorkerExited { index });
    }

    /// Returns whether the worker was counted awake when it left.
    fn run_loop(&self, queue: &Arc<dyn TaskQueue>, tid: ThreadId, index: usize) -> bool {
        loop {
            if self.leave_pool(tid, index) {
                return true;
            }

            // Double-gated wait: `empty` is only a hint, so before
            // sleeping we consult `true_size`, and the wake predicate
            // re-checks both. A task sitting in a bin that `empty`
            // skipped still wakes us.
            while queue.empty() {
                if self.leave_pool(tid, index) {
                    return true;
                }
                if queue.true_size() == 0 {
                    self.awake_dec();
                    let mut members = self.members.lock().unwrap();
                    while queue.empty()
                        && queue.true_size() == 0
                        && self.state.load(Ordering::Acquire) < PARTIAL
                    {
                        members = self.task_cv.wait(members).unwrap();
                    }
                    if self.leave_pool_locked(&mut members, tid, index) {
                        return false;
                    }
                    drop(members);
                    self.awake_inc();
                } else {
                    break;
                }
            }

            if self.leave_pool(tid, index) {
                return true;
            }

            WorkerContext::with(|cx| cx.set_within_task(true));
            while !queue.empty() && self.state.load(Ordering::Acquire) != STOPPED {
                if let Some(task) = queue.get_task() {
                    self.run_task(index, task);
                }
            }
            WorkerContext::with(|cx| cx.set_within_task(false));
        }
    }

    /// Should this worker exit? STOPPED means everyone leaves; PARTIAL
    /// means one volunteer claims the pending stop token.
    fn leave_pool(&self, tid: ThreadId, index: usize) -> bool {
        match self.state.load(Ordering::Acquire) {
            STOPPED => true,
            PARTIAL => {
                let mut members = self.members.lock().unwrap();
                self.leave_pool_locked(&mut members, tid, index)
            }
            _ => false,
        }
    }

    fn leave_pool_locked(&self, members: &mut Membership, tid: ThreadId, index: usize) -> bool {
        let state = self.state.load(Ordering::Acquire);
        if state == STOPPED {
            return true;
        }
        if state == PARTIAL && members.stop_tokens.last() == Some(&true) {
            members.stop_tokens.pop();
            members.acked.push_back(tid);
            // The master blocks on the same condvar for this
            // acknowledgement.
            self.task_cv.notify_all();
            log!(1, Event::StopAcknowledged { index });
            return true;
        }
        false
    }

    fn run_task(&self, index: usize, task: TaskHandle) {
        WorkerContext::with(|cx| cx.enter_task());
        let outcome = task.invoke();
        WorkerContext::with(|cx| cx.leave_task());
        if outcome.is_err() {
            log!(1, Event::TaskPanicked { index });
        }
    }

    fn awake_inc(&self) {
        let cap = self.size();
        let _ = self
            .awake_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                if n < cap {
                    Some(n + 1)
                } else {
                    None
                }
            });
    }

    fn awake_dec(&self) {
        let _ = self
            .awake_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    #[cfg(target_os = "linux")]
    fn pin_current_thread(&self, index: usize) {
        if let Some(policy) = &self.affinity {
            let cpu = policy(index);
            if cpu >= libc::CPU_SETSIZE as usize {
                log!(1, Event::AffinityFailed { index, cpu });
                return;
            }
            unsafe {
                let mut cpuset: libc::cpu_set_t = mem::zeroed();
                libc::CPU_ZERO(&mut cpuset);
                libc::CPU_SET(cpu, &mut cpuset);
                if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &cpuset) != 0 {
                    // Pinning is best effort; the worker runs unpinned.
                    log!(1, Event::AffinityFailed { index, cpu });
                }
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn pin_current_thread(&self, index: usize) {
        if let Some(policy) = &self.affinity {
            let cpu = policy(index);
            log!(1, Event::AffinityFailed { index, cpu });
        }
    }
}
