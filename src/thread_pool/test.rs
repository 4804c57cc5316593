#![cfg(test)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::context::WorkerContext;
use crate::queue::{FifoQueue, TaskQueue};
use crate::task::{TaskGroup, TaskHandle};
use crate::PoolBuilder;

/// Polls `cond` for up to `ms` milliseconds.
fn wait_until(ms: u64, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(ms);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[test]
fn single_task_round_trip() {
    let pool = PoolBuilder::new().num_threads(2).build().unwrap();
    let cell = Arc::new(AtomicUsize::new(0));
    let target = cell.clone();
    pool.submit(move || target.store(42, Ordering::SeqCst));
    assert!(wait_until(2_000, || cell.load(Ordering::SeqCst) == 42));
    assert_eq!(pool.pool_size(), 2);
}

#[test]
fn idle_shutdown_joins_all() {
    let pool = PoolBuilder::new().num_threads(4).build().unwrap();
    assert_eq!(pool.pool_size(), 4);
    assert_eq!(pool.destroy().unwrap(), 0);
    assert_eq!(pool.pool_size(), 0);
    assert_eq!(pool.awake_count(), 0);
}

#[test]
fn busy_shutdown_completes_running_tasks() {
    let pool = PoolBuilder::new().num_threads(2).build().unwrap();
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    for _ in 0..500 {
        let started = started.clone();
        let finished = finished.clone();
        pool.submit(move || {
            started.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(1));
            finished.fetch_add(1, Ordering::SeqCst);
        });
    }
    thread::sleep(Duration::from_millis(50));
    pool.destroy().unwrap();

    // Whatever was in flight ran to completion before destroy returned.
    let started_at_destroy = started.load(Ordering::SeqCst);
    assert_eq!(started_at_destroy, finished.load(Ordering::SeqCst));
    assert!(started_at_destroy < 500);

    // Nothing starts once the pool is stopped.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(started.load(Ordering::SeqCst), started_at_destroy);
}

#[test]
fn stop_one_shrinks_by_one() {
    let pool = PoolBuilder::new().num_threads(3).build().unwrap();
    assert_eq!(pool.stop_one(), 2);
    assert_eq!(pool.pool_size(), 2);
    assert_eq!(pool.stop_one(), 1);
    assert_eq!(pool.stop_one(), 0);
    // An empty pool has no volunteer to offer.
    assert_eq!(pool.stop_one(), 0);
}

#[test]
fn initialize_shrinks_to_target() {
    let pool = PoolBuilder::new().num_threads(4).build().unwrap();
    assert_eq!(pool.initialize(2).unwrap(), 2);
    assert_eq!(pool.pool_size(), 2);
    // Same size again is a no-op.
    assert_eq!(pool.initialize(2).unwrap(), 2);
}

#[test]
fn pool_still_runs_tasks_after_shrink() {
    let pool = PoolBuilder::new().num_threads(2).build().unwrap();
    assert_eq!(pool.stop_one(), 1);
    let hits = Arc::new(AtomicUsize::new(0));
    let target = hits.clone();
    pool.submit(move || {
        target.fetch_add(1, Ordering::SeqCst);
    });
    assert!(wait_until(2_000, || hits.load(Ordering::SeqCst) == 1));
}

/// A queue whose `empty()` misreports exactly once after `lie` is set,
/// while `true_size()` stays accurate. Models a partitioned queue where
/// the emptiness hint skips a populated bin.
struct LyingQueue {
    inner: Mutex<VecDeque<TaskHandle>>,
    lie: AtomicBool,
}

impl LyingQueue {
    fn new() -> LyingQueue {
        LyingQueue {
            inner: Mutex::new(VecDeque::new()),
            lie: AtomicBool::new(false),
        }
    }
}

impl TaskQueue for LyingQueue {
    fn get_task(&self) -> Option<TaskHandle> {
        self.inner.lock().unwrap().pop_front()
    }

    fn empty(&self) -> bool {
        if self.lie.swap(false, Ordering::SeqCst) {
            return true;
        }
        self.inner.lock().unwrap().is_empty()
    }

    fn true_size(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    fn push(&self, task: TaskHandle) {
        self.inner.lock().unwrap().push_back(task);
    }
}

#[test]
fn wait_predicate_defeats_stale_empty_hint() {
    let queue = Arc::new(LyingQueue::new());
    let pool = PoolBuilder::new()
        .num_threads(1)
        .task_queue(queue.clone() as Arc<dyn TaskQueue>)
        .build()
        .unwrap();

    // Let the worker settle into its condvar wait.
    thread::sleep(Duration::from_millis(100));

    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    queue.lie.store(true, Ordering::SeqCst);
    pool.submit(move || flag.store(true, Ordering::SeqCst));

    // true_size() catches the disagreement and the task still runs.
    assert!(wait_until(2_000, || ran.load(Ordering::SeqCst)));
}

#[test]
fn task_observes_reentrancy_flag() {
    let pool = PoolBuilder::new().num_threads(1).build().unwrap();
    let observed = Arc::new(AtomicBool::new(false));
    let seen = observed.clone();
    pool.submit(move || {
        let within = WorkerContext::with(|cx| cx.within_task()).unwrap_or(false);
        seen.store(within, Ordering::SeqCst);
    });
    assert!(wait_until(2_000, || observed.load(Ordering::SeqCst)));
}

#[test]
fn task_depth_counts_nesting() {
    let pool = PoolBuilder::new().num_threads(1).build().unwrap();
    let depth = Arc::new(AtomicUsize::new(0));
    let seen = depth.clone();
    pool.submit(move || {
        let d = WorkerContext::with(|cx| cx.task_depth()).unwrap_or(0);
        seen.store(d, Ordering::SeqCst);
    });
    assert!(wait_until(2_000, || depth.load(Ordering::SeqCst) == 1));
}

#[test]
fn grouped_task_survives_its_worker() {
    let pool = PoolBuilder::new().num_threads(2).build().unwrap();
    let group = TaskGroup::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let target = hits.clone();
    pool.submit_in_group(&group, move || {
        target.fetch_add(1, Ordering::SeqCst);
    });
    group.wait();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    // The worker dropped only its handle; the group still owns the task.
    assert_eq!(group.task_count(), 1);
}

#[test]
fn detached_task_dropped_after_run() {
    struct DropFlag(Arc<AtomicBool>);
    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    let pool = PoolBuilder::new().num_threads(1).build().unwrap();
    let dropped = Arc::new(AtomicBool::new(false));
    let executed = Arc::new(AtomicBool::new(false));
    let guard = DropFlag(dropped.clone());
    let ran = executed.clone();
    pool.submit(move || {
        let _hold = &guard;
        ran.store(true, Ordering::SeqCst);
    });
    assert!(wait_until(2_000, || executed.load(Ordering::SeqCst)
        && dropped.load(Ordering::SeqCst)));
}

#[test]
fn panicking_task_does_not_kill_worker() {
    let pool = PoolBuilder::new().num_threads(1).build().unwrap();
    pool.submit(|| panic!("task failure"));
    let hits = Arc::new(AtomicUsize::new(0));
    let target = hits.clone();
    pool.submit(move || {
        target.fetch_add(1, Ordering::SeqCst);
    });
    assert!(wait_until(2_000, || hits.load(Ordering::SeqCst) == 1));
    assert_eq!(pool.pool_size(), 1);
}

#[test]
fn master_flag_only_on_constructing_thread() {
    let pool = PoolBuilder::new().num_threads(1).build().unwrap();
    assert_eq!(WorkerContext::with(|cx| cx.is_master()), Some(true));
    assert!(pool.current_thread_in_pool());

    let worker_is_master = Arc::new(AtomicBool::new(true));
    let seen = worker_is_master.clone();
    let done = Arc::new(AtomicBool::new(false));
    let done_flag = done.clone();
    pool.submit(move || {
        let is_master = WorkerContext::with(|cx| cx.is_master()).unwrap_or(true);
        seen.store(is_master, Ordering::SeqCst);
        done_flag.store(true, Ordering::SeqCst);
    });
    assert!(wait_until(2_000, || done.load(Ordering::SeqCst)));
    assert!(!worker_is_master.load(Ordering::SeqCst));
}

#[test]
fn init_handler_runs_on_every_worker() {
    let inits = Arc::new(AtomicUsize::new(0));
    let counter = inits.clone();
    let pool = PoolBuilder::new()
        .num_threads(3)
        .init_handler(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    assert!(wait_until(2_000, || inits.load(Ordering::SeqCst) == 3));
    drop(pool);
}

#[test]
fn worker_rebinds_queue_for_a_nested_scope() {
    let pool = PoolBuilder::new().num_threads(1).build().unwrap();

    // A side queue carrying one task, to be drained inline while the
    // worker is temporarily rebound to it.
    let side = Arc::new(FifoQueue::new(2)) as Arc<dyn TaskQueue>;
    let inner_ran = Arc::new(AtomicBool::new(false));
    let inner_flag = inner_ran.clone();
    side.push(TaskHandle::detached(move || {
        inner_flag.store(true, Ordering::SeqCst)
    }));

    let bound_ok = Arc::new(AtomicBool::new(false));
    let restored_ok = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));
    let (bound, restored, finished) = (bound_ok.clone(), restored_ok.clone(), done.clone());
    let nested = side.clone();
    pool.submit(move || {
        let outer = WorkerContext::with(|cx| cx.current_queue()).unwrap();
        WorkerContext::with(|cx| cx.bind_queue(nested.clone()));
        let current = WorkerContext::with(|cx| cx.current_queue()).unwrap();
        bound.store(Arc::ptr_eq(&current, &nested), Ordering::SeqCst);
        while let Some(task) = current.get_task() {
            let _ = task.invoke();
        }
        WorkerContext::with(|cx| cx.unbind_queue());
        let current = WorkerContext::with(|cx| cx.current_queue()).unwrap();
        restored.store(Arc::ptr_eq(&current, &outer), Ordering::SeqCst);
        finished.store(true, Ordering::SeqCst);
    });

    assert!(wait_until(2_000, || done.load(Ordering::SeqCst)));
    assert!(bound_ok.load(Ordering::SeqCst));
    assert!(restored_ok.load(Ordering::SeqCst));
    assert!(inner_ran.load(Ordering::SeqCst));
}

#[test]
fn replacement_init_fn_applies_to_new_workers() {
    let first = Arc::new(AtomicUsize::new(0));
    let counter = first.clone();
    let pool = PoolBuilder::new()
        .num_threads(2)
        .init_handler(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    assert!(wait_until(2_000, || first.load(Ordering::SeqCst) == 2));

    let second = Arc::new(AtomicUsize::new(0));
    let counter = second.clone();
    pool.set_init_fn(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(pool.initialize(4).unwrap(), 4);

    // Only the two workers started after the swap run the replacement;
    // the original workers never re-run an initializer.
    assert!(wait_until(2_000, || second.load(Ordering::SeqCst) == 2));
    assert_eq!(first.load(Ordering::SeqCst), 2);
}

#[test]
fn queue_accessor_is_the_submission_queue() {
    let queue = Arc::new(FifoQueue::new(4)) as Arc<dyn TaskQueue>;
    let pool = PoolBuilder::new()
        .num_threads(1)
        .task_queue(queue.clone())
        .build()
        .unwrap();
    assert!(Arc::ptr_eq(pool.queue(), &queue));

    // A task pushed through the accessor is drained like any submission.
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    pool.queue()
        .push(TaskHandle::detached(move || flag.store(true, Ordering::SeqCst)));
    pool.submit(|| {});
    assert!(wait_until(2_000, || ran.load(Ordering::SeqCst)));
}

#[test]
fn affinity_policy_is_consulted_per_worker() {
    let asked = Arc::new(Mutex::new(Vec::new()));
    let record = asked.clone();
    let pool = PoolBuilder::new()
        .num_threads(2)
        .affinity(move |index| {
            record.lock().unwrap().push(index);
            0
        })
        .build()
        .unwrap();

    // Each worker consults the policy once, at bootstrap, with its own
    // index.
    assert!(wait_until(2_000, || asked.lock().unwrap().len() == 2));
    let mut indices = asked.lock().unwrap().clone();
    indices.sort();
    indices.dedup();
    assert_eq!(indices.len(), 2);
    drop(pool);
}

#[test]
fn failed_pinning_leaves_worker_running() {
    // An impossible CPU id makes pinning fail; the worker proceeds
    // unpinned.
    let pool = PoolBuilder::new()
        .num_threads(1)
        .affinity(|_| usize::MAX)
        .build()
        .unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    pool.submit(move || flag.store(true, Ordering::SeqCst));
    assert!(wait_until(2_000, || ran.load(Ordering::SeqCst)));
}

#[test]
fn awake_count_stays_within_bounds() {
    let pool = PoolBuilder::new().num_threads(2).build().unwrap();
    // Idle workers go to sleep eventually.
    assert!(wait_until(2_000, || pool.awake_count() == 0));
    assert!(pool.awake_count() <= pool.pool_size());
    pool.destroy().unwrap();
    assert_eq!(pool.awake_count(), 0);
}
