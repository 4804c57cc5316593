//! The queue contract the pool depends on, plus the default FIFO queue
//! used when a caller supplies none.

use crossbeam_queue::{ArrayQueue, SegQueue};

use crate::task::TaskHandle;

/// What the worker loop requires of any task queue.
///
/// `empty` is an observational hint and may disagree with `true_size`
/// under partitioned implementations (a task can live in a bin that
/// `empty` skipped); `true_size` is the authoritative total across all
/// bins and is what the wait predicate trusts.
pub trait TaskQueue: Send + Sync {
    /// Non-blocking pop. Safe under concurrent callers.
    fn get_task(&self) -> Option<TaskHandle>;

    /// Cheap emptiness hint; may race.
    fn empty(&self) -> bool;

    /// Authoritative task count across all internal partitions.
    fn true_size(&self) -> usize;

    /// Producer side. The worker loop never pushes; submission layers do.
    fn push(&self, task: TaskHandle);
}

/// Two-bin FIFO queue: a bounded ring sized by the pool's capacity hint,
/// spilling into an unbounded segment queue under burst load. Pops favor
/// the bounded bin, which is filled first, so ordering is FIFO except in
/// the pathological push race where an element loses its ring slot and
/// overflows behind newer ones.
pub struct FifoQueue {
    bounded: ArrayQueue<TaskHandle>,
    overflow: SegQueue<TaskHandle>,
}

impl FifoQueue {
    pub fn new(capacity_hint: usize) -> FifoQueue {
        FifoQueue {
            bounded: ArrayQueue::new(capacity_hint.max(1)),
            overflow: SegQueue::new(),
        }
    }
}

impl TaskQueue for FifoQueue {
    fn get_task(&self) -> Option<TaskHandle> {
        self.bounded.pop().ok().or_else(|| self.overflow.pop().ok())
    }

    fn empty(&self) -> bool {
        self.bounded.is_empty() && self.overflow.is_empty()
    }

    fn true_size(&self) -> usize {
        self.bounded.len() + self.overflow.len()
    }

    fn push(&self, task: TaskHandle) {
        // Once anything has spilled, keep appending to the overflow so
        // older spilled tasks are not overtaken.
        if !self.overflow.is_empty() {
            self.overflow.push(task);
        } else if let Err(spill) = self.bounded.push(task) {
            self.overflow.push(spill.0);
        }
    }
}
