//! Task objects and the disposal contract between queue and worker.
//!
//! A task is invocable exactly once. What happens to it afterwards depends
//! on whether it belongs to a [`TaskGroup`]: a detached task is owned (and
//! therefore dropped) by the worker that ran it, while a grouped task is
//! kept alive by its group and the worker drops only its own handle.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;

use crate::unwind;

type TaskBody = Box<dyn FnOnce() + Send + 'static>;

/// A single unit of work. The body can be taken and run only once; a
/// second invocation is a no-op.
pub struct PoolTask {
    body: Mutex<Option<TaskBody>>,
    group: Option<Weak<TaskGroup>>,
}

impl PoolTask {
    pub fn new<F>(body: F) -> PoolTask
    where
        F: FnOnce() + Send + 'static,
    {
        PoolTask {
            body: Mutex::new(Some(Box::new(body))),
            group: None,
        }
    }

    /// The group this task belongs to, if it still exists.
    pub fn group(&self) -> Option<Arc<TaskGroup>> {
        self.group.as_ref().and_then(Weak::upgrade)
    }

    /// Runs the body, capturing any panic. The group (if any) is credited
    /// with the completion either way, so `TaskGroup::wait` cannot hang on
    /// a panicked task.
    pub(crate) fn execute(&self) -> thread::Result<()> {
        let body = self.body.lock().unwrap().take();
        let result = match body {
            Some(f) => unwind::halt_unwinding(f),
            None => Ok(()),
        };
        if let Some(group) = self.group() {
            group.complete_one();
        }
        result
    }
}

impl fmt::Debug for PoolTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolTask")
            .field("pending", &self.body.lock().unwrap().is_some())
            .field("grouped", &self.group.is_some())
            .finish()
    }
}

/// What a queue hands to a worker. Ownership encodes the disposal rule:
/// executing a `Detached` handle and dropping it destroys the task, while
/// dropping a `Grouped` handle only releases the worker's reference.
pub enum TaskHandle {
    Detached(Box<PoolTask>),
    Grouped(Arc<PoolTask>),
}

impl TaskHandle {
    pub fn detached<F>(body: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        TaskHandle::Detached(Box::new(PoolTask::new(body)))
    }

    pub fn grouped<F>(group: &Arc<TaskGroup>, body: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        TaskHandle::Grouped(group.attach(body))
    }

    pub fn group(&self) -> Option<Arc<TaskGroup>> {
        match self {
            TaskHandle::Detached(task) => task.group(),
            TaskHandle::Grouped(task) => task.group(),
        }
    }

    pub(crate) fn invoke(self) -> thread::Result<()> {
        match self {
            TaskHandle::Detached(task) => task.execute(),
            TaskHandle::Grouped(task) => task.execute(),
        }
    }
}

/// An aggregation handle for related tasks. The group owns its tasks and
/// counts outstanding completions; `wait` blocks until every attached task
/// has run.
pub struct TaskGroup {
    pending: Mutex<usize>,
    completed: Condvar,
    tasks: Mutex<Vec<Arc<PoolTask>>>,
}

impl TaskGroup {
    pub fn new() -> Arc<TaskGroup> {
        Arc::new(TaskGroup {
            pending: Mutex::new(0),
            completed: Condvar::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Wraps `body` in a task owned by this group and returns a shared
    /// handle suitable for queueing.
    pub fn attach<F>(self: &Arc<Self>, body: F) -> Arc<PoolTask>
    where
        F: FnOnce() + Send + 'static,
    {
        let task = Arc::new(PoolTask {
            body: Mutex::new(Some(Box::new(body))),
            group: Some(Arc::downgrade(self)),
        });
        *self.pending.lock().unwrap() += 1;
        self.tasks.lock().unwrap().push(task.clone());
        task
    }

    pub(crate) fn complete_one(&self) {
        let mut pending = self.pending.lock().unwrap();
        if *pending > 0 {
            *pending -= 1;
        }
        if *pending == 0 {
            self.completed.notify_all();
        }
    }

    /// Blocks until every task attached to this group has completed.
    pub fn wait(&self) {
        let mut pending = self.pending.lock().unwrap();
        while *pending > 0 {
            pending = self.completed.wait(pending).unwrap();
        }
    }

    /// Number of tasks the group currently owns, completed or not.
    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Releases the group's ownership of its tasks.
    pub fn clear(&self) {
        self.tasks.lock().unwrap().clear();
    }
}

impl fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroup")
            .field("pending", &*self.pending.lock().unwrap())
            .field("tasks", &self.task_count())
            .finish()
    }
}
