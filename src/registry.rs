//! Process-wide thread registry.
//!
//! Maps OS thread identities to stable worker indices. The first thread to
//! ask for an index receives 0 and is by convention the master. Contention
//! is negligible (entries change only on thread start/stop), so a single
//! mutex guards the whole map.
//!
//! Lock order: this mutex may be acquired while a pool's task mutex is
//! held, never the reverse.

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::Mutex;
use std::thread::{self, ThreadId};

lazy_static! {
    static ref THREAD_INDICES: Mutex<HashMap<ThreadId, usize>> = Mutex::new(HashMap::new());
}

/// Returns the calling thread's index, assigning the next free one if the
/// thread has never been seen.
pub(crate) fn self_index() -> usize {
    let mut map = THREAD_INDICES.lock().unwrap();
    let next = map.len();
    *map.entry(thread::current().id()).or_insert(next)
}

/// Registers `id` at `hint`, or at the current map size when no hint is
/// given. Called by the pool while starting a worker.
pub(crate) fn assign(id: ThreadId, hint: Option<usize>) -> usize {
    let mut map = THREAD_INDICES.lock().unwrap();
    let index = hint.unwrap_or_else(|| map.len());
    map.insert(id, index);
    index
}

/// Drops the entry for `id`. Called when the pool joins the thread.
pub(crate) fn forget(id: &ThreadId) {
    THREAD_INDICES.lock().unwrap().remove(id);
}
