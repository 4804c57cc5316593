//! Panic capture helpers. `AbortIfPanic` protects sensitive pool
//! bookkeeping: if an unexpected panic unwinds through it, the process
//! aborts rather than leaving the pool in a corrupted state.

use std::io::prelude::*;
use std::io::stderr;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

/// Executes `func` and captures any panic, translating it into an `Err`
/// result. Used at the worker boundary so a panicking task body cannot
/// take the worker thread down with it.
pub(crate) fn halt_unwinding<F, R>(func: F) -> thread::Result<R>
where
    F: FnOnce() -> R,
{
    panic::catch_unwind(AssertUnwindSafe(func))
}

pub(crate) struct AbortIfPanic;

fn aborting() {
    let _ = writeln!(&mut stderr(), "ptl: detected unexpected panic; aborting");
}

impl Drop for AbortIfPanic {
    fn drop(&mut self) {
        aborting();
        unsafe {
            libc::abort();
        }
    }
}
