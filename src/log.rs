//! Diagnostic event log.
//!
//! Emission is controlled by the `PTL_VERBOSE` environment variable (an
//! integer, default 0, read once). Level 1 covers pool lifecycle events,
//! level 2 adds per-worker chatter.

use lazy_static::lazy_static;
use std::env;
use std::io::ErrorKind;

lazy_static! {
    pub(crate) static ref VERBOSE: i32 = env::var("PTL_VERBOSE")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);
}

#[derive(Debug)]
pub(crate) enum Event {
    PoolInitialized { size: usize },
    PoolDestroyed { master: usize },
    WorkerStarted { index: usize },
    WorkerExited { index: usize },
    StopRequested { pool_size: usize },
    StopAcknowledged { index: usize },
    SpawnFailed { index: usize, kind: ErrorKind },
    AffinityFailed { index: usize, cpu: usize },
    InitHandlerPanicked { index: usize },
    TaskPanicked { index: usize },
    ForeignConstruction { index: usize },
}

macro_rules! log {
    ($level:expr, $event:expr) => {
        if *crate::log::VERBOSE >= $level {
            eprintln!("[ptl] {:?}", $event);
        }
    };
}
