//! Execution of stored jobs.
//!
//! This module provides HTTP dispatch, the retry coordinator that persists
//! attempt outcomes, and the worker pool that ties both to the priority
//! queue.

mod coordinator;
mod dispatch;
mod worker;

pub use coordinator::{AttemptOutcome, ExhaustionError, RetryCoordinator};
pub use dispatch::{DEFAULT_DISPATCH_TIMEOUT, DispatchError, Dispatcher, HttpDispatcher};
pub use worker::{WorkerConfig, WorkerPool, WorkerPoolHandle};
