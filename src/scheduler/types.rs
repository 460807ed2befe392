//! Scheduler type definitions.
//!
//! This module contains error types, state enums, and command types for the scheduler.

use thiserror::Error;
use tokio::sync::oneshot;

use crate::core::job::ValidationError;
use crate::storage::StorageError;

/// Errors returned by the job service and the scheduler handle.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The definition was rejected.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Unknown job name or execution id.
    #[error("not found: {0}")]
    NotFound(String),

    /// A concurrent writer won; re-read and retry.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),
}

impl From<StorageError> for SchedulerError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::NotFound(what) => SchedulerError::NotFound(what),
            StorageError::Conflict(what) | StorageError::DuplicateKey(what) => {
                SchedulerError::Conflict(what)
            }
            other => SchedulerError::Storage(other),
        }
    }
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Scheduler is stopped.
    Stopped,
    /// Scheduler is running.
    Running,
    /// Scheduler is paused.
    Paused,
}

/// Commands that can be sent to the scheduler.
pub(crate) enum SchedulerCommand {
    /// Stop firing schedules and dispatching.
    Pause { response: oneshot::Sender<()> },
    /// Resume after a pause.
    Resume { response: oneshot::Sender<()> },
    /// Run the recovery sweep now; responds with the number of executions
    /// reclaimed.
    Sweep {
        response: oneshot::Sender<Result<usize, SchedulerError>>,
    },
    /// Shutdown the scheduler.
    Shutdown { response: oneshot::Sender<()> },
}
