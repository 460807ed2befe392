//! Scheduler handle for controlling the scheduler.
//!
//! This module provides the `SchedulerHandle` type that allows external control
//! of a running engine (pause, resume, sweep, shutdown) and access to the
//! [`JobService`] bound to the same store.

use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};

use super::service::JobService;
use super::types::{SchedulerCommand, SchedulerError, SchedulerState};

/// Buffer size for the command channel between SchedulerHandle and Scheduler.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Handle for controlling the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) command_tx: mpsc::Sender<SchedulerCommand>,
    pub(crate) state: Arc<RwLock<SchedulerState>>,
    pub(crate) service: Arc<JobService>,
}

impl SchedulerHandle {
    /// Helper to send a command that returns a result and wait for response.
    async fn send_result_command<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<Result<T, SchedulerError>>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<T, SchedulerError>
    where
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })?
    }

    /// Helper to send a command that returns unit and wait for response.
    async fn send_unit_command(
        &self,
        build_command: impl FnOnce(oneshot::Sender<()>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<(), SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })?;

        Ok(())
    }

    /// The job service of this engine.
    pub fn service(&self) -> &JobService {
        &self.service
    }

    /// Pause the scheduler.
    ///
    /// While paused, no schedule fires and no execution is dispatched.
    /// Occurrences that come due during the pause collapse into one firing
    /// on resume.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(|response| SchedulerCommand::Pause { response }, "pause")
            .await
    }

    /// Resume the scheduler after being paused.
    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(|response| SchedulerCommand::Resume { response }, "resume")
            .await
    }

    /// Run a recovery sweep immediately. Returns the number of abandoned
    /// executions reclaimed.
    pub async fn sweep(&self) -> Result<usize, SchedulerError> {
        self.send_result_command(|response| SchedulerCommand::Sweep { response }, "sweep")
            .await
    }

    /// Shutdown the scheduler.
    ///
    /// Waits for in-flight dispatches up to the configured shutdown timeout.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(
            |response| SchedulerCommand::Shutdown { response },
            "shutdown",
        )
        .await
    }

    /// Get the current scheduler state.
    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    /// Check if the scheduler is running.
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == SchedulerState::Running
    }

    /// Check if the scheduler is paused.
    pub async fn is_paused(&self) -> bool {
        *self.state.read().await == SchedulerState::Paused
    }
}
