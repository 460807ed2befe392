//! Lifecycle events and event handling.
//!
//! Every state change the engine makes to an execution is also published on
//! the [`EventBus`], so callers can observe dispatches, retries and
//! exhaustion without polling the store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::core::types::{ExecutionId, JobName, QueueName};
use crate::execution::ExhaustionError;
use crate::storage::StoredExecution;

/// Lifecycle events emitted by the engine.
#[derive(Debug, Clone)]
pub enum Event {
    /// An execution was stored (submission or manual trigger).
    ExecutionCreated {
        execution_id: ExecutionId,
        job_name: JobName,
        queue: QueueName,
        ready_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// A recurring job fired and its execution was stored.
    RecurringFired {
        execution_id: ExecutionId,
        job_name: JobName,
        scheduled_for: DateTime<Utc>,
        next_fire_at: DateTime<Utc>,
        /// Occurrences that were due but collapsed into this firing.
        missed: usize,
        timestamp: DateTime<Utc>,
    },

    /// A worker claimed an execution and is dispatching it.
    ExecutionStarted {
        execution_id: ExecutionId,
        job_name: JobName,
        /// The attempt being made (1-indexed).
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// The target answered with a 2xx status.
    ExecutionSucceeded {
        execution_id: ExecutionId,
        job_name: JobName,
        attempts: u32,
        status: u16,
        duration: Duration,
        timestamp: DateTime<Utc>,
    },

    /// An attempt failed and another one is scheduled.
    ///
    /// `attempt` is the attempt that just failed. The execution will be
    /// dispatched again at `ready_at`.
    ExecutionRetryScheduled {
        execution_id: ExecutionId,
        job_name: JobName,
        attempt: u32,
        max_retries: u32,
        ready_at: DateTime<Utc>,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// The retry budget ran out.
    ExecutionExhausted {
        error: ExhaustionError,
        timestamp: DateTime<Utc>,
    },

    /// The stored request can never be sent.
    ExecutionFailed {
        execution_id: ExecutionId,
        job_name: JobName,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// The recovery sweep reclaimed an abandoned Running execution.
    ExecutionRecovered {
        execution_id: ExecutionId,
        job_name: JobName,
        started_at: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    },

    /// An execution was cancelled before dispatch.
    ExecutionCancelled {
        execution_id: ExecutionId,
        job_name: JobName,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::ExecutionCreated { timestamp, .. }
            | Event::RecurringFired { timestamp, .. }
            | Event::ExecutionStarted { timestamp, .. }
            | Event::ExecutionSucceeded { timestamp, .. }
            | Event::ExecutionRetryScheduled { timestamp, .. }
            | Event::ExecutionExhausted { timestamp, .. }
            | Event::ExecutionFailed { timestamp, .. }
            | Event::ExecutionRecovered { timestamp, .. }
            | Event::ExecutionCancelled { timestamp, .. } => *timestamp,
        }
    }

    /// The execution the event is about.
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            Event::ExecutionCreated { execution_id, .. }
            | Event::RecurringFired { execution_id, .. }
            | Event::ExecutionStarted { execution_id, .. }
            | Event::ExecutionSucceeded { execution_id, .. }
            | Event::ExecutionRetryScheduled { execution_id, .. }
            | Event::ExecutionFailed { execution_id, .. }
            | Event::ExecutionRecovered { execution_id, .. }
            | Event::ExecutionCancelled { execution_id, .. } => *execution_id,
            Event::ExecutionExhausted { error, .. } => error.execution_id,
        }
    }

    /// The job the event is about.
    pub fn job_name(&self) -> &JobName {
        match self {
            Event::ExecutionCreated { job_name, .. }
            | Event::RecurringFired { job_name, .. }
            | Event::ExecutionStarted { job_name, .. }
            | Event::ExecutionSucceeded { job_name, .. }
            | Event::ExecutionRetryScheduled { job_name, .. }
            | Event::ExecutionFailed { job_name, .. }
            | Event::ExecutionRecovered { job_name, .. }
            | Event::ExecutionCancelled { job_name, .. } => job_name,
            Event::ExecutionExhausted { error, .. } => &error.job_name,
        }
    }

    /// Whether the event marks a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::ExecutionSucceeded { .. }
                | Event::ExecutionExhausted { .. }
                | Event::ExecutionFailed { .. }
                | Event::ExecutionCancelled { .. }
        )
    }

    /// Create an ExecutionCreated event.
    pub fn execution_created(execution: &StoredExecution) -> Self {
        Event::ExecutionCreated {
            execution_id: execution.id,
            job_name: execution.job_name.clone(),
            queue: execution.queue.clone(),
            ready_at: execution.ready_at,
            timestamp: Utc::now(),
        }
    }

    /// Create a RecurringFired event.
    pub fn recurring_fired(
        execution: &StoredExecution,
        scheduled_for: DateTime<Utc>,
        next_fire_at: DateTime<Utc>,
        missed: usize,
    ) -> Self {
        Event::RecurringFired {
            execution_id: execution.id,
            job_name: execution.job_name.clone(),
            scheduled_for,
            next_fire_at,
            missed,
            timestamp: Utc::now(),
        }
    }

    /// Create an ExecutionStarted event for a claimed execution.
    pub fn execution_started(execution: &StoredExecution) -> Self {
        Event::ExecutionStarted {
            execution_id: execution.id,
            job_name: execution.job_name.clone(),
            attempt: execution.attempt_count + 1,
            timestamp: Utc::now(),
        }
    }

    /// Create an ExecutionSucceeded event.
    pub fn execution_succeeded(
        execution: &StoredExecution,
        status: u16,
        duration: Duration,
    ) -> Self {
        Event::ExecutionSucceeded {
            execution_id: execution.id,
            job_name: execution.job_name.clone(),
            attempts: execution.attempt_count,
            status,
            duration,
            timestamp: Utc::now(),
        }
    }

    /// Create an ExecutionRetryScheduled event from the requeued execution.
    pub fn execution_retry_scheduled(execution: &StoredExecution, error: impl Into<String>) -> Self {
        Event::ExecutionRetryScheduled {
            execution_id: execution.id,
            job_name: execution.job_name.clone(),
            attempt: execution.attempt_count,
            max_retries: execution.max_retries,
            ready_at: execution.ready_at,
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create an ExecutionExhausted event.
    pub fn execution_exhausted(error: ExhaustionError) -> Self {
        Event::ExecutionExhausted {
            error,
            timestamp: Utc::now(),
        }
    }

    /// Create an ExecutionFailed event.
    pub fn execution_failed(execution: &StoredExecution, error: impl Into<String>) -> Self {
        Event::ExecutionFailed {
            execution_id: execution.id,
            job_name: execution.job_name.clone(),
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create an ExecutionRecovered event from the abandoned execution.
    pub fn execution_recovered(execution: &StoredExecution) -> Self {
        Event::ExecutionRecovered {
            execution_id: execution.id,
            job_name: execution.job_name.clone(),
            started_at: execution.started_at,
            timestamp: Utc::now(),
        }
    }

    /// Create an ExecutionCancelled event.
    pub fn execution_cancelled(execution_id: ExecutionId, job_name: JobName) -> Self {
        Event::ExecutionCancelled {
            execution_id,
            job_name,
            timestamp: Utc::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler that writes every event to the `tracing` log.
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::ExecutionCreated {
                execution_id,
                job_name,
                queue,
                ready_at,
                ..
            } => {
                tracing::info!(%execution_id, %job_name, %queue, %ready_at, "Execution created");
            }
            Event::RecurringFired {
                execution_id,
                job_name,
                scheduled_for,
                next_fire_at,
                ..
            } => {
                tracing::info!(
                    %execution_id,
                    %job_name,
                    %scheduled_for,
                    %next_fire_at,
                    "Recurring job fired"
                );
            }
            Event::ExecutionStarted {
                execution_id,
                job_name,
                attempt,
                ..
            } => {
                tracing::debug!(%execution_id, %job_name, attempt, "Dispatching");
            }
            Event::ExecutionSucceeded {
                execution_id,
                job_name,
                attempts,
                status,
                duration,
                ..
            } => {
                tracing::info!(
                    %execution_id,
                    %job_name,
                    attempts,
                    status,
                    duration_ms = duration.as_millis() as u64,
                    "Execution succeeded"
                );
            }
            Event::ExecutionRetryScheduled {
                execution_id,
                job_name,
                attempt,
                max_retries,
                ready_at,
                error,
                ..
            } => {
                tracing::warn!(
                    %execution_id,
                    %job_name,
                    attempt,
                    max_retries,
                    %ready_at,
                    %error,
                    "Attempt failed, retry scheduled"
                );
            }
            Event::ExecutionExhausted { error, .. } => {
                tracing::error!(
                    execution_id = %error.execution_id,
                    job_name = %error.job_name,
                    attempts = error.attempts,
                    last_error = %error.last_error,
                    "Execution exhausted"
                );
            }
            Event::ExecutionFailed {
                execution_id,
                job_name,
                error,
                ..
            } => {
                tracing::error!(%execution_id, %job_name, %error, "Execution failed permanently");
            }
            Event::ExecutionRecovered {
                execution_id,
                job_name,
                ..
            } => {
                tracing::warn!(%execution_id, %job_name, "Recovered abandoned execution");
            }
            Event::ExecutionCancelled {
                execution_id,
                job_name,
                ..
            } => {
                tracing::info!(%execution_id, %job_name, "Execution cancelled");
            }
        }
    }
}
