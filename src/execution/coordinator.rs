//! Retry coordination.
//!
//! The coordinator turns the outcome of one dispatch attempt into the next
//! persisted state of the execution:
//!
//! - success: Running → Succeeded
//! - retriable failure with budget left: Running → Pending, delayed by the
//!   backoff policy
//! - retriable failure without budget: Running → Exhausted
//! - invalid request: Running → Failed
//!
//! Every transition is guarded by the version the worker claimed. If the
//! recovery sweep requeued the execution in the meantime, the late outcome
//! loses the compare-and-swap and is dropped.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::dispatch::DispatchError;
use crate::core::retry::{RetryDecision, RetryPolicy};
use crate::core::types::{ExecutionId, JobName};
use crate::events::{Event, EventBus};
use crate::storage::{ExecutionState, Storage, StorageError, StoredExecution, Transition};

/// An execution ran out of attempts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("execution {execution_id} of job '{job_name}' exhausted after {attempts} attempt(s): {last_error}")]
pub struct ExhaustionError {
    pub execution_id: ExecutionId,
    pub job_name: JobName,
    pub attempts: u32,
    pub last_error: String,
}

/// What happened to an execution after an outcome was recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Terminal success.
    Succeeded(StoredExecution),
    /// Requeued as Pending with a later `ready_at`.
    Retrying(StoredExecution),
    /// Terminal, retry budget spent.
    Exhausted(StoredExecution),
    /// Terminal, the request can never be sent.
    Failed(StoredExecution),
    /// Another writer moved the execution first; nothing was recorded.
    Stale,
}

impl AttemptOutcome {
    /// The updated execution, unless the outcome was dropped.
    pub fn execution(&self) -> Option<&StoredExecution> {
        match self {
            AttemptOutcome::Succeeded(e)
            | AttemptOutcome::Retrying(e)
            | AttemptOutcome::Exhausted(e)
            | AttemptOutcome::Failed(e) => Some(e),
            AttemptOutcome::Stale => None,
        }
    }
}

/// Persists attempt outcomes and schedules retries.
pub struct RetryCoordinator {
    storage: Arc<dyn Storage>,
    policy: RetryPolicy,
    event_bus: Option<Arc<EventBus>>,
}

impl RetryCoordinator {
    /// Create a coordinator with the given backoff policy.
    pub fn new(storage: Arc<dyn Storage>, policy: RetryPolicy) -> Self {
        Self {
            storage,
            policy,
            event_bus: None,
        }
    }

    /// Publish outcomes on an event bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// The backoff policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a 2xx response for a Running execution.
    pub async fn record_success(
        &self,
        execution: &StoredExecution,
        status: u16,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome, StorageError> {
        let transition = self
            .guarded(execution, ExecutionState::Succeeded, now)
            .clear_error()
            .finished_at(now);

        let Some(updated) = self.apply(execution, transition).await? else {
            return Ok(AttemptOutcome::Stale);
        };
        self.emit(Event::execution_succeeded(&updated, status, duration))
            .await;
        self.release(&updated).await;
        Ok(AttemptOutcome::Succeeded(updated))
    }

    /// Record a failed attempt for a Running execution.
    pub async fn record_failure(
        &self,
        execution: &StoredExecution,
        error: &DispatchError,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome, StorageError> {
        let message = error.to_string();

        if !error.is_retriable() {
            let transition = self
                .guarded(execution, ExecutionState::Failed, now)
                .last_error(message.clone())
                .finished_at(now);
            let Some(updated) = self.apply(execution, transition).await? else {
                return Ok(AttemptOutcome::Stale);
            };
            self.emit(Event::execution_failed(&updated, message)).await;
            self.release(&updated).await;
            return Ok(AttemptOutcome::Failed(updated));
        }

        let attempts = execution.attempt_count + 1;
        match self.policy.decide(attempts, execution.max_retries, now) {
            RetryDecision::Retry { ready_at } => {
                let transition = self
                    .guarded(execution, ExecutionState::Pending, now)
                    .ready_at(ready_at)
                    .last_error(message.clone());
                let Some(updated) = self.apply(execution, transition).await? else {
                    return Ok(AttemptOutcome::Stale);
                };
                self.emit(Event::execution_retry_scheduled(&updated, message))
                    .await;
                Ok(AttemptOutcome::Retrying(updated))
            }
            RetryDecision::Exhaust => {
                let transition = self
                    .guarded(execution, ExecutionState::Exhausted, now)
                    .last_error(message.clone())
                    .finished_at(now);
                let Some(updated) = self.apply(execution, transition).await? else {
                    return Ok(AttemptOutcome::Stale);
                };
                self.emit(Event::execution_exhausted(ExhaustionError {
                    execution_id: updated.id,
                    job_name: updated.job_name.clone(),
                    attempts: updated.attempt_count,
                    last_error: message,
                }))
                .await;
                self.release(&updated).await;
                Ok(AttemptOutcome::Exhausted(updated))
            }
        }
    }

    /// Running → `to`, counting one attempt, guarded by the claimed version.
    fn guarded(
        &self,
        execution: &StoredExecution,
        to: ExecutionState,
        now: DateTime<Utc>,
    ) -> Transition {
        Transition::new(execution.id, ExecutionState::Running, to, now)
            .expect_version(execution.version)
            .attempt_count(execution.attempt_count + 1)
    }

    async fn apply(
        &self,
        execution: &StoredExecution,
        transition: Transition,
    ) -> Result<Option<StoredExecution>, StorageError> {
        let to = transition.to;
        match self.storage.transition(transition).await {
            Ok(updated) => Ok(Some(updated)),
            Err(StorageError::Conflict(reason)) | Err(StorageError::NotFound(reason)) => {
                tracing::warn!(
                    execution_id = %execution.id,
                    job_name = %execution.job_name,
                    target = %to,
                    %reason,
                    "Dropping stale outcome"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop a consumed one-shot definition. Recurring jobs are never released.
    async fn release(&self, execution: &StoredExecution) {
        match self.storage.release_job(&execution.job_name).await {
            Ok(true) => {
                tracing::debug!(job_name = %execution.job_name, "Released one-shot job");
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    job_name = %execution.job_name,
                    error = %e,
                    "Failed to release one-shot job"
                );
            }
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(bus) = &self.event_bus {
            bus.emit(event).await;
        }
    }
}
