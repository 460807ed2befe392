//! Job service: the interface callers use to submit, trigger, cancel and
//! inspect jobs.
//!
//! The service is stateless apart from the store handle. Several services
//! (one per process) can share one store; all coordination goes through the
//! store's conditional writes.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::types::SchedulerError;
use crate::core::job::{JobDefinition, JobType, ValidationError};
use crate::core::types::{ExecutionId, JobName};
use crate::events::{Event, EventBus};
use crate::queue::QueueSet;
use crate::storage::{
    ExecutionFilter, ExecutionState, Storage, StorageError, StoredExecution, StoredJob, Transition,
};

/// Times a write is retried after losing a race before giving up.
const MAX_WRITE_ATTEMPTS: usize = 5;

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub job_name: JobName,
    pub accepted: bool,
    /// Set for one-shot jobs, whose execution is created at submission.
    pub execution_id: Option<ExecutionId>,
}

/// Submission, cancellation and inspection of jobs.
pub struct JobService {
    storage: Arc<dyn Storage>,
    queues: QueueSet,
    event_bus: Option<Arc<EventBus>>,
}

impl JobService {
    /// Create a service over the given store and queue set.
    pub fn new(storage: Arc<dyn Storage>, queues: QueueSet) -> Self {
        Self {
            storage,
            queues,
            event_bus: None,
        }
    }

    /// Publish created and cancelled executions on an event bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// The configured queues.
    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    /// Validate and store a job definition.
    pub async fn submit(&self, definition: JobDefinition) -> Result<SubmitReceipt, SchedulerError> {
        self.submit_at(definition, Utc::now()).await
    }

    /// [`submit`](Self::submit) with an explicit submission time.
    pub async fn submit_at(
        &self,
        definition: JobDefinition,
        now: DateTime<Utc>,
    ) -> Result<SubmitReceipt, SchedulerError> {
        definition.validate(self.queues.names())?;
        match definition.job_type {
            JobType::Recurring => self.submit_recurring(definition, now).await,
            JobType::FireAndForget | JobType::Delayed => self.submit_one_shot(definition, now).await,
        }
    }

    /// Insert or replace a recurring definition.
    ///
    /// An unchanged expression and timezone keep the pending `next_fire_at`;
    /// otherwise the next fire time is computed from `now`. Fire times that
    /// already passed are never fired again.
    async fn submit_recurring(
        &self,
        definition: JobDefinition,
        now: DateTime<Utc>,
    ) -> Result<SubmitReceipt, SchedulerError> {
        let schedule = definition.schedule()?.ok_or_else(|| ValidationError::MissingField {
            job: definition.name.to_string(),
            job_type: definition.job_type,
            field: "cron_expression",
        })?;
        let recomputed = schedule
            .next_after(now)
            .map_err(|source| ValidationError::InvalidSchedule {
                job: definition.name.to_string(),
                source,
            })?;

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let result = match self.storage.get_job(&definition.name).await {
                Ok(existing) => {
                    if existing.job_type() != JobType::Recurring {
                        return Err(ValidationError::TypeChanged {
                            job: definition.name.to_string(),
                            existing: existing.job_type(),
                        }
                        .into());
                    }
                    let unchanged = existing.definition.cron_expression
                        == definition.cron_expression
                        && existing.definition.timezone_or_default()
                            == definition.timezone_or_default();
                    let next_fire_at = match existing.next_fire_at {
                        Some(pending) if unchanged => pending,
                        _ => recomputed,
                    };

                    let mut job = StoredJob::new(definition.clone(), existing.created_at)
                        .with_next_fire_at(next_fire_at);
                    job.last_fired_at = existing.last_fired_at;
                    job.updated_at = now;
                    self.storage.put_job(job, Some(existing.version)).await
                }
                Err(StorageError::NotFound(_)) => {
                    let job = StoredJob::new(definition.clone(), now).with_next_fire_at(recomputed);
                    self.storage.put_job(job, None).await
                }
                Err(e) => return Err(e.into()),
            };

            match result {
                Ok(stored) => {
                    tracing::info!(
                        job_name = %stored.name(),
                        next_fire_at = ?stored.next_fire_at,
                        version = stored.version,
                        "Recurring job stored"
                    );
                    return Ok(SubmitReceipt {
                        job_name: stored.definition.name,
                        accepted: true,
                        execution_id: None,
                    });
                }
                Err(StorageError::Conflict(_))
                | Err(StorageError::DuplicateKey(_))
                | Err(StorageError::NotFound(_)) => {
                    tracing::debug!(job_name = %definition.name, "Job changed concurrently, retrying submit");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(SchedulerError::Conflict(format!(
            "job '{}' kept changing during submit",
            definition.name
        )))
    }

    /// Store a one-shot definition with its execution.
    async fn submit_one_shot(
        &self,
        definition: JobDefinition,
        now: DateTime<Utc>,
    ) -> Result<SubmitReceipt, SchedulerError> {
        let (state, ready_at) = match definition.delay_seconds {
            Some(delay) if definition.job_type == JobType::Delayed => {
                (ExecutionState::Pending, delayed_until(&definition, delay, now)?)
            }
            _ => (ExecutionState::Enqueued, now),
        };

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let execution = StoredExecution::new(&definition, state, ready_at, now);
            let job = StoredJob::new(definition.clone(), now);

            match self.storage.enqueue_one_shot(job, execution.clone()).await {
                Ok(_) => {
                    tracing::info!(
                        job_name = %definition.name,
                        execution_id = %execution.id,
                        %ready_at,
                        "One-shot job accepted"
                    );
                    self.emit(Event::execution_created(&execution)).await;
                    return Ok(SubmitReceipt {
                        job_name: definition.name,
                        accepted: true,
                        execution_id: Some(execution.id),
                    });
                }
                Err(StorageError::DuplicateKey(_)) => {
                    let existing = match self.storage.get_job(&definition.name).await {
                        Ok(existing) => existing,
                        Err(StorageError::NotFound(_)) => continue,
                        Err(e) => return Err(e.into()),
                    };
                    if existing.job_type() == JobType::Recurring {
                        return Err(ValidationError::TypeChanged {
                            job: definition.name.to_string(),
                            existing: existing.job_type(),
                        }
                        .into());
                    }
                    // A finished one-shot that was never released does not
                    // block resubmission.
                    if !self.storage.release_job(&definition.name).await? {
                        return Err(SchedulerError::Conflict(format!(
                            "job '{}' still has a live execution",
                            definition.name
                        )));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(SchedulerError::Conflict(format!(
            "job '{}' kept changing during submit",
            definition.name
        )))
    }

    /// Delete a recurring definition and cancel its not-yet-running
    /// executions. Returns whether the job existed.
    pub async fn cancel_recurring(&self, name: impl Into<JobName>) -> Result<bool, SchedulerError> {
        let name = name.into();
        match self.storage.get_job(&name).await {
            Ok(job) if job.job_type() == JobType::Recurring => {}
            Ok(_) | Err(StorageError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let cancelled = match self.storage.delete_job(&name, Utc::now()).await {
            Ok(cancelled) => cancelled,
            Err(StorageError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(job_name = %name, cancelled = cancelled.len(), "Recurring job cancelled");
        for id in cancelled {
            self.emit(Event::execution_cancelled(id, name.clone())).await;
        }
        Ok(true)
    }

    /// Create an immediately dispatchable execution of a recurring job,
    /// independent of its schedule.
    pub async fn trigger_now(&self, name: impl Into<JobName>) -> Result<ExecutionId, SchedulerError> {
        let name = name.into();
        let job = self.storage.get_job(&name).await?;
        if job.job_type() != JobType::Recurring {
            return Err(SchedulerError::NotFound(format!(
                "no recurring job named '{}'",
                name
            )));
        }

        let now = Utc::now();
        let execution = StoredExecution::new(&job.definition, ExecutionState::Enqueued, now, now);
        self.storage.create_execution(execution.clone()).await?;

        tracing::info!(job_name = %name, execution_id = %execution.id, "Manual trigger");
        self.emit(Event::execution_created(&execution)).await;
        Ok(execution.id)
    }

    /// Executions matching a filter, newest first.
    pub async fn inspect(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<StoredExecution>, SchedulerError> {
        Ok(self.storage.query_executions(filter).await?)
    }

    /// Get one execution.
    pub async fn get_execution(&self, id: &ExecutionId) -> Result<StoredExecution, SchedulerError> {
        Ok(self.storage.get_execution(id).await?)
    }

    /// Cancel a Pending or Enqueued execution.
    ///
    /// Returns `false` if the execution is already terminal and `Conflict`
    /// if it is Running.
    pub async fn cancel_execution(&self, id: &ExecutionId) -> Result<bool, SchedulerError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let execution = self.storage.get_execution(id).await?;
            if execution.state.is_terminal() {
                return Ok(false);
            }
            if execution.state == ExecutionState::Running {
                return Err(SchedulerError::Conflict(format!(
                    "execution {} is running",
                    id
                )));
            }

            let now = Utc::now();
            let transition =
                Transition::new(execution.id, execution.state, ExecutionState::Cancelled, now)
                    .expect_version(execution.version)
                    .finished_at(now);
            match self.storage.transition(transition).await {
                Ok(cancelled) => {
                    tracing::info!(execution_id = %id, job_name = %cancelled.job_name, "Execution cancelled");
                    self.emit(Event::execution_cancelled(cancelled.id, cancelled.job_name.clone()))
                        .await;
                    if let Err(e) = self.storage.release_job(&cancelled.job_name).await {
                        tracing::warn!(job_name = %cancelled.job_name, error = %e, "Failed to release one-shot job");
                    }
                    return Ok(true);
                }
                Err(StorageError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(SchedulerError::Conflict(format!(
            "execution {} kept changing during cancel",
            id
        )))
    }

    /// Get a stored job.
    pub async fn get_job(&self, name: impl Into<JobName>) -> Result<StoredJob, SchedulerError> {
        Ok(self.storage.get_job(&name.into()).await?)
    }

    /// List stored jobs.
    pub async fn list_jobs(&self) -> Result<Vec<StoredJob>, SchedulerError> {
        Ok(self.storage.list_jobs().await?)
    }

    async fn emit(&self, event: Event) {
        if let Some(bus) = &self.event_bus {
            bus.emit(event).await;
        }
    }
}

fn delayed_until(
    definition: &JobDefinition,
    delay_seconds: u64,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, ValidationError> {
    i64::try_from(delay_seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|delay| now.checked_add_signed(delay))
        .ok_or_else(|| ValidationError::DelayTooLong {
            job: definition.name.to_string(),
            delay_seconds,
            max: crate::core::job::MAX_DELAY_SECONDS,
        })
}
