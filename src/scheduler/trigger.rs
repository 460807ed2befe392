//! Cron trigger.
//!
//! Evaluates recurring schedules and creates one execution per firing. The
//! stored `next_fire_at` is only advanced through a conditional update, so
//! any number of triggers (in any number of processes) can evaluate the same
//! job: exactly one wins each firing and the rest observe a conflict.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::core::types::ExecutionId;
use crate::events::{Event, EventBus};
use crate::storage::{ExecutionState, Firing, Storage, StorageError, StoredExecution, StoredJob};

/// Upper bound on missed occurrences counted for one firing.
const MISSED_COUNT_CAP: usize = 10_000;

/// Fires due recurring jobs.
pub struct CronTrigger {
    storage: Arc<dyn Storage>,
    event_bus: Option<Arc<EventBus>>,
}

impl CronTrigger {
    /// Create a trigger over the given store.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            event_bus: None,
        }
    }

    /// Publish firings on an event bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Fire every recurring job whose `next_fire_at` is at or before `now`.
    ///
    /// Returns the executions this trigger created. Firings lost to another
    /// trigger are skipped; a failure on one job does not stop the others.
    pub async fn evaluate(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionId>, StorageError> {
        let due = self.storage.due_recurring_jobs(now).await?;
        let mut fired = Vec::with_capacity(due.len());

        for job in due {
            match self.fire(&job, now).await {
                Ok(Some(id)) => fired.push(id),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(job_name = %job.name(), error = %e, "Failed to fire recurring job");
                }
            }
        }
        Ok(fired)
    }

    async fn fire(
        &self,
        job: &StoredJob,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionId>, StorageError> {
        let Some(due_at) = job.next_fire_at else {
            return Ok(None);
        };
        let schedule = match job.definition.schedule() {
            Ok(Some(schedule)) => schedule,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::error!(job_name = %job.name(), error = %e, "Stored schedule is invalid");
                return Ok(None);
            }
        };
        let next_fire_at = match schedule.next_after(now) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(job_name = %job.name(), error = %e, "No next fire time");
                return Ok(None);
            }
        };

        // Occurrences in (due_at, now] that collapse into this firing.
        let missed = schedule
            .occurrences_between(due_at, now, MISSED_COUNT_CAP)
            .saturating_sub(1);

        let execution = StoredExecution::new(&job.definition, ExecutionState::Pending, now, now)
            .with_scheduled_for(due_at);
        let firing = Firing {
            job_name: job.name().clone(),
            expected_next_fire_at: due_at,
            next_fire_at,
            fired_at: now,
            execution: execution.clone(),
        };

        match self.storage.fire_recurring(firing).await {
            Ok(_) => {}
            Err(StorageError::Conflict(_)) | Err(StorageError::NotFound(_)) => {
                tracing::debug!(
                    job_name = %job.name(),
                    scheduled_for = %due_at,
                    "Firing already taken"
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        if missed > 0 {
            tracing::warn!(
                job_name = %job.name(),
                missed,
                scheduled_for = %due_at,
                "Missed occurrences collapsed into one firing"
            );
        }
        tracing::info!(
            job_name = %job.name(),
            execution_id = %execution.id,
            scheduled_for = %due_at,
            %next_fire_at,
            "Recurring job fired"
        );
        if let Some(bus) = &self.event_bus {
            bus.emit(Event::recurring_fired(
                &execution,
                due_at,
                next_fire_at,
                missed,
            ))
            .await;
        }
        Ok(Some(execution.id))
    }
}
