//! Recovery of abandoned executions.
//!
//! An execution is persisted as Running before its request is sent. If the
//! worker dies mid-dispatch, nothing ever records the outcome. The sweep
//! finds Running executions older than the dispatch timeout plus a grace
//! period and sends each through the normal failure path, counting the lost
//! attempt. The failure transition is guarded by the version, so concurrent
//! sweeps reclaim each execution exactly once.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::core::types::ExecutionId;
use crate::events::{Event, EventBus};
use crate::execution::{AttemptOutcome, DispatchError, RetryCoordinator};
use crate::storage::{Storage, StorageError};

/// Requeues executions abandoned in Running.
pub struct RecoverySweep {
    storage: Arc<dyn Storage>,
    coordinator: Arc<RetryCoordinator>,
    abandon_after: Duration,
    event_bus: Option<Arc<EventBus>>,
}

impl RecoverySweep {
    /// Create a sweep that treats a Running execution as abandoned once its
    /// attempt is older than `abandon_after`.
    pub fn new(
        storage: Arc<dyn Storage>,
        coordinator: Arc<RetryCoordinator>,
        abandon_after: Duration,
    ) -> Self {
        Self {
            storage,
            coordinator,
            abandon_after,
            event_bus: None,
        }
    }

    /// Publish recoveries on an event bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Reclaim every abandoned execution. Returns the ids this sweep
    /// reclaimed.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionId>, StorageError> {
        let abandon_after = chrono::Duration::from_std(self.abandon_after)
            .map_err(|e| StorageError::Other(format!("abandon threshold out of range: {}", e)))?;
        let cutoff = now - abandon_after;
        let stale = self.storage.stale_running(cutoff).await?;
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        tracing::info!(count = stale.len(), "Found abandoned executions");
        let error = DispatchError::Abandoned(self.abandon_after);
        let mut reclaimed = Vec::with_capacity(stale.len());

        for execution in stale {
            match self.coordinator.record_failure(&execution, &error, now).await {
                Ok(AttemptOutcome::Stale) => {
                    tracing::debug!(execution_id = %execution.id, "Already reclaimed");
                }
                Ok(_) => {
                    if let Some(bus) = &self.event_bus {
                        bus.emit(Event::execution_recovered(&execution)).await;
                    }
                    reclaimed.push(execution.id);
                }
                Err(e) => {
                    tracing::warn!(
                        execution_id = %execution.id,
                        error = %e,
                        "Failed to reclaim abandoned execution"
                    );
                }
            }
        }
        Ok(reclaimed)
    }
}
