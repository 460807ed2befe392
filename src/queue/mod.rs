//! Priority queue over the job store.
//!
//! The queue holds no state of its own. It is a view over dispatchable
//! executions with `ready_at <= now`, ordered by queue priority, then
//! `ready_at`, then creation order. Dequeueing claims an execution by moving
//! it to Running through the store's compare-and-swap, so any number of
//! workers (in any number of processes) can dequeue concurrently.
//!
//! Priority is strict: a lower queue is only consulted when every higher
//! queue has nothing ready.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::core::types::QueueName;
use crate::storage::{ExecutionState, Storage, StorageError, StoredExecution, Transition};

/// Default queue names, highest priority first.
pub const DEFAULT_QUEUES: [&str; 4] = ["critical", "normal", "low", "default"];

/// Default number of candidates read per queue and dequeue attempt.
pub const DEFAULT_BATCH_SIZE: usize = 16;

/// Ordered set of queue names, highest priority first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSet {
    queues: Vec<QueueName>,
}

impl QueueSet {
    /// Create a queue set from names in priority order.
    pub fn new<I, Q>(names: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<QueueName>,
    {
        Self {
            queues: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Queue names in priority order.
    pub fn names(&self) -> &[QueueName] {
        &self.queues
    }

    /// Whether a queue is configured.
    pub fn contains(&self, queue: &QueueName) -> bool {
        self.queues.contains(queue)
    }

    /// Rank of a queue, 0 being the highest priority.
    pub fn priority_of(&self, queue: &QueueName) -> Option<usize> {
        self.queues.iter().position(|q| q == queue)
    }
}

impl Default for QueueSet {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUES)
    }
}

/// Strict-priority dequeue over the store.
pub struct PriorityQueue {
    storage: Arc<dyn Storage>,
    queues: QueueSet,
    batch_size: usize,
}

impl PriorityQueue {
    /// Create a queue view over the given store.
    pub fn new(storage: Arc<dyn Storage>, queues: QueueSet) -> Self {
        Self {
            storage,
            queues,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Set how many candidates are read per queue.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// The configured queues.
    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    /// Claim the next ready execution, if any.
    ///
    /// The returned execution is already Running in the store, with
    /// `started_at = now`.
    pub async fn dequeue(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<StoredExecution>, StorageError> {
        for queue in self.queues.names() {
            let candidates = self
                .storage
                .ready_executions(queue, now, self.batch_size)
                .await?;

            for candidate in candidates {
                if let Some(claimed) = self.try_claim(&candidate, now).await? {
                    return Ok(Some(claimed));
                }
            }
        }
        Ok(None)
    }

    async fn try_claim(
        &self,
        candidate: &StoredExecution,
        now: DateTime<Utc>,
    ) -> Result<Option<StoredExecution>, StorageError> {
        let claim = Transition::new(candidate.id, candidate.state, ExecutionState::Running, now)
            .expect_version(candidate.version)
            .started_at(now);

        match self.storage.transition(claim).await {
            Ok(claimed) => Ok(Some(claimed)),
            Err(StorageError::Conflict(_)) | Err(StorageError::NotFound(_)) => {
                tracing::debug!(
                    execution_id = %candidate.id,
                    queue = %candidate.queue,
                    "Lost claim race, trying next candidate"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
