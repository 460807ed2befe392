//! Storage abstraction for job definitions and executions.
//!
//! The store is the single source of truth and the only shared mutable
//! resource. Every state change goes through a conditional write: executions
//! by compare-and-swap on state and version, recurring schedules by a
//! conditional update of `next_fire_at`. Two backends are provided,
//! in-memory and SQLite.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::core::job::{HttpRequest, JobDefinition, JobType};
use crate::core::types::{ExecutionId, JobName, QueueName};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// A conditional write lost against a concurrent writer.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// State of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Waiting for `ready_at` (delayed job, retry backoff, cron firing).
    Pending,
    /// Ready for immediate dispatch.
    Enqueued,
    /// Claimed by a worker; dispatch in flight.
    Running,
    /// A 2xx response was received.
    Succeeded,
    /// The request can never be sent.
    Failed,
    /// All attempts failed.
    Exhausted,
    /// Cancelled before dispatch.
    Cancelled,
}

impl ExecutionState {
    /// All states, in lifecycle order.
    pub const ALL: [ExecutionState; 7] = [
        ExecutionState::Pending,
        ExecutionState::Enqueued,
        ExecutionState::Running,
        ExecutionState::Succeeded,
        ExecutionState::Failed,
        ExecutionState::Exhausted,
        ExecutionState::Cancelled,
    ];

    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Enqueued => "enqueued",
            ExecutionState::Running => "running",
            ExecutionState::Succeeded => "succeeded",
            ExecutionState::Failed => "failed",
            ExecutionState::Exhausted => "exhausted",
            ExecutionState::Cancelled => "cancelled",
        }
    }

    /// Terminal states never re-enter the queue.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Succeeded
                | ExecutionState::Failed
                | ExecutionState::Exhausted
                | ExecutionState::Cancelled
        )
    }

    /// States a worker can claim.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, ExecutionState::Pending | ExecutionState::Enqueued)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionState {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| StorageError::SerializationError(format!("unknown state: {}", s)))
    }
}

/// Stored job definition plus schedule bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredJob {
    /// The submitted definition.
    pub definition: JobDefinition,
    /// Next cron fire time (recurring only).
    pub next_fire_at: Option<DateTime<Utc>>,
    /// Fire time of the most recent firing (recurring only).
    pub last_fired_at: Option<DateTime<Utc>>,
    /// Incremented on every write.
    pub version: u64,
    /// When the job was first stored.
    pub created_at: DateTime<Utc>,
    /// When the job was last written.
    pub updated_at: DateTime<Utc>,
}

impl StoredJob {
    /// Create a new, not yet stored job.
    pub fn new(definition: JobDefinition, now: DateTime<Utc>) -> Self {
        Self {
            definition,
            next_fire_at: None,
            last_fired_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the next fire time.
    pub fn with_next_fire_at(mut self, next_fire_at: DateTime<Utc>) -> Self {
        self.next_fire_at = Some(next_fire_at);
        self
    }

    /// Job name.
    pub fn name(&self) -> &JobName {
        &self.definition.name
    }

    /// Job type.
    pub fn job_type(&self) -> JobType {
        self.definition.job_type
    }
}

/// One attempt-series for one firing of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredExecution {
    /// Unique, time-ordered identifier.
    pub id: ExecutionId,
    /// Owning job.
    pub job_name: JobName,
    /// Current state.
    pub state: ExecutionState,
    /// Dispatch queue.
    pub queue: QueueName,
    /// Request snapshot taken when the execution was created.
    pub request: HttpRequest,
    /// Retry budget copied from the definition.
    pub max_retries: u32,
    /// Not dispatched before this instant.
    pub ready_at: DateTime<Utc>,
    /// The cron fire time this execution represents.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Attempts made so far.
    pub attempt_count: u32,
    /// Error of the most recent failed attempt.
    pub last_error: Option<String>,
    /// When the current or latest attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal state was reached.
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Incremented on every transition.
    pub version: u64,
}

impl StoredExecution {
    /// Create an execution for a definition.
    pub fn new(
        definition: &JobDefinition,
        state: ExecutionState,
        ready_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            job_name: definition.name.clone(),
            state,
            queue: definition.queue.clone(),
            request: definition.request.clone(),
            max_retries: definition.max_retries,
            ready_at,
            scheduled_for: None,
            attempt_count: 0,
            last_error: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Record which cron fire time this execution represents.
    pub fn with_scheduled_for(mut self, scheduled_for: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(scheduled_for);
        self
    }

    /// Apply a transition after its guard has been checked.
    pub(crate) fn apply(&mut self, transition: &Transition) {
        self.state = transition.to;
        if let Some(attempts) = transition.attempt_count {
            self.attempt_count = attempts;
        }
        if let Some(ready_at) = transition.ready_at {
            self.ready_at = ready_at;
        }
        if let Some(error) = &transition.last_error {
            self.last_error = error.clone();
        }
        if let Some(started_at) = transition.started_at {
            self.started_at = Some(started_at);
        }
        if let Some(finished_at) = transition.finished_at {
            self.finished_at = Some(finished_at);
        }
        self.updated_at = transition.at;
        self.version += 1;
    }
}

/// A guarded state change of one execution.
///
/// Applied only if the stored state equals `from` and, when set, the stored
/// version equals `expected_version`.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub id: ExecutionId,
    pub from: ExecutionState,
    pub to: ExecutionState,
    pub expected_version: Option<u64>,
    pub attempt_count: Option<u32>,
    pub ready_at: Option<DateTime<Utc>>,
    /// `Some(None)` clears the stored error.
    pub last_error: Option<Option<String>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Time of the transition, stored as `updated_at`.
    pub at: DateTime<Utc>,
}

impl Transition {
    /// A transition with no field updates.
    pub fn new(id: ExecutionId, from: ExecutionState, to: ExecutionState, at: DateTime<Utc>) -> Self {
        Self {
            id,
            from,
            to,
            expected_version: None,
            attempt_count: None,
            ready_at: None,
            last_error: None,
            started_at: None,
            finished_at: None,
            at,
        }
    }

    /// Also require the stored version to match.
    pub fn expect_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn attempt_count(mut self, attempts: u32) -> Self {
        self.attempt_count = Some(attempts);
        self
    }

    pub fn ready_at(mut self, ready_at: DateTime<Utc>) -> Self {
        self.ready_at = Some(ready_at);
        self
    }

    pub fn last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    pub fn started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self
    }

    pub fn finished_at(mut self, finished_at: DateTime<Utc>) -> Self {
        self.finished_at = Some(finished_at);
        self
    }

    /// Check the guard against the stored execution.
    pub(crate) fn check(&self, current: &StoredExecution) -> Result<(), StorageError> {
        if current.state != self.from {
            return Err(StorageError::Conflict(format!(
                "execution {} is {}, expected {}",
                self.id, current.state, self.from
            )));
        }
        if let Some(version) = self.expected_version {
            if current.version != version {
                return Err(StorageError::Conflict(format!(
                    "execution {} is at version {}, expected {}",
                    self.id, current.version, version
                )));
            }
        }
        Ok(())
    }
}

/// One firing of a recurring job.
///
/// Applied only if the stored `next_fire_at` still equals
/// `expected_next_fire_at`.
#[derive(Debug, Clone)]
pub struct Firing {
    pub job_name: JobName,
    pub expected_next_fire_at: DateTime<Utc>,
    pub next_fire_at: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
    pub execution: StoredExecution,
}

/// Filters for inspecting executions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionFilter {
    pub job_name: Option<JobName>,
    /// Empty means any state.
    pub states: Vec<ExecutionState>,
    pub queue: Option<QueueName>,
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    /// Match every execution.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn job(mut self, job_name: impl Into<JobName>) -> Self {
        self.job_name = Some(job_name.into());
        self
    }

    pub fn state(mut self, state: ExecutionState) -> Self {
        self.states.push(state);
        self
    }

    pub fn queue(mut self, queue: impl Into<QueueName>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether an execution passes the filter, ignoring `limit`.
    pub fn matches(&self, execution: &StoredExecution) -> bool {
        self.job_name
            .as_ref()
            .is_none_or(|name| &execution.job_name == name)
            && (self.states.is_empty() || self.states.contains(&execution.state))
            && self.queue.as_ref().is_none_or(|q| &execution.queue == q)
    }
}

/// Storage trait for persisting scheduler state.
///
/// Every write is durable before the call returns.
#[async_trait]
pub trait Storage: Send + Sync {
    // Job operations

    /// Insert a job (`expected_version = None`) or replace it if the stored
    /// version matches. Returns the job as stored.
    async fn put_job(
        &self,
        job: StoredJob,
        expected_version: Option<u64>,
    ) -> Result<StoredJob, StorageError>;

    /// Get a job by name.
    async fn get_job(&self, name: &JobName) -> Result<StoredJob, StorageError>;

    /// List all jobs, oldest first.
    async fn list_jobs(&self) -> Result<Vec<StoredJob>, StorageError>;

    /// Delete a job and cancel its Pending and Enqueued executions.
    ///
    /// Running and terminal executions are left untouched. Returns the ids of
    /// the cancelled executions.
    async fn delete_job(
        &self,
        name: &JobName,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionId>, StorageError>;

    /// Delete a one-shot job once no live execution references it.
    async fn release_job(&self, name: &JobName) -> Result<bool, StorageError>;

    /// Atomically store a one-shot job together with its execution.
    async fn enqueue_one_shot(
        &self,
        job: StoredJob,
        execution: StoredExecution,
    ) -> Result<StoredJob, StorageError>;

    /// Recurring jobs whose `next_fire_at` is at or before `now`.
    async fn due_recurring_jobs(&self, now: DateTime<Utc>) -> Result<Vec<StoredJob>, StorageError>;

    /// Advance a recurring schedule and create its execution in one write.
    async fn fire_recurring(&self, firing: Firing) -> Result<StoredJob, StorageError>;

    // Execution operations

    /// Store a new execution.
    async fn create_execution(&self, execution: StoredExecution) -> Result<(), StorageError>;

    /// Get an execution by id.
    async fn get_execution(&self, id: &ExecutionId) -> Result<StoredExecution, StorageError>;

    /// Compare-and-swap state change. Returns the updated execution.
    async fn transition(&self, transition: Transition) -> Result<StoredExecution, StorageError>;

    /// Dispatchable executions of one queue with `ready_at <= now`, ordered by
    /// `ready_at`, then `created_at`, then id.
    async fn ready_executions(
        &self,
        queue: &QueueName,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredExecution>, StorageError>;

    /// Running executions whose attempt started before the cut-off.
    async fn stale_running(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<StoredExecution>, StorageError>;

    /// Executions matching a filter, newest first.
    async fn query_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<StoredExecution>, StorageError>;
}
