//! courier: a durable HTTP job scheduler.
//!
//! Jobs are HTTP requests fired on a cron schedule, once immediately, or once
//! after a delay. Executions are persisted before dispatch, claimed through
//! compare-and-swap, retried with capped exponential backoff and reclaimed
//! by a recovery sweep if a worker dies mid-dispatch.

pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod queue;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use config::{ConfigError, EngineConfig, StorageConfig, YamlLoader, load_jobs_from_directory};
pub use core::job::{HttpRequest, JobDefinition, JobType, MAX_DELAY_SECONDS, ValidationError};
pub use core::retry::{RetryDecision, RetryPolicy};
pub use core::schedule::{Schedule, ScheduleError};
pub use core::types::{ExecutionId, JobName, QueueName};
pub use events::{Event, EventBus, EventHandler, LoggingHandler};
pub use execution::{
    AttemptOutcome, DEFAULT_DISPATCH_TIMEOUT, DispatchError, Dispatcher, ExhaustionError,
    HttpDispatcher, RetryCoordinator, WorkerConfig, WorkerPool, WorkerPoolHandle,
};
pub use queue::{DEFAULT_QUEUES, PriorityQueue, QueueSet};
pub use scheduler::{
    CronTrigger, JobService, RecoverySweep, Scheduler, SchedulerError, SchedulerHandle,
    SchedulerState, SubmitReceipt,
};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use storage::{
    ExecutionFilter, ExecutionState, Firing, InMemoryStorage, Storage, StorageError,
    StoredExecution, StoredJob, Transition,
};
