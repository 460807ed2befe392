//! Worker pool.
//!
//! Each worker is an independent tokio task that repeatedly claims the next
//! ready execution from the [`PriorityQueue`], dispatches its request and
//! hands the outcome to the [`RetryCoordinator`]. Workers share nothing but
//! the store, so an error in one execution never affects another.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;

use super::coordinator::RetryCoordinator;
use super::dispatch::{DEFAULT_DISPATCH_TIMEOUT, DispatchError, Dispatcher};
use crate::events::{Event, EventBus};
use crate::queue::PriorityQueue;
use crate::storage::StoredExecution;

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Upper bound on one dispatch attempt.
    pub dispatch_timeout: Duration,
    /// First sleep after finding nothing to do.
    pub idle_backoff_min: Duration,
    /// Longest sleep between empty polls.
    pub idle_backoff_max: Duration,
    /// How long shutdown waits for in-flight dispatches.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            idle_backoff_min: Duration::from_millis(50),
            idle_backoff_max: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Run state broadcast to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolSignal {
    Running,
    Paused,
    Stopping,
}

struct Shared {
    queue: Arc<PriorityQueue>,
    dispatcher: Arc<dyn Dispatcher>,
    coordinator: Arc<RetryCoordinator>,
    event_bus: Option<Arc<EventBus>>,
    config: WorkerConfig,
}

/// A fixed-size pool of dispatch workers.
pub struct WorkerPool {
    queue: Arc<PriorityQueue>,
    dispatcher: Arc<dyn Dispatcher>,
    coordinator: Arc<RetryCoordinator>,
    event_bus: Option<Arc<EventBus>>,
    config: WorkerConfig,
}

impl WorkerPool {
    /// Create a pool with default settings.
    pub fn new(
        queue: Arc<PriorityQueue>,
        dispatcher: Arc<dyn Dispatcher>,
        coordinator: Arc<RetryCoordinator>,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            coordinator,
            event_bus: None,
            config: WorkerConfig::default(),
        }
    }

    /// Replace the pool settings.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish dispatch events on an event bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Spawn the workers.
    pub fn start(self) -> WorkerPoolHandle {
        let (signal_tx, signal_rx) = watch::channel(PoolSignal::Running);
        let workers = self.config.workers.max(1);
        let shutdown_timeout = self.config.shutdown_timeout;
        let shared = Arc::new(Shared {
            queue: self.queue,
            dispatcher: self.dispatcher,
            coordinator: self.coordinator,
            event_bus: self.event_bus,
            config: self.config,
        });

        let mut tasks = JoinSet::new();
        for id in 0..workers {
            let worker = Worker {
                id,
                shared: Arc::clone(&shared),
                signal: signal_rx.clone(),
            };
            tasks.spawn(worker.run());
        }

        tracing::info!(workers, "Worker pool started");
        WorkerPoolHandle {
            signal: signal_tx,
            tasks,
            shutdown_timeout,
        }
    }
}

/// Control handle for a running worker pool.
pub struct WorkerPoolHandle {
    signal: watch::Sender<PoolSignal>,
    tasks: JoinSet<()>,
    shutdown_timeout: Duration,
}

impl WorkerPoolHandle {
    /// Stop claiming new executions. In-flight dispatches complete.
    pub fn pause(&self) {
        self.signal.send_replace(PoolSignal::Paused);
    }

    /// Resume claiming executions.
    pub fn resume(&self) {
        self.signal.send_replace(PoolSignal::Running);
    }

    /// Number of live workers.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether every worker has exited.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stop all workers, waiting for in-flight dispatches up to the shutdown
    /// timeout. Returns `false` if workers had to be aborted; their
    /// executions stay Running until the recovery sweep reclaims them.
    pub async fn shutdown(mut self) -> bool {
        self.signal.send_replace(PoolSignal::Stopping);

        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while let Some(result) = self.tasks.join_next().await {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Worker task panicked");
                }
            }
        })
        .await
        .is_ok();

        if !drained {
            tracing::warn!(
                remaining = self.tasks.len(),
                "Shutdown timeout reached, aborting workers"
            );
            self.tasks.abort_all();
        }
        tracing::info!("Worker pool stopped");
        drained
    }
}

struct Worker {
    id: usize,
    shared: Arc<Shared>,
    signal: watch::Receiver<PoolSignal>,
}

impl Worker {
    async fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        let config = &shared.config;
        let mut idle = config.idle_backoff_min;

        loop {
            let signal = *self.signal.borrow_and_update();
            match signal {
                PoolSignal::Stopping => break,
                PoolSignal::Paused => {
                    if self.signal.changed().await.is_err() {
                        break;
                    }
                    continue;
                }
                PoolSignal::Running => {}
            }

            match shared.queue.dequeue(Utc::now()).await {
                Ok(Some(execution)) => {
                    idle = config.idle_backoff_min;
                    self.process(execution).await;
                }
                Ok(None) => {
                    tracing::trace!(worker = self.id, idle_ms = idle.as_millis() as u64, "Idle");
                    if !self.idle(idle).await {
                        break;
                    }
                    idle = (idle * 2).min(config.idle_backoff_max);
                }
                Err(e) => {
                    tracing::warn!(worker = self.id, error = %e, "Dequeue failed");
                    if !self.idle(idle).await {
                        break;
                    }
                    idle = (idle * 2).min(config.idle_backoff_max);
                }
            }
        }

        tracing::debug!(worker = self.id, "Worker stopped");
    }

    /// Sleep for `duration` or until the run state changes. Returns `false`
    /// if the pool handle is gone.
    async fn idle(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            changed = self.signal.changed() => changed.is_ok(),
        }
    }

    async fn process(&self, execution: StoredExecution) {
        let shared = &self.shared;
        if let Some(bus) = &shared.event_bus {
            bus.emit(Event::execution_started(&execution)).await;
        }

        tracing::debug!(
            worker = self.id,
            execution_id = %execution.id,
            job_name = %execution.job_name,
            queue = %execution.queue,
            attempt = execution.attempt_count + 1,
            "Dispatching"
        );

        let started = Instant::now();
        let timeout = shared.config.dispatch_timeout;
        let dispatch = shared.dispatcher.dispatch(&execution.request);
        let result = match tokio::time::timeout(timeout, dispatch).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(timeout)),
        };
        let elapsed = started.elapsed();
        let now = Utc::now();

        let recorded = match &result {
            Ok(status) => {
                shared
                    .coordinator
                    .record_success(&execution, *status, elapsed, now)
                    .await
            }
            Err(error) => shared.coordinator.record_failure(&execution, error, now).await,
        };

        if let Err(e) = recorded {
            // The execution stays Running and is reclaimed by the recovery sweep.
            tracing::error!(
                worker = self.id,
                execution_id = %execution.id,
                error = %e,
                "Failed to record dispatch outcome"
            );
        }
    }
}
