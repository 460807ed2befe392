//! Scheduler engine.
//!
//! Wires the job store, the cron trigger, the worker pool and the recovery
//! sweep together and drives them from one control loop. Every piece of
//! shared state lives in the store, so several engines may run against the
//! same store at once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::recovery::RecoverySweep;
use super::service::JobService;
use super::trigger::CronTrigger;
use super::types::{SchedulerCommand, SchedulerError, SchedulerState};
use crate::config::EngineConfig;
use crate::events::EventBus;
use crate::execution::{Dispatcher, RetryCoordinator, WorkerPool, WorkerPoolHandle};
use crate::queue::PriorityQueue;
use crate::storage::Storage;

/// The job-scheduling engine.
pub struct Scheduler {
    storage: Arc<dyn Storage>,
    dispatcher: Arc<dyn Dispatcher>,
    event_bus: Arc<EventBus>,
    config: EngineConfig,
}

impl Scheduler {
    /// Create an engine with default settings.
    pub fn new(storage: Arc<dyn Storage>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            storage,
            dispatcher,
            event_bus: Arc::new(EventBus::new()),
            config: EngineConfig::default(),
        }
    }

    /// Set the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Arc::new(event_bus);
        self
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A job service over this engine's store and queues.
    pub fn service(&self) -> JobService {
        JobService::new(Arc::clone(&self.storage), self.config.queue_set())
            .with_event_bus(Arc::clone(&self.event_bus))
    }

    /// Start the engine and return a handle for controlling it.
    ///
    /// Runs one recovery sweep before any worker starts, so executions
    /// abandoned by a previous process are requeued first.
    pub async fn start(self) -> (SchedulerHandle, JoinHandle<()>) {
        let coordinator = Arc::new(
            RetryCoordinator::new(Arc::clone(&self.storage), self.config.retry)
                .with_event_bus(Arc::clone(&self.event_bus)),
        );
        let sweep = RecoverySweep::new(
            Arc::clone(&self.storage),
            Arc::clone(&coordinator),
            self.config.abandon_after(),
        )
        .with_event_bus(Arc::clone(&self.event_bus));
        let trigger = CronTrigger::new(Arc::clone(&self.storage))
            .with_event_bus(Arc::clone(&self.event_bus));

        match sweep.run(Utc::now()).await {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                tracing::info!(count = reclaimed.len(), "Recovered abandoned executions on startup");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Startup recovery sweep failed"),
        }

        let queue = Arc::new(
            PriorityQueue::new(Arc::clone(&self.storage), self.config.queue_set())
                .with_batch_size(self.config.queue_batch_size),
        );
        let pool = WorkerPool::new(queue, Arc::clone(&self.dispatcher), coordinator)
            .with_config(self.config.worker_config())
            .with_event_bus(Arc::clone(&self.event_bus))
            .start();

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(SchedulerState::Running));
        let handle = SchedulerHandle {
            command_tx,
            state: Arc::clone(&state),
            service: Arc::new(self.service()),
        };

        let control = ControlLoop {
            trigger,
            sweep,
            pool,
            trigger_interval: self.config.trigger_interval(),
            recovery_interval: self.config.recovery_interval(),
        };
        let task = tokio::spawn(async move {
            control.run(command_rx, state).await;
        });

        tracing::info!(
            workers = self.config.workers,
            queues = ?self.config.queues,
            "Scheduler started"
        );
        (handle, task)
    }
}

struct ControlLoop {
    trigger: CronTrigger,
    sweep: RecoverySweep,
    pool: WorkerPoolHandle,
    trigger_interval: Duration,
    recovery_interval: Duration,
}

impl ControlLoop {
    async fn run(
        self,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        state: Arc<RwLock<SchedulerState>>,
    ) {
        let mut trigger_tick = tokio::time::interval(self.trigger_interval);
        trigger_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut recovery_tick = tokio::time::interval_at(
            Instant::now() + self.recovery_interval,
            self.recovery_interval,
        );
        recovery_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown_response = loop {
            tokio::select! {
                _ = trigger_tick.tick() => {
                    if *state.read().await == SchedulerState::Running
                        && let Err(e) = self.trigger.evaluate(Utc::now()).await
                    {
                        tracing::warn!(error = %e, "Cron evaluation failed");
                    }
                }

                _ = recovery_tick.tick() => {
                    if *state.read().await == SchedulerState::Running
                        && let Err(e) = self.sweep.run(Utc::now()).await
                    {
                        tracing::warn!(error = %e, "Recovery sweep failed");
                    }
                }

                command = command_rx.recv() => {
                    match command {
                        Some(SchedulerCommand::Pause { response }) => {
                            *state.write().await = SchedulerState::Paused;
                            self.pool.pause();
                            tracing::info!("Scheduler paused");
                            let _ = response.send(());
                        }
                        Some(SchedulerCommand::Resume { response }) => {
                            *state.write().await = SchedulerState::Running;
                            self.pool.resume();
                            // The next tick fires what came due during the
                            // pause, once per job.
                            tracing::info!("Scheduler resumed");
                            let _ = response.send(());
                        }
                        Some(SchedulerCommand::Sweep { response }) => {
                            let result = self
                                .sweep
                                .run(Utc::now())
                                .await
                                .map(|reclaimed| reclaimed.len())
                                .map_err(SchedulerError::from);
                            let _ = response.send(result);
                        }
                        Some(SchedulerCommand::Shutdown { response }) => break Some(response),
                        None => {
                            tracing::info!("All scheduler handles dropped, shutting down");
                            break None;
                        }
                    }
                }
            }
        };

        *state.write().await = SchedulerState::Stopped;
        if !self.pool.shutdown().await {
            tracing::warn!("Shutdown timed out with dispatches still in flight");
        }
        tracing::info!("Scheduler stopped");
        if let Some(response) = shutdown_response {
            let _ = response.send(());
        }
    }
}
