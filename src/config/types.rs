//! Configuration type definitions.
//!
//! This module contains the engine configuration (`courier.yaml`) and the
//! storage backend selection.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::error::ConfigError;
use crate::core::retry::RetryPolicy;
use crate::core::types::QueueName;
use crate::execution::WorkerConfig;
use crate::queue::{DEFAULT_BATCH_SIZE, DEFAULT_QUEUES, QueueSet};
use crate::storage::{InMemoryStorage, Storage, StorageError};

/// Engine configuration (courier.yaml).
///
/// Every field is optional; missing fields take the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker pool size.
    pub workers: usize,
    /// Queue names, highest priority first.
    pub queues: Vec<String>,
    /// Queue for job files that do not name one.
    pub default_queue: String,
    /// Cron trigger polling interval.
    pub trigger_interval_ms: u64,
    /// First idle sleep of a worker that found nothing to do.
    pub idle_backoff_min_ms: u64,
    /// Longest idle sleep.
    pub idle_backoff_max_ms: u64,
    /// Per-request timeout.
    pub dispatch_timeout_secs: u64,
    /// Extra time before a Running execution counts as abandoned.
    pub recovery_grace_secs: u64,
    /// How often the recovery sweep runs.
    pub recovery_interval_secs: u64,
    /// How long shutdown waits for in-flight dispatches.
    pub shutdown_timeout_secs: u64,
    /// Candidates read per queue and dequeue attempt.
    pub queue_batch_size: usize,
    /// Retry backoff.
    pub retry: RetryPolicy,
    /// Storage backend.
    pub storage: StorageConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queues: DEFAULT_QUEUES.iter().map(|q| q.to_string()).collect(),
            default_queue: QueueName::default().to_string(),
            trigger_interval_ms: 1000,
            idle_backoff_min_ms: 50,
            idle_backoff_max_ms: 1000,
            dispatch_timeout_secs: 30,
            recovery_grace_secs: 30,
            recovery_interval_secs: 60,
            shutdown_timeout_secs: 30,
            queue_batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Check values that deserialize fine but cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidConfig(
                "workers must be at least 1".into(),
            ));
        }
        if self.queues.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "at least one queue is required".into(),
            ));
        }
        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "queue names must not be empty".into(),
                ));
            }
            if !seen.insert(queue.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate queue '{}'",
                    queue
                )));
            }
        }
        if !seen.contains(self.default_queue.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "default_queue '{}' is not in queues",
                self.default_queue
            )));
        }
        if self.trigger_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "trigger_interval_ms must be positive".into(),
            ));
        }
        if self.idle_backoff_min_ms == 0 || self.idle_backoff_min_ms > self.idle_backoff_max_ms {
            return Err(ConfigError::InvalidConfig(
                "idle backoff must satisfy 0 < idle_backoff_min_ms <= idle_backoff_max_ms".into(),
            ));
        }
        if self.dispatch_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "dispatch_timeout_secs must be positive".into(),
            ));
        }
        if self.recovery_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "recovery_interval_secs must be positive".into(),
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::InvalidConfig(
                "retry.base_delay_secs must not exceed retry.max_delay_secs".into(),
            ));
        }
        Ok(())
    }

    /// Configured queues in priority order.
    pub fn queue_set(&self) -> QueueSet {
        QueueSet::new(self.queues.iter().map(String::as_str))
    }

    pub fn trigger_interval(&self) -> Duration {
        Duration::from_millis(self.trigger_interval_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    /// Age after which a Running execution is reclaimed: the dispatch
    /// timeout plus the recovery grace.
    pub fn abandon_after(&self) -> Duration {
        Duration::from_secs(
            self.dispatch_timeout_secs
                .saturating_add(self.recovery_grace_secs),
        )
    }

    /// Worker pool settings.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            workers: self.workers,
            dispatch_timeout: self.dispatch_timeout(),
            idle_backoff_min: Duration::from_millis(self.idle_backoff_min_ms),
            idle_backoff_max: Duration::from_millis(self.idle_backoff_max_ms),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

impl StorageConfig {
    /// Open the configured backend.
    pub async fn open(&self) -> Result<Arc<dyn Storage>, StorageError> {
        match self {
            StorageConfig::Memory => Ok(Arc::new(InMemoryStorage::new())),
            #[cfg(feature = "sqlite")]
            StorageConfig::Sqlite { path } => {
                let storage = crate::storage::SqliteStorage::new(path).await?;
                Ok(Arc::new(storage))
            }
            #[cfg(not(feature = "sqlite"))]
            StorageConfig::Sqlite { .. } => Err(StorageError::Other(
                "built without the sqlite feature".into(),
            )),
        }
    }
}
