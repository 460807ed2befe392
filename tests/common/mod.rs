//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use courier::{
    Dispatcher, EngineConfig, ExecutionId, ExecutionState, RetryPolicy, Scheduler,
    SchedulerHandle, Storage, StoredExecution,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Engine settings with short intervals so tests finish quickly.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        workers: 2,
        trigger_interval_ms: 20,
        idle_backoff_min_ms: 5,
        idle_backoff_max_ms: 20,
        dispatch_timeout_secs: 5,
        shutdown_timeout_secs: 5,
        retry: RetryPolicy::exponential(Duration::from_millis(10), Duration::from_millis(100)),
        ..EngineConfig::default()
    }
}

/// Start an engine over `storage` with `config`.
pub async fn start_engine(
    storage: Arc<dyn Storage>,
    dispatcher: Arc<dyn Dispatcher>,
    config: EngineConfig,
) -> (SchedulerHandle, JoinHandle<()>) {
    Scheduler::new(storage, dispatcher)
        .with_config(config)
        .start()
        .await
}

/// Wait for an execution to reach an expected state, polling storage.
///
/// Polls storage every 10ms and times out after the specified duration.
///
/// # Panics
///
/// Panics if the timeout is reached before the execution reaches the
/// expected state.
pub async fn wait_for_execution_state(
    storage: &dyn Storage,
    id: &ExecutionId,
    expected: ExecutionState,
    timeout: Duration,
) -> StoredExecution {
    let start = tokio::time::Instant::now();
    loop {
        let exec = storage.get_execution(id).await.unwrap();
        if exec.state == expected {
            return exec;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for execution {} to reach {}, current state: {}",
                id, expected, exec.state
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `condition` holds, polling every 10ms.
pub async fn wait_until<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    while !condition() {
        if start.elapsed() > timeout {
            panic!("Timeout waiting for condition");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
