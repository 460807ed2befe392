//! Recovery scenario integration tests.
//!
//! Tests that verify executions survive a restart and that executions left
//! Running by a crashed worker are reclaimed and finished.

use crate::common::{fast_config, start_engine, wait_for_execution_state};
use chrono::Utc;
use courier::testing::ScriptedDispatcher;
use courier::{
    ExecutionFilter, ExecutionState, HttpRequest, InMemoryStorage, JobDefinition, JobService,
    QueueSet, SqliteStorage, Storage, StoredExecution, StoredJob, Transition,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Store a one-shot job whose execution a dead worker left Running.
async fn abandoned_execution(
    storage: &dyn Storage,
    name: &str,
    max_retries: u32,
    started: chrono::DateTime<Utc>,
) -> StoredExecution {
    let def = JobDefinition::fire_and_forget(name, HttpRequest::new("POST", "http://svc/"))
        .with_max_retries(max_retries);
    let exec = StoredExecution::new(&def, ExecutionState::Enqueued, started, started);
    storage
        .enqueue_one_shot(StoredJob::new(def, started), exec.clone())
        .await
        .unwrap();
    storage
        .transition(
            Transition::new(exec.id, ExecutionState::Enqueued, ExecutionState::Running, started)
                .started_at(started),
        )
        .await
        .unwrap()
}

/// Test: An execution abandoned in Running is redispatched after a restart,
/// with the lost attempt counted.
#[tokio::test]
async fn test_abandoned_execution_completes_after_restart() {
    let storage = Arc::new(InMemoryStorage::new());
    let crashed_at = Utc::now() - chrono::Duration::minutes(10);
    let exec = abandoned_execution(storage.as_ref(), "crashed", 2, crashed_at).await;

    let dispatcher = Arc::new(ScriptedDispatcher::new());
    let (handle, task) = start_engine(storage.clone(), dispatcher.clone(), fast_config()).await;

    let done = wait_for_execution_state(
        storage.as_ref(),
        &exec.id,
        ExecutionState::Succeeded,
        Duration::from_secs(5),
    )
    .await;
    // One abandoned attempt plus the successful one.
    assert_eq!(done.attempt_count, 2);
    assert_eq!(dispatcher.call_count(), 1);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: An abandoned execution with no retry budget left is exhausted, not
/// redispatched.
#[tokio::test]
async fn test_abandoned_execution_without_budget_is_exhausted() {
    let storage = Arc::new(InMemoryStorage::new());
    let crashed_at = Utc::now() - chrono::Duration::minutes(10);
    let exec = abandoned_execution(storage.as_ref(), "once", 0, crashed_at).await;

    let dispatcher = Arc::new(ScriptedDispatcher::new());
    let (handle, task) = start_engine(storage.clone(), dispatcher.clone(), fast_config()).await;

    let stored = storage.get_execution(&exec.id).await.unwrap();
    assert_eq!(stored.state, ExecutionState::Exhausted);
    assert!(stored.last_error.unwrap().contains("abandoned"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(dispatcher.call_count(), 0);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: An execution still within the dispatch timeout is not reclaimed.
#[tokio::test]
async fn test_in_flight_execution_is_not_reclaimed() {
    let storage = Arc::new(InMemoryStorage::new());
    let exec = abandoned_execution(storage.as_ref(), "busy", 3, Utc::now()).await;

    let (handle, task) = start_engine(
        storage.clone(),
        Arc::new(ScriptedDispatcher::new()),
        fast_config(),
    )
    .await;

    assert_eq!(handle.sweep().await.unwrap(), 0);
    let stored = storage.get_execution(&exec.id).await.unwrap();
    assert_eq!(stored.state, ExecutionState::Running);
    assert_eq!(stored.attempt_count, 0);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: Jobs and executions written to SQLite are visible after the store
/// is closed and reopened.
#[tokio::test]
async fn test_sqlite_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("courier.db");

    let delayed_id = {
        let storage = Arc::new(SqliteStorage::new(&db).await.unwrap());
        let service = JobService::new(storage.clone(), QueueSet::default());
        service
            .submit(JobDefinition::recurring(
                "nightly",
                "0 3 * * *",
                HttpRequest::new("POST", "http://svc/nightly"),
            ))
            .await
            .unwrap();
        let receipt = service
            .submit(JobDefinition::delayed(
                "reminder",
                3600,
                HttpRequest::new("POST", "http://svc/remind").with_body("hello"),
            ))
            .await
            .unwrap();
        storage.close().await;
        receipt.execution_id.unwrap()
    };

    let storage = Arc::new(SqliteStorage::new(&db).await.unwrap());
    let jobs = storage.list_jobs().await.unwrap();
    let mut names: Vec<_> = jobs.iter().map(|j| j.name().to_string()).collect();
    names.sort();
    assert_eq!(names, vec!["nightly", "reminder"]);

    let nightly = storage.get_job(&"nightly".into()).await.unwrap();
    assert!(nightly.next_fire_at.is_some());

    let exec = storage.get_execution(&delayed_id).await.unwrap();
    assert_eq!(exec.state, ExecutionState::Pending);
    assert!(exec.ready_at > Utc::now());
    assert_eq!(exec.request.body, b"hello".to_vec());
}

/// Test: A Running execution persisted in SQLite by a crashed process is
/// finished by the next process.
#[tokio::test]
async fn test_sqlite_crash_recovery() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("courier.db");

    let exec_id = {
        let storage = SqliteStorage::new(&db).await.unwrap();
        let crashed_at = Utc::now() - chrono::Duration::minutes(10);
        let exec = abandoned_execution(&storage, "lost", 2, crashed_at).await;
        storage.close().await;
        exec.id
    };

    let storage = Arc::new(SqliteStorage::new(&db).await.unwrap());
    let dispatcher = Arc::new(ScriptedDispatcher::new());
    let (handle, task) = start_engine(storage.clone(), dispatcher.clone(), fast_config()).await;

    let done = wait_for_execution_state(
        storage.as_ref(),
        &exec_id,
        ExecutionState::Succeeded,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(done.attempt_count, 2);

    let all = storage
        .query_executions(&ExecutionFilter::all().job("lost"))
        .await
        .unwrap();
    assert_eq!(all.len(), 1);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}
