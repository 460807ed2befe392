//! Complete workflow integration tests.
//!
//! Tests that go from YAML job files to dispatched requests, and cover
//! delayed jobs, cancellation, name collisions and graceful shutdown.

use crate::common::{fast_config, start_engine, wait_for_execution_state, wait_until};
use courier::testing::ScriptedDispatcher;
use courier::{
    EngineConfig, ExecutionState, HttpDispatcher, HttpRequest, InMemoryStorage, JobDefinition,
    JobType, SchedulerError, Storage, load_jobs_from_directory,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Test: Job files in a directory are loaded, submitted and dispatched.
#[tokio::test]
async fn test_yaml_jobs_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/welcome"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("welcome.yaml"),
        format!(
            r#"
name: welcome-email
job_type: fire_and_forget
method: POST
url: {}/welcome
headers:
  content-type: application/json
body: '{{"user": 42}}'
queue: critical
max_retries: 3
"#,
            server.uri()
        ),
    )
    .unwrap();
    std::fs::write(
        dir.path().join("digest.yaml"),
        format!(
            r#"
name: weekly-digest
job_type: recurring
cron_expression: "0 8 * * 1"
timezone: Europe/Berlin
url: {}/digest
"#,
            server.uri()
        ),
    )
    .unwrap();

    let config = fast_config();
    let jobs = load_jobs_from_directory(dir.path(), &config).unwrap();
    assert_eq!(jobs.len(), 2);
    // Files are read in name order.
    assert_eq!(jobs[0].job_type, JobType::Recurring);
    assert_eq!(jobs[0].queue.as_str(), "default");
    assert_eq!(jobs[1].request.body, br#"{"user": 42}"#.to_vec());

    let storage = Arc::new(InMemoryStorage::new());
    let dispatcher = Arc::new(HttpDispatcher::new(config.dispatch_timeout()).unwrap());
    let (handle, task) = start_engine(storage.clone(), dispatcher, config).await;

    let mut welcome = None;
    for job in jobs {
        let receipt = handle.service().submit(job).await.unwrap();
        assert!(receipt.accepted);
        if receipt.job_name.as_str() == "welcome-email" {
            welcome = receipt.execution_id;
        }
    }

    wait_for_execution_state(
        storage.as_ref(),
        &welcome.unwrap(),
        ExecutionState::Succeeded,
        Duration::from_secs(5),
    )
    .await;

    let digest = handle.service().get_job("weekly-digest").await.unwrap();
    assert!(digest.next_fire_at.is_some());

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: A delayed job waits for its delay before dispatch.
#[tokio::test]
async fn test_delayed_job_waits() {
    let storage = Arc::new(InMemoryStorage::new());
    let dispatcher = Arc::new(ScriptedDispatcher::new());
    let (handle, task) = start_engine(storage.clone(), dispatcher.clone(), fast_config()).await;

    let receipt = handle
        .service()
        .submit(JobDefinition::delayed(
            "reminder",
            1,
            HttpRequest::new("POST", "http://svc/remind"),
        ))
        .await
        .unwrap();
    let id = receipt.execution_id.unwrap();

    let pending = storage.get_execution(&id).await.unwrap();
    assert_eq!(pending.state, ExecutionState::Pending);
    assert_eq!(dispatcher.call_count(), 0);

    let done = wait_for_execution_state(
        storage.as_ref(),
        &id,
        ExecutionState::Succeeded,
        Duration::from_secs(5),
    )
    .await;
    assert!(done.started_at.unwrap() >= pending.ready_at);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: Cancelling a pending execution keeps it from ever being dispatched.
#[tokio::test]
async fn test_cancel_pending_execution() {
    let storage = Arc::new(InMemoryStorage::new());
    let dispatcher = Arc::new(ScriptedDispatcher::new());
    let (handle, task) = start_engine(storage.clone(), dispatcher.clone(), fast_config()).await;

    let receipt = handle
        .service()
        .submit(JobDefinition::delayed(
            "cancel-me",
            1,
            HttpRequest::new("POST", "http://svc/"),
        ))
        .await
        .unwrap();
    let id = receipt.execution_id.unwrap();

    assert!(handle.service().cancel_execution(&id).await.unwrap());
    // Already terminal.
    assert!(!handle.service().cancel_execution(&id).await.unwrap());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let exec = storage.get_execution(&id).await.unwrap();
    assert_eq!(exec.state, ExecutionState::Cancelled);
    assert_eq!(dispatcher.call_count(), 0);

    // The name is free again once the execution is finished.
    handle
        .service()
        .submit(JobDefinition::fire_and_forget(
            "cancel-me",
            HttpRequest::new("POST", "http://svc/"),
        ))
        .await
        .unwrap();

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: A one-shot name cannot be reused while its execution is live.
#[tokio::test]
async fn test_live_one_shot_name_conflicts() {
    let storage = Arc::new(InMemoryStorage::new());
    let (handle, task) = start_engine(
        storage.clone(),
        Arc::new(ScriptedDispatcher::new()),
        fast_config(),
    )
    .await;

    let def = JobDefinition::delayed("unique", 3600, HttpRequest::new("POST", "http://svc/"));
    handle.service().submit(def.clone()).await.unwrap();
    let result = handle.service().submit(def).await;
    assert!(matches!(result, Err(SchedulerError::Conflict(_))));

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: Shutdown waits for an in-flight dispatch and records its outcome.
#[tokio::test]
async fn test_shutdown_waits_for_in_flight_dispatch() {
    let storage = Arc::new(InMemoryStorage::new());
    let dispatcher = Arc::new(ScriptedDispatcher::new().with_delay(Duration::from_millis(300)));
    let (handle, task) = start_engine(storage.clone(), dispatcher.clone(), fast_config()).await;

    let receipt = handle
        .service()
        .submit(JobDefinition::fire_and_forget(
            "slow",
            HttpRequest::new("POST", "http://svc/"),
        ))
        .await
        .unwrap();
    let id = receipt.execution_id.unwrap();

    wait_until(Duration::from_secs(5), || dispatcher.call_count() == 1).await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    let exec = storage.get_execution(&id).await.unwrap();
    assert_eq!(exec.state, ExecutionState::Succeeded);
}

/// Test: Submissions that fail validation are rejected before storage.
#[tokio::test]
async fn test_invalid_submissions_are_rejected() {
    let storage = Arc::new(InMemoryStorage::new());
    let (handle, task) = start_engine(
        storage.clone(),
        Arc::new(ScriptedDispatcher::new()),
        EngineConfig {
            queues: vec!["only".into()],
            default_queue: "only".into(),
            ..fast_config()
        },
    )
    .await;

    let bad_cron = JobDefinition::recurring("bad", "61 * * * *", HttpRequest::new("GET", "http://svc/"))
        .with_queue("only");
    assert!(matches!(
        handle.service().submit(bad_cron).await,
        Err(SchedulerError::Validation(_))
    ));

    let unknown_queue =
        JobDefinition::fire_and_forget("lost", HttpRequest::new("GET", "http://svc/"))
            .with_queue("elsewhere");
    assert!(matches!(
        handle.service().submit(unknown_queue).await,
        Err(SchedulerError::Validation(_))
    ));

    assert!(storage.list_jobs().await.unwrap().is_empty());

    handle.shutdown().await.unwrap();
    let _ = task.await;
}
