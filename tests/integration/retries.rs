//! Dispatch and retry integration tests.
//!
//! Tests that run jobs against a live HTTP server and verify attempt
//! counting, backoff and exhaustion.

use crate::common::{fast_config, start_engine, wait_for_execution_state};
use courier::testing::RecordingHandler;
use courier::{
    Event, EventBus, ExecutionState, HttpDispatcher, HttpRequest, InMemoryStorage, JobDefinition,
    Scheduler, Storage,
};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn http_dispatcher() -> Arc<HttpDispatcher> {
    Arc::new(HttpDispatcher::new(Duration::from_secs(5)).unwrap())
}

/// Test: A 2xx response completes the execution on the first attempt.
#[tokio::test]
async fn test_successful_dispatch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/report"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let storage = Arc::new(InMemoryStorage::new());
    let (handle, task) = start_engine(storage.clone(), http_dispatcher(), fast_config()).await;

    let receipt = handle
        .service()
        .submit(JobDefinition::fire_and_forget(
            "report",
            HttpRequest::new("POST", format!("{}/hooks/report", server.uri())),
        ))
        .await
        .unwrap();
    let id = receipt.execution_id.unwrap();

    let exec = wait_for_execution_state(
        storage.as_ref(),
        &id,
        ExecutionState::Succeeded,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(exec.attempt_count, 1);
    assert!(exec.last_error.is_none());
    assert!(exec.finished_at.is_some());

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: A job that always fails is attempted `max_retries + 1` times, then
/// exhausted with the last error recorded.
#[tokio::test]
async fn test_always_failing_job_is_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let storage = Arc::new(InMemoryStorage::new());
    let handler = Arc::new(RecordingHandler::new());
    let bus = EventBus::new();
    bus.register(handler.clone()).await;

    let (handle, task) = Scheduler::new(storage.clone(), http_dispatcher())
        .with_config(fast_config())
        .with_event_bus(bus)
        .start()
        .await;

    let receipt = handle
        .service()
        .submit(
            JobDefinition::fire_and_forget("flaky", HttpRequest::new("GET", server.uri()))
                .with_max_retries(2),
        )
        .await
        .unwrap();
    let id = receipt.execution_id.unwrap();

    let exec = wait_for_execution_state(
        storage.as_ref(),
        &id,
        ExecutionState::Exhausted,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(exec.attempt_count, 3);
    assert_eq!(exec.last_error.as_deref(), Some("HTTP 500"));

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);

    let retries = handler
        .matching(|e| matches!(e, Event::ExecutionRetryScheduled { .. }))
        .await;
    assert_eq!(retries.len(), 2);
    let exhausted = handler
        .matching(|e| matches!(e, Event::ExecutionExhausted { .. }))
        .await;
    assert_eq!(exhausted.len(), 1);
    match &exhausted[0] {
        Event::ExecutionExhausted { error, .. } => {
            assert_eq!(error.attempts, 3);
            assert_eq!(error.last_error, "HTTP 500");
        }
        other => panic!("unexpected event {:?}", other),
    }

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: Transient failures are retried until the target recovers.
#[tokio::test]
async fn test_transient_failures_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let storage = Arc::new(InMemoryStorage::new());
    let (handle, task) = start_engine(storage.clone(), http_dispatcher(), fast_config()).await;

    let receipt = handle
        .service()
        .submit(
            JobDefinition::fire_and_forget("sync", HttpRequest::new("POST", server.uri()))
                .with_max_retries(5),
        )
        .await
        .unwrap();
    let id = receipt.execution_id.unwrap();

    let exec = wait_for_execution_state(
        storage.as_ref(),
        &id,
        ExecutionState::Succeeded,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(exec.attempt_count, 3);
    assert!(exec.last_error.is_none());

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: Method, headers and body reach the target unchanged.
#[tokio::test]
async fn test_request_is_forwarded_verbatim() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/ingest"))
        .and(header("x-api-key", "k-123"))
        .and(header("content-type", "application/json"))
        .and(body_string(r#"{"batch":7}"#))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let storage = Arc::new(InMemoryStorage::new());
    let (handle, task) = start_engine(storage.clone(), http_dispatcher(), fast_config()).await;

    let request = HttpRequest::new("PUT", format!("{}/v1/ingest", server.uri()))
        .with_header("x-api-key", "k-123")
        .with_header("content-type", "application/json")
        .with_body(r#"{"batch":7}"#);
    let receipt = handle
        .service()
        .submit(JobDefinition::fire_and_forget("ingest", request))
        .await
        .unwrap();

    wait_for_execution_state(
        storage.as_ref(),
        &receipt.execution_id.unwrap(),
        ExecutionState::Succeeded,
        Duration::from_secs(5),
    )
    .await;

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: A target that does not answer within the dispatch timeout counts
/// as a failed attempt.
#[tokio::test]
async fn test_slow_target_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let storage = Arc::new(InMemoryStorage::new());
    let config = courier::EngineConfig {
        dispatch_timeout_secs: 1,
        ..fast_config()
    };
    let dispatcher = Arc::new(HttpDispatcher::new(config.dispatch_timeout()).unwrap());
    let (handle, task) = start_engine(storage.clone(), dispatcher, config).await;

    let receipt = handle
        .service()
        .submit(JobDefinition::fire_and_forget(
            "slow",
            HttpRequest::new("GET", server.uri()),
        ))
        .await
        .unwrap();

    let exec = wait_for_execution_state(
        storage.as_ref(),
        &receipt.execution_id.unwrap(),
        ExecutionState::Exhausted,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(exec.attempt_count, 1);
    assert!(exec.last_error.unwrap().contains("timed out"));

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: An unreachable target is retried like any other failure.
#[tokio::test]
async fn test_unreachable_target_is_retried() {
    // Bind and drop a listener to get a port nothing listens on.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let storage = Arc::new(InMemoryStorage::new());
    let (handle, task) = start_engine(storage.clone(), http_dispatcher(), fast_config()).await;

    let receipt = handle
        .service()
        .submit(
            JobDefinition::fire_and_forget(
                "unreachable",
                HttpRequest::new("GET", format!("http://127.0.0.1:{}/", port)),
            )
            .with_max_retries(1),
        )
        .await
        .unwrap();

    let exec = wait_for_execution_state(
        storage.as_ref(),
        &receipt.execution_id.unwrap(),
        ExecutionState::Exhausted,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(exec.attempt_count, 2);

    let all = storage
        .query_executions(&courier::ExecutionFilter::all().job("unreachable"))
        .await
        .unwrap();
    assert_eq!(all.len(), 1);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}
