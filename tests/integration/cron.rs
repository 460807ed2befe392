//! Cron firing integration tests.
//!
//! Tests that verify recurring jobs fire once per occurrence, across
//! concurrent triggers and store connections, in the job's timezone.

use crate::common::{fast_config, start_engine, wait_for_execution_state};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use courier::testing::ScriptedDispatcher;
use courier::{
    CronTrigger, ExecutionFilter, ExecutionState, HttpRequest, InMemoryStorage, JobDefinition,
    JobService, QueueSet, SqliteStorage, Storage,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap()
}

fn every_minute(name: &str) -> JobDefinition {
    JobDefinition::recurring(name, "* * * * *", HttpRequest::new("GET", "http://svc/tick"))
}

/// Test: Triggers in several "processes" (separate connection pools on one
/// database file) evaluating the same instant create one execution.
#[tokio::test]
async fn test_concurrent_triggers_over_sqlite_fire_once() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("courier.db");

    let first = Arc::new(SqliteStorage::new(&db).await.unwrap());
    let second = Arc::new(SqliteStorage::new(&db).await.unwrap());
    JobService::new(first.clone(), QueueSet::default())
        .submit_at(every_minute("tick"), t0())
        .await
        .unwrap();

    let due = t0() + ChronoDuration::minutes(1);
    let mut handles = Vec::new();
    for i in 0..8 {
        let storage: Arc<dyn Storage> = if i % 2 == 0 {
            first.clone()
        } else {
            second.clone()
        };
        let trigger = CronTrigger::new(storage);
        handles.push(tokio::spawn(async move { trigger.evaluate(due).await }));
    }
    let mut fired = 0;
    for handle in handles {
        fired += handle.await.unwrap().unwrap().len();
    }
    assert_eq!(fired, 1);

    let execs = first
        .query_executions(&ExecutionFilter::all().job("tick"))
        .await
        .unwrap();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].scheduled_for, Some(due));

    let job = second.get_job(&"tick".into()).await.unwrap();
    assert_eq!(job.next_fire_at, Some(due + ChronoDuration::minutes(1)));
}

/// Test: Polling every ten seconds for five minutes yields five executions.
#[tokio::test]
async fn test_one_execution_per_occurrence() {
    let storage = Arc::new(InMemoryStorage::new());
    JobService::new(storage.clone(), QueueSet::default())
        .submit_at(every_minute("tick"), t0())
        .await
        .unwrap();

    let trigger = CronTrigger::new(storage.clone());
    let mut now = t0();
    while now <= t0() + ChronoDuration::minutes(5) {
        trigger.evaluate(now).await.unwrap();
        now += ChronoDuration::seconds(10);
    }

    let execs = storage
        .query_executions(&ExecutionFilter::all().job("tick"))
        .await
        .unwrap();
    assert_eq!(execs.len(), 5);
    let mut fire_times: Vec<_> = execs.iter().filter_map(|e| e.scheduled_for).collect();
    fire_times.sort();
    let expected: Vec<_> = (1..=5).map(|m| t0() + ChronoDuration::minutes(m)).collect();
    assert_eq!(fire_times, expected);
}

/// Test: Schedules are evaluated in the job's timezone, across DST.
#[tokio::test]
async fn test_schedule_follows_job_timezone() {
    let storage = Arc::new(InMemoryStorage::new());
    let service = JobService::new(storage.clone(), QueueSet::default());
    let def = JobDefinition::recurring(
        "morning",
        "0 9 * * *",
        HttpRequest::new("POST", "http://svc/morning"),
    )
    .with_timezone("America/New_York");

    // Winter: EST is UTC-5.
    let winter = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
    service.submit_at(def.clone(), winter).await.unwrap();
    let job = service.get_job("morning").await.unwrap();
    assert_eq!(
        job.next_fire_at,
        Some(Utc.with_ymd_and_hms(2025, 1, 10, 14, 0, 0).unwrap())
    );

    // Summer: EDT is UTC-4. A new timezone-aware job recomputes its next time.
    service.cancel_recurring("morning").await.unwrap();
    let summer = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
    service.submit_at(def, summer).await.unwrap();
    let job = service.get_job("morning").await.unwrap();
    assert_eq!(
        job.next_fire_at,
        Some(Utc.with_ymd_and_hms(2025, 6, 1, 13, 0, 0).unwrap())
    );
}

/// Test: A cancelled recurring job never fires again.
#[tokio::test]
async fn test_cancelled_job_stops_firing() {
    let storage = Arc::new(InMemoryStorage::new());
    let service = JobService::new(storage.clone(), QueueSet::default());
    service.submit_at(every_minute("tick"), t0()).await.unwrap();

    let trigger = CronTrigger::new(storage.clone());
    assert_eq!(
        trigger
            .evaluate(t0() + ChronoDuration::minutes(1))
            .await
            .unwrap()
            .len(),
        1
    );

    assert!(service.cancel_recurring("tick").await.unwrap());
    assert!(
        trigger
            .evaluate(t0() + ChronoDuration::minutes(10))
            .await
            .unwrap()
            .is_empty()
    );
    assert!(!service.cancel_recurring("tick").await.unwrap());
}

/// Test: A manual trigger dispatches immediately and leaves the schedule
/// alone.
#[tokio::test]
async fn test_manual_trigger_runs_outside_schedule() {
    let storage = Arc::new(InMemoryStorage::new());
    let dispatcher = Arc::new(ScriptedDispatcher::new());
    let (handle, task) = start_engine(storage.clone(), dispatcher.clone(), fast_config()).await;

    // New Year's only.
    let def = JobDefinition::recurring(
        "yearly",
        "0 0 1 1 *",
        HttpRequest::new("POST", "http://svc/yearly"),
    );
    handle.service().submit(def).await.unwrap();
    let before = handle.service().get_job("yearly").await.unwrap();

    let id = handle.service().trigger_now("yearly").await.unwrap();
    let exec = wait_for_execution_state(
        storage.as_ref(),
        &id,
        ExecutionState::Succeeded,
        Duration::from_secs(5),
    )
    .await;
    assert!(exec.scheduled_for.is_none());
    assert_eq!(dispatcher.call_count(), 1);

    let after = handle.service().get_job("yearly").await.unwrap();
    assert_eq!(after.next_fire_at, before.next_fire_at);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}
