//! Queue priority integration tests.

use crate::common::{fast_config, start_engine, wait_until};
use chrono::Utc;
use courier::testing::ScriptedDispatcher;
use courier::{
    EngineConfig, HttpRequest, InMemoryStorage, JobDefinition, JobService, PriorityQueue, QueueSet,
};
use std::sync::Arc;
use std::time::Duration;

fn job(name: &str, queue: &str) -> JobDefinition {
    JobDefinition::fire_and_forget(name, HttpRequest::new("POST", format!("http://svc/{}", name)))
        .with_queue(queue)
}

/// Test: With one worker, ready work is dispatched strictly by queue
/// priority, then in submission order within a queue.
#[tokio::test]
async fn test_dispatch_order_follows_queue_priority() {
    let storage = Arc::new(InMemoryStorage::new());
    let dispatcher = Arc::new(ScriptedDispatcher::new());
    let config = EngineConfig {
        workers: 1,
        ..fast_config()
    };
    let (handle, task) = start_engine(storage.clone(), dispatcher.clone(), config).await;

    // Hold dispatch while the backlog builds up.
    handle.pause().await.unwrap();
    let service = handle.service();
    for (name, queue) in [
        ("low-1", "low"),
        ("low-2", "low"),
        ("normal-1", "normal"),
        ("default-1", "default"),
        ("critical-1", "critical"),
        ("low-3", "low"),
    ] {
        service.submit(job(name, queue)).await.unwrap();
    }
    handle.resume().await.unwrap();

    wait_until(Duration::from_secs(5), || dispatcher.call_count() == 6).await;
    let order: Vec<String> = dispatcher
        .requests()
        .iter()
        .map(|r| r.url.trim_start_matches("http://svc/").to_string())
        .collect();
    assert_eq!(
        order,
        vec!["critical-1", "normal-1", "low-1", "low-2", "low-3", "default-1"]
    );

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: Work that is not yet ready does not block a lower queue.
#[tokio::test]
async fn test_pending_high_priority_work_does_not_block() {
    let storage = Arc::new(InMemoryStorage::new());
    let service = JobService::new(storage.clone(), QueueSet::default());

    service
        .submit(
            JobDefinition::delayed("later", 3600, HttpRequest::new("POST", "http://svc/later"))
                .with_queue("critical"),
        )
        .await
        .unwrap();
    service.submit(job("now", "low")).await.unwrap();

    let queue = PriorityQueue::new(storage.clone(), QueueSet::default());
    let claimed = queue.dequeue(Utc::now()).await.unwrap().unwrap();
    assert_eq!(claimed.job_name.as_str(), "now");
    assert!(queue.dequeue(Utc::now()).await.unwrap().is_none());
}

/// Test: Queue order comes from configuration, not from the names.
#[tokio::test]
async fn test_custom_queue_order() {
    let storage = Arc::new(InMemoryStorage::new());
    let queues = QueueSet::new(["bulk", "interactive"]);
    let service = JobService::new(storage.clone(), queues.clone());

    service.submit(job("chat", "interactive")).await.unwrap();
    service.submit(job("export", "bulk")).await.unwrap();

    let queue = PriorityQueue::new(storage.clone(), queues);
    let first = queue.dequeue(Utc::now()).await.unwrap().unwrap();
    let second = queue.dequeue(Utc::now()).await.unwrap().unwrap();
    assert_eq!(first.job_name.as_str(), "export");
    assert_eq!(second.job_name.as_str(), "chat");
}

/// Test: Concurrent dequeues never hand the same execution to two workers.
#[tokio::test]
async fn test_concurrent_dequeue_claims_each_execution_once() {
    let storage = Arc::new(InMemoryStorage::new());
    let service = JobService::new(storage.clone(), QueueSet::default());
    for i in 0..20 {
        service
            .submit(job(&format!("job-{}", i), "normal"))
            .await
            .unwrap();
    }

    let queue = Arc::new(PriorityQueue::new(storage.clone(), QueueSet::default()));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(exec) = queue.dequeue(Utc::now()).await.unwrap() {
                claimed.push(exec.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    assert_eq!(all.len(), 20);
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 20);
}
