//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{
    ExecutionFilter, ExecutionState, Firing, Storage, StorageError, StoredExecution, StoredJob,
    Transition,
};
use crate::core::job::JobType;
use crate::core::types::{ExecutionId, JobName, QueueName};

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobName, StoredJob>,
    executions: HashMap<ExecutionId, StoredExecution>,
}

impl Inner {
    fn has_live_executions(&self, name: &JobName) -> bool {
        self.executions
            .values()
            .any(|e| &e.job_name == name && !e.state.is_terminal())
    }

    fn insert_execution(&mut self, execution: StoredExecution) -> Result<(), StorageError> {
        if self.executions.contains_key(&execution.id) {
            return Err(StorageError::DuplicateKey(format!(
                "execution: {}",
                execution.id
            )));
        }
        self.executions.insert(execution.id, execution);
        Ok(())
    }
}

/// In-memory storage backend.
///
/// Jobs and executions live behind one lock so multi-record writes are
/// atomic. Data is not persisted across restarts.
pub struct InMemoryStorage {
    inner: RwLock<Inner>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StorageError> {
        self.inner.read().map_err(|_| StorageError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StorageError> {
        self.inner.write().map_err(|_| StorageError::LockPoisoned)
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn put_job(
        &self,
        mut job: StoredJob,
        expected_version: Option<u64>,
    ) -> Result<StoredJob, StorageError> {
        let mut inner = self.write()?;
        let current = inner.jobs.get(job.name());
        match (current, expected_version) {
            (Some(_), None) => {
                return Err(StorageError::DuplicateKey(format!("job: {}", job.name())));
            }
            (None, Some(_)) => {
                return Err(StorageError::NotFound(format!("job: {}", job.name())));
            }
            (Some(current), Some(version)) if current.version != version => {
                return Err(StorageError::Conflict(format!(
                    "job {} is at version {}, expected {}",
                    job.name(),
                    current.version,
                    version
                )));
            }
            _ => {}
        }
        job.version = expected_version.unwrap_or(0) + 1;
        inner.jobs.insert(job.name().clone(), job.clone());
        Ok(job)
    }

    async fn get_job(&self, name: &JobName) -> Result<StoredJob, StorageError> {
        let inner = self.read()?;
        inner
            .jobs
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", name)))
    }

    async fn list_jobs(&self) -> Result<Vec<StoredJob>, StorageError> {
        let inner = self.read()?;
        let mut result: Vec<_> = inner.jobs.values().cloned().collect();
        result.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name().cmp(b.name()))
        });
        Ok(result)
    }

    async fn delete_job(
        &self,
        name: &JobName,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionId>, StorageError> {
        let mut inner = self.write()?;
        inner
            .jobs
            .remove(name)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", name)))?;

        let mut cancelled = Vec::new();
        for execution in inner.executions.values_mut() {
            if &execution.job_name == name && execution.state.is_dispatchable() {
                let transition =
                    Transition::new(execution.id, execution.state, ExecutionState::Cancelled, now)
                        .finished_at(now);
                execution.apply(&transition);
                cancelled.push(execution.id);
            }
        }
        cancelled.sort();
        Ok(cancelled)
    }

    async fn release_job(&self, name: &JobName) -> Result<bool, StorageError> {
        let mut inner = self.write()?;
        let releasable = match inner.jobs.get(name) {
            Some(job) => job.job_type().is_one_shot() && !inner.has_live_executions(name),
            None => false,
        };
        if releasable {
            inner.jobs.remove(name);
        }
        Ok(releasable)
    }

    async fn enqueue_one_shot(
        &self,
        mut job: StoredJob,
        execution: StoredExecution,
    ) -> Result<StoredJob, StorageError> {
        let mut inner = self.write()?;
        if inner.jobs.contains_key(job.name()) {
            return Err(StorageError::DuplicateKey(format!("job: {}", job.name())));
        }
        inner.insert_execution(execution)?;
        job.version = 1;
        inner.jobs.insert(job.name().clone(), job.clone());
        Ok(job)
    }

    async fn due_recurring_jobs(&self, now: DateTime<Utc>) -> Result<Vec<StoredJob>, StorageError> {
        let inner = self.read()?;
        let mut result: Vec<_> = inner
            .jobs
            .values()
            .filter(|job| job.job_type() == JobType::Recurring)
            .filter(|job| job.next_fire_at.is_some_and(|t| t <= now))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.next_fire_at.cmp(&b.next_fire_at));
        Ok(result)
    }

    async fn fire_recurring(&self, firing: Firing) -> Result<StoredJob, StorageError> {
        let mut inner = self.write()?;
        let job = inner
            .jobs
            .get(&firing.job_name)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", firing.job_name)))?;
        if job.next_fire_at != Some(firing.expected_next_fire_at) {
            return Err(StorageError::Conflict(format!(
                "job {} already fired for {}",
                firing.job_name, firing.expected_next_fire_at
            )));
        }

        let mut updated = job.clone();
        updated.next_fire_at = Some(firing.next_fire_at);
        updated.last_fired_at = Some(firing.expected_next_fire_at);
        updated.updated_at = firing.fired_at;
        updated.version += 1;

        inner.insert_execution(firing.execution)?;
        inner.jobs.insert(firing.job_name, updated.clone());
        Ok(updated)
    }

    async fn create_execution(&self, execution: StoredExecution) -> Result<(), StorageError> {
        let mut inner = self.write()?;
        inner.insert_execution(execution)
    }

    async fn get_execution(&self, id: &ExecutionId) -> Result<StoredExecution, StorageError> {
        let inner = self.read()?;
        inner
            .executions
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("execution: {}", id)))
    }

    async fn transition(&self, transition: Transition) -> Result<StoredExecution, StorageError> {
        let mut inner = self.write()?;
        let execution = inner
            .executions
            .get_mut(&transition.id)
            .ok_or_else(|| StorageError::NotFound(format!("execution: {}", transition.id)))?;
        transition.check(execution)?;
        execution.apply(&transition);
        Ok(execution.clone())
    }

    async fn ready_executions(
        &self,
        queue: &QueueName,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredExecution>, StorageError> {
        let inner = self.read()?;
        let mut result: Vec<_> = inner
            .executions
            .values()
            .filter(|e| &e.queue == queue && e.state.is_dispatchable() && e.ready_at <= now)
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            a.ready_at
                .cmp(&b.ready_at)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        result.truncate(limit);
        Ok(result)
    }

    async fn stale_running(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<StoredExecution>, StorageError> {
        let inner = self.read()?;
        let mut result: Vec<_> = inner
            .executions
            .values()
            .filter(|e| e.state == ExecutionState::Running)
            .filter(|e| e.started_at.is_none_or(|t| t < started_before))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(result)
    }

    async fn query_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<StoredExecution>, StorageError> {
        let inner = self.read()?;
        let mut result: Vec<_> = inner
            .executions
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        // Most recent first
        result.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::{HttpRequest, JobDefinition};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    fn ping() -> JobDefinition {
        JobDefinition::fire_and_forget("ping", HttpRequest::new("GET", "http://localhost/ping"))
    }

    fn hourly() -> JobDefinition {
        JobDefinition::recurring(
            "hourly",
            "0 * * * *",
            HttpRequest::new("POST", "http://localhost/hourly"),
        )
    }

    #[tokio::test]
    async fn test_put_and_get_job() {
        let storage = InMemoryStorage::new();
        let stored = storage
            .put_job(StoredJob::new(hourly(), t0()), None)
            .await
            .unwrap();
        assert_eq!(stored.version, 1);

        let retrieved = storage.get_job(&JobName::new("hourly")).await.unwrap();
        assert_eq!(retrieved, stored);
    }

    #[tokio::test]
    async fn test_put_job_insert_twice_is_duplicate() {
        let storage = InMemoryStorage::new();
        storage
            .put_job(StoredJob::new(hourly(), t0()), None)
            .await
            .unwrap();
        let result = storage.put_job(StoredJob::new(hourly(), t0()), None).await;
        assert!(matches!(result, Err(StorageError::DuplicateKey(_))));
    }

    #[tokio::test]
    async fn test_put_job_replace_requires_matching_version() {
        let storage = InMemoryStorage::new();
        let stored = storage
            .put_job(StoredJob::new(hourly(), t0()), None)
            .await
            .unwrap();

        let replaced = storage.put_job(stored.clone(), Some(1)).await.unwrap();
        assert_eq!(replaced.version, 2);

        let stale = storage.put_job(stored, Some(1)).await;
        assert!(matches!(stale, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_delete_job_cancels_only_waiting_executions() {
        let storage = InMemoryStorage::new();
        let def = hourly();
        storage
            .put_job(StoredJob::new(def.clone(), t0()), None)
            .await
            .unwrap();

        let pending = StoredExecution::new(&def, ExecutionState::Pending, t0(), t0());
        let running = StoredExecution::new(&def, ExecutionState::Running, t0(), t0());
        let done = StoredExecution::new(&def, ExecutionState::Succeeded, t0(), t0());
        for e in [&pending, &running, &done] {
            storage.create_execution(e.clone()).await.unwrap();
        }

        let cancelled = storage
            .delete_job(&JobName::new("hourly"), t0())
            .await
            .unwrap();
        assert_eq!(cancelled, vec![pending.id]);

        let state = |e: StoredExecution| e.state;
        assert_eq!(
            state(storage.get_execution(&pending.id).await.unwrap()),
            ExecutionState::Cancelled
        );
        assert_eq!(
            state(storage.get_execution(&running.id).await.unwrap()),
            ExecutionState::Running
        );
        assert_eq!(
            state(storage.get_execution(&done.id).await.unwrap()),
            ExecutionState::Succeeded
        );
        assert!(storage.get_job(&JobName::new("hourly")).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_nonexistent_job_fails() {
        let storage = InMemoryStorage::new();
        let result = storage.delete_job(&JobName::new("nope"), t0()).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_release_job_waits_for_live_executions() {
        let storage = InMemoryStorage::new();
        let def = ping();
        let exec = StoredExecution::new(&def, ExecutionState::Enqueued, t0(), t0());
        storage
            .enqueue_one_shot(StoredJob::new(def.clone(), t0()), exec.clone())
            .await
            .unwrap();

        assert!(!storage.release_job(&def.name).await.unwrap());

        storage
            .transition(Transition::new(
                exec.id,
                ExecutionState::Enqueued,
                ExecutionState::Cancelled,
                t0(),
            ))
            .await
            .unwrap();
        assert!(storage.release_job(&def.name).await.unwrap());
        assert!(storage.get_job(&def.name).await.is_err());
    }

    #[tokio::test]
    async fn test_release_never_removes_recurring_jobs() {
        let storage = InMemoryStorage::new();
        storage
            .put_job(StoredJob::new(hourly(), t0()), None)
            .await
            .unwrap();
        assert!(!storage.release_job(&JobName::new("hourly")).await.unwrap());
    }

    #[tokio::test]
    async fn test_enqueue_one_shot_rejects_existing_name() {
        let storage = InMemoryStorage::new();
        let def = ping();
        let first = StoredExecution::new(&def, ExecutionState::Enqueued, t0(), t0());
        storage
            .enqueue_one_shot(StoredJob::new(def.clone(), t0()), first)
            .await
            .unwrap();

        let second = StoredExecution::new(&def, ExecutionState::Enqueued, t0(), t0());
        let result = storage
            .enqueue_one_shot(StoredJob::new(def, t0()), second.clone())
            .await;
        assert!(matches!(result, Err(StorageError::DuplicateKey(_))));
        assert!(storage.get_execution(&second.id).await.is_err());
    }

    #[tokio::test]
    async fn test_transition_compare_and_swap() {
        let storage = InMemoryStorage::new();
        let exec = StoredExecution::new(&ping(), ExecutionState::Enqueued, t0(), t0());
        storage.create_execution(exec.clone()).await.unwrap();

        let claim = Transition::new(
            exec.id,
            ExecutionState::Enqueued,
            ExecutionState::Running,
            t0(),
        )
        .expect_version(exec.version)
        .started_at(t0());
        let running = storage.transition(claim.clone()).await.unwrap();
        assert_eq!(running.state, ExecutionState::Running);
        assert_eq!(running.started_at, Some(t0()));

        let again = storage.transition(claim).await;
        assert!(matches!(again, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_transition_unknown_execution() {
        let storage = InMemoryStorage::new();
        let result = storage
            .transition(Transition::new(
                ExecutionId::new(),
                ExecutionState::Pending,
                ExecutionState::Running,
                t0(),
            ))
            .await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_ready_executions_ordering_and_readiness() {
        let storage = InMemoryStorage::new();
        let def = ping();
        let pending_at = |offset: Duration| {
            StoredExecution::new(&def, ExecutionState::Pending, t0() + offset, t0())
        };
        let later = pending_at(Duration::seconds(5));
        let early = pending_at(Duration::seconds(-5));
        let now = StoredExecution::new(&def, ExecutionState::Enqueued, t0(), t0());
        let future = pending_at(Duration::hours(1));
        for e in [&later, &early, &now, &future] {
            storage.create_execution(e.clone()).await.unwrap();
        }

        let ready = storage
            .ready_executions(&QueueName::default(), t0() + Duration::seconds(10), 10)
            .await
            .unwrap();
        let ids: Vec<_> = ready.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![early.id, now.id, later.id]);

        let other_queue = storage
            .ready_executions(&QueueName::new("critical"), t0() + Duration::hours(2), 10)
            .await
            .unwrap();
        assert!(other_queue.is_empty());
    }

    #[tokio::test]
    async fn test_fire_recurring_is_conditional() {
        let storage = InMemoryStorage::new();
        let def = hourly();
        let fire_at = t0();
        storage
            .put_job(StoredJob::new(def.clone(), t0()).with_next_fire_at(fire_at), None)
            .await
            .unwrap();

        let firing = |exec: StoredExecution| Firing {
            job_name: def.name.clone(),
            expected_next_fire_at: fire_at,
            next_fire_at: fire_at + Duration::hours(1),
            fired_at: fire_at,
            execution: exec,
        };

        let first = StoredExecution::new(&def, ExecutionState::Pending, t0(), t0());
        let updated = storage.fire_recurring(firing(first)).await.unwrap();
        assert_eq!(updated.next_fire_at, Some(fire_at + Duration::hours(1)));
        assert_eq!(updated.last_fired_at, Some(fire_at));

        let second = StoredExecution::new(&def, ExecutionState::Pending, t0(), t0());
        let result = storage.fire_recurring(firing(second.clone())).await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
        assert!(storage.get_execution(&second.id).await.is_err());
    }

    #[tokio::test]
    async fn test_due_recurring_jobs() {
        let storage = InMemoryStorage::new();
        storage
            .put_job(StoredJob::new(hourly(), t0()).with_next_fire_at(t0()), None)
            .await
            .unwrap();

        assert!(
            storage
                .due_recurring_jobs(t0() - Duration::seconds(1))
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(storage.due_recurring_jobs(t0()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_running() {
        let storage = InMemoryStorage::new();
        let def = ping();
        let mut old = StoredExecution::new(&def, ExecutionState::Running, t0(), t0());
        old.started_at = Some(t0());
        let mut fresh = StoredExecution::new(&def, ExecutionState::Running, t0(), t0());
        fresh.started_at = Some(t0() + Duration::minutes(10));
        storage.create_execution(old.clone()).await.unwrap();
        storage.create_execution(fresh).await.unwrap();

        let stale = storage
            .stale_running(t0() + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);
    }

    #[tokio::test]
    async fn test_query_executions_newest_first_with_limit() {
        let storage = InMemoryStorage::new();
        let def = ping();
        let mut ids = Vec::new();
        for i in 0..5 {
            let exec = StoredExecution::new(
                &def,
                ExecutionState::Pending,
                t0(),
                t0() + Duration::seconds(i),
            );
            ids.push(exec.id);
            storage.create_execution(exec).await.unwrap();
        }

        let result = storage
            .query_executions(&ExecutionFilter::all().job("ping").limit(3))
            .await
            .unwrap();
        let got: Vec<_> = result.iter().map(|e| e.id).collect();
        assert_eq!(got, vec![ids[4], ids[3], ids[2]]);
    }
}
