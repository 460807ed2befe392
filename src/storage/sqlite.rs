//! SQLite storage implementation.
//!
//! Provides durable storage using a SQLite database in WAL mode with full
//! synchronous commits, so every acknowledged write survives a crash.
//! Conditional writes are single `UPDATE ... WHERE` statements or short
//! transactions, which lets several engine processes share one database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Sqlite};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::{
    ExecutionFilter, ExecutionState, Firing, Storage, StorageError, StoredExecution, StoredJob,
    Transition,
};
use crate::core::job::{HttpRequest, JobDefinition, JobType};
use crate::core::types::{ExecutionId, JobName, QueueName};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(db_err)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(db_err)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn job_version(&self, name: &JobName) -> Result<Option<i64>, StorageError> {
        sqlx::query_scalar("SELECT version FROM jobs WHERE name = ?")
            .bind(name.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn execution_state(
        &self,
        id: &ExecutionId,
    ) -> Result<Option<(String, i64)>, StorageError> {
        sqlx::query_as("SELECT state, version FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }
}

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::SerializationError(format!("invalid timestamp: {}", millis)))
}

fn from_millis_opt(millis: Option<i64>) -> Result<Option<DateTime<Utc>>, StorageError> {
    millis.map(from_millis).transpose()
}

fn encode_headers(headers: &BTreeMap<String, String>) -> Result<String, StorageError> {
    serde_json::to_string(headers).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode_headers(json: &str) -> Result<BTreeMap<String, String>, StorageError> {
    serde_json::from_str(json).map_err(|e| StorageError::SerializationError(e.to_string()))
}

#[derive(sqlx::FromRow)]
struct JobRow {
    name: String,
    job_type: String,
    cron_expression: Option<String>,
    timezone: Option<String>,
    delay_seconds: Option<i64>,
    method: String,
    url: String,
    headers: String,
    body: Vec<u8>,
    queue: String,
    max_retries: i64,
    next_fire_at: Option<i64>,
    last_fired_at: Option<i64>,
    version: i64,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<JobRow> for StoredJob {
    type Error = StorageError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let job_type = JobType::from_str(&row.job_type).map_err(StorageError::SerializationError)?;
        let definition = JobDefinition {
            name: JobName::new(row.name),
            job_type,
            cron_expression: row.cron_expression,
            timezone: row.timezone,
            delay_seconds: row.delay_seconds.map(|d| d as u64),
            request: HttpRequest {
                method: row.method,
                url: row.url,
                headers: decode_headers(&row.headers)?,
                body: row.body,
            },
            queue: QueueName::new(row.queue),
            max_retries: row.max_retries as u32,
        };
        Ok(StoredJob {
            definition,
            next_fire_at: from_millis_opt(row.next_fire_at)?,
            last_fired_at: from_millis_opt(row.last_fired_at)?,
            version: row.version as u64,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: String,
    job_name: String,
    state: String,
    queue: String,
    method: String,
    url: String,
    headers: String,
    body: Vec<u8>,
    max_retries: i64,
    ready_at: i64,
    scheduled_for: Option<i64>,
    attempt_count: i64,
    last_error: Option<String>,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
    version: i64,
}

impl TryFrom<ExecutionRow> for StoredExecution {
    type Error = StorageError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        let id = ExecutionId::from_str(&row.id)
            .map_err(|e| StorageError::SerializationError(format!("invalid uuid: {}", e)))?;
        Ok(StoredExecution {
            id,
            job_name: JobName::new(row.job_name),
            state: row.state.parse()?,
            queue: QueueName::new(row.queue),
            request: HttpRequest {
                method: row.method,
                url: row.url,
                headers: decode_headers(&row.headers)?,
                body: row.body,
            },
            max_retries: row.max_retries as u32,
            ready_at: from_millis(row.ready_at)?,
            scheduled_for: from_millis_opt(row.scheduled_for)?,
            attempt_count: row.attempt_count as u32,
            last_error: row.last_error,
            started_at: from_millis_opt(row.started_at)?,
            finished_at: from_millis_opt(row.finished_at)?,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            version: row.version as u64,
        })
    }
}

fn rows_to_executions(rows: Vec<ExecutionRow>) -> Result<Vec<StoredExecution>, StorageError> {
    rows.into_iter().map(StoredExecution::try_from).collect()
}

const INSERT_EXECUTION: &str = r#"
    INSERT INTO executions (
        id, job_name, state, queue, method, url, headers, body, max_retries,
        ready_at, scheduled_for, attempt_count, last_error, started_at, finished_at,
        created_at, updated_at, version
    )
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

async fn insert_execution<'e, E>(executor: E, execution: &StoredExecution) -> Result<(), StorageError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(INSERT_EXECUTION)
        .bind(execution.id.to_string())
        .bind(execution.job_name.as_str())
        .bind(execution.state.as_str())
        .bind(execution.queue.as_str())
        .bind(&execution.request.method)
        .bind(&execution.request.url)
        .bind(encode_headers(&execution.request.headers)?)
        .bind(&execution.request.body)
        .bind(execution.max_retries as i64)
        .bind(to_millis(execution.ready_at))
        .bind(execution.scheduled_for.map(to_millis))
        .bind(execution.attempt_count as i64)
        .bind(&execution.last_error)
        .bind(execution.started_at.map(to_millis))
        .bind(execution.finished_at.map(to_millis))
        .bind(to_millis(execution.created_at))
        .bind(to_millis(execution.updated_at))
        .bind(execution.version as i64)
        .execute(executor)
        .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
            StorageError::DuplicateKey(format!("execution: {}", execution.id)),
        ),
        Err(e) => Err(db_err(e)),
    }
}

const INSERT_JOB: &str = r#"
    INSERT INTO jobs (
        name, job_type, cron_expression, timezone, delay_seconds, method, url, headers,
        body, queue, max_retries, next_fire_at, last_fired_at, version, created_at, updated_at
    )
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

async fn insert_job<'e, E>(executor: E, job: &StoredJob) -> Result<(), StorageError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let def = &job.definition;
    let result = sqlx::query(INSERT_JOB)
        .bind(def.name.as_str())
        .bind(def.job_type.as_str())
        .bind(&def.cron_expression)
        .bind(&def.timezone)
        .bind(def.delay_seconds.map(|d| d as i64))
        .bind(&def.request.method)
        .bind(&def.request.url)
        .bind(encode_headers(&def.request.headers)?)
        .bind(&def.request.body)
        .bind(def.queue.as_str())
        .bind(def.max_retries as i64)
        .bind(job.next_fire_at.map(to_millis))
        .bind(job.last_fired_at.map(to_millis))
        .bind(job.version as i64)
        .bind(to_millis(job.created_at))
        .bind(to_millis(job.updated_at))
        .execute(executor)
        .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            Err(StorageError::DuplicateKey(format!("job: {}", def.name)))
        }
        Err(e) => Err(db_err(e)),
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn put_job(
        &self,
        mut job: StoredJob,
        expected_version: Option<u64>,
    ) -> Result<StoredJob, StorageError> {
        let Some(version) = expected_version else {
            job.version = 1;
            insert_job(&self.pool, &job).await?;
            return Ok(job);
        };

        job.version = version + 1;
        let def = &job.definition;
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                job_type = ?, cron_expression = ?, timezone = ?, delay_seconds = ?,
                method = ?, url = ?, headers = ?, body = ?, queue = ?, max_retries = ?,
                next_fire_at = ?, last_fired_at = ?, version = ?, updated_at = ?
            WHERE name = ? AND version = ?
            "#,
        )
        .bind(def.job_type.as_str())
        .bind(&def.cron_expression)
        .bind(&def.timezone)
        .bind(def.delay_seconds.map(|d| d as i64))
        .bind(&def.request.method)
        .bind(&def.request.url)
        .bind(encode_headers(&def.request.headers)?)
        .bind(&def.request.body)
        .bind(def.queue.as_str())
        .bind(def.max_retries as i64)
        .bind(job.next_fire_at.map(to_millis))
        .bind(job.last_fired_at.map(to_millis))
        .bind(job.version as i64)
        .bind(to_millis(job.updated_at))
        .bind(def.name.as_str())
        .bind(version as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return match self.job_version(job.name()).await? {
                Some(current) => Err(StorageError::Conflict(format!(
                    "job {} is at version {}, expected {}",
                    job.name(),
                    current,
                    version
                ))),
                None => Err(StorageError::NotFound(format!("job: {}", job.name()))),
            };
        }
        Ok(job)
    }

    async fn get_job(&self, name: &JobName) -> Result<StoredJob, StorageError> {
        let row: JobRow = sqlx::query_as("SELECT * FROM jobs WHERE name = ?")
            .bind(name.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", name)))?;
        row.try_into()
    }

    async fn list_jobs(&self) -> Result<Vec<StoredJob>, StorageError> {
        let rows: Vec<JobRow> = sqlx::query_as("SELECT * FROM jobs ORDER BY created_at, name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(StoredJob::try_from).collect()
    }

    async fn delete_job(
        &self,
        name: &JobName,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionId>, StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let deleted = sqlx::query("DELETE FROM jobs WHERE name = ?")
            .bind(name.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if deleted.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("job: {}", name)));
        }

        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE executions
            SET state = 'cancelled', finished_at = ?, updated_at = ?, version = version + 1
            WHERE job_name = ? AND state IN ('pending', 'enqueued')
            RETURNING id
            "#,
        )
        .bind(to_millis(now))
        .bind(to_millis(now))
        .bind(name.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        let mut cancelled = ids
            .iter()
            .map(|id| {
                ExecutionId::from_str(id)
                    .map_err(|e| StorageError::SerializationError(format!("invalid uuid: {}", e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        cancelled.sort();
        Ok(cancelled)
    }

    async fn release_job(&self, name: &JobName) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE name = ? AND job_type != 'recurring'
              AND NOT EXISTS (
                  SELECT 1 FROM executions
                  WHERE job_name = ? AND state IN ('pending', 'enqueued', 'running')
              )
            "#,
        )
        .bind(name.as_str())
        .bind(name.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn enqueue_one_shot(
        &self,
        mut job: StoredJob,
        execution: StoredExecution,
    ) -> Result<StoredJob, StorageError> {
        job.version = 1;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        insert_job(&mut *tx, &job).await?;
        insert_execution(&mut *tx, &execution).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(job)
    }

    async fn due_recurring_jobs(&self, now: DateTime<Utc>) -> Result<Vec<StoredJob>, StorageError> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT * FROM jobs
            WHERE job_type = 'recurring' AND next_fire_at IS NOT NULL AND next_fire_at <= ?
            ORDER BY next_fire_at
            "#,
        )
        .bind(to_millis(now))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(StoredJob::try_from).collect()
    }

    async fn fire_recurring(&self, firing: Firing) -> Result<StoredJob, StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row: Option<JobRow> = sqlx::query_as(
            r#"
            UPDATE jobs
            SET next_fire_at = ?, last_fired_at = ?, updated_at = ?, version = version + 1
            WHERE name = ? AND next_fire_at = ?
            RETURNING *
            "#,
        )
        .bind(to_millis(firing.next_fire_at))
        .bind(to_millis(firing.expected_next_fire_at))
        .bind(to_millis(firing.fired_at))
        .bind(firing.job_name.as_str())
        .bind(to_millis(firing.expected_next_fire_at))
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            drop(tx);
            return match self.job_version(&firing.job_name).await? {
                Some(_) => Err(StorageError::Conflict(format!(
                    "job {} already fired for {}",
                    firing.job_name, firing.expected_next_fire_at
                ))),
                None => Err(StorageError::NotFound(format!("job: {}", firing.job_name))),
            };
        };

        match insert_execution(&mut *tx, &firing.execution).await {
            Ok(()) => {}
            Err(StorageError::DuplicateKey(_)) => {
                return Err(StorageError::Conflict(format!(
                    "job {} already has an execution for {}",
                    firing.job_name, firing.expected_next_fire_at
                )));
            }
            Err(e) => return Err(e),
        }
        tx.commit().await.map_err(db_err)?;
        row.try_into()
    }

    async fn create_execution(&self, execution: StoredExecution) -> Result<(), StorageError> {
        insert_execution(&self.pool, &execution).await
    }

    async fn get_execution(&self, id: &ExecutionId) -> Result<StoredExecution, StorageError> {
        let row: ExecutionRow = sqlx::query_as("SELECT * FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StorageError::NotFound(format!("execution: {}", id)))?;
        row.try_into()
    }

    async fn transition(&self, transition: Transition) -> Result<StoredExecution, StorageError> {
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE executions SET state = ");
        query.push_bind(transition.to.as_str());
        if let Some(attempts) = transition.attempt_count {
            query.push(", attempt_count = ").push_bind(attempts as i64);
        }
        if let Some(ready_at) = transition.ready_at {
            query.push(", ready_at = ").push_bind(to_millis(ready_at));
        }
        if let Some(error) = &transition.last_error {
            query.push(", last_error = ").push_bind(error.clone());
        }
        if let Some(started_at) = transition.started_at {
            query.push(", started_at = ").push_bind(to_millis(started_at));
        }
        if let Some(finished_at) = transition.finished_at {
            query.push(", finished_at = ").push_bind(to_millis(finished_at));
        }
        query
            .push(", updated_at = ")
            .push_bind(to_millis(transition.at))
            .push(", version = version + 1 WHERE id = ")
            .push_bind(transition.id.to_string())
            .push(" AND state = ")
            .push_bind(transition.from.as_str());
        if let Some(version) = transition.expected_version {
            query.push(" AND version = ").push_bind(version as i64);
        }
        query.push(" RETURNING *");

        let row: Option<ExecutionRow> = query
            .build_query_as::<ExecutionRow>()
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => row.try_into(),
            None => match self.execution_state(&transition.id).await? {
                Some((state, version)) => Err(StorageError::Conflict(format!(
                    "execution {} is {} at version {}, expected {}",
                    transition.id, state, version, transition.from
                ))),
                None => Err(StorageError::NotFound(format!(
                    "execution: {}",
                    transition.id
                ))),
            },
        }
    }

    async fn ready_executions(
        &self,
        queue: &QueueName,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredExecution>, StorageError> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(
            r#"
            SELECT * FROM executions
            WHERE queue = ? AND state IN ('pending', 'enqueued') AND ready_at <= ?
            ORDER BY ready_at, created_at, id
            LIMIT ?
            "#,
        )
        .bind(queue.as_str())
        .bind(to_millis(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows_to_executions(rows)
    }

    async fn stale_running(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<StoredExecution>, StorageError> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(
            r#"
            SELECT * FROM executions
            WHERE state = 'running' AND (started_at IS NULL OR started_at < ?)
            ORDER BY started_at
            "#,
        )
        .bind(to_millis(started_before))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows_to_executions(rows)
    }

    async fn query_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<StoredExecution>, StorageError> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM executions WHERE 1 = 1");
        if let Some(name) = &filter.job_name {
            query.push(" AND job_name = ").push_bind(name.as_str().to_string());
        }
        if let Some(queue) = &filter.queue {
            query.push(" AND queue = ").push_bind(queue.as_str().to_string());
        }
        if !filter.states.is_empty() {
            query.push(" AND state IN (");
            let mut separated = query.separated(", ");
            for state in &filter.states {
                separated.push_bind(state.as_str());
            }
            separated.push_unseparated(")");
        }
        query.push(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows: Vec<ExecutionRow> = query
            .build_query_as::<ExecutionRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows_to_executions(rows)
    }
}
