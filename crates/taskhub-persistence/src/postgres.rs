use crate::{ensure_task_id, PersistenceError, Result, TaskRepository, WorkerRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use std::time::Duration;
use taskhub_core::api::WorkerStats;
use taskhub_core::task::{
    clamp_limit, DEFAULT_FAILED_LIMIT, DEFAULT_LIST_LIMIT, MAX_FAILED_LIMIT, MAX_LIST_LIMIT,
};
use taskhub_core::{Attempt, QueueGroup, Task, TaskFilter, TaskStatus, WorkerConfig};
use tracing::info;

const SCHEMA: &str = include_str!("../migrations/0001_init.sql");

const TASK_COLUMNS: &str = "task_id, worker_name, queue, priority, priority_name, payload, status, \
     last_attempt, last_error, last_worker_name, created_at, updated_at";

/// Connection pool sizing.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl PoolSettings {
    pub fn new(url: impl Into<String>) -> Self {
        PoolSettings {
            url: url.into(),
            max_connections: 20,
            min_connections: 5,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

#[derive(FromRow)]
struct WorkerRow {
    worker_name: String,
    base_url: Option<String>,
    broker_address: Option<String>,
    queue_groups: Json<Vec<QueueGroup>>,
    default_retry_count: i32,
    default_timeout_seconds: i32,
    default_delay_seconds: i32,
    is_enabled: bool,
    last_heartbeat_at: Option<DateTime<Utc>>,
}

impl From<WorkerRow> for WorkerConfig {
    fn from(row: WorkerRow) -> Self {
        WorkerConfig {
            worker_name: row.worker_name,
            base_url: row.base_url.unwrap_or_default(),
            broker_address: row.broker_address.unwrap_or_default(),
            queue_groups: row.queue_groups.0,
            default_retry_count: row.default_retry_count,
            default_timeout_seconds: row.default_timeout_seconds,
            default_delay_seconds: row.default_delay_seconds,
            is_enabled: row.is_enabled,
            last_heartbeat_at: row.last_heartbeat_at,
        }
    }
}

#[derive(FromRow)]
struct TaskRow {
    task_id: String,
    worker_name: String,
    queue: String,
    priority: i32,
    priority_name: String,
    payload: Vec<u8>,
    status: String,
    last_attempt: i32,
    last_error: Option<String>,
    last_worker_name: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        Ok(Task {
            status: parse_status(&self.status)?,
            task_id: self.task_id,
            worker_name: self.worker_name,
            queue: self.queue,
            priority: self.priority,
            priority_name: self.priority_name,
            payload: self.payload,
            last_attempt: self.last_attempt,
            last_error: self.last_error.unwrap_or_default(),
            last_worker_name: self.last_worker_name.unwrap_or_default(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct AttemptRow {
    task_id: String,
    broker_task_id: Option<String>,
    attempt: i32,
    status: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    error: Option<String>,
    worker_name: Option<String>,
    trace_id: Option<String>,
    span_id: Option<String>,
}

impl AttemptRow {
    fn into_attempt(self) -> Result<Attempt> {
        Ok(Attempt {
            status: parse_status(&self.status)?,
            task_id: self.task_id,
            broker_task_id: self.broker_task_id,
            attempt: self.attempt,
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_ms: self.duration_ms,
            error: self.error.unwrap_or_default(),
            worker_name: self.worker_name.unwrap_or_default(),
            trace_id: self.trace_id,
            span_id: self.span_id,
        })
    }
}

fn parse_status(raw: &str) -> Result<TaskStatus> {
    raw.parse().map_err(PersistenceError::InvalidRow)
}

fn non_empty(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

/// Append the WHERE clause shared by listing and counting.
fn push_task_filter(query: &mut QueryBuilder<'_, Postgres>, filter: &TaskFilter) {
    query.push(" WHERE TRUE");
    if let Some(worker_name) = &filter.worker_name {
        query.push(" AND worker_name = ").push_bind(worker_name.clone());
    }
    if let Some(status) = filter.status {
        query.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(queue) = &filter.queue {
        query.push(" AND queue = ").push_bind(queue.clone());
    }
}

/// Metadata Store backed by PostgreSQL.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(settings: &PoolSettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.acquire_timeout)
            .idle_timeout(settings.idle_timeout)
            .max_lifetime(settings.max_lifetime)
            .connect(&settings.url)
            .await?;

        info!(
            max_connections = settings.max_connections,
            min_connections = settings.min_connections,
            "Connected to metadata store"
        );
        Ok(PostgresStore { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        PostgresStore { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("Metadata store schema is up to date");
        Ok(())
    }
}

#[async_trait]
impl WorkerRepository for PostgresStore {
    async fn upsert_worker(&self, config: &WorkerConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workers (
                worker_name, base_url, broker_address, queue_groups,
                default_retry_count, default_timeout_seconds, default_delay_seconds,
                is_enabled, last_heartbeat_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
            ON CONFLICT (worker_name) DO UPDATE SET
                base_url = EXCLUDED.base_url,
                broker_address = EXCLUDED.broker_address,
                queue_groups = EXCLUDED.queue_groups,
                default_retry_count = EXCLUDED.default_retry_count,
                default_timeout_seconds = EXCLUDED.default_timeout_seconds,
                default_delay_seconds = EXCLUDED.default_delay_seconds,
                is_enabled = EXCLUDED.is_enabled,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at,
                updated_at = NOW()
            "#,
        )
        .bind(&config.worker_name)
        .bind(non_empty(&config.base_url))
        .bind(non_empty(&config.broker_address))
        .bind(Json(&config.queue_groups))
        .bind(config.default_retry_count)
        .bind(config.default_timeout_seconds)
        .bind(config.default_delay_seconds)
        .bind(config.is_enabled)
        .bind(config.last_heartbeat_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerConfig>> {
        let rows: Vec<WorkerRow> = sqlx::query_as(
            r#"
            SELECT worker_name, base_url, broker_address, queue_groups,
                   default_retry_count, default_timeout_seconds, default_delay_seconds,
                   is_enabled, last_heartbeat_at
            FROM workers
            ORDER BY worker_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(WorkerConfig::from).collect())
    }

    async fn get_worker(&self, worker_name: &str) -> Result<Option<WorkerConfig>> {
        let row: Option<WorkerRow> = sqlx::query_as(
            r#"
            SELECT worker_name, base_url, broker_address, queue_groups,
                   default_retry_count, default_timeout_seconds, default_delay_seconds,
                   is_enabled, last_heartbeat_at
            FROM workers
            WHERE worker_name = $1
            "#,
        )
        .bind(worker_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(WorkerConfig::from))
    }

    async fn update_heartbeat(&self, worker_name: &str, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE workers SET last_heartbeat_at = $2, updated_at = NOW() WHERE worker_name = $1",
        )
        .bind(worker_name)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::WorkerNotFound(worker_name.to_string()));
        }
        Ok(())
    }

    async fn delete_worker(&self, worker_name: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM workers WHERE worker_name = $1")
            .bind(worker_name)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::WorkerNotFound(worker_name.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for PostgresStore {
    async fn upsert_task(&self, task: &Task) -> Result<()> {
        ensure_task_id(task)?;
        sqlx::query(
            r#"
            INSERT INTO tasks (
                task_id, worker_name, queue, priority, priority_name, payload, status,
                last_attempt, last_error, last_worker_name, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
            ON CONFLICT (task_id) DO UPDATE SET
                worker_name = EXCLUDED.worker_name,
                queue = EXCLUDED.queue,
                priority = EXCLUDED.priority,
                priority_name = EXCLUDED.priority_name,
                payload = EXCLUDED.payload,
                status = EXCLUDED.status,
                last_attempt = EXCLUDED.last_attempt,
                last_error = EXCLUDED.last_error,
                last_worker_name = EXCLUDED.last_worker_name,
                updated_at = NOW()
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.worker_name)
        .bind(&task.queue)
        .bind(task.priority)
        .bind(&task.priority_name)
        .bind(&task.payload)
        .bind(task.status.as_str())
        .bind(task.last_attempt)
        .bind(non_empty(&task.last_error))
        .bind(non_empty(&task.last_worker_name))
        .bind(task.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        attempt: i32,
        error: &str,
        worker_name: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks SET
                status = $2,
                last_attempt = $3,
                last_error = $4,
                last_worker_name = $5,
                updated_at = NOW()
            WHERE task_id = $1 AND last_attempt <= $3
            "#,
        )
        .bind(task_id)
        .bind(status.as_str())
        .bind(attempt)
        .bind(non_empty(error))
        .bind(non_empty(worker_name))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = $1"))
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TaskRow::into_task).transpose()
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let filter = filter.clone().normalized();
        let mut query = QueryBuilder::<Postgres>::new(format!("SELECT {TASK_COLUMNS} FROM tasks"));
        push_task_filter(&mut query, &filter);
        query
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(filter.limit)
            .push(" OFFSET ")
            .push_bind(filter.offset);

        let rows: Vec<TaskRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    async fn count_tasks(&self, filter: &TaskFilter) -> Result<i64> {
        let filter = filter.clone().normalized();
        let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM tasks");
        push_task_filter(&mut query, &filter);

        let (count,): (i64,) = query.build_query_as().fetch_one(&self.pool).await?;
        Ok(count)
    }

    async fn insert_attempt(&self, attempt: &Attempt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_attempts (
                task_id, broker_task_id, attempt, status, started_at, finished_at,
                duration_ms, error, worker_name, trace_id, span_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&attempt.task_id)
        .bind(&attempt.broker_task_id)
        .bind(attempt.attempt)
        .bind(attempt.status.as_str())
        .bind(attempt.started_at)
        .bind(attempt.finished_at)
        .bind(attempt.duration_ms)
        .bind(non_empty(&attempt.error))
        .bind(non_empty(&attempt.worker_name))
        .bind(&attempt.trace_id)
        .bind(&attempt.span_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_attempts(&self, task_id: &str, limit: i64) -> Result<Vec<Attempt>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(
            r#"
            SELECT task_id, broker_task_id, attempt, status, started_at, finished_at,
                   duration_ms, error, worker_name, trace_id, span_id
            FROM task_attempts
            WHERE task_id = $1
            ORDER BY started_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(task_id)
        .bind(clamp_limit(limit, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AttemptRow::into_attempt).collect()
    }

    async fn list_failed_tasks(&self, worker_name: Option<&str>, limit: i64) -> Result<Vec<Task>> {
        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'fail'"
        ));
        if let Some(worker_name) = worker_name.filter(|w| !w.is_empty()) {
            query.push(" AND worker_name = ").push_bind(worker_name.to_string());
        }
        query
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(clamp_limit(limit, DEFAULT_FAILED_LIMIT, MAX_FAILED_LIMIT));

        let rows: Vec<TaskRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    async fn worker_stats(&self, worker_name: &str) -> Result<WorkerStats> {
        let mut stats = WorkerStats {
            worker_name: worker_name.to_string(),
            ..Default::default()
        };

        let by_status: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM tasks WHERE worker_name = $1 GROUP BY status",
        )
        .bind(worker_name)
        .fetch_all(&self.pool)
        .await?;
        for (status, count) in by_status {
            stats.total += count;
            stats.by_status.insert(status, count);
        }

        let by_queue: Vec<(String, i64)> = sqlx::query_as(
            "SELECT queue, COUNT(*) FROM tasks WHERE worker_name = $1 GROUP BY queue",
        )
        .bind(worker_name)
        .fetch_all(&self.pool)
        .await?;
        stats.by_queue.extend(by_queue);

        let (avg,): (f64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(AVG(a.duration_ms), 0)::float8
            FROM task_attempts a
            JOIN tasks t ON t.task_id = a.task_id
            WHERE t.worker_name = $1 AND a.status = 'success' AND a.duration_ms IS NOT NULL
            "#,
        )
        .bind(worker_name)
        .fetch_one(&self.pool)
        .await?;
        stats.avg_duration_ms = avg;

        stats.compute_success_rate();
        Ok(stats)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
