//! Metadata Store adapters: durable mirror of the worker registry plus the
//! task and attempt ledger tables.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PoolSettings, PostgresStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskhub_core::api::WorkerStats;
use taskhub_core::{Attempt, HubError, Task, TaskFilter, TaskStatus, WorkerConfig};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

impl From<PersistenceError> for HubError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::WorkerNotFound(name) => {
                HubError::NotFound(format!("worker {name} not found"))
            }
            PersistenceError::Validation(msg) => HubError::Validation(msg),
            other => HubError::Storage(other.to_string()),
        }
    }
}

/// Durable mirror of the worker registry.
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    /// Insert or replace the whole row keyed on `worker_name`.
    async fn upsert_worker(&self, config: &WorkerConfig) -> Result<()>;

    /// All workers ordered by name.
    async fn list_workers(&self) -> Result<Vec<WorkerConfig>>;

    async fn get_worker(&self, worker_name: &str) -> Result<Option<WorkerConfig>>;

    /// Fails with [`PersistenceError::WorkerNotFound`] for unknown workers.
    async fn update_heartbeat(&self, worker_name: &str, at: DateTime<Utc>) -> Result<()>;

    async fn delete_worker(&self, worker_name: &str) -> Result<()>;
}

/// Task rows and the append-only attempt log.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert or fully replace a task row. `created_at` of an existing row is kept.
    async fn upsert_task(&self, task: &Task) -> Result<()>;

    /// Targeted update after a terminal report. Unknown `task_id`, or an
    /// `attempt` older than the row's `last_attempt`, is a no-op.
    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        attempt: i32,
        error: &str,
        worker_name: &str,
    ) -> Result<()>;

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>>;

    /// Newest first. Uses the same predicates as [`TaskRepository::count_tasks`].
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    async fn count_tasks(&self, filter: &TaskFilter) -> Result<i64>;

    async fn insert_attempt(&self, attempt: &Attempt) -> Result<()>;

    /// Newest first by `started_at`.
    async fn list_attempts(&self, task_id: &str, limit: i64) -> Result<Vec<Attempt>>;

    /// `status = fail` rows, newest first.
    async fn list_failed_tasks(&self, worker_name: Option<&str>, limit: i64) -> Result<Vec<Task>>;

    async fn worker_stats(&self, worker_name: &str) -> Result<WorkerStats>;

    async fn ping(&self) -> Result<()>;
}

/// Everything the control plane persists.
pub trait MetadataStore: WorkerRepository + TaskRepository {}

impl<T: WorkerRepository + TaskRepository> MetadataStore for T {}

fn ensure_task_id(task: &Task) -> Result<()> {
    if task.task_id.is_empty() {
        return Err(PersistenceError::Validation("task_id is required".into()));
    }
    Ok(())
}
