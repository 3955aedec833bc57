use std::sync::Arc;
use taskhub_core::api::WorkerStats;
use taskhub_core::validation::validate_task_id;
use taskhub_core::{Attempt, AttemptReport, HubError, Result, Task, TaskFilter, TaskStatus};
use taskhub_persistence::MetadataStore;
use tracing::{debug, warn};

/// What a report did to the task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportEffect {
    /// Attempt appended and task row moved to the reported status
    Applied,
    /// Attempt appended, task row left as it was
    Recorded,
}

/// Owner of Task and Attempt rows and the status state machine.
///
/// Every call goes straight to the metadata store; there is no cache.
pub struct TaskLedger {
    store: Arc<dyn MetadataStore>,
}

impl TaskLedger {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        TaskLedger { store }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub async fn upsert_task(&self, task: &Task) -> Result<()> {
        if task.task_id.is_empty() {
            return Err(HubError::Validation("task_id is required".into()));
        }
        Ok(self.store.upsert_task(task).await?)
    }

    /// No-op for an unknown `task_id`.
    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        attempt: i32,
        error: &str,
        worker_name: &str,
    ) -> Result<()> {
        Ok(self
            .store
            .update_task_status(task_id, status, attempt, error, worker_name)
            .await?)
    }

    pub async fn insert_attempt(&self, attempt: &Attempt) -> Result<()> {
        Ok(self.store.insert_attempt(attempt).await?)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| HubError::NotFound(format!("task {task_id} not found")))
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(self.store.list_tasks(filter).await?)
    }

    pub async fn count_tasks(&self, filter: &TaskFilter) -> Result<i64> {
        Ok(self.store.count_tasks(filter).await?)
    }

    pub async fn list_attempts(&self, task_id: &str, limit: i64) -> Result<Vec<Attempt>> {
        Ok(self.store.list_attempts(task_id, limit).await?)
    }

    pub async fn list_failed_tasks(&self, worker_name: Option<&str>, limit: i64) -> Result<Vec<Task>> {
        Ok(self.store.list_failed_tasks(worker_name, limit).await?)
    }

    pub async fn worker_stats(&self, worker_name: &str) -> Result<WorkerStats> {
        Ok(self.store.worker_stats(worker_name).await?)
    }

    /// Record one report for one attempt.
    ///
    /// The attempt row is always appended. A report for an attempt older than
    /// the task's `last_attempt` never touches the task row. A `running` report
    /// only moves a `pending` task; a terminal report moves the task when the
    /// state machine allows it. Store failures are returned, never swallowed.
    pub async fn report_attempt(&self, task_id: &str, report: AttemptReport) -> Result<ReportEffect> {
        validate_task_id(task_id)?;
        report.validate()?;

        let task = self.get_task(task_id).await?;
        let status = report.status;
        let attempt_no = report.attempt;
        let error = report.error.clone();
        let worker_name = report.worker_name.clone();

        self.insert_attempt(&report.into_attempt(task_id)).await?;

        if attempt_no < task.last_attempt {
            debug!(
                task_id,
                attempt = attempt_no,
                last_attempt = task.last_attempt,
                status = %status,
                "Stale attempt report left task unchanged"
            );
            return Ok(ReportEffect::Recorded);
        }

        let apply = match status {
            TaskStatus::Running => task.status == TaskStatus::Pending,
            next => task.status.can_transition_to(next),
        };

        if !apply {
            if status.is_terminal() {
                warn!(
                    task_id,
                    attempt = attempt_no,
                    from = %task.status,
                    to = %status,
                    "Ignoring illegal status transition"
                );
            } else {
                debug!(task_id, attempt = attempt_no, current = %task.status, "Running report left task unchanged");
            }
            return Ok(ReportEffect::Recorded);
        }

        let error = if status == TaskStatus::Running {
            task.last_error.as_str()
        } else {
            error.as_str()
        };
        self.update_task_status(task_id, status, attempt_no, error, &worker_name)
            .await?;

        debug!(task_id, attempt = attempt_no, status = %status, "Task status updated");
        Ok(ReportEffect::Applied)
    }
}
