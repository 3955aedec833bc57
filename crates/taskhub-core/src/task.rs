use crate::status::TaskStatus;
use crate::validation::validate_task_id;
use crate::{HubError, Result};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub const DEFAULT_LIST_LIMIT: i64 = 50;
pub const MAX_LIST_LIMIT: i64 = 200;
pub const DEFAULT_FAILED_LIMIT: i64 = 100;
pub const MAX_FAILED_LIMIT: i64 = 1000;

/// 128 bits from the OS generator, rendered as 32 lowercase hex chars.
pub fn new_task_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// One lineage of work, mutated in place as attempts are reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub worker_name: String,
    /// Queue group, not the full routing key
    pub queue: String,
    /// Weight of the chosen priority channel
    pub priority: i32,
    pub priority_name: String,
    /// Opaque to the control plane; only the handler interprets it
    pub payload: Vec<u8>,
    pub status: TaskStatus,
    pub last_attempt: i32,
    pub last_error: String,
    pub last_worker_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A freshly enqueued task: `pending`, no attempts yet.
    pub fn pending(
        task_id: impl Into<String>,
        worker_name: impl Into<String>,
        queue: impl Into<String>,
        priority_name: impl Into<String>,
        priority: i32,
        payload: Vec<u8>,
    ) -> Self {
        let now = Utc::now();
        Task {
            task_id: task_id.into(),
            worker_name: worker_name.into(),
            queue: queue.into(),
            priority,
            priority_name: priority_name.into(),
            payload,
            status: TaskStatus::Pending,
            last_attempt: 0,
            last_error: String::new(),
            last_worker_name: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// New lineage carrying this task's routing and payload under `new_task_id`.
    pub fn replay_as(&self, new_task_id: impl Into<String>) -> Task {
        Task::pending(
            new_task_id,
            self.worker_name.clone(),
            self.queue.clone(),
            self.priority_name.clone(),
            self.priority,
            self.payload.clone(),
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.task_id.is_empty() {
            return Err(HubError::Validation("task_id is required".into()));
        }
        validate_task_id(&self.task_id)
    }
}

/// Append-only record of one status report for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub task_id: String,
    #[serde(default)]
    pub broker_task_id: Option<String>,
    /// 1-based; equals the broker's retry counter + 1
    pub attempt: i32,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub worker_name: String,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub span_id: Option<String>,
}

/// What a worker tells the ledger about one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    pub broker_task_id: Option<String>,
    pub attempt: i32,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: String,
    pub worker_name: String,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

impl AttemptReport {
    pub fn running(attempt: i32, worker_name: impl Into<String>) -> Self {
        AttemptReport {
            broker_task_id: None,
            attempt,
            status: TaskStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            error: String::new(),
            worker_name: worker_name.into(),
            trace_id: None,
            span_id: None,
        }
    }

    /// Terminal report; `duration_ms` is derived from the two timestamps.
    pub fn finished(
        attempt: i32,
        worker_name: impl Into<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Self {
        let status = if error.is_some() {
            TaskStatus::Fail
        } else {
            TaskStatus::Success
        };
        AttemptReport {
            broker_task_id: None,
            attempt,
            status,
            started_at,
            finished_at: Some(finished_at),
            duration_ms: Some((finished_at - started_at).num_milliseconds()),
            error: error.unwrap_or_default(),
            worker_name: worker_name.into(),
            trace_id: None,
            span_id: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.status.is_reportable() {
            return Err(HubError::Validation(format!(
                "status must be one of running, success, fail, dead (got {})",
                self.status
            )));
        }
        if self.attempt < 1 {
            return Err(HubError::Validation(format!(
                "attempt must be >= 1 (got {})",
                self.attempt
            )));
        }
        if let Some(finished) = self.finished_at {
            if finished < self.started_at {
                return Err(HubError::Validation(format!(
                    "finished_at {finished} precedes started_at {}",
                    self.started_at
                )));
            }
        }
        if let Some(ms) = self.duration_ms.filter(|ms| *ms < 0) {
            return Err(HubError::Validation(format!(
                "duration_ms must be >= 0 (got {ms})"
            )));
        }
        Ok(())
    }

    /// Duration to record: the timestamp difference whenever `finished_at` is
    /// known, the reported `duration_ms` only without it.
    pub fn effective_duration_ms(&self) -> Option<i64> {
        match self.finished_at {
            Some(finished) => Some((finished - self.started_at).num_milliseconds()),
            None => self.duration_ms,
        }
    }

    pub fn into_attempt(self, task_id: impl Into<String>) -> Attempt {
        let duration_ms = self.effective_duration_ms();
        Attempt {
            task_id: task_id.into(),
            broker_task_id: self.broker_task_id,
            attempt: self.attempt,
            status: self.status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_ms,
            error: self.error,
            worker_name: self.worker_name,
            trace_id: self.trace_id,
            span_id: self.span_id,
        }
    }
}

/// Filter shared by task listing and counting so totals match pages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub worker_name: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

impl TaskFilter {
    pub fn for_worker(worker_name: impl Into<String>) -> Self {
        TaskFilter {
            worker_name: Some(worker_name.into()),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Clamp paging: limit outside 1..=200 becomes 50, negative offset becomes 0.
    pub fn normalized(mut self) -> Self {
        self.limit = clamp_limit(self.limit, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT);
        if self.offset < 0 {
            self.offset = 0;
        }
        self.worker_name = self.worker_name.filter(|s| !s.is_empty());
        self.queue = self.queue.filter(|s| !s.is_empty());
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.worker_name
            .as_deref()
            .map_or(true, |w| task.worker_name == w)
            && self.status.map_or(true, |s| task.status == s)
            && self.queue.as_deref().map_or(true, |q| task.queue == q)
    }
}

/// `limit` outside `1..=max` falls back to `default`.
pub fn clamp_limit(limit: i64, default: i64, max: i64) -> i64 {
    if limit <= 0 || limit > max {
        default
    } else {
        limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_task_id_format() {
        let id = new_task_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(crate::validation::is_valid_task_id(&id));
        assert_ne!(id, new_task_id());
    }

    #[test]
    fn test_pending_task() {
        let task = Task::pending("t-1", "w1-worker", "jobs", "default", 30, b"{}".to_vec());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.last_attempt, 0);
        assert!(task.last_error.is_empty());
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_replay_resets_progress() {
        let mut task = Task::pending("t-1", "w1-worker", "jobs", "critical", 50, b"{\"x\":1}".to_vec());
        task.status = TaskStatus::Fail;
        task.last_attempt = 3;
        task.last_error = "boom".into();

        let replay = task.replay_as("t-2");
        assert_eq!(replay.task_id, "t-2");
        assert_eq!(replay.payload, task.payload);
        assert_eq!(replay.queue, task.queue);
        assert_eq!(replay.priority_name, "critical");
        assert_eq!(replay.status, TaskStatus::Pending);
        assert_eq!(replay.last_attempt, 0);
        assert!(replay.last_error.is_empty());
    }

    #[test]
    fn test_task_validation() {
        let mut task = Task::pending("", "w1-worker", "jobs", "default", 30, vec![]);
        assert!(matches!(task.validate(), Err(HubError::Validation(_))));
        task.task_id = "bad id".into();
        assert!(task.validate().is_err());
    }

    #[test]
    fn test_finished_report_duration() {
        let started = Utc::now();
        let finished = started + Duration::milliseconds(120);

        let ok = AttemptReport::finished(1, "w1-worker", started, finished, None);
        assert_eq!(ok.status, TaskStatus::Success);
        assert_eq!(ok.duration_ms, Some(120));

        let failed = AttemptReport::finished(2, "w1-worker", started, finished, Some("boom".into()));
        assert_eq!(failed.status, TaskStatus::Fail);
        assert_eq!(failed.error, "boom");
    }

    #[test]
    fn test_into_attempt_derives_duration() {
        let mut report = AttemptReport::running(1, "w1-worker");
        report.status = TaskStatus::Success;
        report.finished_at = Some(report.started_at + Duration::milliseconds(75));

        let attempt = report.into_attempt("t-1");
        assert_eq!(attempt.task_id, "t-1");
        assert_eq!(attempt.duration_ms, Some(75));
    }

    #[test]
    fn test_duration_follows_timestamps() {
        let mut report = AttemptReport::running(1, "w1-worker");
        report.status = TaskStatus::Success;
        report.finished_at = Some(report.started_at + Duration::milliseconds(120));
        report.duration_ms = Some(5_000);
        assert!(report.validate().is_ok());
        assert_eq!(report.clone().into_attempt("t-1").duration_ms, Some(120));

        report.finished_at = None;
        assert_eq!(report.clone().into_attempt("t-1").duration_ms, Some(5_000));

        report.duration_ms = Some(-1);
        assert!(matches!(report.validate(), Err(HubError::Validation(_))));

        report.duration_ms = None;
        report.finished_at = Some(report.started_at - Duration::milliseconds(1));
        assert!(matches!(report.validate(), Err(HubError::Validation(_))));
    }

    #[test]
    fn test_report_validation() {
        let mut report = AttemptReport::running(1, "w1-worker");
        assert!(report.validate().is_ok());

        report.status = TaskStatus::Pending;
        assert!(report.validate().is_err());

        report.status = TaskStatus::Running;
        report.attempt = 0;
        assert!(report.validate().is_err());
    }

    #[test]
    fn test_filter_clamping() {
        let filter = TaskFilter { limit: 0, offset: -3, ..Default::default() }.normalized();
        assert_eq!(filter.limit, 50);
        assert_eq!(filter.offset, 0);

        assert_eq!(TaskFilter::default().with_limit(201).normalized().limit, 50);
        assert_eq!(TaskFilter::default().with_limit(200).normalized().limit, 200);
        assert_eq!(clamp_limit(1001, DEFAULT_FAILED_LIMIT, MAX_FAILED_LIMIT), 100);
        assert_eq!(clamp_limit(1000, DEFAULT_FAILED_LIMIT, MAX_FAILED_LIMIT), 1000);
    }

    #[test]
    fn test_filter_matching() {
        let task = Task::pending("t-1", "w1-worker", "jobs", "default", 30, vec![]);

        assert!(TaskFilter::default().matches(&task));
        assert!(TaskFilter::for_worker("w1-worker").matches(&task));
        assert!(!TaskFilter::for_worker("w2-worker").matches(&task));
        assert!(!TaskFilter::for_worker("w1-worker")
            .with_status(TaskStatus::Fail)
            .matches(&task));

        let empty_strings = TaskFilter {
            worker_name: Some(String::new()),
            queue: Some(String::new()),
            ..Default::default()
        }
        .normalized();
        assert!(empty_strings.matches(&task));
    }
}
