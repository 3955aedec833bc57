//! JSON bodies exchanged between the control plane, workers and operators.

use crate::status::TaskStatus;
use crate::task::{Attempt, AttemptReport, Task, TaskFilter};
use crate::worker::{QueueGroup, WorkerConfig};
use crate::{HubError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusBody {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusBody {
    pub fn ok() -> Self {
        StatusBody {
            status: "ok".into(),
            message: None,
        }
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        StatusBody {
            status: "ok".into(),
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    pub worker_name: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub broker_address: String,
    #[serde(default)]
    pub queue_groups: Vec<QueueGroup>,
    #[serde(default)]
    pub default_retry_count: i32,
    #[serde(default)]
    pub default_timeout_seconds: i32,
    #[serde(default)]
    pub default_delay_seconds: i32,
    #[serde(default)]
    pub overwrite: bool,
}

impl RegisterWorkerRequest {
    pub fn into_config(self) -> WorkerConfig {
        WorkerConfig {
            worker_name: self.worker_name,
            base_url: self.base_url,
            broker_address: self.broker_address,
            queue_groups: self.queue_groups,
            default_retry_count: self.default_retry_count,
            default_timeout_seconds: self.default_timeout_seconds,
            default_delay_seconds: self.default_delay_seconds,
            is_enabled: true,
            last_heartbeat_at: None,
        }
    }
}

/// Either the stored config, or an informational skip when the worker exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
    pub worker_name: String,
    pub heartbeat_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub worker_name: String,
    pub queue: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    /// Forwarded to the broker byte for byte
    pub payload: Box<RawValue>,
    #[serde(default)]
    pub delay_seconds: Option<i64>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskResponse {
    pub task_id: String,
    pub broker_task_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayRequest {
    #[serde(default)]
    pub delay: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayResponse {
    pub new_task_id: String,
    pub status: String,
}

/// Status arrives as a plain string so an unknown value maps to a 400.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportAttemptRequest {
    pub attempt: i32,
    pub status: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub worker_name: String,
    #[serde(default)]
    pub broker_task_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub span_id: Option<String>,
}

impl From<&AttemptReport> for ReportAttemptRequest {
    fn from(report: &AttemptReport) -> Self {
        ReportAttemptRequest {
            attempt: report.attempt,
            status: report.status.to_string(),
            started_at: report.started_at,
            finished_at: report.finished_at,
            duration_ms: report.duration_ms,
            error: Some(report.error.clone()).filter(|e| !e.is_empty()),
            worker_name: report.worker_name.clone(),
            broker_task_id: report.broker_task_id.clone(),
            trace_id: report.trace_id.clone(),
            span_id: report.span_id.clone(),
        }
    }
}

impl TryFrom<ReportAttemptRequest> for AttemptReport {
    type Error = HubError;

    fn try_from(req: ReportAttemptRequest) -> Result<Self> {
        let status: TaskStatus = req.status.parse().map_err(HubError::Validation)?;
        let report = AttemptReport {
            broker_task_id: req.broker_task_id,
            attempt: req.attempt,
            status,
            started_at: req.started_at,
            finished_at: req.finished_at,
            duration_ms: req.duration_ms,
            error: req.error.unwrap_or_default(),
            worker_name: req.worker_name,
            trace_id: req.trace_id,
            span_id: req.span_id,
        };
        report.validate()?;
        Ok(report)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchRetryRequest {
    #[serde(default)]
    pub worker_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub task_ids: Option<Vec<String>>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchRetryResponse {
    pub status: String,
    pub total_retried: usize,
    pub new_task_ids: Vec<String>,
    #[serde(default)]
    pub failed_task_ids: Vec<String>,
}

/// Query string of `GET /tasks`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub worker_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl ListTasksQuery {
    pub fn into_filter(self) -> Result<TaskFilter> {
        let status = parse_optional_status(self.status.as_deref())?;
        Ok(TaskFilter {
            worker_name: self.worker_name,
            status,
            queue: self.queue,
            limit: self.limit.unwrap_or_default(),
            offset: self.offset.unwrap_or_default(),
        }
        .normalized())
    }
}

/// Empty strings count as "no filter".
pub fn parse_optional_status(status: Option<&str>) -> Result<Option<TaskStatus>> {
    match status.filter(|s| !s.is_empty()) {
        Some(s) => s.parse().map(Some).map_err(HubError::Validation),
        None => Ok(None),
    }
}

/// Task as rendered to operators; the payload is shown as JSON when it is JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: String,
    pub worker_name: String,
    pub queue: String,
    pub priority: i32,
    pub priority_name: String,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub last_attempt: i32,
    pub last_error: String,
    pub last_worker_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        let payload = serde_json::from_slice(&task.payload).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&task.payload).into_owned())
        });
        TaskView {
            task_id: task.task_id,
            worker_name: task.worker_name,
            queue: task.queue,
            priority: task.priority,
            priority_name: task.priority_name,
            payload,
            status: task.status,
            last_attempt: task.last_attempt,
            last_error: task.last_error,
            last_worker_name: task.last_worker_name,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskListResponse {
    pub items: Vec<TaskView>,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDetailResponse {
    pub item: TaskView,
    pub attempts: Vec<Attempt>,
}

/// Aggregated execution history of one worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker_name: String,
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    /// success / (success + fail + dead), 0 when nothing finished
    pub success_rate: f64,
    /// Mean duration of successful terminal attempts
    pub avg_duration_ms: f64,
    pub by_queue: BTreeMap<String, i64>,
}

impl WorkerStats {
    /// Fill `success_rate` from the per-status counts.
    pub fn compute_success_rate(&mut self) {
        let count = |s: TaskStatus| self.by_status.get(s.as_str()).copied().unwrap_or(0);
        let success = count(TaskStatus::Success);
        let finished = success + count(TaskStatus::Fail) + count(TaskStatus::Dead);
        self.success_rate = if finished > 0 {
            success as f64 / finished as f64
        } else {
            0.0
        };
    }
}

/// Broker counters for one routing key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounters {
    pub pending: i64,
    pub active: i64,
    pub scheduled: i64,
    pub retry: i64,
    pub archived: i64,
    pub completed: i64,
    pub size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatsEntry {
    pub routing_key: String,
    pub queue: String,
    pub priority: String,
    #[serde(flatten)]
    pub counters: QueueCounters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatsResponse {
    pub worker_name: String,
    pub queues: Vec<QueueStatsEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearQueueRequest {
    pub worker_name: String,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearQueueResponse {
    pub deleted: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_request_rejects_unknown_status() {
        let req: ReportAttemptRequest = serde_json::from_str(
            r#"{"attempt":1,"status":"done","started_at":"2024-01-01T00:00:00Z","worker_name":"w1-worker"}"#,
        )
        .unwrap();
        assert!(matches!(
            AttemptReport::try_from(req),
            Err(HubError::Validation(_))
        ));
    }

    #[test]
    fn test_report_request_round_trip() {
        let report = AttemptReport::running(2, "w1-worker");
        let back = AttemptReport::try_from(ReportAttemptRequest::from(&report)).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_create_request_keeps_raw_payload() {
        let req: CreateTaskRequest = serde_json::from_str(
            r#"{"worker_name":"w1-worker","queue":"jobs","payload":{"x": 1}}"#,
        )
        .unwrap();
        assert_eq!(req.payload.get(), r#"{"x": 1}"#);
        assert!(req.priority.is_none());
    }

    #[test]
    fn test_list_query_into_filter() {
        let query = ListTasksQuery {
            status: Some("fail".into()),
            limit: Some(500),
            ..Default::default()
        };
        let filter = query.into_filter().unwrap();
        assert_eq!(filter.status, Some(TaskStatus::Fail));
        assert_eq!(filter.limit, 50);

        let bad = ListTasksQuery {
            status: Some("nope".into()),
            ..Default::default()
        };
        assert!(bad.into_filter().is_err());
    }

    #[test]
    fn test_task_view_payload_rendering() {
        let json_task = Task::pending("t-1", "w1-worker", "jobs", "default", 30, br#"{"x":1}"#.to_vec());
        assert_eq!(TaskView::from(json_task).payload, serde_json::json!({"x": 1}));

        let raw_task = Task::pending("t-2", "w1-worker", "jobs", "default", 30, b"plain".to_vec());
        assert_eq!(TaskView::from(raw_task).payload, serde_json::json!("plain"));
    }

    #[test]
    fn test_success_rate() {
        let mut stats = WorkerStats::default();
        stats.by_status.insert("success".into(), 3);
        stats.by_status.insert("fail".into(), 1);
        stats.by_status.insert("pending".into(), 10);
        stats.compute_success_rate();
        assert!((stats.success_rate - 0.75).abs() < f64::EPSILON);

        let mut empty = WorkerStats::default();
        empty.compute_success_rate();
        assert_eq!(empty.success_rate, 0.0);
    }

    #[test]
    fn test_queue_stats_entry_is_flat() {
        let entry = QueueStatsEntry {
            routing_key: "w:g:p".into(),
            queue: "g".into(),
            priority: "p".into(),
            counters: QueueCounters { pending: 2, size: 2, ..Default::default() },
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["pending"], 2);
        assert_eq!(value["routing_key"], "w:g:p");
    }
}
