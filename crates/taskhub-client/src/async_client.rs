use crate::{ClientError, Result};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use taskhub_core::api::{
    BatchRetryRequest, BatchRetryResponse, ClearQueueRequest, ClearQueueResponse,
    CreateTaskRequest, CreateTaskResponse, ErrorBody, HeartbeatResponse, ListTasksQuery,
    QueueStatsResponse, RegisterWorkerRequest, RegisterWorkerResponse, ReplayRequest,
    ReplayResponse, ReportAttemptRequest, StatusBody, TaskDetailResponse, TaskListResponse,
    WorkerStats,
};
use taskhub_core::WorkerConfig;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Async client for the control-plane REST surface.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    base_url: String,
    http: reqwest::Client,
}

impl ControlPlaneClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ClientError::InvalidUrl(base_url));
        }

        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(ControlPlaneClient { base_url, http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn register_worker(&self, req: &RegisterWorkerRequest) -> Result<RegisterWorkerResponse> {
        self.send(self.api(Method::POST, "/workers/register").json(req)).await
    }

    pub async fn heartbeat(&self, worker_name: &str) -> Result<HeartbeatResponse> {
        let path = format!("/workers/{worker_name}/heartbeat");
        self.send(self.api(Method::POST, &path)).await
    }

    pub async fn upsert_worker(&self, config: &WorkerConfig) -> Result<WorkerConfig> {
        self.send(self.api(Method::POST, "/workers").json(config)).await
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerConfig>> {
        self.send(self.api(Method::GET, "/workers")).await
    }

    pub async fn get_worker(&self, worker_name: &str) -> Result<WorkerConfig> {
        self.send(self.api(Method::GET, &format!("/workers/{worker_name}"))).await
    }

    pub async fn delete_worker(&self, worker_name: &str) -> Result<StatusBody> {
        self.send(self.api(Method::DELETE, &format!("/workers/{worker_name}"))).await
    }

    pub async fn worker_stats(&self, worker_name: &str) -> Result<WorkerStats> {
        self.send(self.api(Method::GET, &format!("/workers/{worker_name}/stats"))).await
    }

    pub async fn create_task(&self, req: &CreateTaskRequest) -> Result<CreateTaskResponse> {
        self.send(self.api(Method::POST, "/tasks").json(req)).await
    }

    /// Enqueue any serializable payload.
    pub async fn enqueue<P: Serialize>(
        &self,
        worker_name: &str,
        queue: &str,
        priority: Option<&str>,
        task_id: Option<&str>,
        payload: &P,
    ) -> Result<CreateTaskResponse> {
        let req = CreateTaskRequest {
            worker_name: worker_name.to_string(),
            queue: queue.to_string(),
            priority: priority.map(str::to_string),
            task_id: task_id.map(str::to_string),
            payload: raw_payload(payload)?,
            delay_seconds: None,
            run_at: None,
        };
        self.create_task(&req).await
    }

    pub async fn list_tasks(&self, query: &ListTasksQuery) -> Result<TaskListResponse> {
        self.send(self.api(Method::GET, "/tasks").query(query)).await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<TaskDetailResponse> {
        self.send(self.api(Method::GET, &format!("/tasks/{task_id}"))).await
    }

    pub async fn replay(&self, task_id: &str, delay: Option<i64>) -> Result<ReplayResponse> {
        let path = format!("/tasks/{task_id}/replay");
        self.send(self.api(Method::POST, &path).json(&ReplayRequest { delay }))
            .await
    }

    pub async fn report_attempt(&self, task_id: &str, req: &ReportAttemptRequest) -> Result<StatusBody> {
        let path = format!("/tasks/{task_id}/report-attempt");
        self.send(self.api(Method::POST, &path).json(req)).await
    }

    pub async fn batch_retry(&self, req: &BatchRetryRequest) -> Result<BatchRetryResponse> {
        self.send(self.api(Method::POST, "/tasks/batch-retry").json(req)).await
    }

    pub async fn queue_stats(&self, worker_name: &str) -> Result<QueueStatsResponse> {
        self.send(
            self.api(Method::GET, "/queues/stats")
                .query(&[("worker_name", worker_name)]),
        )
        .await
    }

    /// Purge pending entries, or archived ones when `dead` is set.
    pub async fn clear_queue(&self, req: &ClearQueueRequest, dead: bool) -> Result<ClearQueueResponse> {
        let path = if dead { "/queues/clear-dead" } else { "/queues/clear" };
        self.send(self.api(Method::POST, path).json(req)).await
    }

    pub async fn health(&self) -> Result<StatusBody> {
        let url = format!("{}/readyz", self.base_url);
        self.send(self.http.get(url)).await
    }

    fn api(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/api/v1{}", self.base_url, path))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|e| e.error)
            .unwrap_or(body);

        if status == StatusCode::NOT_FOUND {
            Err(ClientError::NotFound(message))
        } else {
            Err(ClientError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// Serialize a payload into the raw JSON value carried by [`CreateTaskRequest`].
pub(crate) fn raw_payload<P: Serialize>(payload: &P) -> Result<Box<serde_json::value::RawValue>> {
    serde_json::value::to_raw_value(payload).map_err(|e| ClientError::Decode(e.to_string()))
}
