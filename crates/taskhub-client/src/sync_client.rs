use crate::{ClientError, ControlPlaneClient, Result};
use std::future::Future;
use taskhub_core::api::{
    BatchRetryRequest, BatchRetryResponse, ClearQueueRequest, ClearQueueResponse,
    CreateTaskRequest, CreateTaskResponse, ListTasksQuery, QueueStatsResponse, ReplayResponse,
    StatusBody, TaskDetailResponse, TaskListResponse, WorkerStats,
};
use taskhub_core::WorkerConfig;

/// Synchronous client for the control plane (wraps the async client)
pub struct BlockingControlPlaneClient {
    runtime: tokio::runtime::Runtime,
    inner: ControlPlaneClient,
}

impl BlockingControlPlaneClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        Ok(BlockingControlPlaneClient {
            runtime,
            inner: ControlPlaneClient::new(base_url)?,
        })
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    pub fn list_workers(&self) -> Result<Vec<WorkerConfig>> {
        self.block_on(self.inner.list_workers())
    }

    pub fn get_worker(&self, worker_name: &str) -> Result<WorkerConfig> {
        self.block_on(self.inner.get_worker(worker_name))
    }

    pub fn delete_worker(&self, worker_name: &str) -> Result<StatusBody> {
        self.block_on(self.inner.delete_worker(worker_name))
    }

    pub fn worker_stats(&self, worker_name: &str) -> Result<WorkerStats> {
        self.block_on(self.inner.worker_stats(worker_name))
    }

    pub fn create_task(&self, req: &CreateTaskRequest) -> Result<CreateTaskResponse> {
        self.block_on(self.inner.create_task(req))
    }

    pub fn list_tasks(&self, query: &ListTasksQuery) -> Result<TaskListResponse> {
        self.block_on(self.inner.list_tasks(query))
    }

    pub fn get_task(&self, task_id: &str) -> Result<TaskDetailResponse> {
        self.block_on(self.inner.get_task(task_id))
    }

    pub fn replay(&self, task_id: &str, delay: Option<i64>) -> Result<ReplayResponse> {
        self.block_on(self.inner.replay(task_id, delay))
    }

    pub fn batch_retry(&self, req: &BatchRetryRequest) -> Result<BatchRetryResponse> {
        self.block_on(self.inner.batch_retry(req))
    }

    pub fn queue_stats(&self, worker_name: &str) -> Result<QueueStatsResponse> {
        self.block_on(self.inner.queue_stats(worker_name))
    }

    pub fn clear_queue(&self, req: &ClearQueueRequest, dead: bool) -> Result<ClearQueueResponse> {
        self.block_on(self.inner.clear_queue(req, dead))
    }
}
