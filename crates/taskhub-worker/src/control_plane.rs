use async_trait::async_trait;
use taskhub_client::{ClientError, ControlPlaneClient};
use taskhub_core::api::{
    CreateTaskRequest, CreateTaskResponse, RegisterWorkerRequest, RegisterWorkerResponse,
    ReportAttemptRequest,
};
use taskhub_core::AttemptReport;

/// The calls a worker makes against the control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn register(&self, req: &RegisterWorkerRequest) -> Result<RegisterWorkerResponse, ClientError>;

    async fn heartbeat(&self, worker_name: &str) -> Result<(), ClientError>;

    async fn report_attempt(&self, task_id: &str, report: &AttemptReport) -> Result<(), ClientError>;

    async fn enqueue(&self, req: &CreateTaskRequest) -> Result<CreateTaskResponse, ClientError>;
}

#[async_trait]
impl ControlPlane for ControlPlaneClient {
    async fn register(&self, req: &RegisterWorkerRequest) -> Result<RegisterWorkerResponse, ClientError> {
        self.register_worker(req).await
    }

    async fn heartbeat(&self, worker_name: &str) -> Result<(), ClientError> {
        ControlPlaneClient::heartbeat(self, worker_name).await.map(|_| ())
    }

    async fn report_attempt(&self, task_id: &str, report: &AttemptReport) -> Result<(), ClientError> {
        ControlPlaneClient::report_attempt(self, task_id, &ReportAttemptRequest::from(report))
            .await
            .map(|_| ())
    }

    async fn enqueue(&self, req: &CreateTaskRequest) -> Result<CreateTaskResponse, ClientError> {
        self.create_task(req).await
    }
}
