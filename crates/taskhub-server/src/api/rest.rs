use crate::engine::{BatchRetryFilter, NewTask};
use crate::hub::Hub;
use crate::ledger::ReportEffect;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use taskhub_core::api::{
    parse_optional_status, BatchRetryRequest, BatchRetryResponse, ClearQueueRequest,
    ClearQueueResponse, CreateTaskRequest, CreateTaskResponse, ErrorBody, HeartbeatResponse,
    ListTasksQuery, QueueStatsResponse, RegisterWorkerRequest, RegisterWorkerResponse,
    ReplayRequest, ReplayResponse, ReportAttemptRequest, StatusBody, TaskDetailResponse,
    TaskListResponse, TaskView, WorkerStats,
};
use taskhub_core::task::{clamp_limit, DEFAULT_FAILED_LIMIT, MAX_FAILED_LIMIT};
use taskhub_core::validation::{validate_task_id, validate_worker_name};
use taskhub_core::{AttemptReport, HubError, WorkerConfig};
use tower_http::trace::TraceLayer;
use tracing::error;

const DETAIL_ATTEMPT_LIMIT: i64 = 50;

/// REST API routes
pub fn create_rest_api(hub: Arc<Hub>) -> Router {
    let api = Router::new()
        .route("/workers", post(upsert_worker).get(list_workers))
        .route("/workers/register", post(register_worker))
        .route("/workers/:name", get(get_worker).delete(delete_worker))
        .route("/workers/:name/heartbeat", post(heartbeat))
        .route("/workers/:name/stats", get(worker_stats))
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/batch-retry", post(batch_retry))
        .route("/tasks/:task_id", get(get_task))
        .route("/tasks/:task_id/replay", post(replay_task))
        .route("/tasks/:task_id/report-attempt", post(report_attempt))
        .route("/queues/stats", get(queue_stats))
        .route("/queues/clear", post(clear_queue))
        .route("/queues/clear-dead", post(clear_dead_queue));

    Router::new()
        .nest("/api/v1", api)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn register_worker(
    State(hub): State<Arc<Hub>>,
    body: Result<Json<RegisterWorkerRequest>, JsonRejection>,
) -> ApiResult<RegisterWorkerResponse> {
    let Json(req) = body?;
    Ok(Json(hub.register_worker(req).await?))
}

async fn upsert_worker(
    State(hub): State<Arc<Hub>>,
    body: Result<Json<WorkerConfig>, JsonRejection>,
) -> ApiResult<WorkerConfig> {
    let Json(config) = body?;
    Ok(Json(hub.upsert_worker(config).await?))
}

async fn list_workers(State(hub): State<Arc<Hub>>) -> Json<Vec<WorkerConfig>> {
    Json(hub.list_workers())
}

async fn get_worker(
    State(hub): State<Arc<Hub>>,
    Path(name): Path<String>,
) -> ApiResult<WorkerConfig> {
    validate_worker_name(&name)?;
    Ok(Json(hub.get_worker(&name)?))
}

async fn delete_worker(
    State(hub): State<Arc<Hub>>,
    Path(name): Path<String>,
) -> ApiResult<StatusBody> {
    validate_worker_name(&name)?;
    hub.delete_worker(&name).await?;
    Ok(Json(StatusBody::ok()))
}

async fn heartbeat(
    State(hub): State<Arc<Hub>>,
    Path(name): Path<String>,
) -> ApiResult<HeartbeatResponse> {
    validate_worker_name(&name)?;
    let heartbeat_at = hub.heartbeat(&name).await?;
    Ok(Json(HeartbeatResponse {
        status: "ok".into(),
        worker_name: name,
        heartbeat_at,
    }))
}

async fn worker_stats(
    State(hub): State<Arc<Hub>>,
    Path(name): Path<String>,
) -> ApiResult<WorkerStats> {
    validate_worker_name(&name)?;
    Ok(Json(hub.ledger().worker_stats(&name).await?))
}

async fn create_task(
    State(hub): State<Arc<Hub>>,
    body: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> ApiResult<CreateTaskResponse> {
    let Json(req) = body?;
    let enqueued = hub
        .create_task(NewTask {
            worker_name: req.worker_name,
            queue: req.queue,
            priority: req.priority,
            task_id: req.task_id,
            payload: req.payload.get().as_bytes().to_vec(),
            delay_seconds: req.delay_seconds,
            run_at: req.run_at,
        })
        .await?;

    Ok(Json(CreateTaskResponse {
        task_id: enqueued.task_id,
        broker_task_id: enqueued.broker_task_id,
        status: "enqueued".into(),
    }))
}

async fn list_tasks(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<TaskListResponse> {
    let filter = query.into_filter()?;
    let tasks = hub.ledger().list_tasks(&filter).await?;
    let total = hub.ledger().count_tasks(&filter).await?;

    Ok(Json(TaskListResponse {
        items: tasks.into_iter().map(TaskView::from).collect(),
        total,
    }))
}

async fn get_task(
    State(hub): State<Arc<Hub>>,
    Path(task_id): Path<String>,
) -> ApiResult<TaskDetailResponse> {
    validate_task_id(&task_id)?;
    let task = hub.ledger().get_task(&task_id).await?;
    let attempts = hub
        .ledger()
        .list_attempts(&task_id, DETAIL_ATTEMPT_LIMIT)
        .await?;

    Ok(Json(TaskDetailResponse {
        item: task.into(),
        attempts,
    }))
}

async fn replay_task(
    State(hub): State<Arc<Hub>>,
    Path(task_id): Path<String>,
    body: Option<Json<ReplayRequest>>,
) -> ApiResult<ReplayResponse> {
    validate_task_id(&task_id)?;
    let delay = body.and_then(|Json(req)| req.delay);
    let enqueued = hub.replay(&task_id, delay).await?;

    Ok(Json(ReplayResponse {
        new_task_id: enqueued.task_id,
        status: "replayed".into(),
    }))
}

async fn report_attempt(
    State(hub): State<Arc<Hub>>,
    Path(task_id): Path<String>,
    body: Result<Json<ReportAttemptRequest>, JsonRejection>,
) -> ApiResult<StatusBody> {
    let Json(req) = body?;
    let report = AttemptReport::try_from(req)?;

    match hub.report_attempt(&task_id, report).await? {
        ReportEffect::Applied => Ok(Json(StatusBody::ok())),
        ReportEffect::Recorded => Ok(Json(StatusBody::ok_with(
            "attempt recorded, task status unchanged",
        ))),
    }
}

async fn batch_retry(
    State(hub): State<Arc<Hub>>,
    body: Result<Json<BatchRetryRequest>, JsonRejection>,
) -> ApiResult<BatchRetryResponse> {
    let Json(req) = body?;
    let filter = BatchRetryFilter {
        worker_name: req.worker_name.filter(|w| !w.is_empty()),
        status: parse_optional_status(req.status.as_deref())?,
        task_ids: req.task_ids.filter(|ids| !ids.is_empty()),
        limit: clamp_limit(
            req.limit.unwrap_or_default(),
            DEFAULT_FAILED_LIMIT,
            MAX_FAILED_LIMIT,
        ),
    };
    let outcome = hub.batch_retry(filter).await?;

    Ok(Json(BatchRetryResponse {
        status: "ok".into(),
        total_retried: outcome.retried_count,
        new_task_ids: outcome.new_task_ids,
        failed_task_ids: outcome.failed_task_ids,
    }))
}

#[derive(Debug, Deserialize)]
struct QueueStatsQuery {
    worker_name: String,
}

async fn queue_stats(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<QueueStatsQuery>,
) -> ApiResult<QueueStatsResponse> {
    let queues = hub.queue_stats(&query.worker_name).await?;
    Ok(Json(QueueStatsResponse {
        worker_name: query.worker_name,
        queues,
    }))
}

async fn clear_queue(
    State(hub): State<Arc<Hub>>,
    body: Result<Json<ClearQueueRequest>, JsonRejection>,
) -> ApiResult<ClearQueueResponse> {
    let Json(req) = body?;
    let deleted = hub.clear_queue(&req, false).await?;
    Ok(Json(ClearQueueResponse { deleted }))
}

async fn clear_dead_queue(
    State(hub): State<Arc<Hub>>,
    body: Result<Json<ClearQueueRequest>, JsonRejection>,
) -> ApiResult<ClearQueueResponse> {
    let Json(req) = body?;
    let deleted = hub.clear_queue(&req, true).await?;
    Ok(Json(ClearQueueResponse { deleted }))
}

async fn healthz() -> Json<StatusBody> {
    Json(StatusBody::ok())
}

async fn readyz(State(hub): State<Arc<Hub>>) -> ApiResult<StatusBody> {
    hub.ready().await?;
    Ok(Json(StatusBody::ok()))
}

/// API error types
#[derive(Debug)]
pub enum ApiError {
    Hub(HubError),
    BadRequest(String),
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        ApiError::Hub(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Hub(err) => {
                let status = match &err {
                    HubError::NotFound(_) => StatusCode::NOT_FOUND,
                    HubError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
                    HubError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    _ => StatusCode::BAD_REQUEST,
                };
                if status.is_server_error() {
                    error!(error = %err, "Request failed");
                }
                (status, err.to_string())
            }
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}
