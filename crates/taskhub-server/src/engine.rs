use crate::ledger::TaskLedger;
use crate::worker_registry::WorkerRegistry;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use taskhub_broker::{BrokerClient, Schedule, SubmitOptions};
use taskhub_core::task::{clamp_limit, DEFAULT_FAILED_LIMIT, MAX_FAILED_LIMIT};
use taskhub_core::validation::{
    validate_delay_seconds, validate_payload_size, validate_queue_name, validate_run_at,
    validate_task_id, validate_worker_name,
};
use taskhub_core::{
    new_task_id, HubError, Result, Task, TaskFilter, TaskStatus, WorkerConfig, FALLBACK_PRIORITY,
};
use tracing::{info, warn};

/// Input of [`EnqueueEngine::create_task`].
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub worker_name: String,
    pub queue: String,
    pub priority: Option<String>,
    pub task_id: Option<String>,
    pub payload: Vec<u8>,
    pub delay_seconds: Option<i64>,
    pub run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    pub task_id: String,
    pub broker_task_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct BatchRetryFilter {
    pub worker_name: Option<String>,
    pub status: Option<TaskStatus>,
    pub task_ids: Option<Vec<String>>,
    pub limit: i64,
}

/// Partial-success result of a batch retry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchRetryOutcome {
    pub retried_count: usize,
    pub new_task_ids: Vec<String>,
    pub failed_task_ids: Vec<String>,
}

/// Builds routing keys, submits to the broker and records the resulting tasks.
///
/// Stateless per call; the broker's task-key check is the only duplicate guard.
pub struct EnqueueEngine {
    registry: Arc<WorkerRegistry>,
    ledger: Arc<TaskLedger>,
    broker: Option<Arc<dyn BrokerClient>>,
}

impl EnqueueEngine {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        ledger: Arc<TaskLedger>,
        broker: Option<Arc<dyn BrokerClient>>,
    ) -> Self {
        EnqueueEngine {
            registry,
            ledger,
            broker,
        }
    }

    pub fn broker(&self) -> Result<&Arc<dyn BrokerClient>> {
        self.broker
            .as_ref()
            .ok_or_else(|| HubError::Transport("broker client is not configured".into()))
    }

    /// Validate, route and submit one task, then persist it as `pending`.
    ///
    /// All validation and routing checks run before the broker is touched.
    pub async fn create_task(&self, req: NewTask) -> Result<Enqueued> {
        validate_worker_name(&req.worker_name)?;
        validate_queue_name(&req.queue)?;
        let priority = req
            .priority
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| FALLBACK_PRIORITY.to_string());
        validate_queue_name(&priority)?;
        if let Some(task_id) = &req.task_id {
            validate_task_id(task_id)?;
        }
        validate_payload_size(&req.payload)?;
        if let Some(delay) = req.delay_seconds {
            validate_delay_seconds(delay)?;
        }
        if let Some(run_at) = req.run_at {
            validate_run_at(run_at, Utc::now())?;
        }

        let worker = self.routable_worker(&req.worker_name)?;
        if !worker.has_queue_group(&req.queue) {
            return Err(HubError::Routing(format!(
                "queue group {} is not declared by worker {}",
                req.queue, req.worker_name
            )));
        }
        let weight = worker.priority_weight(&req.queue, &priority).ok_or_else(|| {
            HubError::Routing(format!(
                "priority {priority} is not declared in queue group {} of worker {}",
                req.queue, req.worker_name
            ))
        })?;

        let task_id = req.task_id.unwrap_or_else(new_task_id);
        let task = Task::pending(
            task_id,
            &req.worker_name,
            &req.queue,
            priority,
            weight,
            req.payload,
        );
        let schedule = Schedule::from_request(req.delay_seconds, req.run_at);
        self.submit(&worker, task, schedule).await
    }

    /// Re-submit a finished task under a fresh identity. The source row is untouched.
    pub async fn replay(&self, task_id: &str, delay_seconds: Option<i64>) -> Result<Enqueued> {
        validate_task_id(task_id)?;
        if let Some(delay) = delay_seconds {
            validate_delay_seconds(delay)?;
        }
        let source = self.ledger.get_task(task_id).await?;
        if !source.status.is_replayable() {
            return Err(HubError::InvalidState {
                expected: "success or fail".into(),
                actual: source.status.to_string(),
            });
        }

        let worker = self.routable_worker(&source.worker_name)?;
        let replay = source.replay_as(new_task_id());
        let enqueued = self
            .submit(&worker, replay, Schedule::from_request(delay_seconds, None))
            .await?;

        info!(
            source_task_id = task_id,
            task_id = %enqueued.task_id,
            worker_name = %source.worker_name,
            "Task replayed"
        );
        Ok(enqueued)
    }

    /// Replay every candidate independently; one failure never aborts the batch.
    pub async fn batch_retry(&self, filter: BatchRetryFilter) -> Result<BatchRetryOutcome> {
        let limit = clamp_limit(filter.limit, DEFAULT_FAILED_LIMIT, MAX_FAILED_LIMIT);
        let worker_name = filter.worker_name.filter(|w| !w.is_empty());

        let candidates: Vec<String> = match filter.task_ids.filter(|ids| !ids.is_empty()) {
            Some(ids) => ids.into_iter().take(limit as usize).collect(),
            None => match filter.status {
                Some(status) => {
                    let mut task_filter = TaskFilter {
                        worker_name: worker_name.clone(),
                        status: Some(status),
                        ..Default::default()
                    };
                    // the store caps a page at 200, so walk pages up to `limit`
                    let mut ids = Vec::new();
                    while (ids.len() as i64) < limit {
                        task_filter.limit = (limit - ids.len() as i64).min(200);
                        task_filter.offset = ids.len() as i64;
                        let page = self.ledger.list_tasks(&task_filter).await?;
                        let exhausted = (page.len() as i64) < task_filter.limit;
                        ids.extend(page.into_iter().map(|t| t.task_id));
                        if exhausted {
                            break;
                        }
                    }
                    ids
                }
                None => self
                    .ledger
                    .list_failed_tasks(worker_name.as_deref(), limit)
                    .await?
                    .into_iter()
                    .map(|t| t.task_id)
                    .collect(),
            },
        };

        let mut outcome = BatchRetryOutcome::default();
        for task_id in candidates {
            match self.replay(&task_id, None).await {
                Ok(enqueued) => {
                    outcome.retried_count += 1;
                    outcome.new_task_ids.push(enqueued.task_id);
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Batch retry skipped task");
                    outcome.failed_task_ids.push(task_id);
                }
            }
        }

        info!(
            retried = outcome.retried_count,
            failed = outcome.failed_task_ids.len(),
            "Batch retry finished"
        );
        Ok(outcome)
    }

    fn routable_worker(&self, worker_name: &str) -> Result<WorkerConfig> {
        let worker = self
            .registry
            .get(worker_name)
            .ok_or_else(|| HubError::NotFound(format!("worker {worker_name} not found")))?;
        if !worker.is_enabled {
            return Err(HubError::Disabled(worker_name.to_string()));
        }
        Ok(worker)
    }

    async fn submit(&self, worker: &WorkerConfig, task: Task, schedule: Schedule) -> Result<Enqueued> {
        if !worker.has_queue_with_priority(&task.queue, &task.priority_name) {
            return Err(HubError::Routing(format!(
                "routing key {}:{}:{} is not declared",
                worker.worker_name, task.queue, task.priority_name
            )));
        }

        let broker = self.broker()?;
        let key = worker.routing_key(&task.queue, &task.priority_name);
        let options = SubmitOptions {
            max_retry: worker.default_retry_count,
            timeout: Duration::from_secs(worker.default_timeout_seconds.max(1) as u64),
            schedule,
            task_key: Some(task.task_id.clone()),
        };

        let broker_task_id = broker.submit(&key, task.payload.clone(), options).await?;
        self.ledger.upsert_task(&task).await?;

        info!(
            task_id = %task.task_id,
            worker_name = %worker.worker_name,
            routing_key = %key,
            broker_task_id = %broker_task_id,
            "Task enqueued"
        );
        Ok(Enqueued {
            task_id: task.task_id,
            broker_task_id,
        })
    }
}
