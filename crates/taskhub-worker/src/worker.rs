use crate::config::WorkerSettings;
use crate::control_plane::ControlPlane;
use crate::error::{Result, WorkerError};
use crate::executor::{ReportFailureHook, TaskExecutor};
use crate::handler::{HandlerRegistry, TaskHandler};
use crate::heartbeat::HeartbeatManager;
use crate::retry::ReportError;
use crate::server::QueueGroupServer;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use taskhub_broker::{
    BrokerClient, BrokerConsumer, BrokerError, MemoryBroker, Schedule, SubmitOptions,
};
use taskhub_client::ControlPlaneClient;
use taskhub_core::api::{CreateTaskRequest, RegisterWorkerRequest};
use taskhub_core::validation::{validate_payload_size, validate_task_id};
use taskhub_core::{new_task_id, HubError, WorkerConfig, FALLBACK_PRIORITY};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

enum Registration {
    Group(String),
    Priority(String, String),
}

/// Assembles a [`Worker`] from settings, a broker and handlers.
pub struct WorkerBuilder {
    settings: WorkerSettings,
    consumer: Option<Arc<dyn BrokerConsumer>>,
    broker: Option<Arc<dyn BrokerClient>>,
    control_plane: Option<Arc<dyn ControlPlane>>,
    handlers: Vec<(Registration, Arc<dyn TaskHandler>)>,
    on_report_failure: Option<ReportFailureHook>,
}

impl WorkerBuilder {
    pub fn consumer(mut self, consumer: Arc<dyn BrokerConsumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    /// Broker used by [`Worker::enqueue`] when no control plane is configured.
    pub fn broker_client(mut self, broker: Arc<dyn BrokerClient>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Use an in-process broker for both consuming and direct enqueue.
    pub fn memory_broker(self, broker: Arc<MemoryBroker>) -> Self {
        self.consumer(broker.clone()).broker_client(broker)
    }

    pub fn control_plane(mut self, control_plane: Arc<dyn ControlPlane>) -> Self {
        self.control_plane = Some(control_plane);
        self
    }

    /// Handle every priority of `group` with `handler`.
    pub fn handle(mut self, group: impl Into<String>, handler: impl TaskHandler + 'static) -> Self {
        self.handlers
            .push((Registration::Group(group.into()), Arc::new(handler)));
        self
    }

    /// Handle only `priority` of `group`. Takes precedence over a group-wide handler.
    pub fn handle_priority(
        mut self,
        group: impl Into<String>,
        priority: impl Into<String>,
        handler: impl TaskHandler + 'static,
    ) -> Self {
        self.handlers.push((
            Registration::Priority(group.into(), priority.into()),
            Arc::new(handler),
        ));
        self
    }

    pub fn on_report_failure(mut self, hook: impl Fn(&ReportError) + Send + Sync + 'static) -> Self {
        self.on_report_failure = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<Worker> {
        let config = self.settings.to_worker_config()?;
        let consumer = self.consumer.ok_or(WorkerError::MissingConsumer)?;

        let control_plane = match (self.control_plane, &self.settings.control_plane_url) {
            (Some(cp), _) => Some(cp),
            (None, Some(url)) if !url.is_empty() => {
                Some(Arc::new(ControlPlaneClient::new(url.as_str())?) as Arc<dyn ControlPlane>)
            }
            _ => None,
        };

        // Priority-specific handlers bind first so group-wide ones only fill gaps.
        let mut handlers = self.handlers;
        handlers.sort_by_key(|(r, _)| matches!(r, Registration::Group(_)));

        let registry = Arc::new(HandlerRegistry::new());
        for (registration, handler) in handlers {
            match registration {
                Registration::Group(group) => {
                    registry.register_group(&config, &group, handler)?;
                }
                Registration::Priority(group, priority) => {
                    registry.register_priority(&config, &group, &priority, handler)?;
                }
            }
        }
        if registry.is_empty() {
            return Err(WorkerError::NoHandlers);
        }

        let mut executor = TaskExecutor::new(
            &config.worker_name,
            registry.clone(),
            control_plane.clone(),
            self.settings.report_retry.clone(),
            Duration::from_secs(config.default_timeout_seconds as u64),
        );
        if let Some(hook) = self.on_report_failure {
            executor = executor.with_report_failure_hook(hook);
        }

        Ok(Worker {
            config,
            settings: self.settings,
            handlers: registry,
            consumer,
            broker: self.broker,
            control_plane,
            executor: Arc::new(executor),
            shutdown: CancellationToken::new(),
        })
    }
}

/// Worker process hosting one execution server per queue group.
pub struct Worker {
    config: WorkerConfig,
    settings: WorkerSettings,
    handlers: Arc<HandlerRegistry>,
    consumer: Arc<dyn BrokerConsumer>,
    broker: Option<Arc<dyn BrokerClient>>,
    control_plane: Option<Arc<dyn ControlPlane>>,
    executor: Arc<TaskExecutor>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn builder(settings: WorkerSettings) -> WorkerBuilder {
        WorkerBuilder {
            settings,
            consumer: None,
            broker: None,
            control_plane: None,
            handlers: Vec::new(),
            on_report_failure: None,
        }
    }

    pub fn worker_name(&self) -> &str {
        &self.config.worker_name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Trigger shutdown
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Token that stops the worker when cancelled, for use from other tasks.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Announce this worker's queue groups. Failures are logged, never fatal.
    pub async fn register(&self) {
        let Some(cp) = &self.control_plane else {
            return;
        };

        let req = RegisterWorkerRequest {
            worker_name: self.config.worker_name.clone(),
            base_url: self.config.base_url.clone(),
            broker_address: self.config.broker_address.clone(),
            queue_groups: self.config.queue_groups.clone(),
            default_retry_count: self.config.default_retry_count,
            default_timeout_seconds: self.config.default_timeout_seconds,
            default_delay_seconds: self.config.default_delay_seconds,
            overwrite: self.settings.overwrite_registration,
        };

        match cp.register(&req).await {
            Ok(resp) => info!(
                worker_name = %self.config.worker_name,
                status = %resp.status,
                "Worker registered with control plane"
            ),
            Err(e) => warn!(
                worker_name = %self.config.worker_name,
                error = %e,
                "Worker registration failed"
            ),
        }
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(&self) -> Result<()> {
        self.run_until(termination_signal()).await
    }

    /// Run every queue-group server until `signal` resolves, the worker is shut
    /// down, or one server fails. All servers are stopped and drained together.
    pub async fn run_until(&self, signal: impl Future<Output = ()>) -> Result<()> {
        if self.settings.auto_register {
            self.register().await;
        }

        let stop = self.shutdown.child_token();

        let heartbeat = self.control_plane.as_ref().map(|cp| {
            HeartbeatManager::new(
                cp.clone(),
                &self.config.worker_name,
                self.settings.heartbeat_interval(),
                self.settings.heartbeat_timeout(),
            )
            .spawn(stop.clone())
        });

        let mut servers = JoinSet::new();
        for group in &self.config.queue_groups {
            let queues: Vec<_> = self
                .config
                .routing_keys(&group.name)
                .into_iter()
                .filter(|(key, _)| self.handlers.has_handler(key))
                .collect();
            if queues.is_empty() {
                warn!(queue_group = %group.name, "No handler registered, queue group not served");
                continue;
            }

            let server = QueueGroupServer::new(
                group,
                queues,
                self.consumer.clone(),
                self.executor.clone(),
                self.settings.shutdown_timeout(),
            );
            let token = stop.clone();
            servers.spawn(async move {
                let group = server.group().to_string();
                (group, server.run(token).await)
            });
        }

        info!(
            worker_name = %self.config.worker_name,
            queue_groups = servers.len(),
            control_plane = self.control_plane.is_some(),
            "Worker started"
        );

        let mut first_error = None;
        tokio::select! {
            _ = signal => info!("Received shutdown signal"),
            _ = stop.cancelled() => info!("Shutdown requested"),
            Some(joined) = servers.join_next() => {
                first_error = server_error(joined);
            }
        }

        stop.cancel();
        while let Some(joined) = servers.join_next().await {
            if let Some(e) = server_error(joined) {
                first_error.get_or_insert(e);
            }
        }
        if let Some(handle) = heartbeat {
            let _ = handle.await;
        }

        info!(worker_name = %self.config.worker_name, "Worker stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Enqueue a task into one of this worker's queue groups.
    ///
    /// Goes through the control plane when one is configured so the task is
    /// recorded; otherwise submits straight to the broker.
    pub async fn enqueue<P: Serialize>(
        &self,
        group: &str,
        priority: Option<&str>,
        task_id: Option<&str>,
        payload: &P,
    ) -> Result<String> {
        let priority = priority.unwrap_or(FALLBACK_PRIORITY);
        if !self.config.has_queue_with_priority(group, priority) {
            return Err(HubError::Routing(format!(
                "queue group {group} with priority {priority} is not declared by worker {}",
                self.config.worker_name
            ))
            .into());
        }
        if let Some(id) = task_id {
            validate_task_id(id)?;
        }

        let raw = serde_json::value::to_raw_value(payload)?;
        validate_payload_size(raw.get().as_bytes())?;
        let delay = i64::from(self.config.default_delay_seconds);

        if let Some(cp) = &self.control_plane {
            let req = CreateTaskRequest {
                worker_name: self.config.worker_name.clone(),
                queue: group.to_string(),
                priority: Some(priority.to_string()),
                task_id: task_id.map(str::to_string),
                payload: raw,
                delay_seconds: Some(delay),
                run_at: None,
            };
            let resp = cp.enqueue(&req).await?;
            return Ok(resp.task_id);
        }

        let broker = self.broker.as_ref().ok_or(WorkerError::NoEnqueuePath)?;
        let task_id = task_id.map(str::to_string).unwrap_or_else(new_task_id);
        let options = SubmitOptions {
            max_retry: self.config.default_retry_count,
            timeout: Duration::from_secs(self.config.default_timeout_seconds as u64),
            schedule: Schedule::from_request(Some(delay), None),
            task_key: Some(task_id.clone()),
        };
        broker
            .submit(
                &self.config.routing_key(group, priority),
                raw.get().as_bytes().to_vec(),
                options,
            )
            .await?;
        Ok(task_id)
    }
}

type ServerExit = std::result::Result<(String, std::result::Result<(), BrokerError>), JoinError>;

fn server_error(joined: ServerExit) -> Option<WorkerError> {
    match joined {
        Ok((_, Ok(()))) => None,
        Ok((group, Err(source))) => Some(WorkerError::QueueGroup { group, source }),
        Err(e) => {
            error!(error = %e, "Queue group server task aborted");
            Some(WorkerError::QueueGroup {
                group: "unknown".into(),
                source: BrokerError::Unavailable(e.to_string()),
            })
        }
    }
}

async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM, waiting for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::testing::RecordingControlPlane;
    use crate::handler::{handler_fn, TaskContext};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use taskhub_core::{QueueGroup, TaskStatus};

    fn settings() -> WorkerSettings {
        WorkerSettings::new("w1-worker").with_queue_group(QueueGroup::new("jobs", 2))
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_build_requires_consumer_and_handlers() {
        let err = Worker::builder(settings())
            .handle("jobs", handler_fn(|_ctx, _p| async { Ok::<(), anyhow::Error>(()) }))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, WorkerError::MissingConsumer));

        let err = Worker::builder(settings())
            .memory_broker(Arc::new(MemoryBroker::default()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, WorkerError::NoHandlers));

        let err = Worker::builder(settings())
            .memory_broker(Arc::new(MemoryBroker::default()))
            .handle("video", handler_fn(|_ctx, _p| async { Ok::<(), anyhow::Error>(()) }))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, WorkerError::Config(HubError::Routing(_))));
    }

    #[tokio::test]
    async fn test_priority_handler_takes_precedence() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (group_seen, critical_seen) = (seen.clone(), seen.clone());
        let broker = Arc::new(MemoryBroker::default());

        let worker = Worker::builder(settings())
            .memory_broker(broker)
            .handle(
                "jobs",
                handler_fn(move |ctx: TaskContext, _p: Vec<u8>| {
                    let seen = group_seen.clone();
                    async move {
                        seen.lock().push(format!("group:{}", ctx.priority()));
                        Ok::<(), anyhow::Error>(())
                    }
                }),
            )
            .handle_priority(
                "jobs",
                "critical",
                handler_fn(move |ctx: TaskContext, _p: Vec<u8>| {
                    let seen = critical_seen.clone();
                    async move {
                        seen.lock().push(format!("critical:{}", ctx.priority()));
                        Ok::<(), anyhow::Error>(())
                    }
                }),
            )
            .build()
            .unwrap();

        worker.enqueue("jobs", Some("critical"), None, &serde_json::json!({})).await.unwrap();
        worker.enqueue("jobs", Some("low"), None, &serde_json::json!({})).await.unwrap();

        let token = worker.shutdown_token();
        let watcher = seen.clone();
        let stopper = tokio::spawn(async move {
            wait_until(|| watcher.lock().len() == 2).await;
            token.cancel();
        });
        worker.run_until(std::future::pending()).await.unwrap();
        stopper.await.unwrap();

        let mut seen = seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["critical:critical".to_string(), "group:low".to_string()]);
    }

    #[tokio::test]
    async fn test_run_registers_reports_and_heartbeats() {
        let broker = Arc::new(MemoryBroker::default());
        let cp = Arc::new(RecordingControlPlane::default());
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = processed.clone();

        let worker = Worker::builder(settings())
            .memory_broker(broker.clone())
            .control_plane(cp.clone())
            .handle(
                "jobs",
                handler_fn(move |_ctx: TaskContext, _p: Vec<u8>| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), anyhow::Error>(())
                    }
                }),
            )
            .build()
            .unwrap();

        broker
            .submit(
                &worker.config().routing_key("jobs", "default"),
                b"{}".to_vec(),
                SubmitOptions {
                    task_key: Some("t1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let token = worker.shutdown_token();
        let watcher = cp.clone();
        let stopper = tokio::spawn(async move {
            wait_until(|| watcher.reports.lock().len() == 2).await;
            token.cancel();
        });
        worker.run_until(std::future::pending()).await.unwrap();
        stopper.await.unwrap();

        assert_eq!(processed.load(Ordering::SeqCst), 1);
        assert_eq!(cp.registrations.lock().len(), 1);
        assert_eq!(cp.registrations.lock()[0].queue_groups[0].priorities.len(), 3);
        assert!(cp.heartbeats.load(Ordering::SeqCst) >= 1);

        let statuses = cp.report_statuses();
        assert!(statuses.contains(&TaskStatus::Running.to_string()));
        assert!(statuses.contains(&TaskStatus::Success.to_string()));
        assert!(cp.reports.lock().iter().all(|(id, _)| id == "t1"));
    }

    #[tokio::test]
    async fn test_broker_failure_stops_every_group() {
        let broker = Arc::new(MemoryBroker::default());
        let settings = settings().with_queue_group(QueueGroup::new("mail", 1));
        let worker = Worker::builder(settings)
            .memory_broker(broker.clone())
            .handle("jobs", handler_fn(|_ctx, _p| async { Ok::<(), anyhow::Error>(()) }))
            .handle("mail", handler_fn(|_ctx, _p| async { Ok::<(), anyhow::Error>(()) }))
            .build()
            .unwrap();

        broker.close();
        let err = worker.run_until(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, WorkerError::QueueGroup { source: BrokerError::Closed, .. }));
    }

    #[tokio::test]
    async fn test_enqueue_validates_locally() {
        let cp = Arc::new(RecordingControlPlane::default());
        let worker = Worker::builder(settings())
            .memory_broker(Arc::new(MemoryBroker::default()))
            .control_plane(cp.clone())
            .handle("jobs", handler_fn(|_ctx, _p| async { Ok::<(), anyhow::Error>(()) }))
            .build()
            .unwrap();

        let err = worker
            .enqueue("jobs", Some("urgent"), None, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Config(HubError::Routing(_))));
        assert!(cp.enqueued.lock().is_empty());

        let id = worker
            .enqueue("jobs", None, Some("order-42"), &serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(id, "order-42");
        let sent = cp.enqueued.lock();
        assert_eq!(sent[0].priority.as_deref(), Some("default"));
        assert_eq!(sent[0].payload.get(), r#"{"x":1}"#);
    }
}
