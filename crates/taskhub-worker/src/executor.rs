use crate::config::ReportRetryConfig;
use crate::control_plane::ControlPlane;
use crate::handler::{HandlerRegistry, TaskContext};
use crate::retry::{report_with_retry, ReportError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use taskhub_broker::{Delivery, Outcome};
use taskhub_core::AttemptReport;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Called with every terminal report that could not be delivered.
pub type ReportFailureHook = Arc<dyn Fn(&ReportError) + Send + Sync>;

/// Runs one delivery through its handler and reports the attempt around it.
pub struct TaskExecutor {
    worker_name: String,
    handlers: Arc<HandlerRegistry>,
    control_plane: Option<Arc<dyn ControlPlane>>,
    report_retry: ReportRetryConfig,
    default_timeout: Duration,
    on_report_failure: Option<ReportFailureHook>,
    reports_cancel: CancellationToken,
}

impl TaskExecutor {
    pub fn new(
        worker_name: impl Into<String>,
        handlers: Arc<HandlerRegistry>,
        control_plane: Option<Arc<dyn ControlPlane>>,
        report_retry: ReportRetryConfig,
        default_timeout: Duration,
    ) -> Self {
        TaskExecutor {
            worker_name: worker_name.into(),
            handlers,
            control_plane,
            report_retry,
            default_timeout,
            on_report_failure: None,
            reports_cancel: CancellationToken::new(),
        }
    }

    pub fn with_report_failure_hook(mut self, hook: ReportFailureHook) -> Self {
        self.on_report_failure = Some(hook);
        self
    }

    /// Abandon report retries still waiting on backoff.
    pub fn abort_reports(&self) {
        self.reports_cancel.cancel();
    }

    /// Execute a delivery. The returned outcome is the handler's own result,
    /// handed back to the broker unchanged.
    pub async fn execute(&self, delivery: &Delivery) -> Outcome {
        let task_id = delivery.task_id().to_string();
        let attempt = delivery.retry_count + 1;
        let started_at = Utc::now();

        self.spawn_running_report(&task_id, &delivery.handle, attempt);

        let outcome = self.run_handler(delivery, &task_id, attempt).await;

        let finished_at = Utc::now();
        let error = match &outcome {
            Outcome::Success => None,
            Outcome::Failure(msg) => Some(msg.clone()),
        };
        let mut report = AttemptReport::finished(attempt, &self.worker_name, started_at, finished_at, error);
        report.broker_task_id = Some(delivery.handle.clone());

        match &outcome {
            Outcome::Success => info!(
                task_id = %task_id,
                attempt,
                routing_key = %delivery.routing_key,
                duration_ms = report.duration_ms.unwrap_or_default(),
                "Task completed"
            ),
            Outcome::Failure(msg) => warn!(
                task_id = %task_id,
                attempt,
                routing_key = %delivery.routing_key,
                error = %msg,
                "Task failed"
            ),
        }

        if let Err(e) = self.send_report(&task_id, &report).await {
            error!(task_id = %task_id, attempt, error = %e, "Terminal attempt report lost");
            if let Some(hook) = &self.on_report_failure {
                hook(&e);
            }
        }

        outcome
    }

    async fn run_handler(&self, delivery: &Delivery, task_id: &str, attempt: i32) -> Outcome {
        let Some(handler) = self.handlers.get(&delivery.routing_key) else {
            return Outcome::Failure(format!(
                "no handler registered for {}",
                delivery.routing_key
            ));
        };

        let timeout = if delivery.timeout.is_zero() {
            self.default_timeout
        } else {
            delivery.timeout
        };
        let ctx = TaskContext::new(
            task_id,
            &delivery.handle,
            delivery.routing_key.clone(),
            attempt,
            delivery.max_retry,
            timeout,
        );

        debug!(task_id, attempt, routing_key = %delivery.routing_key, "Executing task");

        let handler_ctx = ctx.clone();
        let payload = delivery.payload.clone();
        let mut join = tokio::spawn(async move { handler.handle(handler_ctx, payload).await });

        let mut timed_out = false;
        let result = tokio::select! {
            res = &mut join => res,
            _ = tokio::time::sleep_until(ctx.deadline()) => {
                // The handler owns cancellation; wait for it to observe the signal.
                timed_out = true;
                ctx.cancel();
                join.await
            }
        };

        match result {
            _ if timed_out => Outcome::Failure(format!("task timed out after {timeout:?}")),
            Ok(Ok(())) => Outcome::Success,
            Ok(Err(e)) => Outcome::Failure(format!("{e:#}")),
            Err(e) if e.is_panic() => Outcome::Failure("handler panicked".to_string()),
            Err(_) => Outcome::Failure("handler was cancelled".to_string()),
        }
    }

    fn spawn_running_report(&self, task_id: &str, broker_task_id: &str, attempt: i32) {
        let Some(control_plane) = self.control_plane.clone() else {
            return;
        };

        let mut report = AttemptReport::running(attempt, &self.worker_name);
        report.broker_task_id = Some(broker_task_id.to_string());
        let task_id = task_id.to_string();
        let retry = self.report_retry.clone();
        let cancel = self.reports_cancel.clone();

        tokio::spawn(async move {
            if let Err(e) = report_with_retry(control_plane.as_ref(), &task_id, &report, &retry, &cancel).await {
                warn!(task_id = %task_id, attempt, error = %e, "Running attempt report lost");
            }
        });
    }

    async fn send_report(&self, task_id: &str, report: &AttemptReport) -> Result<(), ReportError> {
        match &self.control_plane {
            Some(cp) => {
                report_with_retry(cp.as_ref(), task_id, report, &self.report_retry, &self.reports_cancel).await
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::testing::RecordingControlPlane;
    use crate::handler::handler_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use taskhub_core::{QueueGroup, RoutingKey, TaskStatus, WorkerConfig};

    fn config() -> WorkerConfig {
        WorkerConfig::new("w1-worker", vec![QueueGroup::new("jobs", 5)])
            .normalized()
            .unwrap()
    }

    fn delivery(retry_count: i32, timeout: Duration) -> Delivery {
        Delivery {
            handle: "b-1".into(),
            task_key: Some("t1".into()),
            routing_key: RoutingKey::new("w1-worker", "jobs", "default"),
            payload: br#"{"x":1}"#.to_vec(),
            retry_count,
            max_retry: 3,
            timeout,
        }
    }

    fn executor(handlers: HandlerRegistry, cp: Arc<RecordingControlPlane>) -> TaskExecutor {
        TaskExecutor::new(
            "w1-worker",
            Arc::new(handlers),
            Some(cp as Arc<dyn ControlPlane>),
            ReportRetryConfig::default(),
            Duration::from_secs(30),
        )
    }

    async fn wait_for_reports(cp: &RecordingControlPlane, n: usize) {
        for _ in 0..100 {
            if cp.reports.lock().len() >= n {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_success_reports_running_then_success() {
        let handlers = HandlerRegistry::new();
        handlers
            .register_group(
                &config(),
                "jobs",
                Arc::new(handler_fn(|ctx: TaskContext, payload: Vec<u8>| async move {
                    assert_eq!(ctx.task_id(), "t1");
                    assert_eq!(ctx.attempt(), 2);
                    assert_eq!(payload, br#"{"x":1}"#.to_vec());
                    Ok::<(), anyhow::Error>(())
                })),
            )
            .unwrap();
        let cp = Arc::new(RecordingControlPlane::default());
        let exec = executor(handlers, cp.clone());

        let outcome = exec.execute(&delivery(1, Duration::from_secs(5))).await;
        assert_eq!(outcome, Outcome::Success);

        wait_for_reports(&cp, 2).await;
        let reports = cp.reports.lock();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|(id, r)| id == "t1" && r.attempt == 2));
        assert!(reports.iter().any(|(_, r)| r.status == TaskStatus::Running));
        let terminal = reports
            .iter()
            .find(|(_, r)| r.status == TaskStatus::Success)
            .map(|(_, r)| r.clone())
            .unwrap();
        assert_eq!(terminal.broker_task_id.as_deref(), Some("b-1"));
        assert!(terminal.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_handler_error_is_returned_and_reported() {
        let handlers = HandlerRegistry::new();
        handlers
            .register_group(
                &config(),
                "jobs",
                Arc::new(handler_fn(|_ctx, _payload| async {
                    Err::<(), anyhow::Error>(anyhow::anyhow!("upstream 502"))
                })),
            )
            .unwrap();
        let cp = Arc::new(RecordingControlPlane::default());
        let exec = executor(handlers, cp.clone());

        let outcome = exec.execute(&delivery(0, Duration::from_secs(5))).await;
        assert_eq!(outcome, Outcome::Failure("upstream 502".into()));

        wait_for_reports(&cp, 2).await;
        let reports = cp.reports.lock();
        let fail = reports.iter().find(|(_, r)| r.status == TaskStatus::Fail).unwrap();
        assert_eq!(fail.1.error, "upstream 502");
        assert_eq!(fail.1.attempt, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_context() {
        let handlers = HandlerRegistry::new();
        handlers
            .register_group(
                &config(),
                "jobs",
                Arc::new(handler_fn(|ctx: TaskContext, _payload| async move {
                    ctx.cancelled().await;
                    Err::<(), anyhow::Error>(anyhow::anyhow!("cancelled"))
                })),
            )
            .unwrap();
        let cp = Arc::new(RecordingControlPlane::default());
        let exec = executor(handlers, cp.clone());

        let outcome = exec.execute(&delivery(0, Duration::from_secs(2))).await;
        match outcome {
            Outcome::Failure(msg) => assert!(msg.contains("timed out")),
            Outcome::Success => panic!("expected timeout"),
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_attempt() {
        let handlers = HandlerRegistry::new();
        handlers
            .register_group(
                &config(),
                "jobs",
                Arc::new(handler_fn(|_ctx, _payload| async {
                    if true {
                        panic!("boom");
                    }
                    Ok::<(), anyhow::Error>(())
                })),
            )
            .unwrap();
        let exec = executor(handlers, Arc::new(RecordingControlPlane::default()));

        let outcome = exec.execute(&delivery(0, Duration::from_secs(5))).await;
        assert_eq!(outcome, Outcome::Failure("handler panicked".into()));
    }

    #[tokio::test]
    async fn test_missing_handler_fails_attempt() {
        let exec = executor(HandlerRegistry::new(), Arc::new(RecordingControlPlane::default()));
        let outcome = exec.execute(&delivery(0, Duration::from_secs(5))).await;
        assert!(matches!(outcome, Outcome::Failure(msg) if msg.contains("no handler")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_terminal_report_reaches_hook() {
        let handlers = HandlerRegistry::new();
        handlers
            .register_group(
                &config(),
                "jobs",
                Arc::new(handler_fn(|_ctx, _payload| async { Ok::<(), anyhow::Error>(()) })),
            )
            .unwrap();
        let cp = Arc::new(RecordingControlPlane::failing_reports(100));
        let lost = Arc::new(AtomicUsize::new(0));
        let counter = lost.clone();
        let exec = executor(handlers, cp).with_report_failure_hook(Arc::new(move |_e| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let outcome = exec.execute(&delivery(0, Duration::from_secs(5))).await;
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(lost.load(Ordering::SeqCst), 1);
    }
}
