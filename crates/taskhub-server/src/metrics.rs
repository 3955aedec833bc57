use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Prometheus metrics for the control plane
pub struct HubMetrics {
    pub registry: Registry,

    pub tasks_enqueued: IntCounterVec,
    pub attempt_reports: IntCounterVec,
    pub attempt_duration: HistogramVec,
    pub replays: IntCounter,
    pub batch_retry_failures: IntCounter,
    pub heartbeats: IntCounter,
    pub registered_workers: IntGauge,
}

impl HubMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let tasks_enqueued = IntCounterVec::new(
            Opts::new("taskhub_tasks_enqueued_total", "Tasks accepted by the broker"),
            &["worker", "queue"],
        )?;
        registry.register(Box::new(tasks_enqueued.clone()))?;

        let attempt_reports = IntCounterVec::new(
            Opts::new("taskhub_attempt_reports_total", "Attempt reports received by status"),
            &["status"],
        )?;
        registry.register(Box::new(attempt_reports.clone()))?;

        let attempt_duration = HistogramVec::new(
            HistogramOpts::new(
                "taskhub_attempt_duration_seconds",
                "Duration of finished attempts in seconds",
            ),
            &["worker"],
        )?;
        registry.register(Box::new(attempt_duration.clone()))?;

        let replays = IntCounter::new("taskhub_replays_total", "Tasks replayed under a new id")?;
        registry.register(Box::new(replays.clone()))?;

        let batch_retry_failures = IntCounter::new(
            "taskhub_batch_retry_failures_total",
            "Batch retry candidates that could not be re-submitted",
        )?;
        registry.register(Box::new(batch_retry_failures.clone()))?;

        let heartbeats = IntCounter::new("taskhub_heartbeats_total", "Worker heartbeats accepted")?;
        registry.register(Box::new(heartbeats.clone()))?;

        let registered_workers =
            IntGauge::new("taskhub_registered_workers", "Workers in the registry")?;
        registry.register(Box::new(registered_workers.clone()))?;

        Ok(HubMetrics {
            registry,
            tasks_enqueued,
            attempt_reports,
            attempt_duration,
            replays,
            batch_retry_failures,
            heartbeats,
            registered_workers,
        })
    }

    pub fn inc_enqueued(&self, worker: &str, queue: &str) {
        self.tasks_enqueued.with_label_values(&[worker, queue]).inc();
    }

    pub fn inc_attempt_report(&self, status: &str) {
        self.attempt_reports.with_label_values(&[status]).inc();
    }

    pub fn observe_attempt_duration(&self, worker: &str, duration_ms: i64) {
        self.attempt_duration
            .with_label_values(&[worker])
            .observe(duration_ms.max(0) as f64 / 1000.0);
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
