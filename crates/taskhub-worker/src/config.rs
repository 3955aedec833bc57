use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use taskhub_core::worker::{
    DEFAULT_CONCURRENCY, DEFAULT_DELAY_SECONDS, DEFAULT_RETRY_COUNT, DEFAULT_TIMEOUT_SECONDS,
};
use taskhub_core::{default_priorities, QueueGroup, Result, WorkerConfig};

const DEFAULT_GROUP: &str = "default";

/// Backoff policy for attempt reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportRetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_factor: f64,
}

impl Default for ReportRetryConfig {
    fn default() -> Self {
        ReportRetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

impl ReportRetryConfig {
    /// Wait before retry number `retry` (1-based), capped at `max_backoff_ms`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0);
        let exp = retry.saturating_sub(1).min(32) as i32;
        let ms = (self.initial_backoff_ms as f64) * factor.powi(exp);
        Duration::from_millis(ms.min(self.max_backoff_ms as f64) as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub worker_name: Option<String>,
    pub control_plane_url: Option<String>,
    pub broker_address: String,
    pub queue_groups: Vec<QueueGroup>,
    pub default_retry_count: i32,
    pub default_timeout_secs: i32,
    pub default_delay_secs: i32,
    pub auto_register: bool,
    pub overwrite_registration: bool,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub report_retry: ReportRetryConfig,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            worker_name: None,
            control_plane_url: None,
            broker_address: String::new(),
            queue_groups: Vec::new(),
            default_retry_count: DEFAULT_RETRY_COUNT,
            default_timeout_secs: DEFAULT_TIMEOUT_SECONDS,
            default_delay_secs: DEFAULT_DELAY_SECONDS,
            auto_register: true,
            overwrite_registration: false,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 5,
            shutdown_timeout_secs: 30,
            report_retry: ReportRetryConfig::default(),
        }
    }
}

impl WorkerSettings {
    pub fn new(worker_name: impl Into<String>) -> Self {
        WorkerSettings {
            worker_name: Some(worker_name.into()),
            ..Default::default()
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let settings: WorkerSettings = serde_yaml::from_str(&contents)?;
        Ok(settings)
    }

    pub fn with_control_plane(mut self, url: impl Into<String>) -> Self {
        self.control_plane_url = Some(url.into());
        self
    }

    pub fn with_queue_group(mut self, group: QueueGroup) -> Self {
        self.queue_groups.push(group);
        self
    }

    /// Configured name, or the host name when none is set.
    pub fn resolve_worker_name(&self) -> String {
        if let Some(name) = self.worker_name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.trim().to_string();
        }

        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "taskhub-worker".to_string());

        // Host names may carry dots, which the worker-name class rejects.
        host.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .take(64)
            .collect()
    }

    pub fn effective_queue_groups(&self) -> Vec<QueueGroup> {
        if self.queue_groups.is_empty() {
            let mut group = QueueGroup::new(DEFAULT_GROUP, DEFAULT_CONCURRENCY);
            group.priorities = default_priorities();
            vec![group]
        } else {
            self.queue_groups.clone()
        }
    }

    /// The registration record this worker announces to the control plane.
    pub fn to_worker_config(&self) -> Result<WorkerConfig> {
        WorkerConfig {
            worker_name: self.resolve_worker_name(),
            base_url: self.control_plane_url.clone().unwrap_or_default(),
            broker_address: self.broker_address.clone(),
            queue_groups: self.effective_queue_groups(),
            default_retry_count: self.default_retry_count,
            default_timeout_seconds: self.default_timeout_secs,
            default_delay_seconds: self.default_delay_secs,
            is_enabled: true,
            last_heartbeat_at: None,
        }
        .normalized()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
