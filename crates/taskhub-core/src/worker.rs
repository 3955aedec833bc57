use crate::priority::{default_priorities, PriorityWeights};
use crate::routing::RoutingKey;
use crate::validation::{validate_queue_name, validate_worker_name};
use crate::{HubError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const DEFAULT_CONCURRENCY: i32 = 10;
pub const DEFAULT_RETRY_COUNT: i32 = 3;
pub const DEFAULT_TIMEOUT_SECONDS: i32 = 30;
pub const DEFAULT_DELAY_SECONDS: i32 = 0;

/// A named bundle of work for one worker, split into weighted priority channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueGroup {
    pub name: String,
    #[serde(default)]
    pub concurrency: i32,
    #[serde(default)]
    pub priorities: PriorityWeights,
}

impl QueueGroup {
    pub fn new(name: impl Into<String>, concurrency: i32) -> Self {
        QueueGroup {
            name: name.into(),
            concurrency,
            priorities: PriorityWeights::new(),
        }
    }

    pub fn with_priority(mut self, name: impl Into<String>, weight: i32) -> Self {
        self.priorities.insert(name.into(), weight);
        self
    }

    pub fn has_priority(&self, priority: &str) -> bool {
        self.priorities.contains_key(priority)
    }

    fn normalize(&mut self) -> Result<()> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err(HubError::Validation("queue group name is required".into()));
        }
        validate_queue_name(&self.name)?;

        if self.concurrency <= 0 {
            self.concurrency = DEFAULT_CONCURRENCY;
        }

        if self.priorities.is_empty() {
            self.priorities = default_priorities();
        }
        for (priority, weight) in &self.priorities {
            validate_queue_name(priority)?;
            if *weight <= 0 {
                return Err(HubError::Validation(format!(
                    "priority {priority:?} of queue group {:?} must have a positive weight",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Registered identity of a worker process and everything needed to route to it.
///
/// Always stored whole: an upsert replaces the previous row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
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
    #[serde(default = "enabled_by_default")]
    pub is_enabled: bool,
    #[serde(default)]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

fn enabled_by_default() -> bool {
    true
}

impl WorkerConfig {
    pub fn new(worker_name: impl Into<String>, queue_groups: Vec<QueueGroup>) -> Self {
        WorkerConfig {
            worker_name: worker_name.into(),
            base_url: String::new(),
            broker_address: String::new(),
            queue_groups,
            default_retry_count: 0,
            default_timeout_seconds: 0,
            default_delay_seconds: 0,
            is_enabled: true,
            last_heartbeat_at: None,
        }
    }

    /// Validate structure and fill defaults in place.
    ///
    /// Idempotent: normalizing an already normalized config is a no-op.
    pub fn normalize(&mut self) -> Result<()> {
        self.worker_name = self.worker_name.trim().to_string();
        if self.worker_name.is_empty() {
            return Err(HubError::Validation("worker_name is required".into()));
        }
        validate_worker_name(&self.worker_name)?;

        if self.queue_groups.is_empty() {
            return Err(HubError::Validation(format!(
                "worker {} must declare at least one queue group",
                self.worker_name
            )));
        }

        let mut seen = HashSet::new();
        for group in &mut self.queue_groups {
            group.normalize()?;
            if !seen.insert(group.name.clone()) {
                return Err(HubError::Validation(format!(
                    "duplicate queue group {:?} for worker {}",
                    group.name, self.worker_name
                )));
            }
        }

        if self.default_retry_count <= 0 {
            self.default_retry_count = DEFAULT_RETRY_COUNT;
        }
        if self.default_timeout_seconds <= 0 {
            self.default_timeout_seconds = DEFAULT_TIMEOUT_SECONDS;
        }
        if self.default_delay_seconds < 0 {
            self.default_delay_seconds = DEFAULT_DELAY_SECONDS;
        }
        Ok(())
    }

    pub fn normalized(mut self) -> Result<Self> {
        self.normalize()?;
        Ok(self)
    }

    pub fn queue_group(&self, name: &str) -> Option<&QueueGroup> {
        self.queue_groups.iter().find(|g| g.name == name)
    }

    pub fn has_queue_group(&self, name: &str) -> bool {
        self.queue_group(name).is_some()
    }

    pub fn has_queue_with_priority(&self, group: &str, priority: &str) -> bool {
        self.queue_group(group)
            .map(|g| g.has_priority(priority))
            .unwrap_or(false)
    }

    /// Weight of `priority` inside `group`, if declared.
    pub fn priority_weight(&self, group: &str, priority: &str) -> Option<i32> {
        self.queue_group(group)
            .and_then(|g| g.priorities.get(priority).copied())
    }

    pub fn routing_key(&self, group: &str, priority: &str) -> RoutingKey {
        RoutingKey::new(&self.worker_name, group, priority)
    }

    /// Every routing key of one group paired with its dequeue weight.
    pub fn routing_keys(&self, group: &str) -> Vec<(RoutingKey, i32)> {
        self.queue_group(group)
            .map(|g| {
                g.priorities
                    .iter()
                    .map(|(priority, weight)| (self.routing_key(&g.name, priority), *weight))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Routing keys of every declared group.
    pub fn all_routing_keys(&self) -> Vec<RoutingKey> {
        self.queue_groups
            .iter()
            .flat_map(|g| self.routing_keys(&g.name))
            .map(|(key, _)| key)
            .collect()
    }
}
