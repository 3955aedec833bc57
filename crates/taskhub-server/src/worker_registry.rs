use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use taskhub_core::{HubError, Result, RoutingKey, WorkerConfig};

/// In-memory table of worker configurations keyed by worker name.
///
/// The registry has no durability of its own; callers mirror every successful
/// upsert and heartbeat to the metadata store and replay the store into a
/// fresh registry on startup.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerConfig>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate, fill defaults and replace the stored row atomically.
    pub fn upsert(&self, config: WorkerConfig) -> Result<WorkerConfig> {
        let config = config.normalized()?;
        let mut workers = self.workers.write();
        workers.insert(config.worker_name.clone(), config.clone());
        Ok(config)
    }

    /// Bulk load persisted rows; rows that no longer validate are skipped.
    pub fn load(&self, configs: Vec<WorkerConfig>) -> usize {
        let mut workers = self.workers.write();
        let mut loaded = 0;
        for config in configs {
            match config.normalized() {
                Ok(config) => {
                    workers.insert(config.worker_name.clone(), config);
                    loaded += 1;
                }
                Err(e) => tracing::warn!(error = %e, "Skipping invalid persisted worker"),
            }
        }
        loaded
    }

    pub fn get(&self, worker_name: &str) -> Option<WorkerConfig> {
        let workers = self.workers.read();
        workers.get(worker_name).cloned()
    }

    pub fn contains(&self, worker_name: &str) -> bool {
        self.workers.read().contains_key(worker_name)
    }

    /// All workers ordered by name.
    pub fn list(&self) -> Vec<WorkerConfig> {
        let workers = self.workers.read();
        let mut list: Vec<WorkerConfig> = workers.values().cloned().collect();
        list.sort_by(|a, b| a.worker_name.cmp(&b.worker_name));
        list
    }

    pub fn delete(&self, worker_name: &str) -> Result<()> {
        let mut workers = self.workers.write();
        workers
            .remove(worker_name)
            .map(|_| ())
            .ok_or_else(|| not_found(worker_name))
    }

    pub fn has_queue_group(&self, worker_name: &str, group: &str) -> bool {
        let workers = self.workers.read();
        workers
            .get(worker_name)
            .map(|w| w.has_queue_group(group))
            .unwrap_or(false)
    }

    pub fn has_queue_with_priority(&self, worker_name: &str, group: &str, priority: &str) -> bool {
        let workers = self.workers.read();
        workers
            .get(worker_name)
            .map(|w| w.has_queue_with_priority(group, priority))
            .unwrap_or(false)
    }

    /// Routing keys of a worker, optionally narrowed to one group and priority.
    pub fn routing_keys(
        &self,
        worker_name: &str,
        group: Option<&str>,
        priority: Option<&str>,
    ) -> Result<Vec<RoutingKey>> {
        let config = self.get(worker_name).ok_or_else(|| not_found(worker_name))?;
        Ok(config
            .all_routing_keys()
            .into_iter()
            .filter(|k| group.map_or(true, |g| k.queue_group == g))
            .filter(|k| priority.map_or(true, |p| k.priority == p))
            .collect())
    }

    /// Stamp `last_heartbeat_at = now` and return the stored config.
    pub fn update_heartbeat(&self, worker_name: &str) -> Result<WorkerConfig> {
        self.update_heartbeat_at(worker_name, Utc::now())
    }

    pub fn update_heartbeat_at(&self, worker_name: &str, at: DateTime<Utc>) -> Result<WorkerConfig> {
        let mut workers = self.workers.write();
        let worker = workers
            .get_mut(worker_name)
            .ok_or_else(|| not_found(worker_name))?;
        worker.last_heartbeat_at = Some(at);
        Ok(worker.clone())
    }

    pub fn count(&self) -> usize {
        self.workers.read().len()
    }
}

fn not_found(worker_name: &str) -> HubError {
    HubError::NotFound(format!("worker {worker_name} not found"))
}
