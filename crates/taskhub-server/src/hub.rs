use crate::config::HubConfig;
use crate::engine::{BatchRetryFilter, BatchRetryOutcome, EnqueueEngine, Enqueued, NewTask};
use crate::ledger::{ReportEffect, TaskLedger};
use crate::metrics::HubMetrics;
use crate::worker_registry::WorkerRegistry;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use taskhub_broker::{BrokerClient, MemoryBroker};
use taskhub_core::api::{
    ClearQueueRequest, QueueStatsEntry, RegisterWorkerRequest, RegisterWorkerResponse,
};
use taskhub_core::validation::{validate_queue_name, validate_worker_name};
use taskhub_core::{AttemptReport, HubError, Result, TaskStatus, WorkerConfig};
use taskhub_persistence::{
    MemoryStore, MetadataStore, PersistenceError, PostgresStore, TaskRepository,
    WorkerRepository,
};
use tokio::sync::Notify;
use tracing::{info, warn};

/// The control plane: registry, ledger and engine wired to one store and broker.
pub struct Hub {
    registry: Arc<WorkerRegistry>,
    ledger: Arc<TaskLedger>,
    engine: EnqueueEngine,
    store: Arc<dyn MetadataStore>,
    broker: Option<Arc<dyn BrokerClient>>,
    metrics: Arc<HubMetrics>,
    shutdown: Notify,
}

impl Hub {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        broker: Option<Arc<dyn BrokerClient>>,
        metrics: Arc<HubMetrics>,
    ) -> Self {
        let registry = Arc::new(WorkerRegistry::new());
        let ledger = Arc::new(TaskLedger::new(store.clone()));
        let engine = EnqueueEngine::new(registry.clone(), ledger.clone(), broker.clone());

        Hub {
            registry,
            ledger,
            engine,
            store,
            broker,
            metrics,
            shutdown: Notify::new(),
        }
    }

    /// Build a hub from configuration and replay persisted workers.
    pub async fn open(config: &HubConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn MetadataStore> = match config.pool_settings() {
            Some(settings) => {
                let store = PostgresStore::connect(&settings).await?;
                if config.database.run_migrations {
                    store.migrate().await?;
                }
                Arc::new(store)
            }
            None => {
                warn!("No database URL configured, metadata is kept in memory only");
                Arc::new(MemoryStore::new())
            }
        };

        let broker: Option<Arc<dyn BrokerClient>> = if config.broker.enabled {
            Some(Arc::new(MemoryBroker::new(config.memory_broker_config())))
        } else {
            warn!("Broker disabled, task submission will be rejected");
            None
        };

        let hub = Hub::new(store, broker, Arc::new(HubMetrics::new()?));
        hub.bootstrap().await?;
        Ok(hub)
    }

    /// Load every persisted worker into the registry before serving traffic.
    pub async fn bootstrap(&self) -> Result<usize> {
        let workers = self.store.list_workers().await?;
        let loaded = self.registry.load(workers);
        self.metrics.registered_workers.set(self.registry.count() as i64);
        info!(workers = loaded, "Worker registry restored");
        Ok(loaded)
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<TaskLedger> {
        &self.ledger
    }

    pub fn metrics(&self) -> &Arc<HubMetrics> {
        &self.metrics
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    /// Resolves once [`Hub::shutdown`] is called after this future was first polled.
    pub async fn wait_for_shutdown(&self) {
        self.shutdown.notified().await;
    }

    /// Worker self-registration. An existing worker is left alone unless
    /// `overwrite` is set.
    pub async fn register_worker(&self, req: RegisterWorkerRequest) -> Result<RegisterWorkerResponse> {
        let name = req.worker_name.trim().to_string();
        if !req.overwrite && self.registry.contains(&name) {
            info!(worker_name = %name, "Worker already registered, keeping stored config");
            return Ok(RegisterWorkerResponse {
                status: "ok".into(),
                message: Some(format!("worker {name} already registered, overwrite=false")),
                worker: None,
            });
        }

        let mut config = req.into_config();
        config.is_enabled = true;
        config.last_heartbeat_at = Some(Utc::now());
        let stored = self.save_worker(config).await?;

        info!(
            worker_name = %stored.worker_name,
            queue_groups = stored.queue_groups.len(),
            "Worker registered"
        );
        Ok(RegisterWorkerResponse {
            status: "registered".into(),
            message: None,
            worker: Some(stored),
        })
    }

    /// Admin create or overwrite; the request's `is_enabled` is kept.
    pub async fn upsert_worker(&self, config: WorkerConfig) -> Result<WorkerConfig> {
        let stored = self.save_worker(config).await?;
        info!(worker_name = %stored.worker_name, enabled = stored.is_enabled, "Worker saved");
        Ok(stored)
    }

    async fn save_worker(&self, config: WorkerConfig) -> Result<WorkerConfig> {
        let stored = self.registry.upsert(config)?;
        self.store.upsert_worker(&stored).await?;
        self.metrics.registered_workers.set(self.registry.count() as i64);
        Ok(stored)
    }

    pub fn list_workers(&self) -> Vec<WorkerConfig> {
        self.registry.list()
    }

    pub fn get_worker(&self, worker_name: &str) -> Result<WorkerConfig> {
        self.registry
            .get(worker_name)
            .ok_or_else(|| HubError::NotFound(format!("worker {worker_name} not found")))
    }

    pub async fn delete_worker(&self, worker_name: &str) -> Result<()> {
        self.registry.delete(worker_name)?;
        match self.store.delete_worker(worker_name).await {
            Ok(()) | Err(PersistenceError::WorkerNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.metrics.registered_workers.set(self.registry.count() as i64);
        info!(worker_name, "Worker deleted");
        Ok(())
    }

    /// Liveness stamp. Mirroring failures are logged, never returned.
    pub async fn heartbeat(&self, worker_name: &str) -> Result<DateTime<Utc>> {
        let updated = self.registry.update_heartbeat(worker_name)?;
        let at = updated.last_heartbeat_at.unwrap_or_else(Utc::now);

        if let Err(e) = self.store.update_heartbeat(worker_name, at).await {
            warn!(worker_name, error = %e, "Failed to persist heartbeat");
        }
        self.metrics.heartbeats.inc();
        Ok(at)
    }

    pub async fn create_task(&self, req: NewTask) -> Result<Enqueued> {
        let worker = req.worker_name.clone();
        let queue = req.queue.clone();
        let enqueued = self.engine.create_task(req).await?;
        self.metrics.inc_enqueued(&worker, &queue);
        Ok(enqueued)
    }

    pub async fn replay(&self, task_id: &str, delay_seconds: Option<i64>) -> Result<Enqueued> {
        let enqueued = self.engine.replay(task_id, delay_seconds).await?;
        self.metrics.replays.inc();
        Ok(enqueued)
    }

    pub async fn batch_retry(&self, filter: BatchRetryFilter) -> Result<BatchRetryOutcome> {
        let outcome = self.engine.batch_retry(filter).await?;
        self.metrics.replays.inc_by(outcome.retried_count as u64);
        self.metrics
            .batch_retry_failures
            .inc_by(outcome.failed_task_ids.len() as u64);
        Ok(outcome)
    }

    pub async fn report_attempt(&self, task_id: &str, report: AttemptReport) -> Result<ReportEffect> {
        let status = report.status;
        let duration_ms = report.effective_duration_ms();
        let worker_name = report.worker_name.clone();

        let effect = self.ledger.report_attempt(task_id, report).await?;

        self.metrics.inc_attempt_report(status.as_str());
        if status == TaskStatus::Success || status == TaskStatus::Fail {
            if let Some(ms) = duration_ms {
                self.metrics.observe_attempt_duration(&worker_name, ms);
            }
        }
        Ok(effect)
    }

    /// Broker counters for every routing key of a worker.
    pub async fn queue_stats(&self, worker_name: &str) -> Result<Vec<QueueStatsEntry>> {
        validate_worker_name(worker_name)?;
        let broker = self.engine.broker()?;
        let mut entries = Vec::new();
        for key in self.registry.routing_keys(worker_name, None, None)? {
            let counters = broker.inspect(&key).await?;
            entries.push(QueueStatsEntry {
                routing_key: key.to_string(),
                queue: key.queue_group.clone(),
                priority: key.priority.clone(),
                counters,
            });
        }
        Ok(entries)
    }

    /// Purge pending (or archived) entries on the matching routing keys.
    pub async fn clear_queue(&self, req: &ClearQueueRequest, archived: bool) -> Result<i64> {
        validate_worker_name(&req.worker_name)?;
        let queue = req.queue.as_deref().filter(|q| !q.is_empty());
        let priority = req.priority.as_deref().filter(|p| !p.is_empty());
        if let Some(q) = queue {
            validate_queue_name(q)?;
        }
        if let Some(p) = priority {
            validate_queue_name(p)?;
        }

        let broker = self.engine.broker()?;
        let mut deleted = 0;
        for key in self.registry.routing_keys(&req.worker_name, queue, priority)? {
            deleted += if archived {
                broker.delete_archived(&key).await?
            } else {
                broker.delete_pending(&key).await?
            };
        }

        info!(
            worker_name = %req.worker_name,
            deleted,
            archived,
            "Queue cleared"
        );
        Ok(deleted)
    }

    /// Store reachable and broker available.
    pub async fn ready(&self) -> Result<()> {
        self.store.ping().await?;
        match &self.broker {
            Some(broker) => Ok(broker.ping().await?),
            None => Err(HubError::Transport("broker client is not configured".into())),
        }
    }
}
