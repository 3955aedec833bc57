use crate::{ensure_task_id, PersistenceError, Result, TaskRepository, WorkerRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use taskhub_core::api::WorkerStats;
use taskhub_core::task::{
    clamp_limit, DEFAULT_FAILED_LIMIT, DEFAULT_LIST_LIMIT, MAX_FAILED_LIMIT, MAX_LIST_LIMIT,
};
use taskhub_core::{Attempt, Task, TaskFilter, TaskStatus, WorkerConfig};

#[derive(Default)]
struct TaskTable {
    /// task_id -> (insertion sequence, row)
    rows: HashMap<String, (u64, Task)>,
    next_seq: u64,
}

impl TaskTable {
    /// Rows matching `pred`, newest first.
    fn newest_first<'a>(&'a self, pred: impl Fn(&Task) -> bool) -> Vec<&'a Task> {
        let mut rows: Vec<&(u64, Task)> = self.rows.values().filter(|(_, t)| pred(t)).collect();
        rows.sort_by(|(seq_a, a), (seq_b, b)| {
            b.created_at.cmp(&a.created_at).then(seq_b.cmp(seq_a))
        });
        rows.into_iter().map(|(_, t)| t).collect()
    }
}

/// Process-local store used in development mode and tests.
#[derive(Default)]
pub struct MemoryStore {
    workers: RwLock<BTreeMap<String, WorkerConfig>>,
    tasks: RwLock<TaskTable>,
    attempts: RwLock<Vec<Attempt>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.read().len()
    }
}

#[async_trait]
impl WorkerRepository for MemoryStore {
    async fn upsert_worker(&self, config: &WorkerConfig) -> Result<()> {
        self.workers
            .write()
            .insert(config.worker_name.clone(), config.clone());
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerConfig>> {
        Ok(self.workers.read().values().cloned().collect())
    }

    async fn get_worker(&self, worker_name: &str) -> Result<Option<WorkerConfig>> {
        Ok(self.workers.read().get(worker_name).cloned())
    }

    async fn update_heartbeat(&self, worker_name: &str, at: DateTime<Utc>) -> Result<()> {
        let mut workers = self.workers.write();
        let config = workers
            .get_mut(worker_name)
            .ok_or_else(|| PersistenceError::WorkerNotFound(worker_name.to_string()))?;
        config.last_heartbeat_at = Some(at);
        Ok(())
    }

    async fn delete_worker(&self, worker_name: &str) -> Result<()> {
        self.workers
            .write()
            .remove(worker_name)
            .map(|_| ())
            .ok_or_else(|| PersistenceError::WorkerNotFound(worker_name.to_string()))
    }
}

#[async_trait]
impl TaskRepository for MemoryStore {
    async fn upsert_task(&self, task: &Task) -> Result<()> {
        ensure_task_id(task)?;
        let mut guard = self.tasks.write();
        let table = &mut *guard;
        let mut row = task.clone();
        row.updated_at = Utc::now();

        let seq = match table.rows.get(&task.task_id) {
            Some((seq, existing)) => {
                row.created_at = existing.created_at;
                *seq
            }
            None => {
                table.next_seq += 1;
                table.next_seq
            }
        };
        table.rows.insert(row.task_id.clone(), (seq, row));
        Ok(())
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        attempt: i32,
        error: &str,
        worker_name: &str,
    ) -> Result<()> {
        if let Some((_, task)) = self.tasks.write().rows.get_mut(task_id) {
            if attempt < task.last_attempt {
                return Ok(());
            }
            task.status = status;
            task.last_attempt = attempt;
            task.last_error = error.to_string();
            task.last_worker_name = worker_name.to_string();
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.read().rows.get(task_id).map(|(_, t)| t.clone()))
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let filter = filter.clone().normalized();
        let table = self.tasks.read();
        Ok(table
            .newest_first(|t| filter.matches(t))
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .cloned()
            .collect())
    }

    async fn count_tasks(&self, filter: &TaskFilter) -> Result<i64> {
        let filter = filter.clone().normalized();
        let table = self.tasks.read();
        Ok(table.rows.values().filter(|(_, t)| filter.matches(t)).count() as i64)
    }

    async fn insert_attempt(&self, attempt: &Attempt) -> Result<()> {
        self.attempts.write().push(attempt.clone());
        Ok(())
    }

    async fn list_attempts(&self, task_id: &str, limit: i64) -> Result<Vec<Attempt>> {
        let limit = clamp_limit(limit, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT) as usize;
        let attempts = self.attempts.read();
        // later inserts win ties so a terminal row sorts before its running row
        let mut rows: Vec<(usize, &Attempt)> = attempts
            .iter()
            .enumerate()
            .filter(|(_, a)| a.task_id == task_id)
            .collect();
        rows.sort_by(|(ia, a), (ib, b)| b.started_at.cmp(&a.started_at).then(ib.cmp(ia)));
        Ok(rows.into_iter().take(limit).map(|(_, a)| a.clone()).collect())
    }

    async fn list_failed_tasks(&self, worker_name: Option<&str>, limit: i64) -> Result<Vec<Task>> {
        let limit = clamp_limit(limit, DEFAULT_FAILED_LIMIT, MAX_FAILED_LIMIT) as usize;
        let table = self.tasks.read();
        Ok(table
            .newest_first(|t| {
                t.status == TaskStatus::Fail && worker_name.map_or(true, |w| t.worker_name == w)
            })
            .into_iter()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn worker_stats(&self, worker_name: &str) -> Result<WorkerStats> {
        let mut stats = WorkerStats {
            worker_name: worker_name.to_string(),
            ..Default::default()
        };

        let table = self.tasks.read();
        let mut task_ids = Vec::new();
        for (_, task) in table.rows.values().filter(|(_, t)| t.worker_name == worker_name) {
            stats.total += 1;
            *stats.by_status.entry(task.status.to_string()).or_default() += 1;
            *stats.by_queue.entry(task.queue.clone()).or_default() += 1;
            task_ids.push(task.task_id.as_str());
        }

        let attempts = self.attempts.read();
        let durations: Vec<i64> = attempts
            .iter()
            .filter(|a| a.status == TaskStatus::Success && task_ids.contains(&a.task_id.as_str()))
            .filter_map(|a| a.duration_ms)
            .collect();
        if !durations.is_empty() {
            stats.avg_duration_ms = durations.iter().sum::<i64>() as f64 / durations.len() as f64;
        }

        stats.compute_success_rate();
        Ok(stats)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use taskhub_core::{AttemptReport, QueueGroup};

    fn task(id: &str, worker: &str, status: TaskStatus) -> Task {
        let mut task = Task::pending(id, worker, "jobs", "default", 30, b"{}".to_vec());
        task.status = status;
        task
    }

    fn worker(name: &str) -> WorkerConfig {
        WorkerConfig::new(name, vec![QueueGroup::new("jobs", 2)])
            .normalized()
            .unwrap()
    }

    #[tokio::test]
    async fn test_worker_crud() {
        let store = MemoryStore::new();
        store.upsert_worker(&worker("zeta-worker")).await.unwrap();
        store.upsert_worker(&worker("alpha-worker")).await.unwrap();

        let names: Vec<_> = store
            .list_workers()
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.worker_name)
            .collect();
        assert_eq!(names, vec!["alpha-worker", "zeta-worker"]);

        let at = Utc::now();
        store.update_heartbeat("alpha-worker", at).await.unwrap();
        let fetched = store.get_worker("alpha-worker").await.unwrap().unwrap();
        assert_eq!(fetched.last_heartbeat_at, Some(at));

        assert!(matches!(
            store.update_heartbeat("ghost-worker", at).await,
            Err(PersistenceError::WorkerNotFound(_))
        ));

        store.delete_worker("zeta-worker").await.unwrap();
        assert!(store.get_worker("zeta-worker").await.unwrap().is_none());
        assert!(store.delete_worker("zeta-worker").await.is_err());
    }

    #[tokio::test]
    async fn test_upsert_task_requires_id() {
        let store = MemoryStore::new();
        let err = store
            .upsert_task(&task("", "w1-worker", TaskStatus::Pending))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_upsert_task_keeps_created_at() {
        let store = MemoryStore::new();
        let mut row = task("t-1", "w1-worker", TaskStatus::Pending);
        store.upsert_task(&row).await.unwrap();
        let created = store.get_task("t-1").await.unwrap().unwrap().created_at;

        row.created_at = created + Duration::hours(1);
        row.status = TaskStatus::Running;
        store.upsert_task(&row).await.unwrap();

        let stored = store.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(stored.created_at, created);
        assert_eq!(stored.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_update_status_unknown_task_is_noop() {
        let store = MemoryStore::new();
        store
            .update_task_status("ghost", TaskStatus::Success, 1, "", "w1-worker")
            .await
            .unwrap();
        assert!(store.get_task("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_status_ignores_older_attempt() {
        let store = MemoryStore::new();
        store
            .upsert_task(&task("t-1", "w1-worker", TaskStatus::Running))
            .await
            .unwrap();
        store
            .update_task_status("t-1", TaskStatus::Fail, 3, "boom", "host-a")
            .await
            .unwrap();
        store
            .update_task_status("t-1", TaskStatus::Fail, 2, "late", "host-b")
            .await
            .unwrap();

        let stored = store.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(stored.last_attempt, 3);
        assert_eq!(stored.last_error, "boom");
        assert_eq!(stored.last_worker_name, "host-a");
    }

    #[tokio::test]
    async fn test_list_and_count_share_filter() {
        let store = MemoryStore::new();
        for i in 0..5 {
            let status = if i % 2 == 0 { TaskStatus::Fail } else { TaskStatus::Success };
            store
                .upsert_task(&task(&format!("t-{i}"), "w1-worker", status))
                .await
                .unwrap();
        }
        store
            .upsert_task(&task("other", "w2-worker", TaskStatus::Fail))
            .await
            .unwrap();

        let filter = TaskFilter::for_worker("w1-worker")
            .with_status(TaskStatus::Fail)
            .with_limit(2);
        let page = store.list_tasks(&filter).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].task_id, "t-4");
        assert_eq!(store.count_tasks(&filter).await.unwrap(), 3);

        let second = store
            .list_tasks(&TaskFilter { offset: 2, ..filter.clone() })
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].task_id, "t-0");
    }

    #[tokio::test]
    async fn test_failed_tasks_newest_first() {
        let store = MemoryStore::new();
        store.upsert_task(&task("a", "w1-worker", TaskStatus::Fail)).await.unwrap();
        store.upsert_task(&task("b", "w1-worker", TaskStatus::Success)).await.unwrap();
        store.upsert_task(&task("c", "w2-worker", TaskStatus::Fail)).await.unwrap();

        let all: Vec<_> = store
            .list_failed_tasks(None, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        assert_eq!(all, vec!["c", "a"]);

        let scoped = store.list_failed_tasks(Some("w1-worker"), 10).await.unwrap();
        assert_eq!(scoped.len(), 1);
    }

    #[tokio::test]
    async fn test_attempts_and_stats() {
        let store = MemoryStore::new();
        store
            .upsert_task(&task("t-1", "w1-worker", TaskStatus::Success))
            .await
            .unwrap();
        store
            .upsert_task(&task("t-2", "w1-worker", TaskStatus::Fail))
            .await
            .unwrap();

        let started = Utc::now();
        let running = AttemptReport::running(1, "host-a");
        let done = AttemptReport::finished(1, "host-a", started, started + Duration::milliseconds(120), None);
        store.insert_attempt(&running.into_attempt("t-1")).await.unwrap();
        store.insert_attempt(&done.into_attempt("t-1")).await.unwrap();

        let attempts = store.list_attempts("t-1", 0).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert!(store.list_attempts("t-2", 10).await.unwrap().is_empty());

        let stats = store.worker_stats("w1-worker").await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_status["success"], 1);
        assert_eq!(stats.by_queue["jobs"], 2);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((stats.avg_duration_ms - 120.0).abs() < f64::EPSILON);
    }
}
