use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use taskhub_core::{HubError, Result, RoutingKey, WorkerConfig};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Result type for task handlers
pub type HandlerResult = anyhow::Result<()>;

/// Execution context handed to a handler for one attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: String,
    broker_task_id: String,
    routing_key: RoutingKey,
    attempt: i32,
    max_retry: i32,
    deadline: Instant,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(
        task_id: impl Into<String>,
        broker_task_id: impl Into<String>,
        routing_key: RoutingKey,
        attempt: i32,
        max_retry: i32,
        timeout: Duration,
    ) -> Self {
        TaskContext {
            task_id: task_id.into(),
            broker_task_id: broker_task_id.into(),
            routing_key,
            attempt,
            max_retry,
            deadline: Instant::now() + timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn broker_task_id(&self) -> &str {
        &self.broker_task_id
    }

    pub fn routing_key(&self) -> &RoutingKey {
        &self.routing_key
    }

    pub fn queue_group(&self) -> &str {
        &self.routing_key.queue_group
    }

    pub fn priority(&self) -> &str {
        &self.routing_key.priority
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> i32 {
        self.attempt
    }

    pub fn max_retry(&self) -> i32 {
        self.max_retry
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_timeout(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the attempt times out or the worker cancels it.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Trait for task handlers
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Process one delivery. The payload is the bytes submitted at enqueue time.
    async fn handle(&self, ctx: TaskContext, payload: Vec<u8>) -> HandlerResult;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskContext, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, ctx: TaskContext, payload: Vec<u8>) -> HandlerResult {
        (self.0)(ctx, payload).await
    }
}

/// Registry of task handlers by routing key
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<RoutingKey, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `handler` to every priority of `group`. Keys that already have a
    /// handler keep it. Returns how many keys were newly bound.
    pub fn register_group(
        &self,
        config: &WorkerConfig,
        group: &str,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<usize> {
        if !config.has_queue_group(group) {
            return Err(HubError::Routing(format!(
                "queue group {group} is not declared by worker {}",
                config.worker_name
            )));
        }

        let mut handlers = self.handlers.write();
        let mut bound = 0;
        for (key, _) in config.routing_keys(group) {
            if !handlers.contains_key(&key) {
                handlers.insert(key, handler.clone());
                bound += 1;
            }
        }
        Ok(bound)
    }

    /// Attach `handler` to a single priority channel of `group`.
    pub fn register_priority(
        &self,
        config: &WorkerConfig,
        group: &str,
        priority: &str,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<bool> {
        if !config.has_queue_with_priority(group, priority) {
            return Err(HubError::Routing(format!(
                "priority {priority} is not declared in queue group {group}"
            )));
        }

        let key = config.routing_key(group, priority);
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&key) {
            return Ok(false);
        }
        handlers.insert(key, handler);
        Ok(true)
    }

    pub fn get(&self, key: &RoutingKey) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().get(key).cloned()
    }

    pub fn has_handler(&self, key: &RoutingKey) -> bool {
        self.handlers.read().contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskhub_core::QueueGroup;

    fn config() -> WorkerConfig {
        WorkerConfig::new("w1-worker", vec![QueueGroup::new("jobs", 5), QueueGroup::new("mail", 1)])
            .normalized()
            .unwrap()
    }

    fn noop() -> Arc<dyn TaskHandler> {
        Arc::new(handler_fn(|_ctx, _payload| async { Ok::<(), anyhow::Error>(()) }))
    }

    #[test]
    fn test_group_registration_fans_out() {
        let registry = HandlerRegistry::new();
        let config = config();

        assert_eq!(registry.register_group(&config, "jobs", noop()).unwrap(), 3);
        for priority in ["critical", "default", "low"] {
            assert!(registry.has_handler(&RoutingKey::new("w1-worker", "jobs", priority)));
        }
        assert!(!registry.has_handler(&RoutingKey::new("w1-worker", "mail", "default")));
    }

    #[test]
    fn test_first_registration_wins() {
        let registry = HandlerRegistry::new();
        let config = config();

        assert!(registry.register_priority(&config, "jobs", "critical", noop()).unwrap());
        assert!(!registry.register_priority(&config, "jobs", "critical", noop()).unwrap());
        assert_eq!(registry.register_group(&config, "jobs", noop()).unwrap(), 2);
    }

    #[test]
    fn test_undeclared_targets_are_rejected() {
        let registry = HandlerRegistry::new();
        let config = config();

        assert!(matches!(
            registry.register_group(&config, "video", noop()),
            Err(HubError::Routing(_))
        ));
        assert!(matches!(
            registry.register_priority(&config, "jobs", "urgent", noop()),
            Err(HubError::Routing(_))
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_deadline() {
        let ctx = TaskContext::new(
            "t1",
            "b1",
            RoutingKey::new("w1-worker", "jobs", "low"),
            1,
            3,
            Duration::from_secs(5),
        );
        assert_eq!(ctx.queue_group(), "jobs");
        assert_eq!(ctx.priority(), "low");
        assert!(!ctx.is_timeout());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(ctx.is_timeout());
        assert_eq!(ctx.remaining(), Duration::ZERO);

        assert!(!ctx.is_cancelled());
        ctx.cancel();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }
}
