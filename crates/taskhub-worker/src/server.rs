use crate::executor::TaskExecutor;
use std::sync::Arc;
use std::time::Duration;
use taskhub_broker::{BrokerConsumer, BrokerError};
use taskhub_core::{QueueGroup, RoutingKey};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const FETCH_WAIT: Duration = Duration::from_secs(1);
const FETCH_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Execution server for one queue group, with its own concurrency budget.
pub struct QueueGroupServer {
    group: String,
    concurrency: usize,
    queues: Vec<(RoutingKey, i32)>,
    consumer: Arc<dyn BrokerConsumer>,
    executor: Arc<TaskExecutor>,
    shutdown_timeout: Duration,
}

impl QueueGroupServer {
    pub fn new(
        group: &QueueGroup,
        queues: Vec<(RoutingKey, i32)>,
        consumer: Arc<dyn BrokerConsumer>,
        executor: Arc<TaskExecutor>,
        shutdown_timeout: Duration,
    ) -> Self {
        QueueGroupServer {
            group: group.name.clone(),
            concurrency: group.concurrency.max(1) as usize,
            queues,
            consumer,
            executor,
            shutdown_timeout,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Fetch and execute until `shutdown` fires, then drain in-flight work.
    ///
    /// Returns an error only when the broker is gone for good.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), BrokerError> {
        info!(
            queue_group = %self.group,
            concurrency = self.concurrency,
            queues = self.queues.len(),
            "Queue group server started"
        );

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = JoinSet::new();
        let mut fatal = None;

        loop {
            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.cancelled() => break,
            };

            // Reap finished executions so the set stays bounded.
            while in_flight.try_join_next().is_some() {}

            let fetched = tokio::select! {
                res = self.consumer.fetch(&self.queues, FETCH_WAIT) => res,
                _ = shutdown.cancelled() => break,
            };

            let delivery = match fetched {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(BrokerError::Closed) => {
                    fatal = Some(BrokerError::Closed);
                    break;
                }
                Err(e) => {
                    warn!(queue_group = %self.group, error = %e, "Fetch failed");
                    tokio::time::sleep(FETCH_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let consumer = self.consumer.clone();
            let executor = self.executor.clone();
            in_flight.spawn(async move {
                let outcome = executor.execute(&delivery).await;
                if let Err(e) = consumer.finish(&delivery, outcome).await {
                    error!(task_id = %delivery.task_id(), error = %e, "Failed to acknowledge delivery");
                }
                drop(permit);
            });
        }

        self.drain(&mut in_flight).await;

        match fatal {
            Some(e) => {
                error!(queue_group = %self.group, error = %e, "Queue group server stopped on broker error");
                Err(e)
            }
            None => {
                info!(queue_group = %self.group, "Queue group server stopped");
                Ok(())
            }
        }
    }

    async fn drain(&self, in_flight: &mut JoinSet<()>) {
        if in_flight.is_empty() {
            return;
        }
        info!(queue_group = %self.group, active = in_flight.len(), "Waiting for active tasks to complete");

        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                queue_group = %self.group,
                active = in_flight.len(),
                "Shutdown deadline exceeded, aborting remaining tasks"
            );
            self.executor.abort_reports();
            in_flight.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReportRetryConfig;
    use crate::handler::{handler_fn, HandlerRegistry, TaskContext};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use taskhub_broker::{BrokerClient, MemoryBroker, SubmitOptions};
    use taskhub_core::WorkerConfig;

    fn config(concurrency: i32) -> WorkerConfig {
        WorkerConfig::new("w1-worker", vec![QueueGroup::new("jobs", concurrency)])
            .normalized()
            .unwrap()
    }

    fn server(
        config: &WorkerConfig,
        broker: Arc<MemoryBroker>,
        handlers: HandlerRegistry,
    ) -> QueueGroupServer {
        let executor = TaskExecutor::new(
            "w1-worker",
            Arc::new(handlers),
            None,
            ReportRetryConfig::default(),
            Duration::from_secs(30),
        );
        QueueGroupServer::new(
            &config.queue_groups[0],
            config.routing_keys("jobs"),
            broker,
            Arc::new(executor),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_processes_and_drains() {
        let config = config(2);
        let broker = Arc::new(MemoryBroker::default());
        let done = Arc::new(AtomicUsize::new(0));

        let handlers = HandlerRegistry::new();
        let counter = done.clone();
        handlers
            .register_group(
                &config,
                "jobs",
                Arc::new(handler_fn(move |_ctx: TaskContext, _payload: Vec<u8>| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), anyhow::Error>(())
                    }
                })),
            )
            .unwrap();

        for _ in 0..5 {
            broker
                .submit(&config.routing_key("jobs", "default"), b"{}".to_vec(), SubmitOptions::default())
                .await
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server(&config, broker.clone(), handlers).run(shutdown.clone()));

        for _ in 0..200 {
            if done.load(Ordering::SeqCst) == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(done.load(Ordering::SeqCst), 5);
        let counters = broker.inspect(&config.routing_key("jobs", "default")).await.unwrap();
        assert_eq!(counters.completed, 5);
        assert_eq!(counters.pending, 0);
    }

    #[tokio::test]
    async fn test_closed_broker_is_fatal() {
        let config = config(1);
        let broker = Arc::new(MemoryBroker::default());
        broker.close();

        let result = server(&config, broker, HandlerRegistry::new())
            .run(CancellationToken::new())
            .await;
        assert!(matches!(result, Err(BrokerError::Closed)));
    }
}
