//! Contracts between the control plane, the worker runtime and the queue broker.
//!
//! The broker owns delivery, retry counting and dead-lettering. The control
//! plane only submits, inspects and purges through [`BrokerClient`]; workers
//! only pull and acknowledge through [`BrokerConsumer`].

mod error;
pub mod memory;

pub use error::{BrokerError, Result};
pub use memory::{MemoryBroker, MemoryBrokerConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use taskhub_core::api::QueueCounters;
use taskhub_core::RoutingKey;

/// Trailing window in which a repeated task key is refused.
pub const UNIQUE_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// When a submitted task becomes eligible for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Schedule {
    #[default]
    Now,
    After(Duration),
    At(DateTime<Utc>),
}

impl Schedule {
    /// `run_at` wins over `delay`; a non-positive delay means now.
    pub fn from_request(delay_seconds: Option<i64>, run_at: Option<DateTime<Utc>>) -> Self {
        match (run_at, delay_seconds) {
            (Some(at), _) => Schedule::At(at),
            (None, Some(secs)) if secs > 0 => Schedule::After(Duration::from_secs(secs as u64)),
            _ => Schedule::Now,
        }
    }

    /// Remaining wait measured from now.
    pub fn delay(&self) -> Duration {
        match self {
            Schedule::Now => Duration::ZERO,
            Schedule::After(d) => *d,
            Schedule::At(at) => (*at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub max_retry: i32,
    pub timeout: Duration,
    pub schedule: Schedule,
    /// Idempotency key; a repeat inside [`UNIQUE_WINDOW`] is refused
    pub task_key: Option<String>,
}

/// Control-plane side of the broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Returns the broker's own handle for the accepted task.
    async fn submit(
        &self,
        key: &RoutingKey,
        payload: Vec<u8>,
        options: SubmitOptions,
    ) -> Result<String>;

    async fn inspect(&self, key: &RoutingKey) -> Result<QueueCounters>;

    async fn delete_pending(&self, key: &RoutingKey) -> Result<i64>;

    async fn delete_archived(&self, key: &RoutingKey) -> Result<i64>;

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// One task handed to a worker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub handle: String,
    pub task_key: Option<String>,
    pub routing_key: RoutingKey,
    pub payload: Vec<u8>,
    /// Times the broker already retried this task
    pub retry_count: i32,
    pub max_retry: i32,
    pub timeout: Duration,
}

impl Delivery {
    /// Identity used when reporting: the task key when present, else the handle.
    pub fn task_id(&self) -> &str {
        self.task_key.as_deref().unwrap_or(&self.handle)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(String),
}

/// Worker side of the broker.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Next ready task among `queues` (routing key, weight), waiting up to `wait`.
    async fn fetch(
        &self,
        queues: &[(RoutingKey, i32)],
        wait: Duration,
    ) -> Result<Option<Delivery>>;

    /// Acknowledge a delivery; failures go through the broker's retry policy.
    async fn finish(&self, delivery: &Delivery, outcome: Outcome) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_from_request() {
        assert_eq!(Schedule::from_request(None, None), Schedule::Now);
        assert_eq!(Schedule::from_request(Some(0), None), Schedule::Now);
        assert_eq!(Schedule::from_request(Some(-5), None), Schedule::Now);
        assert_eq!(
            Schedule::from_request(Some(10), None),
            Schedule::After(Duration::from_secs(10))
        );

        let at = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(Schedule::from_request(Some(10), Some(at)), Schedule::At(at));
    }

    #[test]
    fn test_schedule_delay_in_past_is_zero() {
        let past = Utc::now() - chrono::Duration::minutes(5);
        assert_eq!(Schedule::At(past).delay(), Duration::ZERO);
    }
}
