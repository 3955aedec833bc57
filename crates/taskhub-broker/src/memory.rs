use crate::{
    BrokerClient, BrokerConsumer, BrokerError, Delivery, Outcome, Result, SubmitOptions,
    UNIQUE_WINDOW,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use taskhub_core::api::QueueCounters;
use taskhub_core::RoutingKey;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Retry delay policy of the in-process broker.
#[derive(Debug, Clone)]
pub struct MemoryBrokerConfig {
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        MemoryBrokerConfig {
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
        }
    }
}

impl MemoryBrokerConfig {
    /// Delay before the `retry_count`-th retry: base * 2^(n-1), capped.
    pub fn retry_delay(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.saturating_sub(1).clamp(0, 20) as u32;
        self.retry_base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.retry_max_delay)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    handle: String,
    task_key: Option<String>,
    payload: Vec<u8>,
    retry_count: i32,
    max_retry: i32,
    timeout: Duration,
    due_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Entry>,
    scheduled: Vec<Entry>,
    retry: Vec<Entry>,
    active: HashMap<String, Entry>,
    archived: Vec<Entry>,
    completed: i64,
}

impl QueueState {
    /// Move scheduled and retry entries that came due into `pending`.
    fn promote_due(&mut self, now: Instant) {
        for waiting in [&mut self.scheduled, &mut self.retry] {
            let (due, later): (Vec<_>, Vec<_>) = waiting.drain(..).partition(|e| e.due_at <= now);
            *waiting = later;
            self.pending.extend(due);
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.scheduled
            .iter()
            .chain(self.retry.iter())
            .map(|e| e.due_at)
            .min()
    }

    fn counters(&self) -> QueueCounters {
        let pending = self.pending.len() as i64;
        let active = self.active.len() as i64;
        let scheduled = self.scheduled.len() as i64;
        let retry = self.retry.len() as i64;
        let archived = self.archived.len() as i64;
        QueueCounters {
            pending,
            active,
            scheduled,
            retry,
            archived,
            completed: self.completed,
            size: pending + active + scheduled + retry + archived,
        }
    }
}

/// In-process broker implementing both sides of the broker contract.
///
/// Weighted-random selection across a consumer's routing keys, exponential
/// retry delay and archiving once `max_retry` is exhausted.
pub struct MemoryBroker {
    config: MemoryBrokerConfig,
    queues: Mutex<HashMap<RoutingKey, QueueState>>,
    unique_keys: DashMap<String, Instant>,
    notify: Notify,
    closed: AtomicBool,
    submissions: AtomicU64,
}

impl MemoryBroker {
    pub fn new(config: MemoryBrokerConfig) -> Self {
        MemoryBroker {
            config,
            queues: Mutex::new(HashMap::new()),
            unique_keys: DashMap::new(),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            submissions: AtomicU64::new(0),
        }
    }

    /// Number of accepted submissions since creation.
    pub fn submit_count(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }

    /// Refuse further work and wake every waiting consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn claim_unique(&self, task_key: &str, now: Instant) -> Result<()> {
        match self.unique_keys.entry(task_key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut held) => {
                if *held.get() > now {
                    return Err(BrokerError::Duplicate(task_key.to_string()));
                }
                held.insert(now + UNIQUE_WINDOW);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(now + UNIQUE_WINDOW);
            }
        }
        Ok(())
    }

    fn release_unique(&self, entries: &[Entry]) {
        for entry in entries {
            if let Some(key) = &entry.task_key {
                self.unique_keys.remove(key);
            }
        }
    }

    /// Pop one pending entry, choosing a queue with probability proportional
    /// to its weight among queues that have ready work.
    fn take_ready(&self, queues: &[(RoutingKey, i32)]) -> (Option<Delivery>, Option<Instant>) {
        let now = Instant::now();
        let mut state = self.queues.lock();

        let mut ready = Vec::new();
        let mut next_due: Option<Instant> = None;
        for (key, weight) in queues {
            if let Some(queue) = state.get_mut(key) {
                queue.promote_due(now);
                if !queue.pending.is_empty() {
                    ready.push((key, (*weight).max(1)));
                }
                next_due = match (next_due, queue.next_due()) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
        }

        if ready.is_empty() {
            return (None, next_due);
        }

        let total: i32 = ready.iter().map(|(_, w)| w).sum();
        let mut pick = rand::thread_rng().gen_range(0..total);
        let mut chosen = ready[0].0;
        for (key, weight) in &ready {
            if pick < *weight {
                chosen = *key;
                break;
            }
            pick -= weight;
        }

        let chosen = chosen.clone();
        let Some(queue) = state.get_mut(&chosen) else {
            return (None, next_due);
        };
        let Some(entry) = queue.pending.pop_front() else {
            return (None, next_due);
        };
        queue.active.insert(entry.handle.clone(), entry.clone());

        let delivery = Delivery {
            handle: entry.handle,
            task_key: entry.task_key,
            routing_key: chosen,
            payload: entry.payload,
            retry_count: entry.retry_count,
            max_retry: entry.max_retry,
            timeout: entry.timeout,
        };
        (Some(delivery), next_due)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(MemoryBrokerConfig::default())
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn submit(
        &self,
        key: &RoutingKey,
        payload: Vec<u8>,
        options: SubmitOptions,
    ) -> Result<String> {
        self.ensure_open()?;
        let now = Instant::now();
        let delay = options.schedule.delay();
        let due_at = now.checked_add(delay).ok_or_else(|| {
            BrokerError::InvalidSchedule(format!("delay of {}s is out of range", delay.as_secs()))
        })?;

        if let Some(task_key) = &options.task_key {
            self.claim_unique(task_key, now)?;
        }

        let handle = Uuid::new_v4().to_string();
        let entry = Entry {
            handle: handle.clone(),
            task_key: options.task_key,
            payload,
            retry_count: 0,
            max_retry: options.max_retry.max(0),
            timeout: options.timeout,
            due_at,
        };

        {
            let mut state = self.queues.lock();
            let queue = state.entry(key.clone()).or_default();
            if delay.is_zero() {
                queue.pending.push_back(entry);
            } else {
                queue.scheduled.push(entry);
            }
        }

        self.submissions.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_waiters();
        debug!(routing_key = %key, handle = %handle, delay_ms = delay.as_millis() as u64, "Task submitted");
        Ok(handle)
    }

    async fn inspect(&self, key: &RoutingKey) -> Result<QueueCounters> {
        self.ensure_open()?;
        let mut state = self.queues.lock();
        Ok(state
            .get_mut(key)
            .map(|queue| {
                queue.promote_due(Instant::now());
                queue.counters()
            })
            .unwrap_or_default())
    }

    async fn delete_pending(&self, key: &RoutingKey) -> Result<i64> {
        self.ensure_open()?;
        let removed: Vec<Entry> = {
            let mut state = self.queues.lock();
            match state.get_mut(key) {
                Some(queue) => queue.pending.drain(..).collect(),
                None => Vec::new(),
            }
        };
        self.release_unique(&removed);
        Ok(removed.len() as i64)
    }

    async fn delete_archived(&self, key: &RoutingKey) -> Result<i64> {
        self.ensure_open()?;
        let removed: Vec<Entry> = {
            let mut state = self.queues.lock();
            match state.get_mut(key) {
                Some(queue) => queue.archived.drain(..).collect(),
                None => Vec::new(),
            }
        };
        self.release_unique(&removed);
        Ok(removed.len() as i64)
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_open()
    }
}

#[async_trait]
impl BrokerConsumer for MemoryBroker {
    async fn fetch(
        &self,
        queues: &[(RoutingKey, i32)],
        wait: Duration,
    ) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;

        loop {
            self.ensure_open()?;

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (delivery, next_due) = self.take_ready(queues);
            if delivery.is_some() {
                return Ok(delivery);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake_at = next_due.map_or(deadline, |due| due.min(deadline));

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn finish(&self, delivery: &Delivery, outcome: Outcome) -> Result<()> {
        let archived = {
            let mut state = self.queues.lock();
            let queue = state
                .get_mut(&delivery.routing_key)
                .ok_or_else(|| BrokerError::UnknownDelivery(delivery.handle.clone()))?;
            let mut entry = queue
                .active
                .remove(&delivery.handle)
                .ok_or_else(|| BrokerError::UnknownDelivery(delivery.handle.clone()))?;

            match outcome {
                Outcome::Success => {
                    queue.completed += 1;
                    false
                }
                Outcome::Failure(_) if entry.retry_count < entry.max_retry => {
                    entry.retry_count += 1;
                    entry.due_at = Instant::now() + self.config.retry_delay(entry.retry_count);
                    queue.retry.push(entry);
                    false
                }
                Outcome::Failure(_) => {
                    queue.archived.push(entry);
                    true
                }
            }
        };

        if archived {
            warn!(
                routing_key = %delivery.routing_key,
                handle = %delivery.handle,
                retry_count = delivery.retry_count,
                "Task exhausted its retries and was archived"
            );
        }
        self.notify.notify_waiters();
        Ok(())
    }
}
