use crate::control_plane::ControlPlane;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Periodic liveness signal. Failed ticks are logged and retried on the next tick.
pub struct HeartbeatManager {
    control_plane: Arc<dyn ControlPlane>,
    worker_name: String,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatManager {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        worker_name: impl Into<String>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        HeartbeatManager {
            control_plane,
            worker_name: worker_name.into(),
            interval,
            timeout,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Beat immediately, then every `interval` until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.beat().await,
                _ = shutdown.cancelled() => break,
            }
        }
        debug!(worker_name = %self.worker_name, "Heartbeat stopped");
    }

    async fn beat(&self) {
        match tokio::time::timeout(self.timeout, self.control_plane.heartbeat(&self.worker_name)).await {
            Ok(Ok(())) => debug!(worker_name = %self.worker_name, "Heartbeat sent"),
            Ok(Err(e)) => warn!(worker_name = %self.worker_name, error = %e, "Heartbeat failed"),
            Err(_) => warn!(
                worker_name = %self.worker_name,
                timeout_ms = self.timeout.as_millis() as u64,
                "Heartbeat timed out"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::testing::RecordingControlPlane;
    use std::sync::atomic::Ordering;

    #[tokio::test(start_paused = true)]
    async fn test_fires_immediately_then_on_interval() {
        let cp = Arc::new(RecordingControlPlane::default());
        let shutdown = CancellationToken::new();
        let handle = HeartbeatManager::new(cp.clone(), "w1-worker", Duration::from_secs(30), Duration::from_secs(5))
            .spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cp.heartbeats.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(cp.heartbeats.load(Ordering::SeqCst), 3);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_not_fatal() {
        let cp = Arc::new(RecordingControlPlane {
            fail_heartbeats: true,
            ..Default::default()
        });
        let shutdown = CancellationToken::new();
        let handle = HeartbeatManager::new(cp.clone(), "w1-worker", Duration::from_secs(1), Duration::from_secs(1))
            .spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(cp.heartbeats.load(Ordering::SeqCst), 4);
        assert!(!handle.is_finished());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
