use crate::config::ReportRetryConfig;
use crate::control_plane::ControlPlane;
use taskhub_client::ClientError;
use taskhub_core::AttemptReport;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Attempt report for task {task_id} failed after {attempts} tries: {source}")]
    Exhausted {
        task_id: String,
        attempts: u32,
        #[source]
        source: ClientError,
    },

    #[error("Attempt report for task {task_id} rejected: {source}")]
    Rejected {
        task_id: String,
        #[source]
        source: ClientError,
    },

    #[error("Attempt report for task {0} cancelled")]
    Cancelled(String),
}

/// Backoff steps granted to a report for a task the control plane does not
/// know yet: the task row is written only after the broker accepts it, so a
/// fast worker can report first.
pub const UNKNOWN_TASK_RETRIES: u32 = 1;

/// Send one attempt report, retrying transport failures with exponential backoff.
///
/// Rejections the control plane will repeat (4xx) are returned immediately,
/// except a 404 which is retried up to [`UNKNOWN_TASK_RETRIES`] times.
pub async fn report_with_retry(
    control_plane: &dyn ControlPlane,
    task_id: &str,
    report: &AttemptReport,
    config: &ReportRetryConfig,
    cancel: &CancellationToken,
) -> Result<(), ReportError> {
    let mut tries = 0;
    loop {
        tries += 1;
        let err = match control_plane.report_attempt(task_id, report).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let unknown_task = matches!(err, ClientError::NotFound(_)) && tries <= UNKNOWN_TASK_RETRIES;
        if !err.is_retryable() && !unknown_task {
            return Err(ReportError::Rejected {
                task_id: task_id.to_string(),
                source: err,
            });
        }
        if tries > config.max_retries {
            return Err(ReportError::Exhausted {
                task_id: task_id.to_string(),
                attempts: tries,
                source: err,
            });
        }

        let wait = config.backoff(tries);
        warn!(
            task_id,
            attempt = report.attempt,
            status = %report.status,
            retry_in_ms = wait.as_millis() as u64,
            error = %err,
            "Attempt report failed, retrying"
        );

        if cancel.is_cancelled() {
            return Err(ReportError::Cancelled(task_id.to_string()));
        }
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.cancelled() => return Err(ReportError::Cancelled(task_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::testing::RecordingControlPlane;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let cp = RecordingControlPlane::failing_reports(2);
        let report = AttemptReport::running(1, "w1-worker");

        let started = tokio::time::Instant::now();
        report_with_retry(&cp, "t1", &report, &ReportRetryConfig::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(cp.reports.lock().len(), 1);
        // 1s then 2s of backoff.
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_surfaces_exhaustion() {
        let cp = RecordingControlPlane::failing_reports(10);
        let report = AttemptReport::running(1, "w1-worker");

        let err = report_with_retry(&cp, "t1", &report, &ReportRetryConfig::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ReportError::Exhausted { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(cp.reports.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_racing_task_creation_is_retried() {
        let cp = RecordingControlPlane::missing_task_reports(1);
        let report = AttemptReport::running(1, "w1-worker");

        report_with_retry(&cp, "t1", &report, &ReportRetryConfig::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(cp.reports.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_task_rejected_after_grace_retry() {
        let cp = RecordingControlPlane::missing_task_reports(10);
        let report = AttemptReport::running(1, "w1-worker");

        let err = report_with_retry(&cp, "t1", &report, &ReportRetryConfig::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReportError::Rejected { source: ClientError::NotFound(_), .. }
        ));
        assert_eq!(cp.missing_reports.load(std::sync::atomic::Ordering::SeqCst), 8);
        assert!(cp.reports.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_backoff() {
        let cp = RecordingControlPlane::failing_reports(10);
        let report = AttemptReport::running(1, "w1-worker");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = report_with_retry(&cp, "t1", &report, &ReportRetryConfig::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ReportError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_zero_retries_fails_fast() {
        let cp = RecordingControlPlane::failing_reports(1);
        let config = ReportRetryConfig {
            max_retries: 0,
            ..Default::default()
        };
        let err = report_with_retry(
            &cp,
            "t1",
            &AttemptReport::running(1, "w1-worker"),
            &config,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ReportError::Exhausted { attempts: 1, .. }));
    }
}
