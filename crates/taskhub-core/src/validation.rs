//! Character-class rules for identifiers accepted at every boundary.

use crate::{HubError, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

/// Maximum accepted payload size (2 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 2 * 1024 * 1024;

/// Furthest a task may be scheduled into the future (365 days).
pub const MAX_DELAY_SECONDS: i64 = 365 * 24 * 60 * 60;

static WORKER_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{3,64}$").expect("static regex"));

static QUEUE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("static regex"));

static TASK_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9-]{1,128}$").expect("static regex"));

pub fn is_valid_worker_name(name: &str) -> bool {
    WORKER_NAME_RE.is_match(name)
}

pub fn is_valid_queue_name(name: &str) -> bool {
    QUEUE_NAME_RE.is_match(name)
}

pub fn is_valid_task_id(task_id: &str) -> bool {
    TASK_ID_RE.is_match(task_id)
}

pub fn validate_worker_name(name: &str) -> Result<()> {
    if is_valid_worker_name(name) {
        Ok(())
    } else {
        Err(HubError::Validation(format!(
            "invalid worker_name {name:?}: expected [A-Za-z0-9_-]{{3,64}}"
        )))
    }
}

/// Applies to queue group names and priority names alike.
pub fn validate_queue_name(name: &str) -> Result<()> {
    if is_valid_queue_name(name) {
        Ok(())
    } else {
        Err(HubError::Validation(format!(
            "invalid queue name {name:?}: expected [A-Za-z0-9_-]{{1,64}}"
        )))
    }
}

pub fn validate_task_id(task_id: &str) -> Result<()> {
    if is_valid_task_id(task_id) {
        Ok(())
    } else {
        Err(HubError::Validation(format!(
            "invalid task_id {task_id:?}: expected [A-Za-z0-9-]{{1,128}}"
        )))
    }
}

pub fn validate_payload_size(payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(HubError::PayloadTooLarge {
            max: MAX_PAYLOAD_SIZE,
            actual: payload.len(),
        });
    }
    Ok(())
}

/// Non-positive delays mean "now"; only the upper bound is enforced.
pub fn validate_delay_seconds(delay_seconds: i64) -> Result<()> {
    if delay_seconds > MAX_DELAY_SECONDS {
        return Err(HubError::Validation(format!(
            "delay of {delay_seconds}s exceeds the maximum of {MAX_DELAY_SECONDS}s"
        )));
    }
    Ok(())
}

/// A `run_at` in the past means "now"; one beyond [`MAX_DELAY_SECONDS`] is refused.
pub fn validate_run_at(run_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    let ahead = run_at.signed_duration_since(now).num_seconds();
    if ahead > MAX_DELAY_SECONDS {
        return Err(HubError::Validation(format!(
            "run_at {run_at} is more than {MAX_DELAY_SECONDS}s in the future"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_name_rules() {
        assert!(is_valid_worker_name("w-1"));
        assert!(is_valid_worker_name("crawler_worker"));
        assert!(is_valid_worker_name(&"a".repeat(64)));

        assert!(!is_valid_worker_name("ab"));
        assert!(!is_valid_worker_name(&"a".repeat(65)));
        assert!(!is_valid_worker_name("has space"));
        assert!(!is_valid_worker_name("colon:name"));
    }

    #[test]
    fn test_queue_name_rules() {
        assert!(is_valid_queue_name("q"));
        assert!(is_valid_queue_name("web_crawl-2"));
        assert!(!is_valid_queue_name(""));
        assert!(!is_valid_queue_name("a:b"));
        assert!(!is_valid_queue_name(&"q".repeat(65)));
    }

    #[test]
    fn test_task_id_rules() {
        assert!(is_valid_task_id("0f3a9c"));
        assert!(is_valid_task_id("order-42"));
        assert!(!is_valid_task_id("under_score"));
        assert!(!is_valid_task_id(""));
        assert!(!is_valid_task_id(&"a".repeat(129)));
    }

    #[test]
    fn test_payload_size_limit() {
        assert!(validate_payload_size(&vec![0u8; MAX_PAYLOAD_SIZE]).is_ok());

        match validate_payload_size(&vec![0u8; MAX_PAYLOAD_SIZE + 1]) {
            Err(HubError::PayloadTooLarge { max, actual }) => {
                assert_eq!(max, MAX_PAYLOAD_SIZE);
                assert_eq!(actual, MAX_PAYLOAD_SIZE + 1);
            }
            other => panic!("Expected PayloadTooLarge error, got {other:?}"),
        }
    }

    #[test]
    fn test_delay_bounds() {
        assert!(validate_delay_seconds(-5).is_ok());
        assert!(validate_delay_seconds(MAX_DELAY_SECONDS).is_ok());
        assert!(matches!(
            validate_delay_seconds(MAX_DELAY_SECONDS + 1),
            Err(HubError::Validation(_))
        ));
        assert!(validate_delay_seconds(i64::MAX).is_err());

        let now = Utc::now();
        assert!(validate_run_at(now - chrono::Duration::days(3), now).is_ok());
        assert!(validate_run_at(now + chrono::Duration::days(30), now).is_ok());
        assert!(validate_run_at(now + chrono::Duration::days(400), now).is_err());
        assert!(validate_run_at(DateTime::<Utc>::MAX_UTC, now).is_err());
    }
}
