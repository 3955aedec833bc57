use taskhub_core::HubError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Duplicate task key: {0}")]
    Duplicate(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Broker is closed")]
    Closed,

    #[error("Unknown delivery: {0}")]
    UnknownDelivery(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

impl From<BrokerError> for HubError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Duplicate(key) => {
                HubError::Validation(format!("task {key} was already submitted in the last 24h"))
            }
            BrokerError::InvalidSchedule(reason) => HubError::Validation(reason),
            other => HubError::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_error_mapping() {
        let dup: HubError = BrokerError::Duplicate("t-1".into()).into();
        assert!(matches!(dup, HubError::Validation(_)));

        let down: HubError = BrokerError::Unavailable("connection refused".into()).into();
        assert!(down.is_retryable());

        let schedule: HubError = BrokerError::InvalidSchedule("too far".into()).into();
        assert!(matches!(schedule, HubError::Validation(_)));

        let closed: HubError = BrokerError::Closed.into();
        assert!(matches!(closed, HubError::Transport(_)));
    }
}
