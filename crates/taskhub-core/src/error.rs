use thiserror::Error;

/// Error taxonomy shared by the control plane and its clients.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Payload size exceeds maximum allowed size of {max} bytes (got {actual})")]
    PayloadTooLarge { max: usize, actual: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Worker is disabled: {0}")]
    Disabled(String),

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Task in invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl HubError {
    /// Only transport failures are worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HubError::Transport(_))
    }

    /// True for errors the caller has to fix in the request itself.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            HubError::Validation(_)
                | HubError::PayloadTooLarge { .. }
                | HubError::Disabled(_)
                | HubError::Routing(_)
                | HubError::InvalidState { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
