//! Typed HTTP client for the task hub control plane.

mod async_client;
mod sync_client;

pub use async_client::ControlPlaneClient;
pub use sync_client::BlockingControlPlaneClient;

use taskhub_core::HubError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Control plane returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    Decode(String),

    #[error("Invalid control plane URL: {0}")]
    InvalidUrl(String),
}

impl ClientError {
    /// Transport failures and server-side errors may succeed on a later try.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Connection(_) | ClientError::Timeout => true,
            ClientError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else {
            ClientError::Connection(err.to_string())
        }
    }
}

impl From<ClientError> for HubError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::NotFound(msg) => HubError::NotFound(msg),
            ClientError::Api { status, message } if status < 500 => HubError::Validation(message),
            other => HubError::Transport(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
