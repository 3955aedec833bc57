use taskhub_broker::BrokerError;
use taskhub_client::ClientError;
use taskhub_core::HubError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Invalid worker configuration: {0}")]
    Config(#[from] HubError),

    #[error("No broker consumer configured")]
    MissingConsumer,

    #[error("No handlers registered for any queue group")]
    NoHandlers,

    #[error("Control plane error: {0}")]
    ControlPlane(#[from] ClientError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Queue group {group} stopped: {source}")]
    QueueGroup {
        group: String,
        #[source]
        source: BrokerError,
    },

    #[error("No control plane or broker client configured for enqueue")]
    NoEnqueuePath,

    #[error("Payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
