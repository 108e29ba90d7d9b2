use thiserror::Error;

use crate::broker::BrokerError;

/// Failures surfaced by [`crate::ResilientChannel`]
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Every connect attempt failed; callers treat this as fatal
    #[error("Could not connect to broker at {host}:{port} after {attempts} attempts: {source}")]
    ConnectionExhausted {
        host: String,
        port: u16,
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    #[error("Publish to queue '{queue}' failed after reconnect: {source}")]
    Publish {
        queue: String,
        #[source]
        source: BrokerError,
    },

    #[error("Subscription to queue '{queue}' failed: {source}")]
    Consume {
        queue: String,
        #[source]
        source: BrokerError,
    },
}

impl ChannelError {
    pub fn is_connection_exhausted(&self) -> bool {
        matches!(self, ChannelError::ConnectionExhausted { .. })
    }
}

/// Failures that end a consumer loop
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Failed to start consumer runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("Consumer thread panicked")]
    Panicked,
}

/// Failures reported by a delivery handler. The delivery is rejected and
/// requeued either way.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Malformed payload: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures of [`crate::NotifyPublisher::publish_batch`]
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Failed to encode batch set: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
