use std::time::Duration;

use thiserror::Error;

/// Errors raised by a broker transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The queue has not been declared.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// The exchange has not been declared.
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    /// The broker refused the publish.
    #[error("Publish rejected for routing key {0}")]
    PublishRejected(String),

    /// The delivery tag is not outstanding on this channel.
    #[error("Unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),

    /// The connection or channel is gone.
    #[error("Transport closed")]
    Closed,
}

/// Errors raised while publishing a domain event.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The event has no outbound route.
    #[error("Unknown event type: {0}")]
    UnknownEventType(&'static str),

    /// The event could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The transport failed immediately.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The broker did not confirm in time.
    #[error("Publish to {routing_key} not confirmed within {timeout:?}")]
    Timeout {
        routing_key: String,
        timeout: Duration,
    },

    /// The broker negatively confirmed the publish.
    #[error("Publish to {routing_key} was nacked by the broker")]
    Nacked { routing_key: String },
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
