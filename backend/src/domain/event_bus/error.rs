//! Errors returned by event bus operations.

use crate::domain::ports::BrokerError;
use crate::domain::routing::RoutingKeyError;

use super::ConnectionState;

/// Failures surfaced to publishers and subscribers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventBusError {
    /// Shutdown has started; no further operations are accepted.
    #[error("event bus is shutting down")]
    ShuttingDown,
    /// The reconnect supervisor owns the connection and has not recovered it.
    #[error("message broker is unavailable (state: {state})")]
    Unavailable {
        /// State observed when the call was rejected.
        state: ConnectionState,
    },
    /// Connecting to the broker failed.
    #[error("could not connect to message broker: {0}")]
    Connection(#[source] BrokerError),
    /// Exchange, queue, or binding declaration failed.
    #[error("message broker declaration failed: {0}")]
    Declaration(#[source] BrokerError),
    /// The transport refused the message.
    #[error("publishing to message broker failed: {0}")]
    Publish(#[source] BrokerError),
    /// The payload could not be encoded as JSON.
    #[error("event payload could not be serialised: {message}")]
    Serialization {
        /// Encoder error text.
        message: String,
    },
    /// A routing key or pattern was malformed.
    #[error(transparent)]
    InvalidRoutingKey(#[from] RoutingKeyError),
}

impl From<serde_json::Error> for EventBusError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization {
            message: error.to_string(),
        }
    }
}
