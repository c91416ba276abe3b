//! Error types for broker operations.

use thiserror::Error;

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Failures talking to the message broker.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// TCP or AMQP handshake failed.
    #[error("broker connection failed: {message}")]
    Connection {
        /// Underlying error message
        message: String,
    },

    /// Channel could not be opened or was closed by the broker.
    #[error("broker channel error: {message}")]
    Channel {
        /// Underlying error message
        message: String,
    },

    /// Queue declaration was rejected.
    #[error("failed to declare queue {queue}: {message}")]
    Declare {
        /// Queue name
        queue: String,
        /// Underlying error message
        message: String,
    },

    /// Passive declaration found no such queue.
    #[error("queue {queue} does not exist")]
    QueueMissing {
        /// Queue name
        queue: String,
    },

    /// Subscription could not be started or failed mid-stream.
    #[error("failed to consume from {queue}: {message}")]
    Consume {
        /// Queue name
        queue: String,
        /// Underlying error message
        message: String,
    },

    /// Publish was rejected or not confirmed.
    #[error("failed to publish to {queue}: {message}")]
    Publish {
        /// Queue name
        queue: String,
        /// Underlying error message
        message: String,
    },

    /// Ack or nack could not be sent.
    #[error("failed to acknowledge delivery {delivery_tag}: {message}")]
    Acknowledge {
        /// Broker delivery tag
        delivery_tag: u64,
        /// Underlying error message
        message: String,
    },

    /// Operation abandoned because shutdown was requested.
    #[error("operation cancelled")]
    Cancelled,
}

impl BrokerError {
    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Creates a queue declaration error.
    pub fn declare(queue: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Declare { queue: queue.into(), message: message.into() }
    }

    /// Creates a publish error.
    pub fn publish(queue: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish { queue: queue.into(), message: message.into() }
    }

    /// Creates an acknowledgement error.
    pub fn acknowledge(delivery_tag: u64, message: impl Into<String>) -> Self {
        Self::Acknowledge { delivery_tag, message: message.into() }
    }

    /// Whether this error only reflects a shutdown request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(error: lapin::Error) -> Self {
        Self::Channel { message: error.to_string() }
    }
}
