//! Error types for outbound delivery.
//!
//! Every variant is an expected failure mode. The executor turns them into a
//! retry or failed-queue decision; nothing here escapes a message handler.

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Reasons a forward attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Message has no `urlSuffix`.
    #[error("urlSuffix is missing")]
    MissingUrlSuffix,

    /// Message has no usable `httpRequest`.
    #[error("httpRequest is missing or blank")]
    MissingMethod,

    /// Backend answered with a non-2xx status.
    #[error("HTTP {status_code} {reason}")]
    HttpStatus {
        /// HTTP status code
        status_code: u16,
        /// Canonical reason phrase
        reason: String,
    },

    /// Connection or protocol failure before a response arrived.
    #[error("network error: {message}")]
    NetworkError {
        /// Transport error message
        message: String,
    },

    /// Request exceeded the configured timeout.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Configured timeout in seconds
        timeout_seconds: u64,
    },

    /// HTTP client could not be built.
    #[error("invalid client configuration: {message}")]
    ConfigurationError {
        /// Builder error message
        message: String,
    },

    /// A debounce worker is no longer accepting messages.
    #[error("debounce worker {engine} has stopped")]
    WorkerStopped {
        /// Engine name
        engine: &'static str,
    },
}

impl DeliveryError {
    /// Creates an HTTP status error with its canonical reason phrase.
    pub fn http_status(status: reqwest::StatusCode) -> Self {
        Self::HttpStatus {
            status_code: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
        }
    }

    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Whether the message itself lacks routing information, as opposed to
    /// the backend or network failing.
    pub fn is_routing_error(&self) -> bool {
        matches!(self, Self::MissingUrlSuffix | Self::MissingMethod)
    }
}
