//! Error types for krustron-core
//!
//! One error enum covers the live hub and the durable event bus. None of these
//! conditions is process-fatal: callers decide whether to retry.

use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// The hub control loop has stopped and accepts no more operations
    #[error("hub is closed")]
    HubClosed,

    /// Broker rejected or failed an operation
    #[error("broker error: {0}")]
    Broker(String),

    /// Broker connection is down; publishes fail fast until it reconnects
    #[error("broker disconnected")]
    Disconnected,

    /// Event bus is draining and no longer accepts new work
    #[error("event bus is draining")]
    Draining,

    /// No stream is bound to the given name or subject
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// Durable consumer does not exist on the stream
    #[error("consumer not found: {stream}/{durable}")]
    ConsumerNotFound {
        /// Stream name
        stream: String,
        /// Durable consumer name
        durable: String,
    },

    /// Subject or subject pattern is malformed
    #[error("invalid subject: {0}")]
    InvalidSubject(String),

    /// Event handler returned an error (delivery is nak'd)
    #[error("handler error: {0}")]
    Handler(String),

    /// Operation did not finish in time
    #[error("timed out: {0}")]
    Timeout(String),

    /// JSON encode/decode failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis transport error
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl Error {
    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Disconnected | Error::Timeout(_) | Error::Broker(_) => true,
            Error::Redis(e) => e.is_io_error() || e.is_connection_dropped() || e.is_timeout(),
            _ => false,
        }
    }

    /// Build a handler error from any displayable cause.
    pub fn handler(cause: impl std::fmt::Display) -> Self {
        Error::Handler(cause.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests;
