//! Error types

use thiserror::Error;

/// Errors surfaced by the bus and its publish paths.
#[derive(Debug, Error)]
pub enum BusError {
    /// Topic is empty or contains an empty segment.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// Subscription pattern is empty or contains an empty segment.
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    /// Block-policy publish found no space within the configured bound.
    #[error("queue full after waiting {waited_ms}ms")]
    QueueFull { waited_ms: u64 },

    /// The bus has been shut down; publishes and subscriptions are rejected.
    #[error("bus is closed")]
    Closed,

    #[error("default bus already initialized")]
    DefaultBusAlreadyInitialized,

    #[error("default bus not initialized")]
    DefaultBusNotInitialized,
}

/// Failure class of a data-source call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterErrorKind {
    /// Network or connectivity failure; usually transient.
    Transport,
    /// The venue rejected the request.
    Exchange,
    /// The driver does not implement this call.
    NotSupported,
}

impl std::fmt::Display for AdapterErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Exchange => write!(f, "exchange"),
            Self::NotSupported => write!(f, "not supported"),
        }
    }
}

/// Error returned by a [`DataSource`](crate::adapter::DataSource) call.
/// Publishers treat these as transient: log, count, move on.
#[derive(Debug, Clone, Error)]
#[error("{kind} error: {message}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self { kind: AdapterErrorKind::Transport, message: message.into() }
    }

    pub fn exchange(message: impl Into<String>) -> Self {
        Self { kind: AdapterErrorKind::Exchange, message: message.into() }
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self { kind: AdapterErrorKind::NotSupported, message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            BusError::QueueFull { waited_ms: 500 }.to_string(),
            "queue full after waiting 500ms"
        );
        let err = AdapterError::transport("connection reset");
        assert_eq!(err.kind, AdapterErrorKind::Transport);
        assert_eq!(err.to_string(), "transport error: connection reset");
    }
}
