//! Error types for the proxy layer.

use crate::pod::PodId;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the proxy layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Proxy kind string did not name a known strategy.
    #[error("unknown proxy type {0}")]
    UnrecognizedKind(String),

    /// Configuration value could not be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // Session Lifecycle Errors
    // =========================================================================
    /// A live session already exists for the pod.
    #[error("session already exists for pod {0}")]
    SessionAlreadyExists(PodId),

    /// No session is registered for the pod.
    #[error("session not found for pod {0}")]
    SessionNotFound(PodId),

    /// No live session or transport is available.
    #[error("proxy not connected")]
    NotConnected,

    /// Pod descriptor failed validation.
    #[error("invalid pod {pod}: {reason}")]
    InvalidPod { pod: String, reason: String },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failure reaching or talking to the mediator.
    #[error("transport error on {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    /// Peer sent something that violates the frame protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The guest agent rejected a command.
    #[error("agent error: {0}")]
    Agent(String),

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if the caller may retry the operation with backoff.
    ///
    /// Only transport-class failures qualify. Lifecycle misuse and bad
    /// configuration never succeed on retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout { .. } | Self::Io(_)
        )
    }

    pub(crate) fn transport(
        endpoint: impl std::fmt::Display,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::Transport {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }
}
