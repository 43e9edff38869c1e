//! Error types for the coordination client

use crate::session::SessionState;
use std::time::Duration;
use thiserror::Error;

/// Coordination client error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Caller passed a value that violates an operation's contract
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Endpoint or credentials are unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Connection to the backend was lost; the session may still be alive
    #[error("Connection lost: {0}")]
    ConnectionLoss(String),

    /// The backend declared the session invalid
    #[error("Session expired")]
    SessionExpired,

    /// Retry budget exhausted
    #[error("Operation timed out after {} ms", timeout.as_millis())]
    OperationTimedOut {
        /// The configured operation timeout
        timeout: Duration,
    },

    /// Credentials were rejected by the backend
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Node already exists
    #[error("Node already exists: {0}")]
    AlreadyExists(String),

    /// Node (or a required parent) does not exist
    #[error("Node does not exist: {0}")]
    NoNode(String),

    /// Invalid session state transition
    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        /// Current state
        from: SessionState,
        /// Attempted state
        to: SessionState,
    },

    /// Backend does not support the requested operation
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Client was closed
    #[error("Client is closed")]
    Closed,

    /// Any other backend failure
    #[error("Backend error: {0}")]
    Backend(String),
}

impl Error {
    /// Whether the failure is a transient connection problem worth retrying
    /// once the session is usable again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ConnectionLoss(_) | Error::SessionExpired)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::ConnectionLoss("reset".to_string()).is_transient());
        assert!(Error::SessionExpired.is_transient());

        assert!(!Error::AlreadyExists("/a".to_string()).is_transient());
        assert!(!Error::AuthenticationFailed("bad".to_string()).is_transient());
        assert!(
            !Error::OperationTimedOut {
                timeout: Duration::from_secs(1)
            }
            .is_transient()
        );
        assert!(!Error::Closed.is_transient());
    }

    #[test]
    fn test_timeout_message_carries_budget() {
        let err = Error::OperationTimedOut {
            timeout: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "Operation timed out after 1500 ms");
    }
}
