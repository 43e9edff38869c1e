//! Error types for the registration client

use thiserror::Error;

/// Registration client error type
#[derive(Error, Debug)]
pub enum Error {
    /// Coordination client failure (session, retry budget, store errors)
    #[error(transparent)]
    Coordination(#[from] coordination::Error),

    /// A record or name violates the key construction rules
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration is unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Credentials were rejected
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Backend answered with an unexpected HTTP status
    #[error("HTTP {status} from {url}: {body}")]
    Http {
        /// Response status code
        status: u16,
        /// Request URL
        url: String,
        /// Response body
        body: String,
    },

    /// Request could not be delivered
    #[error("Transport error: {0}")]
    Transport(String),

    /// Backend returned a payload that could not be understood
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Adapter was closed
    #[error("Adapter is closed")]
    Closed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<Error> for coordination::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Coordination(inner) => inner,
            Error::Transport(msg) => coordination::Error::ConnectionLoss(msg),
            Error::AuthenticationFailed(msg) => coordination::Error::AuthenticationFailed(msg),
            Error::InvalidConfiguration(msg) => coordination::Error::InvalidConfiguration(msg),
            Error::InvalidArgument(msg) => coordination::Error::InvalidArgument(msg),
            Error::Closed => coordination::Error::Closed,
            // Gateways and overloaded members answer 5xx while the cluster heals
            Error::Http { status, url, body } if status >= 500 => {
                coordination::Error::ConnectionLoss(format!("HTTP {} from {}: {}", status, url, body))
            }
            other => coordination::Error::Backend(other.to_string()),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
