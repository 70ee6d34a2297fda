//! Error types for the instrumentation relay.
//!
//! Every failure surfaces to the nearest caller as a `RelayError`, either from
//! a lifecycle call (`start`/`shutdown`) or through a command's future.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    // File system and socket errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Peer-reported failure. Displays exactly the peer's error detail.
    #[error("{message}")]
    CommandFailed {
        status: i64,
        message: String,
        value: serde_json::Value,
    },

    // Protocol errors
    #[error("Malformed result frame: {message}")]
    MalformedFrame { message: String },

    #[error("Result of {size} bytes exceeds limit of {limit} bytes")]
    ResultTooLarge { size: usize, limit: usize },

    // Session lifecycle errors
    #[error("Relay session closed before the command completed")]
    SessionClosed,

    #[error("Relay session is already listening")]
    AlreadyRunning,

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RelayError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        RelayError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Build the error for a peer result whose status is not success.
    ///
    /// String values become the message verbatim; anything else is rendered
    /// as compact JSON.
    pub fn command_failed(status: i64, value: serde_json::Value) -> Self {
        let message = match &value {
            serde_json::Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        RelayError::CommandFailed {
            status,
            message,
            value,
        }
    }

    /// True when the peer executed the command and reported a failure.
    pub fn is_command_failure(&self) -> bool {
        matches!(self, RelayError::CommandFailed { .. })
    }

    /// Peer status code, for command failures.
    pub fn status(&self) -> Option<i64> {
        match self {
            RelayError::CommandFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}
