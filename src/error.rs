// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the connector.
//!
//! Errors are categorized by how the connector must react to them. The
//! taxonomy drives both the tailer's reconnect loop and the per-target
//! error policy.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Config` | No | Invalid or contradictory configuration (startup only) |
//! | `Connection` | Yes | Source or target unreachable |
//! | `HistoryGap` | No | Resume point no longer present in the source log |
//! | `Apply` | No | Adapter rejected a document (policy decides skip or halt) |
//! | `Authentication` | No | Credentials rejected by source or target |
//! | `Checkpoint` | No | Local checkpoint file could not be read or written |
//! | `Serialization` | No | Malformed checkpoint or event payload |
//! | `InvalidState` | No | Lifecycle violation (a bug in the caller) |
//! | `Shutdown` | No | Connector is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`ConnectorError::is_retryable()`] to decide whether an operation
//! should be retried with backoff. Only connection failures are transient;
//! everything else either needs an operator or goes through the
//! continue-on-error policy.

use crate::oplog::Position;
use thiserror::Error;

/// Result type alias for connector operations.
pub type Result<T> = std::result::Result<T, ConnectorError>;

/// Errors that can occur while replicating.
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// Invalid or contradictory configuration.
    ///
    /// Raised by validation before any I/O starts. Never retried.
    #[error("Configuration error ({field}): {message}")]
    Config { field: String, message: String },

    /// Source or target endpoint unreachable.
    ///
    /// Retried with exponential backoff; the read position is preserved.
    #[error("Connection error ({endpoint}): {message}")]
    Connection { endpoint: String, message: String },

    /// The source log no longer retains history back to the resume point.
    ///
    /// Continuing would silently lose updates. Requires an operator-triggered
    /// resync (re-run the initial import).
    #[error("History gap: resume point {resume} is older than oldest retained entry {oldest}")]
    HistoryGap { resume: Position, oldest: Position },

    /// An adapter rejected a document.
    #[error("Apply error (target {target}, namespace {namespace}, position {position}): {message}")]
    Apply {
        target: String,
        namespace: String,
        position: Position,
        message: String,
    },

    /// Credentials rejected.
    #[error("Authentication error ({target}): {message}")]
    Authentication { target: String, message: String },

    /// Checkpoint file I/O failure.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] std::io::Error),

    /// Malformed JSON in a checkpoint, config file or event payload.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Lifecycle or invariant violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Catch-all for errors that shouldn't happen.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConnectorError {
    /// Create a config error naming the offending field.
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a connection error for an endpoint.
    pub fn connection(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a connection error from a redis error.
    ///
    /// Authentication failures are not transient and map to
    /// [`ConnectorError::Authentication`].
    pub fn redis(endpoint: impl Into<String>, source: redis::RedisError) -> Self {
        if source.kind() == redis::ErrorKind::AuthenticationFailed {
            return Self::Authentication {
                target: endpoint.into(),
                message: source.to_string(),
            };
        }
        Self::Connection {
            endpoint: endpoint.into(),
            message: source.to_string(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Config { .. } => false,
            Self::HistoryGap { .. } => false, // Needs a resync
            Self::Apply { .. } => false,      // Goes through the error policy
            Self::Authentication { .. } => false,
            Self::Checkpoint(_) => false,
            Self::Serialization(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}
