//! MonthSync Error Types

use thiserror::Error;

use crate::changelog::Sequence;
use crate::state::NodeId;

/// Result type alias for MonthSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// MonthSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Partition errors
    #[error("Invalid month key '{0}': expected YYYY-MM")]
    InvalidMonth(String),

    #[error("Invalid identifier '{0}'")]
    InvalidIdentifier(String),

    // Node errors
    #[error("Node {node} unreachable: {reason}")]
    Connection { node: NodeId, reason: String },

    #[error("Node {node} timed out after {after_ms} ms")]
    Timeout { node: NodeId, after_ms: u64 },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Statement execution failed: {0}")]
    Execution(String),

    // Change log errors
    #[error("Change log error: {0}")]
    ChangeLog(String),

    #[error("Sequence continuity violated on node {node}: expected {expected}, found {found}")]
    SequenceContinuity {
        node: NodeId,
        expected: Sequence,
        found: Sequence,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection { .. } | Error::Timeout { .. })
    }

    /// Check if this error breaks an ordering invariant and must abort the
    /// operation instead of being recorded and skipped
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Error::SequenceContinuity { .. })
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Error::Internal("blocking task cancelled".into())
        } else {
            Error::Internal(format!("blocking task panicked: {}", e))
        }
    }
}
