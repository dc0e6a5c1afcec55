//! Error types for the view broker.

use crate::registry::RecordId;
use thiserror::Error;

/// Main error type for view and stream operations.
#[derive(Debug, Error)]
pub enum ViewError {
    #[error("Sync client not available")]
    ClientUnavailable,

    #[error("Query error ({error_type}): {message}")]
    QueryResult {
        message: String,
        error_type: String,
        details: Option<serde_json::Value>,
    },

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Unknown view record: {0}")]
    UnknownRecord(RecordId),
}

impl ViewError {
    /// True for conditions that are modeled as state rather than failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, ViewError::ClientUnavailable)
    }
}

/// Error reported by a sync client implementation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ClientError {
    pub message: String,
}

impl ClientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<ClientError> for ViewError {
    fn from(e: ClientError) -> Self {
        ViewError::OperationFailed(e.message)
    }
}

/// Result type for view operations.
pub type Result<T> = std::result::Result<T, ViewError>;
