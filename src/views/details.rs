//! Query status exposed alongside view data.

use super::shared::ViewInner;
use crate::error::ViewError;
use crate::types::{ErroredQuery, ResultKind};
use serde_json::Value;
use std::fmt;
use std::sync::Weak;

/// Message used when an error emission carries none.
pub const DEFAULT_ERROR_MESSAGE: &str = "Query error occurred";

/// Error type used when an error emission carries none.
pub const DEFAULT_ERROR_TYPE: &str = "app";

/// Re-materializes the view an error came from.
///
/// Bound to one materialization: only the first `retry` against it has an
/// effect, later calls (or calls after the view is gone) return `false`.
#[derive(Clone)]
pub struct RetryHandle {
    view: Weak<ViewInner>,
    generation: u64,
}

impl RetryHandle {
    pub(crate) fn new(view: Weak<ViewInner>, generation: u64) -> Self {
        Self { view, generation }
    }

    /// Tear down and re-subscribe. Returns true if a retry happened.
    pub fn retry(&self) -> bool {
        match self.view.upgrade() {
            Some(view) => view.retry(self.generation),
            None => false,
        }
    }

    /// Same as [`retry`](Self::retry).
    pub fn refetch(&self) -> bool {
        self.retry()
    }
}

impl fmt::Debug for RetryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryHandle")
            .field("generation", &self.generation)
            .field("live", &(self.view.strong_count() > 0))
            .finish()
    }
}

/// Details of a failed query.
#[derive(Clone, Debug)]
pub struct QueryErrorDetails {
    pub message: String,
    pub error_type: String,
    pub details: Option<Value>,
    pub retry: RetryHandle,
}

impl QueryErrorDetails {
    pub(crate) fn from_errored(error: Option<&ErroredQuery>, retry: RetryHandle) -> Self {
        Self {
            message: error
                .and_then(|e| e.message.clone())
                .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string()),
            error_type: error
                .and_then(|e| e.error_type.clone())
                .unwrap_or_else(|| DEFAULT_ERROR_TYPE.to_string()),
            details: error.and_then(|e| e.details.clone()),
            retry,
        }
    }

    /// Error for an error emission that has no view to retry.
    pub(crate) fn error_for(error: Option<&ErroredQuery>) -> ViewError {
        Self::from_errored(error, RetryHandle::new(Weak::new(), 0)).to_error()
    }

    /// Convert into the error type used by streams.
    pub fn to_error(&self) -> ViewError {
        ViewError::QueryResult {
            message: self.message.clone(),
            error_type: self.error_type.clone(),
            details: self.details.clone(),
        }
    }
}

/// Status of a view's result.
#[derive(Clone, Debug, Default)]
pub enum ResultDetails {
    #[default]
    Unknown,
    Complete,
    Error(QueryErrorDetails),
}

impl ResultDetails {
    pub fn kind(&self) -> ResultKind {
        match self {
            ResultDetails::Unknown => ResultKind::Unknown,
            ResultDetails::Complete => ResultKind::Complete,
            ResultDetails::Error(_) => ResultKind::Error,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, ResultDetails::Complete)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, ResultDetails::Unknown)
    }

    pub fn error(&self) -> Option<&QueryErrorDetails> {
        match self {
            ResultDetails::Error(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detached_retry() -> RetryHandle {
        RetryHandle::new(Weak::new(), 0)
    }

    #[test]
    fn test_error_defaults() {
        let details = QueryErrorDetails::from_errored(None, detached_retry());
        assert_eq!(details.message, DEFAULT_ERROR_MESSAGE);
        assert_eq!(details.error_type, DEFAULT_ERROR_TYPE);
        assert!(details.details.is_none());
    }

    #[test]
    fn test_error_fields_carried() {
        let errored = ErroredQuery::new("boom")
            .with_type("http")
            .with_details(json!({"status": 500}));
        let details = QueryErrorDetails::from_errored(Some(&errored), detached_retry());

        assert_eq!(details.message, "boom");
        assert_eq!(details.error_type, "http");
        assert_eq!(details.details, Some(json!({"status": 500})));

        match details.to_error() {
            ViewError::QueryResult { message, .. } => assert_eq!(message, "boom"),
            other => panic!("Expected QueryResult, got {:?}", other),
        }
    }

    #[test]
    fn test_retry_on_dropped_view_is_noop() {
        assert!(!detached_retry().retry());
    }

    #[test]
    fn test_kind() {
        assert_eq!(ResultDetails::default().kind(), ResultKind::Unknown);
        assert!(ResultDetails::Complete.is_complete());
        assert!(ResultDetails::Unknown.error().is_none());
    }
}
