//! Dispatcher error types.

use std::time::Duration;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for dispatcher operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors raised by a durable store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Another transaction committed a change to a key this one touched.
    #[error("Write conflict on key {key}")]
    Conflict { key: String },

    /// A stored value could not be encoded or decoded.
    #[error("Store serialization error: {0}")]
    Serialization(String),

    /// The transaction was already committed or aborted.
    #[error("Transaction is closed")]
    Closed,

    /// The store cannot be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Returns true if the transaction may succeed when retried.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Dispatcher-related errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Conflict retries exhausted.
    #[error("Transaction conflicted {attempts} times, giving up")]
    ConflictRetriesExhausted { attempts: u32 },

    /// A live annotation did not appear in time.
    #[error("Annotation '{key}' not available after {timeout:?}")]
    AnnotationTimeout { key: String, timeout: Duration },

    /// A job did not complete in time.
    #[error("Job {job_id} not completed after {timeout:?}")]
    CompletionTimeout { job_id: String, timeout: Duration },

    /// Record not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid state transition or lifecycle call.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Agent still owns active jobs.
    #[error("Agent {agent} still has {active} active jobs")]
    AgentBusy { agent: String, active: usize },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reactor error.
    #[error("Reactor error: {0}")]
    Reactor(String),
}

impl DispatchError {
    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Store(e) if e.is_conflict())
    }

    /// Short stable label used for metrics and failure kinds.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Store(_) => "StoreError",
            DispatchError::ConflictRetriesExhausted { .. } => "ConflictRetriesExhausted",
            DispatchError::AnnotationTimeout { .. } => "AnnotationTimeout",
            DispatchError::CompletionTimeout { .. } => "CompletionTimeout",
            DispatchError::NotFound(_) => "NotFound",
            DispatchError::InvalidState { .. } => "InvalidState",
            DispatchError::AgentBusy { .. } => "AgentBusy",
            DispatchError::Configuration(_) => "Configuration",
            DispatchError::Serialization(_) => "Serialization",
            DispatchError::Reactor(_) => "Reactor",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_retryable() {
        let err = DispatchError::from(StoreError::Conflict {
            key: "conveyor:queues".into(),
        });
        assert!(err.is_retryable());
    }

    #[test]
    fn test_unavailable_is_not_retryable() {
        let err = DispatchError::from(StoreError::Unavailable("down".into()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_exhausted_is_not_retryable() {
        let err = DispatchError::ConflictRetriesExhausted { attempts: 5 };
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "ConflictRetriesExhausted");
        assert!(err.to_string().contains('5'));
    }

    #[test]
    fn test_annotation_timeout_display() {
        let err = DispatchError::AnnotationTimeout {
            key: "progress".into(),
            timeout: Duration::from_millis(250),
        };
        let msg = err.to_string();
        assert!(msg.contains("progress") && msg.contains("250ms"));
    }

    #[test]
    fn test_invalid_state_display() {
        let err = DispatchError::InvalidState {
            expected: "pending".into(),
            actual: "completed".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("pending") && msg.contains("completed"));
    }
}
