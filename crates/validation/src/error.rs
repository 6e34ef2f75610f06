//! Validation-layer error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    /// The concurrent-validation gate rejected the request.
    #[error("validation limit reached ({active}/{limit})")]
    LimitExceeded { active: usize, limit: usize },

    /// The request payload is unusable.
    #[error("invalid validation request: {0}")]
    InvalidRequest(String),

    /// An operation exceeded its budget.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The supervised process had to be killed.
    #[error("process killed: {0}")]
    ProcessKilled(String),

    /// A command completed with a failure exit.
    #[error("command '{command}' failed (code {code:?}): {stderr}")]
    CommandFailed { command: String, code: Option<i32>, stderr: String },

    /// The validation was cancelled by its owner.
    #[error("validation cancelled")]
    Cancelled,

    /// Workspace bookkeeping failure.
    #[error("workspace error: {0}")]
    Workspace(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ValidationError {
    /// Command-style failures are worth a backoff-and-retry; everything
    /// else propagates immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CommandFailed { .. })
    }
}
