//! Engine-level error types.

use thiserror::Error;

use crate::step::StepError;
use crate::workflow::WorkflowStatus;

/// Errors produced by the workflow engine (registration, lifecycle,
/// execution).
#[derive(Debug, Error)]
pub enum EngineError {
    /// No constructor registered under this kind.
    #[error("unknown workflow kind: '{0}'")]
    UnknownKind(String),

    /// A kind failed the registration capability check.
    #[error("kind '{kind}' rejected at registration: {message}")]
    Registration { kind: String, message: String },

    /// The caller-provided context failed the kind's validation.
    #[error("invalid context for '{kind}': {message}")]
    InvalidContext { kind: String, message: String },

    /// The active-workflow cap is reached; the caller should back off.
    #[error("workflow engine overloaded ({active}/{limit} active)")]
    Overloaded { active: usize, limit: usize },

    /// No active workflow under the given id.
    #[error("workflow not found: '{0}'")]
    NotFound(String),

    /// A lifecycle operation was attempted in a state that does not
    /// permit it (e.g. pause while not running).
    #[error("cannot {action} workflow in status {status}")]
    InvalidTransition { action: &'static str, status: WorkflowStatus },

    /// A step exhausted its retries or failed terminally.
    #[error("step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: StepError,
    },

    /// The workflow was cancelled.  Distinct from `StepFailed` so callers
    /// and metrics can tell the two apart.
    #[error("workflow cancelled{}", reason.as_deref().map(|r| format!(" ({r})")).unwrap_or_default())]
    Cancelled { reason: Option<String> },
}
