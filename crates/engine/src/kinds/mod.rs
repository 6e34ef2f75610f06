//! The `WorkflowKind` contract and the three built-in kinds.
//!
//! A kind is a constructor for a deterministic step list plus context
//! validation and final-result assembly.  The engine dispatches through
//! trait objects registered by string kind.

pub mod pr_creation;
pub mod task_processing;
pub mod validation;

pub use pr_creation::PrCreationWorkflow;
pub use task_processing::TaskProcessingWorkflow;
pub use validation::{ValidationBackend, ValidationWorkflow};

use serde_json::Value;

use crate::error::EngineError;
use crate::step::{StepResult, StepSpec};

/// The workflow-kind contract.
///
/// `steps` must return the same declarations on every call — the engine
/// relies on deterministic ordering for progress and archival.
pub trait WorkflowKind: Send + Sync {
    /// Registry key, e.g. `"validation"`.
    fn kind(&self) -> &str;

    /// Reject malformed caller contexts before a workflow is created.
    fn validate_context(&self, context: &Value) -> Result<(), EngineError>;

    /// The ordered step declarations.
    fn steps(&self) -> Vec<StepSpec>;

    /// Assemble the workflow's final result from the recorded step results.
    fn build_result(&self, context: &Value, results: &[StepResult]) -> Value;
}

/// Shared context-validation helper: require a string field at the top
/// level of the context object.
pub(crate) fn require_str_field(
    kind: &str,
    context: &Value,
    field: &str,
) -> Result<(), EngineError> {
    match context.get(field).and_then(Value::as_str) {
        Some(s) if !s.is_empty() => Ok(()),
        _ => Err(EngineError::InvalidContext {
            kind: kind.to_string(),
            message: format!("context requires a non-empty string field '{field}'"),
        }),
    }
}
