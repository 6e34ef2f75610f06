//! `engine` crate — workflow lifecycle, step execution, and the concrete
//! workflow kinds.
//!
//! A [`Workflow`] is an ordered sequence of [`StepSpec`]s executed with
//! per-step timeout, retry, condition, and dependency semantics.  The
//! [`WorkflowEngine`] owns the kind registry, the active-workflow table,
//! and bounded archival, and reacts to `system.shutdown` /
//! `system.maintenance` bus events.

pub mod error;
pub mod kinds;
pub mod registry;
pub mod step;
pub mod workflow;

pub use error::EngineError;
pub use kinds::{
    PrCreationWorkflow, TaskProcessingWorkflow, ValidationBackend, ValidationWorkflow,
    WorkflowKind,
};
pub use registry::{ArchivedWorkflow, EngineConfig, WorkflowEngine};
pub use step::{
    handler_fn, StepContext, StepError, StepErrorKind, StepHandler, StepResult, StepSpec,
    StepStatus,
};
pub use workflow::{Workflow, WorkflowStatus};

#[cfg(test)]
mod engine_tests;
