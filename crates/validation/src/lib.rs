//! `validation` crate — isolated workspaces and supervised validation runs.
//!
//! [`WorkspaceManager`] owns per-validation filesystem scopes (creation,
//! scoped cleanup, age-based GC, quota).  [`ValidationExecutor`] gates
//! concurrent validations, drives the clone → sandbox → tool pipeline with
//! cancellation threaded down to the child process, and keeps run metrics.

pub mod error;
pub mod executor;
pub mod process;
pub mod sandbox;
pub mod workspace;

pub use error::ValidationError;
pub use executor::{ExecutorConfig, ValidationExecutor, ValidationMetrics, ValidationPhase};
pub use process::{CommandOutput, CommandSpec};
pub use sandbox::{Sandbox, SandboxManager};
pub use workspace::{UsageReport, Workspace, WorkspaceConfig, WorkspaceManager, WorkspaceStatus};
