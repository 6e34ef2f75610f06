//! Step declarations and the `StepHandler` contract.
//!
//! A step's outcome is a tagged value — `Ok(output)` or a [`StepError`]
//! carrying its kind and whether the failure is worth retrying.  The retry
//! controller in `workflow` inspects the tag; errors are never used for
//! control flow beyond that.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Classified step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// The step exceeded its declared timeout.
    Timeout,
    /// Network-ish failure talking to a collaborator.
    Transport,
    /// The supervised external process was killed.
    ProcessKilled,
    /// Payload or context validation failure.
    Validation,
    /// A declared dependency has not succeeded.
    DependencyNotMet,
    /// Catch-all.
    Internal,
}

/// Error returned by a step's `run`.
///
/// `retryable` is the step-level classification; the retry controller
/// additionally requires the step declaration itself to be retryable.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl StepError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self { kind: StepErrorKind::Timeout, message: message.into(), retryable: true }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self { kind: StepErrorKind::Transport, message: message.into(), retryable: true }
    }

    pub fn process_killed(message: impl Into<String>) -> Self {
        Self { kind: StepErrorKind::ProcessKilled, message: message.into(), retryable: true }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self { kind: StepErrorKind::Validation, message: message.into(), retryable: false }
    }

    pub fn dependency_not_met(message: impl Into<String>) -> Self {
        Self { kind: StepErrorKind::DependencyNotMet, message: message.into(), retryable: false }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self { kind: StepErrorKind::Internal, message: message.into(), retryable: false }
    }
}

// ---------------------------------------------------------------------------
// StepContext / StepResult
// ---------------------------------------------------------------------------

/// Snapshot handed to every step attempt: the frozen workflow context plus
/// the results of all prior steps.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workflow_id: String,
    pub kind: String,
    pub context: Value,
    pub prior: Vec<StepResult>,
    /// Threads from the workflow down to anything the step supervises
    /// (subprocesses, validation pipeline).
    pub cancel: CancellationToken,
}

impl StepContext {
    /// Result of a named prior step, if it ran.
    pub fn result_of(&self, step: &str) -> Option<&StepResult> {
        self.prior.iter().find(|r| r.name == step)
    }

    /// Output of a named prior step, when it succeeded.
    pub fn output_of(&self, step: &str) -> Option<&Value> {
        self.result_of(step)
            .filter(|r| r.status == StepStatus::Succeeded)
            .and_then(|r| r.output.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Recorded outcome of one step (all attempts collapsed).
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub output: Option<Value>,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl StepResult {
    pub fn skipped(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            status: StepStatus::Skipped,
            output: None,
            attempts: 0,
            started_at: now,
            finished_at: now,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// StepHandler
// ---------------------------------------------------------------------------

/// The unit-of-work contract.  Implementations must be cancel-safe: the
/// runner may drop the future at any await point.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, ctx: StepContext) -> Result<Value, StepError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StepError>> + Send,
{
    async fn run(&self, ctx: StepContext) -> Result<Value, StepError> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a [`StepHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn StepHandler>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

// ---------------------------------------------------------------------------
// StepSpec
// ---------------------------------------------------------------------------

type ConditionFn = Arc<dyn Fn(&Value, &[StepResult]) -> bool + Send + Sync>;

/// Static declaration of one step in a workflow.
#[derive(Clone)]
pub struct StepSpec {
    pub name: String,
    pub handler: Arc<dyn StepHandler>,
    pub retryable: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// `None` disables the timeout.
    pub timeout: Option<Duration>,
    /// Names of steps that must have succeeded before this one runs.
    pub dependencies: Vec<String>,
    /// When present and false for the current context, the step is skipped.
    pub condition: Option<ConditionFn>,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
            retryable: false,
            max_retries: 0,
            retry_delay: Duration::from_millis(1000),
            timeout: Some(Duration::from_secs(30)),
            dependencies: Vec::new(),
            condition: None,
        }
    }

    pub fn retryable(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.retryable = true;
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub fn depends_on(mut self, steps: &[&str]) -> Self {
        self.dependencies = steps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Value, &[StepResult]) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }
}

impl std::fmt::Debug for StepSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepSpec")
            .field("name", &self.name)
            .field("retryable", &self.retryable)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}
