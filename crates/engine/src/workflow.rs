//! The workflow runtime: lifecycle state machine plus the step loop.
//!
//! A workflow's context is frozen at creation; steps run strictly in
//! declaration order.  Pause gates between steps, cancellation is observed
//! between steps, at every await inside the step runner, and during retry
//! sleeps.  Once a terminal status is reached no state field mutates again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use bus::EventBus;

use crate::error::EngineError;
use crate::kinds::WorkflowKind;
use crate::step::{StepContext, StepError, StepResult, StepSpec, StepStatus};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct WorkflowState {
    status: WorkflowStatus,
    current_step_index: usize,
    step_results: Vec<StepResult>,
    metadata: serde_json::Map<String, Value>,
    result: Option<Value>,
    error: Option<String>,
    cancel_reason: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
}

/// Read-only view served by the status endpoints and used for archival.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSnapshot {
    pub id: String,
    pub kind: String,
    pub status: WorkflowStatus,
    pub current_step_index: usize,
    pub total_steps: usize,
    pub progress: f64,
    pub step_results: Vec<StepResult>,
    pub metadata: serde_json::Map<String, Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

enum StepRun {
    Completed(StepResult),
    Failed(StepResult, StepError),
    Cancelled,
}

pub struct Workflow {
    pub id: String,
    kind: Arc<dyn WorkflowKind>,
    context: Value,
    steps: Vec<StepSpec>,
    state: RwLock<WorkflowState>,
    cancel: CancellationToken,
    pause_tx: watch::Sender<bool>,
    bus: EventBus,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Workflow {
    pub fn new(id: String, kind: Arc<dyn WorkflowKind>, context: Value, bus: EventBus) -> Self {
        let (pause_tx, _) = watch::channel(false);
        let steps = kind.steps();
        Self {
            id,
            kind,
            context,
            steps,
            state: RwLock::new(WorkflowState {
                status: WorkflowStatus::Created,
                current_step_index: 0,
                step_results: Vec::new(),
                metadata: serde_json::Map::new(),
                result: None,
                error: None,
                cancel_reason: None,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                failed_at: None,
                cancelled_at: None,
            }),
            cancel: CancellationToken::new(),
            pause_tx,
            bus,
        }
    }

    pub fn kind_name(&self) -> &str {
        self.kind.kind()
    }

    pub async fn status(&self) -> WorkflowStatus {
        self.state.read().await.status
    }

    /// `current_step_index / total * 100`, or 100 once terminal.
    pub async fn progress(&self) -> f64 {
        let state = self.state.read().await;
        if state.status.is_terminal() {
            return 100.0;
        }
        if self.steps.is_empty() {
            return 0.0;
        }
        state.current_step_index as f64 / self.steps.len() as f64 * 100.0
    }

    pub async fn snapshot(&self) -> WorkflowSnapshot {
        let state = self.state.read().await;
        let progress = if state.status.is_terminal() {
            100.0
        } else if self.steps.is_empty() {
            0.0
        } else {
            state.current_step_index as f64 / self.steps.len() as f64 * 100.0
        };
        WorkflowSnapshot {
            id: self.id.clone(),
            kind: self.kind.kind().to_string(),
            status: state.status,
            current_step_index: state.current_step_index,
            total_steps: self.steps.len(),
            progress,
            step_results: state.step_results.clone(),
            metadata: state.metadata.clone(),
            result: state.result.clone(),
            error: state.error.clone(),
            cancel_reason: state.cancel_reason.clone(),
            created_at: state.created_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
            failed_at: state.failed_at,
            cancelled_at: state.cancelled_at,
        }
    }

    /// Merge a key into the workflow's mutable metadata.  Rejected once
    /// terminal.
    pub async fn set_metadata(&self, key: impl Into<String>, value: Value) {
        let mut state = self.state.write().await;
        if state.status.is_terminal() {
            return;
        }
        state.metadata.insert(key.into(), value);
    }

    // -----------------------------------------------------------------
    // Lifecycle controls
    // -----------------------------------------------------------------

    /// Legal only while `Running`.
    pub async fn pause(&self) -> Result<(), EngineError> {
        {
            let mut state = self.state.write().await;
            if state.status != WorkflowStatus::Running {
                return Err(EngineError::InvalidTransition { action: "pause", status: state.status });
            }
            state.status = WorkflowStatus::Paused;
        }
        let _ = self.pause_tx.send(true);
        self.emit("workflow.paused", json!({ "workflow_id": self.id })).await;
        Ok(())
    }

    /// Legal only while `Paused`.
    pub async fn resume(&self) -> Result<(), EngineError> {
        {
            let mut state = self.state.write().await;
            if state.status != WorkflowStatus::Paused {
                return Err(EngineError::InvalidTransition { action: "resume", status: state.status });
            }
            state.status = WorkflowStatus::Running;
        }
        let _ = self.pause_tx.send(false);
        self.emit("workflow.resumed", json!({ "workflow_id": self.id })).await;
        Ok(())
    }

    /// Legal in `Created | Running | Paused`; always drives the workflow to
    /// `Cancelled`.  A pending retry sleep or in-flight step is preempted.
    pub async fn cancel(&self, reason: impl Into<String>) -> Result<(), EngineError> {
        let reason = reason.into();
        let was_created = {
            let mut state = self.state.write().await;
            match state.status {
                WorkflowStatus::Created | WorkflowStatus::Running | WorkflowStatus::Paused => {
                    state.cancel_reason = Some(reason.clone());
                }
                status => {
                    return Err(EngineError::InvalidTransition { action: "cancel", status });
                }
            }
            state.status == WorkflowStatus::Created
        };

        self.cancel.cancel();

        // Nothing is executing yet, so the state machine is finished here;
        // otherwise the running task observes the token and finishes it.
        if was_created {
            self.finish_cancelled().await;
        }
        Ok(())
    }

    /// Token observed by steps and the validation executor below them.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // -----------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------

    /// Run all steps in declaration order.  Consumes the `Created` state;
    /// a second call is an `InvalidTransition`.
    #[instrument(skip(self), fields(workflow_id = %self.id, kind = %self.kind.kind()))]
    pub async fn execute(&self) -> Result<Value, EngineError> {
        {
            let mut state = self.state.write().await;
            if state.status != WorkflowStatus::Created {
                return Err(EngineError::InvalidTransition { action: "execute", status: state.status });
            }
            state.status = WorkflowStatus::Running;
            state.started_at = Some(Utc::now());
        }
        self.emit(
            "workflow.started",
            json!({ "workflow_id": self.id, "kind": self.kind.kind() }),
        )
        .await;

        for index in 0..self.steps.len() {
            {
                let mut state = self.state.write().await;
                state.current_step_index = index;
            }

            if self.cancel.is_cancelled() {
                self.finish_cancelled().await;
                return Err(self.cancelled_error().await);
            }
            if self.wait_if_paused().await.is_err() {
                self.finish_cancelled().await;
                return Err(self.cancelled_error().await);
            }

            let spec = self.steps[index].clone();
            let prior = self.state.read().await.step_results.clone();

            if let Some(condition) = &spec.condition {
                if !condition(&self.context, &prior) {
                    debug!(step = %spec.name, "condition false; step skipped");
                    let mut state = self.state.write().await;
                    state.step_results.push(StepResult::skipped(&spec.name));
                    continue;
                }
            }

            if let Some(missing) = self.unmet_dependency(&spec, &prior) {
                let error = StepError::dependency_not_met(format!(
                    "step '{}' requires '{}' to have succeeded",
                    spec.name, missing
                ));
                let now = Utc::now();
                let result = StepResult {
                    name: spec.name.clone(),
                    status: StepStatus::Failed,
                    output: None,
                    attempts: 0,
                    started_at: now,
                    finished_at: now,
                    error: Some(error.to_string()),
                };
                self.emit(
                    "workflow.step.failed",
                    json!({
                        "workflow_id": self.id,
                        "step": spec.name,
                        "attempt": 0,
                        "error": error.to_string(),
                    }),
                )
                .await;
                self.record_and_fail(result, &spec.name, error.clone()).await;
                return Err(EngineError::StepFailed { step: spec.name.clone(), source: error });
            }

            match self.run_step(&spec, prior).await {
                StepRun::Completed(result) => {
                    let mut state = self.state.write().await;
                    state.step_results.push(result);
                }
                StepRun::Failed(result, error) => {
                    self.record_and_fail(result, &spec.name, error.clone()).await;
                    return Err(EngineError::StepFailed { step: spec.name.clone(), source: error });
                }
                StepRun::Cancelled => {
                    self.finish_cancelled().await;
                    return Err(self.cancelled_error().await);
                }
            }
        }

        let results = self.state.read().await.step_results.clone();
        let result = self.kind.build_result(&self.context, &results);
        {
            let mut state = self.state.write().await;
            if !state.status.is_terminal() {
                state.status = WorkflowStatus::Completed;
                state.completed_at = Some(Utc::now());
                state.current_step_index = self.steps.len();
                state.result = Some(result.clone());
            }
        }
        self.emit(
            "workflow.completed",
            json!({ "workflow_id": self.id, "kind": self.kind.kind() }),
        )
        .await;
        info!(workflow_id = %self.id, "workflow completed");
        Ok(result)
    }

    fn unmet_dependency<'a>(&self, spec: &'a StepSpec, prior: &[StepResult]) -> Option<&'a str> {
        spec.dependencies.iter().map(String::as_str).find(|dep| {
            !prior
                .iter()
                .any(|r| r.name == *dep && r.status == StepStatus::Succeeded)
        })
    }

    /// One step, all attempts.  Cancellation is selected at every await.
    async fn run_step(&self, spec: &StepSpec, prior: Vec<StepResult>) -> StepRun {
        let started_at = Utc::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.emit(
                "workflow.step.started",
                json!({ "workflow_id": self.id, "step": spec.name, "attempt": attempt }),
            )
            .await;

            let ctx = StepContext {
                workflow_id: self.id.clone(),
                kind: self.kind.kind().to_string(),
                context: self.context.clone(),
                prior: prior.clone(),
                cancel: self.cancel.clone(),
            };

            let run = spec.handler.run(ctx);
            let outcome: Result<Value, StepError> = match spec.timeout {
                Some(limit) => tokio::select! {
                    _ = self.cancel.cancelled() => return StepRun::Cancelled,
                    timed = tokio::time::timeout(limit, run) => match timed {
                        Ok(result) => result,
                        Err(_) => Err(StepError::timeout(format!(
                            "step '{}' exceeded {limit:?}", spec.name
                        ))),
                    },
                },
                None => tokio::select! {
                    _ = self.cancel.cancelled() => return StepRun::Cancelled,
                    result = run => result,
                },
            };

            match outcome {
                Ok(output) => {
                    self.emit(
                        "workflow.step.completed",
                        json!({ "workflow_id": self.id, "step": spec.name, "attempt": attempt }),
                    )
                    .await;
                    return StepRun::Completed(StepResult {
                        name: spec.name.clone(),
                        status: StepStatus::Succeeded,
                        output: Some(output),
                        attempts: attempt,
                        started_at,
                        finished_at: Utc::now(),
                        error: None,
                    });
                }
                Err(error) => {
                    self.emit(
                        "workflow.step.failed",
                        json!({
                            "workflow_id": self.id,
                            "step": spec.name,
                            "attempt": attempt,
                            "error": error.to_string(),
                        }),
                    )
                    .await;

                    if spec.retryable && error.retryable && attempt <= spec.max_retries {
                        warn!(
                            step = %spec.name, attempt, max_retries = spec.max_retries,
                            "step failed; retrying after {:?}", spec.retry_delay
                        );
                        tokio::select! {
                            _ = self.cancel.cancelled() => return StepRun::Cancelled,
                            _ = tokio::time::sleep(spec.retry_delay) => {}
                        }
                        continue;
                    }

                    return StepRun::Failed(
                        StepResult {
                            name: spec.name.clone(),
                            status: StepStatus::Failed,
                            output: None,
                            attempts: attempt,
                            started_at,
                            finished_at: Utc::now(),
                            error: Some(error.to_string()),
                        },
                        error,
                    );
                }
            }
        }
    }

    /// Block between steps while paused; `Err(())` means cancelled.
    async fn wait_if_paused(&self) -> Result<(), ()> {
        let mut rx = self.pause_tx.subscribe();
        loop {
            if !*rx.borrow() {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(()),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn record_and_fail(&self, result: StepResult, step: &str, error: StepError) {
        {
            let mut state = self.state.write().await;
            if state.status.is_terminal() {
                return;
            }
            state.step_results.push(result);
            state.status = WorkflowStatus::Failed;
            state.failed_at = Some(Utc::now());
            state.error = Some(error.to_string());
        }
        self.emit(
            "workflow.failed",
            json!({ "workflow_id": self.id, "step": step, "error": error.to_string() }),
        )
        .await;
        warn!(workflow_id = %self.id, step, %error, "workflow failed");
    }

    async fn finish_cancelled(&self) {
        let reason = {
            let mut state = self.state.write().await;
            if state.status.is_terminal() {
                return;
            }
            state.status = WorkflowStatus::Cancelled;
            state.cancelled_at = Some(Utc::now());
            state.cancel_reason.clone()
        };
        self.emit(
            "workflow.cancelled",
            json!({ "workflow_id": self.id, "reason": reason }),
        )
        .await;
        info!(workflow_id = %self.id, ?reason, "workflow cancelled");
    }

    async fn cancelled_error(&self) -> EngineError {
        EngineError::Cancelled { reason: self.state.read().await.cancel_reason.clone() }
    }

    async fn emit(&self, event_type: &str, data: Value) {
        self.bus.publish(event_type, data, false).await;
    }
}
