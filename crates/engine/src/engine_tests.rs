//! Integration tests for the workflow engine.
//!
//! These use small purpose-built kinds plus the bundled concrete kinds; no
//! external collaborators are required.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use bus::{EventBus, SubscribeOpts};

use crate::error::EngineError;
use crate::kinds::{PrCreationWorkflow, TaskProcessingWorkflow, ValidationWorkflow, WorkflowKind};
use crate::registry::{EngineConfig, WorkflowEngine};
use crate::step::{handler_fn, StepError, StepResult, StepSpec, StepStatus};
use crate::workflow::WorkflowStatus;

/// A kind built from a canned step list, for exercising the runner.
struct TestKind {
    name: &'static str,
    steps: Vec<StepSpec>,
}

impl TestKind {
    fn new(name: &'static str, steps: Vec<StepSpec>) -> Arc<Self> {
        Arc::new(Self { name, steps })
    }
}

impl WorkflowKind for TestKind {
    fn kind(&self) -> &str {
        self.name
    }

    fn validate_context(&self, _context: &Value) -> Result<(), EngineError> {
        Ok(())
    }

    fn steps(&self) -> Vec<StepSpec> {
        self.steps.clone()
    }

    fn build_result(&self, _context: &Value, results: &[StepResult]) -> Value {
        json!({ "steps_recorded": results.len() })
    }
}

fn ok_step(name: &'static str) -> StepSpec {
    StepSpec::new(name, handler_fn(move |_ctx| async move { Ok(json!({ "step": name })) }))
}

async fn engine_with(bus: &EventBus) -> Arc<WorkflowEngine> {
    WorkflowEngine::new(bus.clone(), EngineConfig::default())
}

// ============================================================
// Happy path + determinism
// ============================================================

#[tokio::test]
async fn task_processing_runs_all_steps_in_order() {
    let bus = EventBus::default();
    let engine = engine_with(&bus).await;
    engine.register(Arc::new(TaskProcessingWorkflow::new())).await.unwrap();

    let context = json!({ "task": { "id": "T-7", "description": "- add tests\n- wire CI" } });
    let workflow = engine.create("task_processing", context).await.unwrap();
    let id = workflow.id.clone();

    let result = engine.execute(&id).await.unwrap();
    assert_eq!(result["steps_succeeded"], 6);
    assert_eq!(workflow.status().await, WorkflowStatus::Completed);
    assert_eq!(workflow.progress().await, 100.0);

    let names: Vec<String> =
        workflow.snapshot().await.step_results.iter().map(|r| r.name.clone()).collect();
    assert_eq!(
        names,
        vec![
            "initialize",
            "analyze_requirements",
            "plan_execution",
            "execute_processing",
            "validate_results",
            "finalize",
        ]
    );
}

#[tokio::test]
async fn identical_context_yields_identical_step_sequences() {
    let bus = EventBus::default();
    let engine = engine_with(&bus).await;
    engine.register(Arc::new(TaskProcessingWorkflow::new())).await.unwrap();

    let context = json!({ "task": { "id": "T-1", "description": "- one" } });

    let mut sequences = Vec::new();
    for _ in 0..2 {
        let workflow = engine.create("task_processing", context.clone()).await.unwrap();
        engine.execute(&workflow.id).await.unwrap();
        let seq: Vec<(String, StepStatus, Option<Value>)> = workflow
            .snapshot()
            .await
            .step_results
            .iter()
            .map(|r| (r.name.clone(), r.status, r.output.clone()))
            .collect();
        sequences.push(seq);
    }
    assert_eq!(sequences[0], sequences[1]);
}

// ============================================================
// Retry semantics
// ============================================================

#[tokio::test]
async fn retryable_step_succeeds_on_third_attempt() {
    let bus = EventBus::default();
    let engine = engine_with(&bus).await;

    let started = Arc::new(AtomicU32::new(0));
    let counter = started.clone();
    bus.subscribe("workflow.step.started", SubscribeOpts::default(), move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .await
    .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_step = calls.clone();
    let flaky = StepSpec::new(
        "flaky",
        handler_fn(move |_ctx| {
            let calls = calls_in_step.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(StepError::transport("connection reset by peer"))
                } else {
                    Ok(json!({ "attempt": n }))
                }
            }
        }),
    )
    .retryable(3, Duration::from_millis(10))
    .with_timeout(Duration::from_secs(1));

    engine.register(TestKind::new("flaky_kind", vec![flaky])).await.unwrap();
    let workflow = engine.create("flaky_kind", json!({})).await.unwrap();
    engine.execute(&workflow.id).await.unwrap();

    assert_eq!(workflow.status().await, WorkflowStatus::Completed);
    let results = workflow.snapshot().await.step_results;
    assert_eq!(results[0].attempts, 3);
    assert_eq!(results[0].output.as_ref().unwrap()["attempt"], 3);
    // One started event per attempt.
    assert_eq!(started.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retries_exhausted_fails_the_workflow() {
    let bus = EventBus::default();
    let engine = engine_with(&bus).await;

    let hopeless = StepSpec::new(
        "hopeless",
        handler_fn(|_ctx| async move {
            Err::<Value, _>(StepError::transport("connection refused"))
        }),
    )
    .retryable(2, Duration::from_millis(5));

    engine
        .register(TestKind::new("hopeless_kind", vec![hopeless, ok_step("never")]))
        .await
        .unwrap();
    let workflow = engine.create("hopeless_kind", json!({})).await.unwrap();

    let err = engine.execute(&workflow.id).await.unwrap_err();
    assert!(matches!(err, EngineError::StepFailed { ref step, .. } if step == "hopeless"));
    assert_eq!(workflow.status().await, WorkflowStatus::Failed);

    let results = workflow.snapshot().await.step_results;
    // 1 initial attempt + 2 retries, and 'never' did not run.
    assert_eq!(results[0].attempts, 3);
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn non_retryable_failure_is_not_retried() {
    let bus = EventBus::default();
    let engine = engine_with(&bus).await;

    let fatal = StepSpec::new(
        "fatal",
        handler_fn(|_ctx| async move {
            Err::<Value, _>(StepError::validation("payload rejected"))
        }),
    )
    .retryable(3, Duration::from_millis(5));

    engine.register(TestKind::new("fatal_kind", vec![fatal])).await.unwrap();
    let workflow = engine.create("fatal_kind", json!({})).await.unwrap();

    engine.execute(&workflow.id).await.unwrap_err();
    assert_eq!(workflow.snapshot().await.step_results[0].attempts, 1);
}

// ============================================================
// Dependencies, conditions, timeouts
// ============================================================

#[tokio::test]
async fn unmet_dependency_fails_without_running_the_step() {
    let bus = EventBus::default();
    let engine = engine_with(&bus).await;

    let ran = Arc::new(AtomicU32::new(0));
    let ran_in_step = ran.clone();
    let dependent = StepSpec::new(
        "dependent",
        handler_fn(move |_ctx| {
            let ran = ran_in_step.clone();
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(json!({}))
            }
        }),
    )
    .depends_on(&["missing_step"]);

    engine.register(TestKind::new("dep_kind", vec![dependent])).await.unwrap();
    let workflow = engine.create("dep_kind", json!({})).await.unwrap();

    let err = engine.execute(&workflow.id).await.unwrap_err();
    match err {
        EngineError::StepFailed { source, .. } => {
            assert_eq!(source.kind, crate::step::StepErrorKind::DependencyNotMet);
            assert!(!source.retryable);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(workflow.status().await, WorkflowStatus::Failed);
}

#[tokio::test]
async fn false_condition_skips_the_step() {
    let bus = EventBus::default();
    let engine = engine_with(&bus).await;

    let gated = ok_step("gated").when(|context, _results| {
        context["enable_gated"].as_bool().unwrap_or(false)
    });

    engine
        .register(TestKind::new("gated_kind", vec![gated, ok_step("after")]))
        .await
        .unwrap();
    let workflow = engine.create("gated_kind", json!({ "enable_gated": false })).await.unwrap();
    engine.execute(&workflow.id).await.unwrap();

    let results = workflow.snapshot().await.step_results;
    assert_eq!(results[0].status, StepStatus::Skipped);
    assert_eq!(results[1].status, StepStatus::Succeeded);
    assert_eq!(workflow.status().await, WorkflowStatus::Completed);
}

#[tokio::test]
async fn step_timeout_is_a_failure() {
    let bus = EventBus::default();
    let engine = engine_with(&bus).await;

    let slow = StepSpec::new(
        "slow",
        handler_fn(|_ctx| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!({}))
        }),
    )
    .with_timeout(Duration::from_millis(50));

    engine.register(TestKind::new("slow_kind", vec![slow])).await.unwrap();
    let workflow = engine.create("slow_kind", json!({})).await.unwrap();

    let started = std::time::Instant::now();
    let err = engine.execute(&workflow.id).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    match err {
        EngineError::StepFailed { source, .. } => {
            assert_eq!(source.kind, crate::step::StepErrorKind::Timeout);
        }
        other => panic!("unexpected error: {other}"),
    }
}

// ============================================================
// Cancellation, pause/resume
// ============================================================

#[tokio::test]
async fn cancel_preempts_a_sleeping_step() {
    let bus = EventBus::default();
    let engine = engine_with(&bus).await;

    let sleeper = StepSpec::new(
        "sleeper",
        handler_fn(|_ctx| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!({}))
        }),
    )
    .no_timeout();

    engine.register(TestKind::new("sleepy_kind", vec![sleeper])).await.unwrap();
    let workflow = engine.create("sleepy_kind", json!({})).await.unwrap();
    let id = workflow.id.clone();

    let engine_task = engine.clone();
    let handle = tokio::spawn(async move { engine_task.execute(&id).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    workflow.cancel("operator_request").await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(matches!(result, Err(EngineError::Cancelled { .. })));
    assert_eq!(workflow.status().await, WorkflowStatus::Cancelled);
    assert_eq!(workflow.progress().await, 100.0);
}

#[tokio::test]
async fn cancel_preempts_a_pending_retry() {
    let bus = EventBus::default();
    let engine = engine_with(&bus).await;

    let flaky = StepSpec::new(
        "always_failing",
        handler_fn(|_ctx| async move {
            Err::<Value, _>(StepError::transport("timeout talking upstream"))
        }),
    )
    .retryable(10, Duration::from_secs(60));

    engine.register(TestKind::new("retrying_kind", vec![flaky])).await.unwrap();
    let workflow = engine.create("retrying_kind", json!({})).await.unwrap();
    let id = workflow.id.clone();

    let engine_task = engine.clone();
    let handle = tokio::spawn(async move { engine_task.execute(&id).await });

    // Give the first attempt time to fail and enter the retry sleep.
    tokio::time::sleep(Duration::from_millis(100)).await;
    workflow.cancel("shutting_down").await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(matches!(result, Err(EngineError::Cancelled { .. })));
    assert_eq!(workflow.status().await, WorkflowStatus::Cancelled);
}

#[tokio::test]
async fn pause_resume_legality() {
    let bus = EventBus::default();
    let engine = engine_with(&bus).await;
    engine.register(TestKind::new("quick_kind", vec![ok_step("only")])).await.unwrap();

    let workflow = engine.create("quick_kind", json!({})).await.unwrap();

    // Not running yet: neither pause nor resume is legal.
    assert!(matches!(
        workflow.pause().await,
        Err(EngineError::InvalidTransition { action: "pause", .. })
    ));
    assert!(matches!(
        workflow.resume().await,
        Err(EngineError::InvalidTransition { action: "resume", .. })
    ));

    engine.execute(&workflow.id).await.unwrap();

    // Terminal: still illegal.
    assert!(workflow.pause().await.is_err());
    assert!(workflow.cancel("too_late").await.is_err());
}

#[tokio::test]
async fn paused_workflow_waits_and_resumes() {
    let bus = EventBus::default();
    let engine = engine_with(&bus).await;

    let gate = Arc::new(tokio::sync::Notify::new());
    let gate_in_step = gate.clone();
    let first = StepSpec::new(
        "gated",
        handler_fn(move |_ctx| {
            let gate = gate_in_step.clone();
            async move {
                gate.notified().await;
                Ok(json!({}))
            }
        }),
    )
    .no_timeout();

    engine
        .register(TestKind::new("pausable_kind", vec![first, ok_step("second")]))
        .await
        .unwrap();
    let workflow = engine.create("pausable_kind", json!({})).await.unwrap();
    let id = workflow.id.clone();

    let engine_task = engine.clone();
    let handle = tokio::spawn(async move { engine_task.execute(&id).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    workflow.pause().await.unwrap();
    assert_eq!(workflow.status().await, WorkflowStatus::Paused);

    // Release the in-flight step; the loop must now hold before 'second'.
    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(workflow.snapshot().await.step_results.len(), 1);

    workflow.resume().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(workflow.status().await, WorkflowStatus::Completed);
}

// ============================================================
// Engine-level behaviour
// ============================================================

#[tokio::test]
async fn create_rejects_beyond_the_concurrency_cap() {
    let bus = EventBus::default();
    let engine = WorkflowEngine::new(
        bus.clone(),
        EngineConfig { max_concurrent_workflows: 1, ..Default::default() },
    );
    engine.register(TestKind::new("capped_kind", vec![ok_step("s")])).await.unwrap();

    engine.create("capped_kind", json!({})).await.unwrap();
    let err = engine.create("capped_kind", json!({})).await.unwrap_err();
    assert!(matches!(err, EngineError::Overloaded { active: 1, limit: 1 }));
}

#[tokio::test]
async fn unknown_kind_and_empty_kind_are_rejected() {
    let bus = EventBus::default();
    let engine = engine_with(&bus).await;

    assert!(matches!(
        engine.create("nope", json!({})).await.unwrap_err(),
        EngineError::UnknownKind(_)
    ));

    let err = engine.register(TestKind::new("empty_kind", vec![])).await.unwrap_err();
    assert!(matches!(err, EngineError::Registration { .. }));
}

#[tokio::test]
async fn invalid_context_is_rejected_at_create() {
    let bus = EventBus::default();
    let engine = engine_with(&bus).await;
    engine.register(Arc::new(PrCreationWorkflow::new())).await.unwrap();

    let err = engine.create("pr_creation", json!({})).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidContext { .. }));
    assert_eq!(engine.active_count().await, 0);
}

#[tokio::test]
async fn system_shutdown_cancels_active_workflows() {
    let bus = EventBus::default();
    let engine = engine_with(&bus).await;
    engine.register(TestKind::new("idle_kind", vec![ok_step("s")])).await.unwrap();

    // Listener installation races construction; give it a tick.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let workflow = engine.create("idle_kind", json!({})).await.unwrap();
    bus.publish("system.shutdown", json!({}), false).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(workflow.status().await, WorkflowStatus::Cancelled);
    assert_eq!(workflow.snapshot().await.cancel_reason.as_deref(), Some("system_shutdown"));
}

#[tokio::test]
async fn finished_workflows_are_archived_with_result() {
    let bus = EventBus::default();
    let engine = engine_with(&bus).await;
    engine.register(TestKind::new("archive_kind", vec![ok_step("s")])).await.unwrap();

    let workflow = engine.create("archive_kind", json!({})).await.unwrap();
    engine.execute(&workflow.id).await.unwrap();

    let archived = engine.archived(10).await;
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].id, workflow.id);
    assert_eq!(archived[0].status, WorkflowStatus::Completed);
    assert!(archived[0].result.is_some());
    assert!(archived[0].completed_at.is_some());
}

// ============================================================
// Concrete kinds end-to-end
// ============================================================

#[tokio::test]
async fn validation_workflow_reports_critical_failure() {
    let bus = EventBus::default();
    let engine = engine_with(&bus).await;
    engine.register(Arc::new(ValidationWorkflow::new())).await.unwrap();

    let context = json!({
        "repository": "org/repo",
        "checks": { "security": { "passed": false } },
    });
    let workflow = engine.create("validation", context).await.unwrap();
    let result = engine.execute(&workflow.id).await.unwrap();

    assert_eq!(workflow.status().await, WorkflowStatus::Completed);
    assert_eq!(result["report"]["overall_passed"], false);
    assert_eq!(result["report"]["critical_failures"][0], "security");
    assert_eq!(result["report"]["passed_count"], 4);
}

#[tokio::test]
async fn pr_creation_fails_on_error_blocker() {
    let bus = EventBus::default();
    let engine = engine_with(&bus).await;
    engine.register(Arc::new(PrCreationWorkflow::new())).await.unwrap();

    let context = json!({
        "repository": "org/repo",
        "blockers": [{ "level": "error", "message": "tests failing" }],
    });
    let workflow = engine.create("pr_creation", context).await.unwrap();

    let err = engine.execute(&workflow.id).await.unwrap_err();
    assert!(matches!(err, EngineError::StepFailed { ref step, .. } if step == "create_pr"));
    assert_eq!(workflow.status().await, WorkflowStatus::Failed);
}
