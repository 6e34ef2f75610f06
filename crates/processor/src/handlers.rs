//! Per-source handlers: translate ingress events into workflows.
//!
//! The default handlers route recognized event types to a workflow kind and
//! spawn its execution; unrecognized types are acknowledged as no-ops so
//! producers can ship event types we do not consume yet.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use engine::{EngineError, WorkflowEngine};
use store::Event;

use crate::error::ProcessError;

/// The per-source dispatch contract.  Handlers must be idempotent by event
/// id: the processor delivers at least once.
#[async_trait]
pub trait SourceHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<Value, ProcessError>;
}

type RouteFn = fn(&Event) -> Result<Option<(&'static str, Value)>, ProcessError>;

/// Routes an event to a workflow kind and starts it.
pub struct WorkflowDispatchHandler {
    engine: Arc<WorkflowEngine>,
    route: RouteFn,
}

impl WorkflowDispatchHandler {
    pub fn source_host(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine, route: route_source_host }
    }

    pub fn issue_tracker(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine, route: route_issue_tracker }
    }

    pub fn agent(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine, route: route_agent }
    }
}

#[async_trait]
impl SourceHandler for WorkflowDispatchHandler {
    async fn handle(&self, event: &Event) -> Result<Value, ProcessError> {
        let Some((kind, context)) = (self.route)(event)? else {
            debug!(event_id = %event.id, event_type = %event.event_type, "event ignored");
            return Ok(json!({ "action": "ignored", "event_type": event.event_type }));
        };

        let workflow = self.engine.create(kind, context).await.map_err(map_engine_error)?;
        let workflow_id = workflow.id.clone();

        // Execution runs in the background; handler success means the
        // workflow was admitted.
        let engine = self.engine.clone();
        let spawned_id = workflow_id.clone();
        tokio::spawn(async move {
            let _ = engine.execute(&spawned_id).await;
        });

        Ok(json!({ "action": "workflow_created", "workflow_id": workflow_id, "kind": kind }))
    }
}

fn map_engine_error(err: EngineError) -> ProcessError {
    match err {
        EngineError::Overloaded { .. } => ProcessError::Overloaded(err.to_string()),
        EngineError::InvalidContext { .. }
        | EngineError::UnknownKind(_)
        | EngineError::Registration { .. } => ProcessError::Validation(err.to_string()),
        other => ProcessError::Internal(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Routing tables
// ---------------------------------------------------------------------------

fn route_source_host(event: &Event) -> Result<Option<(&'static str, Value)>, ProcessError> {
    match event.event_type.as_str() {
        "push" | "pull_request" => {
            let repository = repository_of(&event.payload).ok_or_else(|| {
                ProcessError::Validation("source-host event without repository".into())
            })?;
            Ok(Some((
                "validation",
                json!({
                    "repository": repository,
                    "event_id": event.id,
                    "branch": event.payload.get("ref").cloned().unwrap_or(Value::Null),
                }),
            )))
        }
        _ => Ok(None),
    }
}

fn route_issue_tracker(event: &Event) -> Result<Option<(&'static str, Value)>, ProcessError> {
    match event.event_type.as_str() {
        "issue.created" | "issue.assigned" => {
            let task = event
                .payload
                .get("issue")
                .cloned()
                .unwrap_or_else(|| event.payload.clone());
            Ok(Some((
                "task_processing",
                json!({ "task": task, "event_id": event.id }),
            )))
        }
        _ => Ok(None),
    }
}

fn route_agent(event: &Event) -> Result<Option<(&'static str, Value)>, ProcessError> {
    match event.event_type.as_str() {
        "task.completed" => {
            let repository = repository_of(&event.payload).ok_or_else(|| {
                ProcessError::Validation("agent completion without repository".into())
            })?;
            Ok(Some((
                "pr_creation",
                json!({
                    "repository": repository,
                    "event_id": event.id,
                    "title": event.payload.get("title").cloned().unwrap_or(Value::Null),
                    "changes": event.payload.get("changes").cloned().unwrap_or(json!([])),
                    "blockers": event.payload.get("blockers").cloned().unwrap_or(json!([])),
                }),
            )))
        }
        _ => Ok(None),
    }
}

/// `repository` as either a plain string or an object with `full_name`.
fn repository_of(payload: &Value) -> Option<String> {
    match payload.get("repository") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Object(obj)) => {
            obj.get("full_name").and_then(Value::as_str).map(str::to_owned)
        }
        _ => None,
    }
}
