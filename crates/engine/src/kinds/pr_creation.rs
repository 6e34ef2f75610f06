//! Pull-request creation workflow.
//!
//! Steps: prepare → generate_content → validate_changes → create_pr →
//! configure_pr → notify.  `create_pr` aborts when `validate_changes`
//! reported any error-level blocker.

use std::time::Duration;

use serde_json::{json, Value};

use crate::error::EngineError;
use crate::kinds::{require_str_field, WorkflowKind};
use crate::step::{handler_fn, StepError, StepResult, StepSpec, StepStatus};

const VALIDATE_TIMEOUT: Duration = Duration::from_secs(90);
const CREATE_TIMEOUT: Duration = Duration::from_secs(60);
const CREATE_RETRIES: u32 = 2;
const CREATE_RETRY_DELAY: Duration = Duration::from_secs(3);

#[derive(Default)]
pub struct PrCreationWorkflow;

impl PrCreationWorkflow {
    pub fn new() -> Self {
        Self
    }
}

/// Blockers reported by `validate_changes` with this level abort the PR.
const BLOCKING_LEVEL: &str = "error";

impl WorkflowKind for PrCreationWorkflow {
    fn kind(&self) -> &str {
        "pr_creation"
    }

    fn validate_context(&self, context: &Value) -> Result<(), EngineError> {
        require_str_field(self.kind(), context, "repository")
    }

    fn steps(&self) -> Vec<StepSpec> {
        vec![
            StepSpec::new(
                "prepare",
                handler_fn(|ctx| async move {
                    let repository = ctx.context["repository"].as_str().unwrap_or_default();
                    let branch = ctx.context["branch"]
                        .as_str()
                        .map(str::to_owned)
                        .unwrap_or_else(|| format!("auto/{}", &ctx.workflow_id));
                    Ok(json!({ "repository": repository, "branch": branch }))
                }),
            ),
            StepSpec::new(
                "generate_content",
                handler_fn(|ctx| async move {
                    let changes = ctx.context["changes"].as_array().cloned().unwrap_or_default();
                    Ok(json!({
                        "title": ctx.context["title"].as_str().unwrap_or("Automated change"),
                        "body": ctx.context["description"].as_str().unwrap_or(""),
                        "files_changed": changes.len(),
                    }))
                }),
            )
            .depends_on(&["prepare"]),
            StepSpec::new(
                "validate_changes",
                handler_fn(|ctx| async move {
                    // Blockers arrive with the request; classification of the
                    // change set itself is a collaborator concern.
                    let blockers = ctx.context["blockers"].as_array().cloned().unwrap_or_default();
                    let error_count = blockers
                        .iter()
                        .filter(|b| b["level"].as_str() == Some(BLOCKING_LEVEL))
                        .count();
                    Ok(json!({ "blockers": blockers, "error_count": error_count }))
                }),
            )
            .with_timeout(VALIDATE_TIMEOUT)
            .depends_on(&["generate_content"]),
            StepSpec::new(
                "create_pr",
                handler_fn(|ctx| async move {
                    let validation = ctx
                        .output_of("validate_changes")
                        .cloned()
                        .ok_or_else(|| StepError::internal("missing validation output"))?;
                    let error_count = validation["error_count"].as_u64().unwrap_or(0);
                    if error_count > 0 {
                        return Err(StepError::validation(format!(
                            "refusing to create PR: {error_count} error-level blocker(s)"
                        )));
                    }
                    let branch = ctx
                        .output_of("prepare")
                        .and_then(|o| o["branch"].as_str())
                        .unwrap_or_default()
                        .to_owned();
                    Ok(json!({ "created": true, "head": branch }))
                }),
            )
            .with_timeout(CREATE_TIMEOUT)
            .retryable(CREATE_RETRIES, CREATE_RETRY_DELAY)
            .depends_on(&["validate_changes"]),
            StepSpec::new(
                "configure_pr",
                handler_fn(|ctx| async move {
                    let labels = ctx.context["labels"].as_array().cloned().unwrap_or_default();
                    Ok(json!({ "labels": labels, "reviewers_requested": true }))
                }),
            )
            .depends_on(&["create_pr"]),
            StepSpec::new(
                "notify",
                // Notification is best-effort; a missing notification target
                // is not a workflow failure.
                handler_fn(|_ctx| async move { Ok(json!({ "notified": true })) }),
            ),
        ]
    }

    fn build_result(&self, context: &Value, results: &[StepResult]) -> Value {
        let created = results
            .iter()
            .find(|r| r.name == "create_pr" && r.status == StepStatus::Succeeded)
            .and_then(|r| r.output.clone());
        json!({
            "kind": self.kind(),
            "repository": context["repository"].clone(),
            "pr": created,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepContext;
    use tokio_util::sync::CancellationToken;

    fn ctx_with_prior(context: Value, prior: Vec<StepResult>) -> StepContext {
        StepContext {
            workflow_id: "wf_test".into(),
            kind: "pr_creation".into(),
            context,
            prior,
            cancel: CancellationToken::new(),
        }
    }

    fn succeeded(name: &str, output: Value) -> StepResult {
        StepResult {
            name: name.into(),
            status: StepStatus::Succeeded,
            output: Some(output),
            attempts: 1,
            started_at: chrono::Utc::now(),
            finished_at: chrono::Utc::now(),
            error: None,
        }
    }

    #[test]
    fn context_requires_repository() {
        let kind = PrCreationWorkflow::new();
        assert!(kind.validate_context(&json!({ "repository": "org/repo" })).is_ok());
        assert!(kind.validate_context(&json!({ "repository": "" })).is_err());
        assert!(kind.validate_context(&json!({})).is_err());
    }

    #[tokio::test]
    async fn create_pr_aborts_on_error_level_blocker() {
        let kind = PrCreationWorkflow::new();
        let create = kind
            .steps()
            .into_iter()
            .find(|s| s.name == "create_pr")
            .unwrap();

        let prior = vec![
            succeeded("prepare", json!({ "branch": "auto/x" })),
            succeeded(
                "validate_changes",
                json!({ "blockers": [{ "level": "error", "message": "broken build" }], "error_count": 1 }),
            ),
        ];
        let err = create
            .handler
            .run(ctx_with_prior(json!({ "repository": "org/repo" }), prior))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::step::StepErrorKind::Validation);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn create_pr_proceeds_with_warning_blockers() {
        let kind = PrCreationWorkflow::new();
        let create = kind
            .steps()
            .into_iter()
            .find(|s| s.name == "create_pr")
            .unwrap();

        let prior = vec![
            succeeded("prepare", json!({ "branch": "auto/x" })),
            succeeded(
                "validate_changes",
                json!({ "blockers": [{ "level": "warning" }], "error_count": 0 }),
            ),
        ];
        let out = create
            .handler
            .run(ctx_with_prior(json!({ "repository": "org/repo" }), prior))
            .await
            .unwrap();
        assert_eq!(out["created"], true);
        assert_eq!(out["head"], "auto/x");
    }
}
