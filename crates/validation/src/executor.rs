//! The validation executor: concurrency gate, pipeline phases, tool
//! supervision, and scoped cleanup.
//!
//! `execute` admits a request through the gate, then runs the pipeline on
//! its own task so cleanup happens on every exit path even if the awaiting
//! caller is dropped.  Cancellation is checked between phases and selected
//! at every await inside the process supervisor.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::ValidationError;
use crate::process::{run_with_retries, CommandSpec};
use crate::sandbox::{Sandbox, SandboxManager};
use crate::workspace::{Workspace, WorkspaceManager, WorkspaceStatus};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Gate on simultaneously running validations.  Default 10.
    pub max_concurrent_validations: usize,
    /// Overall budget for the external tool run.  Default 600 s.
    pub validation_timeout: Duration,
    /// Budget for clone and dependency install.  Default 300 s.
    pub git_timeout: Duration,
    /// Shallow-clone depth.  Default 50.
    pub clone_depth: u32,
    /// Retry budget for command-style failures.  Default 3.
    pub max_retries: u32,
    /// Grace between SIGTERM and the forced kill.  Default 5 s.
    pub kill_grace: Duration,
    /// Base URL prepended to `org/repo` style references.
    pub repo_base_url: String,
    /// Wrap the tool run in a sandbox scope.  Default off.
    pub sandbox_enabled: bool,
    /// Janitor cadence for aged workspaces and orphan sandboxes.
    /// Default 1 h.
    pub janitor_interval: Duration,
    /// The external analysis tool.
    pub tool_program: String,
    pub tool_args: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_validations: 10,
            validation_timeout: Duration::from_secs(600),
            git_timeout: Duration::from_secs(300),
            clone_depth: 50,
            max_retries: 3,
            kill_grace: Duration::from_secs(5),
            repo_base_url: "https://github.com".into(),
            sandbox_enabled: false,
            janitor_interval: Duration::from_secs(60 * 60),
            tool_program: "repo-analyzer".into(),
            tool_args: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Active-validation bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPhase {
    Initializing,
    WorkspaceCreated,
    RepositoryCloned,
    SandboxReady,
    Validating,
    Reporting,
    Finished,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveValidation {
    pub id: String,
    pub request: Value,
    pub started_at: DateTime<Utc>,
    pub phase: ValidationPhase,
}

#[derive(Debug, Default)]
struct MetricsInner {
    total: u64,
    successful: u64,
    failed: u64,
    mean_duration_ms: f64,
    peak_concurrent: usize,
}

/// Snapshot served by the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationMetrics {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub mean_duration_ms: f64,
    pub peak_concurrent: usize,
    pub active: usize,
}

// ---------------------------------------------------------------------------
// ValidationExecutor
// ---------------------------------------------------------------------------

pub struct ValidationExecutor {
    config: ExecutorConfig,
    workspaces: Arc<WorkspaceManager>,
    sandboxes: Arc<SandboxManager>,
    active: Arc<RwLock<HashMap<String, ActiveValidation>>>,
    metrics: Arc<Mutex<MetricsInner>>,
}

impl ValidationExecutor {
    pub fn new(config: ExecutorConfig, workspaces: Arc<WorkspaceManager>) -> Arc<Self> {
        Arc::new(Self {
            config,
            workspaces,
            sandboxes: Arc::new(SandboxManager::new()),
            active: Arc::new(RwLock::new(HashMap::new())),
            metrics: Arc::new(Mutex::new(MetricsInner::default())),
        })
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    pub async fn active_ids(&self) -> Vec<String> {
        self.active.read().await.keys().cloned().collect()
    }

    pub async fn metrics(&self) -> ValidationMetrics {
        let inner = self.metrics.lock().await;
        ValidationMetrics {
            total: inner.total,
            successful: inner.successful,
            failed: inner.failed,
            mean_duration_ms: inner.mean_duration_ms,
            peak_concurrent: inner.peak_concurrent,
            active: self.active.read().await.len(),
        }
    }

    /// Run one validation to completion.
    ///
    /// The pipeline itself runs on a dedicated task: dropping the future
    /// returned here does not skip workspace cleanup or active-set removal.
    #[instrument(skip(self, request, cancel))]
    pub async fn execute(
        self: &Arc<Self>,
        request: Value,
        cancel: CancellationToken,
    ) -> Result<Value, ValidationError> {
        let id = new_validation_id();

        {
            let mut active = self.active.write().await;
            if active.len() >= self.config.max_concurrent_validations {
                return Err(ValidationError::LimitExceeded {
                    active: active.len(),
                    limit: self.config.max_concurrent_validations,
                });
            }
            active.insert(
                id.clone(),
                ActiveValidation {
                    id: id.clone(),
                    request: request.clone(),
                    started_at: Utc::now(),
                    phase: ValidationPhase::Initializing,
                },
            );
            let in_flight = active.len();
            drop(active);

            let mut metrics = self.metrics.lock().await;
            metrics.peak_concurrent = metrics.peak_concurrent.max(in_flight);
        }
        info!(validation_id = %id, "validation admitted");

        let this = self.clone();
        let task_id = id.clone();
        let handle =
            tokio::spawn(async move { this.run_pipeline(task_id, request, cancel).await });

        match handle.await {
            Ok(result) => result,
            Err(join_err) => {
                // The pipeline task itself owns cleanup; reaching this arm
                // means it panicked before finishing.
                self.active.write().await.remove(&id);
                Err(ValidationError::Workspace(format!("validation task failed: {join_err}")))
            }
        }
    }

    /// Periodic sweep of aged workspaces, orphan sandboxes, and the quota.
    pub fn spawn_janitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.janitor_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick is not a sweep.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else { break };
                if let Err(err) = this.workspaces.cleanup_old().await {
                    warn!(%err, "workspace age sweep failed");
                }
                let orphans = this.sandboxes.sweep_orphans(this.workspaces.base_dir()).await;
                if orphans > 0 {
                    info!(orphans, "orphan sandboxes swept");
                }
                match this.workspaces.check_usage().await {
                    Ok(report) if report.quota_exceeded => {
                        warn!(
                            total_bytes = report.total_bytes,
                            max_total_bytes = report.max_total_bytes,
                            "workspace quota exceeded"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => warn!(%err, "usage check failed"),
                }
            }
        })
    }

    // -----------------------------------------------------------------
    // Pipeline
    // -----------------------------------------------------------------

    async fn run_pipeline(
        self: Arc<Self>,
        id: String,
        request: Value,
        cancel: CancellationToken,
    ) -> Result<Value, ValidationError> {
        let started = Instant::now();
        let mut workspace: Option<Workspace> = None;
        let mut sandbox: Option<Sandbox> = None;

        let outcome = self
            .pipeline_phases(&id, &request, &cancel, &mut workspace, &mut sandbox)
            .await;

        // Cleanup runs on every exit path; errors here are swallowed by
        // the managers and must not fail the validation outcome.
        if let Some(sb) = &sandbox {
            self.sandboxes.cleanup(sb).await;
        }
        if let Some(ws) = &workspace {
            self.workspaces.cleanup(ws).await;
        }
        self.active.write().await.remove(&id);
        self.record_outcome(&outcome, started.elapsed()).await;

        outcome
    }

    async fn pipeline_phases(
        &self,
        id: &str,
        request: &Value,
        cancel: &CancellationToken,
        workspace_slot: &mut Option<Workspace>,
        sandbox_slot: &mut Option<Sandbox>,
    ) -> Result<Value, ValidationError> {
        ensure_live(cancel)?;
        self.set_phase(id, ValidationPhase::Initializing).await;

        let workspace = self.workspaces.create(request, id).await?;
        *workspace_slot = Some(workspace.clone());
        self.set_phase(id, ValidationPhase::WorkspaceCreated).await;
        ensure_live(cancel)?;

        match request.get("repository").and_then(Value::as_str) {
            Some(repository) => {
                self.workspaces.set_status(&workspace.id, WorkspaceStatus::Cloning).await;
                self.clone_repository(&workspace, repository, request, cancel).await?;
            }
            None => {
                debug!(validation_id = %id, "request carries no repository; clone skipped");
            }
        }
        self.set_phase(id, ValidationPhase::RepositoryCloned).await;
        ensure_live(cancel)?;

        if self.config.sandbox_enabled {
            let sandbox = self.sandboxes.create(&workspace).await?;
            *sandbox_slot = Some(sandbox);
            self.set_phase(id, ValidationPhase::SandboxReady).await;
            ensure_live(cancel)?;
        }

        self.set_phase(id, ValidationPhase::Validating).await;
        self.workspaces.set_status(&workspace.id, WorkspaceStatus::Validating).await;

        let tool = CommandSpec::new(&self.config.tool_program)
            .args(self.config.tool_args.iter().cloned())
            .current_dir(&workspace.path)
            .timeout(self.config.validation_timeout)
            .kill_grace(self.config.kill_grace);
        let output = run_with_retries(&tool, cancel, self.config.max_retries).await?;

        self.set_phase(id, ValidationPhase::Reporting).await;
        let report = build_report(id, &output.stdout, &output.stderr, output.duration);

        self.set_phase(id, ValidationPhase::Finished).await;
        info!(validation_id = %id, duration_ms = output.duration.as_millis() as u64,
            "validation finished");
        Ok(report)
    }

    /// Shallow single-branch clone into `src/repo`, then a dependency
    /// install when a manifest is present — all under the git budget.
    async fn clone_repository(
        &self,
        workspace: &Workspace,
        repository: &str,
        request: &Value,
        cancel: &CancellationToken,
    ) -> Result<(), ValidationError> {
        let url = if repository.contains("://") || repository.starts_with("git@") {
            repository.to_string()
        } else {
            format!("{}/{repository}.git", self.config.repo_base_url.trim_end_matches('/'))
        };
        let target = workspace.path.join("src").join("repo");

        let mut args = vec![
            "clone".to_string(),
            "--depth".to_string(),
            self.config.clone_depth.to_string(),
            "--single-branch".to_string(),
        ];
        if let Some(branch) = request.get("branch").and_then(Value::as_str) {
            args.push("--branch".to_string());
            args.push(branch.to_string());
        }
        args.push(url);
        args.push(target.display().to_string());

        let clone = CommandSpec::new("git")
            .args(args)
            .timeout(self.config.git_timeout)
            .kill_grace(self.config.kill_grace);
        run_with_retries(&clone, cancel, self.config.max_retries).await?;

        if target.join("package.json").is_file() {
            debug!(workspace_id = %workspace.id, "manifest found; installing dependencies");
            let install = CommandSpec::new("npm")
                .args(["install", "--no-audit", "--no-fund"])
                .current_dir(&target)
                .timeout(self.config.git_timeout)
                .kill_grace(self.config.kill_grace);
            run_with_retries(&install, cancel, self.config.max_retries).await?;
        }
        Ok(())
    }

    async fn set_phase(&self, id: &str, phase: ValidationPhase) {
        if let Some(entry) = self.active.write().await.get_mut(id) {
            entry.phase = phase;
        }
    }

    async fn record_outcome(&self, outcome: &Result<Value, ValidationError>, elapsed: Duration) {
        let mut metrics = self.metrics.lock().await;
        metrics.total += 1;
        match outcome {
            Ok(_) => metrics.successful += 1,
            // Cancellation is not a failure for metrics purposes.
            Err(ValidationError::Cancelled) => {}
            Err(_) => metrics.failed += 1,
        }
        let n = metrics.total as f64;
        let d = elapsed.as_millis() as f64;
        metrics.mean_duration_ms += (d - metrics.mean_duration_ms) / n;
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), ValidationError> {
    if cancel.is_cancelled() {
        Err(ValidationError::Cancelled)
    } else {
        Ok(())
    }
}

/// `val_<unix_millis>_<8 hex chars>`.
fn new_validation_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix: u32 = rand::thread_rng().gen();
    format!("val_{millis}_{suffix:08x}")
}

/// Structured result: the tool's JSON output when it emits one, raw tails
/// otherwise.
fn build_report(id: &str, stdout: &str, stderr: &str, duration: Duration) -> Value {
    let analysis: Option<Value> = serde_json::from_str(stdout.trim()).ok();
    json!({
        "validation_id": id,
        "success": true,
        "duration_ms": duration.as_millis() as u64,
        "analysis": analysis,
        "stdout_tail": tail(stdout, 1024),
        "stderr_tail": tail(stderr, 1024),
    })
}

fn tail(s: &str, max: usize) -> &str {
    let mut start = s.len().saturating_sub(max);
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceConfig;

    fn test_executor(base: &std::path::Path, config: ExecutorConfig) -> Arc<ValidationExecutor> {
        let workspaces = Arc::new(WorkspaceManager::new(WorkspaceConfig {
            base_dir: base.to_path_buf(),
            ..Default::default()
        }));
        ValidationExecutor::new(config, workspaces)
    }

    fn sh_tool(script: &str) -> ExecutorConfig {
        ExecutorConfig {
            tool_program: "sh".into(),
            tool_args: vec!["-c".into(), script.into()],
            kill_grace: Duration::from_millis(100),
            max_retries: 0,
            ..Default::default()
        }
    }

    async fn workspace_dirs(base: &std::path::Path) -> usize {
        let mut count = 0;
        let mut entries = tokio::fs::read_dir(base).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if entry.file_name().to_string_lossy().starts_with("ws_") {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn successful_run_produces_report_and_cleans_up() {
        let base = tempfile::tempdir().unwrap();
        let executor =
            test_executor(base.path(), sh_tool(r#"echo '{"findings": 0, "score": 1.0}'"#));

        let report = executor
            .execute(json!({ "kind": "local" }), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report["success"], true);
        assert_eq!(report["analysis"]["findings"], 0);
        assert!(report["validation_id"].as_str().unwrap().starts_with("val_"));

        assert_eq!(executor.active_count().await, 0);
        assert_eq!(workspace_dirs(base.path()).await, 0);

        let metrics = executor.metrics().await;
        assert_eq!(metrics.total, 1);
        assert_eq!(metrics.successful, 1);
        assert_eq!(metrics.failed, 0);
        assert!(metrics.peak_concurrent >= 1);
    }

    #[tokio::test]
    async fn failing_tool_fails_the_validation_but_still_cleans_up() {
        let base = tempfile::tempdir().unwrap();
        let executor = test_executor(base.path(), sh_tool("echo nope >&2; exit 2"));

        let err = executor
            .execute(json!({}), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::CommandFailed { .. }));

        assert_eq!(executor.active_count().await, 0);
        assert_eq!(workspace_dirs(base.path()).await, 0);
        assert_eq!(executor.metrics().await.failed, 1);
    }

    #[tokio::test]
    async fn concurrency_gate_rejects_excess_validations() {
        let base = tempfile::tempdir().unwrap();
        let mut config = sh_tool("sleep 5");
        config.max_concurrent_validations = 1;
        let executor = test_executor(base.path(), config);

        let slow = executor.clone();
        let cancel = CancellationToken::new();
        let slow_cancel = cancel.clone();
        let slow_task =
            tokio::spawn(async move { slow.execute(json!({}), slow_cancel).await });

        // Let the first validation occupy the gate.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(executor.active_count().await, 1);

        let err = executor
            .execute(json!({}), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::LimitExceeded { active: 1, limit: 1 }));

        // While occupied, the in-flight record is observable in its phase.
        let ids = executor.active_ids().await;
        assert_eq!(ids.len(), 1);

        cancel.cancel();
        let _ = slow_task.await.unwrap();
        assert_eq!(executor.active_count().await, 0);
    }

    #[tokio::test]
    async fn cancel_interrupts_validation_and_removes_workspace() {
        let base = tempfile::tempdir().unwrap();
        let executor = test_executor(base.path(), sh_tool("sleep 60"));

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = executor.execute(json!({}), cancel).await.unwrap_err();

        assert!(matches!(err, ValidationError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(6));
        assert_eq!(executor.active_count().await, 0);
        assert_eq!(workspace_dirs(base.path()).await, 0);

        // Cancelled runs count toward total but not failures.
        let metrics = executor.metrics().await;
        assert_eq!(metrics.total, 1);
        assert_eq!(metrics.failed, 0);
        assert_eq!(metrics.successful, 0);
    }

    #[tokio::test]
    async fn already_cancelled_request_never_creates_a_workspace() {
        let base = tempfile::tempdir().unwrap();
        let executor = test_executor(base.path(), sh_tool("echo unused"));

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = executor.execute(json!({}), cancel).await.unwrap_err();
        assert!(matches!(err, ValidationError::Cancelled));
        assert_eq!(workspace_dirs(base.path()).await, 0);
    }

    #[tokio::test]
    async fn sandbox_phase_is_exercised_when_enabled() {
        let base = tempfile::tempdir().unwrap();
        let mut config = sh_tool("echo '{}'");
        config.sandbox_enabled = true;
        let executor = test_executor(base.path(), config);

        let report = executor
            .execute(json!({}), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report["success"], true);
        assert_eq!(workspace_dirs(base.path()).await, 0);
    }
}
