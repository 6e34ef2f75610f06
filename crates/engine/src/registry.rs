//! The workflow engine: kind registry, active-workflow table, archival.
//!
//! `WorkflowEngine` is the central orchestrator:
//! 1. Holds the `kind → constructor` registry (capability-checked at
//!    registration).
//! 2. Creates workflows against a concurrency cap and tracks them in
//!    `active` until a grace period after they finish.
//! 3. Archives every finished workflow into a bounded history.
//! 4. Reacts to `system.shutdown` (cancel all) and `system.maintenance`
//!    (pause all) bus events.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use bus::{EventBus, SubscribeOpts};

use crate::error::EngineError;
use crate::kinds::WorkflowKind;
use crate::workflow::{Workflow, WorkflowStatus};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Reject `create` beyond this many active workflows.  Default 100.
    pub max_concurrent_workflows: usize,
    /// How long a finished workflow stays visible in `active`.  Default 60 s.
    pub archive_grace: Duration,
    /// Bounded archival history size.  Default 500.
    pub history_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 100,
            archive_grace: Duration::from_secs(60),
            history_capacity: 500,
        }
    }
}

// ---------------------------------------------------------------------------
// Archival
// ---------------------------------------------------------------------------

/// What survives of a workflow after it leaves `active`.  Carries the error
/// message, never a backtrace.
#[derive(Debug, Clone, Serialize)]
pub struct ArchivedWorkflow {
    pub id: String,
    pub kind: String,
    pub status: WorkflowStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub archived_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

pub struct WorkflowEngine {
    registry: RwLock<HashMap<String, Arc<dyn WorkflowKind>>>,
    active: Arc<RwLock<HashMap<String, Arc<Workflow>>>>,
    history: RwLock<VecDeque<ArchivedWorkflow>>,
    bus: EventBus,
    config: EngineConfig,
}

impl WorkflowEngine {
    /// Build the engine and install its system-event listeners.
    pub fn new(bus: EventBus, config: EngineConfig) -> Arc<Self> {
        let engine = Arc::new(Self {
            registry: RwLock::new(HashMap::new()),
            active: Arc::new(RwLock::new(HashMap::new())),
            history: RwLock::new(VecDeque::new()),
            bus,
            config,
        });
        engine.install_system_listeners();
        engine
    }

    /// Register a workflow kind.  The capability check requires a non-empty
    /// deterministic step list.
    pub async fn register(&self, kind: Arc<dyn WorkflowKind>) -> Result<(), EngineError> {
        let name = kind.kind().to_string();
        if kind.steps().is_empty() {
            return Err(EngineError::Registration {
                kind: name,
                message: "kind declares no steps".into(),
            });
        }
        self.registry.write().await.insert(name.clone(), kind);
        debug!(kind = %name, "workflow kind registered");
        Ok(())
    }

    /// Create a workflow instance for `kind` with the given frozen context.
    #[instrument(skip(self, context))]
    pub async fn create(&self, kind: &str, context: Value) -> Result<Arc<Workflow>, EngineError> {
        let constructor = self
            .registry
            .read()
            .await
            .get(kind)
            .cloned()
            .ok_or_else(|| EngineError::UnknownKind(kind.to_string()))?;

        constructor.validate_context(&context)?;

        let mut active = self.active.write().await;
        if active.len() >= self.config.max_concurrent_workflows {
            return Err(EngineError::Overloaded {
                active: active.len(),
                limit: self.config.max_concurrent_workflows,
            });
        }

        let id = new_workflow_id();
        let workflow = Arc::new(Workflow::new(id.clone(), constructor, context, self.bus.clone()));
        active.insert(id.clone(), workflow.clone());
        drop(active);

        self.bus
            .publish("workflow.created", json!({ "workflow_id": id, "kind": kind }), false)
            .await;
        info!(workflow_id = %id, kind, "workflow created");
        Ok(workflow)
    }

    /// Execute an active workflow to completion, then archive it and
    /// schedule its removal from `active` after the grace period.
    #[instrument(skip(self))]
    pub async fn execute(&self, id: &str) -> Result<Value, EngineError> {
        let workflow = self.get(id).await.ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        let result = workflow.execute().await;

        // The `finally` of execution: archival plus deferred removal,
        // regardless of how the run ended.
        self.archive_if_terminal(&workflow).await;
        self.schedule_removal(id.to_string());

        result
    }

    /// Cancel one workflow.  Archival happens immediately when nothing is
    /// executing it (the running task otherwise archives through `execute`).
    pub async fn cancel(&self, id: &str, reason: &str) -> Result<(), EngineError> {
        let workflow = self.get(id).await.ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        workflow.cancel(reason).await?;
        self.archive_if_terminal(&workflow).await;
        self.schedule_removal(id.to_string());
        Ok(())
    }

    /// Cancel every active workflow (e.g. on `system.shutdown`).
    pub async fn cancel_all(&self, reason: &str) {
        let workflows: Vec<Arc<Workflow>> =
            self.active.read().await.values().cloned().collect();
        for workflow in workflows {
            if let Err(err) = workflow.cancel(reason).await {
                // Already terminal; nothing to do.
                debug!(workflow_id = %workflow.id, %err, "cancel_all skipped workflow");
            } else {
                self.archive_if_terminal(&workflow).await;
                self.schedule_removal(workflow.id.clone());
            }
        }
    }

    /// Pause every running workflow (e.g. on `system.maintenance`).
    pub async fn pause_all(&self) {
        let workflows: Vec<Arc<Workflow>> =
            self.active.read().await.values().cloned().collect();
        for workflow in workflows {
            if let Err(err) = workflow.pause().await {
                debug!(workflow_id = %workflow.id, %err, "pause_all skipped workflow");
            }
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Workflow>> {
        self.active.read().await.get(id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Most recent archived workflows, newest first.
    pub async fn archived(&self, limit: usize) -> Vec<ArchivedWorkflow> {
        let history = self.history.read().await;
        history.iter().rev().take(limit).cloned().collect()
    }

    async fn archive_if_terminal(&self, workflow: &Arc<Workflow>) {
        let snapshot = workflow.snapshot().await;
        if !snapshot.status.is_terminal() {
            return;
        }

        let mut history = self.history.write().await;
        if history.iter().any(|a| a.id == snapshot.id) {
            return;
        }
        if history.len() >= self.config.history_capacity {
            history.pop_front();
        }
        history.push_back(ArchivedWorkflow {
            id: snapshot.id,
            kind: snapshot.kind,
            status: snapshot.status,
            result: snapshot.result,
            error: snapshot.error,
            created_at: snapshot.created_at,
            started_at: snapshot.started_at,
            completed_at: snapshot.completed_at,
            failed_at: snapshot.failed_at,
            cancelled_at: snapshot.cancelled_at,
            archived_at: Utc::now(),
        });
    }

    fn schedule_removal(&self, id: String) {
        let active = self.active.clone();
        let grace = self.config.archive_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if active.write().await.remove(&id).is_some() {
                debug!(workflow_id = %id, "workflow removed from active set");
            }
        });
    }

    fn install_system_listeners(self: &Arc<Self>) {
        let bus = self.bus.clone();
        let weak: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let shutdown_weak = weak.clone();
            let subscribed = bus
                .subscribe("system.shutdown", SubscribeOpts::default(), move |_| {
                    let weak = shutdown_weak.clone();
                    async move {
                        if let Some(engine) = weak.upgrade() {
                            engine.cancel_all("system_shutdown").await;
                        }
                        Ok(())
                    }
                })
                .await;
            if subscribed.is_err() {
                warn!("failed to install system.shutdown listener");
            }

            let maintenance_weak = weak.clone();
            let subscribed = bus
                .subscribe("system.maintenance", SubscribeOpts::default(), move |_| {
                    let weak = maintenance_weak.clone();
                    async move {
                        if let Some(engine) = weak.upgrade() {
                            engine.pause_all().await;
                        }
                        Ok(())
                    }
                })
                .await;
            if subscribed.is_err() {
                warn!("failed to install system.maintenance listener");
            }
        });
    }
}

/// `wf_<unix_millis>_<8 hex chars>`.
fn new_workflow_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix: u32 = rand::thread_rng().gen();
    format!("wf_{millis}_{suffix:08x}")
}
