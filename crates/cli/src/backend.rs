//! Capability adapter: the engine's `ValidationBackend` handle backed by
//! the real validation executor.
//!
//! Lives here so neither the engine nor the validation crate knows about
//! the other; the binary wires the two together.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use engine::{StepError, ValidationBackend};
use validation::{ValidationError, ValidationExecutor};

pub struct ExecutorBackend {
    executor: Arc<ValidationExecutor>,
}

impl ExecutorBackend {
    pub fn new(executor: Arc<ValidationExecutor>) -> Arc<Self> {
        Arc::new(Self { executor })
    }
}

#[async_trait]
impl ValidationBackend for ExecutorBackend {
    async fn run_validation(
        &self,
        request: Value,
        cancel: CancellationToken,
    ) -> Result<Value, StepError> {
        match self.executor.execute(request, cancel).await {
            Ok(report) => Ok(report),
            // A failing tool run is a failing check, not a broken step.
            Err(ValidationError::CommandFailed { command, code, stderr }) => Ok(json!({
                "success": false,
                "command": command,
                "exit_code": code,
                "stderr_tail": stderr,
            })),
            Err(ValidationError::Timeout(budget)) => {
                Err(StepError::timeout(format!("validation tool exceeded {budget:?}")))
            }
            Err(ValidationError::LimitExceeded { active, limit }) => Err(StepError::transport(
                format!("validation executor at capacity ({active}/{limit})"),
            )),
            Err(ValidationError::Cancelled) => {
                Err(StepError::process_killed("validation cancelled"))
            }
            Err(other) => Err(StepError::internal(other.to_string())),
        }
    }
}
