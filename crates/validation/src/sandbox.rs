//! Optional sandbox layer around a workspace.
//!
//! The sandbox is an additional isolation scope the external tool runs in;
//! here it is a dedicated directory with a marker file so orphans can be
//! recognized and swept.  Heavier isolation (containers, namespaces) slots
//! in behind the same surface.

use std::path::{Path, PathBuf};

use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ValidationError;
use crate::workspace::Workspace;

const SANDBOX_PREFIX: &str = "sandbox_";
const MARKER_FILE: &str = ".sandbox-owner";

#[derive(Debug, Clone, Serialize)]
pub struct Sandbox {
    pub id: String,
    pub path: PathBuf,
    pub workspace_id: String,
}

pub struct SandboxManager;

impl Default for SandboxManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxManager {
    pub fn new() -> Self {
        Self
    }

    /// Create a sandbox scope inside the workspace's temp directory.
    pub async fn create(&self, workspace: &Workspace) -> Result<Sandbox, ValidationError> {
        let suffix: u32 = rand::thread_rng().gen();
        let id = format!("{SANDBOX_PREFIX}{suffix:08x}");
        let path = workspace.path.join("temp").join(&id);

        tokio::fs::create_dir_all(&path).await?;
        tokio::fs::write(path.join(MARKER_FILE), workspace.validation_id.as_bytes()).await?;

        debug!(sandbox_id = %id, workspace_id = %workspace.id, "sandbox created");
        Ok(Sandbox { id, path, workspace_id: workspace.id.clone() })
    }

    /// Tear the sandbox down; errors are logged, never propagated.
    pub async fn cleanup(&self, sandbox: &Sandbox) {
        if let Err(err) = tokio::fs::remove_dir_all(&sandbox.path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(sandbox_id = %sandbox.id, %err, "sandbox cleanup failed");
            }
        }
    }

    /// Sweep sandbox directories whose owning workspace is gone.  Walks one
    /// level under `base_dir/*/temp`.
    pub async fn sweep_orphans(&self, base_dir: &Path) -> usize {
        let mut removed = 0usize;
        let Ok(mut workspaces) = tokio::fs::read_dir(base_dir).await else { return 0 };

        while let Ok(Some(ws_entry)) = workspaces.next_entry().await {
            let temp = ws_entry.path().join("temp");
            let Ok(mut candidates) = tokio::fs::read_dir(&temp).await else { continue };
            while let Ok(Some(candidate)) = candidates.next_entry().await {
                let name = candidate.file_name();
                let Some(name) = name.to_str() else { continue };
                if !name.starts_with(SANDBOX_PREFIX) {
                    continue;
                }
                // A sandbox without its marker file was abandoned mid-setup.
                if !candidate.path().join(MARKER_FILE).is_file()
                    && tokio::fs::remove_dir_all(candidate.path()).await.is_ok()
                {
                    removed += 1;
                }
            }
        }
        removed
    }
}
