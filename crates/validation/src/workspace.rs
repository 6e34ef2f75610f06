//! Workspace manager — per-validation filesystem scopes.
//!
//! Every validation gets an exclusive directory under the configured base,
//! pre-populated with the standard subdirectories and a metadata file.
//! Cleanup never throws: a failed removal marks the workspace
//! `CleanupFailed` and the enclosing validation proceeds.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::ValidationError;

/// Subdirectories created inside every workspace.
const WORKSPACE_SUBDIRS: [&str; 5] = ["src", "tests", "logs", "reports", "temp"];

const METADATA_FILE: &str = ".workspace-metadata.json";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Parent directory for all workspaces.
    pub base_dir: PathBuf,
    /// Workspaces older than this are swept by `cleanup_old`.  Default 1 h.
    pub max_age: Duration,
    /// Total on-disk budget across workspaces.  Default 10 GiB.
    pub max_total_bytes: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("conveyor-workspaces"),
            max_age: Duration::from_secs(60 * 60),
            max_total_bytes: 10 * 1024 * 1024 * 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Created,
    Cloning,
    Validating,
    Cleaning,
    CleanupFailed,
}

/// An ephemeral filesystem scope, exclusively owned by one validation.
#[derive(Debug, Clone, Serialize)]
pub struct Workspace {
    pub id: String,
    pub path: PathBuf,
    pub parent_path: PathBuf,
    pub validation_id: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub status: WorkspaceStatus,
}

/// Result of a quota check.
#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub total_bytes: u64,
    pub max_total_bytes: u64,
    pub quota_exceeded: bool,
}

// ---------------------------------------------------------------------------
// WorkspaceManager
// ---------------------------------------------------------------------------

pub struct WorkspaceManager {
    config: WorkspaceConfig,
    active: RwLock<HashMap<String, Workspace>>,
}

impl WorkspaceManager {
    pub fn new(config: WorkspaceConfig) -> Self {
        Self { config, active: RwLock::new(HashMap::new()) }
    }

    pub fn base_dir(&self) -> &Path {
        &self.config.base_dir
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Create an isolated workspace for `validation_id`.
    pub async fn create(
        &self,
        request: &serde_json::Value,
        validation_id: &str,
    ) -> Result<Workspace, ValidationError> {
        let id = new_workspace_id(validation_id);
        let path = self.config.base_dir.join(&id);

        tokio::fs::create_dir_all(&path).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
        }

        for subdir in WORKSPACE_SUBDIRS {
            tokio::fs::create_dir_all(path.join(subdir)).await?;
        }

        let created_at = Utc::now();
        let metadata = json!({
            "workspace_id": id,
            "validation_id": validation_id,
            "request_ref": request.get("repository").cloned().unwrap_or(serde_json::Value::Null),
            "created_at": created_at,
            "config": {
                "max_age_ms": self.config.max_age.as_millis() as u64,
                "max_total_bytes": self.config.max_total_bytes,
            },
        });
        tokio::fs::write(path.join(METADATA_FILE), serde_json::to_vec_pretty(&metadata).unwrap())
            .await?;

        let workspace = Workspace {
            id: id.clone(),
            path: path.clone(),
            parent_path: self.config.base_dir.clone(),
            validation_id: validation_id.to_string(),
            size_bytes: 0,
            created_at,
            status: WorkspaceStatus::Created,
        };
        self.active.write().await.insert(id.clone(), workspace.clone());

        info!(workspace_id = %id, path = %path.display(), "workspace created");
        Ok(workspace)
    }

    /// Update the tracked status of an active workspace.
    pub async fn set_status(&self, id: &str, status: WorkspaceStatus) {
        if let Some(ws) = self.active.write().await.get_mut(id) {
            ws.status = status;
        }
    }

    /// Remove the workspace directory and deregister it.  Never fails the
    /// caller: a removal error marks the workspace `CleanupFailed`.
    pub async fn cleanup(&self, workspace: &Workspace) {
        self.set_status(&workspace.id, WorkspaceStatus::Cleaning).await;

        let removed = match tokio::fs::remove_dir_all(&workspace.path).await {
            Ok(()) => true,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
            Err(err) => {
                debug!(workspace_id = %workspace.id, %err, "native removal failed; trying rm -rf");
                shell_remove(&workspace.path).await
            }
        };

        if removed {
            self.active.write().await.remove(&workspace.id);
            debug!(workspace_id = %workspace.id, "workspace cleaned up");
        } else {
            self.set_status(&workspace.id, WorkspaceStatus::CleanupFailed).await;
            self.active.write().await.remove(&workspace.id);
            warn!(workspace_id = %workspace.id, path = %workspace.path.display(),
                "workspace cleanup failed; left on disk for the janitor");
        }
    }

    /// Sweep base-directory entries whose mtime exceeds `max_age`.
    /// Returns how many entries were removed.
    pub async fn cleanup_old(&self) -> Result<usize, ValidationError> {
        let mut removed = 0usize;
        let mut entries = match tokio::fs::read_dir(&self.config.base_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let cutoff = SystemTime::now() - self.config.max_age;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(mtime) => mtime,
                Err(_) => continue,
            };
            if modified >= cutoff {
                continue;
            }
            if tokio::fs::remove_dir_all(&path).await.is_ok() {
                removed += 1;
                debug!(path = %path.display(), "aged workspace removed");
            }
        }

        if removed > 0 {
            info!(removed, "workspace age sweep complete");
        }
        Ok(removed)
    }

    /// Sum on-disk usage under the base directory against the quota.
    pub async fn check_usage(&self) -> Result<UsageReport, ValidationError> {
        let total_bytes = dir_size(&self.config.base_dir).await?;
        Ok(UsageReport {
            total_bytes,
            max_total_bytes: self.config.max_total_bytes,
            quota_exceeded: total_bytes > self.config.max_total_bytes,
        })
    }
}

/// `ws_<validation_id>_<unix_millis>_<8 hex chars>`.
fn new_workspace_id(validation_id: &str) -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix: u32 = rand::thread_rng().gen();
    format!("ws_{validation_id}_{millis}_{suffix:08x}")
}

/// `rm -rf` fallback for trees the native removal cannot handle
/// (e.g. permission oddities left by a tool).  Returns success.
async fn shell_remove(path: &Path) -> bool {
    match tokio::process::Command::new("rm").arg("-rf").arg(path).status().await {
        Ok(status) if status.success() => true,
        Ok(status) => {
            warn!(path = %path.display(), code = ?status.code(), "rm -rf exited non-zero");
            false
        }
        Err(err) => {
            warn!(path = %path.display(), %err, "failed to spawn rm -rf");
            false
        }
    }
}

/// Iterative recursive directory size; missing paths count as zero.
async fn dir_size(root: &Path) -> Result<u64, ValidationError> {
    let mut total = 0u64;
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager_in(dir: &Path) -> WorkspaceManager {
        WorkspaceManager::new(WorkspaceConfig {
            base_dir: dir.to_path_buf(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn create_builds_the_standard_layout() {
        let base = tempfile::tempdir().unwrap();
        let manager = manager_in(base.path());

        let ws = manager
            .create(&json!({ "repository": "org/repo" }), "val_1")
            .await
            .unwrap();

        assert!(ws.id.starts_with("ws_val_1_"));
        assert!(ws.path.is_dir());
        for subdir in WORKSPACE_SUBDIRS {
            assert!(ws.path.join(subdir).is_dir(), "missing {subdir}");
        }

        let metadata: serde_json::Value = serde_json::from_slice(
            &tokio::fs::read(ws.path.join(METADATA_FILE)).await.unwrap(),
        )
        .unwrap();
        assert_eq!(metadata["validation_id"], "val_1");
        assert_eq!(metadata["request_ref"], "org/repo");
        assert_eq!(manager.active_count().await, 1);
    }

    #[tokio::test]
    async fn cleanup_removes_directory_and_deregisters() {
        let base = tempfile::tempdir().unwrap();
        let manager = manager_in(base.path());

        let ws = manager.create(&json!({}), "val_2").await.unwrap();
        tokio::fs::write(ws.path.join("src/file.txt"), b"contents").await.unwrap();

        manager.cleanup(&ws).await;
        assert!(!ws.path.exists());
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn cleanup_of_already_missing_directory_is_quiet() {
        let base = tempfile::tempdir().unwrap();
        let manager = manager_in(base.path());

        let ws = manager.create(&json!({}), "val_3").await.unwrap();
        tokio::fs::remove_dir_all(&ws.path).await.unwrap();

        manager.cleanup(&ws).await;
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn cleanup_old_sweeps_aged_entries() {
        let base = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(WorkspaceConfig {
            base_dir: base.path().to_path_buf(),
            max_age: Duration::ZERO,
            ..Default::default()
        });

        manager.create(&json!({}), "val_old").await.unwrap();
        // With a zero max-age everything qualifies immediately.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let removed = manager.cleanup_old().await.unwrap();
        assert_eq!(removed, 1);
        let mut entries = tokio::fs::read_dir(base.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cleanup_old_on_missing_base_dir_is_zero() {
        let manager = manager_in(Path::new("/nonexistent/conveyor-test-base"));
        assert_eq!(manager.cleanup_old().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn usage_report_flags_quota_excess() {
        let base = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(WorkspaceConfig {
            base_dir: base.path().to_path_buf(),
            max_total_bytes: 16,
            ..Default::default()
        });

        let ws = manager.create(&json!({}), "val_fat").await.unwrap();
        tokio::fs::write(ws.path.join("src/big.bin"), vec![0u8; 1024]).await.unwrap();

        let report = manager.check_usage().await.unwrap();
        assert!(report.total_bytes >= 1024);
        assert!(report.quota_exceeded);
    }
}
