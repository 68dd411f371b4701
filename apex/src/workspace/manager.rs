//! Workspace creation and cleanup for the four isolation strategies.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::domain::{ContainerDescriptor, WorkspaceDescriptor, WorkspaceStrategy};

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("failed to create worktree: {0}")]
    CreateFailed(String),
    #[error("failed to remove worktree: {0}")]
    RemoveFailed(String),
    #[error("git command failed: {0}")]
    GitError(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    #[serde(rename = "cleanup-delay-ms")]
    pub cleanup_delay_ms: u64,
    #[serde(rename = "prune-stale-after-days")]
    pub prune_stale_after_days: u32,
    #[serde(rename = "preserve-on-failure")]
    pub preserve_on_failure: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            cleanup_delay_ms: 60_000,
            prune_stale_after_days: 7,
            preserve_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContainerDefaults {
    pub image: Option<String>,
    pub resource_limits: Option<String>,
    pub environment: Vec<(String, String)>,
    pub network_mode: Option<String>,
    pub auto_remove: bool,
    pub install_timeout_ms: u64,
}

/// Owns the deterministic worktree path scheme and the best-effort
/// create/cleanup operations for every isolation strategy.
pub struct WorkspaceManager {
    config: WorkspaceConfig,
    project_path: PathBuf,
}

impl WorkspaceManager {
    pub fn new(config: WorkspaceConfig, project_path: impl Into<PathBuf>) -> Self {
        Self { config, project_path: project_path.into() }
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    /// `<projectParent>/.apex-worktrees/<taskId>` — always outside
    /// `projectPath` so worktrees can never self-nest.
    pub fn worktree_path(&self, task_id: &str) -> PathBuf {
        let parent = self.project_path.parent().unwrap_or(&self.project_path);
        parent.join(".apex-worktrees").join(task_id)
    }

    pub async fn create_workspace(
        &self,
        task_id: &str,
        strategy: WorkspaceStrategy,
        branch_name: &str,
        container_defaults: Option<ContainerDefaults>,
    ) -> WorkspaceDescriptor {
        match strategy {
            WorkspaceStrategy::None => WorkspaceDescriptor::none(),
            WorkspaceStrategy::Worktree => match self.create_worktree(task_id, branch_name).await {
                Ok(path) => WorkspaceDescriptor {
                    strategy: WorkspaceStrategy::Worktree,
                    path: Some(path.to_string_lossy().to_string()),
                    cleanup: true,
                    container: None,
                },
                Err(e) => {
                    warn!(task_id, error = %e, "worktree creation failed, falling back to none");
                    WorkspaceDescriptor::none()
                }
            },
            WorkspaceStrategy::Container => {
                let defaults = container_defaults.unwrap_or_default();
                let image = defaults.image.unwrap_or_else(|| "ubuntu:24.04".to_string());
                WorkspaceDescriptor {
                    strategy: WorkspaceStrategy::Container,
                    path: None,
                    cleanup: defaults.auto_remove,
                    container: Some(ContainerDescriptor { image, container_id: None }),
                }
            }
            WorkspaceStrategy::Directory => match self.create_directory_copy(task_id).await {
                Ok(path) => WorkspaceDescriptor {
                    strategy: WorkspaceStrategy::Directory,
                    path: Some(path.to_string_lossy().to_string()),
                    cleanup: true,
                    container: None,
                },
                Err(e) => {
                    warn!(task_id, error = %e, "directory workspace creation failed, falling back to none");
                    WorkspaceDescriptor::none()
                }
            },
        }
    }

    async fn create_worktree(&self, task_id: &str, branch_name: &str) -> Result<PathBuf, WorkspaceError> {
        let worktree_path = self.worktree_path(task_id);
        if let Some(parent) = worktree_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorkspaceError::CreateFailed(e.to_string()))?;
        }

        let branch_exists = Command::new("git")
            .args(["rev-parse", "--verify", branch_name])
            .current_dir(&self.project_path)
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);

        let mut args = vec!["worktree".to_string(), "add".to_string(), worktree_path.to_string_lossy().to_string()];
        if branch_exists {
            args.push(branch_name.to_string());
        } else {
            args.push("-b".to_string());
            args.push(branch_name.to_string());
            args.push("HEAD".to_string());
        }

        let output = Command::new("git")
            .args(&args)
            .current_dir(&self.project_path)
            .output()
            .await
            .map_err(|e| WorkspaceError::GitError(e.to_string()))?;

        if !output.status.success() {
            return Err(WorkspaceError::CreateFailed(String::from_utf8_lossy(&output.stderr).to_string()));
        }

        info!(task_id, path = %worktree_path.display(), branch_name, "worktree created");
        Ok(worktree_path)
    }

    async fn create_directory_copy(&self, task_id: &str) -> Result<PathBuf, WorkspaceError> {
        let dest = self.worktree_path(task_id);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorkspaceError::CreateFailed(e.to_string()))?;
        }
        copy_dir_recursive(&self.project_path, &dest)
            .await
            .map_err(|e| WorkspaceError::CreateFailed(e.to_string()))?;
        Ok(dest)
    }

    /// Schedules (or immediately performs, when `delay_ms == 0`) removal
    /// of `workspace`. Failures are logged, never propagated — cleanup is
    /// always best-effort from the caller's point of view.
    pub async fn cleanup_workspace(&self, task_id: &str, workspace: &WorkspaceDescriptor, delay_ms: u64) {
        if !workspace.cleanup {
            return;
        }
        let task_id = task_id.to_string();
        let workspace = workspace.clone();
        let project_path = self.project_path.clone();

        if delay_ms == 0 {
            Self::remove_workspace(&task_id, &workspace, &project_path).await;
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Self::remove_workspace(&task_id, &workspace, &project_path).await;
            });
        }
    }

    async fn remove_workspace(task_id: &str, workspace: &WorkspaceDescriptor, project_path: &Path) {
        let Some(path) = workspace.path.as_ref() else { return };
        match workspace.strategy {
            WorkspaceStrategy::Worktree => {
                let output = Command::new("git")
                    .args(["worktree", "remove", path, "--force"])
                    .current_dir(project_path)
                    .output()
                    .await;
                match output {
                    Ok(o) if o.status.success() => info!(task_id, path, "worktree removed"),
                    Ok(o) => {
                        let stderr = String::from_utf8_lossy(&o.stderr);
                        if !stderr.contains("is not a working tree") {
                            warn!(task_id, path, error = %stderr, "worktree removal failed");
                        }
                    }
                    Err(e) => warn!(task_id, path, error = %e, "worktree removal command failed"),
                }
            }
            WorkspaceStrategy::Directory => {
                if let Err(e) = tokio::fs::remove_dir_all(path).await {
                    warn!(task_id, path, error = %e, "directory workspace removal failed");
                } else {
                    info!(task_id, path, "directory workspace removed");
                }
            }
            WorkspaceStrategy::None | WorkspaceStrategy::Container => {}
        }
    }

    /// Checks the task's PR URL via `gh pr view --json state`; removes the
    /// worktree and returns `true` only when the PR is reported merged.
    /// Never throws: an absent CLI or malformed URL yields `false` with a
    /// warning log.
    pub async fn cleanup_merged_worktree(&self, task_id: &str, workspace: &WorkspaceDescriptor, pr_url: &str) -> bool {
        if pr_url.trim().is_empty() {
            debug!(task_id, "no pr url set, skipping merge-cleanup check");
            return false;
        }

        let output = Command::new("gh").args(["pr", "view", pr_url, "--json", "state"]).output().await;

        let state_json = match output {
            Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout).to_string(),
            Ok(o) => {
                warn!(task_id, pr_url, stderr = %String::from_utf8_lossy(&o.stderr), "gh pr view failed");
                return false;
            }
            Err(e) => {
                warn!(task_id, pr_url, error = %e, "gh CLI unavailable");
                return false;
            }
        };

        let merged = state_json.to_lowercase().contains("merged");
        if !merged {
            return false;
        }

        Self::remove_workspace(task_id, workspace, &self.project_path).await;
        info!(task_id, pr_url, "merged worktree cleaned up");
        true
    }

    /// Removes worktrees under `.apex-worktrees/` older than
    /// `pruneStaleAfterDays`.
    pub async fn cleanup_old_workspaces(&self) -> usize {
        let root = match self.project_path.parent() {
            Some(p) => p.join(".apex-worktrees"),
            None => return 0,
        };
        let Ok(mut entries) = tokio::fs::read_dir(&root).await else {
            return 0;
        };

        let max_age = Duration::from_secs(self.config.prune_stale_after_days as u64 * 86_400);
        let mut cleaned = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(metadata) = entry.metadata().await else { continue };
            let Ok(modified) = metadata.modified() else { continue };
            let Ok(age) = modified.elapsed() else { continue };
            if age > max_age {
                let output = Command::new("git")
                    .args(["worktree", "remove", &path.to_string_lossy(), "--force"])
                    .current_dir(&self.project_path)
                    .output()
                    .await;
                if matches!(output, Ok(o) if o.status.success()) {
                    cleaned += 1;
                }
            }
        }
        cleaned
    }

    /// Detects whether a container runtime (docker or podman) is
    /// available on `PATH`.
    pub async fn supports_container_workspaces(&self) -> bool {
        for runtime in ["docker", "podman"] {
            if Command::new(runtime).arg("version").output().await.map(|o| o.status.success()).unwrap_or(false) {
                return true;
            }
        }
        false
    }
}

fn copy_dir_recursive<'a>(
    src: &'a Path,
    dest: &'a Path,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + 'a>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(dest).await?;
        let mut entries = tokio::fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()) == Some(".git") {
                continue;
            }
            let target = dest.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                copy_dir_recursive(&path, &target).await?;
            } else {
                tokio::fs::copy(&path, &target).await?;
            }
        }
        Ok(())
    })
}
