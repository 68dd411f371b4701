//! Merging a completed task's branch back into the repository's default
//! branch.

use std::path::Path;

use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub squash: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MergeResult {
    pub success: bool,
    pub commit_hash: Option<String>,
    pub changed_files: Option<u32>,
    pub error: Option<String>,
}

/// Detects the default branch (`main` > `master` > current `HEAD`
/// symbolic ref), pulls best-effort, merges (standard or squash), and
/// never throws — all failures are reported inside the returned
/// `MergeResult`.
pub async fn merge_task_branch(
    project_path: &Path,
    branch_name: &str,
    options: &MergeOptions,
) -> MergeResult {
    let default_branch = detect_default_branch(project_path).await;

    let checkout = Command::new("git").args(["checkout", &default_branch]).current_dir(project_path).output().await;
    if let Err(e) = checkout_ok(checkout) {
        return MergeResult { success: false, error: Some(e), ..Default::default() };
    }

    let pull = Command::new("git").args(["pull", "--rebase"]).current_dir(project_path).output().await;
    if let Ok(output) = &pull {
        if !output.status.success() {
            warn!(branch_name, "pull failed before merge, continuing best-effort");
        }
    }

    let mut args = vec!["merge".to_string()];
    if options.squash {
        args.push("--squash".to_string());
    } else {
        args.push("--no-ff".to_string());
    }
    args.push(branch_name.to_string());
    if !options.squash {
        args.push("-m".to_string());
        args.push(format!("Merge {branch_name} into {default_branch}"));
    }

    let merge_output = match Command::new("git").args(&args).current_dir(project_path).output().await {
        Ok(o) => o,
        Err(e) => return MergeResult { success: false, error: Some(e.to_string()), ..Default::default() },
    };

    if !merge_output.status.success() {
        let stderr = String::from_utf8_lossy(&merge_output.stderr).to_string();
        warn!(branch_name, error = %stderr, "merge failed");
        return MergeResult { success: false, error: Some(stderr), ..Default::default() };
    }

    if options.squash {
        let commit = Command::new("git")
            .args(["commit", "-m", &format!("Merge {branch_name} (squash)")])
            .current_dir(project_path)
            .output()
            .await;
        if let Ok(o) = &commit {
            if !o.status.success() {
                let stderr = String::from_utf8_lossy(&o.stderr).to_string();
                // "nothing to commit" just means the squash merge added nothing new.
                if !stderr.contains("nothing to commit") {
                    return MergeResult { success: false, error: Some(stderr), ..Default::default() };
                }
            }
        }
    }

    let commit_hash = current_commit_hash(project_path).await;
    let changed_files = changed_file_count(project_path, branch_name).await;

    info!(branch_name, default_branch, "merge completed");
    MergeResult { success: true, commit_hash, changed_files, error: None }
}

fn checkout_ok(result: std::io::Result<std::process::Output>) -> Result<(), String> {
    match result {
        Ok(o) if o.status.success() => Ok(()),
        Ok(o) => Err(String::from_utf8_lossy(&o.stderr).to_string()),
        Err(e) => Err(e.to_string()),
    }
}

async fn detect_default_branch(project_path: &Path) -> String {
    for candidate in ["main", "master"] {
        let exists = Command::new("git")
            .args(["rev-parse", "--verify", candidate])
            .current_dir(project_path)
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);
        if exists {
            return candidate.to_string();
        }
    }

    Command::new("git")
        .args(["symbolic-ref", "--short", "HEAD"])
        .current_dir(project_path)
        .output()
        .await
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "HEAD".to_string())
}

async fn current_commit_hash(project_path: &Path) -> Option<String> {
    Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(project_path)
        .output()
        .await
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
}

async fn changed_file_count(project_path: &Path, branch_name: &str) -> Option<u32> {
    let output = Command::new("git")
        .args(["diff", "--name-only", &format!("HEAD~1..{branch_name}")])
        .current_dir(project_path)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).lines().filter(|l| !l.trim().is_empty()).count() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn setup_git_repo(dir: &Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
            vec!["commit", "--allow-empty", "-m", "initial"],
        ] {
            Command::new("git").args(&args).current_dir(dir).output().await.unwrap();
        }
    }

    #[tokio::test]
    async fn merge_of_nonexistent_branch_reports_failure_not_panic() {
        let repo = tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        let result = merge_task_branch(repo.path(), "does-not-exist", &MergeOptions::default()).await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn default_branch_prefers_main_over_master() {
        let repo = tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        let detected = detect_default_branch(repo.path()).await;
        assert_eq!(detected, "main");
    }
}
