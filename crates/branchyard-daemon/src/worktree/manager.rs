//! Worktree manager: `git worktree` operations under a dedicated base directory.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("Git command failed: {0}")]
    Git(String),

    #[error("Repository not found: {0}")]
    NotFound(String),

    #[error("Path exists and is not a worktree: {0}")]
    PathExists(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid name: {0}")]
    InvalidName(String),
}

/// Validate a branch name: alphanumeric, hyphens, underscores, slashes, dots.
/// Rejects path traversal (`..`), leading dashes, and control characters.
fn validate_branch(branch: &str) -> Result<(), WorktreeError> {
    if branch.is_empty() {
        return Err(WorktreeError::InvalidName("branch cannot be empty".into()));
    }
    if branch.starts_with('-') {
        return Err(WorktreeError::InvalidName(
            "branch cannot start with a dash".into(),
        ));
    }
    if branch.contains("..") {
        return Err(WorktreeError::InvalidName(
            "branch cannot contain '..'".into(),
        ));
    }
    if !branch
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
    {
        return Err(WorktreeError::InvalidName(format!(
            "branch contains invalid characters: {branch}"
        )));
    }
    Ok(())
}

/// Directory name for a branch: `/` becomes `-` so nested branches stay one level deep.
fn branch_dir_name(branch: &str) -> String {
    branch.replace('/', "-")
}

/// Deterministic worktree location: `<base>/<repo name>/<branch>`.
pub fn resolve_worktree_path(base_dir: &Path, project_root: &Path, branch: &str) -> PathBuf {
    let repo_name = project_root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown");
    base_dir.join(repo_name).join(branch_dir_name(branch))
}

/// Creates and removes worktrees below one base directory.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    base_dir: PathBuf,
}

impl WorktreeManager {
    pub const fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path the worktree for `branch` of `project_root` lives at.
    pub fn path_for(&self, project_root: &Path, branch: &str) -> PathBuf {
        resolve_worktree_path(&self.base_dir, project_root, branch)
    }

    /// Make sure a worktree for `branch` exists and return its path.
    ///
    /// Creates the branch from `HEAD` when it does not exist yet. Calling it
    /// again for an existing worktree returns the same path.
    pub async fn ensure(&self, project_root: &Path, branch: &str) -> Result<PathBuf, WorktreeError> {
        validate_branch(branch)?;

        if !project_root.exists() {
            return Err(WorktreeError::NotFound(
                project_root.display().to_string(),
            ));
        }

        let path = self.path_for(project_root, branch);
        if path.join(".git").exists() {
            debug!(path = %path.display(), branch, "ensure: worktree already present");
            return Ok(path);
        }
        if path.exists() {
            return Err(WorktreeError::PathExists(path.display().to_string()));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let branch_exists = branch_exists(project_root, branch).await?;

        let start = std::time::Instant::now();
        let mut cmd = tokio::process::Command::new("git");
        cmd.arg("worktree").arg("add");
        if branch_exists {
            cmd.arg(&path).arg(branch);
        } else {
            cmd.arg("-b").arg(branch).arg(&path);
        }
        let output = cmd.current_dir(project_root).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(
                elapsed_ms = start.elapsed().as_millis(),
                status = %output.status,
                stderr = %stderr.trim(),
                "ensure: git worktree add failed"
            );
            return Err(WorktreeError::Git(format!(
                "git worktree add failed: {}",
                stderr.trim()
            )));
        }

        info!(
            path = %path.display(),
            branch,
            new_branch = !branch_exists,
            elapsed_ms = start.elapsed().as_millis(),
            "Created git worktree"
        );
        Ok(path)
    }

    /// Remove the worktree for `branch`. Returns `false` when there was none.
    pub async fn remove(&self, project_root: &Path, branch: &str) -> Result<bool, WorktreeError> {
        validate_branch(branch)?;
        let path = self.path_for(project_root, branch);
        if !path.exists() {
            return Ok(false);
        }

        let output = tokio::process::Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(&path)
            .current_dir(project_root)
            .output()
            .await?;

        if output.status.success() {
            info!(path = %path.display(), "Removed git worktree");
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(path = %path.display(), error = %stderr.trim(), "git worktree remove failed, deleting directory");
            tokio::fs::remove_dir_all(&path).await?;
        }

        Ok(true)
    }
}

async fn branch_exists(project_root: &Path, branch: &str) -> Result<bool, WorktreeError> {
    let status = tokio::process::Command::new("git")
        .args(["rev-parse", "--verify", "--quiet"])
        .arg(format!("refs/heads/{branch}"))
        .current_dir(project_root)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await?;
    Ok(status.success())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn git(dir: &Path, args: &[&str]) {
        let out = std::process::Command::new("git")
            .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(out.status.success(), "git {args:?} failed");
    }

    fn init_repo() -> tempfile::TempDir {
        let repo = tempfile::tempdir().unwrap();
        git(repo.path(), &["init"]);
        git(repo.path(), &["commit", "--allow-empty", "-m", "init"]);
        repo
    }

    #[test]
    fn path_is_deterministic() {
        let a = resolve_worktree_path(Path::new("/wt"), Path::new("/repos/shop"), "feat/login");
        let b = resolve_worktree_path(Path::new("/wt"), Path::new("/repos/shop"), "feat/login");
        assert_eq!(a, b);
        assert_eq!(a, PathBuf::from("/wt/shop/feat-login"));
    }

    #[test]
    fn validate_branch_rejects_bad_names() {
        assert!(validate_branch("feat/login").is_ok());
        assert!(validate_branch("").is_err());
        assert!(validate_branch("../etc").is_err());
        assert!(validate_branch("-b").is_err());
        assert!(validate_branch("a b").is_err());
    }

    #[tokio::test]
    async fn ensure_creates_branch_and_is_idempotent() {
        let repo = init_repo();
        let base = tempfile::tempdir().unwrap();
        let mgr = WorktreeManager::new(base.path().to_path_buf());

        let path = mgr.ensure(repo.path(), "feat/x").await.unwrap();
        assert!(path.starts_with(base.path()));
        assert!(path.join(".git").exists());

        let again = mgr.ensure(repo.path(), "feat/x").await.unwrap();
        assert_eq!(path, again);
    }

    #[tokio::test]
    async fn ensure_uses_existing_branch() {
        let repo = init_repo();
        git(repo.path(), &["branch", "existing"]);
        let base = tempfile::tempdir().unwrap();
        let mgr = WorktreeManager::new(base.path().to_path_buf());

        let path = mgr.ensure(repo.path(), "existing").await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn ensure_missing_repo_is_not_found() {
        let base = tempfile::tempdir().unwrap();
        let mgr = WorktreeManager::new(base.path().to_path_buf());
        let err = mgr
            .ensure(Path::new("/definitely/not/here"), "main")
            .await
            .unwrap_err();
        assert!(matches!(err, WorktreeError::NotFound(_)));
    }

    #[tokio::test]
    async fn remove_reports_whether_anything_was_removed() {
        let repo = init_repo();
        let base = tempfile::tempdir().unwrap();
        let mgr = WorktreeManager::new(base.path().to_path_buf());

        assert!(!mgr.remove(repo.path(), "feat").await.unwrap());
        let path = mgr.ensure(repo.path(), "feat").await.unwrap();
        assert!(mgr.remove(repo.path(), "feat").await.unwrap());
        assert!(!path.exists());
    }
}
