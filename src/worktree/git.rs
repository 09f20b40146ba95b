//! Thin async wrapper around the `git` CLI.

use std::path::{Path, PathBuf};
use std::process::Output;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::WorktreeError;

pub struct GitRunner {
    working_dir: PathBuf,
}

impl GitRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Run git, returning the output whatever the exit status.
    pub async fn run(&self, args: &[&str]) -> Result<Output, WorktreeError> {
        debug!(args = ?args, dir = %self.working_dir.display(), "running git command");

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .await
            .map_err(|source| WorktreeError::Io {
                path: self.working_dir.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(args = ?args, stderr = %stderr.trim(), "git command failed");
        }

        Ok(output)
    }

    /// Run git and turn a non-zero exit into `WorktreeError::Git`.
    pub async fn run_checked(&self, args: &[&str]) -> Result<Output, WorktreeError> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(WorktreeError::Git {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Trimmed stdout of a successful command.
    pub async fn stdout(&self, args: &[&str]) -> Result<String, WorktreeError> {
        let output = self.run_checked(args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn add_all(&self) -> Result<(), WorktreeError> {
        self.run_checked(&["add", "-A"]).await?;
        Ok(())
    }

    /// Commit staged changes. Returns false if there was nothing to commit.
    pub async fn commit(&self, message: &str) -> Result<bool, WorktreeError> {
        let output = self.run(&["commit", "-m", message]).await?;
        if output.status.success() {
            return Ok(true);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stdout.contains("nothing to commit") || stderr.contains("nothing to commit") {
            return Ok(false);
        }
        Err(WorktreeError::Git {
            args: "commit".to_string(),
            stderr: stderr.trim().to_string(),
        })
    }

    pub async fn current_branch(&self) -> Result<String, WorktreeError> {
        self.stdout(&["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    pub async fn push(&self, remote: &str, branch: &str) -> Result<(), WorktreeError> {
        self.run_checked(&["push", "-u", remote, branch]).await?;
        Ok(())
    }

    /// Diff of everything `branch` adds on top of `base`.
    pub async fn diff_range(&self, base: &str, branch: &str) -> Result<String, WorktreeError> {
        let range = format!("{}...{}", base, branch);
        let output = self.run_checked(&["diff", "--binary", &range]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub async fn diff_stat(&self, base: &str, branch: &str) -> Result<String, WorktreeError> {
        let range = format!("{}...{}", base, branch);
        self.stdout(&["diff", "--stat", &range]).await
    }

    pub async fn worktree_prune(&self) -> Result<(), WorktreeError> {
        self.run_checked(&["worktree", "prune"]).await?;
        Ok(())
    }

    pub async fn worktree_add_new_branch(
        &self,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<(), WorktreeError> {
        let path = path.to_string_lossy();
        self.run_checked(&["worktree", "add", "-b", branch, &path, base])
            .await?;
        Ok(())
    }

    pub async fn worktree_add_existing(&self, path: &Path, branch: &str) -> Result<(), WorktreeError> {
        let path = path.to_string_lossy();
        self.run_checked(&["worktree", "add", &path, branch]).await?;
        Ok(())
    }

    pub async fn worktree_remove(&self, path: &Path) -> Result<(), WorktreeError> {
        let path = path.to_string_lossy();
        self.run_checked(&["worktree", "remove", "--force", &path])
            .await?;
        Ok(())
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<(), WorktreeError> {
        self.run_checked(&["branch", "-D", branch]).await?;
        Ok(())
    }
}
