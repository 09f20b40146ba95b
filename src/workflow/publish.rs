//! Publishing the winning branch: commit, export a patch, optionally open a PR.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::util::atomic_write;
use crate::worktree::GitRunner;

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub task_id: String,
    pub worktree: PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub patch_path: PathBuf,
    /// Push and run `gh pr create` against this remote.
    pub pull_request: Option<PullRequest>,
}

#[derive(Debug, Clone)]
pub struct PullRequest {
    pub remote: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishReport {
    pub branch: String,
    /// A commit was made for changes the writer left uncommitted.
    pub committed_leftovers: bool,
    pub patch_path: PathBuf,
    pub diff_stat: String,
    pub pr_url: Option<String>,
}

pub async fn publish(request: &PublishRequest) -> Result<PublishReport> {
    let git = GitRunner::new(&request.worktree);

    git.add_all().await?;
    let committed_leftovers = git
        .commit(&format!("cube: finalize {}", request.task_id))
        .await?;

    let patch = git
        .diff_range(&request.base_branch, &request.branch)
        .await?;
    atomic_write(&request.patch_path, patch.as_bytes())
        .with_context(|| format!("Failed to write {}", request.patch_path.display()))?;
    let diff_stat = git
        .diff_stat(&request.base_branch, &request.branch)
        .await?;

    let pr_url = match &request.pull_request {
        Some(pr) => {
            git.push(&pr.remote, &request.branch).await?;
            Some(create_pull_request(&request.worktree, &request.base_branch, &request.branch, pr).await?)
        }
        None => None,
    };

    info!(
        task_id = %request.task_id,
        branch = %request.branch,
        patch = %request.patch_path.display(),
        pr = pr_url.as_deref().unwrap_or("-"),
        "published"
    );
    Ok(PublishReport {
        branch: request.branch.clone(),
        committed_leftovers,
        patch_path: request.patch_path.clone(),
        diff_stat,
        pr_url,
    })
}

async fn create_pull_request(dir: &Path, base: &str, branch: &str, pr: &PullRequest) -> Result<String> {
    let output = tokio::process::Command::new("gh")
        .args([
            "pr", "create", "--base", base, "--head", branch, "--title", &pr.title, "--body", &pr.body,
        ])
        .current_dir(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("Failed to run gh pr create")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("Failed to create PR: {}", stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default()
        .trim()
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worktree::WorktreeManager;
    use std::process::Command;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_publish_commits_leftovers_and_writes_patch() {
        let repo = TempDir::new().unwrap();
        for args in [
            vec!["init", "-q", "-b", "main"],
            vec!["config", "user.email", "cube@example.com"],
            vec!["config", "user.name", "cube"],
            vec!["commit", "-q", "--allow-empty", "-m", "initial"],
        ] {
            assert!(Command::new("git").args(&args).current_dir(repo.path()).status().unwrap().success());
        }
        let root = TempDir::new().unwrap();
        let manager = WorktreeManager::new(repo.path(), root.path(), "main");
        let wt = manager.ensure("t1", "writer_a").await.unwrap();
        std::fs::write(wt.path.join("hello.txt"), "hello\n").unwrap();

        let patch_path = repo.path().join(".cube/tasks/t1/publish.patch");
        let report = publish(&PublishRequest {
            task_id: "t1".into(),
            worktree: wt.path.clone(),
            branch: wt.branch.clone(),
            base_branch: "main".into(),
            patch_path: patch_path.clone(),
            pull_request: None,
        })
        .await
        .unwrap();

        assert!(report.committed_leftovers);
        assert!(report.pr_url.is_none());
        assert!(report.diff_stat.contains("hello.txt"));
        let patch = std::fs::read_to_string(&patch_path).unwrap();
        assert!(patch.contains("+hello"));
    }
}
