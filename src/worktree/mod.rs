//! Isolated git worktrees, one per (task, agent).
//!
//! Each agent works in `<root>/<task>/<agent>` on branch `<agent>/<task>`.
//! `ensure` is idempotent: an existing checkout is reused, an existing branch
//! whose checkout was lost (crash, manual delete) is checked out again rather
//! than recreated, and stale git registrations are pruned first.

pub mod git;

pub use git::GitRunner;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use git2::{BranchType, Repository};
use tracing::{debug, info, warn};

use crate::errors::WorktreeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    pub task_id: String,
    pub agent_id: String,
    pub path: PathBuf,
    pub branch: String,
}

type LockKey = (String, String);

pub struct WorktreeManager {
    repo_root: PathBuf,
    root: PathBuf,
    base_branch: String,
    locks: Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
    /// Serializes commands that mutate the repository's worktree list.
    repo_lock: tokio::sync::Mutex<()>,
}

impl WorktreeManager {
    pub fn new(repo_root: impl Into<PathBuf>, root: impl Into<PathBuf>, base_branch: &str) -> Self {
        Self {
            repo_root: repo_root.into(),
            root: root.into(),
            base_branch: base_branch.to_string(),
            locks: Mutex::new(HashMap::new()),
            repo_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Short name of the branch HEAD points at in `repo_root`.
    pub fn discover_base_branch(repo_root: &Path) -> Result<String, WorktreeError> {
        let repo = open_repo(repo_root)?;
        let head = repo.head().map_err(|source| WorktreeError::Repository {
            path: repo_root.to_path_buf(),
            source,
        })?;
        Ok(head.shorthand().unwrap_or("HEAD").to_string())
    }

    pub fn branch_name(task_id: &str, agent_id: &str) -> String {
        format!("{}/{}", agent_id, task_id)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    pub fn path_for(&self, task_id: &str, agent_id: &str) -> PathBuf {
        self.root.join(task_id).join(agent_id)
    }

    fn lock_for(&self, task_id: &str, agent_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry((task_id.to_string(), agent_id.to_string()))
            .or_default()
            .clone()
    }

    fn git(&self) -> GitRunner {
        GitRunner::new(&self.repo_root)
    }

    fn branch_exists(&self, branch: &str) -> Result<bool, WorktreeError> {
        let repo = open_repo(&self.repo_root)?;
        Ok(repo.find_branch(branch, BranchType::Local).is_ok())
    }

    /// Create or reuse the worktree for `(task_id, agent_id)`.
    pub async fn ensure(&self, task_id: &str, agent_id: &str) -> Result<Worktree, WorktreeError> {
        let lock = self.lock_for(task_id, agent_id);
        let _guard = lock.lock().await;

        let path = self.path_for(task_id, agent_id);
        let branch = Self::branch_name(task_id, agent_id);
        let worktree = Worktree {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            path: path.clone(),
            branch: branch.clone(),
        };

        if path.join(".git").exists() {
            let found = GitRunner::new(&path).current_branch().await?;
            if found != branch {
                return Err(WorktreeError::BranchMismatch {
                    path,
                    expected: branch,
                    found,
                });
            }
            debug!(path = %path.display(), branch = %branch, "reusing existing worktree");
            return Ok(worktree);
        }

        if path.exists() {
            warn!(path = %path.display(), "removing leftover directory without a checkout");
            std::fs::remove_dir_all(&path).map_err(|source| WorktreeError::Io {
                path: path.clone(),
                source,
            })?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| WorktreeError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let _repo_guard = self.repo_lock.lock().await;
        let git = self.git();
        git.worktree_prune().await?;

        if self.branch_exists(&branch)? {
            git.worktree_add_existing(&path, &branch).await?;
            info!(path = %path.display(), branch = %branch, "re-attached worktree to existing branch");
        } else {
            match git
                .worktree_add_new_branch(&path, &branch, &self.base_branch)
                .await
            {
                Ok(()) => {}
                Err(WorktreeError::Git { stderr, .. }) if stderr.contains("already exists") => {
                    debug!(branch = %branch, "branch appeared concurrently; attaching instead");
                    git.worktree_prune().await?;
                    git.worktree_add_existing(&path, &branch).await?;
                }
                Err(e) => return Err(e),
            }
            info!(path = %path.display(), branch = %branch, base = %self.base_branch, "created worktree");
        }

        Ok(worktree)
    }

    /// The worktree if it is currently checked out.
    pub fn existing(&self, task_id: &str, agent_id: &str) -> Option<Worktree> {
        let path = self.path_for(task_id, agent_id);
        path.join(".git").exists().then(|| Worktree {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            path,
            branch: Self::branch_name(task_id, agent_id),
        })
    }

    /// Remove the checkout. With `delete_branch`, the branch goes too.
    pub async fn remove(
        &self,
        task_id: &str,
        agent_id: &str,
        delete_branch: bool,
    ) -> Result<(), WorktreeError> {
        let lock = self.lock_for(task_id, agent_id);
        let _guard = lock.lock().await;

        let path = self.path_for(task_id, agent_id);
        let _repo_guard = self.repo_lock.lock().await;
        let git = self.git();
        if path.exists() {
            if let Err(e) = git.worktree_remove(&path).await {
                debug!(path = %path.display(), error = %e, "git worktree remove failed, removing directory");
                std::fs::remove_dir_all(&path).map_err(|source| WorktreeError::Io {
                    path: path.clone(),
                    source,
                })?;
            }
            info!(path = %path.display(), "removed worktree");
        }
        git.worktree_prune().await?;

        let branch = Self::branch_name(task_id, agent_id);
        if delete_branch && self.branch_exists(&branch)? {
            git.delete_branch(&branch).await?;
            info!(branch = %branch, "deleted branch");
        }
        Ok(())
    }

    /// Remove every worktree of a task, then the task's directory.
    pub async fn remove_task(
        &self,
        task_id: &str,
        agent_ids: &[String],
        delete_branches: bool,
    ) -> Result<(), WorktreeError> {
        for agent_id in agent_ids {
            self.remove(task_id, agent_id, delete_branches).await?;
        }
        let task_dir = self.root.join(task_id);
        if task_dir.exists() {
            std::fs::remove_dir_all(&task_dir).map_err(|source| WorktreeError::Io {
                path: task_dir.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

fn open_repo(path: &Path) -> Result<Repository, WorktreeError> {
    Repository::open(path).map_err(|source| WorktreeError::Repository {
        path: path.to_path_buf(),
        source,
    })
}
