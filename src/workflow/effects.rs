//! Side effects the workflow machine needs, behind a trait.
//!
//! [`LiveEffects`] wires the real orchestrator, decision store and git. Tests
//! script the machine with their own implementation.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::publish::{PublishReport, PublishRequest, PullRequest, publish};
use super::state::WorkflowState;
use crate::agent::AgentIdentity;
use crate::config::Config;
use crate::decision::{DecisionAggregator, ReviewType, Verdict};
use crate::errors::{AggregateError, DecisionError, OrchestratorError, WorkflowError};
use crate::orchestrator::{MessageSink, Orchestrator, PhaseOutcome, PhaseRequest};
use crate::util::{atomic_write, truncate_str};
use crate::worktree::WorktreeManager;

#[async_trait]
pub trait PhaseEffects: Send + Sync {
    /// The task description the user supplied.
    fn task_prompt(&self, task_id: &str) -> Result<String, WorkflowError>;

    /// Store a generated file under the task's directory.
    fn write_task_file(&self, task_id: &str, name: &str, content: &str) -> Result<PathBuf, WorkflowError>;

    /// Create (or re-attach) worktrees for `agents` ahead of their first run.
    async fn prepare_worktrees(&self, task_id: &str, agents: &[AgentIdentity]) -> Result<(), WorkflowError>;

    fn worktree_path(&self, task_id: &str, agent_id: &str) -> PathBuf;

    fn branch_name(&self, task_id: &str, agent_id: &str) -> String {
        WorktreeManager::branch_name(task_id, agent_id)
    }

    async fn run_agents(
        &self,
        request: PhaseRequest,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutcome, OrchestratorError>;

    fn decision_path(&self, task_id: &str, review_type: ReviewType, judge_id: &str) -> PathBuf;

    /// Judges that have a decision file for the current round.
    fn present_decisions(&self, task_id: &str, review_type: ReviewType) -> BTreeSet<String>;

    fn aggregate(
        &self,
        task_id: &str,
        review_type: ReviewType,
        judges: &[AgentIdentity],
    ) -> Result<Verdict, AggregateError>;

    /// Move the current round's decisions aside before a new round.
    fn archive_review(&self, task_id: &str, review_type: ReviewType) -> Result<Option<u32>, DecisionError>;

    /// Delete decisions written by an attempt that did not complete.
    fn discard_review(&self, task_id: &str, review_type: ReviewType, judges: &[String]) -> Result<(), DecisionError>;

    async fn publish(&self, state: &WorkflowState) -> Result<PublishReport, WorkflowError>;
}

pub struct LiveEffects {
    orchestrator: Orchestrator,
    aggregator: DecisionAggregator,
    sink: Arc<dyn MessageSink>,
    tasks_dir: PathBuf,
    base_branch: String,
    create_pr: bool,
    remote: String,
}

impl LiveEffects {
    pub fn new(
        config: &Config,
        orchestrator: Orchestrator,
        aggregator: DecisionAggregator,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        let base_branch = orchestrator.worktrees().base_branch().to_string();
        Self {
            orchestrator,
            aggregator,
            sink,
            tasks_dir: config.tasks_dir.clone(),
            base_branch,
            create_pr: config.toml.publish.create_pr,
            remote: config.toml.publish.remote.clone(),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}

#[async_trait]
impl PhaseEffects for LiveEffects {
    fn task_prompt(&self, task_id: &str) -> Result<String, WorkflowError> {
        let path = self.tasks_dir.join(task_id).join("task.md");
        match std::fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => Ok(text),
            _ => Err(WorkflowError::MissingPrompt(path)),
        }
    }

    fn write_task_file(&self, task_id: &str, name: &str, content: &str) -> Result<PathBuf, WorkflowError> {
        let path = self.tasks_dir.join(task_id).join(name);
        atomic_write(&path, content.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to write {}: {}", path.display(), e))?;
        Ok(path)
    }

    async fn prepare_worktrees(&self, task_id: &str, agents: &[AgentIdentity]) -> Result<(), WorkflowError> {
        let worktrees = self.orchestrator.worktrees();
        let results =
            futures::future::join_all(agents.iter().map(|a| worktrees.ensure(task_id, &a.id))).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    fn worktree_path(&self, task_id: &str, agent_id: &str) -> PathBuf {
        self.orchestrator.worktrees().path_for(task_id, agent_id)
    }

    async fn run_agents(
        &self,
        request: PhaseRequest,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutcome, OrchestratorError> {
        self.orchestrator
            .run_phase(request, self.sink.clone(), cancel)
            .await
    }

    fn decision_path(&self, task_id: &str, review_type: ReviewType, judge_id: &str) -> PathBuf {
        self.aggregator.store().path(task_id, review_type, judge_id)
    }

    fn present_decisions(&self, task_id: &str, review_type: ReviewType) -> BTreeSet<String> {
        self.aggregator.store().present(task_id, review_type)
    }

    fn aggregate(
        &self,
        task_id: &str,
        review_type: ReviewType,
        judges: &[AgentIdentity],
    ) -> Result<Verdict, AggregateError> {
        self.aggregator.aggregate(task_id, review_type, judges)
    }

    fn archive_review(&self, task_id: &str, review_type: ReviewType) -> Result<Option<u32>, DecisionError> {
        self.aggregator.store().archive_round(task_id, review_type)
    }

    fn discard_review(&self, task_id: &str, review_type: ReviewType, judges: &[String]) -> Result<(), DecisionError> {
        self.aggregator.store().discard(task_id, review_type, judges)
    }

    async fn publish(&self, state: &WorkflowState) -> Result<PublishReport, WorkflowError> {
        let winner = state
            .winner
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("task {} has no winner to publish", state.task_id))?;
        let worktree = self
            .orchestrator
            .worktrees()
            .ensure(&state.task_id, winner)
            .await?;
        let base_branch = state
            .base_branch
            .clone()
            .unwrap_or_else(|| self.base_branch.clone());

        let pull_request = if self.create_pr {
            let task = self.task_prompt(&state.task_id).unwrap_or_default();
            let summary = task
                .lines()
                .map(|l| l.trim_start_matches('#').trim())
                .find(|l| !l.is_empty())
                .unwrap_or(state.task_id.as_str());
            Some(PullRequest {
                remote: self.remote.clone(),
                title: truncate_str(summary, 72),
                body: format!(
                    "## Task\n\n{}\n\n---\n*Selected by cube from competing writers; winner `{}` on the {} path.*",
                    task.trim(),
                    winner,
                    state.path
                ),
            })
        } else {
            None
        };

        let request = PublishRequest {
            task_id: state.task_id.clone(),
            worktree: worktree.path,
            branch: worktree.branch,
            base_branch,
            patch_path: self.tasks_dir.join(&state.task_id).join("publish.patch"),
            pull_request,
        };
        Ok(publish(&request).await?)
    }
}
