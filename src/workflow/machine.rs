//! The workflow driver: runs phases in order and persists progress.
//!
//! Each step gathers a phase's results through [`PhaseEffects`], hands them
//! to the pure transition function, and saves the new state. A halt or a
//! cancellation leaves the persisted phase untouched, so the next `run`
//! re-attempts the same phase.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::effects::PhaseEffects;
use super::phases::{PhaseKind, last_phase, phase_kind};
use super::prompts::{PromptKind, PromptLibrary, bullets};
use super::publish::PublishReport;
use super::state::{StateStore, WorkflowPath, WorkflowState};
use super::transitions::{Halt, PhaseInput, apply};
use crate::agent::{AgentIdentity, slot_letter};
use crate::config::Config;
use crate::decision::{ReviewType, Verdict, Winner};
use crate::errors::{OrchestratorError, StateError, WorkflowError};
use crate::orchestrator::{AgentAssignment, PhaseOutcome, PhaseRequest};
use crate::util::validate_id;

/// Roster and limits the machine works with.
#[derive(Debug, Clone)]
pub struct MachineSettings {
    pub writers: Vec<AgentIdentity>,
    pub initial_judges: Vec<AgentIdentity>,
    pub peer_judges: Vec<AgentIdentity>,
    pub max_fix_rounds: u32,
    pub base_branch: String,
    pub repo_root: PathBuf,
}

impl MachineSettings {
    pub fn from_config(config: &Config, base_branch: &str) -> Self {
        Self {
            writers: config.writers().to_vec(),
            initial_judges: config.judges_for(ReviewType::Initial),
            peer_judges: config.judges_for(ReviewType::PeerReview),
            max_fix_rounds: config.toml.review.max_fix_rounds,
            base_branch: base_branch.to_string(),
            repo_root: config.project_dir.clone(),
        }
    }
}

/// Result of driving a task until it stops.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub state: WorkflowState,
    pub published: Option<PublishReport>,
}

pub struct WorkflowMachine<E: PhaseEffects> {
    effects: E,
    states: StateStore,
    prompts: PromptLibrary,
    settings: MachineSettings,
}

impl<E: PhaseEffects> WorkflowMachine<E> {
    pub fn new(effects: E, states: StateStore, prompts: PromptLibrary, settings: MachineSettings) -> Self {
        Self {
            effects,
            states,
            prompts,
            settings,
        }
    }

    pub fn effects(&self) -> &E {
        &self.effects
    }

    pub fn states(&self) -> &StateStore {
        &self.states
    }

    /// Create the task's state if it does not exist yet. An existing task is
    /// returned as is; its prompt is only replaced while it is still at
    /// phase 1.
    pub fn start(&self, task_id: &str, prompt: Option<&str>) -> Result<WorkflowState, WorkflowError> {
        validate_id("task", task_id).map_err(|e| anyhow::anyhow!(e))?;
        let existing = self.states.load(task_id)?;

        if let Some(text) = prompt {
            match &existing {
                Some(state) if state.current_phase > 1 => {
                    warn!(task_id, phase = state.current_phase, "task already past generate; ignoring new prompt");
                }
                _ => {
                    self.effects.write_task_file(task_id, "task.md", text)?;
                }
            }
        }
        // Fails early with the path when there is no prompt at all.
        self.effects.task_prompt(task_id)?;

        match existing {
            Some(state) => Ok(state),
            None => {
                let state = WorkflowState::new(task_id, Some(self.settings.base_branch.clone()));
                self.states.save(&state)?;
                info!(task_id, "created workflow state");
                Ok(state)
            }
        }
    }

    /// Run phases until the task is published, halts, or is cancelled.
    pub async fn run(&self, task_id: &str, cancel: &CancellationToken) -> Result<WorkflowRun, WorkflowError> {
        let mut state = self
            .states
            .load(task_id)?
            .ok_or_else(|| WorkflowError::UnknownTask(task_id.to_string()))?;
        if state.is_terminal() {
            return Err(WorkflowError::Terminal {
                task_id: task_id.to_string(),
                status: state.status.to_string(),
            });
        }

        let mut published = None;
        loop {
            let kind = phase_kind(state.path, state.current_phase).ok_or_else(|| StateError::UnknownPhase {
                phase: state.current_phase,
                path: state.path.to_string(),
                last: last_phase(state.path),
            })?;
            if cancel.is_cancelled() {
                return Err(self.cancelled(&state, kind));
            }
            info!(task_id, phase = state.current_phase, name = %kind, path = %state.path, "running phase");

            let (next, report) = self.step(state, kind, cancel).await?;
            state = next;
            if report.is_some() {
                published = report;
            }
            if state.is_terminal() {
                return Ok(WorkflowRun { state, published });
            }
        }
    }

    async fn step(
        &self,
        mut state: WorkflowState,
        kind: PhaseKind,
        cancel: &CancellationToken,
    ) -> Result<(WorkflowState, Option<PublishReport>), WorkflowError> {
        let task_id = state.task_id.clone();
        let writers: &[AgentIdentity] = &self.settings.writers;

        let transition = match kind {
            PhaseKind::Generate => {
                if writers.is_empty() {
                    return Err(halted(&state, kind, no_writers()));
                }
                let task = self.effects.task_prompt(&task_id)?;
                self.effects.prepare_worktrees(&task_id, writers).await?;
                for (slot, writer) in writers.iter().enumerate() {
                    let prompt = self.writer_prompt(&task_id, &task, slot, writer);
                    self.effects
                        .write_task_file(&task_id, &format!("prompts/{}.md", writer.id), &prompt)?;
                }
                apply(&state, PhaseInput::Generated)
            }

            PhaseKind::Writers => {
                let task = self.effects.task_prompt(&task_id)?;
                let assignments: Vec<AgentAssignment> = writers
                    .iter()
                    .enumerate()
                    .filter(|(_, w)| !state.phase_agents_done.contains(&w.id))
                    .map(|(slot, w)| AgentAssignment::new(w.clone(), self.writer_prompt(&task_id, &task, slot, w)))
                    .collect();
                let outcome = self.run_or_skip(&state, kind, assignments, cancel).await?;
                for result in outcome.results.iter().filter(|r| r.succeeded()) {
                    if !state.phase_agents_done.contains(&result.agent_id) {
                        state.phase_agents_done.push(result.agent_id.clone());
                    }
                }
                self.states.save(&state)?;
                apply(&state, PhaseInput::Writers { writers, outcome: &outcome })
            }

            PhaseKind::InitialReview => {
                let verdict = self
                    .review(&state, ReviewType::Initial, &self.settings.initial_judges, cancel)
                    .await?;
                apply(&state, PhaseInput::InitialReview { writers, verdict: &verdict })
            }

            PhaseKind::Synthesis => {
                let winner = self.winner(&state)?;
                let verdict = self
                    .effects
                    .aggregate(&task_id, ReviewType::Initial, &self.settings.initial_judges)?;
                let prompt = self.synthesis_prompt(&task_id, &winner, &verdict);
                self.effects.write_task_file(&task_id, "synthesis.md", &prompt)?;
                let outcome = self
                    .run_or_skip(&state, kind, vec![AgentAssignment::new(winner, prompt)], cancel)
                    .await?;
                apply(&state, PhaseInput::Synthesis(&outcome))
            }

            PhaseKind::PeerReview => {
                let verdict = self
                    .review(&state, ReviewType::PeerReview, &self.settings.peer_judges, cancel)
                    .await?;
                apply(&state, PhaseInput::PeerReview(&verdict))
            }

            PhaseKind::Fix => {
                let (rounds, verdict) = self.fix_rounds(&mut state, cancel).await?;
                apply(&state, PhaseInput::Fix { verdict: &verdict, rounds })
            }

            PhaseKind::Publish => {
                let report = self.effects.publish(&state).await?;
                let transition = apply(&state, PhaseInput::Published).map_err(|h| halted(&state, kind, h))?;
                self.states.save(&transition.state)?;
                info!(task_id = %task_id, branch = %report.branch, patch = %report.patch_path.display(), "task published");
                return Ok((transition.state, Some(report)));
            }
        };

        let transition = transition.map_err(|h| halted(&state, kind, h))?;
        if let Some(path) = transition.path_change {
            info!(
                task_id = %task_id,
                path = %path,
                winner = transition.state.winner.as_deref().unwrap_or("-"),
                "workflow path decided"
            );
        }
        self.states.save(&transition.state)?;
        Ok((transition.state, None))
    }

    /// Run fix rounds until the judges approve or the round budget for this
    /// attempt is spent. Returns the rounds run and the last verdict.
    async fn fix_rounds(
        &self,
        state: &mut WorkflowState,
        cancel: &CancellationToken,
    ) -> Result<(u32, Verdict), WorkflowError> {
        let task_id = state.task_id.clone();
        let mut rounds = 0;
        loop {
            let verdict = self.fix_baseline(state, cancel).await?;
            if verdict.approved() || rounds >= self.settings.max_fix_rounds {
                return Ok((rounds, verdict));
            }

            let winner = self.winner(state)?;
            let round = state.fix_rounds + 1;
            let prompt = self.prompts.render(
                PromptKind::Fix,
                &[
                    ("task_id", &task_id),
                    ("round", &round.to_string()),
                    ("branch", &self.effects.branch_name(&task_id, &winner.id)),
                    ("blockers", &bullets(&verdict.blockers, "no specific blockers listed")),
                    ("recommendations", &recommendations(&verdict)),
                ],
            );
            let outcome = self
                .run_or_skip(state, PhaseKind::Fix, vec![AgentAssignment::new(winner.clone(), prompt)], cancel)
                .await?;
            if let Some(failure) = outcome.failed().first() {
                let detail = failure
                    .failure
                    .as_ref()
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "no result".into());
                return Err(halted(
                    state,
                    PhaseKind::Fix,
                    Halt {
                        reason: format!("fix round {} by {} failed: {}", round, winner.id, detail),
                        recovery: vec![
                            format!("cube run {}", task_id),
                            format!(
                                "cube resume {} {} \"Address the remaining review blockers\"",
                                task_id, winner.id
                            ),
                        ],
                    },
                ));
            }

            self.effects.archive_review(&task_id, ReviewType::PeerReview)?;
            state.fix_rounds = round;
            self.states.save(state)?;
            rounds += 1;
            info!(task_id = %task_id, round, "fix round complete; judges re-reviewing");
        }
    }

    /// The review the fix phase is judged on: the initial review for a
    /// single writer that has not been through a fix round yet, otherwise
    /// the current peer-review round (running any judges still missing).
    async fn fix_baseline(&self, state: &WorkflowState, cancel: &CancellationToken) -> Result<Verdict, WorkflowError> {
        if state.path == WorkflowPath::Single && state.fix_rounds == 0 {
            return Ok(self
                .effects
                .aggregate(&state.task_id, ReviewType::Initial, &self.settings.initial_judges)?);
        }
        self.review(state, ReviewType::PeerReview, &self.settings.peer_judges, cancel)
            .await
    }

    /// Run the judges that have no decision yet for this round, then
    /// aggregate. On cancellation, decisions that appeared during the
    /// attempt are deleted.
    async fn review(
        &self,
        state: &WorkflowState,
        review_type: ReviewType,
        judges: &[AgentIdentity],
        cancel: &CancellationToken,
    ) -> Result<Verdict, WorkflowError> {
        let task_id = state.task_id.as_str();
        let kind = phase_kind(state.path, state.current_phase).unwrap_or(PhaseKind::InitialReview);
        let before = self.effects.present_decisions(task_id, review_type);
        let task = self.effects.task_prompt(task_id)?;

        let assignments: Vec<AgentAssignment> = judges
            .iter()
            .filter(|j| !before.contains(&j.id))
            .map(|judge| {
                let prompt = self.judge_prompt(state, review_type, judge, &task);
                let assignment = AgentAssignment::new(judge.clone(), prompt);
                match review_type {
                    ReviewType::Initial => assignment.fresh(),
                    ReviewType::PeerReview => assignment,
                }
            })
            .collect();

        if !assignments.is_empty() {
            let request = PhaseRequest {
                task_id: task_id.to_string(),
                phase: state.current_phase,
                label: match review_type {
                    ReviewType::Initial => PhaseKind::InitialReview.name().to_string(),
                    ReviewType::PeerReview => PhaseKind::PeerReview.name().to_string(),
                },
                assignments,
            };
            match self.effects.run_agents(request, cancel).await {
                Ok(outcome) => {
                    for failed in outcome.failed() {
                        warn!(
                            task_id,
                            judge = %failed.agent_id,
                            failure = %failed.failure.as_ref().map(|f| f.to_string()).unwrap_or_default(),
                            log = %failed.log_path.display(),
                            "judge failed"
                        );
                    }
                }
                Err(OrchestratorError::Cancelled { .. }) => {
                    let after = self.effects.present_decisions(task_id, review_type);
                    let fresh: Vec<String> = after.difference(&before).cloned().collect();
                    if !fresh.is_empty() {
                        self.effects.discard_review(task_id, review_type, &fresh)?;
                    }
                    return Err(self.cancelled(state, kind));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(self.effects.aggregate(task_id, review_type, judges)?)
    }

    /// Run `assignments`, mapping cancellation to a workflow error. An empty
    /// list yields an empty outcome without touching the orchestrator.
    async fn run_or_skip(
        &self,
        state: &WorkflowState,
        kind: PhaseKind,
        assignments: Vec<AgentAssignment>,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutcome, WorkflowError> {
        let request = PhaseRequest {
            task_id: state.task_id.clone(),
            phase: state.current_phase,
            label: kind.name().to_string(),
            assignments,
        };
        if request.assignments.is_empty() {
            return Ok(PhaseOutcome {
                task_id: request.task_id,
                phase: request.phase,
                label: request.label,
                results: Vec::new(),
            });
        }
        match self.effects.run_agents(request, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(OrchestratorError::Cancelled { .. }) => Err(self.cancelled(state, kind)),
            Err(e) => Err(e.into()),
        }
    }

    fn winner(&self, state: &WorkflowState) -> Result<AgentIdentity, WorkflowError> {
        let id = state.winner.as_deref().unwrap_or_default();
        self.settings
            .writers
            .iter()
            .find(|w| w.id == id)
            .cloned()
            .ok_or_else(|| {
                WorkflowError::Other(anyhow::anyhow!(
                    "winner '{}' of task {} is not a configured writer",
                    id,
                    state.task_id
                ))
            })
    }

    fn cancelled(&self, state: &WorkflowState, kind: PhaseKind) -> WorkflowError {
        warn!(task_id = %state.task_id, phase = state.current_phase, "cancelled");
        WorkflowError::Cancelled {
            task_id: state.task_id.clone(),
            phase: state.current_phase,
            name: kind.name().to_string(),
        }
    }

    fn writer_prompt(&self, task_id: &str, task: &str, slot: usize, writer: &AgentIdentity) -> String {
        let slot = slot_letter(slot).map(String::from).unwrap_or_default();
        self.prompts.render(
            PromptKind::Writer,
            &[
                ("task_id", task_id),
                ("task", task.trim()),
                ("slot", &slot),
                ("worktree", &self.effects.worktree_path(task_id, &writer.id).display().to_string()),
                ("branch", &self.effects.branch_name(task_id, &writer.id)),
            ],
        )
    }

    fn judge_prompt(&self, state: &WorkflowState, review_type: ReviewType, judge: &AgentIdentity, task: &str) -> String {
        let task_id = state.task_id.as_str();
        let decision_path = self
            .effects
            .decision_path(task_id, review_type, &judge.id)
            .display()
            .to_string();
        let repo = self.settings.repo_root.display().to_string();
        let base = state
            .base_branch
            .clone()
            .unwrap_or_else(|| self.settings.base_branch.clone());
        let review = review_type.to_string();

        match review_type {
            ReviewType::Initial => {
                let candidates: Vec<String> = self
                    .settings
                    .writers
                    .iter()
                    .enumerate()
                    .map(|(i, w)| {
                        format!(
                            "{}: branch `{}` (worktree `{}`)",
                            Winner::Writer(i),
                            self.effects.branch_name(task_id, &w.id),
                            self.effects.worktree_path(task_id, &w.id).display()
                        )
                    })
                    .collect();
                let mut choices: Vec<String> = (0..self.settings.writers.len())
                    .map(|i| Winner::Writer(i).to_string())
                    .collect();
                choices.push(Winner::Tie.to_string());
                self.prompts.render(
                    PromptKind::InitialReview,
                    &[
                        ("task_id", task_id),
                        ("task", task.trim()),
                        ("judge_id", &judge.id),
                        ("decision_path", &decision_path),
                        ("review_type", &review),
                        ("winner_choices", &choices.join(" | ")),
                        ("candidates", &bullets(&candidates, "no writers")),
                        ("base_branch", &base),
                        ("repo", &repo),
                    ],
                )
            }
            ReviewType::PeerReview => {
                let winner = state.winner.as_deref().unwrap_or_default();
                self.prompts.render(
                    PromptKind::PeerReview,
                    &[
                        ("task_id", task_id),
                        ("task", task.trim()),
                        ("judge_id", &judge.id),
                        ("decision_path", &decision_path),
                        ("review_type", &review),
                        ("winner_choices", "TIE"),
                        ("branch", &self.effects.branch_name(task_id, winner)),
                        ("worktree", &self.effects.worktree_path(task_id, winner).display().to_string()),
                        ("base_branch", &base),
                        ("repo", &repo),
                    ],
                )
            }
        }
    }

    fn synthesis_prompt(&self, task_id: &str, winner: &AgentIdentity, verdict: &Verdict) -> String {
        let others: Vec<String> = self
            .settings
            .writers
            .iter()
            .filter(|w| w.id != winner.id)
            .map(|w| {
                format!(
                    "`{}` (worktree `{}`)",
                    self.effects.branch_name(task_id, &w.id),
                    self.effects.worktree_path(task_id, &w.id).display()
                )
            })
            .collect();
        self.prompts.render(
            PromptKind::Synthesis,
            &[
                ("task_id", task_id),
                ("branch", &self.effects.branch_name(task_id, &winner.id)),
                ("others", &bullets(&others, "none")),
                ("blockers", &bullets(&verdict.blockers, "none raised")),
                ("recommendations", &recommendations(verdict)),
            ],
        )
    }
}

fn recommendations(verdict: &Verdict) -> String {
    let lines: Vec<String> = verdict
        .decisions
        .iter()
        .filter(|d| !d.recommendation.trim().is_empty())
        .map(|d| format!("{}: {}", d.judge, d.recommendation.trim()))
        .collect();
    bullets(&lines, "none")
}

fn no_writers() -> Halt {
    Halt {
        reason: "no writers are configured".to_string(),
        recovery: vec!["add a [[writers]] entry to .cube/cube.toml".to_string()],
    }
}

fn halted(state: &WorkflowState, kind: PhaseKind, halt: Halt) -> WorkflowError {
    warn!(task_id = %state.task_id, phase = state.current_phase, reason = %halt.reason, "phase halted");
    WorkflowError::Halted {
        phase: state.current_phase,
        name: kind.name().to_string(),
        reason: halt.reason,
        recovery: halt.recovery,
    }
}
