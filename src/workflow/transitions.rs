//! Pure phase transitions: `(state, phase results) -> next state`.
//!
//! Nothing here touches the disk or spawns anything. The machine gathers the
//! results of a phase, calls [`apply`], and persists whatever comes back.

use crate::agent::{AgentIdentity, slot_letter};
use crate::decision::{DecisionKind, Verdict, Winner};
use crate::orchestrator::PhaseOutcome;

use super::phases::{PhaseKind, last_phase, phase_kind};
use super::state::{TaskStatus, WorkflowPath, WorkflowState};

/// What a phase produced.
#[derive(Debug, Clone, Copy)]
pub enum PhaseInput<'a> {
    Generated,
    Writers {
        writers: &'a [AgentIdentity],
        outcome: &'a PhaseOutcome,
    },
    InitialReview {
        writers: &'a [AgentIdentity],
        verdict: &'a Verdict,
    },
    Synthesis(&'a PhaseOutcome),
    PeerReview(&'a Verdict),
    Fix {
        verdict: &'a Verdict,
        rounds: u32,
    },
    Published,
}

impl PhaseInput<'_> {
    fn kind(&self) -> PhaseKind {
        match self {
            PhaseInput::Generated => PhaseKind::Generate,
            PhaseInput::Writers { .. } => PhaseKind::Writers,
            PhaseInput::InitialReview { .. } => PhaseKind::InitialReview,
            PhaseInput::Synthesis(_) => PhaseKind::Synthesis,
            PhaseInput::PeerReview(_) => PhaseKind::PeerReview,
            PhaseInput::Fix { .. } => PhaseKind::Fix,
            PhaseInput::Published => PhaseKind::Publish,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub state: WorkflowState,
    /// Set when this transition decided the path.
    pub path_change: Option<WorkflowPath>,
}

/// The phase cannot complete. The state stays where it is.
#[derive(Debug, Clone, PartialEq)]
pub struct Halt {
    pub reason: String,
    pub recovery: Vec<String>,
}

impl Halt {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            recovery: Vec::new(),
        }
    }

    fn hint(mut self, hint: impl Into<String>) -> Self {
        self.recovery.push(hint.into());
        self
    }
}

pub fn apply(state: &WorkflowState, input: PhaseInput<'_>) -> Result<Transition, Halt> {
    let task_id = state.task_id.as_str();
    if state.is_terminal() {
        return Err(Halt::new(format!("task {} is {}", task_id, state.status)));
    }
    let expected = phase_kind(state.path, state.current_phase);
    if expected != Some(input.kind()) {
        return Err(Halt::new(format!(
            "phase {} on the {} path is {}, not {}",
            state.current_phase,
            state.path,
            expected.map(|k| k.name()).unwrap_or("unknown"),
            input.kind()
        ))
        .hint(format!("cube status {}", task_id)));
    }

    let mut next = state.clone();
    let mut path_change = None;

    match input {
        PhaseInput::Generated | PhaseInput::PeerReview(_) => {}

        PhaseInput::Writers { writers, outcome } => {
            let pending: Vec<&AgentIdentity> = writers
                .iter()
                .filter(|w| {
                    !state.phase_agents_done.contains(&w.id)
                        && !outcome.result_for(&w.id).is_some_and(|r| r.succeeded())
                })
                .collect();
            if !pending.is_empty() {
                let details: Vec<String> = pending
                    .iter()
                    .map(|w| match outcome.result_for(&w.id).and_then(|r| r.failure.as_ref()) {
                        Some(failure) => format!("{} ({})", w.id, failure),
                        None => format!("{} (did not run)", w.id),
                    })
                    .collect();
                let mut halt = Halt::new(format!(
                    "{} of {} writers did not finish: {}",
                    pending.len(),
                    writers.len(),
                    details.join("; ")
                ))
                .hint(format!(
                    "cube run {}  (re-runs only {})",
                    task_id,
                    pending.iter().map(|w| w.id.as_str()).collect::<Vec<_>>().join(", ")
                ));
                for writer in pending.iter().filter(|w| {
                    outcome
                        .result_for(&w.id)
                        .is_some_and(|r| r.session_id.is_some())
                }) {
                    halt = halt.hint(format!(
                        "cube resume {} {} \"Continue the task where you left off\"",
                        task_id, writer.id
                    ));
                }
                return Err(halt);
            }
        }

        PhaseInput::InitialReview { writers, verdict } => {
            let (path, winner) = choose_path(task_id, writers, verdict)?;
            next.decide_path(path, &winner)
                .map_err(|e| Halt::new(e.to_string()))?;
            path_change = Some(path);
        }

        PhaseInput::Synthesis(outcome) => {
            if !outcome.all_succeeded() {
                let winner = state.winner.as_deref().unwrap_or("<winner>");
                let detail = outcome
                    .failed()
                    .first()
                    .and_then(|r| r.failure.as_ref())
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "no result".to_string());
                return Err(Halt::new(format!("synthesis by {} failed: {}", winner, detail))
                    .hint(format!("cube run {}", task_id))
                    .hint(format!(
                        "cube resume {} {} \"Apply the review feedback in .cube/tasks/{}/synthesis.md\"",
                        task_id, winner, task_id
                    )));
            }
        }

        PhaseInput::Fix { verdict, rounds } => {
            if !verdict.approved() {
                let winner = state.winner.as_deref().unwrap_or("<winner>");
                let waiting: Vec<&str> = verdict
                    .decisions
                    .iter()
                    .filter(|d| d.decision != DecisionKind::Approved)
                    .map(|d| d.judge.as_str())
                    .collect();
                let mut reason = format!(
                    "not approved after {} fix round(s); still waiting on {}",
                    rounds,
                    waiting.join(", ")
                );
                if !verdict.blockers.is_empty() {
                    reason.push_str(&format!("; blockers: {}", verdict.blockers.join(" | ")));
                }
                return Err(Halt::new(reason)
                    .hint(format!(
                        "cube resume {} {} \"Address the remaining review blockers\"",
                        task_id, winner
                    ))
                    .hint(format!("cube run {}  (runs more fix rounds)", task_id))
                    .hint(format!(
                        "cube decide {} <judge> --peer --decision APPROVED  (record an override by hand)",
                        task_id
                    )));
            }
        }

        PhaseInput::Published => {
            if next.history.last() != Some(&next.current_phase) {
                next.history.push(next.current_phase);
            }
            next.mark(TaskStatus::Published);
            return Ok(Transition {
                state: next,
                path_change,
            });
        }
    }

    let following = next.current_phase + 1;
    if following > last_phase(next.path) {
        return Err(Halt::new(format!(
            "phase {} is the last phase of the {} path",
            next.current_phase, next.path
        )));
    }
    next.complete_phase(following)
        .map_err(|e| Halt::new(e.to_string()))?;
    Ok(Transition {
        state: next,
        path_change,
    })
}

/// Pick the path and the writer that goes forward.
///
/// One writer always takes the single path. With several writers, a clear
/// winner that every judge approved is merged as is; anything else goes
/// through synthesis, with slot A as the target on a tie.
pub fn choose_path(
    task_id: &str,
    writers: &[AgentIdentity],
    verdict: &Verdict,
) -> Result<(WorkflowPath, String), Halt> {
    match writers {
        [] => Err(Halt::new("no writers are configured").hint("add a [[writers]] entry to .cube/cube.toml")),
        [only] => Ok((WorkflowPath::Single, only.id.clone())),
        _ => match verdict.winner {
            Winner::Writer(index) => {
                let Some(writer) = writers.get(index) else {
                    let letter = slot_letter(index).map(String::from).unwrap_or_else(|| index.to_string());
                    return Err(Halt::new(format!(
                        "judges voted for writer {} but only {} writers are configured",
                        letter,
                        writers.len()
                    ))
                    .hint(format!(
                        "cube decide {} <judge> --decision APPROVED --winner A  (fix the bad vote)",
                        task_id
                    )));
                };
                let path = if verdict.approved() {
                    WorkflowPath::DualMerge
                } else {
                    WorkflowPath::DualFeedback
                };
                Ok((path, writer.id.clone()))
            }
            Winner::Tie => Ok((WorkflowPath::DualFeedback, writers[0].id.clone())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::RunStatus;
    use crate::decision::{Decision, ReviewType, tally_winner, union_blockers};
    use crate::orchestrator::{AgentFailure, AgentResult};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn writers(n: usize) -> Vec<AgentIdentity> {
        (0..n)
            .map(|i| AgentIdentity::writer(&format!("writer_{}", i), "claude", "m"))
            .collect()
    }

    fn verdict(votes: &[(Winner, DecisionKind)]) -> Verdict {
        let decisions: Vec<Decision> = votes
            .iter()
            .enumerate()
            .map(|(i, (w, k))| {
                let blockers: &[&str] = if *k == DecisionKind::Approved {
                    &[]
                } else {
                    &["missing tests"]
                };
                Decision::new(&format!("j{}", i), "t1", ReviewType::Initial, *k, *w)
                    .with_blockers(blockers)
            })
            .collect();
        let (winner, tally) = tally_winner(&decisions);
        Verdict {
            task_id: "t1".into(),
            review_type: ReviewType::Initial,
            winner,
            tally,
            blockers: union_blockers(&decisions),
            average_scores: BTreeMap::new(),
            decisions,
            missing: vec![],
            invalid: vec![],
        }
    }

    fn result(agent: &str, ok: bool) -> AgentResult {
        AgentResult {
            agent_id: agent.into(),
            run_id: None,
            status: if ok { RunStatus::Succeeded } else { RunStatus::Failed },
            log_path: PathBuf::from(format!("{}.log", agent)),
            worktree: None,
            session_id: (!ok).then(|| "s-1".to_string()),
            failure: (!ok).then(|| AgentFailure::Process {
                exit_code: Some(1),
                last_line: "boom".into(),
                kind: crate::errors::FailureKind::Generic,
            }),
            started_at: None,
            ended_at: None,
        }
    }

    fn outcome(results: Vec<AgentResult>) -> PhaseOutcome {
        PhaseOutcome {
            task_id: "t1".into(),
            phase: 2,
            label: "writers".into(),
            results,
        }
    }

    fn at_phase(phase: u32, path: WorkflowPath) -> WorkflowState {
        let mut state = WorkflowState::new("t1", None);
        state.current_phase = phase;
        state.path = path;
        state.winner = path.is_decided().then(|| "writer_0".to_string());
        state
    }

    #[test]
    fn test_generate_advances() {
        let state = WorkflowState::new("t1", None);
        let t = apply(&state, PhaseInput::Generated).unwrap();
        assert_eq!(t.state.current_phase, 2);
        assert_eq!(t.state.history, vec![1]);
        assert!(t.path_change.is_none());
    }

    #[test]
    fn test_partial_writer_failure_halts() {
        let state = at_phase(2, WorkflowPath::Undecided);
        let ws = writers(2);
        let out = outcome(vec![result("writer_0", true), result("writer_1", false)]);
        let halt = apply(&state, PhaseInput::Writers { writers: &ws, outcome: &out }).unwrap_err();
        assert!(halt.reason.contains("1 of 2 writers"));
        assert!(halt.reason.contains("writer_1"));
        assert!(halt.recovery.iter().any(|r| r.contains("cube resume t1 writer_1")));
    }

    #[test]
    fn test_writers_finished_in_earlier_attempt_count() {
        let mut state = at_phase(2, WorkflowPath::Undecided);
        state.phase_agents_done = vec!["writer_0".into()];
        let ws = writers(2);
        let out = outcome(vec![result("writer_1", true)]);
        let t = apply(&state, PhaseInput::Writers { writers: &ws, outcome: &out }).unwrap();
        assert_eq!(t.state.current_phase, 3);
        assert!(t.state.phase_agents_done.is_empty());
    }

    #[test]
    fn test_initial_review_path_choice() {
        let state = at_phase(3, WorkflowPath::Undecided);
        let two = writers(2);

        let v = verdict(&[
            (Winner::Writer(1), DecisionKind::Approved),
            (Winner::Writer(1), DecisionKind::Approved),
        ]);
        let t = apply(&state, PhaseInput::InitialReview { writers: &two, verdict: &v }).unwrap();
        assert_eq!(t.path_change, Some(WorkflowPath::DualMerge));
        assert_eq!(t.state.winner.as_deref(), Some("writer_1"));
        assert_eq!(t.state.current_phase, 4);

        let v = verdict(&[
            (Winner::Writer(0), DecisionKind::Approved),
            (Winner::Writer(0), DecisionKind::RequestChanges),
        ]);
        let t = apply(&state, PhaseInput::InitialReview { writers: &two, verdict: &v }).unwrap();
        assert_eq!(t.path_change, Some(WorkflowPath::DualFeedback));

        let v = verdict(&[
            (Winner::Writer(0), DecisionKind::Approved),
            (Winner::Writer(1), DecisionKind::Approved),
        ]);
        let t = apply(&state, PhaseInput::InitialReview { writers: &two, verdict: &v }).unwrap();
        assert_eq!(t.path_change, Some(WorkflowPath::DualFeedback));
        assert_eq!(t.state.winner.as_deref(), Some("writer_0"));

        let one = writers(1);
        let t = apply(&state, PhaseInput::InitialReview { writers: &one, verdict: &v }).unwrap();
        assert_eq!(t.path_change, Some(WorkflowPath::Single));
    }

    #[test]
    fn test_vote_for_unknown_slot_halts() {
        let state = at_phase(3, WorkflowPath::Undecided);
        let v = verdict(&[(Winner::Writer(3), DecisionKind::Approved)]);
        let halt = apply(&state, PhaseInput::InitialReview { writers: &writers(2), verdict: &v }).unwrap_err();
        assert!(halt.reason.contains("writer D"));
    }

    #[test]
    fn test_fix_requires_approval() {
        let state = at_phase(5, WorkflowPath::DualMerge);
        let v = verdict(&[
            (Winner::Tie, DecisionKind::Approved),
            (Winner::Tie, DecisionKind::RequestChanges),
        ]);
        let halt = apply(&state, PhaseInput::Fix { verdict: &v, rounds: 2 }).unwrap_err();
        assert!(halt.reason.contains("j1"));
        assert!(halt.reason.contains("missing tests"));

        let v = verdict(&[(Winner::Tie, DecisionKind::Approved)]);
        let t = apply(&state, PhaseInput::Fix { verdict: &v, rounds: 0 }).unwrap();
        assert_eq!(t.state.current_phase, 6);
    }

    #[test]
    fn test_publish_is_terminal() {
        let state = at_phase(5, WorkflowPath::Single);
        let t = apply(&state, PhaseInput::Published).unwrap();
        assert_eq!(t.state.status, TaskStatus::Published);
        assert_eq!(t.state.current_phase, 5);
        assert!(apply(&t.state, PhaseInput::Published).is_err());
    }

    #[test]
    fn test_wrong_phase_input_halts() {
        let state = at_phase(4, WorkflowPath::DualFeedback);
        let v = verdict(&[(Winner::Tie, DecisionKind::Approved)]);
        assert!(apply(&state, PhaseInput::PeerReview(&v)).is_err());
        let out = outcome(vec![result("writer_0", true)]);
        assert_eq!(apply(&state, PhaseInput::Synthesis(&out)).unwrap().state.current_phase, 5);
    }
}
