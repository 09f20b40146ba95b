//! Combining the panel's decisions into a verdict.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use tracing::{info, warn};

use super::store::DecisionStore;
use super::types::{Decision, DecisionKind, ReviewType, Winner};
use crate::agent::AgentIdentity;
use crate::errors::{AggregateError, DecisionError};
use crate::util::normalize_text;

/// A judge whose decision file exists but could not be used.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidDecision {
    pub judge: String,
    pub path: PathBuf,
    pub message: String,
}

/// Aggregated outcome of one review round.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub task_id: String,
    pub review_type: ReviewType,
    pub winner: Winner,
    pub tally: BTreeMap<Winner, usize>,
    pub decisions: Vec<Decision>,
    /// Judges with no decision file.
    pub missing: Vec<String>,
    /// Judges whose decision file could not be parsed.
    pub invalid: Vec<InvalidDecision>,
    /// Union of blocker issues, deduplicated by normalized text.
    pub blockers: Vec<String>,
    pub average_scores: BTreeMap<String, f64>,
}

impl Verdict {
    /// Every present decision approves.
    pub fn approved(&self) -> bool {
        !self.decisions.is_empty()
            && self
                .decisions
                .iter()
                .all(|d| d.decision == DecisionKind::Approved)
    }

    pub fn judges_with(&self, kind: DecisionKind) -> Vec<&str> {
        self.decisions
            .iter()
            .filter(|d| d.decision == kind)
            .map(|d| d.judge.as_str())
            .collect()
    }

    pub fn rejected(&self) -> Vec<&str> {
        self.judges_with(DecisionKind::Rejected)
    }

    /// One-line summary for logs and status output.
    pub fn summary(&self) -> String {
        let votes: Vec<String> = self
            .tally
            .iter()
            .map(|(w, n)| format!("{}={}", w, n))
            .collect();
        format!(
            "{} review: winner {} ({}), {} approved, {} requested changes, {} rejected, {} blocker(s)",
            self.review_type,
            self.winner,
            votes.join(" "),
            self.judges_with(DecisionKind::Approved).len(),
            self.judges_with(DecisionKind::RequestChanges).len(),
            self.rejected().len(),
            self.blockers.len()
        )
    }
}

/// Plurality vote over the decisions present. A shared top count is a tie.
pub fn tally_winner(decisions: &[Decision]) -> (Winner, BTreeMap<Winner, usize>) {
    let mut tally: BTreeMap<Winner, usize> = BTreeMap::new();
    for decision in decisions {
        *tally.entry(decision.winner).or_default() += 1;
    }
    let Some(top) = tally.values().copied().max() else {
        return (Winner::Tie, tally);
    };
    let leaders: Vec<Winner> = tally
        .iter()
        .filter(|(_, n)| **n == top)
        .map(|(w, _)| *w)
        .collect();
    let winner = match leaders.as_slice() {
        [single] => *single,
        _ => Winner::Tie,
    };
    (winner, tally)
}

/// Union of every decision's blocker issues, first wording wins.
pub fn union_blockers(decisions: &[Decision]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut blockers = Vec::new();
    for issue in decisions.iter().flat_map(|d| d.blocker_issues.iter()) {
        let key = normalize_text(issue);
        if key.is_empty() {
            continue;
        }
        if seen.insert(key) {
            blockers.push(issue.trim().to_string());
        }
    }
    blockers
}

fn average_scores(decisions: &[Decision]) -> BTreeMap<String, f64> {
    let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for (category, score) in decisions.iter().flat_map(|d| d.scores.iter()) {
        let entry = sums.entry(category.clone()).or_default();
        entry.0 += score;
        entry.1 += 1;
    }
    sums.into_iter()
        .map(|(category, (sum, n))| (category, sum / n as f64))
        .collect()
}

pub struct DecisionAggregator {
    store: DecisionStore,
    min_decisions: usize,
}

impl DecisionAggregator {
    pub fn new(store: DecisionStore, min_decisions: usize) -> Self {
        Self {
            store,
            min_decisions: min_decisions.max(1),
        }
    }

    pub fn store(&self) -> &DecisionStore {
        &self.store
    }

    pub fn min_decisions(&self) -> usize {
        self.min_decisions
    }

    /// Collect `judges`' decisions for a review and combine them.
    ///
    /// Fails with `QuorumShortfall` when fewer than the configured minimum
    /// are usable.
    pub fn aggregate(
        &self,
        task_id: &str,
        review_type: ReviewType,
        judges: &[AgentIdentity],
    ) -> Result<Verdict, AggregateError> {
        let mut decisions = Vec::new();
        let mut missing = Vec::new();
        let mut invalid = Vec::new();

        for judge in judges {
            match self.store.read(task_id, review_type, &judge.id) {
                Ok(Some(decision)) => decisions.push(decision),
                Ok(None) => missing.push(judge.id.clone()),
                Err(DecisionError::Corrupt { path, message }) => {
                    warn!(judge = %judge.id, path = %path.display(), %message, "invalid decision file");
                    invalid.push(InvalidDecision {
                        judge: judge.id.clone(),
                        path,
                        message,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        let required = self.min_decisions;
        if decisions.len() < required {
            let mut recovery: Vec<String> = missing
                .iter()
                .map(|judge| {
                    format!(
                        "cube resume {} {} \"Write your {} decision JSON to {}\"",
                        task_id,
                        judge,
                        review_type,
                        self.store.path(task_id, review_type, judge).display()
                    )
                })
                .collect();
            recovery.extend(invalid.iter().map(|bad| {
                format!(
                    "fix or delete {} ({}), then re-run `cube run {}`",
                    bad.path.display(),
                    bad.message,
                    task_id
                )
            }));
            recovery.push(format!(
                "or record a decision by hand: cube decide {} <judge> --decision APPROVED --winner A",
                task_id
            ));
            let mut unusable = missing.clone();
            unusable.extend(invalid.iter().map(|i| format!("{} (invalid)", i.judge)));
            return Err(AggregateError::QuorumShortfall {
                task_id: task_id.to_string(),
                review_type: review_type.to_string(),
                present: decisions.len(),
                required,
                missing: unusable,
                recovery,
            });
        }

        let (winner, tally) = tally_winner(&decisions);
        let verdict = Verdict {
            task_id: task_id.to_string(),
            review_type,
            winner,
            tally,
            blockers: union_blockers(&decisions),
            average_scores: average_scores(&decisions),
            decisions,
            missing,
            invalid,
        };
        info!(task_id, summary = %verdict.summary(), "aggregated decisions");
        Ok(verdict)
    }
}
