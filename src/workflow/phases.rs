//! Phase numbering per workflow path.
//!
//! Every path shares the first three phases. After the initial review decides
//! the path, later phases are numbered along that path only, so phase 4 means
//! something different on each path.

use std::fmt;

use super::state::WorkflowPath;

/// Phase at which the initial review decides the path.
pub const DECISION_PHASE: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    /// Prepare the writer prompt and the writers' worktrees.
    Generate,
    /// All writers implement the task concurrently.
    Writers,
    /// Judges compare the writers' branches and pick a winner.
    InitialReview,
    /// The chosen writer folds in review feedback and the other branches.
    Synthesis,
    /// Judges review the winner's branch alone.
    PeerReview,
    /// The winner addresses blockers until the judges approve.
    Fix,
    /// Commit, export a patch and optionally open a PR.
    Publish,
}

impl PhaseKind {
    pub fn name(&self) -> &'static str {
        match self {
            PhaseKind::Generate => "generate",
            PhaseKind::Writers => "writers",
            PhaseKind::InitialReview => "initial-review",
            PhaseKind::Synthesis => "synthesis",
            PhaseKind::PeerReview => "peer-review",
            PhaseKind::Fix => "fix",
            PhaseKind::Publish => "publish",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

use PhaseKind::*;

const UNDECIDED: &[PhaseKind] = &[Generate, Writers, InitialReview];
const SINGLE: &[PhaseKind] = &[Generate, Writers, InitialReview, Fix, Publish];
const DUAL_MERGE: &[PhaseKind] = &[Generate, Writers, InitialReview, PeerReview, Fix, Publish];
const DUAL_FEEDBACK: &[PhaseKind] = &[
    Generate,
    Writers,
    InitialReview,
    Synthesis,
    PeerReview,
    Fix,
    Publish,
];

/// Phases of `path`, in order. Phase `n` is `phases(path)[n - 1]`.
pub fn phases(path: WorkflowPath) -> &'static [PhaseKind] {
    match path {
        WorkflowPath::Undecided => UNDECIDED,
        WorkflowPath::Single => SINGLE,
        WorkflowPath::DualMerge => DUAL_MERGE,
        WorkflowPath::DualFeedback => DUAL_FEEDBACK,
    }
}

pub fn phase_kind(path: WorkflowPath, phase: u32) -> Option<PhaseKind> {
    let index = usize::try_from(phase).ok()?.checked_sub(1)?;
    phases(path).get(index).copied()
}

pub fn last_phase(path: WorkflowPath) -> u32 {
    phases(path).len() as u32
}

pub fn phase_number(path: WorkflowPath, kind: PhaseKind) -> Option<u32> {
    phases(path)
        .iter()
        .position(|k| *k == kind)
        .map(|i| i as u32 + 1)
}
