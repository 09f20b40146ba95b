//! Typed error hierarchy for cube.
//!
//! One enum per subsystem, each variant carrying enough context for the CLI
//! to print an actionable message:
//! - `AdapterError` - tool availability, spawning and process exit failures
//! - `WorktreeError` - git worktree creation and removal
//! - `SessionError` / `DecisionError` / `StateError` - the on-disk stores
//! - `AggregateError` - judge quorum not met
//! - `OrchestratorError` - phase-level failures (cancellation, log files)
//! - `WorkflowError` - what the state machine reports to the CLI

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of why an agent process failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Authentication,
    RateLimited,
    ToolMissing,
    Generic,
}

static AUTH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(not (logged|signed) in|unauthori[sz]ed|invalid api key|authenticat|please (run )?(log ?in|login)|\b401\b)")
        .expect("auth pattern is valid")
});

static RATE_LIMIT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(rate.?limit|too many requests|\b429\b|quota|usage limit|overloaded)")
        .expect("rate limit pattern is valid")
});

static MISSING_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(command not found|no such file or directory|not recognized as)")
        .expect("missing tool pattern is valid")
});

impl FailureKind {
    /// Classify a failure from the last diagnostic line a process printed.
    pub fn classify(line: &str) -> Self {
        if AUTH_PATTERN.is_match(line) {
            FailureKind::Authentication
        } else if RATE_LIMIT_PATTERN.is_match(line) {
            FailureKind::RateLimited
        } else if MISSING_PATTERN.is_match(line) {
            FailureKind::ToolMissing
        } else {
            FailureKind::Generic
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            FailureKind::Authentication => Some("the tool reports it is not authenticated; log in and retry"),
            FailureKind::RateLimited => Some("the tool hit a rate limit; wait and resume the agent"),
            FailureKind::ToolMissing => Some("the tool or one of its dependencies is missing from PATH"),
            FailureKind::Generic => None,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Authentication => "authentication",
            FailureKind::RateLimited => "rate limited",
            FailureKind::ToolMissing => "tool missing",
            FailureKind::Generic => "generic",
        };
        write!(f, "{}", s)
    }
}

fn exit_display(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {}", c),
        None => "a signal".to_string(),
    }
}

fn recovery_display(recovery: &[String]) -> String {
    if recovery.is_empty() {
        String::new()
    } else {
        let lines: Vec<String> = recovery.iter().map(|r| format!("\n  -> {}", r)).collect();
        format!("\nRecovery:{}", lines.concat())
    }
}

/// Errors raised while checking for, spawning or streaming an external CLI.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{kind} is not available: {instructions}")]
    ToolUnavailable { kind: String, instructions: String },

    #[error("Failed to spawn {kind} process ({program}): {source}")]
    Spawn {
        kind: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind} exited with {}: {last_line}", exit_display(.exit_code))]
    ProcessFailure {
        kind: String,
        exit_code: Option<i32>,
        last_line: String,
        failure: FailureKind,
        stderr_tail: Vec<String>,
    },

    #[error("Failed to read {kind} output: {source}")]
    Stream {
        kind: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind} process was terminated by cancellation")]
    Terminated { kind: String },
}

/// Errors from git worktree management.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git {args} failed: {stderr}")]
    Git { args: String, stderr: String },

    #[error("Failed to open git repository at {path}: {source}")]
    Repository {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },

    #[error("Worktree I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Worktree at {path} is on branch '{found}', expected '{expected}'")]
    BranchMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
}

/// Errors from the per-agent session store.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(
        "Session for {agent_id} on task {task_id} is already '{existing}'; refusing to overwrite with '{attempted}'"
    )]
    Conflict {
        agent_id: String,
        task_id: String,
        existing: String,
        attempted: String,
    },

    #[error("Session record at {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Session store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the decision file store.
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("Decision file {path} is invalid: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Decision file {path} already exists; decisions are immutable once written")]
    AlreadyWritten { path: PathBuf },

    #[error("Decision store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from decision aggregation.
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error(
        "Quorum not met for {review_type} review of task {task_id}: {present} of {required} required decisions present (missing: {}){}",
        .missing.join(", "),
        recovery_display(.recovery)
    )]
    QuorumShortfall {
        task_id: String,
        review_type: String,
        present: usize,
        required: usize,
        missing: Vec<String>,
        recovery: Vec<String>,
    },

    #[error(transparent)]
    Decision(#[from] DecisionError),
}

/// Errors from the workflow state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Workflow state at {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Workflow state I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Phase for task {task_id} cannot move from {from} to {to} without an explicit reset")]
    NonMonotonic { task_id: String, from: u32, to: u32 },

    #[error("Workflow path for task {task_id} is already decided as {path}")]
    PathAlreadyDecided { task_id: String, path: String },

    #[error("Phase {phase} does not exist on the {path} path (last phase is {last})")]
    UnknownPhase { phase: u32, path: String, last: u32 },
}

/// Errors from running a phase of agents.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Phase {phase} of task {task_id} was cancelled")]
    Cancelled { task_id: String, phase: u32 },

    #[error("Phase {phase} of task {task_id} has no agents to run")]
    NoAgents { task_id: String, phase: u32 },

    #[error("Phase {phase} of task {task_id} assigns agent '{agent_id}' more than once")]
    DuplicateAgent {
        task_id: String,
        phase: u32,
        agent_id: String,
    },

    #[error("Phase {phase} of task {task_id}: {reason}")]
    InvalidAgent {
        task_id: String,
        phase: u32,
        reason: String,
    },
}

/// Errors reported by the workflow state machine.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Phase {phase} ({name}) halted: {reason}{}", recovery_display(.recovery))]
    Halted {
        phase: u32,
        name: String,
        reason: String,
        recovery: Vec<String>,
    },

    #[error("Phase {phase} ({name}) was cancelled; no results from this attempt were kept. Re-run with `cube run {task_id}`")]
    Cancelled {
        task_id: String,
        phase: u32,
        name: String,
    },

    #[error("Task {task_id} is {status}; nothing left to run")]
    Terminal { task_id: String, status: String },

    #[error("No workflow state for task {0}; start it with `cube run {0} --prompt-file <file>`")]
    UnknownTask(String),

    #[error("Task prompt missing at {0}")]
    MissingPrompt(PathBuf),

    #[error(transparent)]
    Quorum(#[from] AggregateError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Decision(#[from] DecisionError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
