//! Running a phase: one agent process per assignment, all concurrently.

pub mod runner;
pub mod sink;

pub use runner::Orchestrator;
pub use sink::{ChannelSink, MessageSink, NullSink, OrchestratorEvent};

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::agent::{AgentIdentity, RunStatus};
use crate::errors::{AdapterError, FailureKind};

/// One agent to run in a phase.
#[derive(Debug, Clone)]
pub struct AgentAssignment {
    pub identity: AgentIdentity,
    pub prompt: String,
    /// Continue the agent's recorded session if it has one.
    pub resume: bool,
}

impl AgentAssignment {
    pub fn new(identity: AgentIdentity, prompt: impl Into<String>) -> Self {
        Self {
            identity,
            prompt: prompt.into(),
            resume: true,
        }
    }

    pub fn fresh(mut self) -> Self {
        self.resume = false;
        self
    }
}

#[derive(Debug, Clone)]
pub struct PhaseRequest {
    pub task_id: String,
    pub phase: u32,
    pub label: String,
    pub assignments: Vec<AgentAssignment>,
}

/// Why an agent did not succeed.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentFailure {
    UnknownAdapter(String),
    ToolUnavailable(String),
    Workspace(String),
    Session(String),
    Log(String),
    Spawn(String),
    Stream(String),
    Process {
        exit_code: Option<i32>,
        last_line: String,
        kind: FailureKind,
    },
    Cancelled,
}

impl AgentFailure {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AgentFailure::Cancelled)
    }
}

impl From<AdapterError> for AgentFailure {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::ToolUnavailable { instructions, .. } => {
                AgentFailure::ToolUnavailable(instructions)
            }
            AdapterError::Spawn { .. } => AgentFailure::Spawn(err.to_string()),
            AdapterError::ProcessFailure {
                exit_code,
                last_line,
                failure,
                ..
            } => AgentFailure::Process {
                exit_code,
                last_line,
                kind: failure,
            },
            AdapterError::Stream { .. } => AgentFailure::Stream(err.to_string()),
            AdapterError::Terminated { .. } => AgentFailure::Cancelled,
        }
    }
}

impl std::fmt::Display for AgentFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentFailure::UnknownAdapter(kind) => write!(f, "unknown adapter '{}'", kind),
            AgentFailure::ToolUnavailable(instructions) => {
                write!(f, "tool not available. {}", instructions)
            }
            AgentFailure::Workspace(msg) => write!(f, "worktree error: {}", msg),
            AgentFailure::Session(msg) => write!(f, "session error: {}", msg),
            AgentFailure::Log(msg) => write!(f, "log error: {}", msg),
            AgentFailure::Spawn(msg) | AgentFailure::Stream(msg) => write!(f, "{}", msg),
            AgentFailure::Process {
                exit_code,
                last_line,
                kind,
            } => {
                match exit_code {
                    Some(code) => write!(f, "exited with code {}", code)?,
                    None => write!(f, "killed by a signal")?,
                }
                if !last_line.is_empty() {
                    write!(f, ": {}", last_line)?;
                }
                if let Some(hint) = kind.hint() {
                    write!(f, " ({})", hint)?;
                }
                Ok(())
            }
            AgentFailure::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of one agent in a phase.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub agent_id: String,
    pub run_id: Option<Uuid>,
    pub status: RunStatus,
    pub log_path: PathBuf,
    pub worktree: Option<PathBuf>,
    pub session_id: Option<String>,
    pub failure: Option<AgentFailure>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl AgentResult {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub task_id: String,
    pub phase: u32,
    pub label: String,
    pub results: Vec<AgentResult>,
}

impl PhaseOutcome {
    pub fn all_succeeded(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(AgentResult::succeeded)
    }

    pub fn failed(&self) -> Vec<&AgentResult> {
        self.results.iter().filter(|r| !r.succeeded()).collect()
    }

    pub fn result_for(&self, agent_id: &str) -> Option<&AgentResult> {
        self.results.iter().find(|r| r.agent_id == agent_id)
    }
}
