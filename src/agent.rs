//! Agent identities and per-invocation run records.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether an agent writes code or judges it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    #[default]
    Writer,
    Judge,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRole::Writer => write!(f, "writer"),
            AgentRole::Judge => write!(f, "judge"),
        }
    }
}

/// A configured writer or judge.
///
/// Loaded from `[[writers]]` / `[[judges]]` in `.cube/cube.toml`; the role is
/// taken from the table the entry appears in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub model: String,
    /// Registry key of the adapter/parser pair (`claude`, `codex`, ...).
    pub adapter: String,
    #[serde(default, skip)]
    pub role: AgentRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Judges only: skip the initial review, take part in peer review.
    #[serde(default)]
    pub peer_review_only: bool,
    /// Replaces the adapter's default program. First element is the program.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

impl AgentIdentity {
    pub fn new(id: &str, role: AgentRole, adapter: &str, model: &str) -> Self {
        Self {
            id: id.to_string(),
            label: None,
            model: model.to_string(),
            adapter: adapter.to_string(),
            role,
            color: None,
            peer_review_only: false,
            command: None,
        }
    }

    pub fn writer(id: &str, adapter: &str, model: &str) -> Self {
        Self::new(id, AgentRole::Writer, adapter, model)
    }

    pub fn judge(id: &str, adapter: &str, model: &str) -> Self {
        Self::new(id, AgentRole::Judge, adapter, model)
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn with_color(mut self, color: &str) -> Self {
        self.color = Some(color.to_string());
        self
    }

    pub fn with_command(mut self, argv: &[&str]) -> Self {
        self.command = Some(argv.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn peer_review_only(mut self) -> Self {
        self.peer_review_only = true;
        self
    }

    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }

    pub fn color_hint(&self) -> &str {
        self.color.as_deref().unwrap_or(match self.role {
            AgentRole::Writer => "cyan",
            AgentRole::Judge => "magenta",
        })
    }
}

/// Lifecycle status of a single agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// One invocation of one agent within one phase.
///
/// Status moves `Pending -> Running -> Succeeded|Failed`. A process that never
/// started may go straight from `Pending` to `Failed`. Terminal states are final.
#[derive(Debug, Clone)]
pub struct AgentRun {
    pub run_id: Uuid,
    pub agent_id: String,
    pub task_id: String,
    pub phase: u32,
    pub session_id: Option<String>,
    pub log_path: PathBuf,
    status: RunStatus,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl AgentRun {
    pub fn new(agent_id: &str, task_id: &str, phase: u32, log_path: PathBuf) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            phase,
            session_id: None,
            log_path,
            status: RunStatus::Pending,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Returns false if the run was not pending.
    pub fn mark_running(&mut self) -> bool {
        if self.status != RunStatus::Pending {
            return false;
        }
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// Returns false if the run already reached a terminal state.
    pub fn mark_finished(&mut self, succeeded: bool) -> bool {
        if self.status.is_terminal() || (succeeded && self.status != RunStatus::Running) {
            return false;
        }
        self.status = if succeeded {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        self.ended_at = Some(Utc::now());
        true
    }
}

/// Letter shown for the writer at `index` in the configured roster.
pub fn slot_letter(index: usize) -> Option<char> {
    (index < 26).then(|| (b'A' + index as u8) as char)
}

/// Inverse of [`slot_letter`].
pub fn slot_index(letter: char) -> Option<usize> {
    let upper = letter.to_ascii_uppercase();
    upper
        .is_ascii_uppercase()
        .then(|| (upper as u8 - b'A') as usize)
}
