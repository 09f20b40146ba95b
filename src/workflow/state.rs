//! Persisted per-task workflow progress.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::phases::{DECISION_PHASE, last_phase};
use crate::errors::StateError;
use crate::util::atomic_write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowPath {
    #[default]
    Undecided,
    Single,
    DualMerge,
    DualFeedback,
}

impl WorkflowPath {
    pub fn is_decided(&self) -> bool {
        *self != WorkflowPath::Undecided
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowPath::Undecided => "UNDECIDED",
            WorkflowPath::Single => "SINGLE",
            WorkflowPath::DualMerge => "DUAL_MERGE",
            WorkflowPath::DualFeedback => "DUAL_FEEDBACK",
        }
    }
}

impl fmt::Display for WorkflowPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Active,
    Published,
    Abandoned,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        *self != TaskStatus::Active
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Active => write!(f, "active"),
            TaskStatus::Published => write!(f, "published"),
            TaskStatus::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Progress of one task. Unknown fields in the file are ignored so older
/// binaries can read state written by newer ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub task_id: String,
    pub current_phase: u32,
    #[serde(default)]
    pub path: WorkflowPath,
    /// Agent id of the writer whose branch goes forward.
    #[serde(default)]
    pub winner: Option<String>,
    /// Completed phase numbers, in completion order.
    #[serde(default)]
    pub history: Vec<u32>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    /// Agents that already finished the current phase in an earlier attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phase_agents_done: Vec<String>,
    /// Fix rounds run so far, across all attempts.
    #[serde(default)]
    pub fix_rounds: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(task_id: &str, base_branch: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.to_string(),
            current_phase: 1,
            path: WorkflowPath::Undecided,
            winner: None,
            history: Vec::new(),
            status: TaskStatus::Active,
            base_branch,
            phase_agents_done: Vec::new(),
            fix_rounds: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record the current phase as done and move to `next`.
    pub fn complete_phase(&mut self, next: u32) -> Result<(), StateError> {
        if next <= self.current_phase {
            return Err(StateError::NonMonotonic {
                task_id: self.task_id.clone(),
                from: self.current_phase,
                to: next,
            });
        }
        if self.history.last() != Some(&self.current_phase) {
            self.history.push(self.current_phase);
        }
        self.current_phase = next;
        self.phase_agents_done.clear();
        self.touch();
        Ok(())
    }

    /// Fix the path and winner. Allowed once per task.
    pub fn decide_path(&mut self, path: WorkflowPath, winner: &str) -> Result<(), StateError> {
        if self.path.is_decided() {
            return Err(StateError::PathAlreadyDecided {
                task_id: self.task_id.clone(),
                path: self.path.to_string(),
            });
        }
        self.path = path;
        self.winner = Some(winner.to_string());
        self.touch();
        Ok(())
    }

    /// Move back to `phase`, forgetting later history.
    ///
    /// Once the path is decided, the phases that decided it cannot be re-run.
    pub fn reset_to(&mut self, phase: u32) -> Result<(), StateError> {
        let last = last_phase(self.path);
        if phase == 0 || phase > last {
            return Err(StateError::UnknownPhase {
                phase,
                path: self.path.to_string(),
                last,
            });
        }
        if self.path.is_decided() && phase <= DECISION_PHASE {
            return Err(StateError::PathAlreadyDecided {
                task_id: self.task_id.clone(),
                path: self.path.to_string(),
            });
        }
        self.current_phase = phase;
        self.history.retain(|p| *p < phase);
        self.phase_agents_done.clear();
        self.status = TaskStatus::Active;
        self.touch();
        Ok(())
    }

    pub fn mark(&mut self, status: TaskStatus) {
        self.status = status;
        self.touch();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// One JSON file per task under `.cube/state/`.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", task_id))
    }

    pub fn load(&self, task_id: &str) -> Result<Option<WorkflowState>, StateError> {
        read_state(&self.path(task_id))
    }

    /// Persist `state`, refusing to move the phase backwards or change a
    /// decided path relative to what is on disk.
    pub fn save(&self, state: &WorkflowState) -> Result<(), StateError> {
        if let Some(existing) = self.load(&state.task_id)? {
            if state.current_phase < existing.current_phase {
                return Err(StateError::NonMonotonic {
                    task_id: state.task_id.clone(),
                    from: existing.current_phase,
                    to: state.current_phase,
                });
            }
            if existing.path.is_decided() && existing.path != state.path {
                return Err(StateError::PathAlreadyDecided {
                    task_id: state.task_id.clone(),
                    path: existing.path.to_string(),
                });
            }
        }
        self.write(state)
    }

    /// Persist a state produced by [`WorkflowState::reset_to`].
    pub fn save_reset(&self, state: &WorkflowState) -> Result<(), StateError> {
        self.write(state)
    }

    /// Every task with a state file, sorted by task id. Unreadable files are
    /// returned as errors so callers can report them.
    pub fn list(&self) -> Result<Vec<Result<WorkflowState, StateError>>, StateError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StateError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        Ok(paths
            .iter()
            .filter_map(|p| read_state(p).transpose())
            .collect())
    }

    pub fn remove(&self, task_id: &str) -> Result<bool, StateError> {
        let path = self.path(task_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StateError::Io { path, source }),
        }
    }

    fn write(&self, state: &WorkflowState) -> Result<(), StateError> {
        let path = self.path(&state.task_id);
        let json = serde_json::to_vec_pretty(state).map_err(|e| StateError::Corrupt {
            path: path.clone(),
            message: e.to_string(),
        })?;
        atomic_write(&path, &json).map_err(|source| StateError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(
            task_id = %state.task_id,
            phase = state.current_phase,
            path = %state.path,
            "saved workflow state"
        );
        Ok(())
    }
}

fn read_state(path: &Path) -> Result<Option<WorkflowState>, StateError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StateError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&content).map(Some).map_err(|e| {
        warn!(path = %path.display(), error = %e, "workflow state does not parse");
        StateError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_complete_phase_is_monotonic() {
        let mut state = WorkflowState::new("t1", None);
        state.complete_phase(2).unwrap();
        state.complete_phase(3).unwrap();
        assert_eq!(state.history, vec![1, 2]);
        assert!(matches!(
            state.complete_phase(3),
            Err(StateError::NonMonotonic { from: 3, to: 3, .. })
        ));
    }

    #[test]
    fn test_path_decided_once() {
        let mut state = WorkflowState::new("t1", None);
        state.decide_path(WorkflowPath::DualMerge, "writer_a").unwrap();
        assert!(state.decide_path(WorkflowPath::Single, "writer_b").is_err());
        assert_eq!(state.winner.as_deref(), Some("writer_a"));
    }

    #[test]
    fn test_reset_rules() {
        let mut state = WorkflowState::new("t1", None);
        state.complete_phase(2).unwrap();
        state.complete_phase(3).unwrap();
        state.reset_to(2).unwrap();
        assert_eq!(state.current_phase, 2);
        assert_eq!(state.history, vec![1]);

        state.complete_phase(3).unwrap();
        state.decide_path(WorkflowPath::DualMerge, "writer_a").unwrap();
        state.complete_phase(4).unwrap();
        state.complete_phase(5).unwrap();
        assert!(matches!(state.reset_to(3), Err(StateError::PathAlreadyDecided { .. })));
        assert!(matches!(state.reset_to(9), Err(StateError::UnknownPhase { last: 6, .. })));
        state.reset_to(4).unwrap();
        assert_eq!(state.history, vec![1, 2, 3]);
    }

    #[test]
    fn test_store_round_trip_and_monotonic_save() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.load("t1").unwrap().is_none());

        let mut state = WorkflowState::new("t1", Some("main".into()));
        state.complete_phase(2).unwrap();
        store.save(&state).unwrap();
        assert_eq!(store.load("t1").unwrap().unwrap(), state);

        let stale = WorkflowState::new("t1", None);
        assert!(matches!(store.save(&stale), Err(StateError::NonMonotonic { .. })));
        store.save_reset(&stale).unwrap();
        assert_eq!(store.load("t1").unwrap().unwrap().current_phase, 1);
    }

    #[test]
    fn test_unknown_fields_ignored_and_corrupt_reported() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        std::fs::write(
            store.path("t1"),
            r#"{"task_id":"t1","current_phase":4,"path":"DUAL_MERGE","winner":"writer_b",
                "history":[1,2,3],"created_at":"2026-01-01T00:00:00Z",
                "updated_at":"2026-01-01T00:00:00Z","dashboard_hint":"x"}"#,
        )
        .unwrap();
        let state = store.load("t1").unwrap().unwrap();
        assert_eq!(state.path, WorkflowPath::DualMerge);
        assert_eq!(state.status, TaskStatus::Active);

        std::fs::write(store.path("t2"), "{not json").unwrap();
        match store.load("t2") {
            Err(StateError::Corrupt { path, .. }) => assert!(path.ends_with("t2.json")),
            other => panic!("expected corrupt, got {other:?}"),
        }
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].is_ok());
        assert!(listed[1].is_err());
    }
}
