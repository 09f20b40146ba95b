use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sink::{MessageSink, OrchestratorEvent};
use super::{AgentAssignment, AgentFailure, AgentResult, PhaseOutcome, PhaseRequest};
use crate::adapters::{AdapterRegistry, Invocation, ProcessRegistry};
use crate::agent::AgentRun;
use crate::errors::{AdapterError, OrchestratorError};
use crate::session::{SessionRecord, SessionStore};
use crate::util::validate_id;
use crate::worktree::WorktreeManager;

/// Runs the agents of one phase concurrently.
///
/// Every agent gets its own worktree, log file and process. One agent's
/// failure never stops its siblings. Cancelling a phase kills every process
/// it started and rolls back the session records it wrote.
pub struct Orchestrator {
    registry: AdapterRegistry,
    worktrees: Arc<WorktreeManager>,
    sessions: SessionStore,
    processes: ProcessRegistry,
    logs_dir: PathBuf,
    preflight: bool,
}

/// Session records as they were before the phase first touched them.
#[derive(Default)]
struct SessionJournal {
    entries: Mutex<Vec<(String, Option<SessionRecord>)>>,
}

impl SessionJournal {
    fn note(&self, agent_id: &str, previous: Option<SessionRecord>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if !entries.iter().any(|(id, _)| id == agent_id) {
            entries.push((agent_id.to_string(), previous));
        }
    }

    fn rollback(&self, sessions: &SessionStore, task_id: &str) {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for (agent_id, previous) in entries.iter().rev() {
            if let Err(e) = sessions.restore(agent_id, task_id, previous.as_ref()) {
                warn!(agent_id = %agent_id, error = %e, "failed to roll back session record");
            }
        }
    }
}

/// Append-only raw output log for one agent run.
struct AgentLog {
    file: tokio::fs::File,
    path: PathBuf,
    broken: bool,
}

impl AgentLog {
    async fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            broken: false,
        })
    }

    async fn line(&mut self, line: &str) {
        if self.broken {
            return;
        }
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        if let Err(e) = self.file.write_all(buf.as_bytes()).await {
            warn!(path = %self.path.display(), error = %e, "agent log write failed; further output not logged");
            self.broken = true;
        }
    }

    async fn note(&mut self, note: &str) {
        self.line(&format!("# cube: {}", note)).await;
    }
}

/// What a finished agent run produced.
struct RunRecord {
    run: AgentRun,
    worktree: Option<PathBuf>,
    failure: Option<AgentFailure>,
}

impl Orchestrator {
    pub fn new(
        registry: AdapterRegistry,
        worktrees: Arc<WorktreeManager>,
        sessions: SessionStore,
        logs_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            worktrees,
            sessions,
            processes: ProcessRegistry::new(),
            logs_dir: logs_dir.into(),
            preflight: true,
        }
    }

    /// Skip the installed-tool check before spawning.
    pub fn with_preflight(mut self, preflight: bool) -> Self {
        self.preflight = preflight;
        self
    }

    pub fn processes(&self) -> &ProcessRegistry {
        &self.processes
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn worktrees(&self) -> &Arc<WorktreeManager> {
        &self.worktrees
    }

    pub fn log_path(&self, task_id: &str, phase: u32, agent_id: &str) -> PathBuf {
        self.logs_dir
            .join(task_id)
            .join(format!("phase-{}-{}.log", phase, agent_id))
    }

    /// Run every assignment of `request` concurrently and wait for all of them.
    ///
    /// Returns one result per assignment, in request order. If `cancel` fires,
    /// all processes are killed, session writes are rolled back and
    /// `OrchestratorError::Cancelled` is returned instead.
    pub async fn run_phase(
        &self,
        request: PhaseRequest,
        sink: Arc<dyn MessageSink>,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutcome, OrchestratorError> {
        let PhaseRequest {
            task_id,
            phase,
            label,
            assignments,
        } = request;
        if assignments.is_empty() {
            return Err(OrchestratorError::NoAgents { task_id, phase });
        }
        // Each id owns one worktree and one log file for the phase.
        let mut seen = HashSet::new();
        for assignment in &assignments {
            let agent_id = &assignment.identity.id;
            if let Err(reason) = validate_id("agent", agent_id) {
                return Err(OrchestratorError::InvalidAgent { task_id, phase, reason });
            }
            if !seen.insert(agent_id.as_str()) {
                return Err(OrchestratorError::DuplicateAgent {
                    task_id,
                    phase,
                    agent_id: agent_id.clone(),
                });
            }
        }

        info!(task_id = %task_id, phase, label = %label, agents = assignments.len(), "starting phase");
        sink.emit(OrchestratorEvent::PhaseStarted {
            task_id: task_id.clone(),
            phase,
            label: label.clone(),
            agents: assignments.iter().map(|a| a.identity.id.clone()).collect(),
        });

        let journal = SessionJournal::default();
        let runs = assignments
            .into_iter()
            .map(|assignment| self.run_agent(&task_id, phase, &label, assignment, sink.as_ref(), cancel, &journal));
        let results = join_all(runs).await;

        if cancel.is_cancelled() {
            self.processes.terminate_all();
            journal.rollback(&self.sessions, &task_id);
            warn!(task_id = %task_id, phase, "phase cancelled; results discarded");
            sink.emit(OrchestratorEvent::PhaseCancelled { phase });
            return Err(OrchestratorError::Cancelled { task_id, phase });
        }

        let succeeded = results.iter().filter(|r| r.succeeded()).count();
        let failed = results.len() - succeeded;
        info!(task_id = %task_id, phase, succeeded, failed, "phase finished");
        sink.emit(OrchestratorEvent::PhaseFinished {
            phase,
            succeeded,
            failed,
        });

        Ok(PhaseOutcome {
            task_id,
            phase,
            label,
            results,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_agent(
        &self,
        task_id: &str,
        phase: u32,
        label: &str,
        assignment: AgentAssignment,
        sink: &dyn MessageSink,
        cancel: &CancellationToken,
        journal: &SessionJournal,
    ) -> AgentResult {
        let agent_id = assignment.identity.id.clone();
        let log_path = self.log_path(task_id, phase, &agent_id);

        sink.emit(OrchestratorEvent::AgentStarted {
            agent_id: agent_id.clone(),
            label: assignment.identity.display_label().to_string(),
            color: assignment.identity.color_hint().to_string(),
            log_path: log_path.clone(),
        });

        let record = match AgentLog::open(&log_path).await {
            Ok(mut log) => {
                log.note(&format!(
                    "phase {} ({}) agent {} via {} model {} at {}",
                    phase,
                    label,
                    agent_id,
                    assignment.identity.adapter,
                    assignment.identity.model,
                    chrono::Utc::now().to_rfc3339()
                ))
                .await;
                let record = self
                    .execute(task_id, phase, &assignment, &log_path, &mut log, sink, cancel, journal)
                    .await;
                match &record.failure {
                    None => log.note("finished: succeeded").await,
                    Some(failure) => log.note(&format!("finished: failed: {}", failure)).await,
                }
                record
            }
            Err(e) => {
                let mut run = AgentRun::new(&agent_id, task_id, phase, log_path.clone());
                run.mark_finished(false);
                RunRecord {
                    run,
                    worktree: None,
                    failure: Some(AgentFailure::Log(format!("{}: {}", log_path.display(), e))),
                }
            }
        };

        let RunRecord {
            run,
            worktree,
            failure,
        } = record;
        let status = run.status();
        match &failure {
            None => info!(task_id, phase, agent_id = %agent_id, "agent succeeded"),
            Some(f) if f.is_cancelled() => debug!(task_id, phase, agent_id = %agent_id, "agent cancelled"),
            Some(f) => warn!(task_id, phase, agent_id = %agent_id, failure = %f, "agent failed"),
        }
        sink.emit(OrchestratorEvent::AgentFinished {
            agent_id: agent_id.clone(),
            status,
            detail: failure.as_ref().map(|f| f.to_string()),
        });

        AgentResult {
            agent_id,
            run_id: Some(run.run_id),
            status,
            log_path,
            worktree,
            session_id: run.session_id.clone(),
            failure,
            started_at: run.started_at(),
            ended_at: run.ended_at(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        task_id: &str,
        phase: u32,
        assignment: &AgentAssignment,
        log_path: &Path,
        log: &mut AgentLog,
        sink: &dyn MessageSink,
        cancel: &CancellationToken,
        journal: &SessionJournal,
    ) -> RunRecord {
        let identity = &assignment.identity;
        let agent_id = identity.id.as_str();
        let mut run = AgentRun::new(agent_id, task_id, phase, log_path.to_path_buf());
        let mut worktree = None;

        let failed = |mut run: AgentRun, worktree: Option<PathBuf>, failure: AgentFailure| {
            run.mark_finished(false);
            RunRecord {
                run,
                worktree,
                failure: Some(failure),
            }
        };

        let Some(tools) = self.registry.resolve(identity) else {
            return failed(run, worktree, AgentFailure::UnknownAdapter(identity.adapter.clone()));
        };
        if self.preflight && !tools.adapter.check_installed().await {
            let err = AdapterError::ToolUnavailable {
                kind: tools.adapter.kind().to_string(),
                instructions: tools.adapter.install_instructions(),
            };
            return failed(run, worktree, err.into());
        }
        if cancel.is_cancelled() {
            return failed(run, worktree, AgentFailure::Cancelled);
        }

        let wt = match self.worktrees.ensure(task_id, agent_id).await {
            Ok(wt) => wt,
            Err(e) => return failed(run, worktree, AgentFailure::Workspace(e.to_string())),
        };
        worktree = Some(wt.path.clone());

        let prior_session = if assignment.resume {
            match self.sessions.load(agent_id, task_id) {
                Ok(session) => session,
                Err(e) => return failed(run, worktree, AgentFailure::Session(e.to_string())),
            }
        } else {
            None
        };
        let resuming = prior_session.is_some();
        run.session_id = prior_session.clone();

        let invocation = Invocation {
            worktree: wt.path.clone(),
            model: identity.model.clone(),
            prompt: assignment.prompt.clone(),
            session_id: prior_session,
            resume: resuming,
        };
        if cancel.is_cancelled() {
            return failed(run, worktree, AgentFailure::Cancelled);
        }

        let mut process = match tools.adapter.run(&invocation, &self.processes).await {
            Ok(p) => p,
            Err(e) => return failed(run, worktree, e.into()),
        };
        run.mark_running();
        log.note(&format!(
            "pid {} in {}{}",
            process.pid().map(|p| p.to_string()).unwrap_or_else(|| "?".into()),
            wt.path.display(),
            if resuming { " (resumed session)" } else { "" }
        ))
        .await;

        loop {
            match process.next_line(cancel).await {
                Ok(Some(line)) => {
                    log.line(&line).await;
                    let Some(message) = tools.parser.parse(&line) else {
                        continue;
                    };
                    if let Some(session_id) = message.session_id.as_deref()
                        && run.session_id.as_deref() != Some(session_id)
                    {
                        self.record_session(agent_id, task_id, session_id, resuming, journal);
                        run.session_id = Some(session_id.to_string());
                    }
                    sink.emit(OrchestratorEvent::Message {
                        agent_id: agent_id.to_string(),
                        message,
                    });
                }
                Ok(None) => break,
                // Dropping the process kills its whole group.
                Err(e) => return failed(run, worktree, e.into()),
            }
        }

        match process.finish(cancel).await {
            Ok(report) => {
                for line in &report.stderr_tail {
                    log.note(&format!("stderr: {}", line)).await;
                }
                run.mark_finished(true);
                RunRecord {
                    run,
                    worktree,
                    failure: None,
                }
            }
            Err(e) => {
                if let AdapterError::ProcessFailure { stderr_tail, .. } = &e {
                    for line in stderr_tail {
                        log.note(&format!("stderr: {}", line)).await;
                    }
                }
                failed(run, worktree, e.into())
            }
        }
    }

    /// Persist a session id the moment the tool reveals it.
    ///
    /// A resumed run may legitimately get a new id and replaces the record.
    /// A fresh run never overwrites a different existing id.
    fn record_session(&self, agent_id: &str, task_id: &str, session_id: &str, resuming: bool, journal: &SessionJournal) {
        let previous = match self.sessions.record(agent_id, task_id) {
            Ok(previous) => previous,
            Err(e) => {
                warn!(agent_id, task_id, error = %e, "cannot read session record; not persisting new session");
                return;
            }
        };
        journal.note(agent_id, previous.clone());

        let result = match previous {
            Some(prev) if prev.session_id == session_id => Ok(()),
            Some(_) if resuming => self.sessions.replace(agent_id, task_id, session_id).map(|_| ()),
            _ => self.sessions.save(agent_id, task_id, session_id).map(|_| ()),
        };
        if let Err(e) = result {
            warn!(agent_id, task_id, error = %e, "session not persisted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentIdentity, RunStatus};
    use crate::orchestrator::NullSink;
    use std::process::Command;
    use tempfile::TempDir;

    struct Fixture {
        _repo: TempDir,
        _root: TempDir,
        state: TempDir,
        orchestrator: Orchestrator,
    }

    fn fixture() -> Fixture {
        let repo = TempDir::new().unwrap();
        for args in [
            vec!["init", "-q", "-b", "main"],
            vec!["config", "user.email", "cube@example.com"],
            vec!["config", "user.name", "cube"],
            vec!["commit", "-q", "--allow-empty", "-m", "initial"],
        ] {
            assert!(Command::new("git").args(&args).current_dir(repo.path()).status().unwrap().success());
        }
        let root = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let worktrees = Arc::new(WorktreeManager::new(repo.path(), root.path(), "main"));
        let orchestrator = Orchestrator::new(
            AdapterRegistry::builtin(),
            worktrees,
            SessionStore::new(state.path().join("sessions")),
            state.path().join("logs"),
        );
        Fixture {
            _repo: repo,
            _root: root,
            state,
            orchestrator,
        }
    }

    fn script_agent(id: &str, script: &str) -> AgentAssignment {
        AgentAssignment::new(
            AgentIdentity::writer(id, "command", "local").with_command(&["sh", "-c", script]),
            "do the task",
        )
    }

    fn request(assignments: Vec<AgentAssignment>) -> PhaseRequest {
        PhaseRequest {
            task_id: "t1".into(),
            phase: 2,
            label: "writers".into(),
            assignments,
        }
    }

    #[tokio::test]
    async fn test_all_agents_succeed_with_logs() {
        let fx = fixture();
        let outcome = fx
            .orchestrator
            .run_phase(
                request(vec![
                    script_agent("a", "cat >/dev/null; echo '{\"type\":\"session_id\",\"session_id\":\"sa\"}'; echo done-a"),
                    script_agent("b", "cat >/dev/null; echo done-b"),
                ]),
                Arc::new(NullSink),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.all_succeeded());
        assert_eq!(outcome.results.len(), 2);
        for result in &outcome.results {
            let log = std::fs::read_to_string(&result.log_path).unwrap();
            assert!(log.contains(&format!("done-{}", result.agent_id)));
        }
        assert_eq!(outcome.result_for("a").unwrap().session_id.as_deref(), Some("sa"));
        assert_eq!(
            fx.orchestrator.sessions().load("a", "t1").unwrap().as_deref(),
            Some("sa")
        );
        assert!(fx.orchestrator.processes().is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_siblings() {
        let fx = fixture();
        let outcome = fx
            .orchestrator
            .run_phase(
                request(vec![
                    script_agent("ok", "cat >/dev/null; sleep 0.2; echo fine"),
                    script_agent("bad", "cat >/dev/null; echo 'quota exceeded' >&2; exit 7"),
                ]),
                Arc::new(NullSink),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.result_for("ok").unwrap().succeeded());
        let bad = outcome.result_for("bad").unwrap();
        assert_eq!(bad.status, RunStatus::Failed);
        match bad.failure.as_ref().unwrap() {
            AgentFailure::Process { exit_code, last_line, .. } => {
                assert_eq!(*exit_code, Some(7));
                assert_eq!(last_line, "quota exceeded");
            }
            other => panic!("unexpected failure {other:?}"),
        }
        let log = std::fs::read_to_string(&bad.log_path).unwrap();
        assert!(log.contains("stderr: quota exceeded"));
    }

    #[tokio::test]
    async fn test_missing_tool_fails_preflight() {
        let fx = fixture();
        let assignment = AgentAssignment::new(
            AgentIdentity::writer("ghost", "command", "m").with_command(&["cube-no-such-tool-xyz"]),
            "p",
        );
        let outcome = fx
            .orchestrator
            .run_phase(request(vec![assignment]), Arc::new(NullSink), &CancellationToken::new())
            .await
            .unwrap();
        let result = &outcome.results[0];
        assert!(matches!(result.failure, Some(AgentFailure::ToolUnavailable(_))));
        assert!(result.log_path.exists());
    }

    #[tokio::test]
    async fn test_resume_passes_recorded_session() {
        let fx = fixture();
        fx.orchestrator.sessions().save("r", "t1", "prior-1").unwrap();
        let outcome = fx
            .orchestrator
            .run_phase(
                request(vec![script_agent("r", "cat >/dev/null; echo \"resume=$CUBE_RESUME_SESSION\"")]),
                Arc::new(NullSink),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let log = std::fs::read_to_string(&outcome.results[0].log_path).unwrap();
        assert!(log.contains("resume=prior-1"));
    }

    #[tokio::test]
    async fn test_cancellation_kills_processes_and_rolls_back() {
        let fx = fixture();
        fx.orchestrator.sessions().save("slow", "t1", "before").unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let processes = fx.orchestrator.processes().clone();
        let pids = Arc::new(Mutex::new(Vec::new()));
        let seen = pids.clone();
        tokio::spawn(async move {
            for _ in 0..100 {
                let live = processes.live_pids();
                if live.len() == 2 {
                    *seen.lock().unwrap() = live;
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let result = fx
            .orchestrator
            .run_phase(
                request(vec![
                    script_agent(
                        "slow",
                        "cat >/dev/null; echo '{\"type\":\"session_id\",\"session_id\":\"during\"}'; exec sleep 30",
                    ),
                    script_agent("fresh", "cat >/dev/null; echo '{\"type\":\"session_id\",\"session_id\":\"new\"}'; exec sleep 30"),
                ]),
                Arc::new(NullSink),
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(OrchestratorError::Cancelled { phase: 2, .. })));
        assert!(fx.orchestrator.processes().is_empty());
        let pids = pids.lock().unwrap().clone();
        assert_eq!(pids.len(), 2);
        for pid in pids {
            let alive = Command::new("kill").args(["-0", &pid.to_string()]).status().unwrap();
            assert!(!alive.success(), "process {} survived cancellation", pid);
        }
        let sessions = fx.orchestrator.sessions();
        assert_eq!(sessions.load("slow", "t1").unwrap().as_deref(), Some("before"));
        assert_eq!(sessions.load("fresh", "t1").unwrap(), None);
        assert!(fx.state.path().join("logs").exists());
    }

    #[tokio::test]
    async fn test_empty_request_is_error() {
        let fx = fixture();
        let result = fx
            .orchestrator
            .run_phase(request(vec![]), Arc::new(NullSink), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(OrchestratorError::NoAgents { .. })));
    }

    #[tokio::test]
    async fn test_cancel_reaches_agent_that_closed_stdout() {
        let fx = fixture();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(800)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            fx.orchestrator.run_phase(
                request(vec![script_agent(
                    "quiet",
                    "cat >/dev/null; echo hi; exec 1>&- 2>&-; exec sleep 20",
                )]),
                Arc::new(NullSink),
                &cancel,
            ),
        )
        .await
        .expect("run_phase should return soon after cancellation");

        assert!(matches!(result, Err(OrchestratorError::Cancelled { .. })));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert!(fx.orchestrator.processes().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_agent_ids_are_rejected() {
        let fx = fixture();
        let result = fx
            .orchestrator
            .run_phase(
                request(vec![
                    script_agent("w", "cat >/dev/null; echo one"),
                    script_agent("w", "cat >/dev/null; echo two"),
                ]),
                Arc::new(NullSink),
                &CancellationToken::new(),
            )
            .await;
        match result {
            Err(OrchestratorError::DuplicateAgent { agent_id, .. }) => assert_eq!(agent_id, "w"),
            other => panic!("expected DuplicateAgent, got {:?}", other.map(|o| o.results.len())),
        }
        assert!(!fx.state.path().join("logs/t1/phase-2-w.log").exists());
    }

    #[tokio::test]
    async fn test_path_like_agent_id_is_rejected() {
        let fx = fixture();
        let result = fx
            .orchestrator
            .run_phase(
                request(vec![script_agent("../escape", "cat >/dev/null")]),
                Arc::new(NullSink),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(OrchestratorError::InvalidAgent { .. })));
    }
}
