//! Spawned agent processes and the registry tracking them.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{AdapterError, FailureKind};

/// Lines of stderr kept for failure reports.
const STDERR_TAIL: usize = 20;

/// Fully resolved command line for one agent invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct TrackedProcess {
    pub kind: String,
    pub pid: Option<u32>,
}

#[derive(Default)]
struct RegistryInner {
    live: HashMap<u64, TrackedProcess>,
    shutdown: CancellationToken,
}

/// Every agent process currently alive, so a cancellation can reach them all.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    next_id: Arc<AtomicU64>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, kind: &str, pid: Option<u32>) -> ProcessTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.live.insert(
            id,
            TrackedProcess {
                kind: kind.to_string(),
                pid,
            },
        );
        ProcessTicket {
            id,
            shutdown: inner.shutdown.child_token(),
            registry: self.clone(),
        }
    }

    fn unregister(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.live.remove(&id);
    }

    /// Signal every registered process to terminate.
    ///
    /// Processes registered afterwards are unaffected.
    pub fn terminate_all(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.live.is_empty() {
            debug!(count = inner.live.len(), "terminating registered agent processes");
        }
        inner.shutdown.cancel();
        inner.shutdown = CancellationToken::new();
    }

    pub fn live(&self) -> Vec<TrackedProcess> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.live.values().cloned().collect()
    }

    pub fn live_pids(&self) -> Vec<u32> {
        self.live().into_iter().filter_map(|p| p.pid).collect()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration of one process; dropping it removes the entry.
struct ProcessTicket {
    id: u64,
    shutdown: CancellationToken,
    registry: ProcessRegistry,
}

impl Drop for ProcessTicket {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

/// Result of a process that exited successfully.
#[derive(Debug, Clone, Default)]
pub struct ExitReport {
    pub stderr_tail: Vec<String>,
}

/// A running agent CLI whose stdout is consumed line by line.
pub struct AgentProcess {
    kind: String,
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    stderr_task: Option<JoinHandle<Vec<String>>>,
    stdin_task: Option<JoinHandle<()>>,
    last_stdout: Option<String>,
    ticket: ProcessTicket,
}

impl AgentProcess {
    /// Spawn `spec` in `cwd` and register it.
    pub async fn spawn(
        kind: &str,
        spec: &CommandSpec,
        cwd: &Path,
        registry: &ProcessRegistry,
    ) -> Result<Self, AdapterError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so cancellation reaches grandchildren too.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| AdapterError::Spawn {
            kind: kind.to_string(),
            program: spec.program.clone(),
            source,
        })?;
        let ticket = registry.register(kind, child.id());
        debug!(kind, pid = ?child.id(), program = %spec.program, "spawned agent process");

        let stdout = child.stdout.take().ok_or_else(|| AdapterError::Stream {
            kind: kind.to_string(),
            source: std::io::Error::other("stdout was not captured"),
        })?;

        let stdin_task = match (child.stdin.take(), spec.stdin.clone()) {
            (Some(mut stdin), Some(prompt)) => {
                let kind = kind.to_string();
                Some(tokio::spawn(async move {
                    if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                        warn!(kind, error = %e, "failed to write prompt to stdin");
                    }
                    let _ = stdin.shutdown().await;
                }))
            }
            _ => None,
        };

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if tail.len() == STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail.into_iter().collect()
            })
        });

        Ok(Self {
            kind: kind.to_string(),
            child,
            lines: BufReader::new(stdout).lines(),
            stderr_task,
            stdin_task,
            last_stdout: None,
            ticket,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Next stdout line, or `None` at end of stream.
    ///
    /// If `cancel` fires (or the registry terminates this process) the child
    /// is killed and reaped before `AdapterError::Terminated` is returned.
    pub async fn next_line(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, AdapterError> {
        let shutdown = self.ticket.shutdown.clone();
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = shutdown.cancelled() => None,
            line = self.lines.next_line() => Some(line),
        };

        match next {
            None => {
                self.kill().await;
                Err(AdapterError::Terminated {
                    kind: self.kind.clone(),
                })
            }
            Some(Ok(Some(line))) => {
                if !line.trim().is_empty() {
                    self.last_stdout = Some(line.clone());
                }
                Ok(Some(line))
            }
            Some(Ok(None)) => Ok(None),
            Some(Err(source)) => Err(AdapterError::Stream {
                kind: self.kind.clone(),
                source,
            }),
        }
    }

    /// Wait for exit. A non-zero exit becomes `ProcessFailure` carrying the
    /// last diagnostic line and its classification.
    ///
    /// A child can close stdout and keep running, so `cancel` and registry
    /// termination are honoured here as well.
    pub async fn finish(mut self, cancel: &CancellationToken) -> Result<ExitReport, AdapterError> {
        let shutdown = self.ticket.shutdown.clone();
        let exited = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = shutdown.cancelled() => None,
            exited = self.wait_for_exit() => Some(exited),
        };
        let Some(exited) = exited else {
            self.kill().await;
            return Err(AdapterError::Terminated {
                kind: self.kind.clone(),
            });
        };
        let (status, stderr_tail) = exited?;

        if status.success() {
            return Ok(ExitReport { stderr_tail });
        }

        let last_line = stderr_tail
            .last()
            .cloned()
            .or_else(|| self.last_stdout.clone())
            .unwrap_or_default();
        Err(AdapterError::ProcessFailure {
            kind: self.kind.clone(),
            exit_code: status.code(),
            failure: FailureKind::classify(&last_line),
            last_line,
            stderr_tail,
        })
    }

    async fn wait_for_exit(&mut self) -> Result<(ExitStatus, Vec<String>), AdapterError> {
        let status = self.child.wait().await.map_err(|source| AdapterError::Stream {
            kind: self.kind.clone(),
            source,
        })?;
        if let Some(task) = self.stdin_task.as_mut() {
            let _ = task.await;
        }
        self.stdin_task = None;
        let stderr_tail = match self.stderr_task.as_mut() {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        self.stderr_task = None;
        Ok((status, stderr_tail))
    }

    /// SIGKILL the whole process group while the leader is unreaped.
    fn signal_group(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SAFETY: signalling a process group we created; no memory is shared.
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }

    /// Kill the process group and reap the child.
    async fn kill(&mut self) {
        self.signal_group();
        if let Err(e) = self.child.kill().await {
            debug!(kind = %self.kind, error = %e, "kill after group signal");
        }
        if let Some(task) = self.stdin_task.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

/// `kill_on_drop` only reaches the direct child; grandchildren share its group.
impl Drop for AgentProcess {
    fn drop(&mut self) {
        self.signal_group();
        if let Some(task) = self.stdin_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            stdin: None,
            env: vec![],
        }
    }

    #[tokio::test]
    async fn test_reads_lines_and_succeeds() {
        let registry = ProcessRegistry::new();
        let cwd = std::env::temp_dir();
        let mut process = AgentProcess::spawn("test", &sh("echo one; echo two"), &cwd, &registry)
            .await
            .unwrap();
        assert_eq!(registry.len(), 1);

        let cancel = CancellationToken::new();
        let mut lines = Vec::new();
        while let Some(line) = process.next_line(&cancel).await.unwrap() {
            lines.push(line);
        }
        assert_eq!(lines, vec!["one", "two"]);
        process.finish(&cancel).await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_stdin_prompt_is_delivered() {
        let registry = ProcessRegistry::new();
        let mut spec = sh("cat");
        spec.stdin = Some("hello from stdin\n".into());
        let mut process = AgentProcess::spawn("test", &spec, &std::env::temp_dir(), &registry)
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        assert_eq!(
            process.next_line(&cancel).await.unwrap().as_deref(),
            Some("hello from stdin")
        );
        assert!(process.next_line(&cancel).await.unwrap().is_none());
        process.finish(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_carries_last_stderr_line() {
        let registry = ProcessRegistry::new();
        let spec = sh("echo progress; echo 'Error: 429 Too Many Requests' >&2; exit 3");
        let mut process = AgentProcess::spawn("test", &spec, &std::env::temp_dir(), &registry)
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        while process.next_line(&cancel).await.unwrap().is_some() {}
        match process.finish(&cancel).await {
            Err(AdapterError::ProcessFailure {
                exit_code,
                last_line,
                failure,
                ..
            }) => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(last_line, "Error: 429 Too Many Requests");
                assert_eq!(failure, FailureKind::RateLimited);
            }
            other => panic!("expected ProcessFailure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_failure_falls_back_to_stdout_line() {
        let registry = ProcessRegistry::new();
        let mut process =
            AgentProcess::spawn("test", &sh("echo last words; exit 1"), &std::env::temp_dir(), &registry)
                .await
                .unwrap();
        let cancel = CancellationToken::new();
        while process.next_line(&cancel).await.unwrap().is_some() {}
        let err = process.finish(&cancel).await.unwrap_err();
        assert!(err.to_string().contains("last words"));
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let registry = ProcessRegistry::new();
        let spec = CommandSpec {
            program: "/nonexistent/cube-agent-binary".into(),
            ..Default::default()
        };
        let result = AgentProcess::spawn("test", &spec, &std::env::temp_dir(), &registry).await;
        assert!(matches!(result, Err(AdapterError::Spawn { .. })));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_all_kills_child() {
        let registry = ProcessRegistry::new();
        let mut process =
            AgentProcess::spawn("test", &sh("echo started; exec sleep 30"), &std::env::temp_dir(), &registry)
                .await
                .unwrap();
        let pid = process.pid().unwrap();
        let cancel = CancellationToken::new();
        assert_eq!(process.next_line(&cancel).await.unwrap().as_deref(), Some("started"));

        let terminator = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            terminator.terminate_all();
        });
        let result = tokio::time::timeout(Duration::from_secs(5), process.next_line(&cancel))
            .await
            .expect("termination should be prompt");
        assert!(matches!(result, Err(AdapterError::Terminated { .. })));
        drop(process);
        assert!(registry.is_empty());

        let alive = std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .unwrap();
        assert!(!alive.success(), "child {} should be gone", pid);
    }

    #[tokio::test]
    async fn test_finish_honours_cancel_after_stdout_closes() {
        let registry = ProcessRegistry::new();
        let spec = sh("echo hi; exec 1>&- 2>&-; exec sleep 20");
        let mut process = AgentProcess::spawn("test", &spec, &std::env::temp_dir(), &registry)
            .await
            .unwrap();
        let pid = process.pid().unwrap();
        let cancel = CancellationToken::new();
        while process.next_line(&cancel).await.unwrap().is_some() {}

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let result = tokio::time::timeout(Duration::from_secs(5), process.finish(&cancel))
            .await
            .expect("finish should return once cancelled");
        assert!(matches!(result, Err(AdapterError::Terminated { .. })));
        assert!(registry.is_empty());

        let alive = std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .unwrap();
        assert!(!alive.success(), "child {} should be gone", pid);
    }

    /// Running and not a zombie.
    #[cfg(target_os = "linux")]
    fn running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => !stat.rsplit_once(')').is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_drop_kills_grandchildren() {
        let registry = ProcessRegistry::new();
        let spec = sh("sleep 30 & echo $!; wait");
        let mut process = AgentProcess::spawn("test", &spec, &std::env::temp_dir(), &registry)
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let grandchild: u32 = process
            .next_line(&cancel)
            .await
            .unwrap()
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(running(grandchild));

        drop(process);
        for _ in 0..100 {
            if !running(grandchild) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!running(grandchild), "grandchild {} outlived its agent", grandchild);
    }
}
