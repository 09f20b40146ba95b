//! Adapters for the external coding-agent CLIs.
//!
//! An [`Adapter`] knows how to invoke one tool: how to check it is
//! installed, and how to build the command line for a fresh or resumed
//! session. The [`AdapterRegistry`] maps an agent's `adapter` key to an
//! adapter plus the [`Parser`](crate::parsers::Parser) for that tool's output.

pub mod claude;
pub mod codex;
pub mod command;
pub mod cursor;
pub mod gemini;
pub mod process;
pub mod registry;

pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;
pub use command::CommandAdapter;
pub use cursor::CursorAdapter;
pub use gemini::GeminiAdapter;
pub use process::{AgentProcess, CommandSpec, ExitReport, ProcessRegistry, TrackedProcess};
pub use registry::{AdapterRegistry, ToolPair};

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::agent::AgentIdentity;
use crate::errors::AdapterError;

/// Adapter keys understood by the built-in registry.
pub const BUILTIN_KINDS: &[&str] = &["claude", "codex", "gemini", "cursor", "command"];

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Everything needed to start one agent turn.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub worktree: PathBuf,
    pub model: String,
    pub prompt: String,
    /// Session to continue when `resume` is set.
    pub session_id: Option<String>,
    pub resume: bool,
}

impl Invocation {
    /// The session to resume, if this invocation resumes one.
    pub fn resume_session(&self) -> Option<&str> {
        if self.resume {
            self.session_id.as_deref().filter(|s| !s.is_empty())
        } else {
            None
        }
    }
}

#[async_trait]
pub trait Adapter: Send + Sync {
    /// Registry key of this adapter.
    fn kind(&self) -> &str;

    /// Command line for an invocation.
    fn command(&self, invocation: &Invocation) -> CommandSpec;

    /// Whether the tool can be run on this machine.
    async fn check_installed(&self) -> bool;

    /// How to install and authenticate the tool.
    fn install_instructions(&self) -> String;

    /// Start the tool for `invocation` and register it in `processes`.
    async fn run(
        &self,
        invocation: &Invocation,
        processes: &ProcessRegistry,
    ) -> Result<AgentProcess, AdapterError> {
        let spec = self.command(invocation);
        AgentProcess::spawn(self.kind(), &spec, &invocation.worktree, processes).await
    }
}

/// Program and leading arguments for an identity, honoring a `command` override.
pub(crate) fn program_for(identity: &AgentIdentity, default_program: &str) -> (String, Vec<String>) {
    match identity.command.as_deref() {
        Some([program, rest @ ..]) => (program.clone(), rest.to_vec()),
        _ => (default_program.to_string(), Vec::new()),
    }
}

/// Locate `program` on PATH, or check it directly if it contains a separator.
pub fn find_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if program.contains(std::path::MAIN_SEPARATOR) {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

/// `program` is on PATH and `program --version` exits successfully.
pub(crate) async fn probe_version(program: &str) -> bool {
    if find_program(program).is_none() {
        debug!(program, "not found on PATH");
        return false;
    }
    let status = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();
    match tokio::time::timeout(VERSION_PROBE_TIMEOUT, status).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(e)) => {
            debug!(program, error = %e, "version probe failed to start");
            false
        }
        Err(_) => {
            debug!(program, "version probe timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_for_override() {
        let plain = AgentIdentity::writer("w", "claude", "sonnet");
        assert_eq!(program_for(&plain, "claude"), ("claude".to_string(), vec![]));

        let wrapped = plain.with_command(&["/opt/bin/claude-wrapper", "--profile", "work"]);
        assert_eq!(
            program_for(&wrapped, "claude"),
            (
                "/opt/bin/claude-wrapper".to_string(),
                vec!["--profile".to_string(), "work".to_string()]
            )
        );
    }

    #[test]
    fn test_find_program() {
        assert!(find_program("sh").is_some());
        assert!(find_program("/bin/sh").is_some() || find_program("/usr/bin/sh").is_some());
        assert!(find_program("cube-definitely-not-installed-xyz").is_none());
    }

    #[test]
    fn test_resume_session_requires_flag() {
        let mut inv = Invocation {
            worktree: PathBuf::from("."),
            model: "m".into(),
            prompt: "p".into(),
            session_id: Some("s".into()),
            resume: false,
        };
        assert_eq!(inv.resume_session(), None);
        inv.resume = true;
        assert_eq!(inv.resume_session(), Some("s"));
        inv.session_id = Some(String::new());
        assert_eq!(inv.resume_session(), None);
    }

    #[tokio::test]
    async fn test_probe_version_missing_program() {
        assert!(!probe_version("cube-definitely-not-installed-xyz").await);
    }
}
