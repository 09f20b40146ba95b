use async_trait::async_trait;

use super::{Adapter, CommandSpec, Invocation, probe_version, program_for};
use crate::agent::AgentIdentity;

const DEFAULT_PROGRAM: &str = "codex";

/// `codex exec --json`, reading the prompt from stdin (`-`).
///
/// Resuming uses the `exec resume <thread id>` subcommand.
#[derive(Debug, Clone)]
pub struct CodexAdapter {
    program: String,
    extra_args: Vec<String>,
}

impl Default for CodexAdapter {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl CodexAdapter {
    pub fn from_identity(identity: &AgentIdentity) -> Self {
        let (program, extra_args) = program_for(identity, DEFAULT_PROGRAM);
        Self {
            program,
            extra_args,
        }
    }
}

#[async_trait]
impl Adapter for CodexAdapter {
    fn kind(&self) -> &str {
        "codex"
    }

    fn command(&self, invocation: &Invocation) -> CommandSpec {
        let mut args = self.extra_args.clone();
        args.extend(
            [
                "exec",
                "--json",
                "--skip-git-repo-check",
                "--dangerously-bypass-approvals-and-sandbox",
                "--model",
                invocation.model.as_str(),
            ]
            .map(String::from),
        );
        if let Some(session) = invocation.resume_session() {
            args.push("resume".into());
            args.push(session.to_string());
        }
        args.push("-".into());
        CommandSpec {
            program: self.program.clone(),
            args,
            stdin: Some(invocation.prompt.clone()),
            env: Vec::new(),
        }
    }

    async fn check_installed(&self) -> bool {
        probe_version(&self.program).await
    }

    fn install_instructions(&self) -> String {
        format!(
            "Install Codex with `npm install -g @openai/codex`, then run `codex login` (looked for `{}`)",
            self.program
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_command_shapes() {
        let mut inv = Invocation {
            worktree: PathBuf::from("/tmp/wt"),
            model: "gpt-5-codex".into(),
            prompt: "Fix it".into(),
            session_id: Some("thread-7".into()),
            resume: false,
        };
        let fresh = CodexAdapter::default().command(&inv);
        assert_eq!(fresh.args[0], "exec");
        assert_eq!(fresh.args.last().map(String::as_str), Some("-"));
        assert!(!fresh.args.contains(&"resume".to_string()));

        inv.resume = true;
        let resumed = CodexAdapter::default().command(&inv);
        assert!(resumed.args.windows(2).any(|w| w == ["resume", "thread-7"]));
        assert_eq!(resumed.stdin.as_deref(), Some("Fix it"));
    }
}
