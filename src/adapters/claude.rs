use async_trait::async_trait;

use super::{Adapter, CommandSpec, Invocation, probe_version, program_for};
use crate::agent::AgentIdentity;

const DEFAULT_PROGRAM: &str = "claude";

/// Claude Code in print mode with stream-json output. The prompt goes on stdin.
#[derive(Debug, Clone)]
pub struct ClaudeAdapter {
    program: String,
    extra_args: Vec<String>,
}

impl Default for ClaudeAdapter {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl ClaudeAdapter {
    pub fn from_identity(identity: &AgentIdentity) -> Self {
        let (program, extra_args) = program_for(identity, DEFAULT_PROGRAM);
        Self {
            program,
            extra_args,
        }
    }
}

#[async_trait]
impl Adapter for ClaudeAdapter {
    fn kind(&self) -> &str {
        "claude"
    }

    fn command(&self, invocation: &Invocation) -> CommandSpec {
        let mut args = self.extra_args.clone();
        args.extend(
            [
                "--print",
                "--output-format",
                "stream-json",
                "--verbose",
                "--dangerously-skip-permissions",
                "--model",
                invocation.model.as_str(),
            ]
            .map(String::from),
        );
        if let Some(session) = invocation.resume_session() {
            args.push("--resume".into());
            args.push(session.to_string());
        }
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
            "Install Claude Code with `npm install -g @anthropic-ai/claude-code`, then run `claude` once to log in (looked for `{}`)",
            self.program
        )
    }
}
