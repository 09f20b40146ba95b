//! Adapter for arbitrary command-line agents.
//!
//! Runs the identity's `command` argv with the prompt on stdin. Model and
//! session details are exported as environment variables so wrapper scripts
//! can forward them to whatever tool they drive.

use async_trait::async_trait;

use super::{Adapter, CommandSpec, Invocation, find_program, program_for};
use crate::agent::AgentIdentity;

#[derive(Debug, Clone)]
pub struct CommandAdapter {
    program: String,
    args: Vec<String>,
}

impl CommandAdapter {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn from_identity(identity: &AgentIdentity) -> Self {
        let (program, args) = program_for(identity, "");
        Self { program, args }
    }
}

#[async_trait]
impl Adapter for CommandAdapter {
    fn kind(&self) -> &str {
        "command"
    }

    fn command(&self, invocation: &Invocation) -> CommandSpec {
        let mut env = vec![
            ("CUBE_MODEL".to_string(), invocation.model.clone()),
            (
                "CUBE_WORKTREE".to_string(),
                invocation.worktree.display().to_string(),
            ),
        ];
        if let Some(session) = invocation.resume_session() {
            env.push(("CUBE_RESUME_SESSION".to_string(), session.to_string()));
        }
        CommandSpec {
            program: self.program.clone(),
            args: self.args.clone(),
            stdin: Some(invocation.prompt.clone()),
            env,
        }
    }

    async fn check_installed(&self) -> bool {
        !self.program.is_empty() && find_program(&self.program).is_some()
    }

    fn install_instructions(&self) -> String {
        if self.program.is_empty() {
            "Set `command = [\"program\", \"args\"...]` for this agent in .cube/cube.toml".to_string()
        } else {
            format!(
                "Make sure `{}` is on PATH, or give an absolute path in the agent's `command`",
                self.program
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_missing_command_is_not_installed() {
        let identity = AgentIdentity::writer("w", "command", "m");
        let adapter = CommandAdapter::from_identity(&identity);
        assert!(!adapter.check_installed().await);
        assert!(adapter.install_instructions().contains("cube.toml"));

        let sh = CommandAdapter::new("sh", &["-c", "cat"]);
        assert!(sh.check_installed().await);
    }

    #[test]
    fn test_env_carries_resume_session() {
        let adapter = CommandAdapter::new("agent.sh", &[]);
        let inv = Invocation {
            worktree: PathBuf::from("/tmp/wt"),
            model: "local".into(),
            prompt: "p".into(),
            session_id: Some("s-9".into()),
            resume: true,
        };
        let spec = adapter.command(&inv);
        assert!(spec.env.contains(&("CUBE_RESUME_SESSION".to_string(), "s-9".to_string())));
        assert!(spec.env.contains(&("CUBE_MODEL".to_string(), "local".to_string())));
    }
}
