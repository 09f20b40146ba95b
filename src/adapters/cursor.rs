use async_trait::async_trait;

use super::{Adapter, CommandSpec, Invocation, probe_version, program_for};
use crate::agent::AgentIdentity;

const DEFAULT_PROGRAM: &str = "cursor-agent";

/// `cursor-agent --print`. The prompt is passed as the final argument.
#[derive(Debug, Clone)]
pub struct CursorAdapter {
    program: String,
    extra_args: Vec<String>,
}

impl Default for CursorAdapter {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl CursorAdapter {
    pub fn from_identity(identity: &AgentIdentity) -> Self {
        let (program, extra_args) = program_for(identity, DEFAULT_PROGRAM);
        Self {
            program,
            extra_args,
        }
    }
}

#[async_trait]
impl Adapter for CursorAdapter {
    fn kind(&self) -> &str {
        "cursor"
    }

    fn command(&self, invocation: &Invocation) -> CommandSpec {
        let mut args = self.extra_args.clone();
        args.extend(
            [
                "--print",
                "--output-format",
                "stream-json",
                "--force",
                "--model",
                invocation.model.as_str(),
            ]
            .map(String::from),
        );
        if let Some(session) = invocation.resume_session() {
            args.push("--resume".into());
            args.push(session.to_string());
        }
        args.push(invocation.prompt.clone());
        CommandSpec {
            program: self.program.clone(),
            args,
            stdin: None,
            env: Vec::new(),
        }
    }

    async fn check_installed(&self) -> bool {
        probe_version(&self.program).await
    }

    fn install_instructions(&self) -> String {
        format!(
            "Install Cursor's CLI with `curl https://cursor.com/install -fsS | bash`, then run `cursor-agent login` (looked for `{}`)",
            self.program
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_prompt_is_last_argument() {
        let inv = Invocation {
            worktree: PathBuf::from("/tmp/wt"),
            model: "gpt-5".into(),
            prompt: "Do the thing".into(),
            session_id: None,
            resume: true,
        };
        let spec = CursorAdapter::default().command(&inv);
        assert_eq!(spec.args.last().map(String::as_str), Some("Do the thing"));
        assert!(spec.stdin.is_none());
        assert!(!spec.args.contains(&"--resume".to_string()));
    }
}
