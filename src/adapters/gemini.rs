use async_trait::async_trait;

use super::{Adapter, CommandSpec, Invocation, probe_version, program_for};
use crate::agent::AgentIdentity;

const DEFAULT_PROGRAM: &str = "gemini";

/// Gemini CLI in non-interactive mode with stream-json output.
#[derive(Debug, Clone)]
pub struct GeminiAdapter {
    program: String,
    extra_args: Vec<String>,
}

impl Default for GeminiAdapter {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl GeminiAdapter {
    pub fn from_identity(identity: &AgentIdentity) -> Self {
        let (program, extra_args) = program_for(identity, DEFAULT_PROGRAM);
        Self {
            program,
            extra_args,
        }
    }
}

#[async_trait]
impl Adapter for GeminiAdapter {
    fn kind(&self) -> &str {
        "gemini"
    }

    fn command(&self, invocation: &Invocation) -> CommandSpec {
        let mut args = self.extra_args.clone();
        args.extend(
            [
                "--output-format",
                "stream-json",
                "--yolo",
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
            "Install Gemini CLI with `npm install -g @google/gemini-cli`, then run `gemini` once to sign in (looked for `{}`)",
            self.program
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_command_with_resume() {
        let inv = Invocation {
            worktree: PathBuf::from("/tmp/wt"),
            model: "gemini-2.5-pro".into(),
            prompt: "Review".into(),
            session_id: Some("g-1".into()),
            resume: true,
        };
        let spec = GeminiAdapter::default().command(&inv);
        assert_eq!(spec.program, "gemini");
        assert!(spec.args.contains(&"--yolo".to_string()));
        assert!(spec.args.windows(2).any(|w| w == ["--resume", "g-1"]));
    }
}
