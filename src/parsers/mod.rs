//! Normalization of each tool's line-oriented output.
//!
//! Every supported CLI prints one JSON event per line in its own schema. A
//! [`Parser`] maps one raw line to at most one [`NormalizedMessage`]; lines
//! that carry nothing worth showing, or that don't parse, yield `None`.
//! Parsers never panic and never fail the run.

pub mod claude;
pub mod codex;
pub mod cursor;
pub mod gemini;
pub mod plain;

pub use claude::ClaudeParser;
pub use codex::CodexParser;
pub use cursor::CursorParser;
pub use gemini::GeminiParser;
pub use plain::PlainParser;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::util::truncate_str;

/// The kind of a normalized message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Thinking,
    ToolCall,
    Output,
    Error,
    SessionId,
}

/// A tool-independent view of one line of agent output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub kind: MessageKind,
    pub content: String,
    /// Set whenever the line reveals the tool's resumable session id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl NormalizedMessage {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            session_id: None,
        }
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Thinking, content)
    }

    pub fn tool_call(content: impl Into<String>) -> Self {
        Self::new(MessageKind::ToolCall, content)
    }

    pub fn output(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Output, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Error, content)
    }

    pub fn session(session_id: impl Into<String>) -> Self {
        let id = session_id.into();
        Self {
            kind: MessageKind::SessionId,
            content: id.clone(),
            session_id: Some(id),
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        if self.session_id.is_none() {
            self.session_id = session_id.filter(|s| !s.is_empty());
        }
        self
    }
}

/// Maps one raw output line to a normalized message.
pub trait Parser: Send + Sync {
    fn parse(&self, line: &str) -> Option<NormalizedMessage>;
}

/// Parse a line as a JSON object, logging (not failing) on bad input.
pub(crate) fn parse_json_line(parser: &str, line: &str) -> Option<Value> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        if !trimmed.is_empty() {
            debug!(parser, line = %truncate_str(trimmed, 120), "skipping non-JSON line");
        }
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(parser, error = %e, line = %truncate_str(trimmed, 120), "skipping malformed JSON line");
            None
        }
    }
}

/// Join the non-empty parts of a multi-block message.
pub(crate) fn join_nonempty(parts: Vec<String>) -> Option<String> {
    let parts: Vec<String> = parts.into_iter().filter(|p| !p.trim().is_empty()).collect();
    (!parts.is_empty()).then(|| parts.join("\n"))
}

/// Human-readable summary of a tool invocation.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(|v| v.as_str());
    match name {
        "Read" | "read_file" => format!("Reading: {}", field("file_path").or(field("path")).map(shorten_path).unwrap_or_else(|| "file".into())),
        "Write" | "write_file" => format!("Creating: {}", field("file_path").or(field("path")).map(shorten_path).unwrap_or_else(|| "file".into())),
        "Edit" | "MultiEdit" | "replace" => format!("Editing: {}", field("file_path").or(field("path")).map(shorten_path).unwrap_or_else(|| "file".into())),
        "Bash" | "run_shell_command" | "shell" => format!(
            "Running: {}",
            field("command").map(|s| truncate_str(s, 60)).unwrap_or_else(|| "command".into())
        ),
        "Glob" | "glob" => format!("Searching: {}", field("pattern").unwrap_or("*")),
        "Grep" | "search_file_content" => format!(
            "Grep: {}",
            field("pattern").map(|s| truncate_str(s, 40)).unwrap_or_else(|| "pattern".into())
        ),
        "Task" => format!("Agent: {}", field("description").unwrap_or("subagent")),
        _ => name.to_string(),
    }
}

/// Keep only the last two path components.
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_tool_use() {
        let input = serde_json::json!({"file_path": "/Users/foo/project/src/main.rs"});
        assert_eq!(describe_tool_use("Read", &input), "Reading: src/main.rs");

        let input = serde_json::json!({"command": "cargo test --release"});
        assert_eq!(describe_tool_use("Bash", &input), "Running: cargo test --release");

        let input = serde_json::json!({"path": "a.rs"});
        assert_eq!(describe_tool_use("write_file", &input), "Creating: a.rs");
        assert_eq!(describe_tool_use("WebFetch", &input), "WebFetch");
    }

    #[test]
    fn test_parse_json_line_rejects_garbage() {
        assert!(parse_json_line("t", "").is_none());
        assert!(parse_json_line("t", "plain text").is_none());
        assert!(parse_json_line("t", "{not json").is_none());
        assert!(parse_json_line("t", r#"  {"a":1}  "#).is_some());
    }

    #[test]
    fn test_with_session_keeps_existing() {
        let msg = NormalizedMessage::session("s1").with_session(Some("s2".into()));
        assert_eq!(msg.session_id.as_deref(), Some("s1"));
        let msg = NormalizedMessage::output("x").with_session(Some(String::new()));
        assert_eq!(msg.session_id, None);
    }
}
