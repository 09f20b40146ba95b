//! Parser for Gemini CLI's `--output-format stream-json` events.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{NormalizedMessage, Parser, describe_tool_use, parse_json_line};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum GeminiEvent {
    Init {
        #[serde(default)]
        session_id: Option<String>,
    },
    Message {
        #[serde(default)]
        role: String,
        #[serde(default)]
        content: String,
    },
    ToolUse {
        #[serde(default)]
        tool_name: String,
        #[serde(default)]
        parameters: Value,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    Result {
        #[serde(default)]
        status: String,
        #[serde(default)]
        error: Option<Value>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GeminiParser;

impl Parser for GeminiParser {
    fn parse(&self, line: &str) -> Option<NormalizedMessage> {
        let value = parse_json_line("gemini", line)?;
        let event = match serde_json::from_value::<GeminiEvent>(value) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "gemini event did not match the expected shape");
                return None;
            }
        };
        match event {
            GeminiEvent::Init { session_id } => session_id
                .filter(|s| !s.is_empty())
                .map(NormalizedMessage::session),
            GeminiEvent::Message { role, content } if role == "assistant" && !content.is_empty() => {
                Some(NormalizedMessage::output(content))
            }
            GeminiEvent::Message { .. } => None,
            GeminiEvent::ToolUse {
                tool_name,
                parameters,
            } => Some(NormalizedMessage::tool_call(describe_tool_use(
                &tool_name,
                &parameters,
            ))),
            GeminiEvent::Error { message } => Some(NormalizedMessage::error(message)),
            GeminiEvent::Result { status, error } if status == "error" => {
                let message = error
                    .as_ref()
                    .and_then(|e| e.get("message").and_then(|m| m.as_str()).map(String::from))
                    .unwrap_or_else(|| "gemini reported an error result".to_string());
                Some(NormalizedMessage::error(message))
            }
            GeminiEvent::Result { .. } | GeminiEvent::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::MessageKind;

    #[test]
    fn test_init_and_message() {
        let session = GeminiParser
            .parse(r#"{"type":"init","timestamp":"2025-10-10T12:00:00.000Z","session_id":"g-1","model":"gemini-2.5-pro"}"#)
            .unwrap();
        assert_eq!(session.kind, MessageKind::SessionId);

        let out = GeminiParser
            .parse(r#"{"type":"message","role":"assistant","content":"Looks good","delta":true}"#)
            .unwrap();
        assert_eq!(out.kind, MessageKind::Output);
        assert_eq!(out.content, "Looks good");

        assert!(GeminiParser
            .parse(r#"{"type":"message","role":"user","content":"prompt echo"}"#)
            .is_none());
    }

    #[test]
    fn test_tool_use_and_errors() {
        let tool = GeminiParser
            .parse(r#"{"type":"tool_use","tool_name":"read_file","tool_id":"t1","parameters":{"path":"src/lib.rs"}}"#)
            .unwrap();
        assert_eq!(tool.kind, MessageKind::ToolCall);
        assert_eq!(tool.content, "Reading: src/lib.rs");

        let err = GeminiParser
            .parse(r#"{"type":"result","status":"error","error":{"type":"FatalAuthenticationError","message":"not signed in"}}"#)
            .unwrap();
        assert_eq!(err.kind, MessageKind::Error);
        assert_eq!(err.content, "not signed in");

        assert!(GeminiParser.parse(r#"{"type":"result","status":"success","stats":{}}"#).is_none());
        assert!(GeminiParser.parse("Loaded cached credentials.").is_none());
    }
}
