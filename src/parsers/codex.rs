//! Parser for `codex exec --json` events.
//!
//! Handles the thread/item event stream, plus the older `{"msg": {...}}`
//! envelope some versions still print.

use serde_json::Value;

use super::{NormalizedMessage, Parser, parse_json_line};
use crate::util::truncate_str;

#[derive(Debug, Default, Clone, Copy)]
pub struct CodexParser;

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str())
}

fn normalize_item(item: &Value) -> Option<NormalizedMessage> {
    match str_field(item, "type")? {
        "agent_message" => str_field(item, "text")
            .filter(|t| !t.is_empty())
            .map(NormalizedMessage::output),
        "reasoning" => str_field(item, "text")
            .filter(|t| !t.is_empty())
            .map(NormalizedMessage::thinking),
        "command_execution" => {
            let command = str_field(item, "command").unwrap_or("command");
            Some(NormalizedMessage::tool_call(format!(
                "Running: {}",
                truncate_str(command, 60)
            )))
        }
        "file_change" => {
            let paths: Vec<String> = item
                .get("changes")
                .and_then(|c| c.as_array())
                .map(|changes| {
                    changes
                        .iter()
                        .filter_map(|c| {
                            let path = str_field(c, "path")?;
                            let kind = str_field(c, "kind").unwrap_or("update");
                            Some(format!("{} {}", kind, path))
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(NormalizedMessage::tool_call(if paths.is_empty() {
                "Editing files".to_string()
            } else {
                paths.join("; ")
            }))
        }
        "mcp_tool_call" => {
            let tool = str_field(item, "tool").unwrap_or("tool");
            Some(NormalizedMessage::tool_call(format!("MCP: {}", tool)))
        }
        "web_search" => {
            let query = str_field(item, "query").unwrap_or("");
            Some(NormalizedMessage::tool_call(format!("Search: {}", query)))
        }
        "error" => str_field(item, "message").map(NormalizedMessage::error),
        _ => None,
    }
}

fn normalize_legacy(msg: &Value) -> Option<NormalizedMessage> {
    match str_field(msg, "type")? {
        "session_configured" => str_field(msg, "session_id").map(NormalizedMessage::session),
        "agent_message" => str_field(msg, "message").map(NormalizedMessage::output),
        "agent_reasoning" => str_field(msg, "text").map(NormalizedMessage::thinking),
        "exec_command_begin" => {
            let command = msg
                .get("command")
                .and_then(|c| c.as_array())
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|p| p.as_str())
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .unwrap_or_else(|| "command".to_string());
            Some(NormalizedMessage::tool_call(format!(
                "Running: {}",
                truncate_str(&command, 60)
            )))
        }
        "error" | "stream_error" => str_field(msg, "message").map(NormalizedMessage::error),
        _ => None,
    }
}

impl Parser for CodexParser {
    fn parse(&self, line: &str) -> Option<NormalizedMessage> {
        let value = parse_json_line("codex", line)?;
        if let Some(msg) = value.get("msg") {
            return normalize_legacy(msg);
        }
        match str_field(&value, "type")? {
            "thread.started" => str_field(&value, "thread_id")
                .filter(|id| !id.is_empty())
                .map(NormalizedMessage::session),
            "item.completed" => value.get("item").and_then(normalize_item),
            "turn.failed" => {
                let message = value
                    .get("error")
                    .and_then(|e| str_field(e, "message"))
                    .unwrap_or("turn failed");
                Some(NormalizedMessage::error(message))
            }
            "error" => str_field(&value, "message").map(NormalizedMessage::error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::MessageKind;

    #[test]
    fn test_thread_started_yields_session() {
        let msg = CodexParser
            .parse(r#"{"type":"thread.started","thread_id":"0199a213-81c0"}"#)
            .unwrap();
        assert_eq!(msg.kind, MessageKind::SessionId);
        assert_eq!(msg.session_id.as_deref(), Some("0199a213-81c0"));
    }

    #[test]
    fn test_item_kinds() {
        let out = CodexParser
            .parse(r#"{"type":"item.completed","item":{"id":"item_3","type":"agent_message","text":"Done."}}"#)
            .unwrap();
        assert_eq!(out.kind, MessageKind::Output);
        assert_eq!(out.content, "Done.");

        let think = CodexParser
            .parse(r#"{"type":"item.completed","item":{"id":"item_0","type":"reasoning","text":"**Planning**"}}"#)
            .unwrap();
        assert_eq!(think.kind, MessageKind::Thinking);

        let cmd = CodexParser
            .parse(r#"{"type":"item.completed","item":{"id":"item_1","type":"command_execution","command":"bash -lc ls","exit_code":0,"status":"completed"}}"#)
            .unwrap();
        assert_eq!(cmd.kind, MessageKind::ToolCall);
        assert_eq!(cmd.content, "Running: bash -lc ls");

        let files = CodexParser
            .parse(r#"{"type":"item.completed","item":{"type":"file_change","changes":[{"path":"src/a.rs","kind":"add"}]}}"#)
            .unwrap();
        assert_eq!(files.content, "add src/a.rs");
    }

    #[test]
    fn test_turn_failed_is_error() {
        let msg = CodexParser
            .parse(r#"{"type":"turn.failed","error":{"message":"stream disconnected"}}"#)
            .unwrap();
        assert_eq!(msg.kind, MessageKind::Error);
        assert_eq!(msg.content, "stream disconnected");
    }

    #[test]
    fn test_legacy_envelope() {
        let msg = CodexParser
            .parse(r#"{"id":"0","msg":{"type":"session_configured","session_id":"legacy-1","model":"gpt-5"}}"#)
            .unwrap();
        assert_eq!(msg.kind, MessageKind::SessionId);
        assert_eq!(msg.content, "legacy-1");
    }

    #[test]
    fn test_ignores_noise() {
        assert!(CodexParser.parse(r#"{"type":"turn.started"}"#).is_none());
        assert!(CodexParser.parse(r#"{"type":"item.started","item":{"type":"agent_message"}}"#).is_none());
        assert!(CodexParser.parse("Reading prompt from stdin...").is_none());
        assert!(CodexParser.parse(r#"{"type":42}"#).is_none());
    }
}
