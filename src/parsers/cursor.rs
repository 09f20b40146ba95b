//! Parser for `cursor-agent --output-format stream-json`.
//!
//! Cursor mirrors Claude's system/assistant/result events and adds its own
//! `tool_call` event.

use serde_json::Value;

use super::claude::{StreamEvent, normalize_event};
use super::{NormalizedMessage, Parser, parse_json_line};
use crate::util::truncate_str;

#[derive(Debug, Default, Clone, Copy)]
pub struct CursorParser;

fn describe_tool_call(call: &Value) -> String {
    let Some(obj) = call.as_object() else {
        return "tool call".to_string();
    };
    let Some((name, body)) = obj.iter().next() else {
        return "tool call".to_string();
    };
    let args = body.get("args").unwrap_or(body);
    let detail = args
        .get("path")
        .or_else(|| args.get("command"))
        .or_else(|| args.get("pattern"))
        .and_then(|v| v.as_str());
    let label = name.trim_end_matches("ToolCall");
    match detail {
        Some(d) => format!("{}: {}", label, truncate_str(d, 60)),
        None => label.to_string(),
    }
}

impl Parser for CursorParser {
    fn parse(&self, line: &str) -> Option<NormalizedMessage> {
        let value = parse_json_line("cursor", line)?;
        if value.get("type").and_then(|t| t.as_str()) == Some("tool_call") {
            if value.get("subtype").and_then(|s| s.as_str()) != Some("started") {
                return None;
            }
            let session = value
                .get("session_id")
                .and_then(|s| s.as_str())
                .map(String::from);
            let call = value.get("tool_call").cloned().unwrap_or(Value::Null);
            return Some(NormalizedMessage::tool_call(describe_tool_call(&call)).with_session(session));
        }
        serde_json::from_value::<StreamEvent>(value)
            .ok()
            .and_then(normalize_event)
    }
}
