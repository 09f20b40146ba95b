//! Parser for Claude Code's `--output-format stream-json` events.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{NormalizedMessage, Parser, describe_tool_use, join_nonempty, parse_json_line};

/// Events from Claude's stream-json output format.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum StreamEvent {
    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },

    #[serde(other)]
    Unknown,
}

/// Collapse an assistant message into one normalized message.
///
/// Tool calls win over text, and text over thinking, when a single event
/// carries several block kinds.
pub(crate) fn normalize_assistant(message: AssistantMessage) -> Option<NormalizedMessage> {
    let mut tools = Vec::new();
    let mut texts = Vec::new();
    let mut thoughts = Vec::new();
    for block in message.content {
        match block {
            ContentBlock::ToolUse { name, input } => tools.push(describe_tool_use(&name, &input)),
            ContentBlock::Text { text } => texts.push(text),
            ContentBlock::Thinking { thinking } => thoughts.push(thinking),
            ContentBlock::Unknown => {}
        }
    }

    if !tools.is_empty() {
        Some(NormalizedMessage::tool_call(tools.join("; ")))
    } else if let Some(text) = join_nonempty(texts) {
        Some(NormalizedMessage::output(text))
    } else {
        join_nonempty(thoughts).map(NormalizedMessage::thinking)
    }
}

pub(crate) fn normalize_event(event: StreamEvent) -> Option<NormalizedMessage> {
    match event {
        StreamEvent::System {
            subtype,
            session_id: Some(id),
        } if subtype == "init" && !id.is_empty() => Some(NormalizedMessage::session(id)),
        StreamEvent::System { .. } => None,
        StreamEvent::Assistant {
            message,
            session_id,
        } => normalize_assistant(message).map(|m| m.with_session(session_id)),
        StreamEvent::Result {
            subtype,
            result,
            is_error,
            session_id,
        } => {
            let msg = if is_error {
                NormalizedMessage::error(result.unwrap_or(subtype))
            } else {
                NormalizedMessage::output(result.filter(|r| !r.is_empty())?)
            };
            Some(msg.with_session(session_id))
        }
        StreamEvent::Unknown => None,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ClaudeParser;

impl Parser for ClaudeParser {
    fn parse(&self, line: &str) -> Option<NormalizedMessage> {
        let value = parse_json_line("claude", line)?;
        match serde_json::from_value::<StreamEvent>(value) {
            Ok(event) => normalize_event(event),
            Err(e) => {
                debug!(error = %e, "claude event did not match the expected shape");
                None
            }
        }
    }
}
