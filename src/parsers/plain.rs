//! Parser for generic command agents.
//!
//! A line that is a JSON object with a recognized `type` is taken as a
//! normalized message directly; any other non-empty line is plain output.

use serde::Deserialize;

use super::{MessageKind, NormalizedMessage, Parser};

#[derive(Debug, Deserialize)]
struct CanonicalLine {
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(default)]
    content: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PlainParser;

impl Parser for PlainParser {
    fn parse(&self, line: &str) -> Option<NormalizedMessage> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('{')
            && let Ok(canonical) = serde_json::from_str::<CanonicalLine>(trimmed)
        {
            return Some(match canonical.kind {
                MessageKind::SessionId => {
                    let id = canonical
                        .session_id
                        .filter(|s| !s.is_empty())
                        .unwrap_or(canonical.content);
                    if id.is_empty() {
                        return None;
                    }
                    NormalizedMessage::session(id)
                }
                kind => NormalizedMessage::new(kind, canonical.content)
                    .with_session(canonical.session_id),
            });
        }
        Some(NormalizedMessage::output(trimmed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_json() {
        let msg = PlainParser
            .parse(r#"{"type":"session_id","session_id":"cmd-1"}"#)
            .unwrap();
        assert_eq!(msg.kind, MessageKind::SessionId);
        assert_eq!(msg.session_id.as_deref(), Some("cmd-1"));

        let msg = PlainParser
            .parse(r#"{"type":"tool_call","content":"Running: make"}"#)
            .unwrap();
        assert_eq!(msg.kind, MessageKind::ToolCall);
        assert_eq!(msg.content, "Running: make");
    }

    #[test]
    fn test_plain_text_and_unknown_json() {
        assert_eq!(PlainParser.parse("hello").unwrap().kind, MessageKind::Output);
        let msg = PlainParser.parse(r#"{"type":"mystery"}"#).unwrap();
        assert_eq!(msg.kind, MessageKind::Output);
        assert_eq!(msg.content, r#"{"type":"mystery"}"#);
        assert!(PlainParser.parse("   ").is_none());
        assert!(PlainParser.parse(r#"{"type":"session_id"}"#).is_none());
    }
}
