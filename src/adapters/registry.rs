//! Closed mapping from adapter key to adapter/parser pair.

use std::collections::BTreeMap;

use super::{Adapter, ClaudeAdapter, CodexAdapter, CommandAdapter, CursorAdapter, GeminiAdapter};
use crate::agent::AgentIdentity;
use crate::parsers::{ClaudeParser, CodexParser, CursorParser, GeminiParser, Parser, PlainParser};

/// The adapter and parser resolved for one agent.
pub struct ToolPair {
    pub adapter: Box<dyn Adapter>,
    pub parser: Box<dyn Parser>,
}

pub type ToolFactory = fn(&AgentIdentity) -> ToolPair;

#[derive(Clone)]
pub struct AdapterRegistry {
    tools: BTreeMap<String, ToolFactory>,
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Registry with every built-in tool.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("claude", |identity| ToolPair {
            adapter: Box::new(ClaudeAdapter::from_identity(identity)),
            parser: Box::new(ClaudeParser),
        });
        registry.register("codex", |identity| ToolPair {
            adapter: Box::new(CodexAdapter::from_identity(identity)),
            parser: Box::new(CodexParser),
        });
        registry.register("gemini", |identity| ToolPair {
            adapter: Box::new(GeminiAdapter::from_identity(identity)),
            parser: Box::new(GeminiParser),
        });
        registry.register("cursor", |identity| ToolPair {
            adapter: Box::new(CursorAdapter::from_identity(identity)),
            parser: Box::new(CursorParser),
        });
        registry.register("command", |identity| ToolPair {
            adapter: Box::new(CommandAdapter::from_identity(identity)),
            parser: Box::new(PlainParser),
        });
        registry
    }

    pub fn register(&mut self, kind: &str, factory: ToolFactory) {
        self.tools.insert(kind.to_string(), factory);
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.tools.contains_key(kind)
    }

    /// Build the tool pair for `identity`, or `None` for an unknown adapter key.
    pub fn resolve(&self, identity: &AgentIdentity) -> Option<ToolPair> {
        self.tools.get(&identity.adapter).map(|factory| factory(identity))
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::BUILTIN_KINDS;

    #[test]
    fn test_builtin_matches_known_kinds() {
        let registry = AdapterRegistry::builtin();
        let mut expected: Vec<&str> = BUILTIN_KINDS.to_vec();
        expected.sort();
        assert_eq!(registry.kinds(), expected);
    }

    #[test]
    fn test_resolve() {
        let registry = AdapterRegistry::builtin();
        let gemini = registry
            .resolve(&AgentIdentity::judge("j", "gemini", "flash"))
            .unwrap();
        assert_eq!(gemini.adapter.kind(), "gemini");
        assert!(registry
            .resolve(&AgentIdentity::judge("j", "copilot", "x"))
            .is_none());
    }

    #[test]
    fn test_resolve_uses_identity_command() {
        let registry = AdapterRegistry::builtin();
        let identity = AgentIdentity::writer("w", "command", "m").with_command(&["sh", "-c", "echo hi"]);
        let pair = registry.resolve(&identity).unwrap();
        let spec = pair.adapter.command(&crate::adapters::Invocation {
            worktree: std::path::PathBuf::from("."),
            model: "m".into(),
            prompt: "p".into(),
            session_id: None,
            resume: false,
        });
        assert_eq!(spec.program, "sh");
        assert_eq!(spec.args, vec!["-c", "echo hi"]);
        assert!(pair.parser.parse("hi").is_some());
    }
}
