//! Prompt templates for each phase.
//!
//! Built-in templates can be replaced per project by dropping a file named
//! `<name>.md` into `.cube/prompts/`. Templates use `{name}` placeholders;
//! unknown placeholders are left untouched.

use std::path::PathBuf;

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Writer,
    InitialReview,
    Synthesis,
    PeerReview,
    Fix,
}

impl PromptKind {
    pub fn name(&self) -> &'static str {
        match self {
            PromptKind::Writer => "writer",
            PromptKind::InitialReview => "initial-review",
            PromptKind::Synthesis => "synthesis",
            PromptKind::PeerReview => "peer-review",
            PromptKind::Fix => "fix",
        }
    }

    fn builtin(&self) -> &'static str {
        match self {
            PromptKind::Writer => WRITER,
            PromptKind::InitialReview => INITIAL_REVIEW,
            PromptKind::Synthesis => SYNTHESIS,
            PromptKind::PeerReview => PEER_REVIEW,
            PromptKind::Fix => FIX,
        }
    }
}

const WRITER: &str = "\
# Task {task_id}

You are writer {slot} working in your own git worktree at `{worktree}` on branch `{branch}`.
Other writers are solving the same task independently on their own branches.

## Task

{task}

## Rules

- Work only inside `{worktree}`.
- Commit your work on `{branch}` with clear messages when you are done.
- Do not push, and do not touch other branches.
";

const DECISION_FORMAT: &str = "\
Write your decision as a single JSON object to `{decision_path}`:

```json
{
  \"judge\": \"{judge_id}\",
  \"task_id\": \"{task_id}\",
  \"review_type\": \"{review_type}\",
  \"decision\": \"APPROVED | REQUEST_CHANGES | REJECTED\",
  \"winner\": \"{winner_choices}\",
  \"scores\": {\"correctness\": 0, \"quality\": 0, \"tests\": 0},
  \"blocker_issues\": [\"issues that must be fixed before merging\"],
  \"recommendation\": \"one paragraph\"
}
```

Write the file once, when your review is complete.
";

const INITIAL_REVIEW: &str = "\
# Review of task {task_id}

You are judge `{judge_id}`. Several writers implemented the same task on separate branches.
Compare them and pick the best one.

## Task

{task}

## Candidates

{candidates}

Inspect each branch with `git diff {base_branch}...<branch>` from `{repo}`.
Do not modify any branch.

{decision_format}";

const SYNTHESIS: &str = "\
# Synthesis for task {task_id}

Your branch `{branch}` was chosen to go forward, but the judges want changes.
Fold in the review feedback and anything worth keeping from the other branches.

## Other branches

{others}

## Blockers raised by the judges

{blockers}

## Judge recommendations

{recommendations}

Commit the result on `{branch}` when you are done.
";

const PEER_REVIEW: &str = "\
# Peer review of task {task_id}

You are judge `{judge_id}`. Review branch `{branch}` (worktree `{worktree}`) against `{base_branch}`.
This is the branch that will be published; approve it only if it is ready to merge.

## Task

{task}

Inspect it with `git diff {base_branch}...{branch}` from `{repo}`. Do not modify the branch.

{decision_format}";

const FIX: &str = "\
# Fix round {round} for task {task_id}

The judges have not approved `{branch}` yet. Address every blocker below, then commit.

## Blockers

{blockers}

## Judge recommendations

{recommendations}
";

/// Loads templates, preferring project overrides.
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    dir: PathBuf,
}

impl PromptLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn template(&self, kind: PromptKind) -> String {
        let path = self.dir.join(format!("{}.md", kind.name()));
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                debug!(path = %path.display(), "using prompt override");
                content
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => kind.builtin().to_string(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read prompt override, using built-in");
                kind.builtin().to_string()
            }
        }
    }

    /// Render `kind` with `vars`. Judge templates get the decision format
    /// section filled in first so its placeholders are substituted too.
    pub fn render(&self, kind: PromptKind, vars: &[(&str, &str)]) -> String {
        let template = self
            .template(kind)
            .replace("{decision_format}", DECISION_FORMAT);
        fill(&template, vars)
    }
}

/// Replace each `{key}` with its value, in a single pass so values that
/// contain braces are never re-expanded.
pub fn fill(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let replaced = after.find('}').and_then(|end| {
            let key = &after[..end];
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (end, *v))
        });
        match replaced {
            Some((end, value)) => {
                out.push_str(value);
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Markdown bullet list, or a placeholder line when empty.
pub fn bullets(items: &[String], empty: &str) -> String {
    if items.is_empty() {
        return format!("- {}", empty);
    }
    items
        .iter()
        .map(|i| format!("- {}", i))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fill_replaces_known_keys_only() {
        let out = fill("a {x} b {y} {json: 1}", &[("x", "1"), ("y", "{x}")]);
        assert_eq!(out, "a 1 b {x} {json: 1}");
    }

    #[test]
    fn test_judge_prompt_includes_decision_path() {
        let dir = TempDir::new().unwrap();
        let prompts = PromptLibrary::new(dir.path());
        let text = prompts.render(
            PromptKind::InitialReview,
            &[
                ("task_id", "t1"),
                ("judge_id", "judge_1"),
                ("decision_path", "/tmp/d/judge_1.json"),
                ("review_type", "initial"),
                ("winner_choices", "A | B | TIE"),
            ],
        );
        assert!(text.contains("/tmp/d/judge_1.json"));
        assert!(text.contains("\"judge\": \"judge_1\""));
        assert!(text.contains("\"correctness\": 0"));
    }

    #[test]
    fn test_override_from_prompts_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("writer.md"), "custom {task_id}").unwrap();
        let prompts = PromptLibrary::new(dir.path());
        assert_eq!(prompts.render(PromptKind::Writer, &[("task_id", "t9")]), "custom t9");
    }

    #[test]
    fn test_bullets() {
        assert_eq!(bullets(&[], "none"), "- none");
        assert_eq!(bullets(&["a".into(), "b".into()], "none"), "- a\n- b");
    }
}
