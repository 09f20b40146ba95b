//! Configuration for cube.
//!
//! `CubeToml` is the on-disk `.cube/cube.toml`; `Config` resolves it against
//! the project directory and the environment into the paths and rosters the
//! rest of the crate works with.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::adapters::BUILTIN_KINDS;
use crate::agent::{AgentIdentity, AgentRole};
use crate::decision::ReviewType;
use crate::util::validate_id;

/// Project section of cube.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Branch new writer branches fork from. Defaults to the repo's HEAD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    /// Root for worktrees. Relative paths resolve against the project dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktrees_dir: Option<PathBuf>,
}

/// Review panel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSection {
    /// Minimum number of judge decisions that must be present to aggregate.
    #[serde(default = "default_min_decisions")]
    pub min_decisions: usize,
    /// Fix/peer-review rounds attempted before the fix phase halts.
    #[serde(default = "default_max_fix_rounds")]
    pub max_fix_rounds: u32,
}

fn default_min_decisions() -> usize {
    1
}

fn default_max_fix_rounds() -> u32 {
    2
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            min_decisions: default_min_decisions(),
            max_fix_rounds: default_max_fix_rounds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptersSection {
    /// Check each tool is installed before spawning it.
    #[serde(default = "default_preflight")]
    pub preflight: bool,
}

fn default_preflight() -> bool {
    true
}

impl Default for AdaptersSection {
    fn default() -> Self {
        Self {
            preflight: default_preflight(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSection {
    /// Push the winner's branch and open a pull request with `gh`.
    #[serde(default)]
    pub create_pr: bool,
    #[serde(default = "default_remote")]
    pub remote: String,
}

fn default_remote() -> String {
    "origin".to_string()
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            create_pr: false,
            remote: default_remote(),
        }
    }
}

/// Root structure of `.cube/cube.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CubeToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default = "default_writers")]
    pub writers: Vec<AgentIdentity>,
    #[serde(default = "default_judges")]
    pub judges: Vec<AgentIdentity>,
    #[serde(default)]
    pub review: ReviewSection,
    #[serde(default)]
    pub adapters: AdaptersSection,
    #[serde(default)]
    pub publish: PublishSection,
}

fn default_writers() -> Vec<AgentIdentity> {
    vec![
        AgentIdentity::writer("writer_a", "claude", "sonnet")
            .with_label("Writer A")
            .with_color("cyan"),
        AgentIdentity::writer("writer_b", "codex", "gpt-5-codex")
            .with_label("Writer B")
            .with_color("green"),
    ]
}

fn default_judges() -> Vec<AgentIdentity> {
    vec![
        AgentIdentity::judge("judge_1", "claude", "opus")
            .with_label("Judge 1")
            .with_color("magenta"),
        AgentIdentity::judge("judge_2", "codex", "gpt-5")
            .with_label("Judge 2")
            .with_color("yellow"),
        AgentIdentity::judge("judge_3", "gemini", "gemini-2.5-pro")
            .with_label("Judge 3")
            .with_color("blue"),
    ]
}

impl Default for CubeToml {
    fn default() -> Self {
        Self {
            project: ProjectSection::default(),
            writers: default_writers(),
            judges: default_judges(),
            review: ReviewSection::default(),
            adapters: AdaptersSection::default(),
            publish: PublishSection::default(),
        }
    }
}

impl CubeToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration and assign roles from the table each agent is in.
    pub fn parse(content: &str) -> Result<Self> {
        let mut parsed: Self = toml::from_str(content).context("Failed to parse cube.toml")?;
        for writer in &mut parsed.writers {
            writer.role = AgentRole::Writer;
        }
        for judge in &mut parsed.judges {
            judge.role = AgentRole::Judge;
        }
        parsed.check_agent_ids()?;
        Ok(parsed)
    }

    /// Agent ids name worktree directories, branches and log files, so they
    /// must be unique and path-safe.
    fn check_agent_ids(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for agent in self.writers.iter().chain(self.judges.iter()) {
            validate_id("agent", &agent.id).map_err(anyhow::Error::msg)?;
            if !seen.insert(agent.id.as_str()) {
                bail!("Duplicate agent id '{}' in cube.toml", agent.id);
            }
        }
        Ok(())
    }

    /// Load `.cube/cube.toml`, or the built-in roster if it doesn't exist.
    pub fn load_or_default(cube_dir: &Path) -> Result<Self> {
        let path = cube_dir.join("cube.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize cube.toml")?;
        crate::util::atomic_write(path, content.as_bytes())
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return human-readable warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.writers.is_empty() {
            warnings.push("No writers configured; at least one [[writers]] entry is required".into());
        }
        if self.writers.len() > 26 {
            warnings.push(format!(
                "{} writers configured; judges can only name writers A through Z",
                self.writers.len()
            ));
        }
        if self.judges.iter().all(|j| j.peer_review_only) {
            warnings.push("No judges take part in the initial review".into());
        }

        for agent in self.writers.iter().chain(self.judges.iter()) {
            if !BUILTIN_KINDS.contains(&agent.adapter.as_str()) {
                warnings.push(format!(
                    "Agent '{}' uses unknown adapter '{}' (known: {})",
                    agent.id,
                    agent.adapter,
                    BUILTIN_KINDS.join(", ")
                ));
            }
            if agent.adapter == "command" && agent.command.as_ref().is_none_or(|c| c.is_empty()) {
                warnings.push(format!(
                    "Agent '{}' uses the command adapter but sets no command",
                    agent.id
                ));
            }
        }
        for writer in &self.writers {
            if writer.peer_review_only {
                warnings.push(format!(
                    "Writer '{}' sets peer_review_only, which only applies to judges",
                    writer.id
                ));
            }
        }

        let initial_judges = self.judges.iter().filter(|j| !j.peer_review_only).count();
        if self.review.min_decisions > initial_judges.max(1) {
            warnings.push(format!(
                "review.min_decisions is {} but only {} judge(s) take part in the initial review",
                self.review.min_decisions, initial_judges
            ));
        }
        if self.review.min_decisions == 0 {
            warnings.push("review.min_decisions is 0; treating it as 1".into());
        }

        warnings
    }
}

/// Runtime configuration for cube.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub cube_dir: PathBuf,
    pub state_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub decisions_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub tasks_dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub worktrees_dir: PathBuf,
    pub verbose: bool,
    pub toml: CubeToml,
}

impl Config {
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let cube_dir = project_dir.join(".cube");
        let toml = CubeToml::load_or_default(&cube_dir)?;
        let worktrees_dir = resolve_worktrees_dir(&project_dir, &toml);

        Ok(Self {
            state_dir: cube_dir.join("state"),
            sessions_dir: cube_dir.join("sessions"),
            decisions_dir: cube_dir.join("decisions"),
            logs_dir: cube_dir.join("logs"),
            tasks_dir: cube_dir.join("tasks"),
            prompts_dir: cube_dir.join("prompts"),
            cube_dir,
            worktrees_dir,
            project_dir,
            verbose,
            toml,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.state_dir,
            &self.sessions_dir,
            &self.decisions_dir,
            &self.logs_dir,
            &self.tasks_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }

    pub fn writers(&self) -> &[AgentIdentity] {
        &self.toml.writers
    }

    /// Judges taking part in the given review type.
    pub fn judges_for(&self, review_type: ReviewType) -> Vec<AgentIdentity> {
        self.toml
            .judges
            .iter()
            .filter(|j| review_type == ReviewType::PeerReview || !j.peer_review_only)
            .cloned()
            .collect()
    }

    pub fn agent(&self, id: &str) -> Option<&AgentIdentity> {
        self.toml
            .writers
            .iter()
            .chain(self.toml.judges.iter())
            .find(|a| a.id == id)
    }

    pub fn min_decisions(&self) -> usize {
        self.toml.review.min_decisions.max(1)
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.tasks_dir.join(task_id)
    }
}

/// Worktree root: cube.toml, then `CUBE_WORKTREES_DIR`, then
/// `~/.cube/worktrees/<repo-name>`.
fn resolve_worktrees_dir(project_dir: &Path, toml: &CubeToml) -> PathBuf {
    if let Some(dir) = &toml.project.worktrees_dir {
        return if dir.is_absolute() {
            dir.clone()
        } else {
            project_dir.join(dir)
        };
    }
    if let Ok(dir) = std::env::var("CUBE_WORKTREES_DIR")
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    let repo_name = project_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string());
    match dirs::home_dir() {
        Some(home) => home.join(".cube").join("worktrees").join(repo_name),
        None => project_dir.join(".cube").join("worktrees"),
    }
}
