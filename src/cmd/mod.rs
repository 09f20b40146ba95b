//! CLI command implementations.
//!
//! | Module    | Commands handled                        |
//! |-----------|-----------------------------------------|
//! | `run`     | `Run`, `Resume`                         |
//! | `task`    | `Status`, `Reset`, `Abandon`, `Clean`   |
//! | `decide`  | `Decide`                                |
//! | `agents`  | `Agents`                                |

pub mod agents;
pub mod decide;
pub mod run;
pub mod task;

pub use agents::cmd_agents;
pub use decide::{ManualDecision, cmd_decide};
pub use run::{cmd_resume, cmd_run};
pub use task::{cmd_abandon, cmd_clean, cmd_reset, cmd_status};

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use cube::adapters::AdapterRegistry;
use cube::config::Config;
use cube::orchestrator::Orchestrator;
use cube::session::SessionStore;
use cube::workflow::StateStore;
use cube::worktree::WorktreeManager;

/// Load configuration, create `.cube/` directories and print config warnings.
pub fn load_config(project_dir: &Path, verbose: bool) -> Result<Config> {
    let config = Config::new(project_dir.to_path_buf(), verbose)?;
    config.ensure_directories()?;
    for warning in config.validate() {
        eprintln!("{} {}", console::style("warning:").yellow().bold(), warning);
    }
    Ok(config)
}

pub fn state_store(config: &Config) -> StateStore {
    StateStore::new(&config.state_dir)
}

/// Worktree manager rooted at the configured directory. The base branch
/// comes from `[project] base_branch`, else the repository's current branch.
pub fn worktree_manager(config: &Config) -> Result<Arc<WorktreeManager>> {
    let base_branch = match &config.toml.project.base_branch {
        Some(branch) => branch.clone(),
        None => WorktreeManager::discover_base_branch(&config.project_dir)
            .context("cube needs to run inside a git repository")?,
    };
    Ok(Arc::new(WorktreeManager::new(
        &config.project_dir,
        &config.worktrees_dir,
        &base_branch,
    )))
}

pub fn orchestrator(config: &Config, worktrees: Arc<WorktreeManager>) -> Orchestrator {
    Orchestrator::new(
        AdapterRegistry::builtin(),
        worktrees,
        SessionStore::new(&config.sessions_dir),
        &config.logs_dir,
    )
    .with_preflight(config.toml.adapters.preflight)
}
