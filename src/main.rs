use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "cube")]
#[command(version, about = "Competitive multi-agent code generation orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a task or continue it from its current phase
    Run {
        task_id: String,
        /// Markdown file describing the task (required the first time)
        #[arg(long)]
        prompt_file: Option<PathBuf>,
    },
    /// Show workflow state for one task, or list all tasks
    Status { task_id: Option<String> },
    /// Send a message to an agent's stored session
    Resume {
        task_id: String,
        agent_id: String,
        message: String,
    },
    /// Aggregate review decisions, optionally recording one by hand first
    Decide {
        task_id: String,
        /// Judge to record a decision for
        judge: Option<String>,
        /// Use the peer review instead of the initial review
        #[arg(long)]
        peer: bool,
        /// APPROVED, REQUEST_CHANGES or REJECTED
        #[arg(long, requires = "judge")]
        decision: Option<String>,
        /// Writer letter or TIE
        #[arg(long, default_value = "TIE")]
        winner: String,
        /// Blocking issue (repeatable)
        #[arg(long = "blocker", requires = "judge")]
        blockers: Vec<String>,
        #[arg(long, requires = "judge")]
        recommendation: Option<String>,
    },
    /// Move a task back to an earlier phase
    Reset {
        task_id: String,
        #[arg(long = "to")]
        to: u32,
    },
    /// Mark a task abandoned
    Abandon { task_id: String },
    /// Remove a task's state, sessions, decisions and worktrees
    Clean {
        task_id: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },
    /// List configured agents and whether their tools are installed
    Agents,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            task_id,
            prompt_file,
        } => {
            cmd::cmd_run(&cli, &project_dir, task_id, prompt_file.as_deref()).await?;
        }
        Commands::Status { task_id } => cmd::cmd_status(&project_dir, task_id.as_deref())?,
        Commands::Resume {
            task_id,
            agent_id,
            message,
        } => {
            cmd::cmd_resume(&cli, &project_dir, task_id, agent_id, message).await?;
        }
        Commands::Decide {
            task_id,
            judge,
            peer,
            decision,
            winner,
            blockers,
            recommendation,
        } => {
            let manual = judge.as_deref().map(|judge| cmd::ManualDecision {
                judge,
                decision: decision.as_deref(),
                winner,
                blockers,
                recommendation: recommendation.as_deref(),
            });
            cmd::cmd_decide(&project_dir, task_id, *peer, manual)?;
        }
        Commands::Reset { task_id, to } => cmd::cmd_reset(&project_dir, task_id, *to)?,
        Commands::Abandon { task_id } => cmd::cmd_abandon(&project_dir, task_id)?,
        Commands::Clean { task_id, force } => cmd::cmd_clean(&project_dir, task_id, *force).await?,
        Commands::Agents => cmd::cmd_agents(&project_dir).await?,
    }

    Ok(())
}
