//! Driving agents: `cube run` and `cube resume`.

use anyhow::{Context, Result, bail};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::super::Cli;
use super::{load_config, orchestrator, state_store, worktree_manager};

/// Cancel the returned token on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "\n{}",
                console::style("Interrupted; stopping agents...").yellow()
            );
            trigger.cancel();
        }
    });
    token
}

pub async fn cmd_run(
    cli: &Cli,
    project_dir: &Path,
    task_id: &str,
    prompt_file: Option<&Path>,
) -> Result<()> {
    use cube::decision::{DecisionAggregator, DecisionStore};
    use cube::ui::LiveDisplay;
    use cube::workflow::{LiveEffects, MachineSettings, PromptLibrary, WorkflowMachine};

    let config = load_config(project_dir, cli.verbose)?;
    let _log_guard = cube::logging::init(cli.verbose, &config.logs_dir)?;

    let prompt = prompt_file
        .map(|path| {
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read prompt file {}", path.display()))
        })
        .transpose()?;

    let worktrees = worktree_manager(&config)?;
    let base_branch = worktrees.base_branch().to_string();
    let (sink, display) = LiveDisplay::spawn(cli.verbose);

    let aggregator = DecisionAggregator::new(
        DecisionStore::new(&config.decisions_dir),
        config.min_decisions(),
    );
    let effects = LiveEffects::new(
        &config,
        orchestrator(&config, worktrees),
        aggregator,
        Arc::new(sink),
    );
    let machine = WorkflowMachine::new(
        effects,
        state_store(&config),
        PromptLibrary::new(&config.prompts_dir),
        MachineSettings::from_config(&config, &base_branch),
    );

    let state = machine.start(task_id, prompt.as_deref())?;
    println!(
        "{} task {} at phase {} ({} path)",
        console::style("cube").bold(),
        console::style(task_id).cyan(),
        state.current_phase,
        state.path
    );

    let cancel = cancel_on_ctrl_c();
    let result = machine.run(task_id, &cancel).await;
    // Dropping the machine closes the event channel so the display drains.
    drop(machine);
    let _ = display.await;

    let run = result?;
    println!();
    println!(
        "{} Task {} {} (winner {}, {} path)",
        console::style("✓").green().bold(),
        task_id,
        run.state.status,
        run.state.winner.as_deref().unwrap_or("-"),
        run.state.path
    );
    if let Some(report) = run.published {
        println!("  Branch: {}", report.branch);
        println!("  Patch:  {}", report.patch_path.display());
        if let Some(url) = report.pr_url {
            println!("  PR:     {}", url);
        }
        if !report.diff_stat.trim().is_empty() {
            println!();
            println!("{}", report.diff_stat.trim_end());
        }
    }
    Ok(())
}

pub async fn cmd_resume(
    cli: &Cli,
    project_dir: &Path,
    task_id: &str,
    agent_id: &str,
    message: &str,
) -> Result<()> {
    use cube::orchestrator::{AgentAssignment, PhaseRequest};
    use cube::session::SessionStore;
    use cube::ui::LiveDisplay;
    use cube::util::validate_id;

    validate_id("task", task_id).map_err(anyhow::Error::msg)?;
    let config = load_config(project_dir, cli.verbose)?;
    let _log_guard = cube::logging::init(cli.verbose, &config.logs_dir)?;

    let Some(identity) = config.agent(agent_id).cloned() else {
        bail!(
            "Unknown agent '{}'. Run `cube agents` to list the configured agents.",
            agent_id
        );
    };
    let phase = state_store(&config)
        .load(task_id)?
        .map(|s| s.current_phase)
        .unwrap_or(0);
    if SessionStore::new(&config.sessions_dir)
        .load(agent_id, task_id)?
        .is_none()
    {
        eprintln!(
            "{} no stored session for {} on task {}; starting a new one",
            console::style("note:").dim(),
            agent_id,
            task_id
        );
    }

    let orchestrator = orchestrator(&config, worktree_manager(&config)?);
    let (sink, display) = LiveDisplay::spawn(cli.verbose);
    let request = PhaseRequest {
        task_id: task_id.to_string(),
        phase,
        label: "resume".to_string(),
        assignments: vec![AgentAssignment::new(identity, message)],
    };

    let cancel = cancel_on_ctrl_c();
    let outcome = orchestrator.run_phase(request, Arc::new(sink), &cancel).await;
    let _ = display.await;
    let outcome = outcome?;

    match outcome.result_for(agent_id) {
        Some(result) if result.succeeded() => {
            println!(
                "{} {} finished (log: {})",
                console::style("✓").green().bold(),
                agent_id,
                result.log_path.display()
            );
            Ok(())
        }
        Some(result) => bail!(
            "{} failed: {} (log: {})",
            agent_id,
            result
                .failure
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_else(|| result.status.to_string()),
            result.log_path.display()
        ),
        None => bail!("{} did not run", agent_id),
    }
}
