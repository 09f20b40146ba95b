//! Task bookkeeping: `cube status`, `cube reset`, `cube abandon`, `cube clean`.

use anyhow::Result;
use std::path::Path;

use super::{load_config, state_store, worktree_manager};

pub fn cmd_status(project_dir: &Path, task_id: Option<&str>) -> Result<()> {
    use cube::util::validate_id;

    if let Some(task_id) = task_id {
        validate_id("task", task_id).map_err(anyhow::Error::msg)?;
    }
    let config = load_config(project_dir, false)?;
    match task_id {
        Some(task_id) => show_task(&config, task_id),
        None => list_tasks(&config),
    }
}

fn list_tasks(config: &cube::config::Config) -> Result<()> {
    use cube::workflow::phase_kind;

    let states = state_store(config).list()?;
    if states.is_empty() {
        println!();
        println!("No tasks yet. Start one with `cube run <task> --prompt-file <file>`.");
        println!();
        return Ok(());
    }

    println!();
    println!(
        "{:<24} {:<10} {:<14} {:<16} Winner",
        "Task", "Status", "Path", "Phase"
    );
    println!(
        "{:<24} {:<10} {:<14} {:<16} ------",
        "------------------------", "----------", "--------------", "----------------"
    );
    for entry in states {
        match entry {
            Ok(state) => {
                let phase = match phase_kind(state.path, state.current_phase) {
                    Some(kind) => format!("{} {}", state.current_phase, kind),
                    None => state.current_phase.to_string(),
                };
                println!(
                    "{:<24} {:<10} {:<14} {:<16} {}",
                    state.task_id,
                    state.status,
                    state.path,
                    phase,
                    state.winner.as_deref().unwrap_or("-")
                );
            }
            Err(e) => println!("{}", console::style(e).red()),
        }
    }
    println!();
    Ok(())
}

fn show_task(config: &cube::config::Config, task_id: &str) -> Result<()> {
    use cube::decision::{DecisionStore, ReviewType};
    use cube::errors::WorkflowError;
    use cube::session::SessionStore;
    use cube::workflow::{last_phase, phase_kind};

    let Some(state) = state_store(config).load(task_id)? else {
        return Err(WorkflowError::UnknownTask(task_id.to_string()).into());
    };

    println!();
    println!("Task:     {}", console::style(&state.task_id).bold());
    println!("Status:   {}", state.status);
    println!("Path:     {}", state.path);
    let name = phase_kind(state.path, state.current_phase)
        .map(|k| k.to_string())
        .unwrap_or_else(|| "?".into());
    println!(
        "Phase:    {} of {} ({})",
        state.current_phase,
        last_phase(state.path),
        name
    );
    println!("Winner:   {}", state.winner.as_deref().unwrap_or("-"));
    if let Some(base) = &state.base_branch {
        println!("Base:     {}", base);
    }
    let history: Vec<String> = state.history.iter().map(u32::to_string).collect();
    println!("History:  {}", if history.is_empty() { "-".into() } else { history.join(" → ") });
    if state.fix_rounds > 0 {
        println!("Fixes:    {} round(s)", state.fix_rounds);
    }
    if !state.phase_agents_done.is_empty() {
        println!(
            "Done:     {} (this phase)",
            state.phase_agents_done.join(", ")
        );
    }
    println!("Updated:  {}", state.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));

    let sessions = SessionStore::new(&config.sessions_dir).list(task_id)?;
    if !sessions.is_empty() {
        println!();
        println!("Sessions:");
        for record in sessions {
            println!("  {:<16} {}", record.agent_id, record.session_id);
        }
    }

    let decisions = DecisionStore::new(&config.decisions_dir);
    for review_type in [ReviewType::Initial, ReviewType::PeerReview] {
        let judges = config.judges_for(review_type);
        if judges.is_empty() {
            continue;
        }
        let present = decisions.present(task_id, review_type);
        let rounds = decisions.archived_rounds(task_id, review_type);
        if present.is_empty() && rounds == 0 {
            continue;
        }
        println!();
        print!("Decisions ({}):", review_type);
        if rounds > 0 {
            print!(" {} archived round(s)", rounds);
        }
        println!();
        for judge in &judges {
            let mark = if present.contains(&judge.id) {
                console::style("✓").green()
            } else {
                console::style("·").dim()
            };
            println!("  {} {}", mark, judge.id);
        }
    }
    println!();
    Ok(())
}

pub fn cmd_reset(project_dir: &Path, task_id: &str, to: u32) -> Result<()> {
    use cube::decision::{DecisionStore, ReviewType};
    use cube::errors::WorkflowError;
    use cube::util::validate_id;
    use cube::workflow::{PhaseKind, phases};

    validate_id("task", task_id).map_err(anyhow::Error::msg)?;
    let config = load_config(project_dir, false)?;
    let states = state_store(&config);
    let Some(mut state) = states.load(task_id)? else {
        return Err(WorkflowError::UnknownTask(task_id.to_string()).into());
    };
    let from = state.current_phase;
    state.reset_to(to)?;

    // Reviews at or after the target phase start over with a fresh round.
    let decisions = DecisionStore::new(&config.decisions_dir);
    for (index, kind) in phases(state.path).iter().enumerate() {
        let review_type = match kind {
            PhaseKind::InitialReview => ReviewType::Initial,
            PhaseKind::PeerReview => ReviewType::PeerReview,
            _ => continue,
        };
        if index as u32 + 1 >= to
            && let Some(round) = decisions.archive_round(task_id, review_type)?
        {
            println!("Archived {} decisions as round {}", review_type, round);
        }
    }

    states.save_reset(&state)?;
    println!("Task {} reset from phase {} to phase {}", task_id, from, to);
    Ok(())
}

pub fn cmd_abandon(project_dir: &Path, task_id: &str) -> Result<()> {
    use cube::errors::WorkflowError;
    use cube::util::validate_id;
    use cube::workflow::TaskStatus;

    validate_id("task", task_id).map_err(anyhow::Error::msg)?;
    let config = load_config(project_dir, false)?;
    let states = state_store(&config);
    let Some(mut state) = states.load(task_id)? else {
        return Err(WorkflowError::UnknownTask(task_id.to_string()).into());
    };
    if state.is_terminal() {
        println!("Task {} is already {}", task_id, state.status);
        return Ok(());
    }
    state.mark(TaskStatus::Abandoned);
    states.save(&state)?;
    println!("Task {} abandoned at phase {}", task_id, state.current_phase);
    Ok(())
}

pub async fn cmd_clean(project_dir: &Path, task_id: &str, force: bool) -> Result<()> {
    use cube::decision::DecisionStore;
    use cube::session::SessionStore;
    use cube::util::validate_id;
    use dialoguer::Confirm;

    validate_id("task", task_id).map_err(anyhow::Error::msg)?;
    let config = load_config(project_dir, false)?;

    if !force {
        let confirm = Confirm::new()
            .with_prompt(format!(
                "Remove all state, sessions, decisions and worktrees of task {}?",
                task_id
            ))
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Clean cancelled");
            return Ok(());
        }
    }

    let removed_state = state_store(&config).remove(task_id)?;
    let sessions = SessionStore::new(&config.sessions_dir).clear(task_id)?;
    DecisionStore::new(&config.decisions_dir).clear(task_id)?;
    for dir in [config.task_dir(task_id), config.logs_dir.join(task_id)] {
        if dir.exists() {
            std::fs::remove_dir_all(&dir).ok();
        }
    }

    let agents: Vec<String> = config
        .writers()
        .iter()
        .chain(config.toml.judges.iter())
        .map(|a| a.id.clone())
        .collect();
    match worktree_manager(&config) {
        Ok(worktrees) => worktrees.remove_task(task_id, &agents, true).await?,
        Err(e) => eprintln!(
            "{} skipping worktrees: {:#}",
            console::style("warning:").yellow().bold(),
            e
        ),
    }

    println!(
        "Cleaned task {} ({}, {} session(s))",
        task_id,
        if removed_state { "state removed" } else { "no state" },
        sessions
    );
    Ok(())
}
