//! `cube agents`: the configured roster and whether each tool is usable.

use anyhow::Result;
use std::path::Path;

use super::load_config;

pub async fn cmd_agents(project_dir: &Path) -> Result<()> {
    use cube::adapters::AdapterRegistry;
    use cube::agent::AgentIdentity;
    use futures::future::join_all;

    let config = load_config(project_dir, false)?;
    let registry = AdapterRegistry::builtin();
    let agents: Vec<&AgentIdentity> = config.writers().iter().chain(config.toml.judges.iter()).collect();

    let checks = agents.iter().map(|identity| {
        let registry = &registry;
        async move {
            match registry.resolve(identity) {
                Some(pair) => {
                    let installed = pair.adapter.check_installed().await;
                    (Some(installed), pair.adapter.install_instructions())
                }
                None => (None, format!("Unknown adapter '{}'", identity.adapter)),
            }
        }
    });
    let results = join_all(checks).await;

    println!();
    println!(
        "{:<16} {:<8} {:<8} {:<24} Status",
        "Agent", "Role", "Adapter", "Model"
    );
    println!(
        "{:<16} {:<8} {:<8} {:<24} ------",
        "----------------", "--------", "--------", "------------------------"
    );
    let mut missing = Vec::new();
    for (identity, (installed, instructions)) in agents.iter().zip(results) {
        let role = if identity.peer_review_only {
            format!("{}*", identity.role)
        } else {
            identity.role.to_string()
        };
        let status = match installed {
            Some(true) => console::style("ready").green(),
            Some(false) => console::style("missing").red(),
            None => console::style("unknown").red(),
        };
        println!(
            "{:<16} {:<8} {:<8} {:<24} {}",
            identity.id, role, identity.adapter, identity.model, status
        );
        if installed != Some(true) {
            missing.push((identity.id.as_str(), instructions));
        }
    }
    if config.toml.judges.iter().any(|j| j.peer_review_only) {
        println!();
        println!("{}", console::style("* peer review only").dim());
    }

    if !missing.is_empty() {
        println!();
        for (id, instructions) in missing {
            println!("{}: {}", console::style(id).bold(), instructions);
        }
    }
    println!();
    Ok(())
}
