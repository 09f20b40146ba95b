//! `cube decide`: record a human decision and show the aggregated verdict.

use anyhow::{Context, Result, bail};
use std::path::Path;

use super::load_config;

/// A decision typed in on the command line in place of a judge's.
pub struct ManualDecision<'a> {
    pub judge: &'a str,
    pub decision: Option<&'a str>,
    pub winner: &'a str,
    pub blockers: &'a [String],
    pub recommendation: Option<&'a str>,
}

pub fn cmd_decide(
    project_dir: &Path,
    task_id: &str,
    peer: bool,
    manual: Option<ManualDecision<'_>>,
) -> Result<()> {
    use cube::decision::{Decision, DecisionAggregator, DecisionKind, DecisionStore, ReviewType, Winner};
    use cube::util::validate_id;

    validate_id("task", task_id).map_err(anyhow::Error::msg)?;
    let config = load_config(project_dir, false)?;
    let review_type = if peer {
        ReviewType::PeerReview
    } else {
        ReviewType::Initial
    };
    let judges = config.judges_for(review_type);
    let store = DecisionStore::new(&config.decisions_dir);

    if let Some(manual) = manual {
        if !judges.iter().any(|j| j.id == manual.judge) {
            let ids: Vec<&str> = judges.iter().map(|j| j.id.as_str()).collect();
            bail!(
                "'{}' is not a judge in the {} review (judges: {})",
                manual.judge,
                review_type,
                ids.join(", ")
            );
        }
        let Some(kind) = manual.decision else {
            bail!("--decision is required when recording a decision for {}", manual.judge);
        };
        let kind: DecisionKind = serde_json::from_value(serde_json::Value::String(kind.to_ascii_uppercase()))
            .with_context(|| format!("invalid decision '{}' (APPROVED, REQUEST_CHANGES or REJECTED)", kind))?;
        let winner: Winner = manual.winner.parse().map_err(anyhow::Error::msg)?;
        let blockers: Vec<&str> = manual.blockers.iter().map(String::as_str).collect();

        let decision = Decision::new(manual.judge, task_id, review_type, kind, winner)
            .with_blockers(&blockers)
            .with_recommendation(manual.recommendation.unwrap_or_default());
        let path = store.write(&decision)?;
        println!("Recorded {} decision for {} at {}", review_type, manual.judge, path.display());
    }

    let aggregator = DecisionAggregator::new(store, config.min_decisions());
    let verdict = aggregator.aggregate(task_id, review_type, &judges)?;

    println!();
    println!("{}", console::style(format!("{} review of {}", review_type, task_id)).bold());
    let votes: Vec<String> = verdict.tally.iter().map(|(w, n)| format!("{}={}", w, n)).collect();
    println!("  Winner:    {} ({})", verdict.winner, votes.join(" "));
    println!(
        "  Approved:  {}",
        if verdict.approved() {
            console::style("yes").green()
        } else {
            console::style("no").red()
        }
    );
    for decision in &verdict.decisions {
        println!("  {:<16} {} → {}", decision.judge, decision.decision, decision.winner);
    }
    for judge in &verdict.missing {
        println!("  {:<16} {}", judge, console::style("missing").dim());
    }
    for bad in &verdict.invalid {
        println!(
            "  {:<16} {} {} ({})",
            bad.judge,
            console::style("invalid").red(),
            bad.path.display(),
            bad.message
        );
    }
    if !verdict.average_scores.is_empty() {
        println!();
        println!("  Scores:");
        for (category, score) in &verdict.average_scores {
            println!("    {:<24} {:.1}", category, score);
        }
    }
    if !verdict.blockers.is_empty() {
        println!();
        println!("  Blockers:");
        for blocker in &verdict.blockers {
            println!("    - {}", blocker);
        }
    }
    println!();
    Ok(())
}
