//! `agentpilot run`: execute a workflow once.

use agentpilot_core::execution::ExecutionStatus;
use agentpilot_workflow::{ExecutionManager, ExecutionReport, Workflow};
use anyhow::{Context, bail, ensure};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::runtime;

pub async fn run(
    config_path: Option<&Path>,
    workflow_path: &Path,
    input: Option<&str>,
    agent_score: Option<f64>,
) -> anyhow::Result<()> {
    let config = runtime::load_config(config_path)?;
    let mut workflow =
        Workflow::load(workflow_path).with_context(|| format!("failed to load {}", workflow_path.display()))?;
    if let Some(score) = agent_score {
        ensure!((0.0..=10.0).contains(&score), "--agent-score must be within 0..=10");
        workflow.agent_score = Some(score);
    }
    let input = runtime::parse_input(input)?;

    if config.api_key.is_none() && workflow.steps.iter().any(|s| s.step_type().invokes_model()) {
        warn!("no API key configured; model steps will fail (set AGENTPILOT_API_KEY or OPENAI_API_KEY)");
    }

    let collab = runtime::collaborators(&config).await?;
    let manager = ExecutionManager::new(config, collab);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    println!("▶ Running '{}' ({} steps)", workflow.name, workflow.step_count());
    let report = manager.run_with_cancel(&workflow, input, cancel).await;
    print_report(&report)?;

    match report.status() {
        ExecutionStatus::Completed | ExecutionStatus::PartialSuccess => Ok(()),
        status => bail!(
            "run {} ended {}: {}",
            report.record.id,
            status,
            report.record.reason.as_deref().unwrap_or("no reason recorded")
        ),
    }
}

fn print_report(report: &ExecutionReport) -> anyhow::Result<()> {
    let record = &report.record;
    println!();
    for decision in &report.decisions {
        println!(
            "   step {:>2}  {:<13} {:<8} {:<20} complexity {:.2}  ({})",
            decision.step_index,
            decision.step_type,
            decision.tier,
            decision.model_id,
            decision.effective_complexity,
            decision.source
        );
    }
    println!();
    println!("   Execution: {}", record.id);
    println!("   Status:    {}", record.status);
    if let Some(reason) = &record.reason {
        println!("   Reason:    {reason}");
    }
    println!(
        "   Steps:     {} executed, {} skipped, {} failed",
        record.steps_executed, record.steps_skipped, record.steps_failed
    );
    println!(
        "   Tokens:    {} ({} in / {} out)",
        record.total_tokens(),
        record.input_tokens,
        record.output_tokens
    );
    println!("   Cost:      ${:.6}", record.cost_usd);
    println!("   Duration:  {} ms", record.duration_ms());
    for error in &record.errors {
        println!("   ⚠️  {error}");
    }
    if let Some(result) = &record.result {
        println!();
        println!("{}", serde_json::to_string_pretty(result)?);
    }
    Ok(())
}
