//! `agentpilot daemon`: run configured schedules until Ctrl-C.

use agentpilot_telemetry::CostSummary;
use agentpilot_workflow::{ExecutionManager, IntervalScheduler, TriggeredRun, Workflow};
use std::path::Path;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::runtime;

pub async fn run(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = runtime::load_config(config_path)?;

    println!("🛫 AgentPilot daemon starting");
    println!("   Provider:  {}", config.provider.name);
    println!("   Memory:    {}", config.memory.backend);
    println!("   Schedules: {}", config.schedules.len());

    let scheduler = IntervalScheduler::from_config(&config.schedules, Duration::from_secs(1)).await?;
    for schedule in scheduler.list().await {
        info!(
            schedule = %schedule.name,
            workflow = %schedule.workflow,
            interval_secs = schedule.interval_secs,
            enabled = schedule.enabled,
            "schedule loaded"
        );
    }

    let collab = runtime::collaborators(&config).await?;
    let manager = ExecutionManager::new(config, collab);
    let (mut triggers, scheduler_handle) = scheduler.start();
    info!("scheduler started");

    let mut runs = JoinSet::new();
    loop {
        tokio::select! {
            triggered = triggers.recv() => match triggered {
                Some(triggered) => dispatch(&manager, triggered, &mut runs).await,
                None => {
                    warn!("scheduler stopped");
                    break;
                }
            },
            Some(_) = runs.join_next(), if !runs.is_empty() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
        }
    }

    scheduler_handle.abort();
    let cancelled = manager.cancel_all().await;
    while runs.join_next().await.is_some() {}

    print_cost_summary(&manager.collaborators().telemetry.cost_summary());
    println!("👋 Daemon stopped ({cancelled} in-flight run(s) cancelled)");
    Ok(())
}

fn print_cost_summary(summary: &CostSummary) {
    println!(
        "💰 {} run(s), {} model call(s), {} tokens, ${:.4}",
        summary.trace_count,
        summary.model_calls,
        summary.total_input_tokens + summary.total_output_tokens,
        summary.total_cost_usd
    );
    for model in &summary.by_model {
        println!(
            "   {:<24} {:>4} call(s) {:>8} tokens  ${:.4}",
            model.model,
            model.calls,
            model.input_tokens + model.output_tokens,
            model.cost_usd
        );
    }
}

/// Load the triggered workflow and start it; the definition is re-read on
/// every trigger so edits take effect without a restart.
async fn dispatch(manager: &ExecutionManager, triggered: TriggeredRun, runs: &mut JoinSet<()>) {
    match Workflow::load(Path::new(&triggered.workflow)) {
        Ok(workflow) => {
            let id = manager.start(workflow, triggered.input).await;
            info!(schedule = %triggered.schedule, execution_id = %id, "scheduled run started");
            let manager = manager.clone();
            runs.spawn(async move {
                if let Some(report) = manager.wait(&id).await {
                    info!(execution_id = %id, status = %report.status(), tokens = report.record.total_tokens(), "scheduled run finished");
                }
            });
        }
        Err(e) => error!(schedule = %triggered.schedule, workflow = %triggered.workflow, error = %e, "cannot load scheduled workflow"),
    }
}
