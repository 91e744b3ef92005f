//! `agentpilot validate`: parse and validate a workflow definition.

use agentpilot_workflow::{StepKind, Workflow};
use anyhow::Context;
use std::path::Path;

pub fn run(workflow_path: &Path) -> anyhow::Result<()> {
    println!("🔍 Validating {}...", workflow_path.display());
    let workflow =
        Workflow::load(workflow_path).with_context(|| format!("{} is not a valid workflow", workflow_path.display()))?;

    println!("   ✅ Workflow '{}' ({}) is valid", workflow.name, workflow.id);
    println!("   Agent:   {}", workflow.agent_id);
    if let Some(score) = workflow.agent_score {
        println!("   Score:   {score}");
    }
    if let Some(intent) = &workflow.intent {
        println!("   Intent:  {intent}");
    }
    if !workflow.required_inputs.is_empty() {
        println!("   Inputs:  {}", workflow.required_inputs.join(", "));
    }
    println!();
    for step in &workflow.steps {
        let detail = match &step.kind {
            StepKind::Conditional { on_true, on_false, .. } => format!("true → {on_true}, false → {on_false}"),
            _ => step.operation.clone(),
        };
        let group = step
            .parallel_group
            .as_deref()
            .map(|g| format!(" [group {g}]"))
            .unwrap_or_default();
        println!("   {:>2}. {:<20} {:<13} {detail}{group}", step.index, step.name, step.step_type());
    }
    if !workflow.output.is_empty() {
        println!();
        for (name, reference) in &workflow.output {
            println!("   output.{name} ← {reference}");
        }
    }
    Ok(())
}
