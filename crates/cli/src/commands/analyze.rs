//! `agentpilot analyze`: per-step complexity breakdown and the tier each
//! step would route to on complexity alone. Makes no model or API calls.

use agentpilot_config::EngineConfig;
use agentpilot_core::routing::Tier;
use agentpilot_memory::{InMemoryMemoryStore, NoopExecutionStore};
use agentpilot_routing::{ComplexityAnalyzer, RoutingEngine, TaskComplexityAnalyzer};
use agentpilot_workflow::{ExecutionContext, Workflow, preview_inputs, step_profile};
use anyhow::Context;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use super::runtime;

/// One step's analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct StepAnalysis {
    pub index: usize,
    pub name: String,
    pub score: f64,
    pub effective: f64,
    pub tier: Tier,
    pub model: String,
    pub factors: [f64; 6],
}

pub fn analyze(config: &EngineConfig, workflow: &Workflow, input: Value) -> Vec<StepAnalysis> {
    let analyzer = TaskComplexityAnalyzer::new(config.complexity.clone());
    let router = RoutingEngine::new(
        config.routing.clone(),
        config.models.clone(),
        Arc::new(InMemoryMemoryStore::new()),
        Arc::new(NoopExecutionStore),
    );
    let agent_score = workflow.agent_score.unwrap_or(config.routing.default_agent_score);
    let ctx = ExecutionContext::new(input, workflow.step_count());

    workflow
        .steps
        .iter()
        .map(|step| {
            let assessment = analyzer.analyze(&step_profile(step, preview_inputs(step, &ctx)));
            let effective = router.effective_complexity(agent_score, assessment.score);
            let tier = router.tier_for(effective);
            StepAnalysis {
                index: step.index,
                name: step.name.clone(),
                score: assessment.score,
                effective,
                tier,
                model: router.model_for(tier).to_string(),
                factors: assessment.factors.as_array(),
            }
        })
        .collect()
}

pub fn run(config_path: Option<&Path>, workflow_path: &Path, input: Option<&str>) -> anyhow::Result<()> {
    let config = runtime::load_config(config_path)?;
    let workflow =
        Workflow::load(workflow_path).with_context(|| format!("failed to load {}", workflow_path.display()))?;
    let input = runtime::parse_input(input)?;

    println!(
        "📊 Complexity analysis for '{}' (agent score {:.1})",
        workflow.name,
        workflow.agent_score.unwrap_or(config.routing.default_agent_score)
    );
    println!();
    println!(
        "   {:>2}  {:<20} {:>5} {:>5} {:>5} {:>5} {:>5} {:>5}  {:>5}  {:>9}  tier",
        "#", "step", "len", "data", "rsn", "cond", "ctx", "out", "tca", "effective"
    );
    for a in analyze(&config, &workflow, input) {
        let f = a.factors;
        println!(
            "   {:>2}  {:<20} {:>5.1} {:>5.1} {:>5.1} {:>5.1} {:>5.1} {:>5.1}  {:>5.2}  {:>9.2}  {} ({})",
            a.index, a.name, f[0], f[1], f[2], f[3], f[4], f[5], a.score, a.effective, a.tier, a.model
        );
    }
    println!();
    println!("   Memory overrides are not applied here; `run` may route differently once patterns exist.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn analysis_covers_every_step() {
        let workflow = Workflow::from_json_str(
            &json!({
                "id": "wf",
                "agent_score": 2.0,
                "steps": [
                    {"type": "api_call", "operation": "echo"},
                    {"type": "llm_decision", "prompt": "Summarise {{body}}", "inputs": {"body": "input.body"}}
                ]
            })
            .to_string(),
        )
        .unwrap();

        let config = EngineConfig::default();
        let result = analyze(&config, &workflow, json!({"body": "short"}));
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].index, 0);
        assert!(result.iter().all(|a| (0.0..=10.0).contains(&a.score)));
        for a in &result {
            assert_eq!(a.model, config.models.model_for(a.tier));
        }
    }
}
