//! Intelligent Routing Engine.
//!
//! Decision hierarchy, evaluated in order:
//! 1. `effective = ais_weight × agent_score + step_weight × tca_score`
//! 2. A qualifying learned pattern for (agent, step type) overrides the
//!    complexity tier
//! 3. Otherwise the tier follows from `effective` and the two boundaries
//! 4. The tier maps to the configured model id
//!
//! Every decision is appended to routing history; a history or memory
//! failure is logged and never fails the step.

use agentpilot_config::{ModelsConfig, RoutingConfig};
use agentpilot_core::execution::ExecutionId;
use agentpilot_core::memory::{MemoryKey, MemoryStore};
use agentpilot_core::persistence::ExecutionStore;
use agentpilot_core::routing::{DecisionSource, RoutingDecision, StepType, Tier};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::complexity::ComplexityAssessment;
use crate::pattern::RoutingPattern;

/// What the router needs to know about one step execution.
#[derive(Debug, Clone)]
pub struct RouteRequest<'a> {
    pub execution_id: &'a ExecutionId,
    pub agent_id: &'a str,
    pub step_index: usize,
    pub step_type: StepType,
    pub agent_score: f64,
    pub assessment: ComplexityAssessment,
}

pub struct RoutingEngine {
    config: RoutingConfig,
    models: ModelsConfig,
    memory: Arc<dyn MemoryStore>,
    history: Arc<dyn ExecutionStore>,
}

impl RoutingEngine {
    pub fn new(
        config: RoutingConfig,
        models: ModelsConfig,
        memory: Arc<dyn MemoryStore>,
        history: Arc<dyn ExecutionStore>,
    ) -> Self {
        Self {
            config,
            models,
            memory,
            history,
        }
    }

    /// Blend of agent intensity and step complexity.
    pub fn effective_complexity(&self, agent_score: f64, tca_score: f64) -> f64 {
        self.config.ais_weight * agent_score + self.config.step_weight * tca_score
    }

    /// Tier for an effective complexity: `< fast_max` fast, `> balanced_max`
    /// powerful, balanced in between (both boundaries inclusive).
    pub fn tier_for(&self, effective: f64) -> Tier {
        if effective < self.config.fast_max {
            Tier::Fast
        } else if effective <= self.config.balanced_max {
            Tier::Balanced
        } else {
            Tier::Powerful
        }
    }

    pub fn model_for(&self, tier: Tier) -> &str {
        self.models.model_for(tier)
    }

    async fn qualifying_pattern(&self, agent_id: &str, step_type: StepType) -> Option<RoutingPattern> {
        let key = MemoryKey::routing_pattern(agent_id, step_type.as_str());
        let entry = match self.memory.get(&key).await {
            Ok(entry) => entry?,
            Err(e) => {
                warn!(key = %key, error = %e, "memory lookup failed, routing on complexity");
                return None;
            }
        };
        RoutingPattern::from_entry(&entry)
            .filter(|p| p.qualifies(self.config.memory_min_executions, self.config.memory_min_success_rate))
    }

    /// Decide the tier and model for one step execution and record it.
    pub async fn route(&self, request: RouteRequest<'_>) -> RoutingDecision {
        let effective = self.effective_complexity(request.agent_score, request.assessment.score);
        let pattern = self.qualifying_pattern(request.agent_id, request.step_type).await;

        let (tier, source) = match pattern.as_ref().and_then(|p| p.tier) {
            Some(tier) => (tier, DecisionSource::MemoryOverride),
            None => (self.tier_for(effective), DecisionSource::Complexity),
        };

        let decision = RoutingDecision {
            execution_id: request.execution_id.clone(),
            agent_id: request.agent_id.to_string(),
            step_index: request.step_index,
            step_type: request.step_type,
            tier,
            model_id: self.model_for(tier).to_string(),
            source,
            complexity_score: request.assessment.score,
            effective_complexity: effective,
            agent_score: request.agent_score,
            factors: request.assessment.factors,
            memory_confidence: pattern.as_ref().map(|p| p.confidence),
            memory_success_rate: pattern.as_ref().map(|p| p.success_rate),
            decided_at: Utc::now(),
        };

        debug!(
            execution_id = %decision.execution_id,
            step = decision.step_index,
            tier = %decision.tier,
            model = %decision.model_id,
            source = %decision.source,
            tca = decision.complexity_score,
            effective,
            "step routed"
        );

        if let Err(e) = self.history.append_routing_history(&decision).await {
            warn!(execution_id = %decision.execution_id, error = %e, "failed to append routing history");
        }

        decision
    }
}
