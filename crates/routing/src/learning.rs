//! Learning Engine: exponential-moving-average pattern reinforcement.
//!
//! After each step the engine folds the outcome into the `routing_pattern`
//! entry for (agent, step type):
//!
//! ```text
//! success_rate' = α × outcome + (1 − α) × success_rate
//! execution_count' = execution_count + 1
//! confidence' = min(execution_count' / volume, 1)
//! ```
//!
//! A missing entry is created with `success_rate = outcome` and a count of
//! one. Every write goes through `MemoryStore::update`, so concurrent
//! updates of the same key are serialized by the store and never lost.

use agentpilot_config::LearningConfig;
use agentpilot_core::error::StoreError;
use agentpilot_core::execution::ExecutionStatus;
use agentpilot_core::memory::{MemoryEntry, MemoryKey, MemoryStore, MemoryType, MemoryWrite, SweepPolicy, memory_update};
use agentpilot_core::routing::{StepType, Tier};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use crate::pattern::RoutingPattern;

/// One completed step, as seen by the learning loop.
#[derive(Debug, Clone)]
pub struct Observation {
    pub agent_id: String,
    pub step_type: StepType,

    /// Tier the step ran on
    pub tier: Tier,

    pub success: bool,

    /// Continuous quality signal in [0, 1], when the step defines one
    pub quality: Option<f64>,

    /// `{execution_id}:{step_index}:{visit}`; identifies replays
    pub observation_id: String,
}

impl Observation {
    /// The value folded into the average.
    pub fn outcome(&self) -> f64 {
        match self.quality {
            Some(q) => q.clamp(0.0, 1.0),
            None if self.success => 1.0,
            None => 0.0,
        }
    }
}

/// Run-level summary stored as an `execution_outcome` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub last_execution_id: String,
    pub last_status: ExecutionStatus,

    /// EMA over runs; completed counts as 1, partial success as 0.5
    pub success_rate: f64,

    pub runs: u64,
    pub last_total_tokens: u64,
    pub last_cost_usd: f64,
}

/// Fold one observation into a (possibly absent) pattern.
pub fn apply_observation(
    current: Option<RoutingPattern>,
    observation: &Observation,
    alpha: f64,
    confidence_volume: u64,
) -> RoutingPattern {
    let outcome = observation.outcome();
    let mut pattern = match current {
        Some(mut p) => {
            p.success_rate = alpha * outcome + (1.0 - alpha) * p.success_rate;
            p.execution_count += 1;
            p
        }
        None => RoutingPattern {
            success_rate: outcome,
            execution_count: 1,
            confidence: 0.0,
            tier: None,
            last_observed_at: None,
            recent_observations: VecDeque::new(),
        },
    };

    pattern.confidence = (pattern.execution_count as f64 / confidence_volume.max(1) as f64).min(1.0);
    if observation.success {
        pattern.tier = Some(observation.tier);
    }
    pattern.last_observed_at = Some(Utc::now());
    pattern.remember(observation.observation_id.clone());
    pattern
}

pub struct LearningEngine {
    config: LearningConfig,
    memory: Arc<dyn MemoryStore>,
}

impl LearningEngine {
    pub fn new(config: LearningConfig, memory: Arc<dyn MemoryStore>) -> Self {
        Self { config, memory }
    }

    /// Fold a step outcome into its routing pattern and return the pattern as
    /// stored afterwards. A replayed observation leaves the pattern untouched.
    pub async fn learn(&self, observation: &Observation) -> Result<Option<RoutingPattern>, StoreError> {
        let key = MemoryKey::routing_pattern(&observation.agent_id, observation.step_type.as_str());
        let alpha = self.config.smoothing_factor;
        let volume = self.config.confidence_volume;
        let replay_protection = self.config.replay_protection;
        let obs = observation.clone();

        let stored = self
            .memory
            .update(
                &key,
                memory_update(move |current| {
                    let current = current.and_then(RoutingPattern::from_entry);
                    if replay_protection && current.as_ref().is_some_and(|p| p.has_seen(&obs.observation_id)) {
                        return None;
                    }
                    let next = apply_observation(current, &obs, alpha, volume);
                    Some(MemoryWrite {
                        value: next.to_value(),
                        importance: 10.0 * next.confidence,
                    })
                }),
            )
            .await?;

        let pattern = stored.as_ref().and_then(RoutingPattern::from_entry);
        if let Some(p) = &pattern {
            debug!(
                key = %key,
                success_rate = p.success_rate,
                count = p.execution_count,
                confidence = p.confidence,
                "routing pattern updated"
            );
        }
        Ok(pattern)
    }

    /// Record a finished run under (agent, `execution_outcome`, workflow).
    pub async fn record_run(
        &self,
        agent_id: &str,
        workflow_id: &str,
        execution_id: &str,
        status: ExecutionStatus,
        total_tokens: u64,
        cost_usd: f64,
    ) -> Result<Option<RunOutcome>, StoreError> {
        let key = MemoryKey::new(agent_id, MemoryType::ExecutionOutcome, workflow_id);
        let alpha = self.config.smoothing_factor;
        let volume = self.config.confidence_volume.max(1) as f64;
        let execution_id = execution_id.to_string();
        let score = match status {
            ExecutionStatus::Completed => 1.0,
            ExecutionStatus::PartialSuccess => 0.5,
            _ => 0.0,
        };

        let stored = self
            .memory
            .update(
                &key,
                memory_update(move |current| {
                    let previous: Option<RunOutcome> =
                        current.and_then(|e| serde_json::from_value(e.value.clone()).ok());
                    let (success_rate, runs) = match previous {
                        Some(p) => (alpha * score + (1.0 - alpha) * p.success_rate, p.runs + 1),
                        None => (score, 1),
                    };
                    let outcome = RunOutcome {
                        last_execution_id: execution_id,
                        last_status: status,
                        success_rate,
                        runs,
                        last_total_tokens: total_tokens,
                        last_cost_usd: cost_usd,
                    };
                    Some(MemoryWrite {
                        value: serde_json::to_value(&outcome).unwrap_or_default(),
                        importance: 10.0 * (runs as f64 / volume).min(1.0),
                    })
                }),
            )
            .await?;

        Ok(stored.and_then(|e: MemoryEntry| serde_json::from_value(e.value).ok()))
    }

    /// Apply the configured importance/staleness sweep.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        self.memory.sweep(&self.sweep_policy()).await
    }

    pub fn sweep_policy(&self) -> SweepPolicy {
        SweepPolicy {
            min_importance: self.config.sweep_min_importance,
            max_idle_days: self.config.sweep_max_idle_days,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentpilot_memory::InMemoryMemoryStore;

    fn observation(success: bool, id: &str) -> Observation {
        Observation {
            agent_id: "agent-1".into(),
            step_type: StepType::LlmDecision,
            tier: Tier::Fast,
            success,
            quality: None,
            observation_id: id.into(),
        }
    }

    fn existing(rate: f64, count: u64, tier: Option<Tier>) -> RoutingPattern {
        RoutingPattern {
            success_rate: rate,
            execution_count: count,
            confidence: 1.0,
            tier,
            last_observed_at: None,
            recent_observations: VecDeque::new(),
        }
    }

    fn engine() -> (LearningEngine, Arc<InMemoryMemoryStore>) {
        let memory = Arc::new(InMemoryMemoryStore::new());
        (LearningEngine::new(LearningConfig::default(), memory.clone()), memory)
    }

    #[test]
    fn ema_matches_documented_formula() {
        let next = apply_observation(Some(existing(0.92, 14, None)), &observation(true, "e:0:0"), 0.3, 10);
        assert!((next.success_rate - 0.944).abs() < 1e-6);
        assert_eq!(next.execution_count, 15);
        assert_eq!(next.confidence, 1.0);
    }

    #[test]
    fn first_observation_seeds_the_pattern() {
        let next = apply_observation(None, &observation(false, "e:0:0"), 0.3, 10);
        assert_eq!(next.success_rate, 0.0);
        assert_eq!(next.execution_count, 1);
        assert!((next.confidence - 0.1).abs() < 1e-9);
        assert_eq!(next.tier, None);
    }

    #[test]
    fn failures_never_change_the_tier() {
        let mut obs = observation(false, "e:0:0");
        obs.tier = Tier::Powerful;
        let next = apply_observation(Some(existing(0.9, 20, Some(Tier::Fast))), &obs, 0.3, 10);
        assert_eq!(next.tier, Some(Tier::Fast));
        assert!((next.success_rate - 0.63).abs() < 1e-9);
    }

    #[test]
    fn quality_signal_replaces_binary_outcome() {
        let mut obs = observation(true, "e:0:0");
        obs.quality = Some(0.5);
        let next = apply_observation(Some(existing(1.0, 5, None)), &obs, 0.3, 10);
        assert!((next.success_rate - 0.85).abs() < 1e-9);
    }

    #[tokio::test]
    async fn learn_creates_then_reinforces() {
        let (engine, memory) = engine();
        engine.learn(&observation(true, "e:0:0")).await.unwrap();
        let pattern = engine.learn(&observation(false, "e:1:0")).await.unwrap().unwrap();

        assert_eq!(pattern.execution_count, 2);
        assert!((pattern.success_rate - 0.7).abs() < 1e-9);
        assert_eq!(pattern.tier, Some(Tier::Fast));

        let entry = memory
            .get(&MemoryKey::routing_pattern("agent-1", "llm_decision"))
            .await
            .unwrap()
            .unwrap();
        assert!((entry.importance - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn replayed_observation_is_a_no_op() {
        let (engine, _) = engine();
        let first = engine.learn(&observation(true, "e:0:0")).await.unwrap().unwrap();
        let replay = engine.learn(&observation(true, "e:0:0")).await.unwrap().unwrap();
        assert_eq!(first.execution_count, replay.execution_count);
        assert_eq!(first.success_rate, replay.success_rate);
    }

    #[tokio::test]
    async fn repeated_outcomes_converge_monotonically() {
        let (engine, _) = engine();
        engine.learn(&observation(false, "e:0:0")).await.unwrap();

        let mut last_rate = 0.0;
        let mut last_count = 1;
        for i in 1..20 {
            let p = engine.learn(&observation(true, &format!("e:{i}:0"))).await.unwrap().unwrap();
            assert!(p.success_rate > last_rate);
            assert!(p.success_rate <= 1.0);
            assert_eq!(p.execution_count, last_count + 1);
            last_rate = p.success_rate;
            last_count = p.execution_count;
        }
        assert!(last_rate > 0.99);
    }

    #[tokio::test]
    async fn replay_protection_can_be_disabled() {
        let memory = Arc::new(InMemoryMemoryStore::new());
        let config = LearningConfig {
            replay_protection: false,
            ..LearningConfig::default()
        };
        let engine = LearningEngine::new(config, memory);
        engine.learn(&observation(true, "e:0:0")).await.unwrap();
        let p = engine.learn(&observation(true, "e:0:0")).await.unwrap().unwrap();
        assert_eq!(p.execution_count, 2);
    }

    #[tokio::test]
    async fn concurrent_learning_loses_no_updates() {
        let (engine, _) = engine();
        let engine = Arc::new(engine);
        let mut handles = Vec::new();
        for i in 0..25 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.learn(&observation(true, &format!("e:{i}:0"))).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let p = engine.learn(&observation(true, "final")).await.unwrap().unwrap();
        assert_eq!(p.execution_count, 26);
    }

    #[tokio::test]
    async fn run_outcomes_accumulate() {
        let (engine, _) = engine();
        engine
            .record_run("agent-1", "wf", "exec-1", ExecutionStatus::Completed, 100, 0.01)
            .await
            .unwrap();
        let outcome = engine
            .record_run("agent-1", "wf", "exec-2", ExecutionStatus::Failed, 50, 0.005)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.runs, 2);
        assert_eq!(outcome.last_status, ExecutionStatus::Failed);
        assert!((outcome.success_rate - 0.7).abs() < 1e-9);
        assert_eq!(outcome.last_execution_id, "exec-2");
    }
}
