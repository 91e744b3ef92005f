//! Routing pattern: the learned per-(agent, step type) tier statistics stored
//! in a `routing_pattern` memory entry.

use agentpilot_core::memory::MemoryEntry;
use agentpilot_core::routing::Tier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Observation ids remembered for replay protection.
pub const RECENT_OBSERVATIONS: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingPattern {
    /// EMA of step outcomes, 0 to 1
    pub success_rate: f64,

    /// Observations folded in so far; never decreases
    pub execution_count: u64,

    /// `min(execution_count / volume, 1)`
    pub confidence: f64,

    /// Tier of the latest successful observation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_observed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "VecDeque::is_empty")]
    pub recent_observations: VecDeque<String>,
}

impl RoutingPattern {
    /// Decode a memory entry's value. Malformed values yield `None`.
    pub fn from_entry(entry: &MemoryEntry) -> Option<Self> {
        serde_json::from_value(entry.value.clone()).ok()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    /// Whether this pattern is strong enough to override complexity routing.
    pub fn qualifies(&self, min_executions: u64, min_success_rate: f64) -> bool {
        self.tier.is_some() && self.execution_count >= min_executions && self.success_rate > min_success_rate
    }

    pub fn has_seen(&self, observation_id: &str) -> bool {
        self.recent_observations.iter().any(|id| id == observation_id)
    }

    pub(crate) fn remember(&mut self, observation_id: String) {
        if self.recent_observations.len() >= RECENT_OBSERVATIONS {
            self.recent_observations.pop_front();
        }
        self.recent_observations.push_back(observation_id);
    }
}
