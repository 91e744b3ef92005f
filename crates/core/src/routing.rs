//! Routing vocabulary shared by the analyzer, the router and the executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::ExecutionId;

/// The closed set of step kinds a workflow may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    LlmDecision,
    Transform,
    Conditional,
    ApiCall,
}

impl StepType {
    pub const ALL: [StepType; 4] = [Self::LlmDecision, Self::Transform, Self::Conditional, Self::ApiCall];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LlmDecision => "llm_decision",
            Self::Transform => "transform",
            Self::Conditional => "conditional",
            Self::ApiCall => "api_call",
        }
    }

    /// Whether executing this step spends model tokens.
    pub fn invokes_model(&self) -> bool {
        matches!(self, Self::LlmDecision | Self::Transform)
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llm_decision" => Ok(Self::LlmDecision),
            "transform" => Ok(Self::Transform),
            "conditional" => Ok(Self::Conditional),
            "api_call" => Ok(Self::ApiCall),
            other => Err(format!("unknown step type '{other}'")),
        }
    }
}

/// Cost/capability class of model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Fast,
    Balanced,
    Powerful,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::Powerful => "powerful",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast" => Ok(Self::Fast),
            "balanced" => Ok(Self::Balanced),
            "powerful" => Ok(Self::Powerful),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}

/// Why a tier was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Complexity,
    MemoryOverride,
}

impl std::fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Self::Complexity => "complexity",
            Self::MemoryOverride => "memory_override",
        })
    }
}

/// The six normalized factors behind a complexity score, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplexityFactors {
    pub prompt_length: f64,
    pub data_size: f64,
    pub reasoning_depth: f64,
    pub condition_count: f64,
    pub context_depth: f64,
    pub output_complexity: f64,
}

impl ComplexityFactors {
    /// Factor values in canonical order, matching weight tables.
    pub fn as_array(&self) -> [f64; 6] {
        [
            self.prompt_length,
            self.data_size,
            self.reasoning_depth,
            self.condition_count,
            self.context_depth,
            self.output_complexity,
        ]
    }
}

/// One routing decision. Recorded once per step execution and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub execution_id: ExecutionId,
    pub agent_id: String,
    pub step_index: usize,
    pub step_type: StepType,
    pub tier: Tier,
    pub model_id: String,
    pub source: DecisionSource,

    /// Raw TCA score, 0 to 10
    pub complexity_score: f64,

    /// Weighted blend of agent score and TCA score
    pub effective_complexity: f64,

    pub agent_score: f64,
    pub factors: ComplexityFactors,

    /// Set when a memory pattern overrode the complexity tier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_confidence: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_success_rate: Option<f64>,

    pub decided_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_are_ordered_by_capability() {
        assert!(Tier::Fast < Tier::Balanced);
        assert!(Tier::Balanced < Tier::Powerful);
    }

    #[test]
    fn step_type_wire_names() {
        let json = serde_json::to_string(&StepType::LlmDecision).unwrap();
        assert_eq!(json, "\"llm_decision\"");
        for t in StepType::ALL {
            assert_eq!(t.as_str().parse::<StepType>().unwrap(), t);
        }
        assert!(StepType::Transform.invokes_model());
        assert!(!StepType::Conditional.invokes_model());
    }
}
