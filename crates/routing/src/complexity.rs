//! Task Complexity Analyzer (TCA).
//!
//! Scores one step's difficulty on a 0 to 10 scale from six structural
//! factors. Each factor's raw measure is normalized to [0, 1] against the
//! configured low/medium/high thresholds, then the factors are combined with
//! the weight table for the step's type:
//!
//! ```text
//! score = 10 × Σ weight_i × factor_i
//! ```
//!
//! Analysis is pure: the same profile and configuration always produce the
//! same assessment.

use agentpilot_config::{ComplexityConfig, Thresholds, WeightTable};
use agentpilot_core::routing::{ComplexityFactors, StepType};
use serde::{Deserialize, Serialize};

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.len().div_ceil(4)
}

/// Words that introduce a branch when they appear in a prompt.
const CONDITIONAL_WORDS: &[&str] = &["if", "when", "unless", "otherwise", "else", "whether", "either"];

/// Structural features of one step, gathered by the executor after input
/// resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepProfile {
    /// `None` selects the default weight table (ad-hoc estimates)
    pub step_type: Option<StepType>,

    /// Prompt, instruction or condition expression text
    pub text: String,

    /// Resolved inputs as they will be sent
    pub inputs: serde_json::Value,

    /// Explicit reasoning depth declared on the step
    pub reasoning_depth: Option<u32>,

    /// Comparison atoms in a parsed condition expression
    pub comparison_count: Option<usize>,

    /// Distinct prior steps whose outputs this step consumes
    pub consumed_steps: usize,

    /// Declared output fields
    pub output_fields: usize,

    /// Tool declarations offered to the model
    pub tool_count: usize,
}

/// Score plus the factor breakdown behind it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComplexityAssessment {
    /// 0 to 10
    pub score: f64,
    pub factors: ComplexityFactors,
}

impl ComplexityAssessment {
    /// An assessment with a fixed score and no factor breakdown.
    pub fn fixed(score: f64) -> Self {
        Self {
            score: score.clamp(0.0, 10.0),
            factors: ComplexityFactors::default(),
        }
    }
}

/// Scores step difficulty.
pub trait ComplexityAnalyzer: Send + Sync {
    fn analyze(&self, profile: &StepProfile) -> ComplexityAssessment;
}

/// The configured six-factor analyzer.
pub struct TaskComplexityAnalyzer {
    config: ComplexityConfig,
}

impl TaskComplexityAnalyzer {
    pub fn new(config: ComplexityConfig) -> Self {
        Self { config }
    }

    fn weights(&self, step_type: Option<StepType>) -> &WeightTable {
        match step_type {
            Some(t) => self.config.weights.for_step(t),
            None => &self.config.weights.default,
        }
    }

    /// Raw measures in canonical factor order.
    fn raw_measures(&self, profile: &StepProfile) -> [f64; 6] {
        let lowered = profile.text.to_lowercase();

        let prompt_tokens = estimate_tokens(&profile.text) as f64;

        let data_bytes = match &profile.inputs {
            serde_json::Value::Null => 0,
            v => serde_json::to_string(v).map_or(0, |s| s.len()),
        } as f64;

        let reasoning = match profile.reasoning_depth {
            Some(depth) => f64::from(depth),
            None => self
                .config
                .reasoning_keywords
                .iter()
                .map(|kw| lowered.matches(kw.to_lowercase().as_str()).count())
                .sum::<usize>() as f64,
        };

        let conditions = match profile.comparison_count {
            Some(n) => n,
            None => lowered
                .split(|c: char| !c.is_alphanumeric())
                .filter(|word| CONDITIONAL_WORDS.contains(word))
                .count(),
        } as f64;

        let context = (profile.consumed_steps + json_depth(&profile.inputs).saturating_sub(1)) as f64;

        let outputs = (profile.output_fields + profile.tool_count) as f64;

        [prompt_tokens, data_bytes, reasoning, conditions, context, outputs]
    }
}

impl ComplexityAnalyzer for TaskComplexityAnalyzer {
    fn analyze(&self, profile: &StepProfile) -> ComplexityAssessment {
        let thresholds = &self.config.thresholds;
        let raw = self.raw_measures(profile);

        let factors = ComplexityFactors {
            prompt_length: normalize(raw[0], &thresholds.prompt_length),
            data_size: normalize(raw[1], &thresholds.data_size),
            reasoning_depth: normalize(raw[2], &thresholds.reasoning_depth),
            condition_count: normalize(raw[3], &thresholds.condition_count),
            context_depth: normalize(raw[4], &thresholds.context_depth),
            output_complexity: normalize(raw[5], &thresholds.output_complexity),
        };

        let weighted: f64 = self
            .weights(profile.step_type)
            .as_array()
            .iter()
            .zip(factors.as_array())
            .map(|(w, f)| w * f)
            .sum();

        ComplexityAssessment {
            score: (10.0 * weighted).clamp(0.0, 10.0),
            factors,
        }
    }
}

/// Piecewise-linear mapping through (0, 0), (low, 0.2), (medium, 0.5),
/// (high, 0.8), reaching 1.0 at twice `high` and saturating there.
pub fn normalize(value: f64, t: &Thresholds) -> f64 {
    let lerp = |x: f64, x0: f64, x1: f64, y0: f64, y1: f64| y0 + (y1 - y0) * (x - x0) / (x1 - x0);

    if value <= 0.0 {
        0.0
    } else if value < t.low {
        lerp(value, 0.0, t.low, 0.0, 0.2)
    } else if value < t.medium {
        lerp(value, t.low, t.medium, 0.2, 0.5)
    } else if value < t.high {
        lerp(value, t.medium, t.high, 0.5, 0.8)
    } else if value < 2.0 * t.high {
        lerp(value, t.high, 2.0 * t.high, 0.8, 1.0)
    } else {
        1.0
    }
}

/// Nesting depth of a JSON value; scalars are depth 0.
fn json_depth(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        serde_json::Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        _ => 0,
    }
}
