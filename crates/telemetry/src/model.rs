//! Data model for run traces, step spans and cost summaries.

use agentpilot_core::{StepType, Tier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Span ──────────────────────────────────────────────────────────────────

/// The kind of work a span represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// A model invocation (llm_decision, transform).
    ModelCall,
    /// An external operation (api_call).
    ApiCall,
    /// A local conditional evaluation.
    Condition,
}

impl SpanKind {
    pub fn for_step(step_type: StepType) -> Self {
        match step_type {
            StepType::LlmDecision | StepType::Transform => Self::ModelCall,
            StepType::ApiCall => Self::ApiCall,
            StepType::Conditional => Self::Condition,
        }
    }
}

impl std::fmt::Display for SpanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModelCall => write!(f, "model_call"),
            Self::ApiCall => write!(f, "api_call"),
            Self::Condition => write!(f, "condition"),
        }
    }
}

/// One step attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub id: String,
    pub kind: SpanKind,
    pub step_index: usize,

    /// 1-based attempt number within the step's retry budget.
    pub attempt: u32,

    /// Step name or operation.
    pub label: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,

    #[serde(default)]
    pub input_tokens: u64,

    #[serde(default)]
    pub output_tokens: u64,

    #[serde(default)]
    pub cost_usd: f64,

    pub success: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Span {
    pub fn new(kind: SpanKind, step_index: usize, attempt: u32, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            step_index,
            attempt,
            label: label.into(),
            tier: None,
            model: None,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            success: None,
            error: None,
        }
    }

    pub fn with_route(mut self, tier: Tier, model: impl Into<String>) -> Self {
        self.tier = Some(tier);
        self.model = Some(model.into());
        self
    }

    /// Record token usage and its cost.
    pub fn record_tokens(&mut self, input: u64, output: u64, cost: f64) {
        self.input_tokens = input;
        self.output_tokens = output;
        self.cost_usd = cost;
    }

    /// Close the span.
    pub fn end(&mut self, success: bool, error: Option<String>) {
        let now = Utc::now();
        self.ended_at = Some(now);
        self.duration_ms = Some(now.signed_duration_since(self.started_at).num_milliseconds().max(0) as u64);
        self.success = Some(success);
        self.error = error;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

// ── Trace ─────────────────────────────────────────────────────────────────

/// All spans of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub execution_id: String,
    pub workflow_id: String,
    pub spans: Vec<Span>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Trace {
    pub fn new(execution_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            spans: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn add_span(&mut self, span: Span) {
        self.spans.push(span);
    }

    pub fn end(&mut self) {
        self.ended_at = Some(Utc::now());
    }

    /// Aggregate metrics over every recorded attempt.
    pub fn metrics(&self) -> RunMetrics {
        let mut m = RunMetrics::default();
        for span in &self.spans {
            m.input_tokens += span.input_tokens;
            m.output_tokens += span.output_tokens;
            m.cost_usd += span.cost_usd;
            m.attempts += 1;
            if span.kind == SpanKind::ModelCall {
                m.model_calls += 1;
            }
            if span.success == Some(false) {
                m.failed_attempts += 1;
            }
        }
        m.duration_ms = self
            .ended_at
            .unwrap_or_else(Utc::now)
            .signed_duration_since(self.started_at)
            .num_milliseconds()
            .max(0) as u64;
        m
    }
}

/// Totals derived from a trace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub attempts: u64,
    pub failed_attempts: u64,
    pub model_calls: u64,
}

impl RunMetrics {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

// ── Aggregated views ──────────────────────────────────────────────────────

/// Aggregated cost summary across traces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_cost_usd: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub model_calls: u64,
    pub trace_count: u64,
    /// Cost breakdown by model, most expensive first.
    pub by_model: Vec<ModelCost>,
}

/// Cost breakdown for a single model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCost {
    pub model: String,
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u64,
}
