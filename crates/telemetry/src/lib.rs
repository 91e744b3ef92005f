//! Execution tracing and cost tracking for AgentPilot runs.
//!
//! Every run opens a [`Trace`]; every step attempt records a [`Span`] with
//! its kind, tier, model, token usage, cost and duration. Run-level metrics
//! are derived from the trace rather than kept in parallel counters.

pub mod engine;
pub mod model;
pub mod pricing;

pub use engine::TelemetryEngine;
pub use model::{CostSummary, ModelCost, RunMetrics, Span, SpanKind, Trace};
pub use pricing::{ModelPricing, PricingTable};

/// Errors from the telemetry subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("unknown trace: {0}")]
    UnknownTrace(String),

    #[error("trace already ended: {0}")]
    TraceEnded(String),

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}
