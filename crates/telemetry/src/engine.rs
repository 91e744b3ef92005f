//! Thread-safe telemetry engine: collects per-run traces and computes costs.

use crate::TelemetryError;
use crate::model::*;
use crate::pricing::PricingTable;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Completed traces retained before the oldest are pruned.
const MAX_TRACES: usize = 5_000;

/// The core telemetry engine.
///
/// Thread-safe via `RwLock`. Concurrent runs write to distinct traces.
pub struct TelemetryEngine {
    pricing: PricingTable,
    traces: RwLock<Vec<Trace>>,
}

impl TelemetryEngine {
    /// Create a new telemetry engine with default pricing.
    pub fn new() -> Self {
        Self::with_pricing(PricingTable::with_defaults())
    }

    pub fn with_pricing(pricing: PricingTable) -> Self {
        Self {
            pricing,
            traces: RwLock::new(Vec::new()),
        }
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Trace>> {
        self.traces.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Trace>> {
        self.traces.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cost of a model call according to the pricing table.
    pub fn compute_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        self.pricing.compute_cost(model, input_tokens, output_tokens)
    }

    // ── Trace management ──────────────────────────────────────────────

    /// Open a trace for a run.
    pub fn start_trace(&self, execution_id: &str, workflow_id: &str) {
        let mut traces = self.write();

        if traces.len() >= MAX_TRACES {
            // Drop the oldest completed traces first
            let drain_count = MAX_TRACES / 10;
            let mut removed = 0;
            traces.retain(|t| {
                if removed < drain_count && t.ended_at.is_some() {
                    removed += 1;
                    return false;
                }
                true
            });
        }

        traces.push(Trace::new(execution_id, workflow_id));
    }

    /// Record a finished span in a run's trace.
    pub fn record_span(&self, execution_id: &str, span: Span) -> Result<(), TelemetryError> {
        let mut traces = self.write();
        let trace = traces
            .iter_mut()
            .rev()
            .find(|t| t.execution_id == execution_id)
            .ok_or_else(|| TelemetryError::UnknownTrace(execution_id.to_string()))?;
        if trace.ended_at.is_some() {
            return Err(TelemetryError::TraceEnded(execution_id.to_string()));
        }

        tracing::debug!(
            execution_id,
            step = span.step_index,
            attempt = span.attempt,
            kind = %span.kind,
            tokens = span.total_tokens(),
            cost_usd = span.cost_usd,
            success = ?span.success,
            "span recorded"
        );
        trace.add_span(span);
        Ok(())
    }

    /// Close a run's trace and return its metrics.
    pub fn end_trace(&self, execution_id: &str) -> Result<RunMetrics, TelemetryError> {
        let mut traces = self.write();
        let trace = traces
            .iter_mut()
            .rev()
            .find(|t| t.execution_id == execution_id)
            .ok_or_else(|| TelemetryError::UnknownTrace(execution_id.to_string()))?;
        if trace.ended_at.is_none() {
            trace.end();
        }
        Ok(trace.metrics())
    }

    pub fn get_trace(&self, execution_id: &str) -> Option<Trace> {
        self.read().iter().rev().find(|t| t.execution_id == execution_id).cloned()
    }

    /// Cost summary across all retained traces.
    pub fn cost_summary(&self) -> CostSummary {
        let traces = self.read();
        let mut by_model: HashMap<String, ModelCost> = HashMap::new();
        let mut summary = CostSummary {
            total_cost_usd: 0.0,
            total_input_tokens: 0,
            total_output_tokens: 0,
            model_calls: 0,
            trace_count: traces.len() as u64,
            by_model: Vec::new(),
        };

        for span in traces.iter().flat_map(|t| t.spans.iter()) {
            summary.total_cost_usd += span.cost_usd;
            summary.total_input_tokens += span.input_tokens;
            summary.total_output_tokens += span.output_tokens;
            if span.kind != SpanKind::ModelCall {
                continue;
            }
            summary.model_calls += 1;
            let model = span.model.clone().unwrap_or_else(|| "unknown".into());
            let entry = by_model.entry(model.clone()).or_insert_with(|| ModelCost {
                model,
                cost_usd: 0.0,
                input_tokens: 0,
                output_tokens: 0,
                calls: 0,
            });
            entry.cost_usd += span.cost_usd;
            entry.input_tokens += span.input_tokens;
            entry.output_tokens += span.output_tokens;
            entry.calls += 1;
        }

        summary.by_model = by_model.into_values().collect();
        summary.by_model.sort_by(|a, b| b.cost_usd.total_cmp(&a.cost_usd));
        summary
    }
}

impl Default for TelemetryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentpilot_core::Tier;

    fn model_span(step: usize, model: &str, input: u64, output: u64, engine: &TelemetryEngine) -> Span {
        let mut span = Span::new(SpanKind::ModelCall, step, 1, "step").with_route(Tier::Fast, model);
        let cost = engine.compute_cost(model, input, output);
        span.record_tokens(input, output, cost);
        span.end(true, None);
        span
    }

    #[test]
    fn start_record_and_end_trace() {
        let engine = TelemetryEngine::new();
        engine.start_trace("exec-1", "wf");
        let span = model_span(0, "gpt-4o", 1000, 500, &engine);
        engine.record_span("exec-1", span).unwrap();

        let metrics = engine.end_trace("exec-1").unwrap();
        assert_eq!(metrics.total_tokens(), 1500);
        assert!((metrics.cost_usd - 0.0075).abs() < 1e-10);
        assert!(engine.get_trace("exec-1").unwrap().ended_at.is_some());
    }

    #[test]
    fn unknown_trace_is_an_error() {
        let engine = TelemetryEngine::new();
        let span = Span::new(SpanKind::Condition, 0, 1, "branch");
        assert!(matches!(
            engine.record_span("missing", span),
            Err(TelemetryError::UnknownTrace(_))
        ));
    }

    #[test]
    fn ended_trace_rejects_spans() {
        let engine = TelemetryEngine::new();
        engine.start_trace("exec-1", "wf");
        engine.end_trace("exec-1").unwrap();
        let span = Span::new(SpanKind::Condition, 0, 1, "branch");
        assert!(matches!(engine.record_span("exec-1", span), Err(TelemetryError::TraceEnded(_))));
    }

    #[test]
    fn cost_summary_groups_by_model() {
        let engine = TelemetryEngine::new();
        engine.start_trace("exec-1", "wf");
        engine.start_trace("exec-2", "wf");
        engine.record_span("exec-1", model_span(0, "gpt-4o", 1000, 0, &engine)).unwrap();
        engine.record_span("exec-2", model_span(0, "gpt-4o", 1000, 0, &engine)).unwrap();
        engine.record_span("exec-2", model_span(1, "gpt-4o-mini", 1000, 0, &engine)).unwrap();

        let summary = TelemetryEngine::default().cost_summary();
        assert_eq!(summary.trace_count, 0);
        assert!(summary.by_model.is_empty());

        let summary = engine.cost_summary();
        assert_eq!(summary.trace_count, 2);
        assert_eq!(summary.model_calls, 3);
        assert_eq!(summary.by_model[0].model, "gpt-4o");
        assert_eq!(summary.by_model[0].calls, 2);
    }
}
