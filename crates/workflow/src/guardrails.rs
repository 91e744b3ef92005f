//! Per-run guardrails: loop detection, token budgets, circuit breaking and
//! retry backoff. Each guard is plain state owned by one run.

use agentpilot_config::{AllocationStrategy, BudgetConfig, GuardrailsConfig};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::time::Duration;

use crate::definition::Step;
use crate::error::WorkflowError;

// ── Loop detection ──────────────────────────────────────────────────────────

/// Fingerprint of an invocation: operation plus structurally identical
/// resolved inputs hash the same.
pub fn fingerprint(operation: &str, inputs: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    hasher.update([0u8]);
    // serde_json maps are key-sorted, so equal structures serialize equally
    hasher.update(inputs.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Halts when the same invocation repeats more than `max_repeats` times in a
/// row. Only the last `window` invocations are remembered.
#[derive(Debug, Clone)]
pub struct LoopDetector {
    window: usize,
    max_repeats: usize,
    recent: VecDeque<String>,
}

impl LoopDetector {
    pub fn new(window: usize, max_repeats: usize) -> Self {
        Self {
            window: window.max(1),
            max_repeats: max_repeats.max(1),
            recent: VecDeque::new(),
        }
    }

    pub fn from_config(config: &GuardrailsConfig) -> Self {
        Self::new(config.loop_detection_window, config.max_same_tool_repeats)
    }

    /// Record an invocation. Returns the length of the identical run when it
    /// exceeds the limit.
    pub fn observe(&mut self, fingerprint: String) -> Option<usize> {
        let run = 1 + self.recent.iter().rev().take_while(|fp| **fp == fingerprint).count();

        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(fingerprint);

        (run > self.max_repeats).then_some(run)
    }
}

// ── Token budget ────────────────────────────────────────────────────────────

/// Per-step allotments and the run-wide total.
#[derive(Debug, Clone)]
pub struct TokenBudget {
    config: BudgetConfig,
    total_limit: u64,
    step_count: usize,
    used: u64,
}

impl TokenBudget {
    pub fn new(config: BudgetConfig, intent: Option<&str>, step_count: usize) -> Self {
        let total_limit = config.total_budget_for(intent);
        Self {
            config,
            total_limit,
            step_count: step_count.max(1),
            used: 0,
        }
    }

    /// First, last and error-handling steps, plus anything flagged critical.
    pub fn is_critical(&self, step: &Step) -> bool {
        step.critical || step.error_handler || step.index == 0 || step.index + 1 == self.step_count
    }

    /// Tokens a step is allotted before overage. A step's own `max_tokens`
    /// can lower its share but never lift it past the per-iteration cap.
    pub fn allotment(&self, step: &Step) -> u64 {
        let per_iteration = self.config.max_tokens_per_iteration;
        match self.config.allocation_strategy {
            AllocationStrategy::Equal => {
                let share = per_iteration.min(self.total_limit / self.step_count as u64);
                step.max_tokens.map_or(share, |m| m.min(per_iteration))
            }
            AllocationStrategy::Priority => {
                let base = step.max_tokens.map_or(per_iteration, |m| m.min(per_iteration));
                if self.is_critical(step) {
                    (base as f64 * self.config.critical_step_multiplier).floor() as u64
                } else {
                    base
                }
            }
        }
    }

    /// Hard ceiling for a step: the allotment, stretched by the overage
    /// threshold when overage is allowed.
    pub fn step_limit(&self, allotment: u64) -> u64 {
        if self.config.budget_overage_allowed {
            // epsilon absorbs float error at exact boundaries (1000 × 1.2)
            (allotment as f64 * self.config.overage_threshold + 1e-9).floor() as u64
        } else {
            allotment
        }
    }

    /// Check a token amount against a step's allotment.
    pub fn check_step(&self, tokens: u64, allotment: u64) -> Result<(), WorkflowError> {
        let limit = self.step_limit(allotment);
        if tokens > limit {
            return Err(WorkflowError::LimitExceeded(format!(
                "step needs {tokens} tokens, allotment {allotment} allows at most {limit}"
            )));
        }
        Ok(())
    }

    /// Check that `additional` tokens still fit in the run total.
    pub fn check_total(&self, additional: u64) -> Result<(), WorkflowError> {
        if self.used + additional > self.total_limit {
            return Err(WorkflowError::LimitExceeded(format!(
                "run would use {} tokens, total budget is {}",
                self.used + additional,
                self.total_limit
            )));
        }
        Ok(())
    }

    pub fn record(&mut self, tokens: u64) {
        self.used += tokens;
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn total_limit(&self) -> u64 {
        self.total_limit
    }

    pub fn remaining(&self) -> u64 {
        self.total_limit.saturating_sub(self.used)
    }

    pub fn default_max_output_tokens(&self) -> u32 {
        self.config.default_max_output_tokens
    }
}

// ── Circuit breaker ─────────────────────────────────────────────────────────

/// Counts consecutive failed steps. A step counts once, after its retries
/// are exhausted.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    consecutive: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Returns `true` once the breaker is open.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.is_open()
    }

    pub fn is_open(&self) -> bool {
        self.consecutive >= self.threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }
}

// ── Retry ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &GuardrailsConfig) -> Self {
        Self {
            enabled: config.retry_enabled,
            max_retries: config.default_retry_count,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Total attempts for a step, honouring its own retry override.
    pub fn attempts_for(&self, step: &Step) -> u32 {
        if !self.enabled {
            return 1;
        }
        1 + step.retry_count.unwrap_or(self.max_retries)
    }

    /// Delay before retry number `retry` (1-based): base × 2^(retry − 1),
    /// capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}
