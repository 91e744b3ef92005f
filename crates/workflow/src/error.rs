//! Run-level error taxonomy.
//!
//! `Validation` aborts before any spend. `TransientStep` and `StepFailed`
//! describe a step that could not complete; whether they end the run depends
//! on `continue_on_error`. Every other kind is fatal and never retried.

use thiserror::Error;

use crate::expression::ExprError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkflowError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("step {step} failed after {attempts} attempt(s): {reason}")]
    TransientStep { step: usize, attempts: u32, reason: String },

    #[error("step {step} failed: {reason}")]
    StepFailed { step: usize, reason: String },

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("loop detected at step {step}: '{operation}' repeated {repeats} times with identical inputs")]
    LoopDetected {
        step: usize,
        operation: String,
        repeats: usize,
    },

    #[error("circuit open after {failures} consecutive step failures")]
    CircuitOpen { failures: u32 },

    #[error("output schema mismatch: {0}")]
    OutputSchemaMismatch(String),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl WorkflowError {
    /// Whether this error describes one step rather than the whole run.
    pub fn is_step_failure(&self) -> bool {
        matches!(self, Self::TransientStep { .. } | Self::StepFailed { .. })
    }

    /// Short machine-readable kind, used in records and audit details.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::TransientStep { .. } => "transient_step",
            Self::StepFailed { .. } => "step_failed",
            Self::LimitExceeded(_) => "limit_exceeded",
            Self::LoopDetected { .. } => "loop_detected",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::OutputSchemaMismatch(_) => "output_schema_mismatch",
            Self::Cancelled(_) => "cancelled",
        }
    }
}

impl From<ExprError> for WorkflowError {
    fn from(e: ExprError) -> Self {
        Self::Validation(e.to_string())
    }
}
