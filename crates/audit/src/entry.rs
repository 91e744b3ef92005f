//! Audit entry types.

use agentpilot_core::{DecisionSource, ExecutionStatus, Tier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,

    /// Agent the run belongs to
    pub actor: String,

    /// Execution id
    pub target: String,

    pub outcome: AuditOutcome,
    pub severity: Severity,

    /// Stable label for downstream compliance filtering (e.g. "agentpilot.run")
    pub compliance_tag: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Types of auditable run transitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    RunStarted {
        workflow_id: String,
    },
    StepRouted {
        step_index: usize,
        tier: Tier,
        model_id: String,
        source: DecisionSource,
        complexity_score: f64,
    },
    StepCompleted {
        step_index: usize,
        success: bool,
        attempts: u32,
        tokens: u64,
    },
    RunCompleted {
        status: ExecutionStatus,
        total_tokens: u64,
        cost_usd: f64,
    },
    RunFailed {
        status: ExecutionStatus,
        reason: String,
    },
}

impl AuditEvent {
    /// Default severity and compliance tag for this kind of event.
    pub fn classify(&self) -> (Severity, &'static str) {
        match self {
            Self::RunStarted { .. } => (Severity::Info, "agentpilot.run.lifecycle"),
            Self::StepRouted { .. } => (Severity::Info, "agentpilot.routing.decision"),
            Self::StepCompleted { success: true, .. } => (Severity::Info, "agentpilot.step.outcome"),
            Self::StepCompleted { success: false, .. } => (Severity::Warning, "agentpilot.step.outcome"),
            Self::RunCompleted { status: ExecutionStatus::Completed, .. } => {
                (Severity::Info, "agentpilot.run.lifecycle")
            }
            Self::RunCompleted { .. } => (Severity::Warning, "agentpilot.run.lifecycle"),
            Self::RunFailed { .. } => (Severity::Critical, "agentpilot.run.failure"),
        }
    }
}

/// Outcome of an audited operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}
