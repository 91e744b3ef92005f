//! Execution record: one per workflow run.
//!
//! Created at run start, updated after every step, closed exactly once with a
//! terminal status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// Unique identifier for one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ExecutionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    PartialSuccess,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::PartialSuccess => "partial_success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "partial_success" => Ok(Self::PartialSuccess),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution status '{other}'")),
        }
    }
}

/// The persisted state of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub workflow_id: String,
    pub agent_id: String,
    pub status: ExecutionStatus,

    /// Index of the step currently (or last) executing
    pub current_step: usize,

    pub steps_executed: usize,
    pub steps_skipped: usize,
    pub steps_failed: usize,

    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    /// Final extracted result (terminal runs only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// Why the run ended the way it did (failed/cancelled runs)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Per-step errors recorded under continue-on-error
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    /// Best-effort view of the execution context at the time the run ended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<serde_json::Value>,
}

impl ExecutionRecord {
    /// A fresh record in `running` state.
    pub fn start(id: ExecutionId, workflow_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            id,
            workflow_id: workflow_id.into(),
            agent_id: agent_id.into(),
            status: ExecutionStatus::Running,
            current_step: 0,
            steps_executed: 0,
            steps_skipped: 0,
            steps_failed: 0,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            started_at: Utc::now(),
            ended_at: None,
            result: None,
            reason: None,
            errors: Vec::new(),
            snapshot: None,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn is_closed(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transition to a terminal status. A record closes exactly once.
    pub fn close(&mut self, status: ExecutionStatus, reason: Option<String>) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::AlreadyClosed(self.id.to_string()));
        }
        if !status.is_terminal() {
            return Err(StoreError::Storage(format!(
                "cannot close execution {} with non-terminal status",
                self.id
            )));
        }
        self.status = status;
        self.reason = reason;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Wall-clock duration so far (or total, once closed).
    pub fn duration_ms(&self) -> u64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_closes_exactly_once() {
        let mut record = ExecutionRecord::start(ExecutionId::new(), "wf", "agent");
        assert!(!record.is_closed());
        record.close(ExecutionStatus::Completed, None).unwrap();
        assert!(record.ended_at.is_some());
        assert!(matches!(
            record.close(ExecutionStatus::Failed, Some("late".into())),
            Err(StoreError::AlreadyClosed(_))
        ));
        assert_eq!(record.status, ExecutionStatus::Completed);
    }

    #[test]
    fn cannot_close_as_running() {
        let mut record = ExecutionRecord::start(ExecutionId::new(), "wf", "agent");
        assert!(record.close(ExecutionStatus::Running, None).is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ExecutionStatus::PartialSuccess).unwrap();
        assert_eq!(json, "\"partial_success\"");
        assert_eq!("partial_success".parse::<ExecutionStatus>().unwrap(), ExecutionStatus::PartialSuccess);
    }
}
