//! Domain event system: decoupled notification of run transitions.
//!
//! The Execution Manager publishes events as a run progresses. Subscribers
//! (the CLI progress printer, tests) react without the engine waiting on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::execution::ExecutionStatus;
use crate::routing::{DecisionSource, Tier};

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A run was accepted and its record created
    RunStarted {
        execution_id: String,
        workflow_id: String,
        agent_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A step was routed to a tier
    StepRouted {
        execution_id: String,
        step_index: usize,
        tier: Tier,
        model_id: String,
        source: DecisionSource,
        timestamp: DateTime<Utc>,
    },

    /// A step finished (after retries)
    StepCompleted {
        execution_id: String,
        step_index: usize,
        success: bool,
        tokens_used: u64,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A run reached a terminal status
    RunFinished {
        execution_id: String,
        status: ExecutionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
