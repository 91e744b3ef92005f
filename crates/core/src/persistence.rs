//! ExecutionStore trait: the persistence collaborator.
//!
//! From the engine's perspective every write here is fire-and-forget:
//! failures are logged by the caller and never abort an otherwise healthy run.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::execution::{ExecutionId, ExecutionRecord};
use crate::routing::RoutingDecision;

/// Durable storage for execution records and the append-only routing history.
///
/// Implementations: in-memory, no-op, SQLite.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    fn name(&self) -> &str;

    async fn create_execution_record(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    async fn update_execution_record(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    async fn append_routing_history(&self, decision: &RoutingDecision) -> Result<(), StoreError>;

    async fn get_execution_record(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>, StoreError>;

    /// Routing decisions of one run in the order they were made.
    async fn routing_history(&self, id: &ExecutionId) -> Result<Vec<RoutingDecision>, StoreError>;
}
