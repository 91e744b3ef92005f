//! No-op execution store: disables persistence of run records entirely.

use agentpilot_core::error::StoreError;
use agentpilot_core::execution::{ExecutionId, ExecutionRecord};
use agentpilot_core::persistence::ExecutionStore;
use agentpilot_core::routing::RoutingDecision;
use async_trait::async_trait;

/// An execution store that keeps nothing.
pub struct NoopExecutionStore;

#[async_trait]
impl ExecutionStore for NoopExecutionStore {
    fn name(&self) -> &str {
        "none"
    }

    async fn create_execution_record(&self, _record: &ExecutionRecord) -> Result<(), StoreError> {
        Ok(())
    }

    async fn update_execution_record(&self, _record: &ExecutionRecord) -> Result<(), StoreError> {
        Ok(())
    }

    async fn append_routing_history(&self, _decision: &RoutingDecision) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_execution_record(&self, _id: &ExecutionId) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(None)
    }

    async fn routing_history(&self, _id: &ExecutionId) -> Result<Vec<RoutingDecision>, StoreError> {
        Ok(Vec::new())
    }
}
