//! Execution Manager: run lifecycle.
//!
//! Creates the execution record, drives the interpreter, classifies the
//! terminal status, and closes the record exactly once. Runs can be driven
//! inline ([`ExecutionManager::run`]) or spawned ([`ExecutionManager::start`])
//! and cancelled by id while in flight.
//!
//! Configuration is swapped atomically on reload; a run keeps the snapshot it
//! started with.

use agentpilot_audit::{AuditEvent, AuditOutcome};
use agentpilot_config::{ConfigError, EngineConfig};
use agentpilot_core::error::StoreError;
use agentpilot_core::event::DomainEvent;
use agentpilot_core::execution::{ExecutionId, ExecutionRecord, ExecutionStatus};
use agentpilot_core::routing::RoutingDecision;
use agentpilot_routing::LearningEngine;
use agentpilot_telemetry::RunMetrics;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::ExecutionContext;
use crate::definition::Workflow;
use crate::error::WorkflowError;
use crate::executor::{Collaborators, ExecutionOutcome, StepExecutor};

/// Everything known about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub record: ExecutionRecord,
    pub decisions: Vec<RoutingDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<RunMetrics>,
}

impl ExecutionReport {
    pub fn status(&self) -> ExecutionStatus {
        self.record.status
    }
}

struct RunHandle {
    cancel: CancellationToken,
    /// `None` for runs driven inline
    task: Option<JoinHandle<ExecutionReport>>,
}

impl RunHandle {
    fn is_finished(&self) -> bool {
        self.task.as_ref().is_some_and(JoinHandle::is_finished)
    }
}

struct Conclusion {
    status: ExecutionStatus,
    reason: Option<String>,
    result: Option<Value>,
}

#[derive(Clone)]
pub struct ExecutionManager {
    config: Arc<RwLock<Arc<EngineConfig>>>,
    collab: Collaborators,
    runs: Arc<RwLock<HashMap<ExecutionId, RunHandle>>>,
}

impl ExecutionManager {
    pub fn new(config: EngineConfig, collab: Collaborators) -> Self {
        Self {
            config: Arc::new(RwLock::new(Arc::new(config))),
            collab,
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collab
    }

    /// The configuration new runs will start with.
    pub async fn config(&self) -> Arc<EngineConfig> {
        self.config.read().await.clone()
    }

    /// Validate and swap in a new configuration. In-flight runs are not
    /// affected.
    pub async fn reload_config(&self, config: EngineConfig) -> Result<(), ConfigError> {
        config.validate()?;
        *self.config.write().await = Arc::new(config);
        info!("configuration reloaded");
        Ok(())
    }

    /// Drive a run to completion on the current task.
    pub async fn run(&self, workflow: &Workflow, input: Value) -> ExecutionReport {
        self.run_with_cancel(workflow, input, CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), with a caller-owned cancellation token.
    pub async fn run_with_cancel(&self, workflow: &Workflow, input: Value, cancel: CancellationToken) -> ExecutionReport {
        let id = ExecutionId::new();
        self.runs.write().await.insert(
            id.clone(),
            RunHandle {
                cancel: cancel.clone(),
                task: None,
            },
        );
        let report = self.drive(id.clone(), workflow, input, cancel).await;
        self.runs.write().await.remove(&id);
        report
    }

    /// Spawn a run and return its id immediately.
    pub async fn start(&self, workflow: Workflow, input: Value) -> ExecutionId {
        let id = ExecutionId::new();
        let cancel = CancellationToken::new();

        // Hold the lock across spawn so the handle is registered before the
        // run can be observed
        let mut runs = self.runs.write().await;
        let manager = self.clone();
        let (run_id, token) = (id.clone(), cancel.clone());
        let task = tokio::spawn(async move { manager.drive(run_id, &workflow, input, token).await });
        runs.insert(
            id.clone(),
            RunHandle {
                cancel,
                task: Some(task),
            },
        );
        id
    }

    /// Wait for a spawned run. Returns `None` for unknown ids, inline runs,
    /// or a run whose task panicked.
    pub async fn wait(&self, id: &ExecutionId) -> Option<ExecutionReport> {
        let task = {
            let mut runs = self.runs.write().await;
            let handle = runs.get_mut(id)?;
            let task = handle.task.take()?;
            runs.remove(id);
            task
        };
        match task.await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(execution_id = %id, error = %e, "run task failed");
                None
            }
        }
    }

    /// Request cancellation. Returns `false` when no such run is in flight.
    pub async fn cancel(&self, id: &ExecutionId) -> bool {
        let runs = self.runs.read().await;
        match runs.get(id) {
            Some(handle) if !handle.is_finished() => {
                info!(execution_id = %id, "cancellation requested");
                handle.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel every in-flight run.
    pub async fn cancel_all(&self) -> usize {
        let runs = self.runs.read().await;
        let mut cancelled = 0;
        for handle in runs.values().filter(|h| !h.is_finished()) {
            handle.cancel.cancel();
            cancelled += 1;
        }
        cancelled
    }

    /// Ids of runs still in flight.
    pub async fn active(&self) -> Vec<ExecutionId> {
        let runs = self.runs.read().await;
        runs.iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// The persisted record for a run, live or finished.
    pub async fn record(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>, StoreError> {
        self.collab.store.get_execution_record(id).await
    }

    /// Status of a run; `None` when the store holds no record of it.
    pub async fn status(&self, id: &ExecutionId) -> Result<Option<ExecutionStatus>, StoreError> {
        Ok(self.record(id).await?.map(|r| r.status))
    }

    async fn drive(&self, id: ExecutionId, workflow: &Workflow, input: Value, cancel: CancellationToken) -> ExecutionReport {
        let config = self.config().await;
        let mut record = ExecutionRecord::start(id.clone(), &workflow.id, &workflow.agent_id);
        info!(execution_id = %id, workflow_id = %workflow.id, agent_id = %workflow.agent_id, "run started");

        if let Err(e) = self.collab.store.create_execution_record(&record).await {
            warn!(execution_id = %id, error = %e, "failed to create execution record");
        }
        self.collab.telemetry.start_trace(id.as_str(), &workflow.id);
        self.collab.events.publish(DomainEvent::RunStarted {
            execution_id: id.to_string(),
            workflow_id: workflow.id.clone(),
            agent_id: workflow.agent_id.clone(),
            timestamp: Utc::now(),
        });
        self.collab.audit.log(
            AuditEvent::RunStarted {
                workflow_id: workflow.id.clone(),
            },
            &workflow.agent_id,
            id.as_str(),
            AuditOutcome::Success,
            None,
        );

        let mut decisions = Vec::new();
        let conclusion = match workflow.check_input(&input) {
            Ok(()) => {
                let executor = StepExecutor::new(&config, &self.collab);
                let outcome = executor.execute(workflow, input, &mut record, &cancel).await;
                let conclusion = conclude(workflow, &outcome);
                record.snapshot = Some(outcome.context.snapshot());
                record.errors = outcome.errors;
                decisions = outcome.decisions;
                conclusion
            }
            Err(e) => {
                warn!(execution_id = %id, error = %e, "invocation input rejected");
                Conclusion {
                    status: ExecutionStatus::Failed,
                    reason: Some(e.to_string()),
                    result: None,
                }
            }
        };

        record.result = conclusion.result;
        if let Err(e) = record.close(conclusion.status, conclusion.reason.clone()) {
            warn!(execution_id = %id, error = %e, "execution record already closed");
        }
        if let Err(e) = self.collab.store.update_execution_record(&record).await {
            warn!(execution_id = %id, error = %e, "failed to persist final execution record");
        }

        let metrics = match self.collab.telemetry.end_trace(id.as_str()) {
            Ok(m) => Some(m),
            Err(e) => {
                debug!(execution_id = %id, error = %e, "trace not closed");
                None
            }
        };

        self.collab.events.publish(DomainEvent::RunFinished {
            execution_id: id.to_string(),
            status: record.status,
            reason: record.reason.clone(),
            timestamp: Utc::now(),
        });
        let (event, outcome) = match record.status {
            ExecutionStatus::Completed | ExecutionStatus::PartialSuccess => (
                AuditEvent::RunCompleted {
                    status: record.status,
                    total_tokens: record.total_tokens(),
                    cost_usd: record.cost_usd,
                },
                AuditOutcome::Success,
            ),
            status => (
                AuditEvent::RunFailed {
                    status,
                    reason: record.reason.clone().unwrap_or_default(),
                },
                if status == ExecutionStatus::Cancelled {
                    AuditOutcome::Cancelled
                } else {
                    AuditOutcome::Failure
                },
            ),
        };
        self.collab
            .audit
            .log(event, &workflow.agent_id, id.as_str(), outcome, record.reason.clone());

        let learning = LearningEngine::new(config.learning.clone(), self.collab.memory.clone());
        if let Err(e) = learning
            .record_run(
                &workflow.agent_id,
                &workflow.id,
                id.as_str(),
                record.status,
                record.total_tokens(),
                record.cost_usd,
            )
            .await
        {
            warn!(execution_id = %id, error = %e, "failed to record execution outcome");
        }

        info!(
            execution_id = %id,
            status = %record.status,
            steps_executed = record.steps_executed,
            steps_skipped = record.steps_skipped,
            steps_failed = record.steps_failed,
            tokens = record.total_tokens(),
            cost_usd = record.cost_usd,
            duration_ms = record.duration_ms(),
            "run finished"
        );

        ExecutionReport {
            record,
            decisions,
            metrics,
        }
    }
}

/// Map an interpreter outcome to a terminal status.
fn conclude(workflow: &Workflow, outcome: &ExecutionOutcome) -> Conclusion {
    let result = assemble_result(workflow, &outcome.context);

    let (status, reason) = match &outcome.halt {
        Some(WorkflowError::Cancelled(reason)) => (ExecutionStatus::Cancelled, Some(reason.clone())),
        Some(e) => (ExecutionStatus::Failed, Some(e.to_string())),
        None => {
            let schema_violation = workflow
                .output_schema
                .as_ref()
                .and_then(|schema| schema.validate(&result).err())
                .map(|violations| WorkflowError::OutputSchemaMismatch(violations.join("; ")));

            match schema_violation {
                Some(e) => (ExecutionStatus::Failed, Some(e.to_string())),
                None if outcome.steps_failed > 0 => (
                    ExecutionStatus::PartialSuccess,
                    Some(format!("{} step(s) failed", outcome.steps_failed)),
                ),
                None => (ExecutionStatus::Completed, None),
            }
        }
    };

    Conclusion {
        status,
        reason,
        result: Some(result),
    }
}

/// The declared output mapping, or the last step output when none is
/// declared.
fn assemble_result(workflow: &Workflow, ctx: &ExecutionContext) -> Value {
    if workflow.output.is_empty() {
        return (0..workflow.steps.len())
            .rev()
            .find_map(|i| ctx.output(i).cloned())
            .unwrap_or_else(|| Value::Object(Map::new()));
    }
    let result: Map<String, Value> = workflow
        .output
        .iter()
        .map(|(name, reference)| (name.clone(), ctx.resolve(reference).cloned().unwrap_or(Value::Null)))
        .collect();
    Value::Object(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentpilot_core::api::{ApiCaller, ApiRequest, ApiResponse};
    use agentpilot_core::error::{ProviderError, ToolError};
    use agentpilot_core::memory::{MemoryKey, MemoryStore, MemoryType};
    use agentpilot_core::persistence::ExecutionStore;
    use agentpilot_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
    use agentpilot_memory::{InMemoryExecutionStore, InMemoryMemoryStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn invoke(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse {
                content: "{\"category\": \"invoice\", \"priority\": \"high\"}".into(),
                usage: Usage {
                    input_tokens: 20,
                    output_tokens: 10,
                },
                tool_calls: Vec::new(),
                latency_ms: 1,
                model: request.model,
            })
        }
    }

    /// Echoes input; `hang` never returns, `fail` is not found.
    struct Api;

    #[async_trait]
    impl ApiCaller for Api {
        async fn call(&self, request: ApiRequest) -> Result<ApiResponse, ToolError> {
            match request.operation.as_str() {
                "hang" => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                "fail" => Err(ToolError::NotFound("fail".into())),
                _ => Ok(ApiResponse {
                    body: request.input,
                    latency_ms: 1,
                }),
            }
        }

        fn supports(&self, _operation: &str) -> bool {
            true
        }
    }

    fn manager(config: EngineConfig) -> (ExecutionManager, Arc<InMemoryMemoryStore>, Arc<InMemoryExecutionStore>) {
        let memory = Arc::new(InMemoryMemoryStore::new());
        let store = Arc::new(InMemoryExecutionStore::new());
        let collab = Collaborators::new(Arc::new(EchoProvider), Arc::new(Api), memory.clone(), store.clone());
        (ExecutionManager::new(config, collab), memory, store)
    }

    fn triage() -> Workflow {
        Workflow::from_json_str(
            &json!({
                "id": "triage",
                "agent_id": "support",
                "required_inputs": ["subject"],
                "steps": [
                    {"type": "llm_decision", "prompt": "Classify {{subject}}",
                     "inputs": {"subject": "input.subject"},
                     "outputs": {"category": "category"}},
                    {"type": "api_call", "operation": "ticket.create",
                     "inputs": {"category": "step_0.output.category"}}
                ],
                "output": {"category": "step_0.output.category", "ticket": "step_1.output"},
                "output_schema": {"required": ["category"], "properties": {"category": "string"}}
            })
            .to_string(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn completed_run_closes_record_with_result() {
        let (manager, memory, store) = manager(EngineConfig::default());
        let report = manager.run(&triage(), json!({"subject": "Invoice #4"})).await;

        assert_eq!(report.status(), ExecutionStatus::Completed);
        assert_eq!(report.record.steps_executed, 2);
        assert_eq!(report.record.total_tokens(), 30);
        assert_eq!(
            report.record.result,
            Some(json!({"category": "invoice", "ticket": {"category": "invoice"}}))
        );
        assert!(report.record.ended_at.is_some());
        assert_eq!(report.decisions.len(), 2);
        assert_eq!(report.metrics.as_ref().map(|m| m.model_calls), Some(1));

        let stored = store.get_execution_record(&report.record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);

        let outcome = memory
            .get(&MemoryKey::new("support", MemoryType::ExecutionOutcome, "triage"))
            .await
            .unwrap();
        assert!(outcome.is_some());
    }

    #[tokio::test]
    async fn missing_required_input_fails_without_spend() {
        let (manager, _, _) = manager(EngineConfig::default());
        let report = manager.run(&triage(), json!({})).await;
        assert_eq!(report.status(), ExecutionStatus::Failed);
        assert_eq!(report.record.steps_executed, 0);
        assert_eq!(report.record.total_tokens(), 0);
        assert!(report.record.reason.unwrap().contains("subject"));
    }

    #[tokio::test]
    async fn schema_mismatch_downgrades_to_failed() {
        let (manager, _, _) = manager(EngineConfig::default());
        let wf = Workflow::from_json_str(
            &json!({
                "id": "wf",
                "steps": [{"type": "api_call", "operation": "echo", "inputs": {"sent": {"value": "yes"}}}],
                "output": {"sent": "step_0.output.sent"},
                "output_schema": {"required": ["sent"], "properties": {"sent": "boolean"}}
            })
            .to_string(),
        )
        .unwrap();

        let report = manager.run(&wf, json!({})).await;
        assert_eq!(report.status(), ExecutionStatus::Failed);
        assert!(report.record.reason.unwrap().contains("schema"));
    }

    #[tokio::test]
    async fn tolerated_failures_give_partial_success() {
        let mut config = EngineConfig::default();
        config.guardrails.continue_on_error = true;
        let (manager, _, _) = manager(config);
        let wf = Workflow::from_json_str(
            &json!({
                "id": "wf",
                "steps": [
                    {"type": "api_call", "operation": "fail"},
                    {"type": "api_call", "operation": "echo", "inputs": {"done": {"value": true}}}
                ]
            })
            .to_string(),
        )
        .unwrap();

        let report = manager.run(&wf, json!({})).await;
        assert_eq!(report.status(), ExecutionStatus::PartialSuccess);
        assert_eq!(report.record.steps_failed, 1);
        assert_eq!(report.record.errors.len(), 1);
        assert_eq!(report.record.result, Some(json!({"done": true})));
    }

    #[tokio::test]
    async fn spawned_run_can_be_cancelled() {
        let (manager, _, store) = manager(EngineConfig::default());
        let wf = Workflow::from_json_str(
            &json!({"id": "wf", "steps": [{"type": "api_call", "operation": "hang"}]}).to_string(),
        )
        .unwrap();

        let id = manager.start(wf, json!({})).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.active().await, vec![id.clone()]);
        assert!(manager.cancel(&id).await);

        let report = manager.wait(&id).await.unwrap();
        assert_eq!(report.status(), ExecutionStatus::Cancelled);
        assert!(!manager.cancel(&id).await);

        let stored = store.get_execution_record(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
        assert!(manager.active().await.is_empty());
    }

    #[tokio::test]
    async fn reload_rejects_invalid_config_and_keeps_the_old_one() {
        let (manager, _, _) = manager(EngineConfig::default());
        let mut bad = EngineConfig::default();
        bad.routing.fast_max = 9.0;
        bad.routing.balanced_max = 4.0;
        assert!(manager.reload_config(bad).await.is_err());
        assert_eq!(manager.config().await.routing.fast_max, EngineConfig::default().routing.fast_max);

        let mut good = EngineConfig::default();
        good.guardrails.max_steps = 7;
        manager.reload_config(good).await.unwrap();
        assert_eq!(manager.config().await.guardrails.max_steps, 7);
    }

    #[tokio::test]
    async fn audit_trail_follows_the_run() {
        let (manager, _, _) = manager(EngineConfig::default());
        let report = manager.run(&triage(), json!({"subject": "hello"})).await;
        let entries = manager.collaborators().audit.entries_for(report.record.id.as_str());
        // started, 2 × (routed + completed), finished
        assert_eq!(entries.len(), 6);
    }
}
