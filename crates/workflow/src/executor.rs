//! Step Executor: the workflow interpreter.
//!
//! Walks the steps in index order unless a conditional redirects control.
//! For every step execution:
//!
//! 1. resolve inputs against the execution context (missing required
//!    reference: fatal validation error, nothing is spent)
//! 2. loop detection on (operation, resolved inputs)
//! 3. complexity analysis and routing; the decision is recorded before the
//!    step runs
//! 4. budget pre-check, then up to `1 + retries` attempts, each raced
//!    against cancellation, the run deadline and the step timeout
//! 5. output extraction and budget post-check
//! 6. learning update, applied only once the outcome is known
//!
//! Consecutive steps sharing a `parallel_group` run concurrently (bounded by
//! `max_parallel_steps`) against a read-only view of the context; their
//! outputs are written to their own slots once the whole group is done.

use agentpilot_audit::{AuditEvent, AuditLogger, AuditOutcome};
use agentpilot_config::{EngineConfig, GuardrailsConfig};
use agentpilot_core::api::{ApiCaller, ApiRequest};
use agentpilot_core::error::{ProviderError, ToolError};
use agentpilot_core::event::{DomainEvent, EventBus};
use agentpilot_core::execution::{ExecutionId, ExecutionRecord};
use agentpilot_core::memory::MemoryStore;
use agentpilot_core::message::Message;
use agentpilot_core::persistence::ExecutionStore;
use agentpilot_core::provider::{Provider, ProviderRequest, Usage};
use agentpilot_core::routing::RoutingDecision;
use agentpilot_routing::{
    ComplexityAnalyzer, LearningEngine, Observation, RouteRequest, RoutingEngine, StepProfile, TaskComplexityAnalyzer,
    estimate_tokens,
};
use agentpilot_telemetry::{Span, SpanKind, TelemetryEngine};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{ExecutionContext, navigate};
use crate::definition::{InputBinding, Step, StepKind, Workflow};
use crate::error::WorkflowError;
use crate::guardrails::{CircuitBreaker, LoopDetector, RetryPolicy, TokenBudget, fingerprint};

const TRANSFORM_SYSTEM_PROMPT: &str =
    "You transform data. Reply with a single JSON object and nothing else.";

/// Handles to everything the interpreter talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn Provider>,
    pub api: Arc<dyn ApiCaller>,
    pub memory: Arc<dyn MemoryStore>,
    pub store: Arc<dyn ExecutionStore>,
    /// Replaces the configured six-factor analyzer when set
    pub analyzer: Option<Arc<dyn ComplexityAnalyzer>>,
    pub telemetry: Arc<TelemetryEngine>,
    pub audit: Arc<AuditLogger>,
    pub events: Arc<EventBus>,
}

impl Collaborators {
    pub fn new(
        provider: Arc<dyn Provider>,
        api: Arc<dyn ApiCaller>,
        memory: Arc<dyn MemoryStore>,
        store: Arc<dyn ExecutionStore>,
    ) -> Self {
        Self {
            provider,
            api,
            memory,
            store,
            analyzer: None,
            telemetry: Arc::new(TelemetryEngine::new()),
            audit: Arc::new(AuditLogger::new()),
            events: Arc::new(EventBus::default()),
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn ComplexityAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryEngine>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }
}

/// What the interpreter hands back to the Execution Manager.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub context: ExecutionContext,
    /// Why the run stopped early, if it did
    pub halt: Option<WorkflowError>,
    /// Step failures tolerated under `continue_on_error`
    pub errors: Vec<String>,
    pub decisions: Vec<RoutingDecision>,
    pub steps_executed: usize,
    pub steps_skipped: usize,
    pub steps_failed: usize,
    pub usage: Usage,
    pub cost_usd: f64,
}

// ── Internal run state ──────────────────────────────────────────────────────

struct RunScope<'a> {
    execution_id: &'a ExecutionId,
    agent_id: &'a str,
    agent_score: f64,
    cancel: &'a CancellationToken,
    deadline: Instant,
}

struct RunState {
    ctx: ExecutionContext,
    budget: TokenBudget,
    breaker: CircuitBreaker,
    loops: LoopDetector,
    visits: Vec<u32>,
    visited: Vec<bool>,
    branch_skipped: BTreeSet<usize>,
    errors: Vec<String>,
    decisions: Vec<RoutingDecision>,
    executed: usize,
    failed: usize,
    usage: Usage,
    cost_usd: f64,
}

impl RunState {
    fn skipped(&self) -> usize {
        self.branch_skipped.iter().filter(|i| !self.visited[**i]).count()
    }
}

struct Prepared {
    index: usize,
    inputs: Value,
    visit: u32,
}

struct StepSuccess {
    outputs: Value,
    branch: Option<bool>,
}

enum StepError {
    /// The step could not complete; `continue_on_error` decides what happens
    Failed(WorkflowError),
    /// The run must stop
    Fatal(WorkflowError),
}

struct StepReport {
    index: usize,
    decision: RoutingDecision,
    result: Result<StepSuccess, StepError>,
    usage: Usage,
    cost_usd: f64,
}

#[derive(Default)]
struct Tally {
    attempts: u32,
    usage: Usage,
    cost_usd: f64,
    /// At least one attempt returned, so the step has an observable outcome
    outcome_known: bool,
}

/// One failed attempt.
struct AttemptFailure {
    reason: String,
    transient: bool,
    retry_after: Option<Duration>,
}

impl From<ProviderError> for AttemptFailure {
    fn from(e: ProviderError) -> Self {
        let retry_after = match &e {
            ProviderError::RateLimited { retry_after_secs } => Some(Duration::from_secs(*retry_after_secs)),
            _ => None,
        };
        Self {
            transient: e.is_transient(),
            reason: e.to_string(),
            retry_after,
        }
    }
}

impl From<ToolError> for AttemptFailure {
    fn from(e: ToolError) -> Self {
        Self {
            transient: e.is_transient(),
            reason: e.to_string(),
            retry_after: None,
        }
    }
}

struct Invocation {
    raw: Value,
    usage: Usage,
    model: String,
    branch: Option<bool>,
}

enum Interrupt {
    Cancelled,
    Deadline,
}

// ── Executor ────────────────────────────────────────────────────────────────

pub struct StepExecutor {
    collab: Collaborators,
    analyzer: Arc<dyn ComplexityAnalyzer>,
    router: RoutingEngine,
    learning: LearningEngine,
    guardrails: GuardrailsConfig,
    budget: agentpilot_config::BudgetConfig,
    retry: RetryPolicy,
    temperature: f32,
    default_agent_score: f64,
}

impl StepExecutor {
    /// Build an executor over a configuration snapshot.
    pub fn new(config: &EngineConfig, collab: &Collaborators) -> Self {
        let analyzer: Arc<dyn ComplexityAnalyzer> = match &collab.analyzer {
            Some(a) => a.clone(),
            None => Arc::new(TaskComplexityAnalyzer::new(config.complexity.clone())),
        };
        Self {
            analyzer,
            router: RoutingEngine::new(
                config.routing.clone(),
                config.models.clone(),
                collab.memory.clone(),
                collab.store.clone(),
            ),
            learning: LearningEngine::new(config.learning.clone(), collab.memory.clone()),
            guardrails: config.guardrails.clone(),
            budget: config.budget.clone(),
            retry: RetryPolicy::from_config(&config.guardrails),
            temperature: config.provider.temperature,
            default_agent_score: config.routing.default_agent_score,
            collab: collab.clone(),
        }
    }

    /// Interpret a workflow. `record` is updated and persisted after every
    /// step; closing it is the caller's job.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        input: Value,
        record: &mut ExecutionRecord,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        let step_count = workflow.steps.len();
        let execution_id = record.id.clone();
        let scope = RunScope {
            execution_id: &execution_id,
            agent_id: &workflow.agent_id,
            agent_score: workflow.agent_score.unwrap_or(self.default_agent_score),
            cancel,
            deadline: deadline_after(self.guardrails.max_execution_time_secs),
        };
        let mut state = RunState {
            ctx: ExecutionContext::new(input, step_count),
            budget: TokenBudget::new(self.budget.clone(), workflow.intent.as_deref(), step_count),
            breaker: CircuitBreaker::new(self.guardrails.circuit_breaker_threshold),
            loops: LoopDetector::from_config(&self.guardrails),
            visits: vec![0; step_count],
            visited: vec![false; step_count],
            branch_skipped: BTreeSet::new(),
            errors: Vec::new(),
            decisions: Vec::new(),
            executed: 0,
            failed: 0,
            usage: Usage::default(),
            cost_usd: 0.0,
        };

        let mut index = 0;
        let halt = loop {
            if index >= step_count {
                break None;
            }
            if let Err(e) = self.check_run_limits(&scope) {
                break Some(e);
            }

            let group = self.group_at(workflow, index);
            if state.executed + group.len() > self.guardrails.max_steps {
                break Some(WorkflowError::LimitExceeded(format!(
                    "max steps ({}) reached",
                    self.guardrails.max_steps
                )));
            }

            let prepared = match self.prepare(workflow, group.clone(), &mut state) {
                Ok(p) => p,
                Err(e) => break Some(e),
            };

            let reports: Vec<StepReport> = {
                let ctx = &state.ctx;
                let budget = &state.budget;
                let mut reports: Vec<StepReport> = stream::iter(prepared)
                    .map(|p| self.run_step(workflow, p, &scope, ctx, budget))
                    .buffer_unordered(self.guardrails.max_parallel_steps.max(1))
                    .collect()
                    .await;
                reports.sort_by_key(|r| r.index);
                reports
            };

            let mut next = group.end;
            let mut halted = None;
            for report in reports {
                let step_index = report.index;
                state.executed += 1;
                state.visited[step_index] = true;
                state.usage.input_tokens += report.usage.input_tokens;
                state.usage.output_tokens += report.usage.output_tokens;
                state.cost_usd += report.cost_usd;
                if report.usage.total() > 0 {
                    state.budget.record(report.usage.total());
                    debug!(
                        step = step_index,
                        used = state.budget.used(),
                        remaining = state.budget.remaining(),
                        "run token budget"
                    );
                }
                state.decisions.push(report.decision);

                if halted.is_some() {
                    continue;
                }
                match self.apply(workflow, step_index, report.result, &mut state) {
                    Ok(Some(target)) => next = target,
                    Ok(None) => {}
                    Err(e) => halted = Some(e),
                }
            }

            self.persist(record, &state, index).await;
            if halted.is_some() {
                break halted;
            }
            index = next;
        };

        if let Some(e) = &halt {
            warn!(execution_id = %execution_id, kind = e.kind(), error = %e, "run halted");
        }

        ExecutionOutcome {
            steps_skipped: state.skipped(),
            steps_executed: state.executed,
            steps_failed: state.failed,
            usage: state.usage,
            cost_usd: state.cost_usd,
            errors: state.errors,
            decisions: state.decisions,
            context: state.ctx,
            halt,
        }
    }

    fn check_run_limits(&self, scope: &RunScope<'_>) -> Result<(), WorkflowError> {
        if scope.cancel.is_cancelled() {
            return Err(WorkflowError::Cancelled("run cancelled".into()));
        }
        if Instant::now() >= scope.deadline {
            return Err(self.deadline_error());
        }
        Ok(())
    }

    fn deadline_error(&self) -> WorkflowError {
        WorkflowError::LimitExceeded(format!(
            "max execution time of {}s exceeded",
            self.guardrails.max_execution_time_secs
        ))
    }

    /// The steps that run together starting at `index`: a whole parallel
    /// group when parallel mode is on, otherwise just the one step.
    fn group_at(&self, workflow: &Workflow, index: usize) -> Range<usize> {
        let group = match &workflow.steps[index].parallel_group {
            Some(g) if self.guardrails.max_parallel_steps > 1 => g,
            _ => return index..index + 1,
        };
        let end = workflow.steps[index..]
            .iter()
            .take_while(|s| s.parallel_group.as_ref() == Some(group))
            .count();
        index..index + end
    }

    /// Resolve inputs and run loop detection for each step of a group.
    fn prepare(
        &self,
        workflow: &Workflow,
        group: Range<usize>,
        state: &mut RunState,
    ) -> Result<Vec<Prepared>, WorkflowError> {
        let mut prepared = Vec::with_capacity(group.len());
        for i in group {
            let step = &workflow.steps[i];
            let inputs = resolve_inputs(step, &state.ctx)?;

            // Conditionals are control flow, not invocations
            if !matches!(step.kind, StepKind::Conditional { .. })
                && let Some(repeats) = state.loops.observe(fingerprint(&step.operation, &inputs))
            {
                return Err(WorkflowError::LoopDetected {
                    step: i,
                    operation: step.operation.clone(),
                    repeats,
                });
            }

            state.visits[i] += 1;
            prepared.push(Prepared {
                index: i,
                inputs,
                visit: state.visits[i],
            });
        }
        Ok(prepared)
    }

    /// Fold one step's result into the run. Returns a branch target when
    /// control should jump.
    fn apply(
        &self,
        workflow: &Workflow,
        index: usize,
        result: Result<StepSuccess, StepError>,
        state: &mut RunState,
    ) -> Result<Option<usize>, WorkflowError> {
        match result {
            Ok(success) => {
                state.ctx.store(index, success.outputs);
                state.breaker.record_success();
                state.budget.check_total(0)?;

                if let (Some(taken), StepKind::Conditional { on_true, on_false, .. }) =
                    (success.branch, &workflow.steps[index].kind)
                {
                    let target = if taken { *on_true } else { *on_false };
                    if target > index + 1 {
                        state.branch_skipped.extend(index + 1..target);
                    }
                    debug!(step = index, taken, target, "branch");
                    return Ok(Some(target));
                }
                Ok(None)
            }
            Err(StepError::Fatal(e)) => Err(e),
            Err(StepError::Failed(e)) => {
                state.failed += 1;
                if state.breaker.record_failure() {
                    return Err(WorkflowError::CircuitOpen {
                        failures: state.breaker.consecutive_failures(),
                    });
                }
                if !self.guardrails.continue_on_error {
                    return Err(e);
                }
                warn!(step = index, error = %e, "step failed, continuing");
                state.errors.push(e.to_string());
                Ok(None)
            }
        }
    }

    async fn persist(&self, record: &mut ExecutionRecord, state: &RunState, current_step: usize) {
        record.current_step = current_step;
        record.steps_executed = state.executed;
        record.steps_skipped = state.skipped();
        record.steps_failed = state.failed;
        record.input_tokens = state.usage.input_tokens;
        record.output_tokens = state.usage.output_tokens;
        record.cost_usd = state.cost_usd;
        record.errors = state.errors.clone();
        if let Err(e) = self.collab.store.update_execution_record(record).await {
            warn!(execution_id = %record.id, error = %e, "failed to persist execution record");
        }
    }

    // ── One step ────────────────────────────────────────────────────────────

    async fn run_step(
        &self,
        workflow: &Workflow,
        prepared: Prepared,
        scope: &RunScope<'_>,
        ctx: &ExecutionContext,
        budget: &TokenBudget,
    ) -> StepReport {
        let step = &workflow.steps[prepared.index];
        let step_type = step.step_type();

        let assessment = self.analyzer.analyze(&step_profile(step, prepared.inputs.clone()));

        let decision = self
            .router
            .route(RouteRequest {
                execution_id: scope.execution_id,
                agent_id: scope.agent_id,
                step_index: step.index,
                step_type,
                agent_score: scope.agent_score,
                assessment,
            })
            .await;

        self.collab.events.publish(DomainEvent::StepRouted {
            execution_id: scope.execution_id.to_string(),
            step_index: step.index,
            tier: decision.tier,
            model_id: decision.model_id.clone(),
            source: decision.source,
            timestamp: Utc::now(),
        });
        self.collab.audit.log(
            AuditEvent::StepRouted {
                step_index: step.index,
                tier: decision.tier,
                model_id: decision.model_id.clone(),
                source: decision.source,
                complexity_score: decision.complexity_score,
            },
            scope.agent_id,
            scope.execution_id.as_str(),
            AuditOutcome::Success,
            Some(format!("effective complexity {:.2}", decision.effective_complexity)),
        );

        let started = std::time::Instant::now();
        let mut tally = Tally::default();
        let result = self
            .attempts(step, &prepared.inputs, &decision, scope, ctx, budget, &mut tally)
            .await;
        let success = result.is_ok();

        if tally.outcome_known {
            let observation = Observation {
                agent_id: scope.agent_id.to_string(),
                step_type,
                tier: decision.tier,
                success,
                quality: None,
                observation_id: format!("{}:{}:{}", scope.execution_id, step.index, prepared.visit),
            };
            if let Err(e) = self.learning.learn(&observation).await {
                warn!(execution_id = %scope.execution_id, step = step.index, error = %e, "learning update failed");
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        self.collab.events.publish(DomainEvent::StepCompleted {
            execution_id: scope.execution_id.to_string(),
            step_index: step.index,
            success,
            tokens_used: tally.usage.total(),
            duration_ms,
            timestamp: Utc::now(),
        });
        let error_detail = match &result {
            Err(StepError::Failed(e) | StepError::Fatal(e)) => Some(e.to_string()),
            Ok(_) => None,
        };
        self.collab.audit.log(
            AuditEvent::StepCompleted {
                step_index: step.index,
                success,
                attempts: tally.attempts,
                tokens: tally.usage.total(),
            },
            scope.agent_id,
            scope.execution_id.as_str(),
            if success { AuditOutcome::Success } else { AuditOutcome::Failure },
            error_detail,
        );
        info!(
            execution_id = %scope.execution_id,
            step = step.index,
            name = %step.name,
            tier = %decision.tier,
            success,
            attempts = tally.attempts,
            tokens = tally.usage.total(),
            duration_ms,
            "step finished"
        );

        StepReport {
            index: step.index,
            decision,
            result,
            usage: tally.usage,
            cost_usd: tally.cost_usd,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempts(
        &self,
        step: &Step,
        inputs: &Value,
        decision: &RoutingDecision,
        scope: &RunScope<'_>,
        ctx: &ExecutionContext,
        budget: &TokenBudget,
        tally: &mut Tally,
    ) -> Result<StepSuccess, StepError> {
        let invokes_model = step.step_type().invokes_model();
        let allotment = budget.allotment(step);
        let messages = messages_for(step, inputs);

        // Pre-check: refuse before spending when the prompt alone cannot fit
        let mut max_output = None;
        if let Some(messages) = &messages {
            let estimated: u64 = messages.iter().map(|m| estimate_tokens(&m.content) as u64).sum();
            budget.check_step(estimated, allotment).map_err(StepError::Fatal)?;
            budget.check_total(estimated).map_err(StepError::Fatal)?;
            let headroom = budget.step_limit(allotment).saturating_sub(estimated).max(1);
            max_output = Some(u64::from(budget.default_max_output_tokens()).min(headroom) as u32);
        }

        let attempts = self.retry.attempts_for(step);
        let step_timeout = Duration::from_secs(self.guardrails.step_timeout_secs);

        for attempt in 1..=attempts {
            tally.attempts = attempt;
            let mut span = Span::new(SpanKind::for_step(step.step_type()), step.index, attempt, &step.name)
                .with_route(decision.tier, &decision.model_id);

            let call = self.invoke(step, inputs, decision, ctx, messages.as_deref(), max_output);
            let returned = tokio::select! {
                biased;
                _ = scope.cancel.cancelled() => Err(Interrupt::Cancelled),
                _ = sleep_until(scope.deadline) => Err(Interrupt::Deadline),
                r = timeout(step_timeout, call) => Ok(r.unwrap_or_else(|_| Err(AttemptFailure {
                    reason: format!("timed out after {}s", step_timeout.as_secs()),
                    transient: true,
                    retry_after: None,
                }))),
            };

            let invocation = match returned {
                Ok(invocation) => invocation,
                Err(interrupt) => {
                    let error = self.interrupt_error(interrupt);
                    span.end(false, Some(error.to_string()));
                    self.record_span(scope, span);
                    return Err(StepError::Fatal(error));
                }
            };
            tally.outcome_known = true;

            let failure = match invocation {
                Ok(inv) => {
                    let cost = if invokes_model {
                        self.collab
                            .telemetry
                            .compute_cost(&inv.model, inv.usage.input_tokens, inv.usage.output_tokens)
                    } else {
                        0.0
                    };
                    tally.usage.input_tokens += inv.usage.input_tokens;
                    tally.usage.output_tokens += inv.usage.output_tokens;
                    tally.cost_usd += cost;
                    span.record_tokens(inv.usage.input_tokens, inv.usage.output_tokens, cost);

                    if invokes_model && let Err(e) = budget.check_step(inv.usage.total(), allotment) {
                        span.end(false, Some(e.to_string()));
                        self.record_span(scope, span);
                        return Err(StepError::Fatal(e));
                    }

                    match extract_outputs(step, &inv.raw) {
                        Ok(outputs) => {
                            span.end(true, None);
                            self.record_span(scope, span);
                            return Ok(StepSuccess {
                                outputs,
                                branch: inv.branch,
                            });
                        }
                        Err(reason) => AttemptFailure {
                            reason,
                            transient: invokes_model,
                            retry_after: None,
                        },
                    }
                }
                Err(failure) => failure,
            };

            span.end(false, Some(failure.reason.clone()));
            self.record_span(scope, span);

            if !failure.transient {
                return Err(StepError::Failed(WorkflowError::StepFailed {
                    step: step.index,
                    reason: failure.reason,
                }));
            }
            if attempt == attempts {
                return Err(StepError::Failed(WorkflowError::TransientStep {
                    step: step.index,
                    attempts: attempt,
                    reason: failure.reason,
                }));
            }

            let hinted = failure.retry_after.unwrap_or_default().min(self.retry.max_delay);
            let delay = self.retry.delay_for(attempt).max(hinted);
            debug!(step = step.index, attempt, delay_ms = delay.as_millis() as u64, reason = %failure.reason, "retrying step");
            tokio::select! {
                biased;
                _ = scope.cancel.cancelled() => return Err(StepError::Fatal(self.interrupt_error(Interrupt::Cancelled))),
                _ = sleep_until(scope.deadline) => return Err(StepError::Fatal(self.interrupt_error(Interrupt::Deadline))),
                _ = sleep(delay) => {}
            }
        }

        Err(StepError::Failed(WorkflowError::StepFailed {
            step: step.index,
            reason: "no attempts were made".into(),
        }))
    }

    fn interrupt_error(&self, interrupt: Interrupt) -> WorkflowError {
        match interrupt {
            Interrupt::Cancelled => WorkflowError::Cancelled("run cancelled".into()),
            Interrupt::Deadline => self.deadline_error(),
        }
    }

    fn record_span(&self, scope: &RunScope<'_>, span: Span) {
        if let Err(e) = self.collab.telemetry.record_span(scope.execution_id.as_str(), span) {
            debug!(execution_id = %scope.execution_id, error = %e, "span not recorded");
        }
    }

    /// One attempt of one step.
    async fn invoke(
        &self,
        step: &Step,
        inputs: &Value,
        decision: &RoutingDecision,
        ctx: &ExecutionContext,
        messages: Option<&[Message]>,
        max_output: Option<u32>,
    ) -> Result<Invocation, AttemptFailure> {
        match &step.kind {
            StepKind::LlmDecision { .. } | StepKind::Transform { .. } => {
                let mut request = ProviderRequest::new(&decision.model_id, messages.unwrap_or_default().to_vec());
                request.temperature = self.temperature;
                request.max_tokens = max_output;
                if let StepKind::LlmDecision { tools, .. } = &step.kind {
                    request.tools = tools.clone();
                }

                let response = self.collab.provider.invoke(request).await?;
                let mut raw = parse_reply(&response.content);
                if !response.tool_calls.is_empty()
                    && let Value::Object(map) = &mut raw
                {
                    let calls: Vec<Value> = response
                        .tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "name": call.name,
                                "arguments": serde_json::from_str::<Value>(&call.arguments)
                                    .unwrap_or_else(|_| Value::String(call.arguments.clone())),
                            })
                        })
                        .collect();
                    map.insert("tool_calls".into(), Value::Array(calls));
                }

                let model = if response.model.is_empty() {
                    decision.model_id.clone()
                } else {
                    response.model
                };
                Ok(Invocation {
                    raw,
                    usage: response.usage,
                    model,
                    branch: None,
                })
            }
            StepKind::Conditional { expr, .. } => {
                let resolve = |segments: &[String]| -> Value {
                    match inputs.get(&segments[0]) {
                        Some(local) => navigate(local, &segments[1..]).cloned().unwrap_or(Value::Null),
                        None => ctx.lookup(segments).cloned().unwrap_or(Value::Null),
                    }
                };
                let result = expr.evaluate_bool(&resolve).map_err(|e| AttemptFailure {
                    reason: format!("condition: {e}"),
                    transient: true,
                    retry_after: None,
                })?;
                Ok(Invocation {
                    raw: json!({ "result": result }),
                    usage: Usage::default(),
                    model: decision.model_id.clone(),
                    branch: Some(result),
                })
            }
            StepKind::ApiCall => {
                let response = self
                    .collab
                    .api
                    .call(ApiRequest {
                        operation: step.operation.clone(),
                        input: inputs.clone(),
                    })
                    .await?;
                Ok(Invocation {
                    raw: response.body,
                    usage: Usage::default(),
                    model: decision.model_id.clone(),
                    branch: None,
                })
            }
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// What the complexity analyzer sees of a step.
pub fn step_profile(step: &Step, inputs: Value) -> StepProfile {
    StepProfile {
        step_type: Some(step.step_type()),
        text: step.text().to_string(),
        inputs,
        reasoning_depth: step.reasoning_depth,
        comparison_count: match &step.kind {
            StepKind::Conditional { expr, .. } => Some(expr.comparison_count()),
            _ => None,
        },
        consumed_steps: step.consumed_steps().len(),
        output_fields: step.outputs.len(),
        tool_count: step.tool_count(),
    }
}

/// `now + secs`, or roughly thirty years out when that is not representable.
fn deadline_after(secs: u64) -> Instant {
    let now = Instant::now();
    now.checked_add(Duration::from_secs(secs))
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

/// Inputs that can be resolved before the run starts: literals, `input.*`
/// references and defaults. Used for dry-run analysis.
pub fn preview_inputs(step: &Step, ctx: &ExecutionContext) -> Value {
    let resolved: Map<String, Value> = step
        .inputs
        .iter()
        .filter_map(|(name, binding)| {
            let value = match binding {
                InputBinding::Literal(value) => Some(value.clone()),
                InputBinding::Reference { source, default, .. } => ctx.resolve(source).or(default.as_ref()).cloned(),
            };
            value.map(|v| (name.clone(), v))
        })
        .collect();
    Value::Object(resolved)
}

/// Dereference a step's input mapping. A missing required reference without
/// a default is a validation error.
fn resolve_inputs(step: &Step, ctx: &ExecutionContext) -> Result<Value, WorkflowError> {
    let mut resolved = Map::new();
    for (name, binding) in &step.inputs {
        match binding {
            InputBinding::Literal(value) => {
                resolved.insert(name.clone(), value.clone());
            }
            InputBinding::Reference {
                source,
                required,
                default,
            } => match ctx.resolve(source).or(default.as_ref()) {
                Some(value) => {
                    resolved.insert(name.clone(), value.clone());
                }
                None if *required => {
                    return Err(WorkflowError::Validation(format!(
                        "step {} ('{}'): required input '{name}' from '{source}' is missing",
                        step.index, step.name
                    )));
                }
                None => {}
            },
        }
    }
    Ok(Value::Object(resolved))
}

/// Replace `{{name}}` placeholders with resolved inputs. Strings are inserted
/// raw, everything else as JSON.
fn render(template: &str, inputs: &Value) -> String {
    let Some(map) = inputs.as_object() else {
        return template.to_string();
    };
    map.iter().fold(template.to_string(), |text, (name, value)| {
        let replacement = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        text.replace(&format!("{{{{{name}}}}}"), &replacement)
            .replace(&format!("{{{{ {name} }}}}"), &replacement)
    })
}

fn messages_for(step: &Step, inputs: &Value) -> Option<Vec<Message>> {
    match &step.kind {
        StepKind::LlmDecision { prompt, system, .. } => {
            let mut messages = Vec::with_capacity(2);
            if let Some(system) = system {
                messages.push(Message::system(render(system, inputs)));
            }
            messages.push(Message::user(render(prompt, inputs)));
            Some(messages)
        }
        StepKind::Transform { instruction } => {
            let data = serde_json::to_string_pretty(inputs).unwrap_or_default();
            Some(vec![
                Message::system(TRANSFORM_SYSTEM_PROMPT),
                Message::user(format!("{instruction}\n\nInput:\n{data}")),
            ])
        }
        StepKind::Conditional { .. } | StepKind::ApiCall => None,
    }
}

/// A reply that is a JSON object (optionally fenced) is used as is;
/// anything else becomes `{"content": text}`.
fn parse_reply(content: &str) -> Value {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);
    match serde_json::from_str::<Value>(body) {
        Ok(object @ Value::Object(_)) => object,
        _ => json!({ "content": content }),
    }
}

/// Apply the output mapping. An empty mapping exposes the raw result.
fn extract_outputs(step: &Step, raw: &Value) -> Result<Value, String> {
    if step.outputs.is_empty() {
        return Ok(match raw {
            Value::Object(_) => raw.clone(),
            other => json!({ "value": other }),
        });
    }
    let mut outputs = Map::new();
    for (field, path) in &step.outputs {
        let value = navigate(raw, path)
            .ok_or_else(|| format!("result has no '{}' for output '{field}'", path.join(".")))?;
        outputs.insert(field.clone(), value.clone());
    }
    Ok(Value::Object(outputs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentpilot_core::api::ApiResponse;
    use agentpilot_core::execution::ExecutionStatus;
    use agentpilot_core::memory::MemoryKey;
    use agentpilot_core::message::MessageToolCall;
    use agentpilot_core::provider::ProviderResponse;
    use agentpilot_core::routing::{StepType, Tier};
    use agentpilot_memory::{InMemoryExecutionStore, InMemoryMemoryStore};
    use agentpilot_routing::{ComplexityAssessment, RoutingPattern};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ── Fakes ───────────────────────────────────────────────────────────────

    enum Reply {
        Text(&'static str, u64, u64),
        Error(ProviderError),
        Hang,
    }

    /// Returns scripted replies in order.
    struct ScriptedProvider {
        replies: Mutex<VecDeque<Reply>>,
        calls: AtomicUsize,
        requests: Mutex<Vec<ProviderRequest>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn invoke(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let model = request.model.clone();
            self.requests.lock().unwrap().push(request);
            let reply = self.replies.lock().unwrap().pop_front();
            match reply {
                Some(Reply::Text(content, input, output)) => Ok(ProviderResponse {
                    content: content.into(),
                    usage: Usage {
                        input_tokens: input,
                        output_tokens: output,
                    },
                    tool_calls: Vec::new(),
                    latency_ms: 5,
                    model,
                }),
                Some(Reply::Error(e)) => Err(e),
                Some(Reply::Hang) => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                None => Err(ProviderError::InvalidResponse("script exhausted".into())),
            }
        }
    }

    /// Fails the first `failures` calls with `error`, then echoes the input.
    struct FlakyApi {
        failures: usize,
        error: ToolError,
        calls: AtomicUsize,
    }

    impl FlakyApi {
        fn new(failures: usize, error: ToolError) -> Arc<Self> {
            Arc::new(Self {
                failures,
                error,
                calls: AtomicUsize::new(0),
            })
        }

        fn reliable() -> Arc<Self> {
            Self::new(0, ToolError::NotFound("unused".into()))
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ApiCaller for FlakyApi {
        async fn call(&self, request: ApiRequest) -> Result<agentpilot_core::api::ApiResponse, ToolError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(self.error.clone());
            }
            Ok(ApiResponse {
                body: request.input,
                latency_ms: 1,
            })
        }

        fn supports(&self, _operation: &str) -> bool {
            true
        }
    }

    /// Scores every step of a type the same.
    struct FixedAnalyzer(fn(StepType) -> f64);

    impl ComplexityAnalyzer for FixedAnalyzer {
        fn analyze(&self, profile: &StepProfile) -> ComplexityAssessment {
            ComplexityAssessment::fixed((self.0)(profile.step_type.unwrap_or(StepType::Transform)))
        }
    }

    struct Harness {
        executor: StepExecutor,
        memory: Arc<InMemoryMemoryStore>,
        store: Arc<InMemoryExecutionStore>,
        telemetry: Arc<TelemetryEngine>,
    }

    fn harness(config: EngineConfig, provider: Arc<dyn Provider>, api: Arc<dyn ApiCaller>) -> Harness {
        let memory = Arc::new(InMemoryMemoryStore::new());
        let store = Arc::new(InMemoryExecutionStore::new());
        let telemetry = Arc::new(TelemetryEngine::new());
        let collab = Collaborators::new(provider, api, memory.clone(), store.clone())
            .with_telemetry(telemetry.clone())
            .with_analyzer(Arc::new(FixedAnalyzer(|_| 1.0)));
        Harness {
            executor: StepExecutor::new(&config, &collab),
            memory,
            store,
            telemetry,
        }
    }

    async fn run(h: &Harness, workflow: &Workflow, input: Value) -> (ExecutionOutcome, ExecutionRecord) {
        let mut record = ExecutionRecord::start(ExecutionId::new(), &workflow.id, &workflow.agent_id);
        h.telemetry.start_trace(record.id.as_str(), &workflow.id);
        let outcome = h.executor.execute(workflow, input, &mut record, &CancellationToken::new()).await;
        (outcome, record)
    }

    fn workflow(steps: Value) -> Workflow {
        Workflow::from_json_str(&json!({"id": "wf", "agent_id": "agent-1", "agent_score": 2.0, "steps": steps}).to_string())
            .unwrap()
    }

    fn fast_retry_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.guardrails.retry_base_delay_ms = 10;
        config
    }

    // ── Tests ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn llm_reply_is_parsed_and_mapped() {
        let provider = ScriptedProvider::new(vec![Reply::Text("```json\n{\"category\": \"invoice\"}\n```", 40, 8)]);
        let h = harness(EngineConfig::default(), provider.clone(), FlakyApi::reliable());
        let wf = workflow(json!([
            {"type": "llm_decision", "prompt": "Classify: {{subject}}", "inputs": {"subject": "input.subject"},
             "outputs": {"category": "category"}}
        ]));

        let (outcome, record) = run(&h, &wf, json!({"subject": "Invoice #4"})).await;
        assert!(outcome.halt.is_none());
        assert_eq!(outcome.context.output(0), Some(&json!({"category": "invoice"})));
        assert_eq!(outcome.usage.total(), 48);
        assert_eq!(record.steps_executed, 1);
        assert_eq!(record.input_tokens, 40);

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests[0].messages.last().unwrap().content, "Classify: Invoice #4");
        assert_eq!(requests[0].model, "gpt-4o-mini");
    }

    #[test]
    fn plain_text_reply_becomes_content() {
        assert_eq!(parse_reply("just words"), json!({"content": "just words"}));
        assert_eq!(parse_reply("[1, 2]"), json!({"content": "[1, 2]"}));
        assert_eq!(parse_reply(" {\"a\": 1} "), json!({"a": 1}));
    }

    #[test]
    fn preview_resolves_what_is_known_up_front() {
        let wf = workflow(json!([
            {"type": "api_call", "operation": "echo", "inputs": {"a": {"value": 1}}},
            {"type": "llm_decision", "prompt": "Summarise {{body}}",
             "inputs": {"body": "input.body", "prior": "step_0.output.a",
                        "tone": {"from": "input.tone", "required": false, "default": "neutral"}}}
        ]));
        let ctx = ExecutionContext::new(json!({"body": "hello"}), 2);
        let inputs = preview_inputs(&wf.steps[1], &ctx);
        assert_eq!(inputs, json!({"body": "hello", "tone": "neutral"}));

        let profile = step_profile(&wf.steps[1], inputs);
        assert_eq!(profile.step_type, Some(StepType::LlmDecision));
        assert_eq!(profile.consumed_steps, 1);
        assert_eq!(profile.text, "Summarise {{body}}");
    }

    #[test]
    fn render_accepts_both_placeholder_spacings() {
        let inputs = json!({"name": "Ada", "n": 3});
        assert_eq!(render("Hi {{name}}, {{ n }} left", &inputs), "Hi Ada, 3 left");
    }

    #[tokio::test]
    async fn branch_skips_steps_it_jumps_over() {
        let h = harness(EngineConfig::default(), ScriptedProvider::new(vec![]), FlakyApi::reliable());
        let wf = workflow(json!([
            {"type": "conditional", "condition": "input.amount > 100", "on_true": 3, "on_false": 1},
            {"type": "api_call", "operation": "echo", "inputs": {"a": {"value": 1}}},
            {"type": "api_call", "operation": "log", "inputs": {"b": {"value": 2}}},
            {"type": "api_call", "operation": "echo", "inputs": {"c": {"value": 3}}}
        ]));

        let (outcome, _) = run(&h, &wf, json!({"amount": 500})).await;
        assert!(outcome.halt.is_none());
        assert_eq!(outcome.steps_executed, 2);
        assert_eq!(outcome.steps_skipped, 2);
        assert_eq!(outcome.context.output(0), Some(&json!({"result": true})));
        assert!(outcome.context.output(1).is_none());

        let (outcome, _) = run(&h, &wf, json!({"amount": 5})).await;
        assert_eq!(outcome.steps_executed, 4);
        assert_eq!(outcome.steps_skipped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_backoff() {
        let api = FlakyApi::new(2, ToolError::Status { operation: "crm".into(), status: 503 });
        let h = harness(fast_retry_config(), ScriptedProvider::new(vec![]), api.clone());
        let wf = workflow(json!([{"type": "api_call", "operation": "crm.lookup", "inputs": {"id": {"value": 7}}}]));

        let (outcome, record) = run(&h, &wf, json!({})).await;
        assert!(outcome.halt.is_none());
        assert_eq!(api.calls(), 3);
        assert_eq!(outcome.context.output(0), Some(&json!({"id": 7})));

        let trace = h.telemetry.get_trace(record.id.as_str()).unwrap();
        assert_eq!(trace.spans.len(), 3);
        assert_eq!(trace.spans.iter().filter(|s| s.success == Some(false)).count(), 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried_and_halts() {
        let api = FlakyApi::new(usize::MAX, ToolError::NotFound("crm.lookup".into()));
        let h = harness(EngineConfig::default(), ScriptedProvider::new(vec![]), api.clone());
        let wf = workflow(json!([
            {"type": "api_call", "operation": "crm.lookup"},
            {"type": "api_call", "operation": "echo"}
        ]));

        let (outcome, _) = run(&h, &wf, json!({})).await;
        assert_eq!(api.calls(), 1);
        assert!(matches!(outcome.halt, Some(WorkflowError::StepFailed { step: 0, .. })));
        assert_eq!(outcome.steps_failed, 1);
        assert_eq!(outcome.steps_executed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_attempts() {
        let api = FlakyApi::new(usize::MAX, ToolError::Timeout { operation: "crm".into(), timeout_secs: 1 });
        let h = harness(fast_retry_config(), ScriptedProvider::new(vec![]), api.clone());
        let wf = workflow(json!([{"type": "api_call", "operation": "crm.lookup", "retry_count": 2}]));

        let (outcome, _) = run(&h, &wf, json!({})).await;
        assert_eq!(api.calls(), 3);
        assert!(matches!(outcome.halt, Some(WorkflowError::TransientStep { step: 0, attempts: 3, .. })));
    }

    #[tokio::test]
    async fn continue_on_error_records_and_proceeds() {
        let mut config = EngineConfig::default();
        config.guardrails.continue_on_error = true;
        let api = FlakyApi::new(1, ToolError::NotFound("crm.lookup".into()));
        let h = harness(config, ScriptedProvider::new(vec![]), api);
        let wf = workflow(json!([
            {"type": "api_call", "operation": "crm.lookup"},
            {"type": "api_call", "operation": "echo", "inputs": {"x": {"value": 1}}}
        ]));

        let (outcome, record) = run(&h, &wf, json!({})).await;
        assert!(outcome.halt.is_none());
        assert_eq!(outcome.steps_failed, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(record.errors.len(), 1);
        assert_eq!(outcome.context.output(1), Some(&json!({"x": 1})));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_provider_errors_back_off_and_recover() {
        let provider = ScriptedProvider::new(vec![
            Reply::Error(ProviderError::Network("connection reset".into())),
            Reply::Error(ProviderError::ApiError {
                status_code: 503,
                message: "overloaded".into(),
            }),
            Reply::Text("{\"label\": \"ok\"}", 12, 4),
        ]);
        let h = harness(fast_retry_config(), provider.clone(), FlakyApi::reliable());
        let wf = workflow(json!([{"type": "llm_decision", "prompt": "Label it"}]));

        let started = Instant::now();
        let (outcome, record) = run(&h, &wf, json!({})).await;
        let waited = started.elapsed();

        assert!(outcome.halt.is_none());
        assert_eq!(provider.calls(), 3);
        assert_eq!(outcome.context.output(0), Some(&json!({"label": "ok"})));
        // 10ms then 20ms
        assert!(waited >= Duration::from_millis(30) && waited < Duration::from_millis(40), "{waited:?}");
        assert_eq!(outcome.usage.total(), 16);

        let trace = h.telemetry.get_trace(record.id.as_str()).unwrap();
        assert_eq!(trace.spans.iter().filter(|s| s.success == Some(false)).count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_provider_error_fails_on_first_attempt() {
        let provider = ScriptedProvider::new(vec![
            Reply::Error(ProviderError::AuthenticationFailed("bad key".into())),
            Reply::Text("{}", 1, 1),
        ]);
        let h = harness(fast_retry_config(), provider.clone(), FlakyApi::reliable());
        let wf = workflow(json!([{"type": "llm_decision", "prompt": "Label it"}]));

        let (outcome, _) = run(&h, &wf, json!({})).await;
        assert_eq!(provider.calls(), 1);
        match outcome.halt {
            Some(WorkflowError::StepFailed { step: 0, reason }) => assert!(reason.contains("Authentication failed")),
            other => panic!("unexpected halt: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_hint_stretches_the_backoff_up_to_the_cap() {
        let provider = ScriptedProvider::new(vec![
            Reply::Error(ProviderError::RateLimited { retry_after_secs: 2 }),
            Reply::Text("{}", 1, 1),
        ]);
        let h = harness(fast_retry_config(), provider.clone(), FlakyApi::reliable());
        let wf = workflow(json!([{"type": "llm_decision", "prompt": "Label it"}]));

        let started = Instant::now();
        let (outcome, _) = run(&h, &wf, json!({})).await;
        assert!(outcome.halt.is_none());
        assert_eq!(provider.calls(), 2);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_millis(2100), "{waited:?}");

        let mut config = fast_retry_config();
        config.guardrails.retry_max_delay_ms = 500;
        let provider = ScriptedProvider::new(vec![
            Reply::Error(ProviderError::RateLimited { retry_after_secs: 60 }),
            Reply::Text("{}", 1, 1),
        ]);
        let h = harness(config, provider.clone(), FlakyApi::reliable());

        let started = Instant::now();
        let (outcome, _) = run(&h, &wf, json!({})).await;
        assert!(outcome.halt.is_none());
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(500) && waited < Duration::from_millis(600), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_model_retries_count_once_toward_the_breaker() {
        let mut config = fast_retry_config();
        config.guardrails.continue_on_error = true;
        config.guardrails.circuit_breaker_threshold = 2;
        let network = || Reply::Error(ProviderError::Network("down".into()));
        let provider = ScriptedProvider::new((0..9).map(|_| network()).collect());
        let h = harness(config, provider.clone(), FlakyApi::reliable());
        let wf = workflow(json!([
            {"type": "llm_decision", "prompt": "first", "retry_count": 2},
            {"type": "llm_decision", "prompt": "second", "retry_count": 2},
            {"type": "llm_decision", "prompt": "third", "retry_count": 2}
        ]));

        let (outcome, _) = run(&h, &wf, json!({})).await;
        assert_eq!(outcome.halt, Some(WorkflowError::CircuitOpen { failures: 2 }));
        assert_eq!(provider.calls(), 6);
        assert_eq!(outcome.steps_failed, 2);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("step 0 failed after 3 attempt(s)"), "{:?}", outcome.errors);
    }

    #[tokio::test]
    async fn circuit_opens_after_consecutive_failed_steps() {
        let mut config = EngineConfig::default();
        config.guardrails.continue_on_error = true;
        config.guardrails.circuit_breaker_threshold = 2;
        let api = FlakyApi::new(usize::MAX, ToolError::NotFound("x".into()));
        let h = harness(config, ScriptedProvider::new(vec![]), api.clone());
        let wf = workflow(json!([
            {"type": "api_call", "operation": "a"},
            {"type": "api_call", "operation": "b"},
            {"type": "api_call", "operation": "c"}
        ]));

        let (outcome, _) = run(&h, &wf, json!({})).await;
        assert_eq!(outcome.halt, Some(WorkflowError::CircuitOpen { failures: 2 }));
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test]
    async fn identical_invocations_trip_loop_detection_on_the_fourth() {
        let api = FlakyApi::reliable();
        let h = harness(EngineConfig::default(), ScriptedProvider::new(vec![]), api.clone());
        let wf = workflow(json!([
            {"type": "api_call", "operation": "crm.lookup", "inputs": {"id": "input.id"}},
            {"type": "conditional", "condition": "true", "on_true": 0, "on_false": 2}
        ]));

        let (outcome, _) = run(&h, &wf, json!({"id": 42})).await;
        assert_eq!(
            outcome.halt,
            Some(WorkflowError::LoopDetected {
                step: 0,
                operation: "crm.lookup".into(),
                repeats: 4
            })
        );
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test]
    async fn max_steps_stops_runaway_branches() {
        let mut config = EngineConfig::default();
        config.guardrails.max_steps = 5;
        let h = harness(config, ScriptedProvider::new(vec![]), FlakyApi::reliable());
        let wf = workflow(json!([
            {"type": "conditional", "condition": "true", "on_true": 0, "on_false": 1}
        ]));

        let (outcome, _) = run(&h, &wf, json!({})).await;
        assert!(matches!(outcome.halt, Some(WorkflowError::LimitExceeded(ref m)) if m.contains("max steps")));
        assert_eq!(outcome.steps_executed, 5);
    }

    #[tokio::test]
    async fn missing_required_reference_fails_before_model_spend() {
        let provider = ScriptedProvider::new(vec![]);
        let h = harness(EngineConfig::default(), provider.clone(), FlakyApi::reliable());
        let wf = workflow(json!([
            {"type": "api_call", "operation": "echo", "inputs": {"a": {"value": 1}}},
            {"type": "llm_decision", "prompt": "Use {{x}}", "inputs": {"x": "step_0.output.missing"}}
        ]));

        let (outcome, _) = run(&h, &wf, json!({})).await;
        assert!(matches!(outcome.halt, Some(WorkflowError::Validation(ref m)) if m.contains("step_0.output.missing")));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn optional_reference_uses_default() {
        let h = harness(EngineConfig::default(), ScriptedProvider::new(vec![]), FlakyApi::reliable());
        let wf = workflow(json!([
            {"type": "api_call", "operation": "echo",
             "inputs": {"tier": {"from": "input.tier", "required": false, "default": "basic"},
                        "note": {"from": "input.note", "required": false}}}
        ]));
        let (outcome, _) = run(&h, &wf, json!({})).await;
        assert_eq!(outcome.context.output(0), Some(&json!({"tier": "basic"})));
    }

    #[tokio::test]
    async fn budget_pre_check_refuses_oversized_prompt() {
        let provider = ScriptedProvider::new(vec![]);
        let h = harness(EngineConfig::default(), provider.clone(), FlakyApi::reliable());
        let long_prompt = "word ".repeat(200);
        let wf = workflow(json!([
            {"type": "api_call", "operation": "echo"},
            {"type": "llm_decision", "prompt": long_prompt, "max_tokens": 100},
            {"type": "api_call", "operation": "log"}
        ]));

        let (outcome, _) = run(&h, &wf, json!({})).await;
        assert!(matches!(outcome.halt, Some(WorkflowError::LimitExceeded(_))));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn budget_post_check_catches_overspend() {
        let provider = ScriptedProvider::new(vec![Reply::Text("{}", 3000, 2000)]);
        let h = harness(EngineConfig::default(), provider, FlakyApi::reliable());
        let wf = workflow(json!([
            {"type": "api_call", "operation": "echo"},
            {"type": "transform", "instruction": "reshape"},
            {"type": "api_call", "operation": "log"}
        ]));

        let (outcome, record) = run(&h, &wf, json!({})).await;
        assert!(matches!(outcome.halt, Some(WorkflowError::LimitExceeded(_))));
        assert_eq!(record.total_tokens(), 5000);
    }

    #[tokio::test]
    async fn model_step_retries_when_mapped_field_is_missing() {
        let provider = ScriptedProvider::new(vec![Reply::Text("{}", 10, 2), Reply::Text("{\"label\": \"ok\"}", 10, 3)]);
        let h = harness(fast_retry_config(), provider.clone(), FlakyApi::reliable());
        let wf = workflow(json!([
            {"type": "llm_decision", "prompt": "Label it", "outputs": {"label": "label"}}
        ]));

        let (outcome, _) = run(&h, &wf, json!({})).await;
        assert!(outcome.halt.is_none());
        assert_eq!(provider.calls(), 2);
        assert_eq!(outcome.usage.total(), 25);
    }

    #[tokio::test(start_paused = true)]
    async fn step_timeout_counts_as_transient() {
        let mut config = EngineConfig::default();
        config.guardrails.retry_enabled = false;
        config.guardrails.step_timeout_secs = 1;
        let provider = ScriptedProvider::new(vec![Reply::Hang]);
        let h = harness(config, provider, FlakyApi::reliable());
        let wf = workflow(json!([{"type": "llm_decision", "prompt": "slow"}]));

        let (outcome, _) = run(&h, &wf, json!({})).await;
        match outcome.halt {
            Some(WorkflowError::TransientStep { attempts: 1, reason, .. }) => assert!(reason.contains("timed out")),
            other => panic!("expected transient timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_reaches_in_flight_invocation() {
        let provider = ScriptedProvider::new(vec![Reply::Hang]);
        let h = harness(EngineConfig::default(), provider, FlakyApi::reliable());
        let wf = workflow(json!([{"type": "llm_decision", "prompt": "slow"}]));

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let mut record = ExecutionRecord::start(ExecutionId::new(), "wf", "agent-1");
        let outcome = h.executor.execute(&wf, json!({}), &mut record, &token).await;
        assert!(matches!(outcome.halt, Some(WorkflowError::Cancelled(_))));
        assert_eq!(record.status, ExecutionStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn run_deadline_interrupts_a_slow_step() {
        let mut config = EngineConfig::default();
        config.guardrails.max_execution_time_secs = 2;
        config.guardrails.step_timeout_secs = 60;
        let h = harness(config, ScriptedProvider::new(vec![Reply::Hang]), FlakyApi::reliable());
        let wf = workflow(json!([{"type": "llm_decision", "prompt": "slow"}]));

        let (outcome, _) = run(&h, &wf, json!({})).await;
        assert!(matches!(outcome.halt, Some(WorkflowError::LimitExceeded(ref m)) if m.contains("execution time")));
    }

    #[tokio::test]
    async fn unrepresentable_deadline_means_no_deadline() {
        let mut config = EngineConfig::default();
        config.guardrails.max_execution_time_secs = u64::MAX;
        config.guardrails.step_timeout_secs = u64::MAX;
        let h = harness(config, ScriptedProvider::new(vec![]), FlakyApi::reliable());
        let wf = workflow(json!([{"type": "api_call", "operation": "echo", "inputs": {"a": {"value": 1}}}]));

        let (outcome, _) = run(&h, &wf, json!({})).await;
        assert!(outcome.halt.is_none());
        assert_eq!(outcome.context.output(0), Some(&json!({"a": 1})));
        assert!(deadline_after(u64::MAX) > Instant::now());
    }

    #[tokio::test]
    async fn parallel_group_outputs_land_in_their_own_slots() {
        let mut config = EngineConfig::default();
        config.guardrails.max_parallel_steps = 2;
        let api = FlakyApi::reliable();
        let h = harness(config, ScriptedProvider::new(vec![]), api.clone());
        let wf = workflow(json!([
            {"type": "api_call", "operation": "echo", "parallel_group": "fetch", "inputs": {"a": {"value": 1}}},
            {"type": "api_call", "operation": "echo", "parallel_group": "fetch", "inputs": {"b": {"value": 2}}},
            {"type": "api_call", "operation": "log", "inputs": {"first": "step_0.output.a", "second": "step_1.output.b"}}
        ]));

        let (outcome, _) = run(&h, &wf, json!({})).await;
        assert!(outcome.halt.is_none());
        assert_eq!(api.calls(), 3);
        assert_eq!(outcome.context.output(2), Some(&json!({"first": 1, "second": 2})));
        let indices: Vec<usize> = outcome.decisions.iter().map(|d| d.step_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn outcomes_feed_learning_and_routing_history() {
        let h = harness(EngineConfig::default(), ScriptedProvider::new(vec![]), FlakyApi::reliable());
        let wf = workflow(json!([{"type": "api_call", "operation": "echo"}]));

        let (outcome, record) = run(&h, &wf, json!({})).await;
        assert_eq!(outcome.decisions[0].tier, Tier::Fast);

        let entry = h
            .memory
            .get(&MemoryKey::routing_pattern("agent-1", "api_call"))
            .await
            .unwrap()
            .unwrap();
        let pattern = RoutingPattern::from_entry(&entry).unwrap();
        assert_eq!(pattern.execution_count, 1);
        assert_eq!(pattern.tier, Some(Tier::Fast));

        let history = h.store.routing_history(&record.id).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn tool_calls_are_exposed_in_the_raw_result() {
        struct ToolCallingProvider;

        #[async_trait]
        impl Provider for ToolCallingProvider {
            fn name(&self) -> &str {
                "tools"
            }

            async fn invoke(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
                assert_eq!(request.tools.len(), 1);
                Ok(ProviderResponse {
                    content: "{\"decision\": \"lookup\"}".into(),
                    usage: Usage::default(),
                    tool_calls: vec![MessageToolCall {
                        id: "call_1".into(),
                        name: "crm_lookup".into(),
                        arguments: "{\"id\": 42}".into(),
                    }],
                    latency_ms: 1,
                    model: request.model,
                })
            }
        }

        let h = harness(EngineConfig::default(), Arc::new(ToolCallingProvider), FlakyApi::reliable());
        let wf = workflow(json!([{
            "type": "llm_decision", "prompt": "Decide",
            "tools": [{"name": "crm_lookup", "description": "Find a customer"}],
            "outputs": {"tool": "tool_calls.0.name", "id": "tool_calls.0.arguments.id"}
        }]));

        let (outcome, _) = run(&h, &wf, json!({})).await;
        assert_eq!(outcome.context.output(0), Some(&json!({"tool": "crm_lookup", "id": 42})));
    }

    #[tokio::test]
    async fn condition_errors_are_step_failures() {
        let mut config = fast_retry_config();
        config.guardrails.retry_enabled = false;
        let h = harness(config, ScriptedProvider::new(vec![]), FlakyApi::reliable());
        let wf = workflow(json!([
            {"type": "conditional", "condition": "input.missing > 3", "on_true": 1, "on_false": 1}
        ]));

        let (outcome, _) = run(&h, &wf, json!({})).await;
        match outcome.halt {
            Some(WorkflowError::TransientStep { reason, .. }) => assert!(reason.contains("type mismatch")),
            other => panic!("expected condition failure, got {other:?}"),
        }
    }
}
