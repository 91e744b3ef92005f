//! Workflow definitions: loosely-typed JSON/TOML documents parsed into a
//! strongly-typed representation in one validation pass.
//!
//! Nothing about a workflow is checked lazily during execution except what
//! depends on runtime data (input presence, step outputs). A definition that
//! loads is structurally sound: every reference points at an existing step,
//! every expression parses, every branch target is in range, and parallel
//! groups are contiguous and free of intra-group data dependencies.

use agentpilot_core::provider::ToolDefinition;
use agentpilot_core::routing::StepType;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::Path;

use crate::error::WorkflowError;
use crate::expression::{self, Expr};
use crate::schema::{OutputSchema, RawSchema};

// ── References ──────────────────────────────────────────────────────────────

/// A path into the invocation input or a prior step's outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueRef {
    /// `input` or `input.a.b`
    Input(Vec<String>),
    /// `step_3.output` or `step_3.output.field.sub`
    StepOutput { step: usize, path: Vec<String> },
}

impl ValueRef {
    pub fn parse(s: &str) -> Result<Self, String> {
        let segments: Vec<String> = s.split('.').map(String::from).collect();
        if segments.iter().any(String::is_empty) {
            return Err(format!("malformed reference '{s}'"));
        }
        Self::from_segments(&segments)
    }

    pub fn from_segments(segments: &[String]) -> Result<Self, String> {
        let Some((head, rest)) = segments.split_first() else {
            return Err("empty reference".into());
        };
        if head == "input" {
            return Ok(Self::Input(rest.to_vec()));
        }
        let step = head
            .strip_prefix("step_")
            .and_then(|n| n.parse::<usize>().ok())
            .ok_or_else(|| format!("reference '{}' must start with 'input' or 'step_<n>'", segments.join(".")))?;
        match rest.split_first() {
            Some((output, path)) if output == "output" => Ok(Self::StepOutput {
                step,
                path: path.to_vec(),
            }),
            _ => Err(format!(
                "step reference '{}' must continue with '.output'",
                segments.join(".")
            )),
        }
    }

    /// The step this reference reads from, if any.
    pub fn step(&self) -> Option<usize> {
        match self {
            Self::Input(_) => None,
            Self::StepOutput { step, .. } => Some(*step),
        }
    }
}

impl fmt::Display for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input(path) if path.is_empty() => f.write_str("input"),
            Self::Input(path) => write!(f, "input.{}", path.join(".")),
            Self::StepOutput { step, path } if path.is_empty() => write!(f, "step_{step}.output"),
            Self::StepOutput { step, path } => write!(f, "step_{step}.output.{}", path.join(".")),
        }
    }
}

/// How one named step input is obtained.
#[derive(Debug, Clone, PartialEq)]
pub enum InputBinding {
    Reference {
        source: ValueRef,
        required: bool,
        default: Option<Value>,
    },
    Literal(Value),
}

// ── Typed model ─────────────────────────────────────────────────────────────

/// The closed set of step behaviours.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    LlmDecision {
        prompt: String,
        system: Option<String>,
        tools: Vec<ToolDefinition>,
    },
    Transform {
        instruction: String,
    },
    Conditional {
        expr: Expr,
        source: String,
        on_true: usize,
        on_false: usize,
    },
    ApiCall,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub index: usize,
    pub name: String,
    pub operation: String,
    pub kind: StepKind,
    pub inputs: Vec<(String, InputBinding)>,
    /// Output field → dotted path into the raw result
    pub outputs: Vec<(String, Vec<String>)>,
    pub critical: bool,
    pub error_handler: bool,
    pub parallel_group: Option<String>,
    pub retry_count: Option<u32>,
    pub max_tokens: Option<u64>,
    pub reasoning_depth: Option<u32>,
}

impl Step {
    pub fn step_type(&self) -> StepType {
        match self.kind {
            StepKind::LlmDecision { .. } => StepType::LlmDecision,
            StepKind::Transform { .. } => StepType::Transform,
            StepKind::Conditional { .. } => StepType::Conditional,
            StepKind::ApiCall => StepType::ApiCall,
        }
    }

    /// Prompt, instruction or expression text; empty for API calls.
    pub fn text(&self) -> &str {
        match &self.kind {
            StepKind::LlmDecision { prompt, .. } => prompt,
            StepKind::Transform { instruction } => instruction,
            StepKind::Conditional { source, .. } => source,
            StepKind::ApiCall => "",
        }
    }

    pub fn tool_count(&self) -> usize {
        match &self.kind {
            StepKind::LlmDecision { tools, .. } => tools.len(),
            _ => 0,
        }
    }

    /// Distinct steps whose outputs this step reads.
    pub fn consumed_steps(&self) -> BTreeSet<usize> {
        let mut steps: BTreeSet<usize> = self
            .inputs
            .iter()
            .filter_map(|(_, binding)| match binding {
                InputBinding::Reference { source, .. } => source.step(),
                InputBinding::Literal(_) => None,
            })
            .collect();
        if let StepKind::Conditional { expr, .. } = &self.kind {
            steps.extend(
                expr.paths()
                    .into_iter()
                    .filter_map(|p| ValueRef::from_segments(p).ok()?.step()),
            );
        }
        steps
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub agent_id: String,
    /// Agent intensity score, 0 to 10
    pub agent_score: Option<f64>,
    /// Selects a per-intent total token budget
    pub intent: Option<String>,
    pub required_inputs: Vec<String>,
    pub steps: Vec<Step>,
    /// Result field → reference
    pub output: Vec<(String, ValueRef)>,
    pub output_schema: Option<OutputSchema>,
}

// ── Raw (serde) model ───────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawBinding {
    Path(String),
    From {
        from: String,
        #[serde(default = "default_true")]
        required: bool,
        #[serde(default)]
        default: Option<Value>,
    },
    Literal {
        value: Value,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct RawStep {
    #[serde(rename = "type")]
    step_type: StepType,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    inputs: BTreeMap<String, RawBinding>,
    #[serde(default)]
    outputs: BTreeMap<String, String>,

    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    tools: Vec<ToolDefinition>,
    #[serde(default)]
    instruction: Option<String>,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    on_true: Option<usize>,
    #[serde(default)]
    on_false: Option<usize>,

    #[serde(default)]
    critical: bool,
    #[serde(default)]
    error_handler: bool,
    #[serde(default)]
    parallel_group: Option<String>,
    #[serde(default)]
    retry_count: Option<u32>,
    #[serde(default)]
    max_tokens: Option<u64>,
    #[serde(default)]
    reasoning_depth: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawWorkflow {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    agent_score: Option<f64>,
    #[serde(default)]
    intent: Option<String>,
    #[serde(default)]
    required_inputs: Vec<String>,
    steps: Vec<RawStep>,
    #[serde(default)]
    output: BTreeMap<String, String>,
    #[serde(default)]
    output_schema: Option<RawSchema>,
}

// ── Loading ─────────────────────────────────────────────────────────────────

fn invalid(msg: impl Into<String>) -> WorkflowError {
    WorkflowError::Validation(msg.into())
}

impl Workflow {
    pub fn from_json_str(content: &str) -> Result<Self, WorkflowError> {
        let raw: RawWorkflow =
            serde_json::from_str(content).map_err(|e| invalid(format!("malformed workflow JSON: {e}")))?;
        Self::from_raw(raw)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, WorkflowError> {
        let raw: RawWorkflow = toml::from_str(content).map_err(|e| invalid(format!("malformed workflow TOML: {e}")))?;
        Self::from_raw(raw)
    }

    /// Load from a file; `.toml` files are TOML, everything else JSON.
    pub fn load(path: &Path) -> Result<Self, WorkflowError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("cannot read workflow {}: {e}", path.display())))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            _ => Self::from_json_str(&content),
        }
    }

    fn from_raw(raw: RawWorkflow) -> Result<Self, WorkflowError> {
        if raw.id.trim().is_empty() {
            return Err(invalid("workflow id must not be empty"));
        }
        if raw.steps.is_empty() {
            return Err(invalid(format!("workflow '{}' has no steps", raw.id)));
        }
        if let Some(score) = raw.agent_score
            && !(0.0..=10.0).contains(&score)
        {
            return Err(invalid(format!("agent_score {score} is outside 0..=10")));
        }

        let step_count = raw.steps.len();
        let steps = raw
            .steps
            .into_iter()
            .enumerate()
            .map(|(index, step)| build_step(index, step, step_count))
            .collect::<Result<Vec<_>, _>>()?;

        check_parallel_groups(&steps)?;

        let output = raw
            .output
            .into_iter()
            .map(|(field, path)| {
                let reference = ValueRef::parse(&path).map_err(|e| invalid(format!("output '{field}': {e}")))?;
                if let Some(step) = reference.step()
                    && step >= step_count
                {
                    return Err(invalid(format!("output '{field}' references missing step {step}")));
                }
                Ok((field, reference))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let output_schema = raw
            .output_schema
            .map(OutputSchema::from_raw)
            .transpose()
            .map_err(|e| invalid(format!("output_schema: {e}")))?;

        Ok(Self {
            name: raw.name.unwrap_or_else(|| raw.id.clone()),
            agent_id: raw.agent_id.unwrap_or_else(|| raw.id.clone()),
            id: raw.id,
            description: raw.description,
            agent_score: raw.agent_score,
            intent: raw.intent,
            required_inputs: raw.required_inputs,
            steps,
            output,
            output_schema,
        })
    }

    /// Check an invocation input before anything runs: declared required
    /// inputs and required `input.*` references must be present.
    pub fn check_input(&self, input: &Value) -> Result<(), WorkflowError> {
        if !input.is_object() {
            return Err(invalid("invocation input must be a JSON object"));
        }
        for name in &self.required_inputs {
            if input.get(name).is_none_or(Value::is_null) {
                return Err(invalid(format!("missing required input '{name}'")));
            }
        }
        for step in &self.steps {
            for (name, binding) in &step.inputs {
                if let InputBinding::Reference {
                    source: ValueRef::Input(path),
                    required: true,
                    default: None,
                } = binding
                    && crate::context::navigate(input, path).is_none()
                {
                    return Err(invalid(format!(
                        "step {} ('{}') input '{name}' requires input.{}",
                        step.index,
                        step.name,
                        path.join(".")
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

fn build_step(index: usize, raw: RawStep, step_count: usize) -> Result<Step, WorkflowError> {
    let name = raw.name.unwrap_or_else(|| format!("step_{index}"));
    let fail = |msg: String| invalid(format!("step {index} ('{name}'): {msg}"));

    let check_step_ref = |reference: &ValueRef| -> Result<(), String> {
        match reference.step() {
            Some(s) if s == index => Err(format!("'{reference}' references the step itself")),
            Some(s) if s >= step_count => Err(format!("'{reference}' references missing step {s}")),
            _ => Ok(()),
        }
    };

    let mut inputs = Vec::with_capacity(raw.inputs.len());
    for (input_name, binding) in raw.inputs {
        let binding = match binding {
            RawBinding::Path(path) => InputBinding::Reference {
                source: ValueRef::parse(&path).map_err(&fail)?,
                required: true,
                default: None,
            },
            RawBinding::From { from, required, default } => InputBinding::Reference {
                source: ValueRef::parse(&from).map_err(&fail)?,
                required,
                default,
            },
            RawBinding::Literal { value } => InputBinding::Literal(value),
        };
        if let InputBinding::Reference { source, .. } = &binding {
            check_step_ref(source).map_err(&fail)?;
        }
        inputs.push((input_name, binding));
    }

    let outputs = raw
        .outputs
        .into_iter()
        .map(|(field, path)| {
            let segments: Vec<String> = path.split('.').map(String::from).collect();
            if segments.iter().any(String::is_empty) {
                return Err(fail(format!("output '{field}' has malformed path '{path}'")));
            }
            Ok((field, segments))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let non_empty = |value: Option<String>, field: &str| -> Result<String, WorkflowError> {
        value
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| fail(format!("{} steps require '{field}'", raw.step_type)))
    };

    let kind = match raw.step_type {
        StepType::LlmDecision => StepKind::LlmDecision {
            prompt: non_empty(raw.prompt, "prompt")?,
            system: raw.system,
            tools: raw.tools,
        },
        StepType::Transform => StepKind::Transform {
            instruction: non_empty(raw.instruction, "instruction")?,
        },
        StepType::Conditional => {
            let source = non_empty(raw.condition, "condition")?;
            let expr = expression::parse(&source).map_err(|e| fail(format!("condition: {e}")))?;
            let local: HashSet<&str> = inputs.iter().map(|(n, _)| n.as_str()).collect();
            for path in expr.paths() {
                if local.contains(path[0].as_str()) {
                    continue;
                }
                let reference = ValueRef::from_segments(path).map_err(|e| fail(format!("condition: {e}")))?;
                check_step_ref(&reference).map_err(|e| fail(format!("condition: {e}")))?;
            }
            let (Some(on_true), Some(on_false)) = (raw.on_true, raw.on_false) else {
                return Err(fail("conditional steps require 'on_true' and 'on_false'".into()));
            };
            for target in [on_true, on_false] {
                if target > step_count {
                    return Err(fail(format!("branch target {target} is outside 0..={step_count}")));
                }
            }
            StepKind::Conditional {
                expr,
                source,
                on_true,
                on_false,
            }
        }
        StepType::ApiCall => {
            if raw.operation.as_deref().is_none_or(|op| op.trim().is_empty()) {
                return Err(fail("api_call steps require 'operation'".into()));
            }
            StepKind::ApiCall
        }
    };

    if raw.max_tokens == Some(0) {
        return Err(fail("max_tokens must be > 0".into()));
    }

    Ok(Step {
        index,
        operation: raw.operation.unwrap_or_else(|| raw.step_type.as_str().to_string()),
        name,
        kind,
        inputs,
        outputs,
        critical: raw.critical,
        error_handler: raw.error_handler,
        parallel_group: raw.parallel_group,
        retry_count: raw.retry_count,
        max_tokens: raw.max_tokens,
        reasoning_depth: raw.reasoning_depth,
    })
}

/// Groups must be contiguous, contain no conditionals, and no member may
/// read another member's output.
fn check_parallel_groups(steps: &[Step]) -> Result<(), WorkflowError> {
    let mut closed: HashSet<&str> = HashSet::new();
    let mut current: Option<(&str, Vec<usize>)> = None;

    for step in steps {
        let group = step.parallel_group.as_deref();
        if let (Some((name, members)), Some(g)) = (current.as_mut(), group)
            && *name == g
        {
            members.push(step.index);
            continue;
        }
        if let Some((name, members)) = current.take() {
            check_group(steps, name, &members)?;
            closed.insert(name);
        }
        if let Some(g) = group {
            if closed.contains(g) {
                return Err(invalid(format!("parallel group '{g}' is not contiguous")));
            }
            current = Some((g, vec![step.index]));
        }
    }
    match current {
        Some((name, members)) => check_group(steps, name, &members),
        None => Ok(()),
    }
}

fn check_group(steps: &[Step], name: &str, members: &[usize]) -> Result<(), WorkflowError> {
    for &i in members {
        let step = &steps[i];
        if matches!(step.kind, StepKind::Conditional { .. }) {
            return Err(invalid(format!("parallel group '{name}' contains conditional step {i}")));
        }
        if let Some(dep) = step.consumed_steps().into_iter().find(|d| members.contains(d)) {
            return Err(invalid(format!(
                "parallel group '{name}': step {i} depends on step {dep} in the same group"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn triage() -> Value {
        json!({
            "id": "invoice-triage", "name": "Invoice triage", "agent_id": "agent-42",
            "agent_score": 4.0, "intent": "finance",
            "required_inputs": ["subject"],
            "steps": [
                {"type": "llm_decision", "name": "classify", "operation": "classify_email",
                 "prompt": "Classify: {{subject}}", "inputs": {"subject": "input.subject"},
                 "outputs": {"category": "category"}, "max_tokens": 256},
                {"type": "conditional", "name": "is_invoice", "operation": "branch",
                 "condition": "step_0.output.category == \"invoice\"", "on_true": 2, "on_false": 3},
                {"type": "api_call", "name": "forward", "operation": "email.send",
                 "inputs": {"to": "input.accounting_email"}, "outputs": {"sent": "sent"}}
            ],
            "output": {"sent": "step_2.output.sent"},
            "output_schema": {"required": ["sent"], "properties": {"sent": "boolean"}}
        })
    }

    fn load(value: Value) -> Result<Workflow, WorkflowError> {
        Workflow::from_json_str(&value.to_string())
    }

    fn with_steps(steps: Value) -> Value {
        let mut wf = triage();
        wf["steps"] = steps;
        wf["output"] = json!({});
        wf
    }

    #[test]
    fn loads_typed_workflow() {
        let wf = load(triage()).unwrap();
        assert_eq!(wf.agent_id, "agent-42");
        assert_eq!(wf.steps.len(), 3);
        assert_eq!(wf.steps[0].step_type(), StepType::LlmDecision);
        assert_eq!(wf.steps[0].max_tokens, Some(256));
        assert_eq!(wf.steps[1].step_type(), StepType::Conditional);
        assert_eq!(wf.steps[1].consumed_steps(), BTreeSet::from([0]));
        assert_eq!(wf.steps[2].operation, "email.send");
        assert_eq!(
            wf.output,
            vec![("sent".to_string(), ValueRef::StepOutput { step: 2, path: vec!["sent".into()] })]
        );
        assert!(wf.output_schema.is_some());
    }

    #[test]
    fn binding_forms() {
        let wf = load(with_steps(json!([
            {"type": "api_call", "operation": "echo", "inputs": {
                "a": "input.x.y",
                "b": {"from": "input.maybe", "required": false, "default": 3},
                "c": {"value": {"literal": true}}
            }}
        ])))
        .unwrap();
        let inputs = &wf.steps[0].inputs;
        assert_eq!(inputs[0].1, InputBinding::Reference {
            source: ValueRef::Input(vec!["x".into(), "y".into()]),
            required: true,
            default: None
        });
        assert_eq!(inputs[1].1, InputBinding::Reference {
            source: ValueRef::Input(vec!["maybe".into()]),
            required: false,
            default: Some(json!(3))
        });
        assert_eq!(inputs[2].1, InputBinding::Literal(json!({"literal": true})));
    }

    #[test]
    fn value_ref_round_trips_through_display() {
        for s in ["input", "input.a.b", "step_2.output", "step_10.output.items.0"] {
            assert_eq!(ValueRef::parse(s).unwrap().to_string(), s);
        }
        assert!(ValueRef::parse("step_x.output").is_err());
        assert!(ValueRef::parse("step_1.result").is_err());
        assert!(ValueRef::parse("secrets.key").is_err());
        assert!(ValueRef::parse("input..a").is_err());
    }

    #[test]
    fn rejects_empty_and_unknown_type() {
        assert!(load(with_steps(json!([]))).is_err());
        assert!(load(with_steps(json!([{"type": "shell", "operation": "rm"}]))).is_err());
    }

    #[test]
    fn rejects_self_and_missing_references() {
        let self_ref = with_steps(json!([
            {"type": "api_call", "operation": "echo", "inputs": {"a": "step_0.output.x"}}
        ]));
        assert!(load(self_ref).unwrap_err().to_string().contains("itself"));

        let missing = with_steps(json!([
            {"type": "api_call", "operation": "echo", "inputs": {"a": "step_5.output.x"}}
        ]));
        assert!(load(missing).unwrap_err().to_string().contains("missing step 5"));

        let mut bad_output = triage();
        bad_output["output"] = json!({"x": "step_7.output.y"});
        assert!(load(bad_output).is_err());
    }

    #[test]
    fn rejects_kind_specific_gaps() {
        assert!(load(with_steps(json!([{"type": "llm_decision"}]))).is_err());
        assert!(load(with_steps(json!([{"type": "transform", "instruction": " "}]))).is_err());
        assert!(load(with_steps(json!([{"type": "api_call"}]))).is_err());
        assert!(load(with_steps(json!([{"type": "conditional", "condition": "true", "on_true": 1}]))).is_err());
    }

    #[test]
    fn rejects_bad_conditions_and_targets() {
        let unparsable = with_steps(json!([
            {"type": "conditional", "condition": "a = 1", "on_true": 1, "on_false": 1}
        ]));
        assert!(load(unparsable).unwrap_err().to_string().contains("condition"));

        let out_of_range = with_steps(json!([
            {"type": "conditional", "condition": "input.a > 1", "on_true": 1, "on_false": 2}
        ]));
        assert!(load(out_of_range).unwrap_err().to_string().contains("branch target 2"));

        let unknown_ident = with_steps(json!([
            {"type": "conditional", "condition": "amount > 1", "on_true": 1, "on_false": 1}
        ]));
        assert!(load(unknown_ident).is_err());

        let local_ident = with_steps(json!([
            {"type": "conditional", "condition": "amount > 1", "on_true": 1, "on_false": 1,
             "inputs": {"amount": "input.amount"}}
        ]));
        assert!(load(local_ident).is_ok());
    }

    #[test]
    fn parallel_group_rules() {
        let ok = with_steps(json!([
            {"type": "api_call", "operation": "echo", "parallel_group": "fetch"},
            {"type": "api_call", "operation": "log", "parallel_group": "fetch"},
            {"type": "transform", "instruction": "merge", "inputs": {"a": "step_0.output", "b": "step_1.output"}}
        ]));
        assert!(load(ok).is_ok());

        let dependent = with_steps(json!([
            {"type": "api_call", "operation": "echo", "parallel_group": "g"},
            {"type": "api_call", "operation": "log", "parallel_group": "g", "inputs": {"a": "step_0.output"}}
        ]));
        assert!(load(dependent).unwrap_err().to_string().contains("same group"));

        let conditional = with_steps(json!([
            {"type": "api_call", "operation": "echo", "parallel_group": "g"},
            {"type": "conditional", "condition": "true", "on_true": 2, "on_false": 2, "parallel_group": "g"}
        ]));
        assert!(load(conditional).unwrap_err().to_string().contains("conditional"));

        let split = with_steps(json!([
            {"type": "api_call", "operation": "echo", "parallel_group": "g"},
            {"type": "api_call", "operation": "log"},
            {"type": "api_call", "operation": "echo", "parallel_group": "g"}
        ]));
        assert!(load(split).unwrap_err().to_string().contains("contiguous"));
    }

    #[test]
    fn schema_and_agent_score_are_validated() {
        let mut bad_schema = triage();
        bad_schema["output_schema"] = json!({"properties": {"sent": "bool"}});
        assert!(load(bad_schema).is_err());

        let mut bad_score = triage();
        bad_score["agent_score"] = json!(11.0);
        assert!(load(bad_score).is_err());
    }

    #[test]
    fn input_check_runs_before_execution() {
        let wf = load(triage()).unwrap();
        assert!(wf.check_input(&json!({"subject": "hi", "accounting_email": "ap@x.com"})).is_ok());
        assert!(wf.check_input(&json!({"accounting_email": "ap@x.com"})).is_err());
        let err = wf.check_input(&json!({"subject": "hi"})).unwrap_err();
        assert!(err.to_string().contains("input.accounting_email"));
        assert!(wf.check_input(&json!("not an object")).is_err());
    }

    #[test]
    fn loads_toml_definitions() {
        let toml = r#"
id = "digest"
agent_id = "agent-7"

[[steps]]
type = "api_call"
operation = "echo"
inputs = { text = "input.text" }

[[steps]]
type = "transform"
instruction = "Summarize the echoed text"
inputs = { echoed = "step_0.output.text" }
outputs = { summary = "summary" }

[output]
summary = "step_1.output.summary"
"#;
        let wf = Workflow::from_toml_str(toml).unwrap();
        assert_eq!(wf.steps.len(), 2);
        assert_eq!(wf.steps[1].consumed_steps(), BTreeSet::from([0]));
        assert_eq!(wf.name, "digest");
    }

    #[test]
    fn load_picks_format_from_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf.json");
        std::fs::write(&path, triage().to_string()).unwrap();
        assert_eq!(Workflow::load(&path).unwrap().id, "invoice-triage");
        assert!(Workflow::load(&dir.path().join("missing.json")).is_err());
    }
}
