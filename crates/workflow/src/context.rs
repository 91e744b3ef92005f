//! Execution Context: the per-run store of step outputs.
//!
//! Arena layout: one output slot per step index. A step only ever writes its
//! own slot, so steps of a parallel group can never race on the same key.
//! A step revisited through a branch replaces its own slot.

use serde_json::{Map, Value};

use crate::definition::ValueRef;

/// Walk a dotted path into a JSON value. Array elements are addressed by
/// numeric segments (`items.0`).
pub fn navigate<'a, S: AsRef<str>>(value: &'a Value, segments: &[S]) -> Option<&'a Value> {
    segments.iter().try_fold(value, |current, segment| {
        let segment = segment.as_ref();
        match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    })
}

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    input: Value,
    slots: Vec<Option<Value>>,
}

impl ExecutionContext {
    pub fn new(input: Value, step_count: usize) -> Self {
        Self {
            input,
            slots: vec![None; step_count],
        }
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Write a step's extracted outputs into its slot.
    pub fn store(&mut self, index: usize, outputs: Value) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Some(outputs);
        }
    }

    pub fn output(&self, index: usize) -> Option<&Value> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Dereference a workflow reference.
    pub fn resolve(&self, reference: &ValueRef) -> Option<&Value> {
        match reference {
            ValueRef::Input(path) => navigate(&self.input, path),
            ValueRef::StepOutput { step, path } => navigate(self.output(*step)?, path),
        }
    }

    /// Resolve an expression path: `input...` or `step_N.output...`.
    pub fn lookup(&self, segments: &[String]) -> Option<&Value> {
        let reference = ValueRef::from_segments(segments).ok()?;
        self.resolve(&reference)
    }

    /// Steps that have written their slot.
    pub fn filled_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Best-effort view of the context: `{"input": .., "steps": {"step_0": ..}}`.
    pub fn snapshot(&self) -> Value {
        let steps: Map<String, Value> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|v| (format!("step_{i}"), v.clone())))
            .collect();
        serde_json::json!({ "input": self.input, "steps": steps })
    }
}
