//! Execution plans
//!
//! A plan is a DAG of tool invocations. Plans are produced externally and
//! frozen once an execution transitions into `Planned`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A single node in the plan DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Step identifier, unique within the plan
    pub id: String,
    /// Tool to invoke
    pub tool: String,
    /// Tool parameters; strings of the form `$stepId.path` are references
    #[serde(default)]
    pub params: Value,
    /// Step ids this step depends on
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Logical output keys this step writes; used for conflict batching
    #[serde(default)]
    pub writes: Vec<String>,
    /// Latency estimate used by the yield predicate
    #[serde(default)]
    pub estimated_latency_ms: Option<u64>,
    /// Intent this step serves, consumed by the failover policy
    #[serde(default)]
    pub intent: Option<String>,
}

impl PlanStep {
    /// Create a step with no dependencies
    pub fn new(id: impl Into<String>, tool: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            params,
            depends_on: Vec::new(),
            writes: Vec::new(),
            estimated_latency_ms: None,
            intent: None,
        }
    }

    /// Add a dependency on another step
    pub fn after(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    /// Declare a logical output key this step writes
    pub fn writing(mut self, key: impl Into<String>) -> Self {
        self.writes.push(key.into());
        self
    }

    /// Set the latency estimate
    pub fn estimated_ms(mut self, ms: u64) -> Self {
        self.estimated_latency_ms = Some(ms);
        self
    }

    /// Set the intent
    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }
}

/// An execution plan: an ordered list of steps forming a DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Steps in plan order; order is the deterministic tie-break
    pub steps: Vec<PlanStep>,
}

impl Plan {
    /// Create a plan from steps
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan has no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Look up a step by id
    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Position of a step in plan order
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Step ids in plan order
    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }
}

/// Resolve `$stepId.path.subpath` references in `params` against completed
/// step outputs. Unresolved references pass through unchanged.
pub fn resolve_references(params: &Value, outputs: &HashMap<String, Value>) -> Value {
    match params {
        Value::String(s) => resolve_string(s, outputs),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| resolve_references(v, outputs)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_references(v, outputs)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(s: &str, outputs: &HashMap<String, Value>) -> Value {
    let Some(reference) = s.strip_prefix('$') else {
        return Value::String(s.to_string());
    };
    let mut parts = reference.split('.');
    let Some(step_id) = parts.next() else {
        return Value::String(s.to_string());
    };
    let Some(output) = outputs.get(step_id) else {
        return Value::String(s.to_string());
    };
    let mut current = output;
    for part in parts {
        match current.get(part) {
            Some(next) => current = next,
            None => return Value::String(s.to_string()),
        }
    }
    current.clone()
}
