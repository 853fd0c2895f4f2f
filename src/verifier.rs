//! Deterministic plan verification
//!
//! Runs exactly once, between planning and execution, with no external
//! calls. Everything here is a pure function of the plan and the reflected
//! tool registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::matcher::wildcard_match;
use crate::plan::Plan;
use crate::tool::ToolRegistry;

/// Extra numeric ceiling applied on top of tool schemas
#[derive(Debug, Clone)]
pub struct ParamLimit {
    /// Tool name pattern (`*` wildcard)
    pub tool_pattern: String,
    /// Parameter name
    pub param: String,
    /// Inclusive maximum
    pub max: f64,
}

/// Pure predicate over the whole plan
pub type PlanPredicate = dyn Fn(&Plan) -> EngineResult<()> + Send + Sync;

/// Policy gate for plans
pub struct PlanVerifier {
    registry: Arc<ToolRegistry>,
    forbidden_sequences: Vec<Vec<String>>,
    limits: Vec<ParamLimit>,
    predicates: Vec<Box<PlanPredicate>>,
}

impl PlanVerifier {
    /// Create a verifier over the reflected registry
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            forbidden_sequences: Vec::new(),
            limits: Vec::new(),
            predicates: Vec::new(),
        }
    }

    /// Forbid a sequence of tool-name patterns appearing as a directed path
    pub fn forbid_sequence(mut self, patterns: Vec<&str>) -> Self {
        self.forbidden_sequences
            .push(patterns.into_iter().map(String::from).collect());
        self
    }

    /// Add a numeric parameter ceiling
    pub fn limit(mut self, tool_pattern: &str, param: &str, max: f64) -> Self {
        self.limits.push(ParamLimit {
            tool_pattern: tool_pattern.to_string(),
            param: param.to_string(),
            max,
        });
        self
    }

    /// Add a custom pure predicate
    pub fn predicate<F>(mut self, check: F) -> Self
    where
        F: Fn(&Plan) -> EngineResult<()> + Send + Sync + 'static,
    {
        self.predicates.push(Box::new(check));
        self
    }

    /// Verify a plan; success is the precondition for execution
    pub fn verify(&self, plan: &Plan) -> EngineResult<()> {
        self.check_tools_known(plan)?;
        self.check_schemas(plan)?;
        self.check_limits(plan)?;
        self.check_forbidden_sequences(plan)?;
        for predicate in &self.predicates {
            predicate(plan)?;
        }
        Ok(())
    }

    fn check_tools_known(&self, plan: &Plan) -> EngineResult<()> {
        for step in &plan.steps {
            if !self.registry.contains(&step.tool) {
                return Err(EngineError::PlanValidationFailed(format!(
                    "step {} uses unknown tool {}",
                    step.id, step.tool
                )));
            }
        }
        Ok(())
    }

    fn check_schemas(&self, plan: &Plan) -> EngineResult<()> {
        for step in &plan.steps {
            let Some(descriptor) = self.registry.get(&step.tool) else {
                continue;
            };
            let Some(object) = step.params.as_object() else {
                return Err(EngineError::PlanValidationFailed(format!(
                    "step {}: params not an object",
                    step.id
                )));
            };
            // References resolve at run time; requiredness and reference
            // values are re-checked after resolution. Only literal values
            // can be type- and bound-checked here.
            for (name, spec) in &descriptor.schema.params {
                let Some(value) = object.get(name) else {
                    continue;
                };
                if is_reference(value) || value.is_null() {
                    continue;
                }
                if !spec.param_type.matches(value) {
                    return Err(EngineError::PlanValidationFailed(format!(
                        "step {}: parameter '{}' has wrong type",
                        step.id, name
                    )));
                }
                if let Some(n) = value.as_f64() {
                    if spec.min.is_some_and(|min| n < min) || spec.max.is_some_and(|max| n > max) {
                        return Err(EngineError::PlanValidationFailed(format!(
                            "step {}: parameter '{}' out of range",
                            step.id, name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_limits(&self, plan: &Plan) -> EngineResult<()> {
        for step in &plan.steps {
            for limit in &self.limits {
                if !wildcard_match(&limit.tool_pattern, &step.tool) {
                    continue;
                }
                if let Some(value) = step.params.get(&limit.param).and_then(|v| v.as_f64()) {
                    if value > limit.max {
                        return Err(EngineError::ParameterLimitExceeded(format!(
                            "{}.{} = {} exceeds limit {}",
                            step.tool, limit.param, value, limit.max
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_forbidden_sequences(&self, plan: &Plan) -> EngineResult<()> {
        if self.forbidden_sequences.is_empty() {
            return Ok(());
        }
        let descendants = descendant_closure(plan);
        for sequence in &self.forbidden_sequences {
            if let Some(path) = find_sequence(plan, &descendants, sequence) {
                return Err(EngineError::ForbiddenSequence(format!(
                    "{} matches forbidden sequence {:?}",
                    path.join(" -> "),
                    sequence
                )));
            }
        }
        Ok(())
    }
}

fn is_reference(value: &serde_json::Value) -> bool {
    value.as_str().is_some_and(|s| s.starts_with('$'))
}

/// step id → ids of all steps reachable through dependency edges
fn descendant_closure(plan: &Plan) -> HashMap<String, HashSet<String>> {
    let mut direct: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &plan.steps {
        for dep in &step.depends_on {
            direct.entry(dep.as_str()).or_default().push(step.id.as_str());
        }
    }

    let mut closure: HashMap<String, HashSet<String>> = HashMap::new();
    // Plan order is a reverse-topological hint but not a guarantee, so walk
    // each node's frontier explicitly.
    for step in &plan.steps {
        let mut reachable = HashSet::new();
        let mut frontier: Vec<&str> = direct.get(step.id.as_str()).cloned().unwrap_or_default();
        while let Some(id) = frontier.pop() {
            if reachable.insert(id.to_string()) {
                if let Some(children) = direct.get(id) {
                    frontier.extend(children.iter().copied());
                }
            }
        }
        closure.insert(step.id.clone(), reachable);
    }
    closure
}

/// Find a chain of steps whose tools match `patterns` in order, where each
/// next step is a descendant of the previous one
fn find_sequence(
    plan: &Plan,
    descendants: &HashMap<String, HashSet<String>>,
    patterns: &[String],
) -> Option<Vec<String>> {
    fn extend(
        plan: &Plan,
        descendants: &HashMap<String, HashSet<String>>,
        patterns: &[String],
        from: &str,
        path: &mut Vec<String>,
    ) -> bool {
        let Some(pattern) = patterns.first() else {
            return true;
        };
        let reachable = match descendants.get(from) {
            Some(set) => set,
            None => return false,
        };
        for step in &plan.steps {
            if reachable.contains(&step.id) && wildcard_match(pattern, &step.tool) {
                path.push(step.id.clone());
                if extend(plan, descendants, &patterns[1..], &step.id, path) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    let first = patterns.first()?;
    for step in &plan.steps {
        if wildcard_match(first, &step.tool) {
            let mut path = vec![step.id.clone()];
            if extend(plan, descendants, &patterns[1..], &step.id, &mut path) {
                return Some(path);
            }
        }
    }
    None
}
