//! Dependency resolution
//!
//! Turns a plan DAG into an ordered sequence of batches. Layers come from
//! Kahn's algorithm; inside a layer, steps whose declared output keys
//! intersect are serialised into single-step batches while the rest run in
//! parallel. Ties break on plan order so batching is reproducible.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::{EngineError, EngineResult};
use crate::plan::Plan;

/// A group of steps that may start together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    /// Step ids in plan order
    pub step_ids: Vec<String>,
    /// Whether the steps may run concurrently
    pub parallelizable: bool,
}

/// Aggregate plan metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSummary {
    /// Total steps
    pub step_count: usize,
    /// Total batches
    pub batch_count: usize,
    /// Σ over batches of the slowest step estimate
    pub estimated_latency_ms: u64,
}

/// Batched view of a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedPlan {
    /// Batches in execution order
    pub batches: Vec<Batch>,
    /// Forward dependency graph: step id → dependents
    pub dependents: HashMap<String, Vec<String>>,
    /// Aggregate metrics
    pub summary: PlanSummary,
}

/// Stateless batch builder
#[derive(Debug, Default, Clone, Copy)]
pub struct DependencyResolver {
    /// Estimate used for steps that declare none
    pub default_estimate_ms: u64,
}

impl DependencyResolver {
    /// Create a resolver with the given default step estimate
    pub fn new(default_estimate_ms: u64) -> Self {
        Self { default_estimate_ms }
    }

    /// Resolve a plan into batches, rejecting cycles and unknown deps
    pub fn resolve(&self, plan: &Plan) -> EngineResult<ResolvedPlan> {
        let ids: HashSet<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
        if ids.len() != plan.steps.len() {
            return Err(EngineError::PlanValidationFailed(
                "duplicate step ids".into(),
            ));
        }

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for step in &plan.steps {
            in_degree.entry(step.id.as_str()).or_insert(0);
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(EngineError::PlanValidationFailed(format!(
                        "step {} depends on unknown step {}",
                        step.id, dep
                    )));
                }
                *in_degree.entry(step.id.as_str()).or_insert(0) += 1;
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(step.id.clone());
            }
        }

        let mut emitted: HashSet<&str> = HashSet::new();
        let mut batches: Vec<Batch> = Vec::new();

        while emitted.len() < plan.steps.len() {
            // Kahn layer: every unemitted step whose in-degree reached zero,
            // in plan order.
            let layer: Vec<&str> = plan
                .steps
                .iter()
                .map(|s| s.id.as_str())
                .filter(|id| !emitted.contains(id) && in_degree[id] == 0)
                .collect();

            if layer.is_empty() {
                let stuck: Vec<&str> = plan
                    .steps
                    .iter()
                    .map(|s| s.id.as_str())
                    .filter(|id| !emitted.contains(id))
                    .collect();
                return Err(EngineError::CircularDependency(format!(
                    "steps {:?} form a cycle",
                    stuck
                )));
            }

            for batch in self.partition_layer(plan, &layer) {
                batches.push(batch);
            }

            for id in &layer {
                emitted.insert(id);
                if let Some(children) = dependents.get(*id) {
                    for child in children {
                        if let Some(degree) = in_degree.get_mut(child.as_str()) {
                            *degree -= 1;
                        }
                    }
                }
            }
        }

        let estimated_latency_ms = batches
            .iter()
            .map(|batch| {
                batch
                    .step_ids
                    .iter()
                    .map(|id| {
                        plan.step(id)
                            .and_then(|s| s.estimated_latency_ms)
                            .unwrap_or(self.default_estimate_ms)
                    })
                    .max()
                    .unwrap_or(0)
            })
            .sum();

        let summary = PlanSummary {
            step_count: plan.steps.len(),
            batch_count: batches.len(),
            estimated_latency_ms,
        };

        Ok(ResolvedPlan {
            batches,
            dependents,
            summary,
        })
    }

    /// Split one Kahn layer on write conflicts
    fn partition_layer(&self, plan: &Plan, layer: &[&str]) -> Vec<Batch> {
        let conflicted: HashSet<&str> = layer
            .iter()
            .filter(|id| {
                let Some(step) = plan.step(id) else {
                    return false;
                };
                layer.iter().any(|other| {
                    *other != **id
                        && plan.step(other).is_some_and(|o| {
                            o.writes.iter().any(|w| step.writes.contains(w))
                        })
                })
            })
            .copied()
            .collect();

        let mut batches = Vec::new();
        let parallel: Vec<String> = layer
            .iter()
            .filter(|id| !conflicted.contains(**id))
            .map(|id| id.to_string())
            .collect();
        if !parallel.is_empty() {
            let single = parallel.len() == 1;
            batches.push(Batch {
                step_ids: parallel,
                parallelizable: !single,
            });
        }
        for id in layer.iter().filter(|id| conflicted.contains(**id)) {
            batches.push(Batch {
                step_ids: vec![id.to_string()],
                parallelizable: false,
            });
        }
        batches
    }
}
