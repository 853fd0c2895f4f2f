//! Execution records
//!
//! The execution record is the single durable coordination point: one JSON
//! document per workflow, mutated only through version-checked writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::plan::Plan;

/// Unique identifier for an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    /// Generate a new execution ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from string
    pub fn parse_str(s: &str) -> EngineResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| EngineError::Serialization(format!("Invalid execution ID: {}", e)))
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Record exists, no plan yet
    Created,
    /// Plan frozen, not yet verified or running
    Planned,
    /// Segments are making forward progress
    Executing,
    /// Suspended behind a confirmation token
    AwaitingConfirmation,
    /// Suspended for an external reason (for example schema drift)
    Suspended,
    /// Saga unwind in progress
    Compensating,
    /// Saga unwind finished
    Compensated,
    /// All steps completed
    Completed,
    /// Terminal failure
    Failed,
    /// Abandoned by the platform deadline
    Timeout,
    /// Cancelled by the user
    Cancelled,
}

impl ExecutionStatus {
    /// Whether `self → to` is an edge of the fixed transition graph
    pub fn can_transition_to(self, to: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match self {
            Created => matches!(to, Planned | Cancelled | Failed),
            Planned => matches!(to, Executing | Cancelled | Failed),
            Executing => matches!(
                to,
                Executing
                    | AwaitingConfirmation
                    | Suspended
                    | Compensating
                    | Completed
                    | Failed
                    | Timeout
                    | Cancelled
            ),
            AwaitingConfirmation => matches!(to, Executing | Cancelled | Failed | Timeout),
            Suspended => matches!(to, Executing | Cancelled | Failed | Timeout),
            Compensating => matches!(to, Compensated | Failed),
            Compensated | Completed | Failed | Timeout | Cancelled => false,
        }
    }

    /// Whether the status is terminal
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Compensated
                | ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Timeout
                | ExecutionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Step lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting on dependencies or a segment slot
    Pending,
    /// Tool call in flight
    InProgress,
    /// Tool call succeeded
    Completed,
    /// Tool call failed terminally
    Failed,
    /// Undone by the saga runner
    Compensated,
    /// Short-circuited by the idempotency gate
    Skipped,
}

/// Persisted error detail for a failed step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    /// Stable machine code
    pub code: String,
    /// Raw message for diagnosis
    pub message: String,
}

impl StepError {
    /// Capture an engine error
    pub fn from_engine(err: &EngineError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Per-step execution state, mirroring the plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    /// Step id from the plan
    pub step_id: String,
    /// Current status
    pub status: StepStatus,
    /// Resolved input persisted before invocation
    #[serde(default)]
    pub input: Option<Value>,
    /// Tool output
    #[serde(default)]
    pub output: Option<Value>,
    /// Error detail if failed
    #[serde(default)]
    pub error: Option<StepError>,
    /// Times the step entered in_progress; monotonic
    #[serde(default)]
    pub attempts: u32,
    /// First in_progress timestamp
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal timestamp
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Tool call latency
    #[serde(default)]
    pub latency_ms: Option<u64>,
    /// Set when a human confirmed the step
    #[serde(default)]
    pub confirmed: bool,
    /// Set when a cancelled in-flight call must be re-issued on resume
    #[serde(default)]
    pub reissue_on_resume: bool,
}

impl StepState {
    /// Fresh pending state for a plan step
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            input: None,
            output: None,
            error: None,
            attempts: 0,
            started_at: None,
            completed_at: None,
            latency_ms: None,
            confirmed: false,
            reissue_on_resume: false,
        }
    }
}

/// Cumulative token usage across segments
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens
    pub input_tokens: u64,
    /// Completion tokens
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Add another usage sample
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Hard USD ceiling for correction calls
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Budget {
    /// Ceiling in USD
    pub cost_limit_usd: f64,
    /// Spend so far in USD
    pub current_cost_usd: f64,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            cost_limit_usd: 1.0,
            current_cost_usd: 0.0,
        }
    }
}

impl Budget {
    /// Check a projected spend against the ceiling
    pub fn check(&self, estimated_usd: f64) -> EngineResult<()> {
        if self.current_cost_usd + estimated_usd > self.cost_limit_usd {
            return Err(EngineError::BudgetExceeded {
                current: self.current_cost_usd,
                estimated: estimated_usd,
                limit: self.cost_limit_usd,
            });
        }
        Ok(())
    }
}

/// A compensation captured at the moment its forward step completed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredCompensation {
    /// Forward step id
    pub step_id: String,
    /// Compensating tool
    pub tool: String,
    /// Mapped parameters for the compensating call
    pub params: Value,
}

/// Saga unwind progress, tracked alongside the terminal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationStatus {
    /// Unwind in progress
    Compensating,
    /// All registered entries undone
    Compensated,
    /// At least one entry could not be undone
    PartiallyCompensated,
}

/// Why a segment yielded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum YieldReason {
    /// Platform deadline approaching
    TimeoutApproaching,
    /// Batch finished with work remaining
    SegmentComplete,
    /// Yield taken while recovering from an error
    ErrorRecovery,
    /// Yield taken around a saga unwind
    Compensation,
}

/// Checkpoint metadata written at each yield
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Index of the first step the next segment should consider
    pub next_step_index: usize,
    /// When the checkpoint was written
    pub checkpoint_at: DateTime<Utc>,
    /// Why the segment yielded
    pub reason: YieldReason,
}

/// The durable execution record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Unique id
    pub execution_id: ExecutionId,
    /// Lifecycle status
    pub status: ExecutionStatus,
    /// Frozen plan; immutable once status reaches Planned
    #[serde(default)]
    pub plan: Option<Plan>,
    /// Per-step state, index-aligned with the plan
    #[serde(default)]
    pub step_states: Vec<StepState>,
    /// Opaque context written through by the engine
    #[serde(default)]
    pub context: HashMap<String, Value>,
    /// Cumulative token usage
    #[serde(default)]
    pub token_usage: TokenUsage,
    /// USD budget
    #[serde(default)]
    pub budget: Budget,
    /// Compensations in registration (completion) order
    #[serde(default)]
    pub registered_compensations: Vec<RegisteredCompensation>,
    /// Saga unwind progress
    #[serde(default)]
    pub compensation_status: Option<CompensationStatus>,
    /// Tool name → schema fingerprint, snapshotted at yield
    #[serde(default)]
    pub tool_versions: HashMap<String, String>,
    /// Checkpoint from the last yield
    #[serde(default)]
    pub checkpoint: Option<Checkpoint>,
    /// Segment counter
    #[serde(default)]
    pub segment_number: u64,
    /// Linked intent for re-planning lineage
    #[serde(default)]
    pub intent_id: Option<String>,
    /// OCC version; increments by exactly one per successful write
    pub version: u64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last write timestamp; maintained by the store
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Create a fresh record in `Created`
    pub fn new(execution_id: ExecutionId) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            status: ExecutionStatus::Created,
            plan: None,
            step_states: Vec::new(),
            context: HashMap::new(),
            token_usage: TokenUsage::default(),
            budget: Budget::default(),
            registered_compensations: Vec::new(),
            compensation_status: None,
            tool_versions: HashMap::new(),
            checkpoint: None,
            segment_number: 0,
            intent_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Freeze a plan and move to `Planned`, seeding step states
    pub fn attach_plan(&mut self, plan: Plan) -> EngineResult<()> {
        self.transition_to(ExecutionStatus::Planned)?;
        self.step_states = plan
            .steps
            .iter()
            .map(|s| StepState::pending(s.id.clone()))
            .collect();
        self.plan = Some(plan);
        Ok(())
    }

    /// Validated status transition
    pub fn transition_to(&mut self, to: ExecutionStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(EngineError::InvalidStatusTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// Mutable step state by id
    pub fn step_state_mut(&mut self, step_id: &str) -> EngineResult<&mut StepState> {
        self.step_states
            .iter_mut()
            .find(|s| s.step_id == step_id)
            .ok_or_else(|| EngineError::Internal(format!("Unknown step {}", step_id)))
    }

    /// Step state by id
    pub fn step_state(&self, step_id: &str) -> Option<&StepState> {
        self.step_states.iter().find(|s| s.step_id == step_id)
    }

    /// Outputs of completed and skipped steps, keyed by step id
    pub fn step_outputs(&self) -> HashMap<String, Value> {
        self.step_states
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped))
            .filter_map(|s| s.output.clone().map(|o| (s.step_id.clone(), o)))
            .collect()
    }

    /// Count of steps with the given status
    pub fn count_with_status(&self, status: StepStatus) -> usize {
        self.step_states.iter().filter(|s| s.status == status).count()
    }

    /// Whether every step reached a terminal step status
    pub fn all_steps_settled(&self) -> bool {
        self.step_states.iter().all(|s| {
            matches!(
                s.status,
                StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped | StepStatus::Compensated
            )
        })
    }

    /// Set a context value
    pub fn set_context(&mut self, key: impl Into<String>, value: Value) {
        self.context.insert(key.into(), value);
    }

    /// Read a context string
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanStep;
    use serde_json::json;

    #[test]
    fn transition_graph_rejects_backwards_edges() {
        let mut record = ExecutionRecord::new(ExecutionId::new());
        record.attach_plan(Plan::new(vec![])).unwrap();
        record.transition_to(ExecutionStatus::Executing).unwrap();
        record.transition_to(ExecutionStatus::Completed).unwrap();

        let err = record.transition_to(ExecutionStatus::Executing).unwrap_err();
        assert_eq!(err.code(), "INVALID_STATUS_TRANSITION");
    }

    #[test]
    fn executing_may_yield_to_itself() {
        assert!(ExecutionStatus::Executing.can_transition_to(ExecutionStatus::Executing));
    }

    #[test]
    fn attach_plan_seeds_step_states() {
        let mut record = ExecutionRecord::new(ExecutionId::new());
        let plan = Plan::new(vec![
            PlanStep::new("a", "tool_a", json!({})),
            PlanStep::new("b", "tool_b", json!({})).after("a"),
        ]);
        record.attach_plan(plan).unwrap();

        assert_eq!(record.step_states.len(), 2);
        assert_eq!(record.step_states[0].status, StepStatus::Pending);
    }

    #[test]
    fn budget_check_reports_breach() {
        let budget = Budget {
            cost_limit_usd: 0.5,
            current_cost_usd: 0.45,
        };
        assert!(budget.check(0.04).is_ok());
        assert_eq!(budget.check(0.10).unwrap_err().code(), "BUDGET_EXCEEDED");
    }

    #[test]
    fn record_roundtrips_through_json() {
        let mut record = ExecutionRecord::new(ExecutionId::new());
        record
            .attach_plan(Plan::new(vec![PlanStep::new("a", "tool_a", json!({"x": 1}))]))
            .unwrap();
        record.set_context("trace_id", json!("t-1"));

        let encoded = serde_json::to_string(&record).unwrap();
        let decoded: ExecutionRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.execution_id, record.execution_id);
        assert_eq!(decoded.status, ExecutionStatus::Planned);
        assert_eq!(decoded.context_str("trace_id"), Some("t-1"));
    }
}
