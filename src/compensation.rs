//! Saga compensation
//!
//! Forward steps register their compensating calls at completion time; when
//! a saga fails, the runner replays those registrations in reverse
//! completion order. Every registered entry is attempted; a failure is
//! recorded, never an early abort.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::error::EngineResult;
use crate::execution::{CompensationStatus, ExecutionId, RegisteredCompensation};
use crate::tool::{ToolCall, ToolInvoker};

/// External registry describing which tools can be undone and how
#[async_trait]
pub trait CompensationResolver: Send + Sync {
    /// Whether a forward tool has a compensating action
    fn needs_compensation(&self, tool: &str) -> bool;

    /// Name of the compensating tool
    fn compensation_for(&self, tool: &str) -> Option<String>;

    /// Build compensating-call parameters from the forward call and output
    fn map_parameters(&self, tool: &str, original: &Value, output: &Value) -> Value;
}

type ParameterMapper = dyn Fn(&Value, &Value) -> Value + Send + Sync;

struct CompensationRule {
    tool: String,
    mapper: Arc<ParameterMapper>,
}

/// Table-driven resolver
#[derive(Default)]
pub struct CompensationTable {
    rules: HashMap<String, CompensationRule>,
}

impl CompensationTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a compensation with a parameter mapper
    pub fn register<F>(mut self, forward_tool: &str, compensating_tool: &str, mapper: F) -> Self
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        self.rules.insert(
            forward_tool.to_string(),
            CompensationRule {
                tool: compensating_tool.to_string(),
                mapper: Arc::new(mapper),
            },
        );
        self
    }
}

#[async_trait]
impl CompensationResolver for CompensationTable {
    fn needs_compensation(&self, tool: &str) -> bool {
        self.rules.contains_key(tool)
    }

    fn compensation_for(&self, tool: &str) -> Option<String> {
        self.rules.get(tool).map(|rule| rule.tool.clone())
    }

    fn map_parameters(&self, tool: &str, original: &Value, output: &Value) -> Value {
        match self.rules.get(tool) {
            Some(rule) => (rule.mapper)(original, output),
            None => Value::Null,
        }
    }
}

/// Retry behaviour for compensating calls
#[derive(Debug, Clone)]
pub struct SagaRetryConfig {
    /// Retries after the initial attempt
    pub max_retries: u32,
    /// First backoff delay; doubles per retry
    pub base_delay_ms: u64,
    /// Backoff cap
    pub cap_delay_ms: u64,
    /// Per-call deadline
    pub deadline_ms: u64,
}

impl Default for SagaRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            cap_delay_ms: 5_000,
            deadline_ms: 30_000,
        }
    }
}

/// Result of one compensating call
#[derive(Debug, Clone)]
pub struct CompensationOutcome {
    /// Forward step that registered the entry
    pub step_id: String,
    /// Compensating tool invoked
    pub tool: String,
    /// Whether the compensation succeeded
    pub success: bool,
    /// Last error when it did not
    pub error: Option<String>,
    /// Attempts made
    pub attempts: u32,
}

/// Result of a full unwind
#[derive(Debug, Clone)]
pub struct SagaReport {
    /// Per-entry outcomes in invocation order
    pub outcomes: Vec<CompensationOutcome>,
    /// Aggregate status
    pub status: CompensationStatus,
}

impl SagaReport {
    /// Steps successfully compensated
    pub fn compensated_steps(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }
}

/// Replays registered compensations in reverse completion order
pub struct SagaRunner {
    invoker: Arc<dyn ToolInvoker>,
    config: SagaRetryConfig,
}

impl SagaRunner {
    /// Create a runner over the tool invoker
    pub fn new(invoker: Arc<dyn ToolInvoker>, config: SagaRetryConfig) -> Self {
        Self { invoker, config }
    }

    /// Attempt every registered compensation, newest first
    pub async fn run(
        &self,
        execution_id: ExecutionId,
        entries: &[RegisteredCompensation],
        trace_id: &str,
    ) -> SagaReport {
        let mut outcomes = Vec::with_capacity(entries.len());

        for entry in entries.iter().rev() {
            let outcome = self.compensate_entry(execution_id, entry, trace_id).await;
            if outcome.success {
                info!(%execution_id, step_id = %entry.step_id, tool = %entry.tool, "compensated");
            } else {
                error!(
                    %execution_id,
                    step_id = %entry.step_id,
                    tool = %entry.tool,
                    error = ?outcome.error,
                    "compensation failed"
                );
            }
            outcomes.push(outcome);
        }

        let status = if outcomes.iter().all(|o| o.success) {
            CompensationStatus::Compensated
        } else {
            CompensationStatus::PartiallyCompensated
        };
        metrics::counter!("orka_sagas_unwound_total").increment(1);

        SagaReport { outcomes, status }
    }

    async fn compensate_entry(
        &self,
        execution_id: ExecutionId,
        entry: &RegisteredCompensation,
        trace_id: &str,
    ) -> CompensationOutcome {
        let call = ToolCall {
            execution_id,
            step_id: entry.step_id.clone(),
            tool: entry.tool.clone(),
            params: entry.params.clone(),
            trace_id: trace_id.to_string(),
        };
        let deadline = Duration::from_millis(self.config.deadline_ms);

        let mut attempts = 0;
        let mut delay = Duration::from_millis(self.config.base_delay_ms);
        let mut last_error = None;

        while attempts <= self.config.max_retries {
            attempts += 1;
            match self.invoker.execute(&call, deadline, CancelToken::new()).await {
                Ok(outcome) if outcome.success => {
                    return CompensationOutcome {
                        step_id: entry.step_id.clone(),
                        tool: entry.tool.clone(),
                        success: true,
                        error: None,
                        attempts,
                    };
                }
                Ok(outcome) => {
                    last_error = Some(outcome.error.unwrap_or_else(|| "unknown error".into()));
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                }
            }

            if attempts <= self.config.max_retries {
                warn!(
                    %execution_id,
                    step_id = %entry.step_id,
                    attempt = attempts,
                    "compensation attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_millis(self.config.cap_delay_ms));
            }
        }

        CompensationOutcome {
            step_id: entry.step_id.clone(),
            tool: entry.tool.clone(),
            success: false,
            error: last_error,
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::tool::ToolOutcome;
    use parking_lot::Mutex;
    use serde_json::json;

    struct ScriptedInvoker {
        calls: Mutex<Vec<String>>,
        fail_tools: Vec<String>,
        fail_first_n: Mutex<HashMap<String, u32>>,
    }

    impl ScriptedInvoker {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_tools: Vec::new(),
                fail_first_n: Mutex::new(HashMap::new()),
            }
        }

        fn failing(mut self, tool: &str) -> Self {
            self.fail_tools.push(tool.to_string());
            self
        }

        fn flaky(self, tool: &str, failures: u32) -> Self {
            self.fail_first_n.lock().insert(tool.to_string(), failures);
            self
        }
    }

    #[async_trait]
    impl ToolInvoker for ScriptedInvoker {
        async fn execute(
            &self,
            call: &ToolCall,
            _deadline: Duration,
            _cancel: CancelToken,
        ) -> Result<ToolOutcome, EngineError> {
            self.calls.lock().push(call.tool.clone());
            if self.fail_tools.contains(&call.tool) {
                return Ok(ToolOutcome::failed("permanent failure", 5));
            }
            let mut flaky = self.fail_first_n.lock();
            if let Some(remaining) = flaky.get_mut(&call.tool) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Ok(ToolOutcome::failed("transient failure", 5));
                }
            }
            Ok(ToolOutcome::ok(json!({"undone": true}), 5))
        }
    }

    fn entries() -> Vec<RegisteredCompensation> {
        vec![
            RegisteredCompensation {
                step_id: "step-1".into(),
                tool: "cancel_ride".into(),
                params: json!({"rideId": "ride-123"}),
            },
            RegisteredCompensation {
                step_id: "step-2".into(),
                tool: "cancel_table".into(),
                params: json!({"bookingId": "b-9"}),
            },
        ]
    }

    fn fast_config() -> SagaRetryConfig {
        SagaRetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
            cap_delay_ms: 4,
            deadline_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn compensations_run_in_reverse_registration_order() {
        let invoker = Arc::new(ScriptedInvoker::new());
        let runner = SagaRunner::new(invoker.clone(), fast_config());

        let report = runner.run(ExecutionId::new(), &entries(), "t").await;
        assert_eq!(report.status, CompensationStatus::Compensated);
        assert_eq!(report.compensated_steps(), 2);
        assert_eq!(*invoker.calls.lock(), vec!["cancel_table", "cancel_ride"]);
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_rest() {
        let invoker = Arc::new(ScriptedInvoker::new().failing("cancel_table"));
        let runner = SagaRunner::new(invoker.clone(), fast_config());

        let report = runner.run(ExecutionId::new(), &entries(), "t").await;
        assert_eq!(report.status, CompensationStatus::PartiallyCompensated);
        assert_eq!(report.compensated_steps(), 1);

        // The failing entry was retried to exhaustion, then the next entry
        // still ran.
        let calls = invoker.calls.lock();
        assert_eq!(calls.iter().filter(|t| *t == "cancel_table").count(), 4);
        assert_eq!(calls.iter().filter(|t| *t == "cancel_ride").count(), 1);
    }

    #[tokio::test]
    async fn transient_failure_recovers_within_retries() {
        let invoker = Arc::new(ScriptedInvoker::new().flaky("cancel_ride", 2));
        let runner = SagaRunner::new(invoker, fast_config());

        let single = vec![entries().remove(0)];
        let report = runner.run(ExecutionId::new(), &single, "t").await;
        assert_eq!(report.status, CompensationStatus::Compensated);
        assert_eq!(report.outcomes[0].attempts, 3);
    }

    #[test]
    fn table_maps_parameters() {
        let table = CompensationTable::new().register("book_ride", "cancel_ride", |_orig, output| {
            json!({"rideId": output.get("rideId").cloned().unwrap_or(Value::Null)})
        });

        assert!(table.needs_compensation("book_ride"));
        assert!(!table.needs_compensation("lookup_menu"));
        assert_eq!(table.compensation_for("book_ride").unwrap(), "cancel_ride");

        let params = table.map_parameters(
            "book_ride",
            &json!({"from": "a"}),
            &json!({"rideId": "ride-123"}),
        );
        assert_eq!(params, json!({"rideId": "ride-123"}));
    }
}
