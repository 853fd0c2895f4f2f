//! Single-step execution
//!
//! Resolution, the idempotency gate, schema validation, the pre-emptive
//! in-progress persist, the deadline-bounded tool call, compensation
//! registration, and the single failover retry all live here.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::SagaEngine;
use crate::cancel::CancelToken;
use crate::error::{EngineError, EngineResult};
use crate::execution::{ExecutionId, ExecutionRecord, RegisteredCompensation, StepStatus};
use crate::failover::{classify_failure, FailureReason, RecommendedAction};
use crate::plan::{resolve_references, Plan, PlanStep};
use crate::tool::{ToolCall, ToolOutcome};

/// What one step execution produced
#[derive(Debug, Clone)]
pub(crate) enum StepRunResult {
    /// Tool call succeeded (possibly after the single retry)
    Completed {
        #[allow(dead_code)]
        used_correction: bool,
    },
    /// Idempotency gate short-circuited the call
    Skipped,
    /// Step failed terminally for this segment
    Failed {
        code: String,
        #[allow(dead_code)]
        reason: FailureReason,
        suggestion: Option<RecommendedAction>,
    },
    /// The segment's cancel signal fired mid-call
    Cancelled,
}

/// Report handed back to the segment loop
#[derive(Debug, Clone)]
pub(crate) struct StepReport {
    pub step_id: String,
    pub result: StepRunResult,
}

enum InvokeOutcome {
    Success(ToolOutcome),
    Failure { error: String, status: Option<u16> },
    Cancelled,
}

enum RetryPlan {
    Retry {
        params: Value,
        used_correction: bool,
        delay_ms: Option<u64>,
    },
    GiveUp {
        suggestion: Option<RecommendedAction>,
    },
}

/// In-segment retry sleeps are capped well below the invocation budget.
const MAX_RETRY_SLEEP_MS: u64 = 1_000;

/// Map a classified failure onto the persisted error kind
fn tool_error(reason: FailureReason, message: &str) -> EngineError {
    match reason {
        FailureReason::Timeout => EngineError::ToolTimeout(message.to_string()),
        FailureReason::ValidationFailed => EngineError::ValidationFailed(message.to_string()),
        _ => EngineError::ToolExecutionFailed(message.to_string()),
    }
}

impl SagaEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn execute_step(
        &self,
        execution_id: ExecutionId,
        record: &ExecutionRecord,
        plan: &Plan,
        step_id: &str,
        outputs: &HashMap<String, Value>,
        cancel: CancelToken,
        trace_id: &str,
    ) -> EngineResult<StepReport> {
        let plan_step = plan
            .step(step_id)
            .ok_or_else(|| EngineError::Internal(format!("unknown step {}", step_id)))?;
        let descriptor = self.registry.get(&plan_step.tool);

        let mut resolved = resolve_references(&plan_step.params, outputs);
        if let Some(descriptor) = &descriptor {
            resolved = descriptor.apply_aliases(&resolved);
        }
        let user_id = record
            .context_str("user_id")
            .unwrap_or("anonymous")
            .to_string();

        // Idempotency gate: consulted after resolution, before invocation.
        if self
            .idempotency
            .is_duplicate(&user_id, &plan_step.tool, &resolved)
            .await?
        {
            self.store
                .update(execution_id, |r| {
                    let step = r.step_state_mut(step_id)?;
                    step.status = StepStatus::Completed;
                    step.output = Some(json!({"skipped": true}));
                    step.completed_at = Some(chrono::Utc::now());
                    Ok(())
                })
                .await?;
            metrics::counter!("orka_steps_deduplicated_total").increment(1);
            info!(%execution_id, step_id, tool = %plan_step.tool, "duplicate call short-circuited");
            return Ok(StepReport {
                step_id: step_id.to_string(),
                result: StepRunResult::Skipped,
            });
        }

        if let Some(descriptor) = &descriptor {
            if let Err(validation) = descriptor.schema.validate(&plan_step.tool, &resolved) {
                return self
                    .persist_step_failure(
                        execution_id,
                        step_id,
                        &validation,
                        FailureReason::ValidationFailed,
                        Some(RecommendedAction::Escalate),
                    )
                    .await;
            }
        }

        self.persist_in_progress(execution_id, step_id, &resolved).await?;

        let call = ToolCall {
            execution_id,
            step_id: step_id.to_string(),
            tool: plan_step.tool.clone(),
            params: resolved.clone(),
            trace_id: trace_id.to_string(),
        };
        let deadline = Duration::from_millis(self.config.segment.step_timeout_ms);

        match self.invoke_once(&call, deadline, &cancel).await {
            InvokeOutcome::Cancelled => self.persist_step_cancelled(execution_id, step_id).await,
            InvokeOutcome::Success(outcome) => {
                self.persist_step_success(
                    execution_id, step_id, plan_step, &resolved, outcome, false, &user_id,
                )
                .await
            }
            InvokeOutcome::Failure { error, status } => {
                let reason = classify_failure(&error, status);
                debug!(%execution_id, step_id, %error, ?reason, "tool call failed");
                self.retry_or_fail(
                    execution_id, plan_step, &call, &resolved, &error, reason, cancel, &user_id,
                )
                .await
            }
        }
    }

    /// Single retry per step per segment, driven by the failover policy and
    /// gated by the correction breaker
    #[allow(clippy::too_many_arguments)]
    async fn retry_or_fail(
        &self,
        execution_id: ExecutionId,
        plan_step: &PlanStep,
        call: &ToolCall,
        resolved: &Value,
        error: &str,
        reason: FailureReason,
        cancel: CancelToken,
        user_id: &str,
    ) -> EngineResult<StepReport> {
        let step_id = call.step_id.as_str();
        let plan = self
            .plan_retry(execution_id, plan_step, call, resolved, error, reason)
            .await?;

        let (params, used_correction, delay_ms) = match plan {
            RetryPlan::Retry {
                params,
                used_correction,
                delay_ms,
            } => (params, used_correction, delay_ms),
            RetryPlan::GiveUp { suggestion } => {
                return self
                    .persist_step_failure(
                        execution_id,
                        step_id,
                        &tool_error(reason, error),
                        reason,
                        suggestion,
                    )
                    .await;
            }
        };

        if let Some(delay) = delay_ms {
            tokio::time::sleep(Duration::from_millis(delay.min(MAX_RETRY_SLEEP_MS))).await;
        }

        self.persist_in_progress(execution_id, step_id, &params).await?;
        let retry_call = ToolCall {
            params: params.clone(),
            ..call.clone()
        };
        let deadline = Duration::from_millis(self.config.segment.step_timeout_ms);

        match self.invoke_once(&retry_call, deadline, &cancel).await {
            InvokeOutcome::Cancelled => self.persist_step_cancelled(execution_id, step_id).await,
            InvokeOutcome::Success(outcome) => {
                if used_correction {
                    // A successful retry after failover resets the breaker.
                    self.breaker.on_success(execution_id, step_id).await?;
                }
                self.persist_step_success(
                    execution_id, step_id, plan_step, &params, outcome, used_correction, user_id,
                )
                .await
            }
            InvokeOutcome::Failure {
                error: retry_error,
                status,
            } => {
                if used_correction {
                    self.breaker.on_failure(execution_id, step_id).await?;
                }
                let retry_reason = classify_failure(&retry_error, status);
                self.persist_step_failure(
                    execution_id,
                    step_id,
                    &tool_error(retry_reason, &retry_error),
                    retry_reason,
                    None,
                )
                .await
            }
        }
    }

    async fn plan_retry(
        &self,
        execution_id: ExecutionId,
        plan_step: &PlanStep,
        call: &ToolCall,
        resolved: &Value,
        error: &str,
        reason: FailureReason,
    ) -> EngineResult<RetryPlan> {
        let action = self
            .failover
            .recommend(plan_step.intent.as_deref(), reason, resolved);

        if let Some(mutated) = self.failover.apply(&action, resolved) {
            let delay_ms = match &action {
                RecommendedAction::RetryWithBackoff { delay_ms } => Some(*delay_ms),
                _ => None,
            };
            debug!(%execution_id, step_id = %call.step_id, action = action.code(), "policy retry");
            return Ok(RetryPlan::Retry {
                params: mutated,
                used_correction: false,
                delay_ms,
            });
        }

        // No deterministic mutation: fall through to the LLM corrector.
        let Some(corrector) = &self.corrector else {
            return Ok(RetryPlan::GiveUp {
                suggestion: Some(action),
            });
        };
        let Some(descriptor) = self.registry.get(&call.tool) else {
            return Ok(RetryPlan::GiveUp {
                suggestion: Some(action),
            });
        };

        let decision = self.breaker.evaluate(execution_id, &call.step_id).await?;
        if !decision.allowed {
            warn!(%execution_id, step_id = %call.step_id, "correction circuit open, escalating");
            return Ok(RetryPlan::GiveUp {
                suggestion: Some(action),
            });
        }

        // Hard ceiling: a projected breach aborts the correction before the
        // call is made.
        let (current, _) = self.store.load(execution_id).await?;
        if let Err(breach) = current.budget.check(corrector.estimated_cost_usd()) {
            warn!(%execution_id, step_id = %call.step_id, %breach, "correction skipped, budget ceiling");
            return self
                .persist_budget_breach(execution_id, breach)
                .await
                .map(|_| RetryPlan::GiveUp {
                    suggestion: Some(RecommendedAction::Escalate),
                });
        }

        self.breaker.record_attempt(execution_id, &call.step_id).await?;
        match corrector.correct(call, error, &descriptor.schema).await {
            Ok(proposal) => {
                if descriptor
                    .schema
                    .validate(&call.tool, &proposal.params)
                    .is_err()
                {
                    self.breaker.on_failure(execution_id, &call.step_id).await?;
                    return Ok(RetryPlan::GiveUp {
                        suggestion: Some(action),
                    });
                }
                let cost = proposal.cost_usd;
                let tokens = proposal.tokens;
                self.store
                    .update(execution_id, |r| {
                        r.budget.current_cost_usd += cost;
                        r.token_usage.add(tokens);
                        Ok(())
                    })
                    .await?;
                metrics::counter!("orka_corrections_total").increment(1);
                Ok(RetryPlan::Retry {
                    params: proposal.params,
                    used_correction: true,
                    delay_ms: None,
                })
            }
            Err(e) => {
                self.breaker.on_failure(execution_id, &call.step_id).await?;
                warn!(%execution_id, step_id = %call.step_id, error = %e, "correction call failed");
                Ok(RetryPlan::GiveUp {
                    suggestion: Some(action),
                })
            }
        }
    }

    async fn invoke_once(
        &self,
        call: &ToolCall,
        deadline: Duration,
        cancel: &CancelToken,
    ) -> InvokeOutcome {
        let child = cancel.child_token();
        tokio::select! {
            result = tokio::time::timeout(deadline, self.invoker.execute(call, deadline, child.clone())) => {
                match result {
                    Ok(Ok(outcome)) if outcome.success => InvokeOutcome::Success(outcome),
                    Ok(Ok(outcome)) => InvokeOutcome::Failure {
                        error: outcome.error.unwrap_or_else(|| "tool reported failure".into()),
                        status: outcome.status_code,
                    },
                    Ok(Err(e)) => InvokeOutcome::Failure {
                        error: e.to_string(),
                        status: None,
                    },
                    Err(_) => {
                        // The engine stops waiting; the tool sees the
                        // cancel signal and winds down on its own.
                        child.cancel();
                        InvokeOutcome::Failure {
                            error: format!("tool {} deadline exceeded", call.tool),
                            status: None,
                        }
                    }
                }
            }
            _ = cancel.cancelled() => {
                child.cancel();
                InvokeOutcome::Cancelled
            }
        }
    }

    async fn persist_in_progress(
        &self,
        execution_id: ExecutionId,
        step_id: &str,
        input: &Value,
    ) -> EngineResult<()> {
        let input = input.clone();
        self.store
            .update(execution_id, move |r| {
                let step = r.step_state_mut(step_id)?;
                step.status = StepStatus::InProgress;
                step.attempts += 1;
                if step.started_at.is_none() {
                    step.started_at = Some(chrono::Utc::now());
                }
                step.input = Some(input.clone());
                step.reissue_on_resume = false;
                Ok(())
            })
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_step_success(
        &self,
        execution_id: ExecutionId,
        step_id: &str,
        plan_step: &PlanStep,
        input: &Value,
        outcome: ToolOutcome,
        used_correction: bool,
        user_id: &str,
    ) -> EngineResult<StepReport> {
        let output = outcome.output.clone().unwrap_or(Value::Null);
        let compensation = self.compensation_entry(step_id, plan_step, input, &output, &outcome);

        self.store
            .update(execution_id, |r| {
                let step = r.step_state_mut(step_id)?;
                step.status = StepStatus::Completed;
                step.output = Some(output.clone());
                step.error = None;
                step.completed_at = Some(chrono::Utc::now());
                step.latency_ms = Some(outcome.latency_ms);
                // Registration rides the same transition that completes the
                // step.
                if let Some(entry) = &compensation {
                    if !r
                        .registered_compensations
                        .iter()
                        .any(|existing| existing.step_id == step_id)
                    {
                        r.registered_compensations.push(entry.clone());
                    }
                }
                Ok(())
            })
            .await?;

        self.idempotency.record(user_id, &plan_step.tool, input).await?;
        metrics::counter!("orka_steps_completed_total").increment(1);
        metrics::histogram!("orka_step_latency_ms").record(outcome.latency_ms as f64);
        info!(%execution_id, step_id, tool = %plan_step.tool, latency_ms = outcome.latency_ms, "step completed");

        Ok(StepReport {
            step_id: step_id.to_string(),
            result: StepRunResult::Completed { used_correction },
        })
    }

    fn compensation_entry(
        &self,
        step_id: &str,
        plan_step: &PlanStep,
        input: &Value,
        output: &Value,
        outcome: &ToolOutcome,
    ) -> Option<RegisteredCompensation> {
        if let Some(directive) = &outcome.compensation {
            let params = directive.params.clone().unwrap_or_else(|| {
                self.compensations
                    .map_parameters(&plan_step.tool, input, output)
            });
            return Some(RegisteredCompensation {
                step_id: step_id.to_string(),
                tool: directive.tool.clone(),
                params,
            });
        }
        if self.compensations.needs_compensation(&plan_step.tool) {
            let tool = self.compensations.compensation_for(&plan_step.tool)?;
            return Some(RegisteredCompensation {
                step_id: step_id.to_string(),
                tool,
                params: self
                    .compensations
                    .map_parameters(&plan_step.tool, input, output),
            });
        }
        None
    }

    async fn persist_step_failure(
        &self,
        execution_id: ExecutionId,
        step_id: &str,
        error: &EngineError,
        reason: FailureReason,
        suggestion: Option<RecommendedAction>,
    ) -> EngineResult<StepReport> {
        let code = error.code().to_string();
        let message = error.to_string();
        self.store
            .update(execution_id, |r| {
                let step = r.step_state_mut(step_id)?;
                step.status = StepStatus::Failed;
                step.error = Some(crate::execution::StepError {
                    code: code.clone(),
                    message: message.clone(),
                });
                step.completed_at = Some(chrono::Utc::now());
                Ok(())
            })
            .await?;
        metrics::counter!("orka_steps_failed_total").increment(1);
        warn!(%execution_id, step_id, code = %code, reason = reason.code(), "step failed");

        Ok(StepReport {
            step_id: step_id.to_string(),
            result: StepRunResult::Failed {
                code,
                reason,
                suggestion,
            },
        })
    }

    async fn persist_step_cancelled(
        &self,
        execution_id: ExecutionId,
        step_id: &str,
    ) -> EngineResult<StepReport> {
        // The step stays in progress and is re-issued on resume if the
        // record is not terminal.
        self.store
            .update(execution_id, |r| {
                let step = r.step_state_mut(step_id)?;
                step.reissue_on_resume = true;
                Ok(())
            })
            .await?;
        Ok(StepReport {
            step_id: step_id.to_string(),
            result: StepRunResult::Cancelled,
        })
    }

    async fn persist_budget_breach(
        &self,
        execution_id: ExecutionId,
        breach: EngineError,
    ) -> EngineResult<()> {
        self.store
            .update(execution_id, |r| {
                r.set_context("budget_breach", Value::from(breach.to_string()));
                Ok(())
            })
            .await?;
        Ok(())
    }
}
