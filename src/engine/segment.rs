//! Segment execution
//!
//! One segment is a bounded wall-clock window of forward progress. The
//! loop suspends only at its top: yield, confirmation, compensation, and
//! terminal transitions all happen between batches, never mid-call.

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{SagaEngine, SegmentOutcome};
use crate::cancel::CancelToken;
use crate::confirmation::{classify_risk, RiskClass};
use crate::engine::step::{StepReport, StepRunResult};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::execution::{
    Checkpoint, ExecutionId, ExecutionRecord, ExecutionStatus, StepStatus, YieldReason,
};
use crate::plan::{resolve_references, Plan};
use crate::queue::ResumeMessage;
use crate::resolver::Batch;

impl SagaEngine {
    pub(crate) async fn run_segment_locked(
        &self,
        execution_id: ExecutionId,
        trace_id: &str,
        cancel: CancelToken,
    ) -> EngineResult<SegmentOutcome> {
        let segment_start = Instant::now();
        metrics::counter!("orka_segments_total").increment(1);

        let (mut record, _) = self.store.load(execution_id).await?;

        match record.status {
            ExecutionStatus::Created => {
                return Err(EngineError::PlanValidationFailed(
                    "execution has no plan attached".into(),
                ));
            }
            ExecutionStatus::Planned | ExecutionStatus::Executing => {}
            ExecutionStatus::AwaitingConfirmation => {
                let token = self
                    .confirmations
                    .pending_token(execution_id)
                    .await?
                    .unwrap_or_default();
                return Ok(SegmentOutcome::AwaitingConfirmation { token });
            }
            ExecutionStatus::Suspended => {
                return Ok(SegmentOutcome::Suspended {
                    reason: record
                        .context_str("suspend_reason")
                        .unwrap_or("SUSPENDED")
                        .to_string(),
                });
            }
            ExecutionStatus::Completed => return Ok(SegmentOutcome::Completed),
            ExecutionStatus::Cancelled => return Ok(SegmentOutcome::Cancelled),
            ExecutionStatus::Compensating
            | ExecutionStatus::Compensated
            | ExecutionStatus::Failed
            | ExecutionStatus::Timeout => {
                return Ok(SegmentOutcome::Failed {
                    code: record
                        .context_str("failure")
                        .unwrap_or("UNKNOWN")
                        .to_string(),
                });
            }
        }

        // The batch structure drives step selection for the whole segment:
        // conflicting steps were split into single-step batches and must
        // never run concurrently.
        let plan = require_plan(&record)?;
        let resolved = match self.resolver.resolve(&plan) {
            Ok(resolved) => resolved,
            Err(gate) => return self.fail_before_start(execution_id, gate).await,
        };

        if record.status == ExecutionStatus::Planned {
            if let Err(gate) = self.plan_verifier.verify(&plan) {
                return self.fail_before_start(execution_id, gate).await;
            }
            record = self
                .store
                .update(execution_id, |r| {
                    r.transition_to(ExecutionStatus::Executing)?;
                    recover_inflight(r);
                    Ok(())
                })
                .await?;
            debug!(%execution_id, "plan verified, executing");
        } else {
            record = self
                .store
                .update(execution_id, |r| {
                    recover_inflight(r);
                    Ok(())
                })
                .await?;
        }

        // Conservative overhead is asserted up front so a breached budget
        // never starts a segment it cannot pay for.
        if let Err(breach) = record
            .budget
            .check(self.config.segment.overhead_estimate_usd)
        {
            return self.fail_before_start(execution_id, breach).await;
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(SegmentOutcome::Cancelled);
            }

            let ready = ready_steps(
                &record,
                &plan,
                &resolved.batches,
                self.config.segment.max_batch,
            );

            if ready.is_empty() {
                let pending_remain = record
                    .step_states
                    .iter()
                    .any(|s| s.status == StepStatus::Pending);
                if pending_remain
                    && !record
                        .step_states
                        .iter()
                        .any(|s| s.status == StepStatus::Failed)
                {
                    // Unfailed plan with unreachable pending steps: the DAG
                    // is malformed.
                    let err = EngineError::CircularDependency(
                        "pending steps with unsatisfiable dependencies".into(),
                    );
                    return self.fail_before_start(execution_id, err).await;
                }
                return self.finalize(execution_id).await;
            }

            let elapsed_ms = segment_start.elapsed().as_millis() as u64;
            let estimate_ms = ready
                .iter()
                .filter_map(|id| plan.step(id).and_then(|s| s.estimated_latency_ms))
                .max()
                .unwrap_or(self.config.segment.default_step_estimate_ms);
            let threshold =
                self.config.segment.checkpoint_threshold_ms + self.config.segment.yield_buffer_ms;
            if elapsed_ms >= self.config.segment.min_yield_check_ms
                && elapsed_ms + estimate_ms >= threshold
            {
                return self
                    .yield_checkpoint(
                        execution_id,
                        &record,
                        &plan,
                        YieldReason::TimeoutApproaching,
                        trace_id,
                    )
                    .await;
            }

            // Confirmation gate: the first unconfirmed high-risk step in
            // the batch suspends the workflow before anything runs.
            let outputs = record.step_outputs();
            for step_id in &ready {
                if let Some(outcome) = self
                    .confirmation_gate(execution_id, &record, &plan, step_id, &outputs)
                    .await?
                {
                    return Ok(outcome);
                }
            }

            let mut reports: Vec<StepReport> = Vec::with_capacity(ready.len());
            {
                let mut in_flight = FuturesUnordered::new();
                for step_id in &ready {
                    in_flight.push(self.execute_step(
                        execution_id,
                        &record,
                        &plan,
                        step_id,
                        &outputs,
                        cancel.child_token(),
                        trace_id,
                    ));
                }
                // Results merge in completion order.
                while let Some(report) = in_flight.next().await {
                    reports.push(report?);
                }
            }

            let (fresh, _) = self.store.load(execution_id).await?;
            record = fresh;

            let mut decisive_failure: Option<String> = None;
            for report in &reports {
                match &report.result {
                    StepRunResult::Cancelled => return Ok(SegmentOutcome::Cancelled),
                    StepRunResult::Failed { code, suggestion, .. } => {
                        if let Some(action) = suggestion {
                            let _ = self
                                .events
                                .publish(EngineEvent::SuggestionsIssued {
                                    execution_id,
                                    step_id: report.step_id.clone(),
                                    action: action.clone(),
                                })
                                .await;
                        }
                        decisive_failure.get_or_insert_with(|| code.clone());
                    }
                    StepRunResult::Completed { .. } | StepRunResult::Skipped => {}
                }
            }

            if let Some(code) = decisive_failure {
                if !record.registered_compensations.is_empty() {
                    return self.run_compensation(execution_id, &code, trace_id).await;
                }
                // Nothing to unwind: dependents of the failed step are
                // unreachable, but independent branches may still run.
                debug!(%execution_id, code, "step failed with no compensations registered");
            }
        }
    }

    async fn confirmation_gate(
        &self,
        execution_id: ExecutionId,
        record: &ExecutionRecord,
        plan: &Plan,
        step_id: &str,
        outputs: &HashMap<String, Value>,
    ) -> EngineResult<Option<SegmentOutcome>> {
        let Some(plan_step) = plan.step(step_id) else {
            return Ok(None);
        };
        if record.step_state(step_id).is_some_and(|s| s.confirmed) {
            return Ok(None);
        }
        let Some(descriptor) = self.registry.get(&plan_step.tool) else {
            return Ok(None);
        };

        let resolved = descriptor.apply_aliases(&resolve_references(&plan_step.params, outputs));
        let risk = classify_risk(&self.config.risk, &descriptor, &resolved);
        if !risk.requires_confirmation() {
            return Ok(None);
        }

        let reason = match risk {
            RiskClass::Critical => "critical-risk step requires human confirmation",
            _ => "high-risk step requires human confirmation",
        };
        let request = self
            .confirmations
            .mint(
                execution_id,
                step_id,
                &plan_step.tool,
                &resolved,
                risk,
                record.context_str("user_id"),
                reason,
            )
            .await?;

        self.store
            .update(execution_id, |r| {
                r.transition_to(ExecutionStatus::AwaitingConfirmation)
            })
            .await?;

        let _ = self
            .events
            .publish(EngineEvent::ConfirmationRequested {
                execution_id,
                request: request.clone(),
            })
            .await;
        info!(%execution_id, step_id, ?risk, "suspended for confirmation");
        Ok(Some(SegmentOutcome::AwaitingConfirmation {
            token: request.token,
        }))
    }

    pub(crate) async fn yield_checkpoint(
        &self,
        execution_id: ExecutionId,
        record: &ExecutionRecord,
        plan: &Plan,
        reason: YieldReason,
        trace_id: &str,
    ) -> EngineResult<SegmentOutcome> {
        let next_step_index = record
            .step_states
            .iter()
            .position(|s| matches!(s.status, StepStatus::Pending | StepStatus::InProgress))
            .unwrap_or(record.step_states.len());

        let all_fingerprints = self.registry.fingerprints();
        let tool_versions: HashMap<String, String> = plan
            .steps
            .iter()
            .filter_map(|s| {
                all_fingerprints
                    .get(&s.tool)
                    .map(|fp| (s.tool.clone(), fp.clone()))
            })
            .collect();

        let updated = self
            .store
            .update(execution_id, |r| {
                r.checkpoint = Some(Checkpoint {
                    next_step_index,
                    checkpoint_at: chrono::Utc::now(),
                    reason,
                });
                r.segment_number += 1;
                r.tool_versions = tool_versions.clone();
                Ok(())
            })
            .await?;

        if let Err(e) = self.snapshots.capture(&updated).await {
            warn!(%execution_id, error = %e, "snapshot capture failed at yield");
        }

        let message = ResumeMessage {
            execution_id,
            segment_number: updated.segment_number,
            start_step_index: Some(next_step_index),
            trace_id: trace_id.to_string(),
        };
        let signed = self.signer.sign(message.clone())?;
        // Fire and forget: the fallback event carries the resume if the
        // queue is down.
        if let Err(e) = self
            .queue
            .publish(
                &signed,
                std::time::Duration::from_millis(self.config.segment.resume_delay_ms),
            )
            .await
        {
            warn!(%execution_id, error = %e, "resume publish failed, emitting fallback");
            let _ = self
                .events
                .publish(EngineEvent::ResumeFallback { message })
                .await;
        }

        let _ = self
            .events
            .publish(EngineEvent::CheckpointWritten {
                execution_id,
                segment_number: updated.segment_number,
                reason,
            })
            .await;

        metrics::counter!("orka_yields_total").increment(1);
        info!(
            %execution_id,
            segment_number = updated.segment_number,
            next_step_index,
            ?reason,
            "segment yielded"
        );
        Ok(SegmentOutcome::Yielded {
            segment_number: updated.segment_number,
            next_step_index,
        })
    }

    async fn fail_before_start(
        &self,
        execution_id: ExecutionId,
        error: EngineError,
    ) -> EngineResult<SegmentOutcome> {
        let code = error.code().to_string();
        self.store
            .update(execution_id, |r| {
                r.transition_to(ExecutionStatus::Failed)?;
                r.set_context("failure", Value::from(code.clone()));
                r.set_context("failure_detail", Value::from(error.to_string()));
                Ok(())
            })
            .await?;
        let _ = self
            .events
            .publish(EngineEvent::ExecutionFailed {
                execution_id,
                error_code: code.clone(),
            })
            .await;
        warn!(%execution_id, code, "execution failed before running steps");
        Ok(SegmentOutcome::Failed { code })
    }

    async fn finalize(&self, execution_id: ExecutionId) -> EngineResult<SegmentOutcome> {
        let updated = self
            .store
            .update(execution_id, |r| {
                let failed = r
                    .step_states
                    .iter()
                    .any(|s| s.status == StepStatus::Failed);
                for step in r.step_states.iter_mut() {
                    if step.status == StepStatus::Pending {
                        step.status = StepStatus::Skipped;
                    }
                }
                if failed {
                    let code = r
                        .step_states
                        .iter()
                        .find(|s| s.status == StepStatus::Failed)
                        .and_then(|s| s.error.as_ref())
                        .map(|e| e.code.clone())
                        .unwrap_or_else(|| "STEP_EXECUTION_FAILED".to_string());
                    r.transition_to(ExecutionStatus::Failed)?;
                    r.set_context("failure", Value::from(code));
                } else {
                    r.transition_to(ExecutionStatus::Completed)?;
                }
                Ok(())
            })
            .await?;

        if let Err(e) = self.snapshots.capture(&updated).await {
            warn!(%execution_id, error = %e, "snapshot capture failed at completion");
        }

        if updated.status == ExecutionStatus::Completed {
            let _ = self
                .events
                .publish(EngineEvent::ExecutionCompleted { execution_id })
                .await;
            metrics::counter!("orka_executions_completed_total").increment(1);
            info!(%execution_id, "execution completed");
            Ok(SegmentOutcome::Completed)
        } else {
            let code = updated
                .context_str("failure")
                .unwrap_or("STEP_EXECUTION_FAILED")
                .to_string();
            let _ = self
                .events
                .publish(EngineEvent::ExecutionFailed {
                    execution_id,
                    error_code: code.clone(),
                })
                .await;
            metrics::counter!("orka_executions_failed_total").increment(1);
            info!(%execution_id, code, "execution failed");
            Ok(SegmentOutcome::Failed { code })
        }
    }
}

fn require_plan(record: &ExecutionRecord) -> EngineResult<Plan> {
    record
        .plan
        .clone()
        .ok_or_else(|| EngineError::Internal("record has no plan".into()))
}

/// Candidates for the next fan-out, drawn from the first resolver batch
/// that still has pending steps.
///
/// Batches are consumed in order. Steps with overlapping `writes` were
/// split into their own non-parallelizable batches by the resolver, so a
/// conflicting writer is never selected while its rival's batch is still
/// being worked; within a batch, only steps whose dependencies settled
/// successfully are eligible.
fn ready_steps(
    record: &ExecutionRecord,
    plan: &Plan,
    batches: &[Batch],
    max_batch: usize,
) -> Vec<String> {
    for batch in batches {
        let pending: Vec<&str> = batch
            .step_ids
            .iter()
            .map(String::as_str)
            .filter(|id| {
                record
                    .step_state(id)
                    .is_some_and(|s| s.status == StepStatus::Pending)
            })
            .collect();
        if pending.is_empty() {
            continue;
        }

        let limit = if batch.parallelizable { max_batch } else { 1 };
        let mut ready = Vec::new();
        for id in pending {
            let Some(step) = plan.step(id) else {
                continue;
            };
            let deps_met = step.depends_on.iter().all(|dep| {
                record
                    .step_state(dep)
                    .is_some_and(|d| matches!(d.status, StepStatus::Completed | StepStatus::Skipped))
            });
            if deps_met {
                ready.push(id.to_string());
                if ready.len() == limit {
                    break;
                }
            }
        }
        // An empty list here means the batch is blocked on failed
        // dependencies; the caller settles the execution.
        return ready;
    }
    Vec::new()
}

/// Steps left in flight by a dead segment are re-issued
fn recover_inflight(record: &mut ExecutionRecord) {
    for step in record.step_states.iter_mut() {
        if step.status == StepStatus::InProgress {
            step.status = StepStatus::Pending;
            step.reissue_on_resume = true;
        }
    }
}
