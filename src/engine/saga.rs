//! Saga unwind
//!
//! A compensatable failure flips the record into its terminal failed state
//! with compensation tracked alongside, then replays every registered
//! compensation in reverse completion order.

use serde_json::Value;
use tracing::{info, warn};

use super::{SagaEngine, SegmentOutcome};
use crate::error::EngineResult;
use crate::events::EngineEvent;
use crate::execution::{CompensationStatus, ExecutionId, ExecutionStatus, StepStatus};

impl SagaEngine {
    pub(crate) async fn run_compensation(
        &self,
        execution_id: ExecutionId,
        failure_code: &str,
        trace_id: &str,
    ) -> EngineResult<SegmentOutcome> {
        let updated = self
            .store
            .update(execution_id, |r| {
                r.transition_to(ExecutionStatus::Failed)?;
                r.compensation_status = Some(CompensationStatus::Compensating);
                r.set_context("failure", Value::from(failure_code.to_string()));
                Ok(())
            })
            .await?;
        info!(
            %execution_id,
            entries = updated.registered_compensations.len(),
            "saga unwind started"
        );

        let report = self
            .saga_runner
            .run(execution_id, &updated.registered_compensations, trace_id)
            .await;
        let status = report.status;

        self.store
            .update(execution_id, |r| {
                for outcome in &report.outcomes {
                    if outcome.success {
                        if let Ok(step) = r.step_state_mut(&outcome.step_id) {
                            if step.status == StepStatus::Completed {
                                step.status = StepStatus::Compensated;
                            }
                        }
                    }
                }
                r.compensation_status = Some(status);
                Ok(())
            })
            .await?;

        let _ = self
            .events
            .publish(EngineEvent::CompensationFinished {
                execution_id,
                status,
            })
            .await;
        if status == CompensationStatus::PartiallyCompensated {
            warn!(%execution_id, "saga only partially compensated");
            let _ = self
                .events
                .publish(EngineEvent::InterventionRequired {
                    execution_id,
                    reason: "saga compensation partially failed".to_string(),
                })
                .await;
        }

        Ok(SegmentOutcome::Compensated { status })
    }
}
