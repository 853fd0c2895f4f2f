//! Zombie reconciliation
//!
//! A cadence-driven scan over the active-executions set. Records stuck in
//! `Executing` past the staleness threshold are re-triggered through the
//! resume queue; after the re-trigger budget they are failed and escalated.

use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::ReconcilerConfig;
use crate::error::EngineResult;
use crate::events::{EngineEvent, EventPublisher};
use crate::execution::{ExecutionId, ExecutionStatus};
use crate::occ::ExecutionStore;
use crate::queue::{MessageSigner, ResumeMessage, ResumeQueue};
use crate::storage::kv::now_ms;

const RETRIGGER_CONTEXT_KEY: &str = "dlq_retriggers";

/// Result of one reconciliation pass
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileReport {
    /// Active records examined
    pub scanned: usize,
    /// Zombies found
    pub zombies: usize,
    /// Resume messages re-enqueued
    pub retriggered: usize,
    /// Records failed and escalated
    pub escalated: usize,
}

/// Detects and revives (or escalates) zombie workflows
pub struct ZombieReconciler {
    store: Arc<ExecutionStore>,
    queue: Arc<dyn ResumeQueue>,
    signer: Arc<MessageSigner>,
    events: Arc<dyn EventPublisher>,
    config: ReconcilerConfig,
}

impl ZombieReconciler {
    /// Create a reconciler
    pub fn new(
        store: Arc<ExecutionStore>,
        queue: Arc<dyn ResumeQueue>,
        signer: Arc<MessageSigner>,
        events: Arc<dyn EventPublisher>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            signer,
            events,
            config,
        }
    }

    /// Scan the active set once
    pub async fn scan(&self) -> EngineResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for id in self.store.active_executions().await? {
            report.scanned += 1;
            let Some(record) = self.store.try_load(id).await? else {
                // Record expired; drop the dangling membership.
                self.store.retire(id).await?;
                continue;
            };

            if record.status != ExecutionStatus::Executing {
                if record.status.is_terminal() {
                    self.store.retire(id).await?;
                }
                continue;
            }

            let age_ms = now_ms().saturating_sub(record.updated_at.timestamp_millis().max(0) as u64);
            if age_ms < self.config.zombie_after_ms {
                continue;
            }
            report.zombies += 1;
            metrics::counter!("orka_zombies_detected_total").increment(1);

            let retriggers = record
                .context
                .get(RETRIGGER_CONTEXT_KEY)
                .and_then(Value::as_u64)
                .unwrap_or(0);

            if retriggers < self.config.max_retriggers as u64 {
                self.retrigger(id, retriggers).await?;
                report.retriggered += 1;
            } else {
                self.escalate(id).await?;
                report.escalated += 1;
            }
        }

        Ok(report)
    }

    async fn retrigger(&self, id: ExecutionId, retriggers: u64) -> EngineResult<()> {
        let updated = self
            .store
            .update(id, |record| {
                record.set_context(RETRIGGER_CONTEXT_KEY, Value::from(retriggers + 1));
                Ok(())
            })
            .await?;

        let message = ResumeMessage {
            execution_id: id,
            segment_number: updated.segment_number,
            start_step_index: updated.checkpoint.as_ref().map(|c| c.next_step_index),
            trace_id: updated
                .context_str("trace_id")
                .unwrap_or("reconciler")
                .to_string(),
        };
        let signed = self.signer.sign(message.clone())?;
        if let Err(e) = self.queue.publish(&signed, std::time::Duration::ZERO).await {
            warn!(execution_id = %id, error = %e, "re-trigger publish failed");
            let _ = self
                .events
                .publish(EngineEvent::ResumeFallback { message })
                .await;
        }
        info!(execution_id = %id, retriggers = retriggers + 1, "zombie re-triggered");
        Ok(())
    }

    async fn escalate(&self, id: ExecutionId) -> EngineResult<()> {
        self.store
            .update(id, |record| {
                record.transition_to(ExecutionStatus::Failed)?;
                record.set_context("failure", Value::from("REQUIRES_INTERVENTION"));
                Ok(())
            })
            .await?;
        let _ = self
            .events
            .publish(EngineEvent::InterventionRequired {
                execution_id: id,
                reason: "zombie workflow exhausted resume re-triggers".to_string(),
            })
            .await;
        warn!(execution_id = %id, "zombie escalated to intervention");
        Ok(())
    }
}
