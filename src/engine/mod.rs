//! Workflow engine
//!
//! Drives execution plans across short-lived invocations: one *segment* of
//! forward progress per invocation, a durable checkpoint at every yield,
//! saga compensation on failure, and suspension behind confirmation tokens
//! for high-risk steps.
//!
//! The engine owns no I/O of its own. Tools, compensation lookup, event
//! fan-out, the resume queue, and the LLM corrector are capabilities
//! supplied at construction.

mod saga;
mod segment;
mod step;

use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::breaker::CorrectionBreaker;
use crate::cancel::CancelToken;
use crate::compensation::{CompensationResolver, CompensationTable, SagaRetryConfig, SagaRunner};
use crate::config::EngineConfig;
use crate::confirmation::ConfirmationManager;
use crate::corrector::Corrector;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventPublisher, NoopPublisher};
use crate::execution::{
    Budget, CompensationStatus, ExecutionId, ExecutionRecord, ExecutionStatus, StepStatus,
};
use crate::failover::FailoverPolicy;
use crate::idempotency::IdempotencyService;
use crate::locking::LockService;
use crate::occ::ExecutionStore;
use crate::plan::Plan;
use crate::queue::{
    InProcessQueue, MessageSigner, MessageVerifier, ResumeMessage, ResumeQueue,
    SignedResumeMessage,
};
use crate::replay::SnapshotStore;
use crate::resolver::DependencyResolver;
use crate::storage::KeyValueStore;
use crate::tool::{ToolInvoker, ToolRegistry};
use crate::verifier::PlanVerifier;

/// What a segment invocation produced
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentOutcome {
    /// Every step finished successfully
    Completed,
    /// Terminal failure without compensation
    Failed {
        /// Stable error code of the decisive failure
        code: String,
    },
    /// Checkpoint written, resume enqueued
    Yielded {
        /// Segment number of the upcoming invocation
        segment_number: u64,
        /// First step index the next segment will consider
        next_step_index: usize,
    },
    /// Suspended behind a confirmation token
    AwaitingConfirmation {
        /// Token to present on confirm
        token: String,
    },
    /// Suspended for an external reason
    Suspended {
        /// Why the engine refused to continue
        reason: String,
    },
    /// Saga unwound
    Compensated {
        /// Unwind result
        status: CompensationStatus,
    },
    /// Execution was cancelled
    Cancelled,
    /// Another invocation holds the workflow lock
    LockBusy,
}

/// Request to create a new execution
#[derive(Debug, Clone)]
pub struct CreateExecution {
    /// The frozen plan
    pub plan: Plan,
    /// User the workflow acts for
    pub user_id: String,
    /// Trace id for correlation
    pub trace_id: String,
    /// Intent lineage for re-planning
    pub intent_id: Option<String>,
    /// USD ceiling; defaults when absent
    pub budget: Option<Budget>,
    /// Extra context entries
    pub context: HashMap<String, Value>,
}

/// The workflow engine
pub struct SagaEngine {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<ExecutionStore>,
    pub(crate) locks: Arc<LockService>,
    pub(crate) idempotency: Arc<IdempotencyService>,
    pub(crate) resolver: DependencyResolver,
    pub(crate) plan_verifier: Arc<PlanVerifier>,
    pub(crate) breaker: Arc<CorrectionBreaker>,
    pub(crate) failover: FailoverPolicy,
    pub(crate) compensations: Arc<dyn CompensationResolver>,
    pub(crate) saga_runner: SagaRunner,
    pub(crate) registry: Arc<ToolRegistry>,
    pub(crate) invoker: Arc<dyn ToolInvoker>,
    pub(crate) corrector: Option<Arc<dyn Corrector>>,
    pub(crate) confirmations: Arc<ConfirmationManager>,
    pub(crate) queue: Arc<dyn ResumeQueue>,
    pub(crate) signer: Arc<MessageSigner>,
    pub(crate) message_verifier: Arc<MessageVerifier>,
    pub(crate) events: Arc<dyn EventPublisher>,
    pub(crate) snapshots: Arc<SnapshotStore>,
    pub(crate) active_cancels: DashMap<ExecutionId, CancelToken>,
}

/// Builder for [`SagaEngine`]
pub struct SagaEngineBuilder {
    kv: Arc<dyn KeyValueStore>,
    invoker: Arc<dyn ToolInvoker>,
    config: EngineConfig,
    registry: Arc<ToolRegistry>,
    compensations: Arc<dyn CompensationResolver>,
    events: Arc<dyn EventPublisher>,
    queue: Arc<dyn ResumeQueue>,
    corrector: Option<Arc<dyn Corrector>>,
    plan_verifier: Option<Arc<PlanVerifier>>,
    failover: FailoverPolicy,
    saga_retry: SagaRetryConfig,
    signing_seed: [u8; 32],
}

impl SagaEngineBuilder {
    /// Override the configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Supply the reflected tool registry
    pub fn registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Supply the compensation registry
    pub fn compensations(mut self, compensations: Arc<dyn CompensationResolver>) -> Self {
        self.compensations = compensations;
        self
    }

    /// Supply the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    /// Supply the durable resume queue
    pub fn queue(mut self, queue: Arc<dyn ResumeQueue>) -> Self {
        self.queue = queue;
        self
    }

    /// Supply the LLM corrector
    pub fn corrector(mut self, corrector: Arc<dyn Corrector>) -> Self {
        self.corrector = Some(corrector);
        self
    }

    /// Supply a customised plan verifier
    pub fn plan_verifier(mut self, verifier: Arc<PlanVerifier>) -> Self {
        self.plan_verifier = Some(verifier);
        self
    }

    /// Override the failover policy table
    pub fn failover(mut self, policy: FailoverPolicy) -> Self {
        self.failover = policy;
        self
    }

    /// Override saga retry behaviour
    pub fn saga_retry(mut self, config: SagaRetryConfig) -> Self {
        self.saga_retry = config;
        self
    }

    /// Key material for resume-message signing
    pub fn signing_seed(mut self, seed: [u8; 32]) -> Self {
        self.signing_seed = seed;
        self
    }

    /// Wire everything together
    pub fn build(self) -> SagaEngine {
        let signer = Arc::new(MessageSigner::from_seed(self.signing_seed));
        let message_verifier = Arc::new(MessageVerifier::new(signer.verifying_key()));
        let plan_verifier = self
            .plan_verifier
            .unwrap_or_else(|| Arc::new(PlanVerifier::new(self.registry.clone())));

        SagaEngine {
            store: Arc::new(ExecutionStore::new(self.kv.clone(), self.config.occ.clone())),
            locks: Arc::new(LockService::new(self.kv.clone(), self.config.lock.clone())),
            idempotency: Arc::new(IdempotencyService::new(
                self.kv.clone(),
                self.config.idempotency.clone(),
            )),
            resolver: DependencyResolver::new(self.config.segment.default_step_estimate_ms),
            plan_verifier,
            breaker: Arc::new(CorrectionBreaker::new(
                self.kv.clone(),
                self.config.breaker.clone(),
            )),
            failover: self.failover,
            compensations: self.compensations,
            saga_runner: SagaRunner::new(self.invoker.clone(), self.saga_retry),
            registry: self.registry,
            invoker: self.invoker,
            corrector: self.corrector,
            confirmations: Arc::new(ConfirmationManager::new(
                self.kv.clone(),
                self.config.confirmation.clone(),
            )),
            queue: self.queue,
            signer,
            message_verifier,
            events: self.events,
            snapshots: Arc::new(SnapshotStore::new(self.kv, self.config.snapshot.clone())),
            active_cancels: DashMap::new(),
            config: self.config,
        }
    }
}

impl SagaEngine {
    /// Start building an engine over a store and tool invoker
    pub fn builder(kv: Arc<dyn KeyValueStore>, invoker: Arc<dyn ToolInvoker>) -> SagaEngineBuilder {
        SagaEngineBuilder {
            kv,
            invoker,
            config: EngineConfig::default(),
            registry: Arc::new(ToolRegistry::new()),
            compensations: Arc::new(CompensationTable::new()),
            events: Arc::new(NoopPublisher),
            queue: Arc::new(InProcessQueue::new()),
            corrector: None,
            plan_verifier: None,
            failover: FailoverPolicy::default(),
            saga_retry: SagaRetryConfig::default(),
            signing_seed: [0u8; 32],
        }
    }

    /// Signer used for resume messages; exposed so queue receivers and the
    /// reconciler share key material
    pub fn signer(&self) -> Arc<MessageSigner> {
        self.signer.clone()
    }

    /// Execution store handle
    pub fn store(&self) -> Arc<ExecutionStore> {
        self.store.clone()
    }

    /// Snapshot store handle
    pub fn snapshots(&self) -> Arc<SnapshotStore> {
        self.snapshots.clone()
    }

    /// Create a new execution with a frozen plan
    pub async fn create_execution(&self, request: CreateExecution) -> EngineResult<ExecutionId> {
        let mut record = ExecutionRecord::new(ExecutionId::new());
        record.set_context("user_id", Value::from(request.user_id));
        record.set_context("trace_id", Value::from(request.trace_id));
        for (key, value) in request.context {
            record.set_context(key, value);
        }
        record.intent_id = request.intent_id;
        if let Some(budget) = request.budget {
            record.budget = budget;
        }
        record.attach_plan(request.plan)?;
        self.store.create(&record).await?;
        info!(execution_id = %record.execution_id, steps = record.step_states.len(), "execution created");
        Ok(record.execution_id)
    }

    /// Execution status lookup
    pub async fn status(&self, execution_id: ExecutionId) -> EngineResult<ExecutionStatus> {
        let (record, _) = self.store.load(execution_id).await?;
        Ok(record.status)
    }

    /// Run one segment of forward progress
    pub async fn run_segment(
        &self,
        execution_id: ExecutionId,
        trace_id: &str,
    ) -> EngineResult<SegmentOutcome> {
        self.run_segment_reentrant(execution_id, trace_id, None).await
    }

    pub(crate) async fn run_segment_reentrant(
        &self,
        execution_id: ExecutionId,
        trace_id: &str,
        reentrancy_token: Option<&str>,
    ) -> EngineResult<SegmentOutcome> {
        let lock_key = format!("workflow:{}", execution_id);
        let ttl = Duration::from_millis(self.config.lock.ttl_ms);
        let handle = match self
            .locks
            .acquire(
                &lock_key,
                ttl,
                "run_segment",
                trace_id,
                &execution_id.to_string(),
                reentrancy_token,
            )
            .await
        {
            Ok(handle) => handle,
            Err(EngineError::LockContended(_)) => {
                // Another invocation is already making progress.
                return Ok(SegmentOutcome::LockBusy);
            }
            Err(e) => return Err(e),
        };

        let cancel = CancelToken::new();
        self.active_cancels.insert(execution_id, cancel.clone());

        let result = self.run_segment_locked(execution_id, trace_id, cancel).await;

        self.active_cancels.remove(&execution_id);
        if let Err(e) = handle.release().await {
            warn!(execution_id = %execution_id, error = %e, "lock release failed");
        }
        result
    }

    /// Resume from a signed queue message
    pub async fn resume(&self, signed: &SignedResumeMessage) -> EngineResult<SegmentOutcome> {
        let message = self.message_verifier.verify(signed)?;
        self.resume_verified(&message).await
    }

    pub(crate) async fn resume_verified(
        &self,
        message: &ResumeMessage,
    ) -> EngineResult<SegmentOutcome> {
        let (record, _) = self.store.load(message.execution_id).await?;

        if record.status.is_terminal() {
            return Ok(match record.status {
                ExecutionStatus::Completed => SegmentOutcome::Completed,
                ExecutionStatus::Cancelled => SegmentOutcome::Cancelled,
                _ => SegmentOutcome::Failed {
                    code: record
                        .context_str("failure")
                        .unwrap_or("UNKNOWN")
                        .to_string(),
                },
            });
        }

        // Tool drift gate: refuse to continue blindly against changed
        // schemas; the planner owns recovery from here.
        if let Some(drifted) = self.detect_schema_drift(&record) {
            self.store
                .update(message.execution_id, |r| {
                    r.transition_to(ExecutionStatus::Suspended)?;
                    r.set_context("suspend_reason", Value::from("SCHEMA_DRIFT"));
                    r.set_context("drifted_tool", Value::from(drifted.clone()));
                    Ok(())
                })
                .await?;
            let _ = self
                .events
                .publish(crate::events::EngineEvent::SchemaDriftDetected {
                    execution_id: message.execution_id,
                    tool: drifted.clone(),
                })
                .await;
            return Ok(SegmentOutcome::Suspended {
                reason: format!("SCHEMA_DRIFT:{}", drifted),
            });
        }

        self.run_segment(message.execution_id, &message.trace_id).await
    }

    fn detect_schema_drift(&self, record: &ExecutionRecord) -> Option<String> {
        if record.tool_versions.is_empty() {
            return None;
        }
        let current = self.registry.fingerprints();
        for (tool, snapshot) in &record.tool_versions {
            match current.get(tool) {
                Some(fingerprint) if fingerprint == snapshot => {}
                _ => return Some(tool.clone()),
            }
        }
        None
    }

    /// Confirm a suspended step and schedule its resumption
    pub async fn confirm(&self, token: &str, identity: Option<&str>) -> EngineResult<()> {
        let record = self.confirmations.consume(token, identity).await?;
        let execution_id = record.execution_id;
        let step_id = record.step_id.clone();

        let updated = self
            .store
            .update(execution_id, |r| {
                let step = r.step_state_mut(&step_id)?;
                step.status = StepStatus::Pending;
                step.confirmed = true;
                r.transition_to(ExecutionStatus::Executing)
            })
            .await?;

        let message = ResumeMessage {
            execution_id,
            segment_number: updated.segment_number,
            start_step_index: updated.checkpoint.as_ref().map(|c| c.next_step_index),
            trace_id: updated.context_str("trace_id").unwrap_or("confirm").to_string(),
        };
        let signed = self.signer.sign(message.clone())?;
        if let Err(e) = self
            .queue
            .publish(&signed, Duration::from_millis(self.config.segment.resume_delay_ms))
            .await
        {
            warn!(%execution_id, error = %e, "resume publish failed after confirm");
            let _ = self
                .events
                .publish(crate::events::EngineEvent::ResumeFallback { message })
                .await;
        }
        info!(%execution_id, step_id = %step_id, "step confirmed");
        Ok(())
    }

    /// Cancel an execution; allowed from Executing, Suspended, and
    /// AwaitingConfirmation
    pub async fn cancel(&self, execution_id: ExecutionId) -> EngineResult<()> {
        self.store
            .update(execution_id, |record| {
                match record.status {
                    ExecutionStatus::Executing
                    | ExecutionStatus::Suspended
                    | ExecutionStatus::AwaitingConfirmation => {
                        record.transition_to(ExecutionStatus::Cancelled)
                    }
                    other => Err(EngineError::InvalidStatusTransition {
                        from: other.to_string(),
                        to: ExecutionStatus::Cancelled.to_string(),
                    }),
                }
            })
            .await?;

        // In-flight steps in this process observe the cancellation.
        if let Some(cancel) = self.active_cancels.get(&execution_id) {
            cancel.cancel();
        }
        info!(%execution_id, "execution cancelled");
        Ok(())
    }
}
