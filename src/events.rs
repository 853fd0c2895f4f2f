//! Engine event sidecar
//!
//! Outgoing signals (confirmation requests, intervention alerts, resume
//! fallbacks) flow through a publisher capability. The channel-backed bus
//! is the in-process implementation; deployments bridge it to their pub/sub
//! fan-out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::confirmation::ConfirmationRequest;
use crate::error::{EngineError, EngineResult};
use crate::execution::{CompensationStatus, ExecutionId, YieldReason};
use crate::failover::RecommendedAction;
use crate::queue::ResumeMessage;

/// Signals emitted by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A step suspended behind a confirmation token
    ConfirmationRequested {
        execution_id: ExecutionId,
        request: ConfirmationRequest,
    },
    /// A saga needs human attention
    InterventionRequired {
        execution_id: ExecutionId,
        reason: String,
    },
    /// Queue publish failed; pub/sub carries the resume instead
    ResumeFallback {
        message: ResumeMessage,
    },
    /// A checkpoint was written
    CheckpointWritten {
        execution_id: ExecutionId,
        segment_number: u64,
        reason: YieldReason,
    },
    /// Terminal success
    ExecutionCompleted {
        execution_id: ExecutionId,
    },
    /// Terminal failure
    ExecutionFailed {
        execution_id: ExecutionId,
        error_code: String,
    },
    /// Saga unwind finished
    CompensationFinished {
        execution_id: ExecutionId,
        status: CompensationStatus,
    },
    /// A participating tool changed across a yield
    SchemaDriftDetected {
        execution_id: ExecutionId,
        tool: String,
    },
    /// Failover produced suggestions instead of a retry
    SuggestionsIssued {
        execution_id: ExecutionId,
        step_id: String,
        action: RecommendedAction,
    },
}

/// Capability that publishes engine events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event; failures are the publisher's concern
    async fn publish(&self, event: EngineEvent) -> EngineResult<()>;
}

/// Channel-backed event bus
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus and its receiving end
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, event: EngineEvent) -> EngineResult<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| EngineError::Internal("event channel closed".into()))
    }
}

/// Publisher that drops events; for deployments without a fan-out
#[derive(Default, Clone, Copy)]
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, event: EngineEvent) -> EngineResult<()> {
        warn!(?event, "event dropped: no publisher configured");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bus_delivers_events() {
        let (bus, mut rx) = EventBus::channel(8);
        let execution_id = ExecutionId::new();
        bus.publish(EngineEvent::ExecutionCompleted { execution_id })
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            EngineEvent::ExecutionCompleted { execution_id: got } => {
                assert_eq!(got, execution_id);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
