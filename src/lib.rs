//! Durable saga workflow orchestrator for short-lived compute
//!
//! This crate provides a workflow engine that:
//! - Executes multi-step plans (DAGs of tool invocations) in bounded
//!   segments, yielding a durable checkpoint before each platform deadline
//! - Unwinds failed sagas through reverse-order, retried compensations
//! - Deduplicates tool calls, coordinates invocations through re-entrant
//!   distributed locks, and guards every durable write with optimistic
//!   version checks
//! - Bounds LLM correction loops with a per-execution budget and a
//!   sliding-window circuit breaker
//! - Suspends high-risk steps behind single-use confirmation tokens

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod breaker;
pub mod cancel;
pub mod compensation;
pub mod config;
pub mod confirmation;
pub mod corrector;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod failover;
pub mod idempotency;
pub mod locking;
pub mod matcher;
pub mod occ;
pub mod plan;
pub mod queue;
pub mod reconciler;
pub mod replay;
pub mod resolver;
pub mod storage;
pub mod telemetry;
pub mod tool;
pub mod verifier;

pub use breaker::{BreakerDecision, CorrectionBreaker};
pub use cancel::CancelToken;
pub use compensation::{CompensationResolver, CompensationTable, SagaRunner};
pub use config::EngineConfig;
pub use confirmation::{classify_risk, ConfirmationManager, RiskClass};
pub use corrector::{CorrectionProposal, Corrector};
pub use engine::{CreateExecution, SagaEngine, SegmentOutcome};
pub use error::{EngineError, EngineResult};
pub use events::{EngineEvent, EventBus, EventPublisher};
pub use execution::{
    Budget, CompensationStatus, ExecutionId, ExecutionRecord, ExecutionStatus, StepStatus,
    TokenUsage, YieldReason,
};
pub use failover::{classify_failure, FailoverPolicy, FailureReason, RecommendedAction};
pub use idempotency::IdempotencyService;
pub use locking::{LockHandle, LockService};
pub use occ::ExecutionStore;
pub use plan::{Plan, PlanStep};
pub use queue::{
    InProcessQueue, MessageSigner, MessageVerifier, ResumeMessage, ResumeQueue,
    SignedResumeMessage,
};
pub use reconciler::ZombieReconciler;
pub use replay::{compare_snapshots, Snapshot, SnapshotDiff, SnapshotStore};
pub use resolver::DependencyResolver;
pub use storage::{KeyValueStore, MemoryKv};
pub use tool::{
    CompensationDirective, ParamSpec, ParamType, ToolCall, ToolCategory, ToolDescriptor,
    ToolInvoker, ToolOutcome, ToolRegistry, ToolSchema,
};
pub use verifier::PlanVerifier;

#[cfg(feature = "storage")]
pub use storage::SledKv;
