//! Error types for the orchestrator

use thiserror::Error;

/// Result type for orchestrator operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Error types surfaced by the orchestrator core
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// Plan failed deterministic verification
    #[error("Plan validation failed: {0}")]
    PlanValidationFailed(String),

    /// Plan dependency graph contains a cycle
    #[error("Plan contains a circular dependency: {0}")]
    CircularDependency(String),

    /// Plan contains a forbidden tool sequence
    #[error("Forbidden tool sequence: {0}")]
    ForbiddenSequence(String),

    /// A plan parameter exceeds its configured bound
    #[error("Parameter limit exceeded: {0}")]
    ParameterLimitExceeded(String),

    /// Step parameters failed schema validation
    #[error("Parameter validation failed: {0}")]
    ValidationFailed(String),

    /// Tool invocation returned a failure
    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    /// Tool invocation exceeded its deadline
    #[error("Tool call timed out: {0}")]
    ToolTimeout(String),

    /// Step execution failed outside the tool call itself
    #[error("Step execution failed: {0}")]
    StepExecutionFailed(String),

    /// Correction call timed out
    #[error("Correction call timed out")]
    LlmTimeout,

    /// Correction output failed schema validation
    #[error("Correction output failed validation: {0}")]
    LlmSchemaValidationFailed(String),

    /// Correction request failed
    #[error("Correction request failed: {0}")]
    LlmRequestFailed(String),

    /// Correction circuit is open for this step
    #[error("Correction circuit open: {0}")]
    CircuitBroken(String),

    /// Projected cost would breach the execution budget
    #[error("Budget exceeded: current ${current:.4} + estimated ${estimated:.4} > limit ${limit:.4}")]
    BudgetExceeded {
        current: f64,
        estimated: f64,
        limit: f64,
    },

    /// Optimistic write observed a stale version
    #[error("Version conflict: observed version {0}")]
    Conflict(u64),

    /// Rebase retries exhausted
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Lock mutation attempted by a non-owner
    #[error("Lock owner mismatch: {0}")]
    OwnerMismatch(String),

    /// Lock is held by another owner
    #[error("Lock contended: {0}")]
    LockContended(String),

    /// One or more compensations failed
    #[error("Compensation failed: {0}")]
    CompensationFailed(String),

    /// Saga could not be unwound automatically
    #[error("Manual intervention required: {0}")]
    ManualInterventionRequired(String),

    /// Confirmation token does not exist
    #[error("Confirmation token not found")]
    ConfirmationTokenNotFound,

    /// Confirmation token has expired
    #[error("Confirmation token expired")]
    ConfirmationTokenExpired,

    /// Confirmation identity does not match the token
    #[error("Confirmation identity mismatch")]
    ConfirmationIdentityMismatch,

    /// A participating tool changed across a yield
    #[error("Tool schema drift: {0}")]
    SchemaDrift(String),

    /// Execution status transition not in the allowed graph
    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    /// Execution record not found
    #[error("Execution {0} not found")]
    ExecutionNotFound(String),

    /// Key-value storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Encoding or decoding error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Durable queue publish failed
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    /// Queue message signature rejected
    #[error("Invalid message signature: {0}")]
    SignatureInvalid(String),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable code persisted with failed records
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::PlanValidationFailed(_) => "PLAN_VALIDATION_FAILED",
            EngineError::CircularDependency(_) => "PLAN_CIRCULAR_DEPENDENCY",
            EngineError::ForbiddenSequence(_) => "FORBIDDEN_SEQUENCE",
            EngineError::ParameterLimitExceeded(_) => "PARAMETER_LIMIT_EXCEEDED",
            EngineError::ValidationFailed(_) => "VALIDATION_FAILED",
            EngineError::ToolExecutionFailed(_) => "TOOL_EXECUTION_FAILED",
            EngineError::ToolTimeout(_) => "TOOL_TIMEOUT",
            EngineError::StepExecutionFailed(_) => "STEP_EXECUTION_FAILED",
            EngineError::LlmTimeout => "LLM_TIMEOUT",
            EngineError::LlmSchemaValidationFailed(_) => "LLM_SCHEMA_VALIDATION_FAILED",
            EngineError::LlmRequestFailed(_) => "LLM_REQUEST_FAILED",
            EngineError::CircuitBroken(_) => "LLM_CIRCUIT_BROKEN",
            EngineError::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            EngineError::Conflict(_) => "CONFLICT",
            EngineError::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            EngineError::OwnerMismatch(_) => "OWNER_MISMATCH",
            EngineError::LockContended(_) => "LOCK_CONTENDED",
            EngineError::CompensationFailed(_) => "COMPENSATION_FAILED",
            EngineError::ManualInterventionRequired(_) => "SAGA_MANUAL_INTERVENTION_REQUIRED",
            EngineError::ConfirmationTokenNotFound => "CONFIRMATION_TOKEN_NOT_FOUND",
            EngineError::ConfirmationTokenExpired => "CONFIRMATION_TOKEN_EXPIRED",
            EngineError::ConfirmationIdentityMismatch => "CONFIRMATION_IDENTITY_MISMATCH",
            EngineError::SchemaDrift(_) => "SCHEMA_DRIFT",
            EngineError::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
            EngineError::ExecutionNotFound(_) => "EXECUTION_NOT_FOUND",
            EngineError::Storage(_) => "STORAGE_ERROR",
            EngineError::Serialization(_) => "SERIALIZATION_ERROR",
            EngineError::QueueUnavailable(_) => "QUEUE_UNAVAILABLE",
            EngineError::SignatureInvalid(_) => "SIGNATURE_INVALID",
            EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Short human-readable message for the system boundary
    ///
    /// Internal codes stay in the persisted record; this is what users see.
    pub fn user_message(&self) -> &'static str {
        match self {
            EngineError::PlanValidationFailed(_)
            | EngineError::CircularDependency(_)
            | EngineError::ForbiddenSequence(_)
            | EngineError::ParameterLimitExceeded(_)
            | EngineError::ValidationFailed(_) => "The request could not be planned as written.",
            EngineError::BudgetExceeded { .. } => "The cost limit for this request was reached.",
            EngineError::ConfirmationTokenNotFound
            | EngineError::ConfirmationTokenExpired
            | EngineError::ConfirmationIdentityMismatch => {
                "The confirmation link is no longer valid."
            }
            EngineError::CompensationFailed(_) | EngineError::ManualInterventionRequired(_) => {
                "Something went wrong and part of the request needs attention."
            }
            EngineError::ToolTimeout(_) | EngineError::LlmTimeout => {
                "A downstream service took too long to respond."
            }
            _ => "Something went wrong while processing the request.",
        }
    }

    /// Whether the error is transient from the caller's point of view
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ToolTimeout(_)
                | EngineError::ToolExecutionFailed(_)
                | EngineError::Conflict(_)
                | EngineError::Storage(_)
                | EngineError::QueueUnavailable(_)
                | EngineError::LlmTimeout
                | EngineError::LlmRequestFailed(_)
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}
