//! LLM correction contract
//!
//! The language-model client is an external collaborator. The engine only
//! sees this capability: given a failed call, propose corrected parameters
//! with a cost estimate the budget can be checked against.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineResult;
use crate::execution::TokenUsage;
use crate::tool::{ToolCall, ToolSchema};

/// A proposed correction for a failed tool call
#[derive(Debug, Clone)]
pub struct CorrectionProposal {
    /// Corrected parameters to retry with
    pub params: Value,
    /// Actual cost of producing the proposal
    pub cost_usd: f64,
    /// Tokens consumed
    pub tokens: TokenUsage,
}

/// Capability that proposes corrections for failed tool calls
#[async_trait]
pub trait Corrector: Send + Sync {
    /// Conservative per-call cost estimate, asserted against the budget
    /// before the call is made
    fn estimated_cost_usd(&self) -> f64;

    /// Propose corrected parameters for a failed call
    async fn correct(
        &self,
        call: &ToolCall,
        error: &str,
        schema: &ToolSchema,
    ) -> EngineResult<CorrectionProposal>;
}
