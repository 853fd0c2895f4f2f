//! Human-in-the-loop confirmation
//!
//! High-risk steps suspend the workflow behind a short-lived, single-use
//! token. The token record is the forward index; a reverse index by
//! execution id lets operators find the pending token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{ConfirmationConfig, RiskConfig};
use crate::error::{EngineError, EngineResult};
use crate::execution::ExecutionId;
use crate::storage::kv::{now_ms, KeyValueStoreExt, SetOptions};
use crate::storage::KeyValueStore;
use crate::tool::{ToolCategory, ToolDescriptor};

/// Deterministic risk class of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskClass {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskClass {
    /// Whether the engine must suspend for human confirmation
    pub fn requires_confirmation(self) -> bool {
        matches!(self, RiskClass::High | RiskClass::Critical)
    }
}

/// Classify a call's risk from the tool category and parameters
pub fn classify_risk(config: &RiskConfig, descriptor: &ToolDescriptor, params: &Value) -> RiskClass {
    match descriptor.category {
        ToolCategory::Payment => {
            let amount = params
                .get("amount")
                .or_else(|| params.get("depositAmount"))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            if amount > config.critical_payment_usd {
                RiskClass::Critical
            } else if amount > config.high_payment_usd {
                RiskClass::High
            } else {
                RiskClass::Medium
            }
        }
        ToolCategory::Booking => {
            let party_size = params.get("partySize").and_then(|v| v.as_u64()).unwrap_or(0);
            if party_size > config.high_party_size {
                RiskClass::High
            } else {
                RiskClass::Medium
            }
        }
        ToolCategory::Communication => RiskClass::Medium,
        ToolCategory::ReadOnly => RiskClass::Low,
    }
}

/// Durable token record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationRecord {
    /// Token value
    pub token: String,
    /// Suspended execution
    pub execution_id: ExecutionId,
    /// Step waiting on confirmation
    pub step_id: String,
    /// Tool the step would invoke
    pub tool: String,
    /// Resolved parameters at suspension time
    pub params: Value,
    /// Risk that forced the suspension
    pub risk: RiskClass,
    /// Identity the token is bound to, when known
    #[serde(default)]
    pub user_id: Option<String>,
    /// Expiry instant
    pub expires_at: DateTime<Utc>,
    /// Human-readable reason
    pub reason: String,
}

/// Outgoing confirmation-request signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    /// Token to present back
    pub token: String,
    /// Risk class
    pub risk: RiskClass,
    /// Expiry instant
    pub expires_at: DateTime<Utc>,
    /// Human-readable reason
    pub reason: String,
}

/// Mints, validates, and consumes confirmation tokens
pub struct ConfirmationManager {
    kv: Arc<dyn KeyValueStore>,
    config: ConfirmationConfig,
}

impl ConfirmationManager {
    /// Create a manager over the given store
    pub fn new(kv: Arc<dyn KeyValueStore>, config: ConfirmationConfig) -> Self {
        Self { kv, config }
    }

    fn token_key(token: &str) -> String {
        format!("confirmation:{}", token)
    }

    fn reverse_key(execution_id: ExecutionId) -> String {
        format!("confirmation:exec:{}", execution_id)
    }

    /// Mint a token for a suspended step
    #[allow(clippy::too_many_arguments)]
    pub async fn mint(
        &self,
        execution_id: ExecutionId,
        step_id: &str,
        tool: &str,
        params: &Value,
        risk: RiskClass,
        user_id: Option<&str>,
        reason: &str,
    ) -> EngineResult<ConfirmationRequest> {
        let token = Uuid::new_v4().to_string();
        let ttl = Duration::from_millis(self.config.token_ttl_ms);
        let expires_at = Utc::now() + chrono::Duration::milliseconds(self.config.token_ttl_ms as i64);

        let record = ConfirmationRecord {
            token: token.clone(),
            execution_id,
            step_id: step_id.to_string(),
            tool: tool.to_string(),
            params: params.clone(),
            risk,
            user_id: user_id.map(String::from),
            expires_at,
            reason: reason.to_string(),
        };

        // Records outlive their logical expiry so expired presentations can
        // be told apart from unknown tokens.
        let storage_ttl = ttl * 2;
        self.kv
            .set_json(&Self::token_key(&token), &record, SetOptions::with_ttl(storage_ttl))
            .await?;
        self.kv
            .set(
                &Self::reverse_key(execution_id),
                token.as_bytes(),
                SetOptions::with_ttl(storage_ttl),
            )
            .await?;

        info!(%execution_id, step_id, ?risk, "confirmation token minted");
        Ok(ConfirmationRequest {
            token,
            risk,
            expires_at,
            reason: reason.to_string(),
        })
    }

    /// Validate and consume a token; single use
    pub async fn consume(
        &self,
        token: &str,
        identity: Option<&str>,
    ) -> EngineResult<ConfirmationRecord> {
        let key = Self::token_key(token);
        let record: ConfirmationRecord = self
            .kv
            .get_json(&key)
            .await?
            .ok_or(EngineError::ConfirmationTokenNotFound)?;

        if now_ms() > record.expires_at.timestamp_millis().max(0) as u64 {
            self.kv.del(&key).await?;
            self.kv.del(&Self::reverse_key(record.execution_id)).await?;
            return Err(EngineError::ConfirmationTokenExpired);
        }

        if let (Some(bound), Some(presented)) = (record.user_id.as_deref(), identity) {
            if bound != presented {
                // Mismatch must not consume or mutate anything.
                return Err(EngineError::ConfirmationIdentityMismatch);
            }
        }

        self.kv.del(&key).await?;
        self.kv.del(&Self::reverse_key(record.execution_id)).await?;
        debug!(execution_id = %record.execution_id, "confirmation token consumed");
        Ok(record)
    }

    /// Pending token for an execution, if any
    pub async fn pending_token(&self, execution_id: ExecutionId) -> EngineResult<Option<String>> {
        match self.kv.get(&Self::reverse_key(execution_id)).await? {
            Some(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKv;
    use crate::tool::{ToolCategory, ToolDescriptor, ToolSchema};
    use serde_json::json;

    fn descriptor(category: ToolCategory) -> ToolDescriptor {
        ToolDescriptor::new("t", "1.0.0", ToolSchema::default(), category)
    }

    #[test]
    fn risk_thresholds() {
        let config = RiskConfig::default();
        assert_eq!(
            classify_risk(&config, &descriptor(ToolCategory::Payment), &json!({"amount": 750.0})),
            RiskClass::Critical
        );
        assert_eq!(
            classify_risk(&config, &descriptor(ToolCategory::Payment), &json!({"amount": 150.0})),
            RiskClass::High
        );
        assert_eq!(
            classify_risk(&config, &descriptor(ToolCategory::Payment), &json!({"amount": 20.0})),
            RiskClass::Medium
        );
        assert_eq!(
            classify_risk(&config, &descriptor(ToolCategory::Booking), &json!({"partySize": 10})),
            RiskClass::High
        );
        assert_eq!(
            classify_risk(&config, &descriptor(ToolCategory::Booking), &json!({"partySize": 4})),
            RiskClass::Medium
        );
        assert_eq!(
            classify_risk(&config, &descriptor(ToolCategory::ReadOnly), &json!({})),
            RiskClass::Low
        );
    }

    fn manager() -> ConfirmationManager {
        ConfirmationManager::new(Arc::new(MemoryKv::new()), ConfirmationConfig::default())
    }

    #[tokio::test]
    async fn mint_consume_roundtrip() {
        let manager = manager();
        let execution_id = ExecutionId::new();
        let request = manager
            .mint(
                execution_id,
                "step-1",
                "capture_payment",
                &json!({"amount": 600.0}),
                RiskClass::Critical,
                Some("u1"),
                "large payment",
            )
            .await
            .unwrap();

        assert_eq!(
            manager.pending_token(execution_id).await.unwrap().unwrap(),
            request.token
        );

        let record = manager.consume(&request.token, Some("u1")).await.unwrap();
        assert_eq!(record.step_id, "step-1");
        assert_eq!(record.execution_id, execution_id);

        // Single use.
        let err = manager.consume(&request.token, Some("u1")).await.unwrap_err();
        assert!(matches!(err, EngineError::ConfirmationTokenNotFound));
    }

    #[tokio::test]
    async fn identity_mismatch_leaves_token_intact() {
        let manager = manager();
        let execution_id = ExecutionId::new();
        let request = manager
            .mint(
                execution_id,
                "step-1",
                "capture_payment",
                &json!({"amount": 600.0}),
                RiskClass::Critical,
                Some("u1"),
                "large payment",
            )
            .await
            .unwrap();

        let err = manager.consume(&request.token, Some("intruder")).await.unwrap_err();
        assert!(matches!(err, EngineError::ConfirmationIdentityMismatch));

        // Token still valid for the right identity.
        assert!(manager.consume(&request.token, Some("u1")).await.is_ok());
    }

    #[tokio::test]
    async fn expired_token_reports_expired() {
        let kv = Arc::new(MemoryKv::new());
        let manager = ConfirmationManager::new(kv, ConfirmationConfig { token_ttl_ms: 20 });
        let request = manager
            .mint(
                ExecutionId::new(),
                "step-1",
                "t",
                &json!({}),
                RiskClass::High,
                None,
                "r",
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(25)).await;
        let err = manager.consume(&request.token, None).await.unwrap_err();
        assert!(matches!(err, EngineError::ConfirmationTokenExpired));
    }
}
