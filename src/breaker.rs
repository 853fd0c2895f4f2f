//! Correction-loop circuit breaker
//!
//! Bounds LLM-based correction attempts per `(execution, step)`: a sliding
//! window of attempt timestamps in a sorted set, and a circuit record that
//! trips open once the window overflows. After the open period a single
//! half-open trial is permitted.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::BreakerConfig;
use crate::error::EngineResult;
use crate::execution::ExecutionId;
use crate::storage::kv::{now_ms, KeyValueStoreExt, SetOptions};
use crate::storage::KeyValueStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum CircuitPhase {
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CircuitRecord {
    phase: CircuitPhase,
    open_until_ms: u64,
}

/// Outcome of a breaker evaluation
#[derive(Debug, Clone, Copy)]
pub struct BreakerDecision {
    /// Whether a correction call may proceed
    pub allowed: bool,
    /// Whether the circuit is open
    pub circuit_broken: bool,
    /// Whether this is the single half-open trial
    pub half_open: bool,
    /// Attempts currently inside the window
    pub attempts_in_window: u64,
}

/// Sliding-window breaker for correction calls
pub struct CorrectionBreaker {
    kv: Arc<dyn KeyValueStore>,
    config: BreakerConfig,
}

impl CorrectionBreaker {
    /// Create a breaker over the given store
    pub fn new(kv: Arc<dyn KeyValueStore>, config: BreakerConfig) -> Self {
        Self { kv, config }
    }

    fn window_key(execution_id: ExecutionId, step_id: &str) -> String {
        format!("llm:window:{}:{}", execution_id, step_id)
    }

    fn circuit_key(execution_id: ExecutionId, step_id: &str) -> String {
        format!("llm:circuit:{}:{}", execution_id, step_id)
    }

    /// Evaluate whether a correction call may proceed
    pub async fn evaluate(
        &self,
        execution_id: ExecutionId,
        step_id: &str,
    ) -> EngineResult<BreakerDecision> {
        let now = now_ms();
        let circuit_key = Self::circuit_key(execution_id, step_id);

        if let Some(circuit) = self.kv.get_json::<CircuitRecord>(&circuit_key).await? {
            match circuit.phase {
                CircuitPhase::Open if now < circuit.open_until_ms => {
                    return Ok(BreakerDecision {
                        allowed: false,
                        circuit_broken: true,
                        half_open: false,
                        attempts_in_window: self.window_count(execution_id, step_id, now).await?,
                    });
                }
                CircuitPhase::Open => {
                    // Open period elapsed: permit one half-open trial.
                    let half_open = CircuitRecord {
                        phase: CircuitPhase::HalfOpen,
                        open_until_ms: circuit.open_until_ms,
                    };
                    self.kv
                        .set_json(
                            &circuit_key,
                            &half_open,
                            SetOptions::with_ttl(Duration::from_millis(self.config.open_ms * 2)),
                        )
                        .await?;
                    debug!(%execution_id, step_id, "correction circuit half-open");
                    return Ok(BreakerDecision {
                        allowed: true,
                        circuit_broken: false,
                        half_open: true,
                        attempts_in_window: 0,
                    });
                }
                CircuitPhase::HalfOpen => {
                    // The trial is already out; stay closed to callers.
                    return Ok(BreakerDecision {
                        allowed: false,
                        circuit_broken: true,
                        half_open: false,
                        attempts_in_window: self.window_count(execution_id, step_id, now).await?,
                    });
                }
            }
        }

        let attempts = self.window_count(execution_id, step_id, now).await?;
        if attempts >= self.config.max_attempts as u64 {
            let circuit = CircuitRecord {
                phase: CircuitPhase::Open,
                open_until_ms: now + self.config.open_ms,
            };
            self.kv
                .set_json(
                    &circuit_key,
                    &circuit,
                    SetOptions::with_ttl(Duration::from_millis(self.config.open_ms * 2)),
                )
                .await?;
            metrics::counter!("orka_breaker_trips_total").increment(1);
            warn!(%execution_id, step_id, attempts, "correction circuit tripped");
            return Ok(BreakerDecision {
                allowed: false,
                circuit_broken: true,
                half_open: false,
                attempts_in_window: attempts,
            });
        }

        Ok(BreakerDecision {
            allowed: true,
            circuit_broken: false,
            half_open: false,
            attempts_in_window: attempts,
        })
    }

    async fn window_count(
        &self,
        execution_id: ExecutionId,
        step_id: &str,
        now: u64,
    ) -> EngineResult<u64> {
        let window_key = Self::window_key(execution_id, step_id);
        let cutoff = now.saturating_sub(self.config.window_ms);
        if cutoff > 0 {
            self.kv
                .zremrangebyscore(&window_key, 0.0, cutoff as f64 - 1.0)
                .await?;
        }
        self.kv.zcard(&window_key).await
    }

    /// Record a correction attempt at the current time
    pub async fn record_attempt(
        &self,
        execution_id: ExecutionId,
        step_id: &str,
    ) -> EngineResult<()> {
        let now = now_ms();
        let window_key = Self::window_key(execution_id, step_id);
        self.kv
            .zadd(&window_key, &format!("attempt-{}", now), now as f64)
            .await?;
        self.kv
            .expire(&window_key, Duration::from_millis(self.config.window_ms * 2))
            .await?;
        Ok(())
    }

    /// Reset after a successful retry: window and circuit are cleared
    pub async fn on_success(&self, execution_id: ExecutionId, step_id: &str) -> EngineResult<()> {
        self.kv.del(&Self::window_key(execution_id, step_id)).await?;
        self.kv.del(&Self::circuit_key(execution_id, step_id)).await?;
        Ok(())
    }

    /// Report a failed correction; a failed half-open trial re-opens
    pub async fn on_failure(&self, execution_id: ExecutionId, step_id: &str) -> EngineResult<()> {
        let circuit_key = Self::circuit_key(execution_id, step_id);
        if let Some(circuit) = self.kv.get_json::<CircuitRecord>(&circuit_key).await? {
            if circuit.phase == CircuitPhase::HalfOpen {
                let reopened = CircuitRecord {
                    phase: CircuitPhase::Open,
                    open_until_ms: now_ms() + self.config.open_ms,
                };
                self.kv
                    .set_json(
                        &circuit_key,
                        &reopened,
                        SetOptions::with_ttl(Duration::from_millis(self.config.open_ms * 2)),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}
