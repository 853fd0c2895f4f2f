//! Engine configuration
//!
//! Provides nested configuration with documented defaults, validation, and
//! environment-based overrides.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Segment timing and batching
    pub segment: SegmentConfig,
    /// Distributed lock behaviour
    pub lock: LockConfig,
    /// Optimistic concurrency control
    pub occ: OccConfig,
    /// Correction-loop circuit breaker
    pub breaker: BreakerConfig,
    /// Risk classification thresholds
    pub risk: RiskConfig,
    /// Confirmation tokens
    pub confirmation: ConfirmationConfig,
    /// Idempotency markers
    pub idempotency: IdempotencyConfig,
    /// Zombie reconciliation
    pub reconciler: ReconcilerConfig,
    /// Snapshot capture
    pub snapshot: SnapshotConfig,
}

impl EngineConfig {
    /// Load defaults and apply `ORKA_*` environment overrides
    pub fn from_env() -> EngineResult<Self> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("ORKA_SEGMENT_TIMEOUT_MS") {
            config.segment.step_timeout_ms = val
                .parse()
                .map_err(|_| EngineError::Internal("ORKA_SEGMENT_TIMEOUT_MS not numeric".into()))?;
        }
        if let Ok(val) = std::env::var("ORKA_MAX_BATCH") {
            config.segment.max_batch = val
                .parse()
                .map_err(|_| EngineError::Internal("ORKA_MAX_BATCH not numeric".into()))?;
        }
        if let Ok(val) = std::env::var("ORKA_LOCK_TTL_MS") {
            config.lock.ttl_ms = val
                .parse()
                .map_err(|_| EngineError::Internal("ORKA_LOCK_TTL_MS not numeric".into()))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> EngineResult<()> {
        self.segment.validate()?;
        self.occ.validate()?;
        self.breaker.validate()?;
        Ok(())
    }
}

/// Segment loop timing and batching
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Wall-clock budget after which yield checks begin
    pub min_yield_check_ms: u64,
    /// Checkpoint threshold for the yield predicate
    pub checkpoint_threshold_ms: u64,
    /// Safety margin added to the checkpoint threshold
    pub yield_buffer_ms: u64,
    /// Hard per-tool-call deadline
    pub step_timeout_ms: u64,
    /// Maximum ready steps executed concurrently per batch
    pub max_batch: usize,
    /// Default latency estimate for steps that declare none
    pub default_step_estimate_ms: u64,
    /// Delay applied to resume messages
    pub resume_delay_ms: u64,
    /// Conservative USD overhead asserted against the budget before a
    /// segment starts
    pub overhead_estimate_usd: f64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            min_yield_check_ms: 4_000,
            checkpoint_threshold_ms: 6_000,
            yield_buffer_ms: 1_500,
            step_timeout_ms: 8_500,
            max_batch: 3,
            default_step_estimate_ms: 1_000,
            resume_delay_ms: 2_000,
            overhead_estimate_usd: 0.01,
        }
    }
}

impl SegmentConfig {
    fn validate(&self) -> EngineResult<()> {
        if self.max_batch == 0 {
            return Err(EngineError::Internal("max_batch must be positive".into()));
        }
        if self.min_yield_check_ms >= self.checkpoint_threshold_ms + self.yield_buffer_ms {
            return Err(EngineError::Internal(
                "min_yield_check_ms must be below the yield threshold".into(),
            ));
        }
        Ok(())
    }
}

/// Distributed lock behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lock TTL
    pub ttl_ms: u64,
    /// Grace period past TTL before a holder is considered stale
    pub stale_epsilon_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            stale_epsilon_ms: 10_000,
        }
    }
}

/// Optimistic concurrency control
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccConfig {
    /// Rebase attempts after a version conflict
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt
    pub base_backoff_ms: u64,
    /// Jitter applied to each backoff, as a fraction
    pub jitter: f64,
    /// Execution record TTL
    pub record_ttl_ms: u64,
}

impl Default for OccConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 100,
            jitter: 0.3,
            record_ttl_ms: 24 * 60 * 60 * 1_000,
        }
    }
}

impl OccConfig {
    fn validate(&self) -> EngineResult<()> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(EngineError::Internal("occ jitter must be in [0, 1]".into()));
        }
        Ok(())
    }
}

/// Correction-loop circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Correction attempts tolerated inside the window
    pub max_attempts: u32,
    /// Sliding window length
    pub window_ms: u64,
    /// Time the circuit stays open once tripped
    pub open_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            window_ms: 60_000,
            open_ms: 300_000,
        }
    }
}

impl BreakerConfig {
    fn validate(&self) -> EngineResult<()> {
        if self.window_ms == 0 || self.open_ms == 0 {
            return Err(EngineError::Internal(
                "breaker windows must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Risk classification thresholds
///
/// Product rules may tune these without touching classification logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Payment amount above which a step is critical
    pub critical_payment_usd: f64,
    /// Payment amount above which a step is high risk
    pub high_payment_usd: f64,
    /// Party size above which a step is high risk
    pub high_party_size: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            critical_payment_usd: 500.0,
            high_payment_usd: 100.0,
            high_party_size: 8,
        }
    }
}

/// Confirmation token behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    /// Token TTL
    pub token_ttl_ms: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            token_ttl_ms: 15 * 60 * 1_000,
        }
    }
}

/// Idempotency marker behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Marker TTL
    pub marker_ttl_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            marker_ttl_ms: 24 * 60 * 60 * 1_000,
        }
    }
}

/// Zombie reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Staleness threshold for an executing record
    pub zombie_after_ms: u64,
    /// Resume re-triggers before escalation
    pub max_retriggers: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            zombie_after_ms: 5 * 60 * 1_000,
            max_retriggers: 3,
        }
    }
}

/// Snapshot capture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Snapshot TTL
    pub ttl_ms: u64,
    /// Payloads above this size are compressed
    pub compress_over_bytes: usize,
    /// Snapshots retained per execution; oldest trimmed beyond this
    pub max_per_execution: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 24 * 60 * 60 * 1_000,
            compress_over_bytes: 16 * 1024,
            max_per_execution: 50,
        }
    }
}
