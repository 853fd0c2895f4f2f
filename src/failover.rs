//! Failure classification and failover policy
//!
//! Deterministic, LLM-free mapping from a tool failure to a recommended
//! action. Classification runs substring rules plus status-code ranges over
//! a closed set of reasons; the policy table turns a reason (plus intent
//! and parameters) into either a retry mutation or a user-facing
//! suggestion.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of failure reasons derived from tool errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    RestaurantFull,
    TableUnavailable,
    KitchenOverloaded,
    PaymentFailed,
    DeliveryUnavailable,
    TimeSlotUnavailable,
    PartySizeTooLarge,
    ValidationFailed,
    Timeout,
    ServiceError,
}

impl FailureReason {
    /// Stable wire code
    pub fn code(self) -> &'static str {
        match self {
            FailureReason::RestaurantFull => "RESTAURANT_FULL",
            FailureReason::TableUnavailable => "TABLE_UNAVAILABLE",
            FailureReason::KitchenOverloaded => "KITCHEN_OVERLOADED",
            FailureReason::PaymentFailed => "PAYMENT_FAILED",
            FailureReason::DeliveryUnavailable => "DELIVERY_UNAVAILABLE",
            FailureReason::TimeSlotUnavailable => "TIME_SLOT_UNAVAILABLE",
            FailureReason::PartySizeTooLarge => "PARTY_SIZE_TOO_LARGE",
            FailureReason::ValidationFailed => "VALIDATION_FAILED",
            FailureReason::Timeout => "TIMEOUT",
            FailureReason::ServiceError => "SERVICE_ERROR",
        }
    }
}

/// Classify a tool error into a failure reason
///
/// Substring rules win over status-code ranges; the fallback is
/// `ServiceError`.
pub fn classify_failure(error: &str, status_code: Option<u16>) -> FailureReason {
    let lower = error.to_lowercase();

    if lower.contains("fully booked") || lower.contains("restaurant full") || lower.contains("no tables")
    {
        return FailureReason::RestaurantFull;
    }
    if lower.contains("party size") || lower.contains("party too large") {
        return FailureReason::PartySizeTooLarge;
    }
    if lower.contains("time slot") || lower.contains("slot unavailable") || lower.contains("slot taken")
    {
        return FailureReason::TimeSlotUnavailable;
    }
    if lower.contains("table") {
        return FailureReason::TableUnavailable;
    }
    if lower.contains("kitchen") {
        return FailureReason::KitchenOverloaded;
    }
    if lower.contains("payment") || lower.contains("card declined") || lower.contains("insufficient funds")
    {
        return FailureReason::PaymentFailed;
    }
    if lower.contains("delivery") || lower.contains("courier") {
        return FailureReason::DeliveryUnavailable;
    }
    if lower.contains("timeout") || lower.contains("timed out") || lower.contains("deadline") {
        return FailureReason::Timeout;
    }
    if lower.contains("validation") || lower.contains("invalid") {
        return FailureReason::ValidationFailed;
    }

    match status_code {
        Some(408) | Some(504) => FailureReason::Timeout,
        Some(400) | Some(422) => FailureReason::ValidationFailed,
        Some(402) => FailureReason::PaymentFailed,
        Some(code) if (500..600).contains(&code) => FailureReason::ServiceError,
        _ => FailureReason::ServiceError,
    }
}

/// Action recommended by the policy table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendedAction {
    /// Retry with the time parameter shifted; remaining offsets become
    /// user suggestions
    SuggestAlternativeTime { offsets_minutes: Vec<i64> },
    /// Offer delivery instead of dining in
    TriggerDelivery,
    /// Offer the waitlist
    TriggerWaitlist,
    /// Retry with a smaller party
    DowngradePartySize { to: u64 },
    /// Retry the same call after a delay
    RetryWithBackoff { delay_ms: u64 },
    /// Hand the failure to a human
    Escalate,
}

impl RecommendedAction {
    /// Stable wire code
    pub fn code(&self) -> &'static str {
        match self {
            RecommendedAction::SuggestAlternativeTime { .. } => "SUGGEST_ALTERNATIVE_TIME",
            RecommendedAction::TriggerDelivery => "TRIGGER_DELIVERY",
            RecommendedAction::TriggerWaitlist => "TRIGGER_WAITLIST",
            RecommendedAction::DowngradePartySize { .. } => "DOWNGRADE_PARTY_SIZE",
            RecommendedAction::RetryWithBackoff { .. } => "RETRY_WITH_BACKOFF",
            RecommendedAction::Escalate => "ESCALATE",
        }
    }
}

/// Deterministic failover policy table
#[derive(Debug, Clone)]
pub struct FailoverPolicy {
    /// Offsets tried for alternative-time suggestions
    pub time_offsets_minutes: Vec<i64>,
    /// Party size a downgrade falls back to
    pub downgrade_party_size: u64,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self {
            time_offsets_minutes: vec![30, -30, 60, 90],
            downgrade_party_size: 8,
        }
    }
}

impl FailoverPolicy {
    /// Map a classified failure to an action
    pub fn recommend(
        &self,
        intent: Option<&str>,
        reason: FailureReason,
        params: &Value,
    ) -> RecommendedAction {
        match reason {
            FailureReason::RestaurantFull => match intent {
                Some("delivery") | Some("meal") => RecommendedAction::TriggerDelivery,
                _ => RecommendedAction::TriggerWaitlist,
            },
            FailureReason::TableUnavailable | FailureReason::TimeSlotUnavailable => {
                RecommendedAction::SuggestAlternativeTime {
                    offsets_minutes: self.time_offsets_minutes.clone(),
                }
            }
            FailureReason::KitchenOverloaded => RecommendedAction::RetryWithBackoff {
                delay_ms: 30_000,
            },
            FailureReason::DeliveryUnavailable => RecommendedAction::SuggestAlternativeTime {
                offsets_minutes: self.time_offsets_minutes.clone(),
            },
            FailureReason::PartySizeTooLarge => {
                let current = params.get("partySize").and_then(|v| v.as_u64()).unwrap_or(0);
                if current > self.downgrade_party_size {
                    RecommendedAction::DowngradePartySize {
                        to: self.downgrade_party_size,
                    }
                } else {
                    RecommendedAction::Escalate
                }
            }
            FailureReason::Timeout => RecommendedAction::RetryWithBackoff { delay_ms: 2_000 },
            FailureReason::ServiceError => RecommendedAction::RetryWithBackoff { delay_ms: 5_000 },
            FailureReason::PaymentFailed | FailureReason::ValidationFailed => {
                RecommendedAction::Escalate
            }
        }
    }

    /// Apply an action to step parameters, producing the mutated input for
    /// a retry. Actions that only produce suggestions return `None`.
    pub fn apply(&self, action: &RecommendedAction, params: &Value) -> Option<Value> {
        match action {
            RecommendedAction::SuggestAlternativeTime { offsets_minutes } => {
                let offset = *offsets_minutes.first()?;
                let time = params.get("time")?.as_str()?;
                let shifted = shift_time(time, offset)?;
                let mut mutated = params.clone();
                mutated.as_object_mut()?.insert("time".into(), Value::from(shifted));
                Some(mutated)
            }
            RecommendedAction::DowngradePartySize { to } => {
                let mut mutated = params.clone();
                mutated
                    .as_object_mut()?
                    .insert("partySize".into(), Value::from(*to));
                Some(mutated)
            }
            RecommendedAction::RetryWithBackoff { .. } => Some(params.clone()),
            RecommendedAction::TriggerDelivery
            | RecommendedAction::TriggerWaitlist
            | RecommendedAction::Escalate => None,
        }
    }
}

/// Shift an `HH:MM` or `HH:MM:SS` time by whole minutes, clamped to the day
fn shift_time(time: &str, offset_minutes: i64) -> Option<String> {
    let parts: Vec<&str> = time.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return None;
    }
    let hours: i64 = parts[0].parse().ok()?;
    let minutes: i64 = parts[1].parse().ok()?;
    let seconds: i64 = if parts.len() == 3 {
        parts[2].parse().ok()?
    } else {
        0
    };
    if !(0..24).contains(&hours) || !(0..60).contains(&minutes) || !(0..60).contains(&seconds) {
        return None;
    }
    let total = (hours * 60 + minutes + offset_minutes).rem_euclid(24 * 60);
    Some(format!("{:02}:{:02}:{:02}", total / 60, total % 60, seconds))
}
