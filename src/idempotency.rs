//! Idempotency gate
//!
//! Deduplicates tool calls by a content hash of `(user, tool, params)` over
//! a byte-stable canonical form. The canonicaliser is versioned: changing
//! its rules must bump [`CANONICAL_VERSION`] so old markers cannot alias
//! new calls.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::IdempotencyConfig;
use crate::error::EngineResult;
use crate::storage::kv::SetOptions;
use crate::storage::KeyValueStore;

/// Canonicalisation rule-set version, mixed into every key
pub const CANONICAL_VERSION: &str = "v2";

/// Idempotency key service
pub struct IdempotencyService {
    kv: Arc<dyn KeyValueStore>,
    config: IdempotencyConfig,
}

impl IdempotencyService {
    /// Create a service over the given store
    pub fn new(kv: Arc<dyn KeyValueStore>, config: IdempotencyConfig) -> Self {
        Self { kv, config }
    }

    /// Compute the idempotency key for a call
    pub fn key_for(&self, user_id: &str, tool: &str, params: &Value) -> String {
        let canonical = canonical_string(params);
        let mut hasher = Sha256::new();
        hasher.update(CANONICAL_VERSION.as_bytes());
        hasher.update(b"|");
        hasher.update(user_id.as_bytes());
        hasher.update(b"|");
        hasher.update(tool.as_bytes());
        hasher.update(b"|");
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn marker_key(user_id: &str, hash: &str) -> String {
        format!("idempotency:{}:{}", user_id, hash)
    }

    /// Whether an identical call was recorded within the TTL
    pub async fn is_duplicate(
        &self,
        user_id: &str,
        tool: &str,
        params: &Value,
    ) -> EngineResult<bool> {
        let hash = self.key_for(user_id, tool, params);
        self.kv.exists(&Self::marker_key(user_id, &hash)).await
    }

    /// Record a successful first execution
    pub async fn record(&self, user_id: &str, tool: &str, params: &Value) -> EngineResult<()> {
        let hash = self.key_for(user_id, tool, params);
        let ttl = Duration::from_millis(self.config.marker_ttl_ms);
        self.kv
            .set(
                &Self::marker_key(user_id, &hash),
                b"1",
                SetOptions::with_ttl(ttl),
            )
            .await?;
        debug!(user_id, tool, "idempotency marker recorded");
        Ok(())
    }
}

/// Normalise a parameter value under the `v2` rules:
/// object keys sorted, strings trimmed, `H:MM`/`HH:MM` times padded to
/// `HH:MM:SS`, integral floats collapsed to integers.
pub fn canonicalize(params: &Value) -> Value {
    match params {
        Value::String(s) => Value::String(canonical_str(s)),
        Value::Number(n) => canonical_number(n),
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (key, value) in sorted {
                out.insert(key.clone(), canonicalize(value));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Byte-stable canonical encoding of a parameter value
pub fn canonical_string(params: &Value) -> String {
    write_canonical(&canonicalize(params))
}

fn write_canonical(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(&String, &Value)> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            let body: Vec<String> = fields
                .iter()
                .map(|(k, v)| format!("{}:{}", serde_json::Value::from(k.as_str()), write_canonical(v)))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(write_canonical).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

fn canonical_str(s: &str) -> String {
    let trimmed = s.trim();
    if let Some(normalised) = normalise_time(trimmed) {
        return normalised;
    }
    trimmed.to_string()
}

/// `H:MM` or `HH:MM` → `HH:MM:00`; already-padded times pass unchanged
fn normalise_time(s: &str) -> Option<String> {
    let parts: Vec<&str> = s.split(':').collect();
    let valid_component = |p: &str, max: u32| -> Option<u32> {
        if p.is_empty() || p.len() > 2 || !p.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let n: u32 = p.parse().ok()?;
        (n <= max).then_some(n)
    };
    match parts.as_slice() {
        [h, m] => {
            let h = valid_component(h, 23)?;
            let m = valid_component(m, 59)?;
            Some(format!("{:02}:{:02}:00", h, m))
        }
        [h, m, sec] => {
            let h = valid_component(h, 23)?;
            let m = valid_component(m, 59)?;
            let sec = valid_component(sec, 59)?;
            Some(format!("{:02}:{:02}:{:02}", h, m, sec))
        }
        _ => None,
    }
}

fn canonical_number(n: &serde_json::Number) -> Value {
    if n.is_f64() {
        if let Some(f) = n.as_f64() {
            // 2^53: the largest span where f64 holds integers exactly.
            if f.is_finite() && f.fract() == 0.0 && f.abs() <= 9_007_199_254_740_992.0 {
                return Value::from(f as i64);
            }
        }
    }
    Value::Number(n.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKv;
    use serde_json::json;

    #[test]
    fn canonicalisation_is_idempotent() {
        let params = json!({
            "time": "14:00",
            "partySize": 2.0,
            "name": "  Alice  ",
            "nested": {"b": 1, "a": "9:30"}
        });
        let once = canonicalize(&params);
        let twice = canonicalize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn time_formats_collapse() {
        assert_eq!(canonical_string(&json!("14:00")), canonical_string(&json!("14:00:00")));
        assert_eq!(canonical_string(&json!("9:30")), canonical_string(&json!("09:30:00")));
        assert_ne!(canonical_string(&json!("14:00")), canonical_string(&json!("14:01")));
    }

    #[test]
    fn key_is_order_insensitive() {
        let kv = Arc::new(MemoryKv::new());
        let service = IdempotencyService::new(kv, IdempotencyConfig::default());
        let a = json!({"restaurantId": "R1", "partySize": 2});
        let b = json!({"partySize": 2, "restaurantId": "R1"});
        assert_eq!(
            service.key_for("u1", "book_restaurant_table", &a),
            service.key_for("u1", "book_restaurant_table", &b)
        );
    }

    #[test]
    fn key_varies_by_user_and_tool() {
        let kv = Arc::new(MemoryKv::new());
        let service = IdempotencyService::new(kv, IdempotencyConfig::default());
        let params = json!({"x": 1});
        assert_ne!(
            service.key_for("u1", "book_ride", &params),
            service.key_for("u2", "book_ride", &params)
        );
        assert_ne!(
            service.key_for("u1", "book_ride", &params),
            service.key_for("u1", "cancel_ride", &params)
        );
    }

    #[tokio::test]
    async fn duplicate_detected_within_ttl() {
        let kv = Arc::new(MemoryKv::new());
        let service = IdempotencyService::new(kv, IdempotencyConfig::default());
        let params = json!({"restaurantId": "R1", "time": "19:00"});

        assert!(!service.is_duplicate("u1", "book_restaurant_table", &params).await.unwrap());
        service.record("u1", "book_restaurant_table", &params).await.unwrap();
        assert!(service.is_duplicate("u1", "book_restaurant_table", &params).await.unwrap());

        // Equivalent formatting hits the same marker.
        let padded = json!({"time": "19:00:00", "restaurantId": "R1"});
        assert!(service.is_duplicate("u1", "book_restaurant_table", &padded).await.unwrap());
    }
}
