//! Key-value store contract
//!
//! Typed wrapper over an external Redis-shaped store. Sorted sets back the
//! correction-window breaker, plain sets back the active-lock registry, and
//! the `merge_if_version` script primitive backs optimistic concurrency on
//! execution records.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Options for [`KeyValueStore::set`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Expire the key after this duration
    pub ttl: Option<Duration>,
    /// Only set if the key does not already exist
    pub if_absent: bool,
}

impl SetOptions {
    /// Plain set with a TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            if_absent: false,
        }
    }

    /// Set-if-absent with a TTL
    pub fn if_absent_with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            if_absent: true,
        }
    }
}

/// Operations the orchestrator requires from the external store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>>;

    /// Write a value; returns false when `if_absent` was requested and the
    /// key already existed
    async fn set(&self, key: &str, value: &[u8], opts: SetOptions) -> EngineResult<bool>;

    /// Delete a key; returns whether it existed
    async fn del(&self, key: &str) -> EngineResult<bool>;

    /// Whether a key exists
    async fn exists(&self, key: &str) -> EngineResult<bool>;

    /// Reset a key's TTL; returns whether the key existed
    async fn expire(&self, key: &str, ttl: Duration) -> EngineResult<bool>;

    /// Remaining TTL, if the key exists and has one
    async fn ttl(&self, key: &str) -> EngineResult<Option<Duration>>;

    /// Increment a counter key
    async fn incr(&self, key: &str) -> EngineResult<i64>;

    /// Add a member to a sorted set
    async fn zadd(&self, key: &str, member: &str, score: f64) -> EngineResult<()>;

    /// Cardinality of a sorted set
    async fn zcard(&self, key: &str) -> EngineResult<u64>;

    /// Remove sorted-set members with scores in `[min, max]`; returns count
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> EngineResult<u64>;

    /// Members of a sorted set ordered by score, `start..=stop` by rank
    /// (negative indices count from the end, Redis-style)
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> EngineResult<Vec<String>>;

    /// Add a member to a set; returns whether it was newly added
    async fn sadd(&self, key: &str, member: &str) -> EngineResult<bool>;

    /// Remove a member from a set; returns whether it was present
    async fn srem(&self, key: &str, member: &str) -> EngineResult<bool>;

    /// All members of a set
    async fn smembers(&self, key: &str) -> EngineResult<Vec<String>>;

    /// Server-side compare-and-set script over a versioned JSON document.
    ///
    /// Decodes the value at `key`, fails with [`EngineError::Conflict`]
    /// carrying the observed version when it differs from
    /// `expected_version`, otherwise merges `delta` into the document's top
    /// level, sets `version = expected_version + 1`, rewrites the key with
    /// `ttl`, and returns the new version.
    async fn merge_if_version(
        &self,
        key: &str,
        expected_version: u64,
        delta: &Map<String, Value>,
        ttl: Option<Duration>,
    ) -> EngineResult<u64>;
}

/// JSON convenience helpers layered over the byte-level trait
#[async_trait]
pub trait KeyValueStoreExt: KeyValueStore {
    /// Read and decode a JSON value
    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> EngineResult<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| EngineError::Serialization(format!("{}: {}", key, e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Encode and write a JSON value
    async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        opts: SetOptions,
    ) -> EngineResult<bool> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| EngineError::Serialization(format!("{}: {}", key, e)))?;
        self.set(key, &bytes, opts).await
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStoreExt for T {}

/// Apply the script's merge semantics to a decoded document.
///
/// Shared by the in-process implementations so both match the server-side
/// script byte for byte.
pub(crate) fn apply_versioned_merge(
    document: &mut Value,
    expected_version: u64,
    delta: &Map<String, Value>,
) -> EngineResult<u64> {
    let object = document
        .as_object_mut()
        .ok_or_else(|| EngineError::Serialization("versioned value is not an object".into()))?;

    let observed = object
        .get("version")
        .and_then(Value::as_u64)
        .ok_or_else(|| EngineError::Serialization("versioned value lacks a version".into()))?;

    if observed != expected_version {
        return Err(EngineError::Conflict(observed));
    }

    for (field, value) in delta {
        object.insert(field.clone(), value.clone());
    }
    let new_version = expected_version + 1;
    object.insert("version".to_string(), Value::from(new_version));
    Ok(new_version)
}
