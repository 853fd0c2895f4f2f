//! In-memory key-value store
//!
//! DashMap-backed implementation with lazy TTL expiry. This is the test
//! double for the external store and the reference implementation of the
//! `merge_if_version` script semantics.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use super::kv::{apply_versioned_merge, now_ms, KeyValueStore, SetOptions};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone)]
enum Stored {
    Bytes(Vec<u8>),
    Counter(i64),
    ZSet(BTreeMap<String, f64>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Stored,
    expires_at_ms: Option<u64>,
}

impl Entry {
    fn expired(&self, now: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now)
    }
}

/// In-process store with Redis-shaped semantics
#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, Entry>,
}

impl MemoryKv {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn drop_if_expired(&self, key: &str) {
        let now = now_ms();
        if let Some(entry) = self.entries.get(key) {
            if !entry.expired(now) {
                return;
            }
        } else {
            return;
        }
        self.entries.remove(key);
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        self.drop_if_expired(key);
        match self.entries.get(key).map(|e| e.value.clone()) {
            Some(Stored::Bytes(bytes)) => Ok(Some(bytes)),
            Some(Stored::Counter(n)) => Ok(Some(n.to_string().into_bytes())),
            Some(_) => Err(EngineError::Storage(format!("{}: wrong type", key))),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], opts: SetOptions) -> EngineResult<bool> {
        self.drop_if_expired(key);
        if opts.if_absent && self.entries.contains_key(key) {
            return Ok(false);
        }
        let entry = Entry {
            value: Stored::Bytes(value.to_vec()),
            expires_at_ms: opts.ttl.map(|ttl| now_ms() + ttl.as_millis() as u64),
        };
        self.entries.insert(key.to_string(), entry);
        Ok(true)
    }

    async fn del(&self, key: &str) -> EngineResult<bool> {
        self.drop_if_expired(key);
        Ok(self.entries.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> EngineResult<bool> {
        self.drop_if_expired(key);
        Ok(self.entries.contains_key(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> EngineResult<bool> {
        self.drop_if_expired(key);
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at_ms = Some(now_ms() + ttl.as_millis() as u64);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> EngineResult<Option<Duration>> {
        self.drop_if_expired(key);
        Ok(self.entries.get(key).and_then(|entry| {
            entry
                .expires_at_ms
                .map(|at| Duration::from_millis(at.saturating_sub(now_ms())))
        }))
    }

    async fn incr(&self, key: &str) -> EngineResult<i64> {
        self.drop_if_expired(key);
        let mut entry = self.entries.entry(key.to_string()).or_insert(Entry {
            value: Stored::Counter(0),
            expires_at_ms: None,
        });
        match &mut entry.value {
            Stored::Counter(n) => {
                *n += 1;
                Ok(*n)
            }
            _ => Err(EngineError::Storage(format!("{}: wrong type", key))),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> EngineResult<()> {
        self.drop_if_expired(key);
        let mut entry = self.entries.entry(key.to_string()).or_insert(Entry {
            value: Stored::ZSet(BTreeMap::new()),
            expires_at_ms: None,
        });
        match &mut entry.value {
            Stored::ZSet(members) => {
                members.insert(member.to_string(), score);
                Ok(())
            }
            _ => Err(EngineError::Storage(format!("{}: wrong type", key))),
        }
    }

    async fn zcard(&self, key: &str) -> EngineResult<u64> {
        self.drop_if_expired(key);
        match self.entries.get(key).map(|e| e.value.clone()) {
            Some(Stored::ZSet(members)) => Ok(members.len() as u64),
            Some(_) => Err(EngineError::Storage(format!("{}: wrong type", key))),
            None => Ok(0),
        }
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> EngineResult<u64> {
        self.drop_if_expired(key);
        match self.entries.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                Stored::ZSet(members) => {
                    let before = members.len();
                    members.retain(|_, score| *score < min || *score > max);
                    Ok((before - members.len()) as u64)
                }
                _ => Err(EngineError::Storage(format!("{}: wrong type", key))),
            },
            None => Ok(0),
        }
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> EngineResult<Vec<String>> {
        self.drop_if_expired(key);
        let members = match self.entries.get(key).map(|e| e.value.clone()) {
            Some(Stored::ZSet(members)) => members,
            Some(_) => return Err(EngineError::Storage(format!("{}: wrong type", key))),
            None => return Ok(Vec::new()),
        };
        let mut ordered: Vec<(String, f64)> = members.into_iter().collect();
        ordered.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let len = ordered.len() as i64;
        let resolve = |index: i64| -> i64 {
            if index < 0 {
                (len + index).max(0)
            } else {
                index.min(len)
            }
        };
        let from = resolve(start);
        let to = resolve(stop);
        if from > to || len == 0 {
            return Ok(Vec::new());
        }
        Ok(ordered
            .into_iter()
            .skip(from as usize)
            .take((to - from + 1) as usize)
            .map(|(member, _)| member)
            .collect())
    }

    async fn sadd(&self, key: &str, member: &str) -> EngineResult<bool> {
        self.drop_if_expired(key);
        let mut entry = self.entries.entry(key.to_string()).or_insert(Entry {
            value: Stored::Set(HashSet::new()),
            expires_at_ms: None,
        });
        match &mut entry.value {
            Stored::Set(members) => Ok(members.insert(member.to_string())),
            _ => Err(EngineError::Storage(format!("{}: wrong type", key))),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> EngineResult<bool> {
        self.drop_if_expired(key);
        match self.entries.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                Stored::Set(members) => Ok(members.remove(member)),
                _ => Err(EngineError::Storage(format!("{}: wrong type", key))),
            },
            None => Ok(false),
        }
    }

    async fn smembers(&self, key: &str) -> EngineResult<Vec<String>> {
        self.drop_if_expired(key);
        match self.entries.get(key).map(|e| e.value.clone()) {
            Some(Stored::Set(members)) => Ok(members.into_iter().collect()),
            Some(_) => Err(EngineError::Storage(format!("{}: wrong type", key))),
            None => Ok(Vec::new()),
        }
    }

    async fn merge_if_version(
        &self,
        key: &str,
        expected_version: u64,
        delta: &Map<String, Value>,
        ttl: Option<Duration>,
    ) -> EngineResult<u64> {
        self.drop_if_expired(key);
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| EngineError::Storage(format!("{}: not found", key)))?;

        let bytes = match &entry.value {
            Stored::Bytes(bytes) => bytes.clone(),
            _ => return Err(EngineError::Storage(format!("{}: wrong type", key))),
        };
        let mut document: Value = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Serialization(format!("{}: {}", key, e)))?;

        let new_version = apply_versioned_merge(&mut document, expected_version, delta)?;

        entry.value = Stored::Bytes(serde_json::to_vec(&document)?);
        if let Some(ttl) = ttl {
            entry.expires_at_ms = Some(now_ms() + ttl.as_millis() as u64);
        }
        Ok(new_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_if_absent_respects_existing() {
        let kv = MemoryKv::new();
        assert!(kv
            .set("k", b"a", SetOptions::if_absent_with_ttl(Duration::from_secs(10)))
            .await
            .unwrap());
        assert!(!kv
            .set("k", b"b", SetOptions::if_absent_with_ttl(Duration::from_secs(10)))
            .await
            .unwrap());
        assert_eq!(kv.get("k").await.unwrap().unwrap(), b"a");
    }

    #[tokio::test]
    async fn expired_keys_vanish() {
        let kv = MemoryKv::new();
        kv.set("k", b"v", SetOptions::with_ttl(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(kv.get("k").await.unwrap().is_none());
        assert!(!kv.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn merge_if_version_detects_conflict() {
        let kv = MemoryKv::new();
        let doc = json!({"version": 3, "status": "EXECUTING"});
        kv.set("doc", &serde_json::to_vec(&doc).unwrap(), SetOptions::default())
            .await
            .unwrap();

        let mut delta = Map::new();
        delta.insert("status".to_string(), json!("COMPLETED"));

        let err = kv.merge_if_version("doc", 2, &delta, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(3)));

        let version = kv.merge_if_version("doc", 3, &delta, None).await.unwrap();
        assert_eq!(version, 4);

        let stored: Value = serde_json::from_slice(&kv.get("doc").await.unwrap().unwrap()).unwrap();
        assert_eq!(stored["status"], json!("COMPLETED"));
        assert_eq!(stored["version"], json!(4));
    }

    #[tokio::test]
    async fn zset_window_operations() {
        let kv = MemoryKv::new();
        kv.zadd("w", "a", 100.0).await.unwrap();
        kv.zadd("w", "b", 200.0).await.unwrap();
        kv.zadd("w", "c", 300.0).await.unwrap();
        assert_eq!(kv.zcard("w").await.unwrap(), 3);

        let removed = kv.zremrangebyscore("w", 0.0, 150.0).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(kv.zrange("w", 0, -1).await.unwrap(), vec!["b", "c"]);
    }
}
