//! Sled-backed key-value store
//!
//! Embedded durable implementation of the store contract. Sled has no
//! native TTL, so every value is wrapped in an expiry envelope and expired
//! lazily on access. Read-modify-write operations are serialised through a
//! store-level mutex; cross-process coordination is the remote store's job.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sled::Db;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use super::kv::{apply_versioned_merge, now_ms, KeyValueStore, SetOptions};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Payload {
    Bytes(Vec<u8>),
    Counter(i64),
    ZSet(BTreeMap<String, f64>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    expires_at_ms: Option<u64>,
    payload: Payload,
}

impl Envelope {
    fn expired(&self, now: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now)
    }
}

/// Durable embedded store
pub struct SledKv {
    db: Db,
    write_guard: Mutex<()>,
}

impl SledKv {
    /// Open or create a store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let db = sled::open(path)
            .map_err(|e| EngineError::Storage(format!("failed to open database: {}", e)))?;
        Ok(Self {
            db,
            write_guard: Mutex::new(()),
        })
    }

    fn load(&self, key: &str) -> EngineResult<Option<Envelope>> {
        let raw = self
            .db
            .get(key.as_bytes())
            .map_err(|e| EngineError::Storage(format!("{}: {}", key, e)))?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let envelope: Envelope = serde_json::from_slice(raw.as_ref())
            .map_err(|e| EngineError::Serialization(format!("{}: {}", key, e)))?;
        if envelope.expired(now_ms()) {
            self.db
                .remove(key.as_bytes())
                .map_err(|e| EngineError::Storage(format!("{}: {}", key, e)))?;
            return Ok(None);
        }
        Ok(Some(envelope))
    }

    fn store(&self, key: &str, envelope: &Envelope) -> EngineResult<()> {
        let bytes = serde_json::to_vec(envelope)
            .map_err(|e| EngineError::Serialization(format!("{}: {}", key, e)))?;
        self.db
            .insert(key.as_bytes(), bytes)
            .map_err(|e| EngineError::Storage(format!("{}: {}", key, e)))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> EngineResult<bool> {
        Ok(self
            .db
            .remove(key.as_bytes())
            .map_err(|e| EngineError::Storage(format!("{}: {}", key, e)))?
            .is_some())
    }
}

#[async_trait]
impl KeyValueStore for SledKv {
    async fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        match self.load(key)? {
            Some(Envelope {
                payload: Payload::Bytes(bytes),
                ..
            }) => Ok(Some(bytes)),
            Some(Envelope {
                payload: Payload::Counter(n),
                ..
            }) => Ok(Some(n.to_string().into_bytes())),
            Some(_) => Err(EngineError::Storage(format!("{}: wrong type", key))),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], opts: SetOptions) -> EngineResult<bool> {
        let _guard = self.write_guard.lock();
        if opts.if_absent && self.load(key)?.is_some() {
            return Ok(false);
        }
        self.store(
            key,
            &Envelope {
                expires_at_ms: opts.ttl.map(|ttl| now_ms() + ttl.as_millis() as u64),
                payload: Payload::Bytes(value.to_vec()),
            },
        )?;
        Ok(true)
    }

    async fn del(&self, key: &str) -> EngineResult<bool> {
        let _guard = self.write_guard.lock();
        let existed = self.load(key)?.is_some();
        self.remove(key)?;
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> EngineResult<bool> {
        Ok(self.load(key)?.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> EngineResult<bool> {
        let _guard = self.write_guard.lock();
        match self.load(key)? {
            Some(mut envelope) => {
                envelope.expires_at_ms = Some(now_ms() + ttl.as_millis() as u64);
                self.store(key, &envelope)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> EngineResult<Option<Duration>> {
        Ok(self.load(key)?.and_then(|envelope| {
            envelope
                .expires_at_ms
                .map(|at| Duration::from_millis(at.saturating_sub(now_ms())))
        }))
    }

    async fn incr(&self, key: &str) -> EngineResult<i64> {
        let _guard = self.write_guard.lock();
        let mut envelope = self.load(key)?.unwrap_or(Envelope {
            expires_at_ms: None,
            payload: Payload::Counter(0),
        });
        match &mut envelope.payload {
            Payload::Counter(n) => {
                *n += 1;
                let value = *n;
                self.store(key, &envelope)?;
                Ok(value)
            }
            _ => Err(EngineError::Storage(format!("{}: wrong type", key))),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> EngineResult<()> {
        let _guard = self.write_guard.lock();
        let mut envelope = self.load(key)?.unwrap_or(Envelope {
            expires_at_ms: None,
            payload: Payload::ZSet(BTreeMap::new()),
        });
        match &mut envelope.payload {
            Payload::ZSet(members) => {
                members.insert(member.to_string(), score);
                self.store(key, &envelope)
            }
            _ => Err(EngineError::Storage(format!("{}: wrong type", key))),
        }
    }

    async fn zcard(&self, key: &str) -> EngineResult<u64> {
        match self.load(key)? {
            Some(Envelope {
                payload: Payload::ZSet(members),
                ..
            }) => Ok(members.len() as u64),
            Some(_) => Err(EngineError::Storage(format!("{}: wrong type", key))),
            None => Ok(0),
        }
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> EngineResult<u64> {
        let _guard = self.write_guard.lock();
        match self.load(key)? {
            Some(mut envelope) => match &mut envelope.payload {
                Payload::ZSet(members) => {
                    let before = members.len();
                    members.retain(|_, score| *score < min || *score > max);
                    let removed = (before - members.len()) as u64;
                    self.store(key, &envelope)?;
                    Ok(removed)
                }
                _ => Err(EngineError::Storage(format!("{}: wrong type", key))),
            },
            None => Ok(0),
        }
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> EngineResult<Vec<String>> {
        let members = match self.load(key)? {
            Some(Envelope {
                payload: Payload::ZSet(members),
                ..
            }) => members,
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
        let _guard = self.write_guard.lock();
        let mut envelope = self.load(key)?.unwrap_or(Envelope {
            expires_at_ms: None,
            payload: Payload::Set(HashSet::new()),
        });
        match &mut envelope.payload {
            Payload::Set(members) => {
                let added = members.insert(member.to_string());
                self.store(key, &envelope)?;
                Ok(added)
            }
            _ => Err(EngineError::Storage(format!("{}: wrong type", key))),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> EngineResult<bool> {
        let _guard = self.write_guard.lock();
        match self.load(key)? {
            Some(mut envelope) => match &mut envelope.payload {
                Payload::Set(members) => {
                    let removed = members.remove(member);
                    self.store(key, &envelope)?;
                    Ok(removed)
                }
                _ => Err(EngineError::Storage(format!("{}: wrong type", key))),
            },
            None => Ok(false),
        }
    }

    async fn smembers(&self, key: &str) -> EngineResult<Vec<String>> {
        match self.load(key)? {
            Some(Envelope {
                payload: Payload::Set(members),
                ..
            }) => Ok(members.into_iter().collect()),
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
        let _guard = self.write_guard.lock();
        let mut envelope = self
            .load(key)?
            .ok_or_else(|| EngineError::Storage(format!("{}: not found", key)))?;

        let bytes = match &envelope.payload {
            Payload::Bytes(bytes) => bytes.clone(),
            _ => return Err(EngineError::Storage(format!("{}: wrong type", key))),
        };
        let mut document: Value = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Serialization(format!("{}: {}", key, e)))?;

        let new_version = apply_versioned_merge(&mut document, expected_version, delta)?;

        envelope.payload = Payload::Bytes(serde_json::to_vec(&document)?);
        if let Some(ttl) = ttl {
            envelope.expires_at_ms = Some(now_ms() + ttl.as_millis() as u64);
        }
        self.store(key, &envelope)?;
        Ok(new_version)
    }
}
