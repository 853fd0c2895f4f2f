//! Re-entrant distributed locks
//!
//! Workflow-scoped locks with stale-owner recovery. Mutual exclusion rests
//! on an atomic set-if-absent with TTL; re-entrancy on a token carried by
//! the holder; staleness on the recorded acquisition time. Active locks are
//! tracked in a set so deadlock scans never walk the keyspace.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{EngineError, EngineResult};
use crate::matcher::wildcard_match;
use crate::storage::kv::{now_ms, KeyValueStoreExt, SetOptions};
use crate::storage::KeyValueStore;

const LOCK_PREFIX: &str = "lock:";
const REGISTRY_KEY: &str = "locks:active_registry";

/// Metadata recorded next to each held lock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Holder id
    pub owner_id: String,
    /// Token matched on re-entrant acquisition
    pub reentrancy_token: String,
    /// Acquisition (or last extension) time, ms since epoch
    pub acquired_at_ms: u64,
    /// TTL granted at acquisition
    pub ttl_ms: u64,
    /// Re-entrancy depth
    pub depth: u32,
    /// Operation description for diagnostics
    pub operation: String,
    /// Trace id of the acquiring invocation
    pub trace_id: String,
    /// Execution the lock guards
    pub execution_id: String,
}

impl LockInfo {
    /// Whether the holder is past `ttl + epsilon`
    pub fn is_stale(&self, epsilon_ms: u64) -> bool {
        now_ms() > self.acquired_at_ms + self.ttl_ms + epsilon_ms
    }
}

/// Handle for a held lock; release explicitly, Drop is best-effort
pub struct LockHandle {
    service: Arc<LockService>,
    key: String,
    owner_id: String,
    reentrancy_token: String,
    released: AtomicBool,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("owner_id", &self.owner_id)
            .field("reentrancy_token", &self.reentrancy_token)
            .field("released", &self.released)
            .finish()
    }
}

impl LockHandle {
    /// Holder id recorded in the store
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Token to pass for nested acquisition
    pub fn reentrancy_token(&self) -> &str {
        &self.reentrancy_token
    }

    /// Lock key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Refresh the TTL; only the owner may extend
    pub async fn extend(&self, ttl: Duration) -> EngineResult<()> {
        self.service.extend(self, ttl).await
    }

    /// Decrement depth, deleting the lock at depth zero
    pub async fn release(&self) -> EngineResult<()> {
        self.released.store(true, Ordering::SeqCst);
        self.service.release(self).await
    }

    /// Whether the store still records this handle as owner
    pub async fn is_still_owner(&self) -> EngineResult<bool> {
        self.service.is_owner(&self.key, &self.owner_id).await
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        // Fallback only; the engine releases explicitly on every exit path.
        let service = self.service.clone();
        let key = self.key.clone();
        let owner = self.owner_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = service.force_release_owned(&key, &owner).await {
                    warn!(key = %key, error = %e, "failed to release dropped lock");
                }
            });
        }
    }
}

/// Distributed lock service
pub struct LockService {
    kv: Arc<dyn KeyValueStore>,
    config: LockConfig,
}

impl LockService {
    /// Create a lock service over the given store
    pub fn new(kv: Arc<dyn KeyValueStore>, config: LockConfig) -> Self {
        Self { kv, config }
    }

    fn value_key(key: &str) -> String {
        format!("{}{}", LOCK_PREFIX, key)
    }

    fn meta_key(key: &str) -> String {
        format!("{}{}:meta", LOCK_PREFIX, key)
    }

    /// Acquire `key`, re-entrantly when `reentrancy_token` matches the
    /// current holder. Busy locks fail with `LockContended` unless the
    /// holder is stale, in which case it is forcibly replaced.
    pub async fn acquire(
        self: &Arc<Self>,
        key: &str,
        ttl: Duration,
        operation: &str,
        trace_id: &str,
        execution_id: &str,
        reentrancy_token: Option<&str>,
    ) -> EngineResult<LockHandle> {
        let owner_id = Uuid::new_v4().to_string();
        let token = reentrancy_token
            .map(|t| t.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let value_key = Self::value_key(key);
        let meta_key = Self::meta_key(key);

        let acquired = self
            .kv
            .set(
                &value_key,
                owner_id.as_bytes(),
                SetOptions::if_absent_with_ttl(ttl),
            )
            .await?;

        if acquired {
            let info = LockInfo {
                owner_id: owner_id.clone(),
                reentrancy_token: token.clone(),
                acquired_at_ms: now_ms(),
                ttl_ms: ttl.as_millis() as u64,
                depth: 1,
                operation: operation.to_string(),
                trace_id: trace_id.to_string(),
                execution_id: execution_id.to_string(),
            };
            self.kv
                .set_json(&meta_key, &info, SetOptions::with_ttl(ttl * 2))
                .await?;
            self.kv.sadd(REGISTRY_KEY, key).await?;
            debug!(key, owner = %owner_id, "lock acquired");
            return Ok(LockHandle {
                service: self.clone(),
                key: key.to_string(),
                owner_id,
                reentrancy_token: token,
                released: AtomicBool::new(false),
            });
        }

        // Lock is held; try re-entrancy, then stale takeover.
        if let Some(mut info) = self.kv.get_json::<LockInfo>(&meta_key).await? {
            if info.reentrancy_token == token {
                info.depth += 1;
                self.kv
                    .set_json(&meta_key, &info, SetOptions::with_ttl(ttl * 2))
                    .await?;
                debug!(key, depth = info.depth, "lock re-entered");
                return Ok(LockHandle {
                    service: self.clone(),
                    key: key.to_string(),
                    owner_id: info.owner_id,
                    reentrancy_token: token,
                    released: AtomicBool::new(false),
                });
            }

            if info.is_stale(self.config.stale_epsilon_ms) {
                warn!(key, stale_owner = %info.owner_id, "recovering stale lock");
                metrics::counter!("orka_locks_stale_recovered_total").increment(1);
                self.kv.del(&value_key).await?;
                self.kv.del(&meta_key).await?;
                self.kv.srem(REGISTRY_KEY, key).await?;
                return Box::pin(self.acquire(
                    key,
                    ttl,
                    operation,
                    trace_id,
                    execution_id,
                    Some(token.as_str()),
                ))
                .await;
            }
        }

        Err(EngineError::LockContended(key.to_string()))
    }

    async fn extend(&self, handle: &LockHandle, ttl: Duration) -> EngineResult<()> {
        let meta_key = Self::meta_key(&handle.key);
        let mut info = self
            .kv
            .get_json::<LockInfo>(&meta_key)
            .await?
            .ok_or_else(|| EngineError::OwnerMismatch(format!("{}: no holder", handle.key)))?;
        if info.owner_id != handle.owner_id {
            return Err(EngineError::OwnerMismatch(handle.key.clone()));
        }
        info.acquired_at_ms = now_ms();
        info.ttl_ms = ttl.as_millis() as u64;
        self.kv.expire(&Self::value_key(&handle.key), ttl).await?;
        self.kv
            .set_json(&meta_key, &info, SetOptions::with_ttl(ttl * 2))
            .await?;
        Ok(())
    }

    async fn release(&self, handle: &LockHandle) -> EngineResult<()> {
        let meta_key = Self::meta_key(&handle.key);
        let Some(mut info) = self.kv.get_json::<LockInfo>(&meta_key).await? else {
            // TTL already reclaimed the lock; nothing to release.
            return Ok(());
        };
        if info.owner_id != handle.owner_id {
            return Err(EngineError::OwnerMismatch(handle.key.clone()));
        }
        if info.depth > 1 {
            info.depth -= 1;
            self.kv
                .set_json(
                    &meta_key,
                    &info,
                    SetOptions::with_ttl(Duration::from_millis(info.ttl_ms * 2)),
                )
                .await?;
            return Ok(());
        }
        self.kv.del(&Self::value_key(&handle.key)).await?;
        self.kv.del(&meta_key).await?;
        self.kv.srem(REGISTRY_KEY, &handle.key).await?;
        debug!(key = %handle.key, "lock released");
        Ok(())
    }

    async fn force_release_owned(&self, key: &str, owner_id: &str) -> EngineResult<()> {
        if !self.is_owner(key, owner_id).await? {
            return Ok(());
        }
        self.kv.del(&Self::value_key(key)).await?;
        self.kv.del(&Self::meta_key(key)).await?;
        self.kv.srem(REGISTRY_KEY, key).await?;
        Ok(())
    }

    async fn is_owner(&self, key: &str, owner_id: &str) -> EngineResult<bool> {
        match self.kv.get(&Self::value_key(key)).await? {
            Some(stored) => Ok(stored == owner_id.as_bytes()),
            None => Ok(false),
        }
    }

    /// Metadata for a held lock, if any
    pub async fn get_info(&self, key: &str) -> EngineResult<Option<LockInfo>> {
        self.kv.get_json(&Self::meta_key(key)).await
    }

    /// Keys in the active registry whose holder looks stale
    pub async fn detect_stale(&self, pattern: &str) -> EngineResult<Vec<String>> {
        let mut stale = Vec::new();
        for key in self.kv.smembers(REGISTRY_KEY).await? {
            if !wildcard_match(pattern, &key) {
                continue;
            }
            match self.kv.get_json::<LockInfo>(&Self::meta_key(&key)).await? {
                Some(info) if info.is_stale(self.config.stale_epsilon_ms) => stale.push(key),
                Some(_) => {}
                // Value and meta both expired: registry entry is garbage.
                None => {
                    if !self.kv.exists(&Self::value_key(&key)).await? {
                        self.kv.srem(REGISTRY_KEY, &key).await?;
                    }
                }
            }
        }
        Ok(stale)
    }

    /// Forcibly remove stale holders matching `pattern`; returns count
    pub async fn recover_stale(&self, pattern: &str) -> EngineResult<usize> {
        let stale = self.detect_stale(pattern).await?;
        for key in &stale {
            self.kv.del(&Self::value_key(key)).await?;
            self.kv.del(&Self::meta_key(key)).await?;
            self.kv.srem(REGISTRY_KEY, key).await?;
            warn!(key = %key, "stale lock recovered by scan");
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKv;

    fn service() -> Arc<LockService> {
        Arc::new(LockService::new(
            Arc::new(MemoryKv::new()),
            LockConfig::default(),
        ))
    }

    async fn acquire(service: &Arc<LockService>, key: &str, token: Option<&str>) -> EngineResult<LockHandle> {
        service
            .acquire(key, Duration::from_secs(30), "test", "trace-1", "exec-1", token)
            .await
    }

    #[tokio::test]
    async fn second_acquire_is_contended() {
        let service = service();
        let held = acquire(&service, "workflow:e1", None).await.unwrap();
        let err = acquire(&service, "workflow:e1", None).await.unwrap_err();
        assert!(matches!(err, EngineError::LockContended(_)));
        held.release().await.unwrap();

        // Released lock can be taken again.
        let handle = acquire(&service, "workflow:e1", None).await.unwrap();
        handle.release().await.unwrap();
    }

    #[tokio::test]
    async fn reentrant_acquire_increments_depth() {
        let service = service();
        let outer = acquire(&service, "workflow:e1", None).await.unwrap();
        let inner = acquire(&service, "workflow:e1", Some(outer.reentrancy_token()))
            .await
            .unwrap();

        let info = service.get_info("workflow:e1").await.unwrap().unwrap();
        assert_eq!(info.depth, 2);

        inner.release().await.unwrap();
        assert!(service.get_info("workflow:e1").await.unwrap().is_some());
        outer.release().await.unwrap();
        assert!(service.get_info("workflow:e1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_holder_is_replaced() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
        let service = Arc::new(LockService::new(
            kv.clone(),
            LockConfig {
                ttl_ms: 10,
                stale_epsilon_ms: 0,
            },
        ));

        // Plant a holder whose meta says it acquired long ago. The value key
        // has no TTL here so only staleness can unblock the caller.
        kv.set("lock:workflow:e1", b"dead-owner", SetOptions::default())
            .await
            .unwrap();
        let info = LockInfo {
            owner_id: "dead-owner".into(),
            reentrancy_token: "dead-token".into(),
            acquired_at_ms: now_ms() - 60_000,
            ttl_ms: 10,
            depth: 1,
            operation: "test".into(),
            trace_id: "t".into(),
            execution_id: "e".into(),
        };
        kv.set_json("lock:workflow:e1:meta", &info, SetOptions::default())
            .await
            .unwrap();
        kv.sadd("locks:active_registry", "workflow:e1").await.unwrap();

        let handle = service
            .acquire(
                "workflow:e1",
                Duration::from_secs(30),
                "test",
                "trace-1",
                "exec-1",
                None,
            )
            .await
            .unwrap();
        assert_ne!(handle.owner_id(), "dead-owner");
        handle.release().await.unwrap();
    }

    #[tokio::test]
    async fn registry_backs_stale_scan() {
        let service = service();
        let handle = acquire(&service, "workflow:e1", None).await.unwrap();
        assert!(service.detect_stale("workflow:*").await.unwrap().is_empty());
        handle.release().await.unwrap();
    }
}
