//! Optimistic concurrency control over execution records
//!
//! Every durable write flows through the store's `merge_if_version` script.
//! Writers supply mutation functions of the pre-image; on a version conflict
//! the store reloads, re-derives the delta against the fresh base, and
//! retries with jittered exponential backoff.

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::OccConfig;
use crate::error::{EngineError, EngineResult};
use crate::execution::{ExecutionId, ExecutionRecord};
use crate::storage::kv::{KeyValueStoreExt, SetOptions};
use crate::storage::KeyValueStore;

const STATE_PREFIX: &str = "execution_state:";
const ACTIVE_SET: &str = "executions:active";

/// Versioned store for execution records
pub struct ExecutionStore {
    kv: Arc<dyn KeyValueStore>,
    config: OccConfig,
}

impl ExecutionStore {
    /// Create a store over the given key-value backend
    pub fn new(kv: Arc<dyn KeyValueStore>, config: OccConfig) -> Self {
        Self { kv, config }
    }

    fn state_key(id: ExecutionId) -> String {
        format!("{}{}", STATE_PREFIX, id)
    }

    fn record_ttl(&self) -> Duration {
        Duration::from_millis(self.config.record_ttl_ms)
    }

    /// Persist a brand-new record; fails if the id already exists
    pub async fn create(&self, record: &ExecutionRecord) -> EngineResult<()> {
        let key = Self::state_key(record.execution_id);
        let created = self
            .kv
            .set_json(&key, record, SetOptions::if_absent_with_ttl(self.record_ttl()))
            .await?;
        if !created {
            return Err(EngineError::Internal(format!(
                "execution {} already exists",
                record.execution_id
            )));
        }
        self.kv
            .sadd(ACTIVE_SET, &record.execution_id.to_string())
            .await?;
        Ok(())
    }

    /// Load a record together with its version
    pub async fn load(&self, id: ExecutionId) -> EngineResult<(ExecutionRecord, u64)> {
        let record: ExecutionRecord = self
            .kv
            .get_json(&Self::state_key(id))
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(id.to_string()))?;
        let version = record.version;
        Ok((record, version))
    }

    /// Load a record if it exists
    pub async fn try_load(&self, id: ExecutionId) -> EngineResult<Option<ExecutionRecord>> {
        self.kv.get_json(&Self::state_key(id)).await
    }

    /// Apply `mutate` to the current record through the version-checked
    /// script, rebasing on conflict.
    ///
    /// `mutate` must be a function of the pre-image: it is re-run against
    /// every freshly loaded base, and only the top-level fields it actually
    /// changed are sent as the delta.
    pub async fn update<F>(&self, id: ExecutionId, mutate: F) -> EngineResult<ExecutionRecord>
    where
        F: Fn(&mut ExecutionRecord) -> EngineResult<()>,
    {
        let key = Self::state_key(id);
        let mut backoff = Duration::from_millis(self.config.base_backoff_ms);

        for attempt in 0..=self.config.max_retries {
            let (base, version) = self.load(id).await?;
            let mut updated = base.clone();
            mutate(&mut updated)?;
            updated.updated_at = chrono::Utc::now();

            let delta = top_level_delta(&base, &updated)?;
            if delta.is_empty() {
                return Ok(updated);
            }

            match self
                .kv
                .merge_if_version(&key, version, &delta, Some(self.record_ttl()))
                .await
            {
                Ok(new_version) => {
                    updated.version = new_version;
                    metrics::counter!("orka_occ_writes_total").increment(1);
                    if updated.status.is_terminal() {
                        self.kv.srem(ACTIVE_SET, &id.to_string()).await?;
                    }
                    return Ok(updated);
                }
                Err(EngineError::Conflict(observed)) if attempt < self.config.max_retries => {
                    metrics::counter!("orka_occ_conflicts_total").increment(1);
                    debug!(
                        execution_id = %id,
                        observed,
                        expected = version,
                        attempt,
                        "version conflict, rebasing"
                    );
                    tokio::time::sleep(jittered(backoff, self.config.jitter)).await;
                    backoff *= 2;
                }
                Err(EngineError::Conflict(observed)) => {
                    warn!(execution_id = %id, observed, "rebase retries exhausted");
                    return Err(EngineError::ConcurrentModification(format!(
                        "execution {} still at version {} after {} retries",
                        id, observed, self.config.max_retries
                    )));
                }
                Err(e) => return Err(e),
            }
        }

        Err(EngineError::Internal("unreachable rebase exit".into()))
    }

    /// Delete a record and its active-set membership
    pub async fn remove(&self, id: ExecutionId) -> EngineResult<()> {
        self.kv.del(&Self::state_key(id)).await?;
        self.kv.srem(ACTIVE_SET, &id.to_string()).await?;
        Ok(())
    }

    /// Ids currently tracked as active
    pub async fn active_executions(&self) -> EngineResult<Vec<ExecutionId>> {
        let members = self.kv.smembers(ACTIVE_SET).await?;
        members
            .iter()
            .map(|m| ExecutionId::parse_str(m))
            .collect::<EngineResult<Vec<_>>>()
    }

    /// Drop an id from the active set without touching the record
    pub async fn retire(&self, id: ExecutionId) -> EngineResult<()> {
        self.kv.srem(ACTIVE_SET, &id.to_string()).await?;
        Ok(())
    }
}

/// Compute the top-level fields on which `updated` differs from `base`.
/// The version field is owned by the script and never part of the delta.
fn top_level_delta(
    base: &ExecutionRecord,
    updated: &ExecutionRecord,
) -> EngineResult<Map<String, Value>> {
    let base_doc = serde_json::to_value(base)?;
    let updated_doc = serde_json::to_value(updated)?;
    let (Value::Object(base_map), Value::Object(updated_map)) = (base_doc, updated_doc) else {
        return Err(EngineError::Serialization(
            "execution record did not serialize to an object".into(),
        ));
    };

    let mut delta = Map::new();
    for (field, value) in updated_map {
        if field == "version" {
            continue;
        }
        if base_map.get(&field) != Some(&value) {
            delta.insert(field, value);
        }
    }
    Ok(delta)
}

fn jittered(base: Duration, jitter: f64) -> Duration {
    let factor = 1.0 + jitter * (2.0 * fastrand::f64() - 1.0);
    Duration::from_millis((base.as_millis() as f64 * factor).max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionStatus;
    use crate::plan::Plan;
    use crate::storage::MemoryKv;

    fn store() -> ExecutionStore {
        ExecutionStore::new(Arc::new(MemoryKv::new()), OccConfig::default())
    }

    #[tokio::test]
    async fn create_load_roundtrip() {
        let store = store();
        let record = ExecutionRecord::new(ExecutionId::new());
        store.create(&record).await.unwrap();

        let (loaded, version) = store.load(record.execution_id).await.unwrap();
        assert_eq!(loaded.execution_id, record.execution_id);
        assert_eq!(version, 0);
    }

    #[tokio::test]
    async fn successful_write_increments_version_by_one() {
        let store = store();
        let record = ExecutionRecord::new(ExecutionId::new());
        store.create(&record).await.unwrap();

        let updated = store
            .update(record.execution_id, |r| r.attach_plan(Plan::new(vec![])))
            .await
            .unwrap();
        assert_eq!(updated.version, 1);

        let updated = store
            .update(record.execution_id, |r| {
                r.transition_to(ExecutionStatus::Executing)
            })
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
    }

    #[tokio::test]
    async fn concurrent_writers_both_land_via_rebase() {
        let kv = Arc::new(MemoryKv::new());
        let store = Arc::new(ExecutionStore::new(kv.clone(), OccConfig::default()));
        let mut record = ExecutionRecord::new(ExecutionId::new());
        record.attach_plan(Plan::new(vec![])).unwrap();
        store.create(&record).await.unwrap();
        let id = record.execution_id;

        let a = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .update(id, |r| {
                        r.set_context("a", serde_json::json!(true));
                        Ok(())
                    })
                    .await
            })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .update(id, |r| {
                        r.set_context("b", serde_json::json!(true));
                        Ok(())
                    })
                    .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let (merged, version) = store.load(id).await.unwrap();
        assert_eq!(version, 2);
        assert!(merged.context.contains_key("a"));
        assert!(merged.context.contains_key("b"));
    }

    #[tokio::test]
    async fn terminal_write_retires_from_active_set() {
        let store = store();
        let mut record = ExecutionRecord::new(ExecutionId::new());
        record.attach_plan(Plan::new(vec![])).unwrap();
        store.create(&record).await.unwrap();
        assert_eq!(store.active_executions().await.unwrap().len(), 1);

        store
            .update(record.execution_id, |r| {
                r.transition_to(ExecutionStatus::Executing)?;
                r.transition_to(ExecutionStatus::Completed)
            })
            .await
            .unwrap();
        assert!(store.active_executions().await.unwrap().is_empty());
    }
}
