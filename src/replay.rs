//! Snapshots and deterministic replay
//!
//! At each segment boundary the engine captures a sanitised snapshot of the
//! execution. A replayer can restore the nearest snapshot at or before a
//! chosen step and run forward against substituted collaborators; the
//! comparator reports path-level differences between two snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::SnapshotConfig;
use crate::error::{EngineError, EngineResult};
use crate::execution::{ExecutionId, ExecutionRecord, StepStatus};
use crate::storage::kv::{now_ms, SetOptions};
use crate::storage::KeyValueStore;

const ENCODING_PLAIN: u8 = 0;
const ENCODING_LZ4: u8 = 1;

/// A captured snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Owning execution
    pub execution_id: ExecutionId,
    /// Number of settled steps at capture time
    pub step_index: usize,
    /// Capture instant
    pub captured_at: DateTime<Utc>,
    /// Sanitised execution record
    pub state: Value,
    /// Outputs of settled steps
    pub step_outputs: HashMap<String, Value>,
    /// Environment metadata (engine version, host labels)
    pub environment: HashMap<String, String>,
}

/// One path-level difference between two snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    /// JSON-pointer-style path
    pub path: String,
    /// Value on the left side, if present
    pub left: Option<Value>,
    /// Value on the right side, if present
    pub right: Option<Value>,
}

/// Captures and retrieves snapshots
pub struct SnapshotStore {
    kv: Arc<dyn KeyValueStore>,
    config: SnapshotConfig,
    environment: HashMap<String, String>,
}

impl SnapshotStore {
    /// Create a snapshot store
    pub fn new(kv: Arc<dyn KeyValueStore>, config: SnapshotConfig) -> Self {
        let mut environment = HashMap::new();
        environment.insert("engine_version".to_string(), env!("CARGO_PKG_VERSION").to_string());
        Self {
            kv,
            config,
            environment,
        }
    }

    fn snapshot_key(execution_id: ExecutionId, step_index: usize, ts: u64) -> String {
        format!("snapshot:{}:{}:{}", execution_id, step_index, ts)
    }

    fn index_key(execution_id: ExecutionId) -> String {
        format!("snapshots:{}", execution_id)
    }

    /// Capture a snapshot of the record at its current progress
    pub async fn capture(&self, record: &ExecutionRecord) -> EngineResult<Snapshot> {
        let step_index = record
            .step_states
            .iter()
            .filter(|s| {
                matches!(
                    s.status,
                    StepStatus::Completed | StepStatus::Skipped | StepStatus::Failed
                )
            })
            .count();
        let ts = now_ms();
        let snapshot = Snapshot {
            execution_id: record.execution_id,
            step_index,
            captured_at: Utc::now(),
            state: sanitize(serde_json::to_value(record)?),
            step_outputs: record.step_outputs(),
            environment: self.environment.clone(),
        };

        let key = Self::snapshot_key(record.execution_id, step_index, ts);
        let encoded = encode(&serde_json::to_vec(&snapshot)?, self.config.compress_over_bytes)?;
        let ttl = Duration::from_millis(self.config.ttl_ms);
        self.kv.set(&key, &encoded, SetOptions::with_ttl(ttl)).await?;

        let index_key = Self::index_key(record.execution_id);
        self.kv.zadd(&index_key, &key, ts as f64).await?;
        self.kv.expire(&index_key, ttl).await?;
        self.trim(record.execution_id).await?;

        debug!(execution_id = %record.execution_id, step_index, "snapshot captured");
        Ok(snapshot)
    }

    /// Ring bound: drop oldest snapshots beyond the per-execution cap
    async fn trim(&self, execution_id: ExecutionId) -> EngineResult<()> {
        let index_key = Self::index_key(execution_id);
        let count = self.kv.zcard(&index_key).await? as usize;
        if count <= self.config.max_per_execution {
            return Ok(());
        }
        let excess = count - self.config.max_per_execution;
        let oldest = self.kv.zrange(&index_key, 0, excess as i64 - 1).await?;
        let mut max_removed_ts = 0u64;
        for member in &oldest {
            self.kv.del(member).await?;
            if let Some(ts) = member.rsplit(':').next().and_then(|t| t.parse::<u64>().ok()) {
                max_removed_ts = max_removed_ts.max(ts);
            }
        }
        if max_removed_ts > 0 {
            self.kv
                .zremrangebyscore(&index_key, 0.0, max_removed_ts as f64)
                .await?;
        }
        Ok(())
    }

    /// All snapshot keys for an execution, oldest first
    pub async fn list(&self, execution_id: ExecutionId) -> EngineResult<Vec<String>> {
        self.kv.zrange(&Self::index_key(execution_id), 0, -1).await
    }

    /// Load the newest snapshot at or before `step_index`
    pub async fn load_nearest(
        &self,
        execution_id: ExecutionId,
        step_index: usize,
    ) -> EngineResult<Option<Snapshot>> {
        let members = self.list(execution_id).await?;
        let mut best: Option<(usize, u64, String)> = None;
        for member in members {
            let mut parts = member.rsplit(':');
            let ts: u64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
            let step: usize = parts.next().and_then(|p| p.parse().ok()).unwrap_or(usize::MAX);
            if step <= step_index && best.as_ref().map_or(true, |(s, t, _)| (step, ts) > (*s, *t)) {
                best = Some((step, ts, member));
            }
        }
        let Some((_, _, key)) = best else {
            return Ok(None);
        };
        match self.kv.get(&key).await? {
            Some(bytes) => {
                let decoded = decode(&bytes)?;
                Ok(Some(serde_json::from_slice(&decoded)?))
            }
            None => Ok(None),
        }
    }

    /// Rebuild an execution record from a snapshot, with every step after
    /// the captured progress reset to pending for forward replay
    pub fn restore(&self, snapshot: &Snapshot) -> EngineResult<ExecutionRecord> {
        let mut record: ExecutionRecord = serde_json::from_value(snapshot.state.clone())?;
        for step in record.step_states.iter_mut() {
            if step.status == StepStatus::InProgress {
                step.status = StepStatus::Pending;
                step.reissue_on_resume = true;
            }
        }
        record.version = 0;
        Ok(record)
    }
}

/// Strip secret material from a serialised record
fn sanitize(mut state: Value) -> Value {
    if let Some(context) = state.get_mut("context").and_then(Value::as_object_mut) {
        context.retain(|key, _| {
            let lower = key.to_lowercase();
            !(lower.contains("secret")
                || lower.contains("password")
                || lower.contains("api_key")
                || lower.contains("private"))
        });
    }
    state
}

fn encode(payload: &[u8], compress_over: usize) -> EngineResult<Vec<u8>> {
    if payload.len() <= compress_over {
        let mut out = Vec::with_capacity(payload.len() + 1);
        out.push(ENCODING_PLAIN);
        out.extend_from_slice(payload);
        return Ok(out);
    }
    let compressed = lz4::block::compress(payload, None, true)
        .map_err(|e| EngineError::Serialization(format!("lz4 compress: {}", e)))?;
    let mut out = Vec::with_capacity(compressed.len() + 1);
    out.push(ENCODING_LZ4);
    out.extend_from_slice(&compressed);
    Ok(out)
}

fn decode(stored: &[u8]) -> EngineResult<Vec<u8>> {
    match stored.split_first() {
        Some((&ENCODING_PLAIN, rest)) => Ok(rest.to_vec()),
        Some((&ENCODING_LZ4, rest)) => lz4::block::decompress(rest, None)
            .map_err(|e| EngineError::Serialization(format!("lz4 decompress: {}", e))),
        _ => Err(EngineError::Serialization("empty snapshot payload".into())),
    }
}

/// Paths ignored by default: capture times and write bookkeeping differ
/// between otherwise identical replays
const VOLATILE_PATHS: &[&str] = &[
    "/captured_at",
    "/state/created_at",
    "/state/updated_at",
    "/state/version",
    "/state/checkpoint",
    "/state/segment_number",
];

/// Compare two snapshots, reporting path-level differences
pub fn compare_snapshots(left: &Snapshot, right: &Snapshot) -> EngineResult<Vec<SnapshotDiff>> {
    let left_doc = serde_json::to_value(left)?;
    let right_doc = serde_json::to_value(right)?;
    let mut diffs = Vec::new();
    diff_values("", &left_doc, &right_doc, &mut diffs);
    diffs.retain(|d| {
        !VOLATILE_PATHS
            .iter()
            .any(|v| d.path == *v || d.path.starts_with(&format!("{}/", v)))
            && !is_volatile_step_field(&d.path)
    });
    Ok(diffs)
}

fn is_volatile_step_field(path: &str) -> bool {
    path.ends_with("/started_at")
        || path.ends_with("/completed_at")
        || path.ends_with("/latency_ms")
}

fn diff_values(path: &str, left: &Value, right: &Value, diffs: &mut Vec<SnapshotDiff>) {
    match (left, right) {
        (Value::Object(l), Value::Object(r)) => {
            for (key, lv) in l {
                let child = format!("{}/{}", path, key);
                match r.get(key) {
                    Some(rv) => diff_values(&child, lv, rv, diffs),
                    None => diffs.push(SnapshotDiff {
                        path: child,
                        left: Some(lv.clone()),
                        right: None,
                    }),
                }
            }
            for (key, rv) in r {
                if !l.contains_key(key) {
                    diffs.push(SnapshotDiff {
                        path: format!("{}/{}", path, key),
                        left: None,
                        right: Some(rv.clone()),
                    });
                }
            }
        }
        (Value::Array(l), Value::Array(r)) => {
            let max = l.len().max(r.len());
            for i in 0..max {
                let child = format!("{}/{}", path, i);
                match (l.get(i), r.get(i)) {
                    (Some(lv), Some(rv)) => diff_values(&child, lv, rv, diffs),
                    (lv, rv) => diffs.push(SnapshotDiff {
                        path: child,
                        left: lv.cloned(),
                        right: rv.cloned(),
                    }),
                }
            }
        }
        (l, r) if l != r => diffs.push(SnapshotDiff {
            path: path.to_string(),
            left: Some(l.clone()),
            right: Some(r.clone()),
        }),
        _ => {}
    }
}
