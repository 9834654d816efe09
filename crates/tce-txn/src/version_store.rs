//! Version Store Adapter.
//!
//! Wraps a backing [`RecordStore`] and exposes the two primitives the rest of
//! the engine builds on:
//! - `read`: current payload and version (absent records read as version 0)
//! - `write_if_version`: conditional write that succeeds only when the stored
//!   version equals the caller's expected version
//!
//! Transient backing-store failures are retried with backoff here and
//! translated before they reach OCC or the orchestrators.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tce_common::prelude::*;
use tce_common::retry;

/// A record with its optimistic version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub resource_key: ResourceKey,
    /// Starts at 1 on first write; 0 means the record does not exist yet.
    pub version: u64,
    pub payload: Payload,
    pub updated_at: DateTime<Utc>,
}

impl VersionedRecord {
    /// Placeholder returned for keys that were never written.
    pub fn absent(resource_key: ResourceKey) -> Self {
        Self {
            resource_key,
            version: 0,
            payload: Payload::Null,
            updated_at: DateTime::<Utc>::default(),
        }
    }

    pub fn exists(&self) -> bool {
        self.version > 0
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WriteOutcome {
    Success { new_version: u64 },
    VersionConflict { current_version: u64 },
    NotFound,
}

/// Backing record store.
///
/// Implementations must make `compare_and_swap` atomic per key: the version
/// check and the write happen as one step, and a rejected write leaves the
/// record untouched.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load(&self, key: &ResourceKey) -> Result<Option<VersionedRecord>>;

    /// Write `payload` if the stored version equals `expected_version`.
    /// `expected_version == 0` creates an absent record at version 1.
    async fn compare_and_swap(
        &self,
        key: &ResourceKey,
        expected_version: u64,
        payload: Payload,
    ) -> Result<WriteOutcome>;
}

/// In-process record store.
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: DashMap<ResourceKey, VersionedRecord>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn load(&self, key: &ResourceKey) -> Result<Option<VersionedRecord>> {
        Ok(self.records.get(key).map(|r| r.clone()))
    }

    async fn compare_and_swap(
        &self,
        key: &ResourceKey,
        expected_version: u64,
        payload: Payload,
    ) -> Result<WriteOutcome> {
        match self.records.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if record.version != expected_version {
                    return Ok(WriteOutcome::VersionConflict {
                        current_version: record.version,
                    });
                }
                record.version += 1;
                record.payload = payload;
                record.updated_at = Utc::now();
                Ok(WriteOutcome::Success {
                    new_version: record.version,
                })
            }
            Entry::Vacant(entry) => {
                if expected_version != 0 {
                    return Ok(WriteOutcome::NotFound);
                }
                entry.insert(VersionedRecord {
                    resource_key: key.clone(),
                    version: 1,
                    payload,
                    updated_at: Utc::now(),
                });
                Ok(WriteOutcome::Success { new_version: 1 })
            }
        }
    }
}

/// Version store statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VersionStoreStats {
    pub reads: u64,
    pub writes: u64,
    pub version_conflicts: u64,
    pub not_found: u64,
    pub store_failures: u64,
}

/// Retrying adapter over a [`RecordStore`].
pub struct VersionStore {
    store: Arc<dyn RecordStore>,
    retry: RetryPolicy,
    stats: Mutex<VersionStoreStats>,
}

impl VersionStore {
    pub fn new(store: Arc<dyn RecordStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            stats: Mutex::new(VersionStoreStats::default()),
        }
    }

    /// Read the current record. Absent keys read as version 0 with a null payload.
    pub async fn read(&self, key: &ResourceKey) -> Result<VersionedRecord> {
        let loaded = self
            .retry
            .run("record.read", || self.store.load(key))
            .await
            .map_err(|e| self.translate(e, "read", key))?;

        self.stats.lock().reads += 1;
        Ok(loaded.unwrap_or_else(|| VersionedRecord::absent(key.clone())))
    }

    /// Conditionally write `payload`. Conflicts are returned as values, never
    /// as errors, and leave the stored record untouched.
    pub async fn write_if_version(
        &self,
        key: &ResourceKey,
        expected_version: u64,
        payload: Payload,
    ) -> Result<WriteOutcome> {
        let outcome = self
            .retry
            .run("record.write_if_version", || {
                self.store
                    .compare_and_swap(key, expected_version, payload.clone())
            })
            .await
            .map_err(|e| self.translate(e, "write", key))?;

        let mut stats = self.stats.lock();
        match outcome {
            WriteOutcome::Success { new_version } => {
                stats.writes += 1;
                trace!(resource_key = %key, new_version, "record written");
            }
            WriteOutcome::VersionConflict { current_version } => {
                stats.version_conflicts += 1;
                debug!(
                    resource_key = %key,
                    expected_version,
                    current_version,
                    "conditional write rejected"
                );
            }
            WriteOutcome::NotFound => stats.not_found += 1,
        }
        Ok(outcome)
    }

    pub fn stats(&self) -> VersionStoreStats {
        self.stats.lock().clone()
    }

    fn translate(&self, err: Error, op: &str, key: &ResourceKey) -> Error {
        self.stats.lock().store_failures += 1;
        warn!(resource_key = %key, op, error = %err, "record store call failed");
        retry::exhausted(err, &format!("record store {op} of {key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> VersionStore {
        VersionStore::new(Arc::new(InMemoryRecordStore::new()), RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_absent_record_reads_as_version_zero() {
        let store = store();
        let record = store.read(&"missing".into()).await.unwrap();
        assert_eq!(record.version, 0);
        assert_eq!(record.payload, Payload::Null);
        assert!(!record.exists());
    }

    #[tokio::test]
    async fn test_create_then_update() {
        let store = store();
        let key = ResourceKey::from("order:1");

        let outcome = store.write_if_version(&key, 0, json!({"qty": 1})).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Success { new_version: 1 });

        let outcome = store.write_if_version(&key, 1, json!({"qty": 2})).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Success { new_version: 2 });

        let record = store.read(&key).await.unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.payload, json!({"qty": 2}));
    }

    #[tokio::test]
    async fn test_stale_write_leaves_record_untouched() {
        let store = store();
        let key = ResourceKey::from("order:1");
        store.write_if_version(&key, 0, json!("a")).await.unwrap();
        let before = store.read(&key).await.unwrap();

        let outcome = store.write_if_version(&key, 0, json!("b")).await.unwrap();
        assert_eq!(outcome, WriteOutcome::VersionConflict { current_version: 1 });

        let after = store.read(&key).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(store.stats().version_conflicts, 1);
    }

    #[tokio::test]
    async fn test_expected_version_on_absent_key() {
        let store = store();
        let outcome = store.write_if_version(&"nope".into(), 3, json!(1)).await.unwrap();
        assert_eq!(outcome, WriteOutcome::NotFound);
    }
}
