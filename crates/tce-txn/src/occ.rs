//! Optimistic Concurrency Control (OCC).
//!
//! Single-resource compare-and-swap updates on top of the version store:
//! - Read phase: load the current record and check the caller's expected version
//! - Mutate phase: apply the caller's mutator to the payload, no locks held
//! - Write phase: conditional write; a lost race is reported, not hidden
//!
//! A stale expected version fails immediately with `VERSION_MISMATCH`. A race
//! lost between read and write is `CONCURRENT_MODIFICATION`, optionally
//! preceded by a bounded number of rebase attempts.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tce_common::error::TransactionError;
use tce_common::prelude::*;

use crate::version_store::{VersionStore, WriteOutcome};

/// Payload-level mutation carried by `ExecuteOptimisticUpdate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Mutation {
    /// Replace the payload wholesale
    Replace(Payload),
    /// Shallow merge of a JSON object into the payload
    Merge(Payload),
    /// Payload becomes null
    Clear,
}

impl Mutation {
    pub fn apply(&self, current: &Payload) -> Result<Payload> {
        match self {
            Mutation::Replace(value) => Ok(value.clone()),
            Mutation::Clear => Ok(Payload::Null),
            Mutation::Merge(patch) => {
                let patch = patch.as_object().ok_or_else(|| {
                    Error::invalid_argument("merge mutation requires a JSON object")
                })?;
                let mut merged = match current {
                    Payload::Object(map) => map.clone(),
                    Payload::Null => serde_json::Map::new(),
                    _ => {
                        return Err(Error::invalid_argument(
                            "cannot merge into a non-object payload",
                        ))
                    }
                };
                for (k, v) in patch {
                    merged.insert(k.clone(), v.clone());
                }
                Ok(Payload::Object(merged))
            }
        }
    }
}

/// Tagged result of an optimistic update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OccOutcome {
    Success { new_version: u64 },
    /// The caller's expected version was already stale when read
    VersionMismatch { expected: u64, actual: u64 },
    /// Another writer won the race between read and write
    ConcurrentModification { expected: u64, current: u64 },
}

impl OccOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, OccOutcome::Success { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            OccOutcome::Success { .. } => "SUCCESS",
            OccOutcome::VersionMismatch { .. } => "VERSION_MISMATCH",
            OccOutcome::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
        }
    }

    /// Convert contention outcomes into their error form.
    pub fn into_result(self, key: &ResourceKey) -> Result<u64> {
        match self {
            OccOutcome::Success { new_version } => Ok(new_version),
            OccOutcome::VersionMismatch { expected, actual } => {
                Err(Error::Transaction(TransactionError::VersionMismatch {
                    resource_key: key.to_string(),
                    expected,
                    actual,
                }))
            }
            OccOutcome::ConcurrentModification { expected, current } => {
                Err(Error::Transaction(TransactionError::ConcurrentModification {
                    resource_key: key.to_string(),
                    expected,
                    current,
                }))
            }
        }
    }
}

/// OCC statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OccStats {
    pub updates_attempted: u64,
    pub updates_committed: u64,
    pub version_mismatches: u64,
    pub concurrent_modifications: u64,
    pub rebase_retries: u64,
}

/// Optimistic concurrency controller.
pub struct OptimisticController {
    store: Arc<VersionStore>,
    config: OccConfig,
    stats: Mutex<OccStats>,
}

impl OptimisticController {
    pub fn new(store: Arc<VersionStore>, config: OccConfig) -> Self {
        Self {
            store,
            config,
            stats: Mutex::new(OccStats::default()),
        }
    }

    /// Apply `mutator` to the record at `key` if its version is `expected_version`.
    ///
    /// `Err` is reserved for storage failures and mutator errors; contention
    /// is reported through [`OccOutcome`].
    pub async fn update_optimistic<F>(
        &self,
        key: &ResourceKey,
        expected_version: u64,
        mutator: F,
    ) -> Result<OccOutcome>
    where
        F: Fn(&Payload) -> Result<Payload> + Send + Sync,
    {
        self.stats.lock().updates_attempted += 1;

        let record = self.store.read(key).await?;
        if record.version != expected_version {
            self.stats.lock().version_mismatches += 1;
            debug!(
                resource_key = %key,
                expected = expected_version,
                actual = record.version,
                "stale expected version"
            );
            return Ok(OccOutcome::VersionMismatch {
                expected: expected_version,
                actual: record.version,
            });
        }

        let mut base = record;
        let mut rebases = 0u32;
        loop {
            let new_payload = mutator(&base.payload)?;
            match self
                .store
                .write_if_version(key, base.version, new_payload)
                .await?
            {
                WriteOutcome::Success { new_version } => {
                    self.stats.lock().updates_committed += 1;
                    return Ok(OccOutcome::Success { new_version });
                }
                WriteOutcome::VersionConflict { current_version }
                    if rebases < self.config.max_conflict_retries =>
                {
                    rebases += 1;
                    self.stats.lock().rebase_retries += 1;
                    debug!(
                        resource_key = %key,
                        current_version,
                        attempt = rebases,
                        "lost write race, rebasing on latest record"
                    );
                    base = self.store.read(key).await?;
                }
                WriteOutcome::VersionConflict { current_version } => {
                    self.stats.lock().concurrent_modifications += 1;
                    return Ok(OccOutcome::ConcurrentModification {
                        expected: expected_version,
                        current: current_version,
                    });
                }
                WriteOutcome::NotFound => {
                    return Err(Error::Storage(
                        tce_common::error::StorageError::RecordNotFound(key.to_string()),
                    ));
                }
            }
        }
    }

    /// `ExecuteOptimisticUpdate` with a declarative mutation.
    pub async fn execute(
        &self,
        key: &ResourceKey,
        expected_version: u64,
        mutation: &Mutation,
    ) -> Result<OccOutcome> {
        self.update_optimistic(key, expected_version, |payload| mutation.apply(payload))
            .await
    }

    pub fn stats(&self) -> OccStats {
        self.stats.lock().clone()
    }
}
