//! Scripted collaborators for tests and local experiments.

use crate::coordinator::{Participant, PrepareReply};
use crate::saga::{ActionInvoker, StepInvocation, StepKind};
use crate::version_store::{InMemoryRecordStore, RecordStore, VersionedRecord, WriteOutcome};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tce_common::error::{ProtocolError, StorageError};
use tce_common::prelude::*;

// ============================================================================
// 2PC participant
// ============================================================================

/// Scripted answer to PREPARE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareScript {
    Yes,
    No,
    Error,
    /// Never answer
    Hang,
}

/// Participant with a fixed PREPARE script that counts every message.
pub struct ScriptedParticipant {
    id: ParticipantId,
    prepare: PrepareScript,
    commit_failures: AtomicU32,
    prepares: AtomicU32,
    commit_attempts: AtomicU32,
    commits: AtomicU32,
    aborts: AtomicU32,
}

impl ScriptedParticipant {
    pub fn new(id: impl Into<ParticipantId>) -> Self {
        Self {
            id: id.into(),
            prepare: PrepareScript::Yes,
            commit_failures: AtomicU32::new(0),
            prepares: AtomicU32::new(0),
            commit_attempts: AtomicU32::new(0),
            commits: AtomicU32::new(0),
            aborts: AtomicU32::new(0),
        }
    }

    pub fn with_prepare(mut self, script: PrepareScript) -> Self {
        self.prepare = script;
        self
    }

    /// Fail the next `n` COMMIT deliveries with a transient error.
    pub fn fail_commits(self, n: u32) -> Self {
        self.commit_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn prepare_count(&self) -> u32 {
        self.prepares.load(Ordering::SeqCst)
    }

    /// COMMITs received, successful or not.
    pub fn commit_attempts(&self) -> u32 {
        self.commit_attempts.load(Ordering::SeqCst)
    }

    /// COMMITs applied.
    pub fn commit_count(&self) -> u32 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn abort_count(&self) -> u32 {
        self.aborts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Participant for ScriptedParticipant {
    fn id(&self) -> ParticipantId {
        self.id.clone()
    }

    async fn prepare(&self, _txn_id: TxnId, _payload: &Payload) -> Result<PrepareReply> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        match self.prepare {
            PrepareScript::Yes => Ok(PrepareReply::yes()),
            PrepareScript::No => Ok(PrepareReply::no()),
            PrepareScript::Error => Err(Error::Protocol(ProtocolError::RemoteRejected {
                target: self.id.to_string(),
                reason: "scripted prepare failure".into(),
            })),
            PrepareScript::Hang => futures::future::pending().await,
        }
    }

    async fn commit(&self, txn_id: TxnId) -> Result<Payload> {
        self.commit_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .commit_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Protocol(ProtocolError::RemoteUnavailable {
                target: self.id.to_string(),
                reason: "scripted commit failure".into(),
            }));
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!({ "committed": txn_id.0 }))
    }

    async fn abort(&self, _txn_id: TxnId) -> Result<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Saga action invoker
// ============================================================================

/// Scripted outcome of a step type.
#[derive(Debug, Clone)]
pub enum StepScript {
    Succeed(Payload),
    Fail(String),
    Hang,
}

/// One call seen by [`ScriptedInvoker`].
#[derive(Debug, Clone)]
pub struct InvocationRecord {
    pub saga_id: SagaId,
    pub step_number: u32,
    pub kind: StepKind,
    pub step_type: String,
    pub idempotency_key: String,
}

/// Invoker answering per step type; unscripted types succeed with `{}`.
#[derive(Default)]
pub struct ScriptedInvoker {
    scripts: Mutex<HashMap<String, StepScript>>,
    journal: Mutex<Vec<InvocationRecord>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, step_type: &str, script: StepScript) -> Self {
        self.set(step_type, script);
        self
    }

    pub fn set(&self, step_type: &str, script: StepScript) {
        self.scripts.lock().insert(step_type.to_string(), script);
    }

    pub fn journal(&self) -> Vec<InvocationRecord> {
        self.journal.lock().clone()
    }

    /// Step types invoked for `kind`, in call order.
    pub fn executed(&self, kind: StepKind) -> Vec<String> {
        self.journal
            .lock()
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.step_type.clone())
            .collect()
    }

    pub fn invocations_of(&self, step_type: &str) -> usize {
        self.journal
            .lock()
            .iter()
            .filter(|r| r.step_type == step_type)
            .count()
    }
}

#[async_trait]
impl ActionInvoker for ScriptedInvoker {
    async fn invoke(&self, invocation: StepInvocation) -> Result<Payload> {
        self.journal.lock().push(InvocationRecord {
            saga_id: invocation.saga_id,
            step_number: invocation.step_number,
            kind: invocation.kind,
            step_type: invocation.step_type.clone(),
            idempotency_key: invocation.idempotency_key.clone(),
        });
        let script = self.scripts.lock().get(&invocation.step_type).cloned();

        match script {
            None => Ok(Payload::Object(Default::default())),
            Some(StepScript::Succeed(output)) => Ok(output),
            Some(StepScript::Fail(reason)) => Err(Error::Protocol(ProtocolError::RemoteRejected {
                target: invocation.step_type,
                reason,
            })),
            Some(StepScript::Hang) => futures::future::pending().await,
        }
    }
}

// ============================================================================
// Record store
// ============================================================================

/// In-memory store whose first `n` calls fail with a transient error.
pub struct FlakyRecordStore {
    inner: InMemoryRecordStore,
    failures_left: AtomicU32,
    calls: AtomicU32,
}

impl FlakyRecordStore {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: InMemoryRecordStore::new(),
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn trip(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            Err(Error::Storage(StorageError::Unavailable(
                "scripted outage".into(),
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecordStore for FlakyRecordStore {
    async fn load(&self, key: &ResourceKey) -> Result<Option<VersionedRecord>> {
        self.trip()?;
        self.inner.load(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &ResourceKey,
        expected_version: u64,
        payload: Payload,
    ) -> Result<WriteOutcome> {
        self.trip()?;
        self.inner.compare_and_swap(key, expected_version, payload).await
    }
}
