//! End-to-end coordination scenarios driven through `CoordinationEngine`.
//!
//! Covers:
//! - **OCC**: stale writes, idempotent retries, racing writers, rebasing
//! - **Sagas**: forward completion and reverse-order compensation
//! - **2PC**: unanimous commit, abort on no vote, prepare timeout
//! - **Locks**: deadlock victim selection, abandoned waits

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tce_common::prelude::*;
use tce_txn::testing::{
    FlakyRecordStore, PrepareScript, ScriptedInvoker, ScriptedParticipant, StepScript,
};
use tce_txn::{
    CoordinationEngine, InMemoryRecordStore, Mutation, OccOutcome, RecordStore, SagaStatus,
    StepKind, StepStatus, TransactionStatus, VersionedRecord, WriteOutcome,
};
use tokio::sync::Barrier;

// ============================================================================
// Test Helpers
// ============================================================================

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.saga.step_timeout = Duration::from_millis(500);
    config.two_phase.prepare_timeout = Duration::from_millis(200);
    config.two_phase.commit_timeout = Duration::from_millis(200);
    config.two_phase.commit_retry_backoff = Duration::from_millis(1);
    config.adapter.initial_backoff = Duration::from_millis(1);
    config.server.sagas = vec![saga("order", 3), saga("long", 4)];
    config
}

fn saga(saga_type: &str, steps: u32) -> SagaDefinition {
    SagaDefinition {
        saga_type: saga_type.to_string(),
        steps: (1..=steps)
            .map(|n| StepDefinition {
                name: format!("step{n}"),
                action: format!("{saga_type}.step{n}"),
                compensation: Some(format!("{saga_type}.undo{n}")),
                data: json!({ "n": n }),
            })
            .collect(),
    }
}

fn engine_with(store: Arc<dyn RecordStore>, invoker: Arc<ScriptedInvoker>) -> CoordinationEngine {
    CoordinationEngine::new(test_config(), store, invoker).unwrap()
}

fn engine() -> (CoordinationEngine, Arc<ScriptedInvoker>) {
    let invoker = Arc::new(ScriptedInvoker::new());
    (
        engine_with(Arc::new(InMemoryRecordStore::new()), invoker.clone()),
        invoker,
    )
}

/// Store that holds the first two loads until both have read, so two
/// writers are guaranteed to start from the same version.
struct RacingStore {
    inner: InMemoryRecordStore,
    barrier: Barrier,
    loads: AtomicU32,
}

impl RacingStore {
    fn new() -> Self {
        Self {
            inner: InMemoryRecordStore::new(),
            barrier: Barrier::new(2),
            loads: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl RecordStore for RacingStore {
    async fn load(&self, key: &ResourceKey) -> Result<Option<VersionedRecord>> {
        let record = self.inner.load(key).await;
        if self.loads.fetch_add(1, Ordering::SeqCst) < 2 {
            self.barrier.wait().await;
        }
        record
    }

    async fn compare_and_swap(
        &self,
        key: &ResourceKey,
        expected_version: u64,
        payload: Payload,
    ) -> Result<WriteOutcome> {
        self.inner.compare_and_swap(key, expected_version, payload).await
    }
}

// ============================================================================
// Optimistic Concurrency
// ============================================================================

mod occ {
    use super::*;

    #[tokio::test]
    async fn test_stale_write_never_mutates() {
        let (engine, _) = engine();
        let key: ResourceKey = "account:1".into();

        engine
            .execute_optimistic_update(&key, 0, &Mutation::Replace(json!({"balance": 10})))
            .await
            .unwrap();
        let before = engine.read_record(&key).await.unwrap();

        let outcome = engine
            .execute_optimistic_update(&key, 7, &Mutation::Replace(json!({"balance": 0})))
            .await
            .unwrap();
        assert_eq!(outcome, OccOutcome::VersionMismatch { expected: 7, actual: 1 });

        let after = engine.read_record(&key).await.unwrap();
        assert_eq!(after.version, before.version);
        assert_eq!(after.payload, before.payload);
    }

    #[tokio::test]
    async fn test_same_expected_version_applies_once() {
        let (engine, _) = engine();
        let key: ResourceKey = "cart:9".into();
        let add = Mutation::Merge(json!({"item": "book"}));

        let first = engine.execute_optimistic_update(&key, 0, &add).await.unwrap();
        let second = engine.execute_optimistic_update(&key, 0, &add).await.unwrap();

        assert_eq!(first, OccOutcome::Success { new_version: 1 });
        assert_eq!(second.code(), "VERSION_MISMATCH");
        assert_eq!(engine.read_record(&key).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers_one_wins() {
        let store = Arc::new(RacingStore::new());
        store
            .inner
            .compare_and_swap(&"seat:4A".into(), 0, json!({"holder": null}))
            .await
            .unwrap();
        let engine = engine_with(store, Arc::new(ScriptedInvoker::new()));
        let key: ResourceKey = "seat:4A".into();

        let alice = Mutation::Replace(json!({"holder": "alice"}));
        let bob = Mutation::Replace(json!({"holder": "bob"}));
        let (a, b) = tokio::join!(
            engine.execute_optimistic_update(&key, 1, &alice),
            engine.execute_optimistic_update(&key, 1, &bob),
        );
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| o.code());

        assert_eq!(outcomes[0].code(), "CONCURRENT_MODIFICATION");
        assert_eq!(outcomes[1], OccOutcome::Success { new_version: 2 });
        assert_eq!(engine.read_record(&key).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_rebase_retry_applies_both_merges() {
        let store = Arc::new(RacingStore::new());
        let mut config = test_config();
        config.occ.max_conflict_retries = 1;
        let engine =
            CoordinationEngine::new(config, store, Arc::new(ScriptedInvoker::new())).unwrap();
        let key: ResourceKey = "doc:1".into();

        let mutation_a = Mutation::Merge(json!({"a": 1}));
        let mutation_b = Mutation::Merge(json!({"b": 2}));
        let (a, b) = tokio::join!(
            engine.execute_optimistic_update(&key, 0, &mutation_a),
            engine.execute_optimistic_update(&key, 0, &mutation_b),
        );
        assert!(a.unwrap().is_success());
        assert!(b.unwrap().is_success());

        let record = engine.read_record(&key).await.unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.payload, json!({"a": 1, "b": 2}));
        assert_eq!(engine.stats().occ.rebase_retries, 1);
    }

    #[tokio::test]
    async fn test_transient_store_failures_absorbed() {
        let store = Arc::new(FlakyRecordStore::new(2));
        let engine = engine_with(store.clone(), Arc::new(ScriptedInvoker::new()));

        let outcome = engine
            .execute_optimistic_update(&"k".into(), 0, &Mutation::Replace(json!(1)))
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert!(store.calls() >= 4);
    }

    #[tokio::test]
    async fn test_exhausted_store_failures_translated() {
        let engine = engine_with(
            Arc::new(FlakyRecordStore::new(100)),
            Arc::new(ScriptedInvoker::new()),
        );
        let err = engine.read_record(&"k".into()).await.unwrap_err();
        assert_eq!(err.code(), "UNAVAILABLE");
        assert!(!err.is_transient());
    }
}

// ============================================================================
// Sagas
// ============================================================================

mod sagas {
    use super::*;

    #[tokio::test]
    async fn test_step_two_failure_compensates_step_one() {
        let (engine, invoker) = engine();
        invoker.set("order.step2", StepScript::Fail("card declined".into()));

        let saga_id = engine.start_saga("order", json!({"order_id": 42})).unwrap();
        let saga = engine
            .wait_for_saga(saga_id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(saga.status, SagaStatus::Compensated);
        assert_eq!(invoker.invocations_of("order.undo1"), 1);
        assert_eq!(invoker.invocations_of("order.step3"), 0);
        assert_eq!(invoker.invocations_of("order.undo2"), 0);
        assert_eq!(saga.action(1).unwrap().status, StepStatus::Compensated);
        assert_eq!(saga.action(2).unwrap().status, StepStatus::Failed);
        assert!(saga.action(3).is_none());
    }

    #[tokio::test]
    async fn test_compensation_runs_in_reverse_order() {
        let (engine, invoker) = engine();
        invoker.set("long.step4", StepScript::Fail("out of stock".into()));

        let saga_id = engine.start_saga("long", serde_json::Value::Null).unwrap();
        let saga = engine
            .wait_for_saga(saga_id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(saga.status, SagaStatus::Compensated);
        assert_eq!(
            invoker.executed(StepKind::Compensation),
            vec!["long.undo3", "long.undo2", "long.undo1"]
        );
    }

    #[tokio::test]
    async fn test_forward_steps_run_in_sequence() {
        let (engine, invoker) = engine();
        invoker.set("order.step1", StepScript::Succeed(json!({"reservation": "r-1"})));

        let saga_id = engine.start_saga("order", json!({})).unwrap();
        let saga = engine
            .wait_for_saga(saga_id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(saga.status, SagaStatus::Completed);
        assert_eq!(
            invoker.executed(StepKind::Action),
            vec!["order.step1", "order.step2", "order.step3"]
        );
        assert_eq!(saga.context_data["reservation"], json!("r-1"));
    }

    #[tokio::test]
    async fn test_unknown_saga_type() {
        let (engine, _) = engine();
        let err = engine.start_saga("refund", json!({})).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_SAGA_TYPE");
    }
}

// ============================================================================
// Two-Phase Commit
// ============================================================================

mod two_phase {
    use super::*;

    fn register(engine: &CoordinationEngine, parts: Vec<ScriptedParticipant>) -> Vec<Arc<ScriptedParticipant>> {
        parts
            .into_iter()
            .map(|p| {
                let p = Arc::new(p);
                engine.register_participant(p.clone());
                p
            })
            .collect()
    }

    fn ids(parts: &[Arc<ScriptedParticipant>]) -> Vec<ParticipantId> {
        use tce_txn::Participant;
        parts.iter().map(|p| p.id()).collect()
    }

    #[tokio::test]
    async fn test_commit_after_unanimous_prepare() {
        let (engine, _) = engine();
        let parts = register(
            &engine,
            vec![
                ScriptedParticipant::new("p1"),
                ScriptedParticipant::new("p2"),
                ScriptedParticipant::new("p3"),
            ],
        );

        let txn_id = engine
            .start_two_phase_commit(ids(&parts), json!({"transfer": 100}))
            .unwrap();
        let txn = engine
            .wait_for_transaction(txn_id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(txn.status, TransactionStatus::Committed);
        for p in &parts {
            assert_eq!(p.prepare_count(), 1);
            assert_eq!(p.commit_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_no_vote_means_no_commit_effects() {
        let (engine, _) = engine();
        let parts = register(
            &engine,
            vec![
                ScriptedParticipant::new("p1"),
                ScriptedParticipant::new("p2").with_prepare(PrepareScript::No),
                ScriptedParticipant::new("p3"),
            ],
        );

        let txn_id = engine.start_two_phase_commit(ids(&parts), json!({})).unwrap();
        let txn = engine
            .wait_for_transaction(txn_id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(txn.status, TransactionStatus::Aborted);
        assert!(parts.iter().all(|p| p.commit_attempts() == 0));
    }

    #[tokio::test]
    async fn test_prepare_timeout_aborts_all() {
        let (engine, _) = engine();
        let parts = register(
            &engine,
            vec![
                ScriptedParticipant::new("p1"),
                ScriptedParticipant::new("p2").with_prepare(PrepareScript::Hang),
                ScriptedParticipant::new("p3"),
            ],
        );

        let txn_id = engine.start_two_phase_commit(ids(&parts), json!({})).unwrap();
        let txn = engine
            .wait_for_transaction(txn_id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(txn.status, TransactionStatus::Aborted);
        assert_eq!(parts[0].abort_count(), 1);
        assert_eq!(parts[2].abort_count(), 1);
        assert!(parts.iter().all(|p| p.commit_attempts() == 0));
    }

    #[tokio::test]
    async fn test_unknown_transaction_presumed_aborted() {
        let (engine, _) = engine();
        assert!(engine.get_transaction_status(TxnId(4242)).is_err());
        assert_eq!(
            engine.coordinator().get_state(TxnId(4242)),
            Some(TransactionStatus::Aborted)
        );
    }
}

// ============================================================================
// Deadlocks
// ============================================================================

mod deadlocks {
    use super::*;

    #[tokio::test]
    async fn test_two_owner_cycle_aborts_younger() {
        let (engine, _) = engine();
        let locks = engine.lock_manager().clone();
        let (k1, k2): (ResourceKey, ResourceKey) = ("k1".into(), "k2".into());
        let (a, b): (OwnerId, OwnerId) = ("A".into(), "B".into());
        let lease = Duration::from_secs(30);

        assert!(locks.acquire(&k1, LockType::Write, &a, lease).unwrap().is_acquired());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(locks.acquire(&k2, LockType::Write, &b, lease).unwrap().is_acquired());

        let a_wait = {
            let locks = locks.clone();
            let (k2, a) = (k2.clone(), a.clone());
            tokio::spawn(async move {
                locks
                    .acquire_wait(&k2, LockType::Write, &a, lease, Duration::from_secs(5))
                    .await
            })
        };
        let b_wait = {
            let locks = locks.clone();
            let (k1, b) = (k1.clone(), b.clone());
            tokio::spawn(async move {
                locks
                    .acquire_wait(&k1, LockType::Write, &b, lease, Duration::from_secs(5))
                    .await
            })
        };

        let mut cycles = Vec::new();
        for _ in 0..100 {
            cycles = engine.run_deadlock_detection();
            if !cycles.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].victim, b);

        let b_result = b_wait.await.unwrap();
        assert_eq!(b_result.unwrap_err().code(), "LOCK_ACQUISITION_FAILED");
        let a_lock = a_wait.await.unwrap().unwrap();
        assert_eq!(a_lock.resource_key, k2);
        assert!(engine.run_deadlock_detection().is_empty());
    }

    #[tokio::test]
    async fn test_aborted_waiter_does_not_cause_false_deadlock() {
        let (engine, _) = engine();
        let locks = engine.lock_manager().clone();
        let (k1, k2): (ResourceKey, ResourceKey) = ("k1".into(), "k2".into());
        let (a, b): (OwnerId, OwnerId) = ("A".into(), "B".into());
        let lease = Duration::from_secs(30);

        assert!(locks.acquire(&k1, LockType::Write, &a, lease).unwrap().is_acquired());
        assert!(locks.acquire(&k2, LockType::Write, &b, lease).unwrap().is_acquired());

        // A starts waiting on k2, then its task is torn down
        let a_wait = {
            let locks = locks.clone();
            let (k2, a) = (k2.clone(), a.clone());
            tokio::spawn(async move {
                locks
                    .acquire_wait(&k2, LockType::Write, &a, lease, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(locks.wait_graph().is_waiting(&a));
        a_wait.abort();
        assert!(a_wait.await.unwrap_err().is_cancelled());
        assert!(!locks.wait_graph().is_waiting(&a));

        let b_wait = {
            let locks = locks.clone();
            let (k1, b) = (k1.clone(), b.clone());
            tokio::spawn(async move {
                locks
                    .acquire_wait(&k1, LockType::Write, &b, lease, Duration::from_millis(200))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(engine.run_deadlock_detection().is_empty());

        // B simply times out and keeps what it holds
        let err = b_wait.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "LOCK_CONFLICT");
        assert_eq!(locks.locks_held_by(&b).len(), 1);
        assert_eq!(locks.stats().victims_aborted, 0);
    }

    #[tokio::test]
    async fn test_victim_age_ignores_released_locks() {
        let (engine, _) = engine();
        let locks = engine.lock_manager().clone();
        let (old, k2, k3): (ResourceKey, ResourceKey, ResourceKey) =
            ("old".into(), "k2".into(), "k3".into());
        let (a, b): (OwnerId, OwnerId) = ("A".into(), "B".into());
        let lease = Duration::from_secs(30);

        // A locked first, but its only remaining lock is newer than B's
        assert!(locks.acquire(&old, LockType::Write, &a, lease).unwrap().is_acquired());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(locks.acquire(&k2, LockType::Write, &b, lease).unwrap().is_acquired());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(locks.acquire(&k3, LockType::Write, &a, lease).unwrap().is_acquired());
        assert!(locks.release(&old, &a));

        let a_wait = {
            let locks = locks.clone();
            let (k2, a) = (k2.clone(), a.clone());
            tokio::spawn(async move {
                locks
                    .acquire_wait(&k2, LockType::Write, &a, lease, Duration::from_secs(5))
                    .await
            })
        };
        let b_wait = {
            let locks = locks.clone();
            let (k3, b) = (k3.clone(), b.clone());
            tokio::spawn(async move {
                locks
                    .acquire_wait(&k3, LockType::Write, &b, lease, Duration::from_secs(5))
                    .await
            })
        };

        let mut cycles = Vec::new();
        for _ in 0..100 {
            cycles = engine.run_deadlock_detection();
            if !cycles.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].victim, a);
        assert_eq!(a_wait.await.unwrap().unwrap_err().code(), "LOCK_ACQUISITION_FAILED");
        assert_eq!(b_wait.await.unwrap().unwrap().resource_key, k3);
    }
}
