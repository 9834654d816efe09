//! # Coordination Engine
//!
//! Facade wiring every coordination component together and exposing the
//! public operations:
//! - Optimistic updates and reads through the version store
//! - Saga start, status and cancellation
//! - Two-phase commit start and status
//! - Advisory lock acquire and release
//! - Policy-routed `submit` for callers that only describe the operation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tce_common::prelude::*;
use uuid::Uuid;

use crate::coordinator::{CoordinatorStats, Participant, TwoPhaseCoordinator, TwoPhaseTransaction};
use crate::deadlock::{DeadlockCycle, DeadlockStats};
use crate::lock_manager::{LockManager, LockManagerStats, LockOutcome};
use crate::occ::{Mutation, OccOutcome, OccStats, OptimisticController};
use crate::policy::PolicyResolver;
use crate::saga::{ActionInvoker, SagaInstance, SagaOrchestrator, SagaStats};
use crate::version_store::{RecordStore, VersionStore, VersionStoreStats, VersionedRecord};

/// A transaction request as classified by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransactionRequest {
    /// Single-resource write, routed by isolation policy
    Write {
        resource_key: ResourceKey,
        resource_type: String,
        operation_type: String,
        #[serde(default)]
        attributes: BTreeMap<String, Payload>,
        expected_version: u64,
        mutation: Mutation,
        /// Lock owner for pessimistic routes; generated when absent
        #[serde(default)]
        owner: Option<OwnerId>,
    },
    /// Long-running multi-step workflow
    Workflow {
        saga_type: String,
        #[serde(default)]
        context_data: Payload,
    },
    /// Atomic commit across participants
    Distributed {
        participants: Vec<ParticipantId>,
        #[serde(default)]
        payload: Payload,
    },
}

/// Where a submitted request went and what it produced.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Write {
        strategy: StrategyKind,
        rule: Option<String>,
        outcome: OccOutcome,
    },
    Workflow {
        saga_id: SagaId,
    },
    Distributed {
        transaction_id: TxnId,
    },
}

/// Snapshot of every component's counters.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub records: VersionStoreStats,
    pub occ: OccStats,
    pub locks: LockManagerStats,
    pub deadlocks: DeadlockStats,
    pub sagas: SagaStats,
    pub two_phase: CoordinatorStats,
    pub active_locks: usize,
    pub active_sagas: usize,
    pub active_transactions: usize,
}

/// Transaction coordination engine.
pub struct CoordinationEngine {
    config: EngineConfig,
    versions: Arc<VersionStore>,
    occ: OptimisticController,
    locks: Arc<LockManager>,
    sagas: Arc<SagaOrchestrator>,
    coordinator: Arc<TwoPhaseCoordinator>,
    resolver: PolicyResolver,
    started_at: DateTime<Utc>,
}

impl CoordinationEngine {
    /// Build an engine over the given collaborators.
    ///
    /// The configuration is validated first and the saga types it declares
    /// are registered.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn RecordStore>,
        invoker: Arc<dyn ActionInvoker>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| Error::Config(errors.join("; ")))?;

        let versions = Arc::new(VersionStore::new(store, config.adapter.clone()));
        let occ = OptimisticController::new(versions.clone(), config.occ.clone());
        let locks = Arc::new(LockManager::new(
            config.locks.clone(),
            config.deadlock.victim_selection,
        ));
        let sagas = Arc::new(SagaOrchestrator::new(config.saga.clone(), invoker));
        for definition in &config.server.sagas {
            sagas.register_definition(definition.clone())?;
        }
        let coordinator = Arc::new(TwoPhaseCoordinator::new(config.two_phase.clone()));
        let resolver = PolicyResolver::new(&config.policy, &config.locks);

        info!(
            coordinator_id = %config.two_phase.coordinator_id,
            saga_types = config.server.sagas.len(),
            policy_rules = config.policy.rules.len(),
            "coordination engine initialized"
        );

        Ok(Self {
            config,
            versions,
            occ,
            locks,
            sagas,
            coordinator,
            resolver,
            started_at: Utc::now(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn sagas(&self) -> &Arc<SagaOrchestrator> {
        &self.sagas
    }

    pub fn coordinator(&self) -> &Arc<TwoPhaseCoordinator> {
        &self.coordinator
    }

    pub fn resolver(&self) -> &PolicyResolver {
        &self.resolver
    }

    pub fn register_participant(&self, participant: Arc<dyn Participant>) {
        self.coordinator.register_participant(participant);
    }

    pub fn register_saga(&self, definition: SagaDefinition) -> Result<()> {
        self.sagas.register_definition(definition)
    }

    // ========================================================================
    // Records
    // ========================================================================

    /// `ExecuteOptimisticUpdate`.
    pub async fn execute_optimistic_update(
        &self,
        key: &ResourceKey,
        expected_version: u64,
        mutation: &Mutation,
    ) -> Result<OccOutcome> {
        self.occ.execute(key, expected_version, mutation).await
    }

    pub async fn read_record(&self, key: &ResourceKey) -> Result<VersionedRecord> {
        self.versions.read(key).await
    }

    // ========================================================================
    // Sagas
    // ========================================================================

    /// `StartSaga`.
    pub fn start_saga(&self, saga_type: &str, context_data: Payload) -> Result<SagaId> {
        self.sagas.start_saga(saga_type, context_data)
    }

    /// `GetSagaStatus`.
    pub fn get_saga_status(&self, saga_id: SagaId) -> Result<SagaInstance> {
        self.sagas.get_saga(saga_id)
    }

    pub fn cancel_saga(&self, saga_id: SagaId) -> Result<SagaInstance> {
        self.sagas.cancel_saga(saga_id)
    }

    pub async fn wait_for_saga(&self, saga_id: SagaId, timeout: Duration) -> Result<SagaInstance> {
        self.sagas.wait_for_saga(saga_id, timeout).await
    }

    // ========================================================================
    // Two-phase commit
    // ========================================================================

    /// `StartTwoPhaseCommit`.
    pub fn start_two_phase_commit(
        &self,
        participants: Vec<ParticipantId>,
        payload: Payload,
    ) -> Result<TxnId> {
        self.coordinator.start_two_phase_commit(participants, payload)
    }

    /// `GetTransactionStatus`.
    pub fn get_transaction_status(&self, txn_id: TxnId) -> Result<TwoPhaseTransaction> {
        self.coordinator.get_transaction(txn_id)
    }

    pub async fn cancel_transaction(&self, txn_id: TxnId) -> Result<TwoPhaseTransaction> {
        self.coordinator.cancel_transaction(txn_id).await
    }

    pub async fn wait_for_transaction(
        &self,
        txn_id: TxnId,
        timeout: Duration,
    ) -> Result<TwoPhaseTransaction> {
        self.coordinator.wait_for_transaction(txn_id, timeout).await
    }

    // ========================================================================
    // Locks
    // ========================================================================

    /// `AcquireLock`. A zero timeout takes the default lease.
    pub fn acquire_lock(
        &self,
        key: &ResourceKey,
        lock_type: LockType,
        owner: &OwnerId,
        timeout_seconds: u64,
    ) -> Result<LockOutcome> {
        let lease = match timeout_seconds {
            0 => self.config.locks.default_lease,
            secs => Duration::from_secs(secs),
        };
        self.locks.acquire(key, lock_type, owner, lease)
    }

    pub fn release_lock(&self, key: &ResourceKey, owner: &OwnerId) -> bool {
        self.locks.release(key, owner)
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Classify and route a request.
    pub async fn submit(&self, request: TransactionRequest) -> Result<SubmitOutcome> {
        match request {
            TransactionRequest::Write {
                resource_key,
                resource_type,
                operation_type,
                attributes,
                expected_version,
                mutation,
                owner,
            } => {
                let policy = self
                    .resolver
                    .resolve(&resource_type, &operation_type, &attributes);
                let outcome = match policy.strategy {
                    StrategyKind::OccOnly => {
                        self.occ
                            .execute(&resource_key, expected_version, &mutation)
                            .await?
                    }
                    StrategyKind::PessimisticLock => {
                        let owner = owner.unwrap_or_else(|| {
                            OwnerId::new(format!("submit-{}", Uuid::new_v4()))
                        });
                        self.locked_update(
                            &resource_key,
                            expected_version,
                            &mutation,
                            &owner,
                            policy.lock_timeout,
                        )
                        .await?
                    }
                    StrategyKind::TwoPhaseCommit => {
                        return Err(Error::invalid_argument(format!(
                            "{resource_type}/{operation_type} requires a distributed transaction"
                        )));
                    }
                };
                Ok(SubmitOutcome::Write {
                    strategy: policy.strategy,
                    rule: policy.rule,
                    outcome,
                })
            }
            TransactionRequest::Workflow {
                saga_type,
                context_data,
            } => {
                let saga_id = self.sagas.start_saga(&saga_type, context_data)?;
                Ok(SubmitOutcome::Workflow { saga_id })
            }
            TransactionRequest::Distributed {
                participants,
                payload,
            } => {
                let transaction_id = self.coordinator.start_two_phase_commit(participants, payload)?;
                Ok(SubmitOutcome::Distributed { transaction_id })
            }
        }
    }

    /// Write lock, then OCC, then release. A lock the owner already held is
    /// left in place.
    async fn locked_update(
        &self,
        key: &ResourceKey,
        expected_version: u64,
        mutation: &Mutation,
        owner: &OwnerId,
        timeout: Duration,
    ) -> Result<OccOutcome> {
        let held_before = self
            .locks
            .locks_held_by(owner)
            .iter()
            .any(|l| &l.resource_key == key && l.lock_type.covers(&LockType::Write));

        self.locks
            .acquire_wait(key, LockType::Write, owner, timeout, timeout)
            .await?;
        let outcome = self.occ.execute(key, expected_version, mutation).await;
        if !held_before {
            self.locks.release(key, owner);
        }
        outcome
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// One deadlock detection pass. Disabled detection returns no cycles.
    pub fn run_deadlock_detection(&self) -> Vec<DeadlockCycle> {
        if !self.config.deadlock.enabled {
            return Vec::new();
        }
        self.locks.resolve_deadlocks()
    }

    pub fn purge_expired_locks(&self) -> usize {
        self.locks.purge_expired()
    }

    pub fn collect_transactions(&self) -> usize {
        self.coordinator.gc()
    }

    pub fn collect_sagas(&self) -> usize {
        self.sagas.gc()
    }

    /// Re-drive unfinished sagas and in-doubt distributed transactions.
    ///
    /// Every saga and transaction is picked up on its own background task;
    /// the returned counts are what was handed over.
    pub fn recover(&self) -> (usize, usize) {
        let sagas = self.sagas.recover();
        let txns = self.coordinator.recover();
        (sagas, txns)
    }

    pub fn shutdown(&self) {
        self.coordinator.shutdown();
        info!("coordination engine shutting down");
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            started_at: self.started_at,
            uptime_seconds: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            records: self.versions.stats(),
            occ: self.occ.stats(),
            locks: self.locks.stats(),
            deadlocks: self.locks.wait_graph().stats(),
            sagas: self.sagas.stats(),
            two_phase: self.coordinator.stats(),
            active_locks: self.locks.lock_count(),
            active_sagas: self.sagas.active_count(),
            active_transactions: self.coordinator.active_count(),
        }
    }
}
