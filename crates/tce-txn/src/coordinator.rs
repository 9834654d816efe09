//! Two-Phase Commit (2PC) coordinator for distributed transactions.
//!
//! Implements the classic 2PC protocol:
//! - Prepare phase: PREPARE fans out to every participant concurrently; the
//!   coordinator waits for all votes or the prepare timeout
//! - Commit phase: only after a unanimous yes; COMMIT delivery is retried
//!   until acknowledged (optionally bounded)
//! - Abort phase: any no vote, prepare failure, timeout or cancellation
//!
//! Decisions are journaled in a decision log before they are acted on, and
//! unknown transactions are presumed aborted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tce_common::config::humantime_serde;
use tce_common::error::{ProtocolError, TransactionError};
use tce_common::prelude::*;
use tce_common::utils::TxnIdGenerator;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Distributed transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Preparing,
    /// All participants voted yes
    Prepared,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Committed | TransactionStatus::Aborted)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::Preparing => "preparing",
            TransactionStatus::Prepared => "prepared",
            TransactionStatus::Committing => "committing",
            TransactionStatus::Committed => "committed",
            TransactionStatus::Aborting => "aborting",
            TransactionStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Participant state in a distributed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Preparing,
    Prepared,
    Committed,
    Aborted,
    Failed,
}

/// Participant's vote in prepare phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrepareVote {
    Yes,
    No,
}

/// Reply to PREPARE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareReply {
    pub vote: PrepareVote,
    /// Opaque data the participant needs to roll back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_data: Option<Payload>,
}

impl PrepareReply {
    pub fn yes() -> Self {
        Self {
            vote: PrepareVote::Yes,
            compensation_data: None,
        }
    }

    pub fn no() -> Self {
        Self {
            vote: PrepareVote::No,
            compensation_data: None,
        }
    }
}

/// Participant RPC client used by the coordinator.
#[async_trait]
pub trait Participant: Send + Sync {
    fn id(&self) -> ParticipantId;

    async fn prepare(&self, txn_id: TxnId, payload: &Payload) -> Result<PrepareReply>;

    /// Apply the local effects of a prepared transaction. Must be idempotent.
    async fn commit(&self, txn_id: TxnId) -> Result<Payload>;

    /// Roll back. Must be idempotent and accept unknown transactions.
    async fn abort(&self, txn_id: TxnId) -> Result<()>;
}

/// Per-participant record of a distributed transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionParticipant {
    pub participant_id: ParticipantId,
    pub status: ParticipantStatus,
    pub prepare_response: Option<Payload>,
    pub commit_response: Option<Payload>,
    pub compensation_data: Option<Payload>,
    pub commit_attempts: u32,
}

/// Snapshot of a distributed transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwoPhaseTransaction {
    pub transaction_id: TxnId,
    pub coordinator_id: String,
    pub status: TransactionStatus,
    pub participants: Vec<TransactionParticipant>,
    pub payload: Payload,
    #[serde(with = "humantime_serde")]
    pub prepare_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub commit_timeout: Duration,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TwoPhaseTransaction {
    pub fn participant(&self, id: &ParticipantId) -> Option<&TransactionParticipant> {
        self.participants.iter().find(|p| &p.participant_id == id)
    }

    fn participant_mut(&mut self, id: &ParticipantId) -> Option<&mut TransactionParticipant> {
        self.participants.iter_mut().find(|p| &p.participant_id == id)
    }

    fn all_prepared(&self) -> bool {
        self.participants
            .iter()
            .all(|p| p.status == ParticipantStatus::Prepared)
    }
}

/// Decision log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum DecisionRecord {
    Begin {
        txn_id: TxnId,
        participants: Vec<ParticipantId>,
    },
    Prepared {
        txn_id: TxnId,
    },
    Commit {
        txn_id: TxnId,
    },
    Abort {
        txn_id: TxnId,
        reason: String,
    },
    End {
        txn_id: TxnId,
    },
}

impl DecisionRecord {
    pub fn txn_id(&self) -> TxnId {
        match self {
            DecisionRecord::Begin { txn_id, .. }
            | DecisionRecord::Prepared { txn_id }
            | DecisionRecord::Commit { txn_id }
            | DecisionRecord::Abort { txn_id, .. }
            | DecisionRecord::End { txn_id } => *txn_id,
        }
    }
}

/// Coordinator statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorStats {
    pub txns_started: u64,
    pub txns_committed: u64,
    pub txns_aborted: u64,
    pub txns_cancelled: u64,
    pub votes_no: u64,
    pub prepare_failures: u64,
    pub prepare_timeouts: u64,
    pub commit_retries: u64,
    pub commit_delivery_exhausted: u64,
    pub abort_delivery_failures: u64,
    pub recovered_txns: u64,
    pub gc_removed: u64,
}

struct TxnEntry {
    state: RwLock<TwoPhaseTransaction>,
    cancel: CancellationToken,
    run_lock: tokio::sync::Mutex<()>,
    status_tx: watch::Sender<TransactionStatus>,
}

impl TxnEntry {
    fn set_status(&self, txn: &mut TwoPhaseTransaction, status: TransactionStatus) {
        txn.status = status;
        txn.updated_at = Utc::now();
        self.status_tx.send_replace(status);
    }
}

enum Decision {
    Commit,
    Abort(String),
}

/// Two-Phase Commit coordinator.
pub struct TwoPhaseCoordinator {
    config: TwoPhaseConfig,
    transactions: DashMap<TxnId, Arc<TxnEntry>>,
    /// Committed transactions dropped by gc, for presumed-abort lookups
    committed_txns: DashMap<TxnId, DateTime<Utc>>,
    participants: DashMap<ParticipantId, Arc<dyn Participant>>,
    ids: TxnIdGenerator,
    stats: Mutex<CoordinatorStats>,
    decision_log: Mutex<Vec<DecisionRecord>>,
    shutdown: CancellationToken,
}

impl TwoPhaseCoordinator {
    pub fn new(config: TwoPhaseConfig) -> Self {
        Self {
            config,
            transactions: DashMap::new(),
            committed_txns: DashMap::new(),
            participants: DashMap::new(),
            ids: TxnIdGenerator::new(),
            stats: Mutex::new(CoordinatorStats::default()),
            decision_log: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &TwoPhaseConfig {
        &self.config
    }

    /// Register (or replace) a participant client.
    pub fn register_participant(&self, participant: Arc<dyn Participant>) {
        let id = participant.id();
        debug!(participant = %id, "participant registered");
        self.participants.insert(id, participant);
    }

    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<ParticipantId> = self.participants.iter().map(|p| p.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Persist a new transaction in `preparing`.
    pub fn begin(&self, participants: Vec<ParticipantId>, payload: Payload) -> Result<TxnId> {
        if participants.is_empty() {
            return Err(Error::invalid_argument(
                "a distributed transaction needs at least one participant",
            ));
        }
        let mut seen = HashSet::new();
        for pid in &participants {
            if !seen.insert(pid) {
                return Err(Error::invalid_argument(format!(
                    "participant {pid} listed twice"
                )));
            }
            if !self.participants.contains_key(pid) {
                return Err(Error::Protocol(ProtocolError::UnknownParticipant(
                    pid.to_string(),
                )));
            }
        }
        if self.active_count() >= self.config.max_concurrent_txns {
            return Err(Error::ResourceExhausted(
                "Too many concurrent distributed transactions".into(),
            ));
        }

        let txn_id = self.ids.next_id();
        let now = Utc::now();
        let txn = TwoPhaseTransaction {
            transaction_id: txn_id,
            coordinator_id: self.config.coordinator_id.clone(),
            status: TransactionStatus::Preparing,
            participants: participants
                .iter()
                .map(|pid| TransactionParticipant {
                    participant_id: pid.clone(),
                    status: ParticipantStatus::Preparing,
                    prepare_response: None,
                    commit_response: None,
                    compensation_data: None,
                    commit_attempts: 0,
                })
                .collect(),
            payload,
            prepare_timeout: self.config.prepare_timeout,
            commit_timeout: self.config.commit_timeout,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };

        self.log(DecisionRecord::Begin {
            txn_id,
            participants,
        });
        let (status_tx, _) = watch::channel(TransactionStatus::Preparing);
        self.transactions.insert(
            txn_id,
            Arc::new(TxnEntry {
                state: RwLock::new(txn),
                cancel: self.shutdown.child_token(),
                run_lock: tokio::sync::Mutex::new(()),
                status_tx,
            }),
        );
        self.stats.lock().txns_started += 1;
        info!(txn_id = %txn_id, "distributed transaction started");
        Ok(txn_id)
    }

    /// `StartTwoPhaseCommit`: begin and drive the protocol on a background task.
    pub fn start_two_phase_commit(
        self: &Arc<Self>,
        participants: Vec<ParticipantId>,
        payload: Payload,
    ) -> Result<TxnId> {
        let txn_id = self.begin(participants, payload)?;
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.execute(txn_id).await {
                error!(txn_id = %txn_id, error = %e, "2PC driver failed");
            }
        });
        Ok(txn_id)
    }

    /// Begin and drive a transaction to its outcome on the calling task.
    pub async fn commit_transaction(
        &self,
        participants: Vec<ParticipantId>,
        payload: Payload,
    ) -> Result<TwoPhaseTransaction> {
        let txn_id = self.begin(participants, payload)?;
        self.execute(txn_id).await
    }

    /// Run the protocol for a transaction created with [`begin`](Self::begin).
    pub async fn execute(&self, txn_id: TxnId) -> Result<TwoPhaseTransaction> {
        let entry = self.entry(txn_id)?;
        self.drive(&entry, false).await;
        let txn = entry.state.read().clone();
        Ok(txn)
    }

    /// `GetTransactionStatus`.
    pub fn get_transaction(&self, txn_id: TxnId) -> Result<TwoPhaseTransaction> {
        let entry = self.entry(txn_id)?;
        let txn = entry.state.read().clone();
        Ok(txn)
    }

    /// Outcome lookup that also covers collected and unknown transactions.
    pub fn get_state(&self, txn_id: TxnId) -> Option<TransactionStatus> {
        if let Some(entry) = self.transactions.get(&txn_id) {
            return Some(entry.state.read().status);
        }
        if self.committed_txns.contains_key(&txn_id) {
            return Some(TransactionStatus::Committed);
        }
        if self.config.presumed_abort {
            return Some(TransactionStatus::Aborted);
        }
        None
    }

    /// Cancel a transaction still in `preparing`; it resolves through abort.
    pub async fn cancel_transaction(&self, txn_id: TxnId) -> Result<TwoPhaseTransaction> {
        let entry = self.entry(txn_id)?;
        {
            let txn = entry.state.write();
            if txn.status != TransactionStatus::Preparing {
                return Err(Error::invalid_state(format!(
                    "transaction {txn_id} is {} and can no longer be cancelled",
                    txn.status
                )));
            }
            entry.cancel.cancel();
        }
        self.stats.lock().txns_cancelled += 1;
        info!(txn_id = %txn_id, "distributed transaction cancelled");
        self.drive(&entry, false).await;
        let txn = entry.state.read().clone();
        Ok(txn)
    }

    /// Wait until the transaction is committed or aborted.
    pub async fn wait_for_transaction(
        &self,
        txn_id: TxnId,
        timeout: Duration,
    ) -> Result<TwoPhaseTransaction> {
        let entry = self.entry(txn_id)?;
        let mut rx = entry.status_tx.subscribe();
        let finished = async {
            loop {
                if rx.borrow_and_update().is_terminal() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::time::timeout(timeout, finished).await.map_err(|_| {
            Error::Timeout(format!("transaction {txn_id} not finished after {timeout:?}"))
        })?;
        let txn = entry.state.read().clone();
        Ok(txn)
    }

    /// Re-drive in-doubt transactions that no task is currently driving.
    ///
    /// A transaction with a logged commit decision finishes its commit;
    /// everything undecided is aborted. Each one is driven on its own task,
    /// so a participant that never acknowledges only holds up its own
    /// transaction.
    pub fn recover(self: &Arc<Self>) -> usize {
        let idle: Vec<Arc<TxnEntry>> = self
            .transactions
            .iter()
            .filter(|e| !e.state.read().status.is_terminal())
            .filter(|e| e.run_lock.try_lock().is_ok())
            .map(|e| e.value().clone())
            .collect();

        for entry in &idle {
            let this = self.clone();
            let entry = entry.clone();
            tokio::spawn(async move { this.drive(&entry, true).await });
        }
        if !idle.is_empty() {
            self.stats.lock().recovered_txns += idle.len() as u64;
            info!(count = idle.len(), "re-driving in-doubt transactions");
        }
        idle.len()
    }

    /// Drop terminal transactions older than `retain_completed`.
    pub fn gc(&self) -> usize {
        let retain = chrono::Duration::from_std(self.config.retain_completed)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let now = Utc::now();
        let cutoff = now - retain;

        let expired: Vec<(TxnId, TransactionStatus)> = self
            .transactions
            .iter()
            .filter_map(|e| {
                let txn = e.state.read();
                (txn.status.is_terminal() && txn.updated_at < cutoff)
                    .then(|| (*e.key(), txn.status))
            })
            .collect();

        for (txn_id, status) in &expired {
            self.transactions.remove(txn_id);
            if *status == TransactionStatus::Committed {
                self.committed_txns.insert(*txn_id, now);
            }
        }
        // Committed ids outlive their transaction by one more retention window
        self.committed_txns.retain(|_, dropped_at| *dropped_at >= cutoff);

        if !expired.is_empty() {
            let gone: HashSet<TxnId> = expired.iter().map(|(id, _)| *id).collect();
            self.decision_log
                .lock()
                .retain(|record| !gone.contains(&record.txn_id()));
            self.stats.lock().gc_removed += expired.len() as u64;
            debug!(removed = expired.len(), "completed transactions collected");
        }
        expired.len()
    }

    pub fn decision_log(&self) -> Vec<DecisionRecord> {
        self.decision_log.lock().clone()
    }

    /// Stop unbounded commit-delivery loops and cancel in-flight prepares.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats.lock().clone()
    }

    /// Transactions not yet committed or aborted.
    pub fn active_count(&self) -> usize {
        self.transactions
            .iter()
            .filter(|e| !e.state.read().status.is_terminal())
            .count()
    }

    // ====================================================================
    // Protocol
    // ====================================================================

    async fn drive(&self, entry: &TxnEntry, recovering: bool) {
        let _running = entry.run_lock.lock().await;
        let (txn_id, status) = {
            let txn = entry.state.read();
            (txn.transaction_id, txn.status)
        };

        match status {
            TransactionStatus::Preparing if recovering => {
                self.abort_phase(entry, "in doubt during recovery".to_string())
                    .await
            }
            TransactionStatus::Preparing => match self.prepare_phase(entry).await {
                Decision::Commit => self.commit_phase(entry).await,
                Decision::Abort(reason) => self.abort_phase(entry, reason).await,
            },
            TransactionStatus::Prepared => {
                if self.commit_logged(txn_id) {
                    self.commit_phase(entry).await
                } else {
                    self.abort_phase(entry, "commit decision not logged".to_string())
                        .await
                }
            }
            TransactionStatus::Committing => self.commit_phase(entry).await,
            TransactionStatus::Aborting => {
                let reason = entry
                    .state
                    .read()
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "aborting".to_string());
                self.abort_phase(entry, reason).await
            }
            TransactionStatus::Committed | TransactionStatus::Aborted => {}
        }
    }

    async fn prepare_phase(&self, entry: &TxnEntry) -> Decision {
        let (txn_id, payload, pids, timeout) = {
            let txn = entry.state.read();
            (
                txn.transaction_id,
                txn.payload.clone(),
                txn.participants
                    .iter()
                    .map(|p| p.participant_id.clone())
                    .collect::<Vec<_>>(),
                txn.prepare_timeout,
            )
        };
        if entry.cancel.is_cancelled() {
            return Decision::Abort("cancelled".to_string());
        }

        let mut tasks = JoinSet::new();
        for pid in &pids {
            let Some(participant) = self.participant(pid) else {
                self.mark(entry, pid, ParticipantStatus::Failed);
                return Decision::Abort(format!("participant {pid} is no longer registered"));
            };
            let payload = payload.clone();
            let pid = pid.clone();
            tasks.spawn(async move {
                let reply = participant.prepare(txn_id, &payload).await;
                (pid, reply)
            });
        }
        debug!(txn_id = %txn_id, participants = pids.len(), "PREPARE sent");

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut prepared = 0;

        // Dropping `tasks` cancels any PREPARE still outstanding
        let decision = loop {
            if prepared == pids.len() {
                break Decision::Commit;
            }
            tokio::select! {
                _ = entry.cancel.cancelled() => {
                    break Decision::Abort("cancelled".to_string());
                }
                _ = &mut deadline => {
                    let silent: Vec<String> = {
                        let txn = entry.state.read();
                        txn.participants
                            .iter()
                            .filter(|p| p.status == ParticipantStatus::Preparing)
                            .map(|p| p.participant_id.to_string())
                            .collect()
                    };
                    self.stats.lock().prepare_timeouts += 1;
                    let timeout_err = ProtocolError::ParticipantTimeout {
                        txn_id: txn_id.0,
                        participant: silent.join(","),
                    };
                    warn!(txn_id = %txn_id, error = %timeout_err, "prepare phase timed out");
                    break Decision::Abort(timeout_err.to_string());
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok((pid, Ok(reply)))) => {
                        let response = serde_json::to_value(&reply).ok();
                        let mut txn = entry.state.write();
                        let vote = reply.vote;
                        if let Some(p) = txn.participant_mut(&pid) {
                            p.prepare_response = response;
                            p.compensation_data = reply.compensation_data;
                            p.status = match vote {
                                PrepareVote::Yes => ParticipantStatus::Prepared,
                                PrepareVote::No => ParticipantStatus::Aborted,
                            };
                        }
                        txn.updated_at = Utc::now();
                        match vote {
                            PrepareVote::Yes => prepared += 1,
                            PrepareVote::No => {
                                self.stats.lock().votes_no += 1;
                                info!(txn_id = %txn_id, participant = %pid, "participant voted no");
                                break Decision::Abort(format!("participant {pid} voted no"));
                            }
                        }
                    }
                    Some(Ok((pid, Err(err)))) => {
                        {
                            let mut txn = entry.state.write();
                            if let Some(p) = txn.participant_mut(&pid) {
                                p.status = ParticipantStatus::Failed;
                                p.prepare_response = Some(Payload::String(err.to_string()));
                            }
                        }
                        self.stats.lock().prepare_failures += 1;
                        warn!(txn_id = %txn_id, participant = %pid, error = %err, "prepare failed");
                        break Decision::Abort(format!("participant {pid} failed to prepare: {err}"));
                    }
                    Some(Err(join_err)) => {
                        break Decision::Abort(format!("prepare task failed: {join_err}"));
                    }
                    None => break Decision::Abort("prepare ended without all votes".to_string()),
                }
            }
        };
        drop(tasks);

        if let Decision::Abort(_) = decision {
            return decision;
        }

        // Cancellation is checked under the same lock cancel_transaction takes
        let mut txn = entry.state.write();
        if entry.cancel.is_cancelled() {
            return Decision::Abort("cancelled".to_string());
        }
        if !txn.all_prepared() {
            return Decision::Abort("prepare ended without unanimous yes".to_string());
        }
        self.log(DecisionRecord::Prepared { txn_id });
        entry.set_status(&mut txn, TransactionStatus::Prepared);
        debug!(txn_id = %txn_id, "all participants prepared");
        Decision::Commit
    }

    async fn commit_phase(&self, entry: &TxnEntry) {
        let (txn_id, pending) = {
            let mut txn = entry.state.write();
            let txn_id = txn.transaction_id;
            if txn.status != TransactionStatus::Committing {
                self.log(DecisionRecord::Commit { txn_id });
                entry.set_status(&mut txn, TransactionStatus::Committing);
            }
            let pending: Vec<ParticipantId> = txn
                .participants
                .iter()
                .filter(|p| p.status != ParticipantStatus::Committed)
                .map(|p| p.participant_id.clone())
                .collect();
            (txn_id, pending)
        };

        let delivered = join_all(
            pending
                .iter()
                .map(|pid| self.deliver_commit(entry, txn_id, pid)),
        )
        .await;

        if delivered.iter().all(|ok| *ok) {
            {
                let mut txn = entry.state.write();
                entry.set_status(&mut txn, TransactionStatus::Committed);
            }
            self.log(DecisionRecord::End { txn_id });
            self.stats.lock().txns_committed += 1;
            info!(txn_id = %txn_id, "distributed transaction committed");
        }
    }

    async fn deliver_commit(&self, entry: &TxnEntry, txn_id: TxnId, pid: &ParticipantId) -> bool {
        let mut backoff = self.config.commit_retry_backoff;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            {
                let mut txn = entry.state.write();
                if let Some(p) = txn.participant_mut(pid) {
                    p.commit_attempts += 1;
                }
            }

            let result = match self.participant(pid) {
                Some(participant) => {
                    match tokio::time::timeout(self.config.commit_timeout, participant.commit(txn_id))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(Error::Protocol(ProtocolError::ParticipantTimeout {
                            txn_id: txn_id.0,
                            participant: pid.to_string(),
                        })),
                    }
                }
                None => Err(Error::Protocol(ProtocolError::UnknownParticipant(
                    pid.to_string(),
                ))),
            };

            match result {
                Ok(response) => {
                    let mut txn = entry.state.write();
                    if let Some(p) = txn.participant_mut(pid) {
                        p.status = ParticipantStatus::Committed;
                        p.commit_response = Some(response);
                    }
                    txn.updated_at = Utc::now();
                    return true;
                }
                Err(err) => {
                    if let Some(max) = self.config.max_commit_delivery_attempts {
                        if attempt >= max {
                            let incident = TransactionError::CommitDeliveryExhausted {
                                txn_id: txn_id.0,
                                participant: pid.to_string(),
                                attempts: attempt,
                            };
                            {
                                let mut txn = entry.state.write();
                                if let Some(p) = txn.participant_mut(pid) {
                                    p.status = ParticipantStatus::Failed;
                                }
                                txn.failure_reason = Some(incident.to_string());
                                txn.updated_at = Utc::now();
                            }
                            self.stats.lock().commit_delivery_exhausted += 1;
                            error!(
                                txn_id = %txn_id,
                                participant = %pid,
                                code = "COMMIT_DELIVERY_EXHAUSTED",
                                error = %err,
                                "commit delivery exhausted, transaction needs manual intervention"
                            );
                            return false;
                        }
                    }

                    self.stats.lock().commit_retries += 1;
                    warn!(
                        txn_id = %txn_id,
                        participant = %pid,
                        attempt,
                        error = %err,
                        "commit delivery failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown.cancelled() => return false,
                    }
                    backoff = (backoff * 2).min(self.config.max_commit_retry_backoff);
                }
            }
        }
    }

    async fn abort_phase(&self, entry: &TxnEntry, reason: String) {
        let (txn_id, targets) = {
            let mut txn = entry.state.write();
            let txn_id = txn.transaction_id;
            if txn.status != TransactionStatus::Aborting {
                self.log(DecisionRecord::Abort {
                    txn_id,
                    reason: reason.clone(),
                });
                txn.failure_reason = Some(reason.clone());
                entry.set_status(&mut txn, TransactionStatus::Aborting);
            }
            // A participant that voted no has already rolled back
            let targets: Vec<ParticipantId> = txn
                .participants
                .iter()
                .filter(|p| p.status != ParticipantStatus::Aborted)
                .map(|p| p.participant_id.clone())
                .collect();
            (txn_id, targets)
        };
        info!(txn_id = %txn_id, reason = %reason, "aborting distributed transaction");

        join_all(targets.iter().map(|pid| self.deliver_abort(entry, txn_id, pid))).await;

        {
            let mut txn = entry.state.write();
            entry.set_status(&mut txn, TransactionStatus::Aborted);
        }
        self.log(DecisionRecord::End { txn_id });
        self.stats.lock().txns_aborted += 1;
    }

    async fn deliver_abort(&self, entry: &TxnEntry, txn_id: TxnId, pid: &ParticipantId) {
        let Some(participant) = self.participant(pid) else {
            return;
        };
        let attempts = self.config.abort_delivery_attempts.max(1);
        let mut backoff = self.config.commit_retry_backoff;

        for attempt in 1..=attempts {
            let result =
                match tokio::time::timeout(self.config.commit_timeout, participant.abort(txn_id)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Protocol(ProtocolError::ParticipantTimeout {
                        txn_id: txn_id.0,
                        participant: pid.to_string(),
                    })),
                };
            match result {
                Ok(()) => {
                    let mut txn = entry.state.write();
                    if let Some(p) = txn.participant_mut(pid) {
                        if matches!(
                            p.status,
                            ParticipantStatus::Preparing | ParticipantStatus::Prepared
                        ) {
                            p.status = ParticipantStatus::Aborted;
                        }
                    }
                    return;
                }
                Err(err) if attempt < attempts => {
                    debug!(txn_id = %txn_id, participant = %pid, attempt, error = %err, "abort delivery failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.max_commit_retry_backoff);
                }
                Err(err) => {
                    self.stats.lock().abort_delivery_failures += 1;
                    warn!(
                        txn_id = %txn_id,
                        participant = %pid,
                        error = %err,
                        "abort not acknowledged; participant will learn the outcome by presumed abort"
                    );
                }
            }
        }
    }

    fn commit_logged(&self, txn_id: TxnId) -> bool {
        self.decision_log
            .lock()
            .iter()
            .any(|r| matches!(r, DecisionRecord::Commit { txn_id: id } if *id == txn_id))
    }

    fn mark(&self, entry: &TxnEntry, pid: &ParticipantId, status: ParticipantStatus) {
        let mut txn = entry.state.write();
        if let Some(p) = txn.participant_mut(pid) {
            p.status = status;
        }
    }

    fn participant(&self, pid: &ParticipantId) -> Option<Arc<dyn Participant>> {
        self.participants.get(pid).map(|p| p.clone())
    }

    fn entry(&self, txn_id: TxnId) -> Result<Arc<TxnEntry>> {
        self.transactions
            .get(&txn_id)
            .map(|e| e.clone())
            .ok_or_else(|| Error::not_found("Distributed transaction", txn_id.to_string()))
    }

    fn log(&self, record: DecisionRecord) {
        trace!(?record, "decision logged");
        self.decision_log.lock().push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PrepareScript, ScriptedParticipant};
    use serde_json::json;

    fn config() -> TwoPhaseConfig {
        TwoPhaseConfig {
            prepare_timeout: Duration::from_millis(200),
            commit_timeout: Duration::from_millis(200),
            commit_retry_backoff: Duration::from_millis(1),
            max_commit_retry_backoff: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn setup(parts: Vec<ScriptedParticipant>) -> (TwoPhaseCoordinator, Vec<Arc<ScriptedParticipant>>) {
        let coordinator = TwoPhaseCoordinator::new(config());
        let parts: Vec<Arc<ScriptedParticipant>> = parts.into_iter().map(Arc::new).collect();
        for p in &parts {
            coordinator.register_participant(p.clone());
        }
        (coordinator, parts)
    }

    fn ids(parts: &[Arc<ScriptedParticipant>]) -> Vec<ParticipantId> {
        parts.iter().map(|p| p.id()).collect()
    }

    #[tokio::test]
    async fn test_2pc_commit_success() {
        let (coordinator, parts) = setup(vec![
            ScriptedParticipant::new("a"),
            ScriptedParticipant::new("b"),
        ]);

        let txn = coordinator
            .commit_transaction(ids(&parts), json!({"amount": 5}))
            .await
            .unwrap();
        assert_eq!(txn.status, TransactionStatus::Committed);
        for p in &parts {
            assert_eq!(p.prepare_count(), 1);
            assert_eq!(p.commit_count(), 1);
            assert_eq!(p.abort_count(), 0);
        }
        assert!(txn
            .participants
            .iter()
            .all(|p| p.status == ParticipantStatus::Committed));

        let log = coordinator.decision_log();
        let kinds: Vec<&str> = log
            .iter()
            .map(|r| match r {
                DecisionRecord::Begin { .. } => "begin",
                DecisionRecord::Prepared { .. } => "prepared",
                DecisionRecord::Commit { .. } => "commit",
                DecisionRecord::Abort { .. } => "abort",
                DecisionRecord::End { .. } => "end",
            })
            .collect();
        assert_eq!(kinds, vec!["begin", "prepared", "commit", "end"]);
    }

    #[tokio::test]
    async fn test_2pc_abort_on_no_vote() {
        let (coordinator, parts) = setup(vec![
            ScriptedParticipant::new("a"),
            ScriptedParticipant::new("b").with_prepare(PrepareScript::No),
        ]);

        let txn = coordinator
            .commit_transaction(ids(&parts), Payload::Null)
            .await
            .unwrap();
        assert_eq!(txn.status, TransactionStatus::Aborted);
        assert!(txn.failure_reason.unwrap().contains("voted no"));
        assert_eq!(parts[0].commit_count(), 0);
        assert_eq!(parts[1].commit_count(), 0);
        assert_eq!(parts[1].abort_count(), 0);
        assert_eq!(coordinator.stats().votes_no, 1);
    }

    #[tokio::test]
    async fn test_prepare_error_aborts_everyone() {
        let (coordinator, parts) = setup(vec![
            ScriptedParticipant::new("a"),
            ScriptedParticipant::new("b").with_prepare(PrepareScript::Error),
        ]);

        let txn = coordinator
            .commit_transaction(ids(&parts), Payload::Null)
            .await
            .unwrap();
        assert_eq!(txn.status, TransactionStatus::Aborted);
        assert_eq!(
            txn.participant(&"b".into()).unwrap().status,
            ParticipantStatus::Failed
        );
        assert_eq!(parts[0].commit_count(), 0);
        assert_eq!(parts[1].abort_count(), 1);
    }

    #[tokio::test]
    async fn test_prepare_timeout_aborts() {
        let (coordinator, parts) = setup(vec![
            ScriptedParticipant::new("a"),
            ScriptedParticipant::new("b").with_prepare(PrepareScript::Hang),
            ScriptedParticipant::new("c"),
        ]);

        let txn = coordinator
            .commit_transaction(ids(&parts), Payload::Null)
            .await
            .unwrap();
        assert_eq!(txn.status, TransactionStatus::Aborted);
        assert_eq!(parts[0].abort_count(), 1);
        assert_eq!(parts[2].abort_count(), 1);
        assert!(parts.iter().all(|p| p.commit_count() == 0));
        assert_eq!(coordinator.stats().prepare_timeouts, 1);
    }

    #[tokio::test]
    async fn test_commit_retried_until_delivered() {
        let (coordinator, parts) = setup(vec![
            ScriptedParticipant::new("a").fail_commits(3),
            ScriptedParticipant::new("b"),
        ]);

        let txn = coordinator
            .commit_transaction(ids(&parts), Payload::Null)
            .await
            .unwrap();
        assert_eq!(txn.status, TransactionStatus::Committed);
        assert_eq!(parts[0].commit_attempts(), 4);
        assert_eq!(txn.participant(&"a".into()).unwrap().commit_attempts, 4);
        assert_eq!(coordinator.stats().commit_retries, 3);
    }

    #[tokio::test]
    async fn test_bounded_commit_delivery_leaves_committing() {
        let coordinator = TwoPhaseCoordinator::new(TwoPhaseConfig {
            max_commit_delivery_attempts: Some(2),
            ..config()
        });
        let p = Arc::new(ScriptedParticipant::new("a").fail_commits(10));
        coordinator.register_participant(p.clone());

        let txn = coordinator
            .commit_transaction(vec![p.id()], Payload::Null)
            .await
            .unwrap();
        assert_eq!(txn.status, TransactionStatus::Committing);
        assert_eq!(txn.participants[0].status, ParticipantStatus::Failed);
        assert_eq!(coordinator.stats().commit_delivery_exhausted, 1);
        assert_eq!(p.abort_count(), 0);
    }

    #[tokio::test]
    async fn test_recover_finishes_commit() {
        let coordinator = Arc::new(TwoPhaseCoordinator::new(TwoPhaseConfig {
            max_commit_delivery_attempts: Some(1),
            ..config()
        }));
        let p = Arc::new(ScriptedParticipant::new("a").fail_commits(1));
        coordinator.register_participant(p.clone());

        let txn = coordinator
            .commit_transaction(vec![p.id()], Payload::Null)
            .await
            .unwrap();
        assert_eq!(txn.status, TransactionStatus::Committing);

        assert_eq!(coordinator.recover(), 1);
        let txn = coordinator
            .wait_for_transaction(txn.transaction_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(txn.status, TransactionStatus::Committed);
        assert_eq!(p.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_recover_aborts_undecided() {
        let (coordinator, parts) = setup(vec![ScriptedParticipant::new("a")]);
        let coordinator = Arc::new(coordinator);
        let txn_id = coordinator.begin(ids(&parts), Payload::Null).unwrap();

        assert_eq!(coordinator.recover(), 1);
        coordinator
            .wait_for_transaction(txn_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(coordinator.get_state(txn_id), Some(TransactionStatus::Aborted));
        assert_eq!(parts[0].prepare_count(), 0);
        assert_eq!(parts[0].abort_count(), 1);
    }

    /// Leave `txn_id` as a crash after the commit decision would: every
    /// participant prepared, commit logged, nothing delivered.
    fn commit_decided(coordinator: &TwoPhaseCoordinator, txn_id: TxnId) {
        let entry = coordinator.entry(txn_id).unwrap();
        coordinator.log(DecisionRecord::Commit { txn_id });
        let mut txn = entry.state.write();
        for p in &mut txn.participants {
            p.status = ParticipantStatus::Prepared;
        }
        entry.set_status(&mut txn, TransactionStatus::Committing);
    }

    #[tokio::test]
    async fn test_recover_not_blocked_by_unreachable_participant() {
        let coordinator = Arc::new(TwoPhaseCoordinator::new(config()));
        let down = Arc::new(ScriptedParticipant::new("down").fail_commits(u32::MAX));
        let up = Arc::new(ScriptedParticipant::new("up"));
        coordinator.register_participant(down.clone());
        coordinator.register_participant(up.clone());

        let stuck = coordinator.begin(vec![down.id()], Payload::Null).unwrap();
        let healthy = coordinator.begin(vec![up.id()], Payload::Null).unwrap();
        commit_decided(&coordinator, stuck);
        commit_decided(&coordinator, healthy);

        assert_eq!(coordinator.recover(), 2);
        let txn = coordinator
            .wait_for_transaction(healthy, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(txn.status, TransactionStatus::Committed);
        assert_eq!(up.commit_count(), 1);

        // Delivery to the unreachable participant is still being retried
        assert_eq!(coordinator.get_state(stuck), Some(TransactionStatus::Committing));
        assert!(down.commit_attempts() >= 1);
        assert_eq!(down.commit_count(), 0);
        coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_while_preparing() {
        let coordinator = Arc::new(TwoPhaseCoordinator::new(TwoPhaseConfig {
            prepare_timeout: Duration::from_secs(30),
            ..config()
        }));
        let p = Arc::new(ScriptedParticipant::new("a").with_prepare(PrepareScript::Hang));
        coordinator.register_participant(p.clone());

        let txn_id = coordinator
            .start_two_phase_commit(vec![p.id()], Payload::Null)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let txn = coordinator.cancel_transaction(txn_id).await.unwrap();
        assert_eq!(txn.status, TransactionStatus::Aborted);
        assert_eq!(txn.failure_reason.as_deref(), Some("cancelled"));
        assert_eq!(p.abort_count(), 1);

        let err = coordinator.cancel_transaction(txn_id).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
    }

    #[tokio::test]
    async fn test_begin_validation() {
        let (coordinator, parts) = setup(vec![ScriptedParticipant::new("a")]);
        assert!(coordinator.begin(vec![], Payload::Null).is_err());
        assert!(coordinator
            .begin(vec![parts[0].id(), parts[0].id()], Payload::Null)
            .is_err());
        let err = coordinator
            .begin(vec!["ghost".into()], Payload::Null)
            .unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_PARTICIPANT");
    }

    #[tokio::test]
    async fn test_max_concurrent_txns() {
        let coordinator = TwoPhaseCoordinator::new(TwoPhaseConfig {
            max_concurrent_txns: 1,
            ..config()
        });
        coordinator.register_participant(Arc::new(ScriptedParticipant::new("a")));
        coordinator.begin(vec!["a".into()], Payload::Null).unwrap();
        let err = coordinator.begin(vec!["a".into()], Payload::Null).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn test_gc_and_presumed_abort() {
        let coordinator = TwoPhaseCoordinator::new(TwoPhaseConfig {
            retain_completed: Duration::ZERO,
            ..config()
        });
        coordinator.register_participant(Arc::new(ScriptedParticipant::new("a")));
        let txn = coordinator
            .commit_transaction(vec!["a".into()], Payload::Null)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(coordinator.gc(), 1);
        assert!(coordinator.get_transaction(txn.transaction_id).is_err());
        assert_eq!(
            coordinator.get_state(txn.transaction_id),
            Some(TransactionStatus::Committed)
        );
        assert_eq!(coordinator.get_state(TxnId(999)), Some(TransactionStatus::Aborted));
        assert!(coordinator.decision_log().is_empty());
    }

    #[tokio::test]
    async fn test_start_and_wait() {
        let coordinator = Arc::new(TwoPhaseCoordinator::new(config()));
        coordinator.register_participant(Arc::new(ScriptedParticipant::new("a")));
        let txn_id = coordinator
            .start_two_phase_commit(vec!["a".into()], json!({"k": 1}))
            .unwrap();
        let txn = coordinator
            .wait_for_transaction(txn_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(txn.status, TransactionStatus::Committed);
        assert_eq!(coordinator.active_count(), 0);
    }
}
