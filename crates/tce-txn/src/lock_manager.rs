//! Advisory lock manager.
//!
//! Short-lived, lease-based locks per resource key:
//! - Read/write/exclusive modes; only read locks are shared
//! - Lazy expiry: expired holders are purged on every acquire
//! - Blocking acquisition that publishes wait-for edges for deadlock detection
//! - Re-entrant acquire refreshes the lease; a sole reader may upgrade

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tce_common::error::TransactionError;
use tce_common::prelude::*;
use tce_common::utils;
use tokio::sync::Notify;

use crate::deadlock::{DeadlockCycle, OwnerMeta, WaitForGraph};

/// A granted advisory lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLock {
    pub resource_key: ResourceKey,
    pub lock_type: LockType,
    pub owner_id: OwnerId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ResourceLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Result of a non-blocking acquire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockOutcome {
    #[serde(rename = "LOCK_ACQUIRED")]
    Acquired(ResourceLock),
    #[serde(rename = "LOCK_CONFLICT")]
    Conflict { holders: Vec<OwnerId> },
}

impl LockOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired(_))
    }
}

/// Lock manager statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LockManagerStats {
    pub locks_granted: u64,
    pub locks_refreshed: u64,
    pub locks_upgraded: u64,
    pub locks_released: u64,
    pub locks_expired: u64,
    pub conflicts: u64,
    pub waits: u64,
    pub timeouts: u64,
    pub deadlocks_detected: u64,
    pub victims_aborted: u64,
}

#[derive(Default)]
struct LockState {
    holders: Vec<ResourceLock>,
}

struct LockSlot {
    state: Mutex<LockState>,
    released: Notify,
}

impl LockSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            released: Notify::new(),
        }
    }
}

enum Grant {
    New(ResourceLock),
    Refreshed(ResourceLock),
    Upgraded(ResourceLock),
    Conflict(Vec<OwnerId>),
}

/// Lock manager.
pub struct LockManager {
    config: LockConfig,
    locks: DashMap<ResourceKey, Arc<LockSlot>>,
    /// Resource keys each owner currently holds
    owners: DashMap<OwnerId, HashSet<ResourceKey>>,
    graph: Arc<WaitForGraph>,
    /// Owners blocked in `acquire_wait`, keyed to the token of their wait
    waiting: DashMap<OwnerId, u64>,
    next_wait: AtomicU64,
    /// Owners chosen as deadlock victims whose wait has not yet ended
    victims: DashMap<OwnerId, String>,
    victim_signal: Notify,
    stats: Mutex<LockManagerStats>,
}

impl LockManager {
    pub fn new(config: LockConfig, victim_selection: VictimSelection) -> Self {
        Self {
            config,
            locks: DashMap::new(),
            owners: DashMap::new(),
            graph: Arc::new(WaitForGraph::with_strategy(victim_selection)),
            waiting: DashMap::new(),
            next_wait: AtomicU64::new(0),
            victims: DashMap::new(),
            victim_signal: Notify::new(),
            stats: Mutex::new(LockManagerStats::default()),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Wait-for graph shared with the deadlock detector.
    pub fn wait_graph(&self) -> &Arc<WaitForGraph> {
        &self.graph
    }

    /// Try to acquire a lock without waiting.
    pub fn acquire(
        &self,
        key: &ResourceKey,
        lock_type: LockType,
        owner: &OwnerId,
        lease: Duration,
    ) -> Result<LockOutcome> {
        validate(key, owner)?;
        let lease = self.config.clamp_lease(lease);
        let slot = self.slot(key);

        match self.try_grant(&slot, key, lock_type, owner, lease) {
            Grant::New(lock) | Grant::Refreshed(lock) | Grant::Upgraded(lock) => {
                Ok(LockOutcome::Acquired(lock))
            }
            Grant::Conflict(holders) => {
                self.stats.lock().conflicts += 1;
                debug!(resource_key = %key, owner = %owner, ?holders, "lock conflict");
                Ok(LockOutcome::Conflict { holders })
            }
        }
    }

    /// Acquire a lock, waiting up to `wait` for conflicting holders to go away.
    ///
    /// While blocked the owner's wait-for edges are visible to deadlock
    /// detection. A wait that is picked as a deadlock victim ends with
    /// `LOCK_ACQUISITION_FAILED`; a wait that runs out of time ends with
    /// `LOCK_CONFLICT`. Dropping the future withdraws the wait-for edges.
    pub async fn acquire_wait(
        &self,
        key: &ResourceKey,
        lock_type: LockType,
        owner: &OwnerId,
        lease: Duration,
        wait: Duration,
    ) -> Result<ResourceLock> {
        validate(key, owner)?;
        let lease = self.config.clamp_lease(lease);
        let deadline = tokio::time::Instant::now() + wait;
        // A mark left over from an earlier wait does not apply to this one
        self.victims.remove(owner);
        let _wait = WaitRegistration::new(self, owner);
        let mut waited = false;

        loop {
            let slot = self.slot(key);
            let released = slot.released.notified();
            let victim_chosen = self.victim_signal.notified();
            tokio::pin!(released);
            tokio::pin!(victim_chosen);
            released.as_mut().enable();
            victim_chosen.as_mut().enable();

            let holders = match self.try_grant(&slot, key, lock_type, owner, lease) {
                Grant::New(lock) | Grant::Refreshed(lock) | Grant::Upgraded(lock) => return Ok(lock),
                Grant::Conflict(holders) => holders,
            };

            if let Some((_, reason)) = self.victims.remove(owner) {
                self.graph.remove_owner(owner);
                return Err(Error::Transaction(TransactionError::LockAcquisitionFailed {
                    owner: owner.to_string(),
                    reason,
                }));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                self.stats.lock().timeouts += 1;
                debug!(resource_key = %key, owner = %owner, "lock wait timed out");
                return Err(Error::Transaction(TransactionError::LockConflict {
                    resource_key: key.to_string(),
                    holders: holders.iter().map(|h| h.to_string()).collect(),
                }));
            }

            if !waited {
                waited = true;
                self.stats.lock().waits += 1;
            }
            self.publish_waits(owner, key, &holders);

            let nap = (deadline - now).min(self.config.wait_poll_interval);
            tokio::select! {
                _ = &mut released => {}
                _ = &mut victim_chosen => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    /// Release the lock `owner` holds on `key`. Returns whether one was held.
    pub fn release(&self, key: &ResourceKey, owner: &OwnerId) -> bool {
        let Some(slot) = self.locks.get(key).map(|s| s.clone()) else {
            return false;
        };

        let released = {
            let mut state = slot.state.lock();
            let before = state.holders.len();
            state.holders.retain(|h| &h.owner_id != owner);
            before != state.holders.len()
        };

        if released {
            self.unindex(owner, key);
            self.stats.lock().locks_released += 1;
            slot.released.notify_waiters();
            trace!(resource_key = %key, owner = %owner, "lock released");
        }
        drop(slot);
        self.drop_slot_if_idle(key);
        released
    }

    /// Release every lock held by `owner`.
    pub fn release_all(&self, owner: &OwnerId) -> usize {
        let keys: Vec<ResourceKey> = self
            .owners
            .get(owner)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();

        keys.iter().filter(|key| self.release(key, owner)).count()
    }

    /// Reclaim expired locks across all resources.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let slots: Vec<(ResourceKey, Arc<LockSlot>)> = self
            .locks
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut purged = 0;
        for (key, slot) in slots {
            let expired = expire_holders(&mut slot.state.lock(), now);
            if !expired.is_empty() {
                for lock in &expired {
                    self.unindex(&lock.owner_id, &key);
                }
                purged += expired.len();
                slot.released.notify_waiters();
            }
            drop(slot);
            self.drop_slot_if_idle(&key);
        }

        if purged > 0 {
            self.stats.lock().locks_expired += purged as u64;
            debug!(purged, "reclaimed expired locks");
        }
        purged
    }

    /// Run deadlock detection until the wait-for graph is acyclic.
    ///
    /// Each victim's pending wait fails and all of its locks are released.
    pub fn resolve_deadlocks(&self) -> Vec<DeadlockCycle> {
        let mut resolved = Vec::new();
        // Every round removes at least one edge or owner
        let max_rounds = self.graph.edge_count() + 1;

        for _ in 0..max_rounds {
            let Some(cycle) = self.graph.detect() else {
                break;
            };

            // Edges of an owner whose wait already ended are leftovers
            let gone: Vec<&OwnerId> = cycle
                .owners
                .iter()
                .filter(|o| !self.waiting.contains_key(*o))
                .collect();
            if !gone.is_empty() {
                for owner in gone {
                    self.graph.remove_waiter(owner);
                }
                continue;
            }

            let stale: Vec<_> = cycle
                .edges
                .iter()
                .filter(|e| !self.holds(&e.holder, &e.resource_key))
                .collect();
            if !stale.is_empty() {
                for edge in stale {
                    self.graph.remove_edge(&edge.waiter, &edge.holder);
                }
                continue;
            }

            self.stats.lock().deadlocks_detected += 1;
            warn!(
                victim = %cycle.victim,
                owners = ?cycle.owners,
                "deadlock detected, aborting victim"
            );
            self.abort_victim(&cycle.victim, "deadlock victim");
            resolved.push(cycle);
        }
        resolved
    }

    /// Fail `owner`'s pending wait and release everything it holds.
    pub fn abort_victim(&self, owner: &OwnerId, reason: &str) -> usize {
        if self.graph.is_waiting(owner) {
            self.victims.insert(owner.clone(), reason.to_string());
        }
        self.graph.remove_owner(owner);
        let released = self.release_all(owner);
        self.stats.lock().victims_aborted += 1;
        self.victim_signal.notify_waiters();
        released
    }

    /// Live (unexpired) holders of `key`.
    pub fn holders(&self, key: &ResourceKey) -> Vec<ResourceLock> {
        let now = Utc::now();
        self.locks
            .get(key)
            .map(|slot| {
                let state = slot.state.lock();
                state
                    .holders
                    .iter()
                    .filter(|h| !h.is_expired(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Live locks held by `owner`.
    pub fn locks_held_by(&self, owner: &OwnerId) -> Vec<ResourceLock> {
        let keys: Vec<ResourceKey> = self
            .owners
            .get(owner)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.iter()
            .flat_map(|k| self.holders(k))
            .filter(|l| &l.owner_id == owner)
            .collect()
    }

    pub fn lock_count(&self) -> usize {
        self.locks
            .iter()
            .map(|slot| {
                let state = slot.state.lock();
                state.holders.len()
            })
            .sum()
    }

    pub fn stats(&self) -> LockManagerStats {
        self.stats.lock().clone()
    }

    fn slot(&self, key: &ResourceKey) -> Arc<LockSlot> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(LockSlot::new()))
            .clone()
    }

    fn try_grant(
        &self,
        slot: &LockSlot,
        key: &ResourceKey,
        lock_type: LockType,
        owner: &OwnerId,
        lease: Duration,
    ) -> Grant {
        let now = Utc::now();
        let expires_at = utils::deadline_after(lease);

        let (grant, expired) = {
            let mut state = slot.state.lock();
            let expired = expire_holders(&mut state, now);
            let grant = grant_locked(&mut state, key, lock_type, owner, now, expires_at);
            (grant, expired)
        };

        if !expired.is_empty() {
            for lock in &expired {
                self.unindex(&lock.owner_id, key);
            }
            self.stats.lock().locks_expired += expired.len() as u64;
            slot.released.notify_waiters();
        }

        match &grant {
            Grant::New(_) => {
                self.index(owner, key);
                self.stats.lock().locks_granted += 1;
                trace!(resource_key = %key, owner = %owner, lock_type = %lock_type, "lock granted");
            }
            Grant::Refreshed(_) => self.stats.lock().locks_refreshed += 1,
            Grant::Upgraded(_) => {
                self.stats.lock().locks_upgraded += 1;
                debug!(resource_key = %key, owner = %owner, lock_type = %lock_type, "lock upgraded");
            }
            Grant::Conflict(_) => {}
        }
        grant
    }

    fn publish_waits(&self, owner: &OwnerId, key: &ResourceKey, holders: &[OwnerId]) {
        for o in std::iter::once(owner).chain(holders.iter()) {
            if let Some(meta) = self.owner_meta(o) {
                self.graph.record_owner(o, meta);
            }
        }
        self.graph.set_waits(owner, key, holders);
    }

    /// Age is taken from the oldest lock the owner still holds.
    fn owner_meta(&self, owner: &OwnerId) -> Option<OwnerMeta> {
        let held = self.locks_held_by(owner);
        let started = held.iter().map(|l| l.acquired_at).min()?;
        Some(OwnerMeta {
            started,
            locks_held: held.len(),
        })
    }

    fn holds(&self, owner: &OwnerId, key: &ResourceKey) -> bool {
        self.holders(key).iter().any(|h| &h.owner_id == owner)
    }

    fn index(&self, owner: &OwnerId, key: &ResourceKey) {
        self.owners
            .entry(owner.clone())
            .or_default()
            .insert(key.clone());
    }

    fn unindex(&self, owner: &OwnerId, key: &ResourceKey) {
        if let Entry::Occupied(mut entry) = self.owners.entry(owner.clone()) {
            entry.get_mut().remove(key);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }

    fn drop_slot_if_idle(&self, key: &ResourceKey) {
        self.locks.remove_if(key, |_, slot| {
            Arc::strong_count(slot) == 1
                && slot
                    .state
                    .try_lock()
                    .map_or(false, |state| state.holders.is_empty())
        });
    }
}

/// Marks an owner as blocked for the lifetime of one `acquire_wait` call.
///
/// Dropped on every exit path, including cancellation of the future, and
/// then withdraws the owner's wait-for edges unless a newer wait by the
/// same owner has taken over.
struct WaitRegistration<'a> {
    manager: &'a LockManager,
    owner: OwnerId,
    token: u64,
}

impl<'a> WaitRegistration<'a> {
    fn new(manager: &'a LockManager, owner: &OwnerId) -> Self {
        let token = manager.next_wait.fetch_add(1, Ordering::Relaxed);
        manager.waiting.insert(owner.clone(), token);
        Self {
            manager,
            owner: owner.clone(),
            token,
        }
    }
}

impl Drop for WaitRegistration<'_> {
    fn drop(&mut self) {
        let current = self
            .manager
            .waiting
            .remove_if(&self.owner, |_, token| *token == self.token)
            .is_some();
        if current {
            self.manager.graph.remove_waiter(&self.owner);
        }
    }
}

fn validate(key: &ResourceKey, owner: &OwnerId) -> Result<()> {
    if key.as_str().is_empty() {
        return Err(Error::invalid_argument("resource key must not be empty"));
    }
    if owner.as_str().is_empty() {
        return Err(Error::invalid_argument("owner id must not be empty"));
    }
    Ok(())
}

fn expire_holders(state: &mut LockState, now: DateTime<Utc>) -> Vec<ResourceLock> {
    let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut state.holders)
        .into_iter()
        .partition(|h| h.is_expired(now));
    state.holders = live;
    expired
}

fn grant_locked(
    state: &mut LockState,
    key: &ResourceKey,
    lock_type: LockType,
    owner: &OwnerId,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Grant {
    let others: Vec<OwnerId> = state
        .holders
        .iter()
        .filter(|h| &h.owner_id != owner)
        .map(|h| h.owner_id.clone())
        .collect();

    if let Some(held) = state.holders.iter_mut().find(|h| &h.owner_id == owner) {
        if held.lock_type.covers(&lock_type) {
            held.expires_at = held.expires_at.max(expires_at);
            return Grant::Refreshed(held.clone());
        }
        if others.is_empty() {
            held.lock_type = lock_type;
            held.expires_at = held.expires_at.max(expires_at);
            return Grant::Upgraded(held.clone());
        }
        return Grant::Conflict(others);
    }

    let conflicting: Vec<OwnerId> = state
        .holders
        .iter()
        .filter(|h| !h.lock_type.is_compatible(&lock_type))
        .map(|h| h.owner_id.clone())
        .collect();
    if !conflicting.is_empty() {
        return Grant::Conflict(conflicting);
    }

    let lock = ResourceLock {
        resource_key: key.clone(),
        lock_type,
        owner_id: owner.clone(),
        acquired_at: now,
        expires_at,
    };
    state.holders.push(lock.clone());
    Grant::New(lock)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> LockManager {
        let config = LockConfig {
            min_lease: Duration::from_millis(1),
            wait_poll_interval: Duration::from_millis(5),
            ..Default::default()
        };
        LockManager::new(config, VictimSelection::Youngest)
    }

    fn k(s: &str) -> ResourceKey {
        ResourceKey::from(s)
    }

    fn o(s: &str) -> OwnerId {
        OwnerId::from(s)
    }

    const LEASE: Duration = Duration::from_secs(30);

    #[test]
    fn test_shared_reads() {
        let lm = manager();
        assert!(lm.acquire(&k("r"), LockType::Read, &o("a"), LEASE).unwrap().is_acquired());
        assert!(lm.acquire(&k("r"), LockType::Read, &o("b"), LEASE).unwrap().is_acquired());
        assert_eq!(lm.holders(&k("r")).len(), 2);

        let outcome = lm.acquire(&k("r"), LockType::Write, &o("c"), LEASE).unwrap();
        match outcome {
            LockOutcome::Conflict { holders } => {
                assert_eq!(holders, vec![o("a"), o("b")]);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_write_and_exclusive_conflict_with_everything() {
        let lm = manager();
        for held in [LockType::Write, LockType::Exclusive] {
            let key = k(&format!("r-{held}"));
            assert!(lm.acquire(&key, held, &o("a"), LEASE).unwrap().is_acquired());
            for requested in [LockType::Read, LockType::Write, LockType::Exclusive] {
                assert!(!lm.acquire(&key, requested, &o("b"), LEASE).unwrap().is_acquired());
            }
        }
        assert_eq!(lm.stats().conflicts, 6);
    }

    #[test]
    fn test_reentrant_acquire_refreshes() {
        let lm = manager();
        let first = match lm.acquire(&k("r"), LockType::Write, &o("a"), Duration::from_secs(5)).unwrap() {
            LockOutcome::Acquired(lock) => lock,
            other => panic!("unexpected {other:?}"),
        };
        let second = match lm.acquire(&k("r"), LockType::Read, &o("a"), Duration::from_secs(60)).unwrap() {
            LockOutcome::Acquired(lock) => lock,
            other => panic!("unexpected {other:?}"),
        };
        // Keeps the stronger mode and the original acquisition time
        assert_eq!(second.lock_type, LockType::Write);
        assert_eq!(second.acquired_at, first.acquired_at);
        assert!(second.expires_at > first.expires_at);
        assert_eq!(lm.lock_count(), 1);
        assert_eq!(lm.stats().locks_refreshed, 1);
    }

    #[test]
    fn test_sole_reader_upgrades() {
        let lm = manager();
        lm.acquire(&k("r"), LockType::Read, &o("a"), LEASE).unwrap();
        let outcome = lm.acquire(&k("r"), LockType::Exclusive, &o("a"), LEASE).unwrap();
        assert!(outcome.is_acquired());
        assert_eq!(lm.holders(&k("r"))[0].lock_type, LockType::Exclusive);

        // With a second reader the upgrade conflicts
        lm.acquire(&k("s"), LockType::Read, &o("a"), LEASE).unwrap();
        lm.acquire(&k("s"), LockType::Read, &o("b"), LEASE).unwrap();
        let outcome = lm.acquire(&k("s"), LockType::Write, &o("a"), LEASE).unwrap();
        assert_eq!(outcome, LockOutcome::Conflict { holders: vec![o("b")] });
    }

    #[test]
    fn test_release_and_release_all() {
        let lm = manager();
        lm.acquire(&k("r1"), LockType::Write, &o("a"), LEASE).unwrap();
        lm.acquire(&k("r2"), LockType::Write, &o("a"), LEASE).unwrap();
        lm.acquire(&k("r3"), LockType::Read, &o("b"), LEASE).unwrap();

        assert!(lm.release(&k("r1"), &o("a")));
        assert!(!lm.release(&k("r1"), &o("a")));
        assert_eq!(lm.release_all(&o("a")), 1);
        assert!(lm.locks_held_by(&o("a")).is_empty());
        assert_eq!(lm.locks_held_by(&o("b")).len(), 1);
        assert_eq!(lm.stats().locks_released, 2);
    }

    #[tokio::test]
    async fn test_expired_lock_reclaimed_on_acquire() {
        let lm = manager();
        lm.acquire(&k("r"), LockType::Exclusive, &o("a"), Duration::from_millis(10))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let outcome = lm.acquire(&k("r"), LockType::Write, &o("b"), LEASE).unwrap();
        assert!(outcome.is_acquired());
        assert!(lm.locks_held_by(&o("a")).is_empty());
        assert_eq!(lm.stats().locks_expired, 1);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let lm = manager();
        lm.acquire(&k("r1"), LockType::Write, &o("a"), Duration::from_millis(10))
            .unwrap();
        lm.acquire(&k("r2"), LockType::Write, &o("b"), LEASE).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(lm.purge_expired(), 1);
        assert_eq!(lm.lock_count(), 1);
    }

    #[tokio::test]
    async fn test_acquire_wait_granted_after_release() {
        let lm = Arc::new(manager());
        lm.acquire(&k("r"), LockType::Write, &o("a"), LEASE).unwrap();

        let waiter = {
            let lm = lm.clone();
            tokio::spawn(async move {
                lm.acquire_wait(&k("r"), LockType::Write, &o("b"), LEASE, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(lm.wait_graph().is_waiting(&o("b")));
        lm.release(&k("r"), &o("a"));

        let lock = waiter.await.unwrap().unwrap();
        assert_eq!(lock.owner_id, o("b"));
        assert!(!lm.wait_graph().is_waiting(&o("b")));
    }

    #[tokio::test]
    async fn test_acquire_wait_times_out_with_conflict() {
        let lm = manager();
        lm.acquire(&k("r"), LockType::Exclusive, &o("a"), LEASE).unwrap();

        let err = lm
            .acquire_wait(&k("r"), LockType::Read, &o("b"), LEASE, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "LOCK_CONFLICT");
        assert_eq!(lm.stats().timeouts, 1);
        assert_eq!(lm.wait_graph().edge_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_wait_withdraws_edges() {
        let lm = manager();
        lm.acquire(&k("r"), LockType::Write, &o("a"), LEASE).unwrap();

        let (key_r, owner_b) = (k("r"), o("b"));
        let wait = lm.acquire_wait(&key_r, LockType::Write, &owner_b, LEASE, Duration::from_secs(5));
        // The caller gives up long before the wait bound
        let gave_up = tokio::time::timeout(Duration::from_millis(30), wait).await;
        assert!(gave_up.is_err());

        assert!(!lm.wait_graph().is_waiting(&o("b")));
        assert_eq!(lm.wait_graph().edge_count(), 0);
    }

    #[test]
    fn test_edges_without_live_wait_are_discarded() {
        let lm = manager();
        lm.acquire(&k("k1"), LockType::Write, &o("a"), LEASE).unwrap();
        lm.acquire(&k("k2"), LockType::Write, &o("b"), LEASE).unwrap();

        // Neither owner is inside acquire_wait
        lm.wait_graph().set_waits(&o("a"), &k("k2"), &[o("b")]);
        lm.wait_graph().set_waits(&o("b"), &k("k1"), &[o("a")]);

        assert!(lm.resolve_deadlocks().is_empty());
        assert_eq!(lm.wait_graph().edge_count(), 0);
        assert_eq!(lm.lock_count(), 2);
        assert_eq!(lm.stats().victims_aborted, 0);
    }

    #[tokio::test]
    async fn test_owner_age_follows_oldest_held_lock() {
        let lm = manager();
        lm.acquire(&k("old"), LockType::Write, &o("a"), LEASE).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let newer = match lm.acquire(&k("new"), LockType::Write, &o("a"), LEASE).unwrap() {
            LockOutcome::Acquired(lock) => lock,
            other => panic!("unexpected {other:?}"),
        };
        let first = lm.owner_meta(&o("a")).unwrap();
        assert!(first.started < newer.acquired_at);
        assert_eq!(first.locks_held, 2);

        lm.release(&k("old"), &o("a"));
        let meta = lm.owner_meta(&o("a")).unwrap();
        assert_eq!(meta.started, newer.acquired_at);
        assert_eq!(meta.locks_held, 1);

        lm.release(&k("new"), &o("a"));
        assert!(lm.owner_meta(&o("a")).is_none());
    }

    #[test]
    fn test_empty_identifiers_rejected() {
        let lm = manager();
        assert!(lm.acquire(&k(""), LockType::Read, &o("a"), LEASE).is_err());
        assert!(lm.acquire(&k("r"), LockType::Read, &o(""), LEASE).is_err());
    }
}
