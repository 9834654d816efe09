//! Deadlock detection.
//!
//! Wait-for graph between lock owners:
//! - Edges are published by blocked `acquire_wait` calls (waiter -> holder)
//! - Cycle detection using DFS over a consistent snapshot
//! - Victim selection; the default aborts the youngest owner in the cycle

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Instant;
use tce_common::prelude::*;

/// Edge in the wait-for graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaitEdge {
    /// Owner that is blocked
    pub waiter: OwnerId,
    /// Owner holding the conflicting lock
    pub holder: OwnerId,
    /// Resource being waited for
    pub resource_key: ResourceKey,
}

/// Detected deadlock cycle.
#[derive(Debug, Clone, Serialize)]
pub struct DeadlockCycle {
    /// Owners involved, in wait order
    pub owners: Vec<OwnerId>,
    /// Edges closing the cycle
    pub edges: Vec<WaitEdge>,
    /// Selected victim
    pub victim: OwnerId,
}

/// Age and size of an owner, used for victim selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerMeta {
    /// Earliest `acquired_at` among the owner's current locks
    pub started: DateTime<Utc>,
    pub locks_held: usize,
}

/// Deadlock detection statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeadlockStats {
    pub edges_added: u64,
    pub edges_removed: u64,
    pub cycles_detected: u64,
    pub victims_selected: u64,
    pub detection_runs: u64,
    pub total_detection_time_us: u64,
}

#[derive(Default)]
struct GraphInner {
    /// waiter -> holder -> resource
    edges: BTreeMap<OwnerId, BTreeMap<OwnerId, ResourceKey>>,
    meta: BTreeMap<OwnerId, OwnerMeta>,
}

impl GraphInner {
    fn waited_on(&self) -> BTreeSet<&OwnerId> {
        self.edges.values().flat_map(|h| h.keys()).collect()
    }

    /// Drop metadata of owners that no longer appear in any edge.
    fn prune_meta(&mut self) {
        let live: HashSet<OwnerId> = self
            .edges
            .keys()
            .cloned()
            .chain(self.waited_on().into_iter().cloned())
            .collect();
        self.meta.retain(|owner, _| live.contains(owner));
    }
}

/// Wait-for graph for deadlock detection.
pub struct WaitForGraph {
    inner: RwLock<GraphInner>,
    victim_strategy: VictimSelection,
    stats: RwLock<DeadlockStats>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::with_strategy(VictimSelection::Youngest)
    }

    pub fn with_strategy(strategy: VictimSelection) -> Self {
        Self {
            inner: RwLock::new(GraphInner::default()),
            victim_strategy: strategy,
            stats: RwLock::new(DeadlockStats::default()),
        }
    }

    /// Record (or refresh) the age and size of an owner.
    pub fn record_owner(&self, owner: &OwnerId, meta: OwnerMeta) {
        self.inner.write().meta.insert(owner.clone(), meta);
    }

    /// Replace the outgoing edges of `waiter` with one edge per holder.
    pub fn set_waits(&self, waiter: &OwnerId, resource_key: &ResourceKey, holders: &[OwnerId]) {
        let targets: BTreeMap<OwnerId, ResourceKey> = holders
            .iter()
            .filter(|h| *h != waiter)
            .map(|h| (h.clone(), resource_key.clone()))
            .collect();

        let mut inner = self.inner.write();
        let previous = inner.edges.get(waiter);
        if previous == Some(&targets) {
            return;
        }
        let removed = previous.map_or(0, |p| p.len()) as u64;
        let added = targets.len() as u64;
        if targets.is_empty() {
            inner.edges.remove(waiter);
        } else {
            inner.edges.insert(waiter.clone(), targets);
        }
        drop(inner);

        let mut stats = self.stats.write();
        stats.edges_added += added;
        stats.edges_removed += removed;
    }

    /// Add a single wait edge: `waiter` is blocked on `holder` for `resource_key`.
    pub fn add_edge(&self, waiter: &OwnerId, holder: &OwnerId, resource_key: &ResourceKey) {
        if waiter == holder {
            return;
        }
        self.inner
            .write()
            .edges
            .entry(waiter.clone())
            .or_default()
            .insert(holder.clone(), resource_key.clone());
        self.stats.write().edges_added += 1;
    }

    /// Remove a single wait edge.
    pub fn remove_edge(&self, waiter: &OwnerId, holder: &OwnerId) {
        let mut inner = self.inner.write();
        let removed = match inner.edges.get_mut(waiter) {
            Some(holders) => {
                let removed = holders.remove(holder).is_some();
                if holders.is_empty() {
                    inner.edges.remove(waiter);
                }
                removed
            }
            None => false,
        };
        if removed {
            inner.prune_meta();
            drop(inner);
            self.stats.write().edges_removed += 1;
        }
    }

    /// The owner stopped waiting (granted, timed out, or gave up).
    pub fn remove_waiter(&self, waiter: &OwnerId) {
        let mut inner = self.inner.write();
        if let Some(holders) = inner.edges.remove(waiter) {
            inner.prune_meta();
            drop(inner);
            self.stats.write().edges_removed += holders.len() as u64;
        }
    }

    /// Remove every edge touching `owner`.
    pub fn remove_owner(&self, owner: &OwnerId) {
        let mut inner = self.inner.write();
        let mut removed = inner.edges.remove(owner).map_or(0, |h| h.len());
        inner.edges.retain(|_, holders| {
            if holders.remove(owner).is_some() {
                removed += 1;
            }
            !holders.is_empty()
        });
        inner.meta.remove(owner);
        inner.prune_meta();
        drop(inner);
        self.stats.write().edges_removed += removed as u64;
    }

    /// Detect a deadlock and return the cycle with its victim.
    pub fn detect(&self) -> Option<DeadlockCycle> {
        let start = Instant::now();
        let inner = self.inner.read();

        let mut visited = HashSet::new();
        let mut found = None;
        for waiter in inner.edges.keys() {
            if visited.contains(waiter) {
                continue;
            }
            let mut path = Vec::new();
            let mut on_path = HashSet::new();
            if let Some(cycle) = dfs_cycle(&inner, waiter, &mut visited, &mut path, &mut on_path) {
                found = Some(cycle);
                break;
            }
        }

        let result = found.map(|edges| {
            let owners: Vec<OwnerId> = edges.iter().map(|e| e.waiter.clone()).collect();
            let victim = self.select_victim(&inner, &owners);
            DeadlockCycle {
                owners,
                edges,
                victim,
            }
        });
        drop(inner);

        let mut stats = self.stats.write();
        stats.detection_runs += 1;
        stats.total_detection_time_us += start.elapsed().as_micros() as u64;
        if result.is_some() {
            stats.cycles_detected += 1;
            stats.victims_selected += 1;
        }
        result
    }

    fn select_victim(&self, inner: &GraphInner, owners: &[OwnerId]) -> OwnerId {
        // Owners without metadata count as just started
        let started = |o: &OwnerId| {
            inner
                .meta
                .get(o)
                .map(|m| m.started)
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        };
        let locks = |o: &OwnerId| inner.meta.get(o).map(|m| m.locks_held).unwrap_or(0);

        // Ties fall back to owner id so the choice is deterministic
        let chosen = match self.victim_strategy {
            VictimSelection::Youngest => owners.iter().max_by(|a, b| {
                started(a).cmp(&started(b)).then_with(|| a.cmp(b))
            }),
            VictimSelection::Oldest => owners.iter().min_by(|a, b| {
                started(a).cmp(&started(b)).then_with(|| b.cmp(a))
            }),
            VictimSelection::LeastWork => owners.iter().min_by(|a, b| {
                locks(a)
                    .cmp(&locks(b))
                    .then_with(|| started(b).cmp(&started(a)))
            }),
        };
        chosen.cloned().unwrap_or_else(|| owners[0].clone())
    }

    pub fn stats(&self) -> DeadlockStats {
        self.stats.read().clone()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.read().edges.values().map(|h| h.len()).sum()
    }

    pub fn is_waiting(&self, owner: &OwnerId) -> bool {
        self.inner.read().edges.contains_key(owner)
    }

    /// Snapshot of all edges.
    pub fn edges(&self) -> Vec<WaitEdge> {
        self.inner
            .read()
            .edges
            .iter()
            .flat_map(|(waiter, holders)| {
                holders.iter().map(move |(holder, key)| WaitEdge {
                    waiter: waiter.clone(),
                    holder: holder.clone(),
                    resource_key: key.clone(),
                })
            })
            .collect()
    }

    /// Owners currently waiting on `holder`.
    pub fn waiters_of(&self, holder: &OwnerId) -> Vec<OwnerId> {
        self.inner
            .read()
            .edges
            .iter()
            .filter(|(_, holders)| holders.contains_key(holder))
            .map(|(waiter, _)| waiter.clone())
            .collect()
    }
}

impl Default for WaitForGraph {
    fn default() -> Self {
        Self::new()
    }
}

fn dfs_cycle(
    inner: &GraphInner,
    current: &OwnerId,
    visited: &mut HashSet<OwnerId>,
    path: &mut Vec<WaitEdge>,
    on_path: &mut HashSet<OwnerId>,
) -> Option<Vec<WaitEdge>> {
    if on_path.contains(current) {
        let start = path.iter().position(|e| &e.waiter == current)?;
        return Some(path[start..].to_vec());
    }
    if !visited.insert(current.clone()) {
        return None;
    }
    on_path.insert(current.clone());

    if let Some(holders) = inner.edges.get(current) {
        for (holder, key) in holders {
            path.push(WaitEdge {
                waiter: current.clone(),
                holder: holder.clone(),
                resource_key: key.clone(),
            });
            if let Some(cycle) = dfs_cycle(inner, holder, visited, path, on_path) {
                return Some(cycle);
            }
            path.pop();
        }
    }

    on_path.remove(current);
    None
}
