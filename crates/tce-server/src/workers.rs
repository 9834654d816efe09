//! Background Workers
//!
//! Periodic maintenance for the coordination engine:
//! - Deadlock monitor: runs wait-for graph detection and aborts victims
//! - Lock reaper: reclaims locks whose lease expired
//! - Collector: drops finished sagas and two-phase transactions past retention

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tce_common::config::EngineConfig;
use tce_txn::CoordinationEngine;

/// Configuration for background workers
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub deadlock_enabled: bool,
    pub deadlock_interval: Duration,
    pub reap_interval: Duration,
    pub gc_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

impl WorkerConfig {
    /// Derive worker intervals from the engine configuration.
    pub fn from_engine(config: &EngineConfig) -> Self {
        let retention = config
            .two_phase
            .retain_completed
            .min(config.saga.retain_completed);
        let gc_interval = (retention / 4).max(Duration::from_secs(1));
        Self {
            deadlock_enabled: config.deadlock.enabled,
            deadlock_interval: config.deadlock.detection_interval,
            reap_interval: config.locks.reap_interval,
            gc_interval,
        }
    }
}

/// Background worker manager
pub struct WorkerManager {
    engine: Arc<CoordinationEngine>,
    config: WorkerConfig,
    cancel_token: CancellationToken,
}

impl WorkerManager {
    pub fn new(engine: Arc<CoordinationEngine>, config: WorkerConfig) -> Self {
        Self {
            engine,
            config,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Get a cancellation token for shutdown signaling
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Start all background workers and return their handles.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if self.config.deadlock_enabled {
            handles.push(self.spawn_periodic(
                "deadlock monitor",
                self.config.deadlock_interval,
                |engine| {
                    let cycles = engine.run_deadlock_detection();
                    for cycle in &cycles {
                        warn!(
                            victim = %cycle.victim,
                            members = cycle.owners.len(),
                            "deadlock resolved by aborting victim"
                        );
                    }
                },
            ));
        }

        handles.push(self.spawn_periodic(
            "lock reaper",
            self.config.reap_interval,
            |engine| {
                let purged = engine.purge_expired_locks();
                if purged > 0 {
                    debug!(purged, "expired locks reclaimed");
                }
            },
        ));

        handles.push(self.spawn_periodic(
            "collector",
            self.config.gc_interval,
            |engine| {
                let txns = engine.collect_transactions();
                let sagas = engine.collect_sagas();
                if txns + sagas > 0 {
                    debug!(transactions = txns, sagas, "finished work collected");
                }
            },
        ));

        handles
    }

    fn spawn_periodic<F>(&self, name: &'static str, interval: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(&CoordinationEngine) + Send + 'static,
    {
        let engine = self.engine.clone();
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            info!("{} started (interval: {:?})", name, interval);

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => tick(engine.as_ref()),
                    _ = cancel_token.cancelled() => {
                        info!("{} shutting down", name);
                        break;
                    }
                }
            }
        })
    }

    /// Signal every worker to stop.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tce_common::prelude::*;
    use tce_txn::testing::ScriptedInvoker;
    use tce_txn::InMemoryRecordStore;

    fn engine(config: EngineConfig) -> Arc<CoordinationEngine> {
        Arc::new(
            CoordinationEngine::new(
                config,
                Arc::new(InMemoryRecordStore::new()),
                Arc::new(ScriptedInvoker::new()),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_config_from_engine() {
        let mut config = EngineConfig::default();
        config.deadlock.enabled = false;
        config.two_phase.retain_completed = Duration::from_secs(600);

        let workers = WorkerConfig::from_engine(&config);
        assert!(!workers.deadlock_enabled);
        assert_eq!(workers.deadlock_interval, config.deadlock.detection_interval);
        assert_eq!(workers.reap_interval, config.locks.reap_interval);
        assert_eq!(workers.gc_interval, Duration::from_secs(150));

        config.saga.retain_completed = Duration::from_secs(40);
        assert_eq!(
            WorkerConfig::from_engine(&config).gc_interval,
            Duration::from_secs(10)
        );

        config.two_phase.retain_completed = Duration::from_millis(100);
        assert_eq!(
            WorkerConfig::from_engine(&config).gc_interval,
            Duration::from_secs(1)
        );
    }

    #[tokio::test]
    async fn test_reaper_reclaims_expired_locks() {
        let mut config = EngineConfig::default();
        config.locks.min_lease = Duration::from_millis(10);
        let engine = engine(config);

        let key: ResourceKey = "orders:1".into();
        let owner: OwnerId = "crashed-client".into();
        let outcome = engine
            .lock_manager()
            .acquire(&key, LockType::Write, &owner, Duration::from_millis(20))
            .unwrap();
        assert!(outcome.is_acquired());

        let manager = WorkerManager::new(
            engine.clone(),
            WorkerConfig {
                deadlock_enabled: true,
                deadlock_interval: Duration::from_millis(10),
                reap_interval: Duration::from_millis(10),
                gc_interval: Duration::from_millis(10),
            },
        );
        let handles = manager.start();
        assert_eq!(handles.len(), 3);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(engine.lock_manager().lock_count(), 0);

        manager.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_collector_drops_finished_sagas() {
        let mut config = EngineConfig::default();
        config.saga.retain_completed = Duration::ZERO;
        config.server.sagas = vec![SagaDefinition {
            saga_type: "ping".into(),
            steps: vec![StepDefinition {
                name: "ping".into(),
                action: "ping.send".into(),
                compensation: None,
                data: serde_json::Value::Null,
            }],
        }];
        let engine = engine(config);

        let saga_id = engine.start_saga("ping", Payload::Null).unwrap();
        engine
            .wait_for_saga(saga_id, Duration::from_secs(5))
            .await
            .unwrap();

        let manager = WorkerManager::new(
            engine.clone(),
            WorkerConfig {
                deadlock_enabled: false,
                deadlock_interval: Duration::from_millis(10),
                reap_interval: Duration::from_millis(10),
                gc_interval: Duration::from_millis(10),
            },
        );
        let handles = manager.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(engine.get_saga_status(saga_id).unwrap_err().code(), "NOT_FOUND");
        assert_eq!(engine.sagas().stats().gc_removed, 1);

        manager.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_disabled_deadlock_monitor_not_spawned() {
        let mut config = EngineConfig::default();
        config.deadlock.enabled = false;
        let manager = WorkerManager::new(engine(config.clone()), WorkerConfig::from_engine(&config));

        let handles = manager.start();
        assert_eq!(handles.len(), 2);

        manager.cancel_token().cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
