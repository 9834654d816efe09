//! Configuration types for the transaction coordination engine

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::types::{ParticipantId, StrategyKind};

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Optimistic concurrency control
    #[serde(default)]
    pub occ: OccConfig,

    /// Advisory locks
    #[serde(default)]
    pub locks: LockConfig,

    /// Deadlock detection
    #[serde(default)]
    pub deadlock: DeadlockConfig,

    /// Saga orchestration
    #[serde(default)]
    pub saga: SagaConfig,

    /// Two-phase commit coordination
    #[serde(default)]
    pub two_phase: TwoPhaseConfig,

    /// Retry policy applied at the record store boundary
    #[serde(default)]
    pub adapter: RetryPolicy,

    /// Isolation policy rules
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Server process settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Validate the configuration and return every fatal problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.locks.min_lease.is_zero() {
            errors.push("locks.min_lease must be > 0".to_string());
        }
        if self.locks.min_lease > self.locks.max_lease {
            errors.push(format!(
                "locks.min_lease ({:?}) exceeds locks.max_lease ({:?})",
                self.locks.min_lease, self.locks.max_lease
            ));
        }
        if self.locks.default_lease < self.locks.min_lease
            || self.locks.default_lease > self.locks.max_lease
        {
            errors.push("locks.default_lease must lie within [min_lease, max_lease]".to_string());
        }
        if self.deadlock.enabled && self.deadlock.detection_interval.is_zero() {
            errors.push("deadlock.detection_interval must be > 0".to_string());
        }
        if self.saga.step_timeout.is_zero() {
            errors.push("saga.step_timeout must be > 0".to_string());
        }
        if self.two_phase.prepare_timeout.is_zero() {
            errors.push("two_phase.prepare_timeout must be > 0".to_string());
        }
        if self.two_phase.commit_timeout.is_zero() {
            errors.push("two_phase.commit_timeout must be > 0".to_string());
        }
        if self.two_phase.commit_retry_backoff.is_zero() {
            errors.push("two_phase.commit_retry_backoff must be > 0".to_string());
        }
        if self.two_phase.max_commit_retry_backoff < self.two_phase.commit_retry_backoff {
            errors.push(format!(
                "two_phase.max_commit_retry_backoff ({:?}) must be >= commit_retry_backoff ({:?})",
                self.two_phase.max_commit_retry_backoff, self.two_phase.commit_retry_backoff
            ));
        }
        if self.two_phase.max_commit_delivery_attempts == Some(0) {
            errors.push("two_phase.max_commit_delivery_attempts must be > 0 when set".to_string());
        }
        if self.adapter.max_attempts == 0 {
            errors.push("adapter.max_attempts must be >= 1".to_string());
        }

        for rule in &self.policy.rules {
            if rule.strategy == StrategyKind::PessimisticLock
                && rule.lock_timeout.map(|t| t.is_zero()).unwrap_or(false)
            {
                errors.push(format!("policy rule '{}' has a zero lock_timeout", rule.name));
            }
        }

        let mut seen = HashSet::new();
        for participant in &self.server.participants {
            if !seen.insert(participant.id.clone()) {
                errors.push(format!("duplicate participant id '{}'", participant.id));
            }
        }

        for saga in &self.server.sagas {
            if saga.steps.is_empty() {
                errors.push(format!("saga definition '{}' has no steps", saga.saga_type));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Optimistic concurrency control settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccConfig {
    /// Number of rebase-and-retry attempts after a lost write race.
    /// Zero surfaces the race to the caller immediately.
    #[serde(default)]
    pub max_conflict_retries: u32,
}

impl Default for OccConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 0,
        }
    }
}

/// Advisory lock settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease used when a caller does not specify one
    #[serde(default = "default_lease", with = "humantime_serde")]
    pub default_lease: Duration,

    /// Shortest lease a caller may request
    #[serde(default = "default_min_lease", with = "humantime_serde")]
    pub min_lease: Duration,

    /// Longest lease a caller may request
    #[serde(default = "default_max_lease", with = "humantime_serde")]
    pub max_lease: Duration,

    /// Upper bound on a single sleep while waiting for a lock
    #[serde(default = "default_wait_poll_interval", with = "humantime_serde")]
    pub wait_poll_interval: Duration,

    /// How often the reaper purges expired locks
    #[serde(default = "default_reap_interval", with = "humantime_serde")]
    pub reap_interval: Duration,
}

fn default_lease() -> Duration {
    Duration::from_secs(30)
}

fn default_min_lease() -> Duration {
    Duration::from_secs(1)
}

fn default_max_lease() -> Duration {
    Duration::from_secs(600)
}

fn default_wait_poll_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_reap_interval() -> Duration {
    Duration::from_secs(10)
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_lease: default_lease(),
            min_lease: default_min_lease(),
            max_lease: default_max_lease(),
            wait_poll_interval: default_wait_poll_interval(),
            reap_interval: default_reap_interval(),
        }
    }
}

impl LockConfig {
    /// Clamp a requested lease into the configured bounds.
    pub fn clamp_lease(&self, requested: Duration) -> Duration {
        requested.clamp(self.min_lease, self.max_lease)
    }
}

/// Strategy for selecting a deadlock victim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VictimSelection {
    /// Abort the owner that started most recently
    #[default]
    Youngest,
    /// Abort the owner that started first
    Oldest,
    /// Abort the owner holding the fewest locks
    LeastWork,
}

/// Deadlock detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadlockConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_detection_interval", with = "humantime_serde")]
    pub detection_interval: Duration,

    #[serde(default)]
    pub victim_selection: VictimSelection,
}

fn default_detection_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_true() -> bool {
    true
}

impl Default for DeadlockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            detection_interval: default_detection_interval(),
            victim_selection: VictimSelection::default(),
        }
    }
}

/// Saga orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaConfig {
    /// Maximum number of non-terminal sagas
    #[serde(default = "default_max_active_sagas")]
    pub max_active_sagas: usize,

    /// Bound on a single forward or compensation invocation
    #[serde(default = "default_step_timeout", with = "humantime_serde")]
    pub step_timeout: Duration,

    /// How long finished sagas stay queryable before gc
    #[serde(default = "default_retain_completed", with = "humantime_serde")]
    pub retain_completed: Duration,
}

fn default_max_active_sagas() -> usize {
    10_000
}

fn default_step_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            max_active_sagas: default_max_active_sagas(),
            step_timeout: default_step_timeout(),
            retain_completed: default_retain_completed(),
        }
    }
}

/// Two-phase commit settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwoPhaseConfig {
    /// Identity recorded on every transaction this coordinator drives
    #[serde(default = "default_coordinator_id")]
    pub coordinator_id: String,

    /// Deadline for collecting all prepare votes
    #[serde(default = "default_prepare_timeout", with = "humantime_serde")]
    pub prepare_timeout: Duration,

    /// Deadline for a single commit delivery attempt
    #[serde(default = "default_commit_timeout", with = "humantime_serde")]
    pub commit_timeout: Duration,

    /// Initial delay between commit delivery attempts
    #[serde(default = "default_commit_retry_backoff", with = "humantime_serde")]
    pub commit_retry_backoff: Duration,

    /// Ceiling for the commit delivery backoff
    #[serde(default = "default_max_commit_retry_backoff", with = "humantime_serde")]
    pub max_commit_retry_backoff: Duration,

    /// Delivery attempts per participant once commit is decided; unset retries forever
    #[serde(default)]
    pub max_commit_delivery_attempts: Option<u32>,

    /// Delivery attempts per participant for ABORT
    #[serde(default = "default_abort_delivery_attempts")]
    pub abort_delivery_attempts: u32,

    /// Maximum concurrent non-terminal transactions
    #[serde(default = "default_max_concurrent_txns")]
    pub max_concurrent_txns: usize,

    /// Report unknown transactions as aborted
    #[serde(default = "default_true")]
    pub presumed_abort: bool,

    /// How long terminal transactions stay queryable before gc
    #[serde(default = "default_retain_completed", with = "humantime_serde")]
    pub retain_completed: Duration,
}

fn default_coordinator_id() -> String {
    "tce-coordinator-1".to_string()
}

fn default_prepare_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_commit_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_commit_retry_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_commit_retry_backoff() -> Duration {
    Duration::from_secs(30)
}

fn default_abort_delivery_attempts() -> u32 {
    3
}

fn default_max_concurrent_txns() -> usize {
    1000
}

fn default_retain_completed() -> Duration {
    Duration::from_secs(3600)
}

impl Default for TwoPhaseConfig {
    fn default() -> Self {
        Self {
            coordinator_id: default_coordinator_id(),
            prepare_timeout: default_prepare_timeout(),
            commit_timeout: default_commit_timeout(),
            commit_retry_backoff: default_commit_retry_backoff(),
            max_commit_retry_backoff: default_max_commit_retry_backoff(),
            max_commit_delivery_attempts: None,
            abort_delivery_attempts: default_abort_delivery_attempts(),
            max_concurrent_txns: default_max_concurrent_txns(),
            presumed_abort: true,
            retain_completed: default_retain_completed(),
        }
    }
}

/// A single isolation policy rule.
///
/// `None` for `resource_type` or `operation_type` matches anything. Every
/// entry in `predicates` must equal the request context value of the same
/// name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub name: String,

    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub resource_type: Option<String>,

    #[serde(default)]
    pub operation_type: Option<String>,

    #[serde(default)]
    pub predicates: BTreeMap<String, serde_json::Value>,

    pub strategy: StrategyKind,

    /// Lease for pessimistic locks taken under this rule
    #[serde(default, with = "humantime_serde::option")]
    pub lock_timeout: Option<Duration>,
}

/// Isolation policy settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// A registered two-phase commit participant endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantEndpoint {
    pub id: ParticipantId,
    pub url: String,
}

/// One step of a saga definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,

    /// Step type dispatched to the action invoker for the forward action
    pub action: String,

    /// Step type dispatched to undo the forward action
    #[serde(default)]
    pub compensation: Option<String>,

    /// Static data handed to both invocations
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

/// An ordered multi-step workflow type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaDefinition {
    pub saga_type: String,
    pub steps: Vec<StepDefinition>,
}

/// Server process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Per-request timeout for outbound participant and action calls
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Two-phase commit participants
    #[serde(default)]
    pub participants: Vec<ParticipantEndpoint>,

    /// Base URL of the business action service invoked by sagas
    #[serde(default)]
    pub action_endpoint: Option<String>,

    /// Saga types available to StartSaga
    #[serde(default)]
    pub sagas: Vec<SagaDefinition>,
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8088
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            http_port: default_http_port(),
            request_timeout: default_request_timeout(),
            participants: Vec::new(),
            action_endpoint: None,
            sagas: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json or text)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log file path (None for stdout)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

/// Duration serialization helper
pub mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        s.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&humantime::format_duration(*d).to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s: Option<String> = Option::deserialize(deserializer)?;
            s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
