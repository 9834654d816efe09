//! Saga orchestration.
//!
//! Drives multi-step business transactions:
//! - Forward actions run strictly in sequence within one saga
//! - A failed step switches the saga to compensating; completed steps are
//!   undone in strictly descending step order
//! - A failed compensation stops automatic action and marks the saga failed
//!
//! Different sagas run concurrently and independently. Every invocation
//! carries an idempotency key derived from `(saga_id, step_number, kind)` so
//! that re-dispatching a step with an unknown outcome is safe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tce_common::error::SagaError;
use tce_common::prelude::*;
use tokio::sync::watch;

/// Saga lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Compensating,
    Compensated,
}

impl SagaStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Failed | SagaStatus::Compensated
        )
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SagaStatus::Pending => "pending",
            SagaStatus::InProgress => "in_progress",
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Compensated => "compensated",
        };
        f.write_str(s)
    }
}

/// Whether a step record is a forward action or its compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Action,
    Compensation,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Action => f.write_str("action"),
            StepKind::Compensation => f.write_str("compensation"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    /// Action whose compensation has completed
    Compensated,
}

/// Execution record of one action or compensation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStep {
    pub saga_id: SagaId,
    /// 1-based position in the saga definition
    pub step_number: u32,
    pub step_type: StepKind,
    pub name: String,
    /// Route handed to the action invoker
    pub handler: String,
    pub status: StepStatus,
    pub step_data: Payload,
    pub output: Option<Payload>,
    pub error_message: Option<String>,
    pub attempts: u32,
    pub executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Snapshot of a saga.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaInstance {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub status: SagaStatus,
    /// Step being (or last) executed; 0 before the first step starts
    pub current_step: u32,
    pub total_steps: u32,
    pub context_data: Payload,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub steps: Vec<SagaStep>,
}

impl SagaInstance {
    pub fn action(&self, step_number: u32) -> Option<&SagaStep> {
        self.step(step_number, StepKind::Action)
    }

    pub fn compensation(&self, step_number: u32) -> Option<&SagaStep> {
        self.step(step_number, StepKind::Compensation)
    }

    fn step(&self, step_number: u32, kind: StepKind) -> Option<&SagaStep> {
        self.steps
            .iter()
            .find(|s| s.step_number == step_number && s.step_type == kind)
    }

    fn step_mut(&mut self, step_number: u32, kind: StepKind) -> Option<&mut SagaStep> {
        self.steps
            .iter_mut()
            .find(|s| s.step_number == step_number && s.step_type == kind)
    }
}

/// A single call into business logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInvocation {
    pub saga_id: SagaId,
    pub step_number: u32,
    pub kind: StepKind,
    /// Forward action or compensation step type from the saga definition
    pub step_type: String,
    pub step_data: Payload,
    /// Saga context including outputs of earlier steps
    pub context: Payload,
    pub idempotency_key: String,
}

impl StepInvocation {
    pub fn idempotency_key(saga_id: SagaId, step_number: u32, kind: StepKind) -> String {
        format!("{saga_id}:{step_number}:{kind}")
    }
}

/// Invokes forward and compensation actions by step type.
///
/// Implementations must tolerate repeated delivery of the same
/// `idempotency_key`.
#[async_trait]
pub trait ActionInvoker: Send + Sync {
    async fn invoke(&self, invocation: StepInvocation) -> Result<Payload>;
}

/// Saga orchestrator statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SagaStats {
    pub sagas_started: u64,
    pub sagas_completed: u64,
    pub sagas_compensated: u64,
    pub sagas_failed: u64,
    pub sagas_cancelled: u64,
    pub steps_executed: u64,
    pub steps_failed: u64,
    pub step_timeouts: u64,
    pub compensations_executed: u64,
    pub compensations_failed: u64,
    pub recovered_sagas: u64,
    pub gc_removed: u64,
}

struct SagaEntry {
    instance: RwLock<SagaInstance>,
    definition: Arc<SagaDefinition>,
    /// Serializes step execution for this saga
    run_lock: tokio::sync::Mutex<()>,
    status_tx: watch::Sender<SagaStatus>,
}

enum Next {
    Forward(u32),
    Compensate(u32),
    Done,
}

/// Saga orchestrator.
pub struct SagaOrchestrator {
    config: SagaConfig,
    definitions: DashMap<String, Arc<SagaDefinition>>,
    sagas: DashMap<SagaId, Arc<SagaEntry>>,
    invoker: Arc<dyn ActionInvoker>,
    stats: Mutex<SagaStats>,
}

impl SagaOrchestrator {
    pub fn new(config: SagaConfig, invoker: Arc<dyn ActionInvoker>) -> Self {
        Self {
            config,
            definitions: DashMap::new(),
            sagas: DashMap::new(),
            invoker,
            stats: Mutex::new(SagaStats::default()),
        }
    }

    /// Register (or replace) a saga type.
    pub fn register_definition(&self, definition: SagaDefinition) -> Result<()> {
        if definition.saga_type.is_empty() {
            return Err(Error::invalid_argument("saga type must not be empty"));
        }
        if definition.steps.is_empty() {
            return Err(Error::invalid_argument(format!(
                "saga type '{}' has no steps",
                definition.saga_type
            )));
        }
        debug!(
            saga_type = %definition.saga_type,
            steps = definition.steps.len(),
            "saga definition registered"
        );
        self.definitions
            .insert(definition.saga_type.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn saga_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.definitions.iter().map(|d| d.key().clone()).collect();
        types.sort();
        types
    }

    /// Create a saga in `pending` without running it.
    pub fn create_saga(&self, saga_type: &str, context_data: Payload) -> Result<SagaId> {
        let definition = self
            .definitions
            .get(saga_type)
            .map(|d| d.clone())
            .ok_or_else(|| Error::Saga(SagaError::UnknownSagaType(saga_type.to_string())))?;

        let context_data = match context_data {
            Payload::Null => Payload::Object(Default::default()),
            obj @ Payload::Object(_) => obj,
            _ => {
                return Err(Error::invalid_argument(
                    "saga context data must be a JSON object",
                ))
            }
        };

        if self.active_count() >= self.config.max_active_sagas {
            return Err(Error::ResourceExhausted(format!(
                "too many active sagas (limit {})",
                self.config.max_active_sagas
            )));
        }

        let saga_id = SagaId::generate();
        let now = Utc::now();
        let instance = SagaInstance {
            saga_id,
            saga_type: saga_type.to_string(),
            status: SagaStatus::Pending,
            current_step: 0,
            total_steps: definition.steps.len() as u32,
            context_data,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            steps: Vec::new(),
        };
        let (status_tx, _) = watch::channel(SagaStatus::Pending);

        self.sagas.insert(
            saga_id,
            Arc::new(SagaEntry {
                instance: RwLock::new(instance),
                definition,
                run_lock: tokio::sync::Mutex::new(()),
                status_tx,
            }),
        );
        self.stats.lock().sagas_started += 1;
        info!(saga_id = %saga_id, saga_type, "saga created");
        Ok(saga_id)
    }

    /// `StartSaga`: create the saga and drive it on a background task.
    pub fn start_saga(self: &Arc<Self>, saga_type: &str, context_data: Payload) -> Result<SagaId> {
        let saga_id = self.create_saga(saga_type, context_data)?;
        self.spawn_run(saga_id);
        Ok(saga_id)
    }

    /// Create a saga and drive it to a terminal state on the calling task.
    pub async fn execute_saga(&self, saga_type: &str, context_data: Payload) -> Result<SagaInstance> {
        let saga_id = self.create_saga(saga_type, context_data)?;
        self.run_saga(saga_id).await
    }

    /// Drive an existing saga until it reaches a terminal state.
    pub async fn run_saga(&self, saga_id: SagaId) -> Result<SagaInstance> {
        let entry = self.entry(saga_id)?;
        self.drive(&entry).await
    }

    /// `GetSagaStatus`.
    pub fn get_saga(&self, saga_id: SagaId) -> Result<SagaInstance> {
        Ok(self.entry(saga_id)?.instance.read().clone())
    }

    /// Cancel a saga that has not started executing.
    ///
    /// Once the first step has been dispatched the saga can only be unwound
    /// through compensation.
    pub fn cancel_saga(&self, saga_id: SagaId) -> Result<SagaInstance> {
        let entry = self.entry(saga_id)?;
        let mut saga = entry.instance.write();
        if saga.status != SagaStatus::Pending {
            return Err(Error::invalid_state(format!(
                "saga {saga_id} is {} and can no longer be cancelled",
                saga.status
            )));
        }
        saga.failure_reason = Some("cancelled".to_string());
        set_status(&entry, &mut saga, SagaStatus::Compensated);
        self.stats.lock().sagas_cancelled += 1;
        info!(saga_id = %saga_id, "saga cancelled before start");
        Ok(saga.clone())
    }

    /// Wait until the saga reaches a terminal state.
    pub async fn wait_for_saga(&self, saga_id: SagaId, timeout: Duration) -> Result<SagaInstance> {
        let entry = self.entry(saga_id)?;
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
        tokio::time::timeout(timeout, finished)
            .await
            .map_err(|_| Error::Timeout(format!("saga {saga_id} not finished after {timeout:?}")))?;
        let instance = entry.instance.read().clone();
        Ok(instance)
    }

    /// Re-drive every non-terminal saga that is not currently running.
    pub fn recover(self: &Arc<Self>) -> usize {
        let idle: Vec<SagaId> = self
            .sagas
            .iter()
            .filter(|e| !e.instance.read().status.is_terminal())
            .filter(|e| e.run_lock.try_lock().is_ok())
            .map(|e| *e.key())
            .collect();

        for saga_id in &idle {
            self.spawn_run(*saga_id);
        }
        if !idle.is_empty() {
            self.stats.lock().recovered_sagas += idle.len() as u64;
            info!(count = idle.len(), "re-driving unfinished sagas");
        }
        idle.len()
    }

    /// Drop finished sagas whose last update is older than `retain_completed`.
    pub fn gc(&self) -> usize {
        let retain = chrono::Duration::from_std(self.config.retain_completed)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = Utc::now() - retain;

        let expired: Vec<SagaId> = self
            .sagas
            .iter()
            .filter(|e| {
                let saga = e.instance.read();
                saga.status.is_terminal() && saga.updated_at < cutoff
            })
            .map(|e| *e.key())
            .collect();

        for saga_id in &expired {
            self.sagas.remove(saga_id);
        }
        if !expired.is_empty() {
            self.stats.lock().gc_removed += expired.len() as u64;
            debug!(removed = expired.len(), "finished sagas collected");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.sagas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sagas.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.sagas
            .iter()
            .filter(|e| !e.instance.read().status.is_terminal())
            .count()
    }

    pub fn stats(&self) -> SagaStats {
        self.stats.lock().clone()
    }

    fn entry(&self, saga_id: SagaId) -> Result<Arc<SagaEntry>> {
        self.sagas
            .get(&saga_id)
            .map(|e| e.clone())
            .ok_or_else(|| Error::not_found("Saga", saga_id.to_string()))
    }

    fn spawn_run(self: &Arc<Self>, saga_id: SagaId) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_saga(saga_id).await {
                error!(saga_id = %saga_id, error = %e, "saga run aborted");
            }
        });
    }

    async fn drive(&self, entry: &Arc<SagaEntry>) -> Result<SagaInstance> {
        let _running = entry.run_lock.lock().await;
        loop {
            match self.plan_next(entry) {
                Next::Forward(step) => self.run_forward(entry, step).await,
                Next::Compensate(step) => self.run_compensation(entry, step).await,
                Next::Done => break,
            }
        }
        let instance = entry.instance.read().clone();
        Ok(instance)
    }

    fn plan_next(&self, entry: &SagaEntry) -> Next {
        let mut saga = entry.instance.write();
        match saga.status {
            SagaStatus::Pending => {
                saga.current_step = 1;
                set_status(entry, &mut saga, SagaStatus::InProgress);
                Next::Forward(1)
            }
            SagaStatus::InProgress => {
                let step = saga.current_step.max(1);
                match saga.action(step).map(|s| s.status) {
                    None | Some(StepStatus::Pending) | Some(StepStatus::Executing) => {
                        Next::Forward(step)
                    }
                    Some(StepStatus::Completed) if step < saga.total_steps => {
                        saga.current_step = step + 1;
                        Next::Forward(step + 1)
                    }
                    Some(StepStatus::Completed) => {
                        self.finish_completed(entry, &mut saga);
                        Next::Done
                    }
                    Some(StepStatus::Failed) | Some(StepStatus::Compensated) => {
                        set_status(entry, &mut saga, SagaStatus::Compensating);
                        self.next_compensation(entry, &mut saga)
                    }
                }
            }
            SagaStatus::Compensating => self.next_compensation(entry, &mut saga),
            SagaStatus::Completed | SagaStatus::Failed | SagaStatus::Compensated => Next::Done,
        }
    }

    /// Highest completed step that still needs undoing.
    fn next_compensation(&self, entry: &SagaEntry, saga: &mut SagaInstance) -> Next {
        let pending = saga
            .steps
            .iter()
            .filter(|s| s.step_type == StepKind::Action && s.status == StepStatus::Completed)
            .filter(|s| {
                entry
                    .definition
                    .steps
                    .get(s.step_number as usize - 1)
                    .map_or(false, |d| d.compensation.is_some())
            })
            .map(|s| s.step_number)
            .max();

        match pending {
            Some(step) => Next::Compensate(step),
            None => {
                set_status(entry, saga, SagaStatus::Compensated);
                self.stats.lock().sagas_compensated += 1;
                info!(
                    saga_id = %saga.saga_id,
                    reason = saga.failure_reason.as_deref().unwrap_or(""),
                    "saga compensated"
                );
                Next::Done
            }
        }
    }

    fn finish_completed(&self, entry: &SagaEntry, saga: &mut SagaInstance) {
        set_status(entry, saga, SagaStatus::Completed);
        self.stats.lock().sagas_completed += 1;
        info!(saga_id = %saga.saga_id, saga_type = %saga.saga_type, "saga completed");
    }

    async fn run_forward(&self, entry: &SagaEntry, step: u32) {
        let Some(def) = entry.definition.steps.get(step as usize - 1) else {
            // Definitions are validated non-empty and total_steps bounds `step`
            let mut saga = entry.instance.write();
            saga.failure_reason = Some(format!("step {step} missing from definition"));
            set_status(entry, &mut saga, SagaStatus::Compensating);
            return;
        };

        let invocation = {
            let mut saga = entry.instance.write();
            let saga_id = saga.saga_id;
            let now = Utc::now();
            match saga.step_mut(step, StepKind::Action) {
                Some(record) => {
                    // Outcome of the earlier dispatch is unknown; re-dispatch
                    record.status = StepStatus::Executing;
                    record.attempts += 1;
                    record.executed_at = Some(now);
                }
                None => saga.steps.push(SagaStep {
                    saga_id,
                    step_number: step,
                    step_type: StepKind::Action,
                    name: def.name.clone(),
                    handler: def.action.clone(),
                    status: StepStatus::Executing,
                    step_data: def.data.clone(),
                    output: None,
                    error_message: None,
                    attempts: 1,
                    executed_at: Some(now),
                    completed_at: None,
                }),
            }
            saga.updated_at = now;
            StepInvocation {
                saga_id,
                step_number: step,
                kind: StepKind::Action,
                step_type: def.action.clone(),
                step_data: def.data.clone(),
                context: saga.context_data.clone(),
                idempotency_key: StepInvocation::idempotency_key(saga_id, step, StepKind::Action),
            }
        };
        let saga_id = invocation.saga_id;
        debug!(saga_id = %saga_id, step, step_type = %def.action, "executing saga step");

        let result = self.invoke(invocation).await;

        let mut saga = entry.instance.write();
        let now = Utc::now();
        match result {
            Ok(output) => {
                if let Some(record) = saga.step_mut(step, StepKind::Action) {
                    record.status = StepStatus::Completed;
                    record.output = Some(output.clone());
                    record.completed_at = Some(now);
                }
                merge_context(&mut saga.context_data, &output);
                saga.updated_at = now;
                self.stats.lock().steps_executed += 1;

                if step >= saga.total_steps {
                    self.finish_completed(entry, &mut saga);
                } else {
                    saga.current_step = step + 1;
                }
            }
            Err(err) => {
                if let Some(record) = saga.step_mut(step, StepKind::Action) {
                    record.status = StepStatus::Failed;
                    record.error_message = Some(err.to_string());
                    record.completed_at = Some(now);
                }
                let failure = SagaError::StepFailed {
                    saga_id: saga_id.to_string(),
                    step,
                    reason: err.to_string(),
                };
                saga.failure_reason = Some(failure.to_string());
                set_status(entry, &mut saga, SagaStatus::Compensating);
                self.stats.lock().steps_failed += 1;
                warn!(
                    saga_id = %saga_id,
                    step,
                    step_type = %def.action,
                    error = %err,
                    "saga step failed, compensating"
                );
            }
        }
    }

    async fn run_compensation(&self, entry: &SagaEntry, step: u32) {
        let Some((def, handler)) = entry
            .definition
            .steps
            .get(step as usize - 1)
            .and_then(|d| d.compensation.clone().map(|c| (d, c)))
        else {
            return;
        };

        let invocation = {
            let mut saga = entry.instance.write();
            let saga_id = saga.saga_id;
            let now = Utc::now();
            match saga.step_mut(step, StepKind::Compensation) {
                Some(record) => {
                    record.status = StepStatus::Executing;
                    record.attempts += 1;
                    record.executed_at = Some(now);
                }
                None => saga.steps.push(SagaStep {
                    saga_id,
                    step_number: step,
                    step_type: StepKind::Compensation,
                    name: def.name.clone(),
                    handler: handler.clone(),
                    status: StepStatus::Executing,
                    step_data: def.data.clone(),
                    output: None,
                    error_message: None,
                    attempts: 1,
                    executed_at: Some(now),
                    completed_at: None,
                }),
            }
            saga.updated_at = now;
            StepInvocation {
                saga_id,
                step_number: step,
                kind: StepKind::Compensation,
                step_type: handler.clone(),
                step_data: def.data.clone(),
                context: saga.context_data.clone(),
                idempotency_key: StepInvocation::idempotency_key(
                    saga_id,
                    step,
                    StepKind::Compensation,
                ),
            }
        };
        let saga_id = invocation.saga_id;
        debug!(saga_id = %saga_id, step, step_type = %handler, "compensating saga step");

        let result = self.invoke(invocation).await;

        let mut saga = entry.instance.write();
        let now = Utc::now();
        match result {
            Ok(output) => {
                if let Some(record) = saga.step_mut(step, StepKind::Compensation) {
                    record.status = StepStatus::Completed;
                    record.output = Some(output);
                    record.completed_at = Some(now);
                }
                if let Some(action) = saga.step_mut(step, StepKind::Action) {
                    action.status = StepStatus::Compensated;
                }
                saga.updated_at = now;
                self.stats.lock().compensations_executed += 1;
            }
            Err(err) => {
                if let Some(record) = saga.step_mut(step, StepKind::Compensation) {
                    record.status = StepStatus::Failed;
                    record.error_message = Some(err.to_string());
                    record.completed_at = Some(now);
                }
                let incident = SagaError::CompensationFailed {
                    saga_id: saga_id.to_string(),
                    step,
                    reason: err.to_string(),
                };
                saga.failure_reason = Some(match saga.failure_reason.take() {
                    Some(original) => format!("{original}; {incident}"),
                    None => incident.to_string(),
                });
                set_status(entry, &mut saga, SagaStatus::Failed);
                {
                    let mut stats = self.stats.lock();
                    stats.compensations_failed += 1;
                    stats.sagas_failed += 1;
                }
                error!(
                    saga_id = %saga_id,
                    step,
                    step_type = %handler,
                    code = "COMPENSATION_FAILED",
                    error = %err,
                    "compensation failed, saga needs manual intervention"
                );
            }
        }
    }

    async fn invoke(&self, invocation: StepInvocation) -> Result<Payload> {
        let step = invocation.step_number;
        let kind = invocation.kind;
        let timeout = self.config.step_timeout;
        match tokio::time::timeout(timeout, self.invoker.invoke(invocation)).await {
            Ok(result) => result,
            Err(_) => {
                self.stats.lock().step_timeouts += 1;
                Err(Error::Timeout(format!(
                    "{kind} of step {step} exceeded {timeout:?}"
                )))
            }
        }
    }
}

fn set_status(entry: &SagaEntry, saga: &mut SagaInstance, status: SagaStatus) {
    saga.status = status;
    saga.updated_at = Utc::now();
    entry.status_tx.send_replace(status);
}

/// Shallow-merge an object output into the saga context.
fn merge_context(context: &mut Payload, output: &Payload) {
    let Payload::Object(fields) = output else {
        return;
    };
    if context.is_null() {
        *context = Payload::Object(Default::default());
    }
    if let Payload::Object(ctx) = context {
        for (k, v) in fields {
            ctx.insert(k.clone(), v.clone());
        }
    }
}
