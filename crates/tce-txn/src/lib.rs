//! # TCE Transaction
//!
//! Coordination core of the transaction coordination engine:
//! - Versioned record access with adapter-boundary retries
//! - Optimistic concurrency control (OCC)
//! - Lease-based advisory locks and deadlock detection
//! - Saga orchestration with reverse-order compensation
//! - Two-phase commit across independent participants
//! - Isolation policy resolution and request routing

pub mod coordinator;
pub mod deadlock;
pub mod engine;
pub mod lock_manager;
pub mod occ;
pub mod policy;
pub mod saga;
pub mod testing;
pub mod version_store;

// Re-export key types for convenience
pub use coordinator::{
    CoordinatorStats, DecisionRecord, Participant, ParticipantStatus, PrepareReply, PrepareVote,
    TransactionParticipant, TransactionStatus, TwoPhaseCoordinator, TwoPhaseTransaction,
};
pub use deadlock::{DeadlockCycle, DeadlockStats, OwnerMeta, WaitEdge, WaitForGraph};
pub use engine::{CoordinationEngine, EngineStats, SubmitOutcome, TransactionRequest};
pub use lock_manager::{LockManager, LockManagerStats, LockOutcome, ResourceLock};
pub use occ::{Mutation, OccOutcome, OccStats, OptimisticController};
pub use policy::{PolicyResolver, ResolvedPolicy};
pub use saga::{
    ActionInvoker, SagaInstance, SagaOrchestrator, SagaStats, SagaStatus, SagaStep,
    StepInvocation, StepKind, StepStatus,
};
pub use version_store::{
    InMemoryRecordStore, RecordStore, VersionStore, VersionStoreStats, VersionedRecord,
    WriteOutcome,
};
