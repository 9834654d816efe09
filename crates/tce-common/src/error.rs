//! Error types for the transaction coordination engine

use thiserror::Error;

/// Result type alias using the engine's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    // Record store errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    // Concurrency control errors
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    // Saga errors
    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),

    // Participant protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    // Not found
    #[error("{0} not found: {1}")]
    NotFound(String, String),

    // Already exists
    #[error("{0} already exists: {1}")]
    AlreadyExists(String, String),

    // Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Operation not allowed in the entity's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Resource exhausted
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    // Dependency still failing after bounded retries
    #[error("Unavailable: {0}")]
    Unavailable(String),

    // Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    // Cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    /// The backing store could not be reached; safe to retry.
    #[error("Record store unavailable: {0}")]
    Unavailable(String),

    #[error("Record store backend error: {0}")]
    Backend(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),
}

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Version mismatch on {resource_key}: expected {expected}, found {actual}")]
    VersionMismatch {
        resource_key: String,
        expected: u64,
        actual: u64,
    },

    #[error("Concurrent modification on {resource_key}: expected {expected}, now {current}")]
    ConcurrentModification {
        resource_key: String,
        expected: u64,
        current: u64,
    },

    #[error("Lock conflict on {resource_key} (held by {holders:?})")]
    LockConflict {
        resource_key: String,
        holders: Vec<String>,
    },

    #[error("Lock acquisition failed for {owner}: {reason}")]
    LockAcquisitionFailed { owner: String, reason: String },

    #[error("Commit delivery to {participant} for txn {txn_id} exhausted after {attempts} attempts")]
    CommitDeliveryExhausted {
        txn_id: u64,
        participant: String,
        attempts: u32,
    },
}

#[derive(Error, Debug)]
pub enum SagaError {
    #[error("Unknown saga type: {0}")]
    UnknownSagaType(String),

    #[error("Step {step} of saga {saga_id} failed: {reason}")]
    StepFailed {
        saga_id: String,
        step: u32,
        reason: String,
    },

    #[error("Compensation of step {step} in saga {saga_id} failed: {reason}")]
    CompensationFailed {
        saga_id: String,
        step: u32,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Participant {participant} timed out for txn {txn_id}")]
    ParticipantTimeout { txn_id: u64, participant: String },

    /// Transport-level failure talking to a participant or action endpoint.
    #[error("Remote {target} unavailable: {reason}")]
    RemoteUnavailable { target: String, reason: String },

    #[error("Remote {target} rejected request: {reason}")]
    RemoteRejected { target: String, reason: String },

    #[error("Unknown participant: {0}")]
    UnknownParticipant(String),
}

/// Error taxonomy used to decide who reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Expected under load; surfaced to the caller for a retry decision.
    Contention,
    /// Drives the orchestrator's or coordinator's own recovery path.
    Protocol,
    /// Requires manual intervention; automatic action stops.
    Fatal,
    /// Low-level I/O failure retried at the adapter boundary.
    Transient,
    /// Caller error: bad argument, unknown entity, wrong state.
    Client,
    /// A dependency kept failing after bounded retries.
    Unavailable,
    /// Engine bug or misconfiguration.
    Internal,
}

impl Error {
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound(kind.into(), name.into())
    }

    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::AlreadyExists(kind.into(), name.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Stable machine-readable code reported to API callers.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Storage(se) => match se {
                StorageError::Unavailable(_) => "STORAGE_UNAVAILABLE",
                StorageError::Backend(_) => "STORAGE_ERROR",
                StorageError::RecordNotFound(_) => "NOT_FOUND",
            },
            Error::Transaction(te) => match te {
                TransactionError::VersionMismatch { .. } => "VERSION_MISMATCH",
                TransactionError::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
                TransactionError::LockConflict { .. } => "LOCK_CONFLICT",
                TransactionError::LockAcquisitionFailed { .. } => "LOCK_ACQUISITION_FAILED",
                TransactionError::CommitDeliveryExhausted { .. } => "COMMIT_DELIVERY_EXHAUSTED",
            },
            Error::Saga(se) => match se {
                SagaError::UnknownSagaType(_) => "UNKNOWN_SAGA_TYPE",
                SagaError::StepFailed { .. } => "SAGA_STEP_FAILED",
                SagaError::CompensationFailed { .. } => "COMPENSATION_FAILED",
            },
            Error::Protocol(pe) => match pe {
                ProtocolError::ParticipantTimeout { .. } => "PARTICIPANT_TIMEOUT",
                ProtocolError::RemoteUnavailable { .. } => "REMOTE_UNAVAILABLE",
                ProtocolError::RemoteRejected { .. } => "REMOTE_REJECTED",
                ProtocolError::UnknownParticipant(_) => "UNKNOWN_PARTICIPANT",
            },
            Error::Io(_) => "IO_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::NotFound(_, _) => "NOT_FOUND",
            Error::AlreadyExists(_, _) => "ALREADY_EXISTS",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::InvalidState(_) => "INVALID_STATE",
            Error::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            Error::Unavailable(_) => "UNAVAILABLE",
            Error::Timeout(_) => "TIMEOUT",
            Error::Cancelled(_) => "CANCELLED",
        }
    }

    /// Classify the error according to the engine's failure taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Storage(StorageError::Unavailable(_)) => ErrorClass::Transient,
            Error::Storage(StorageError::Backend(_)) => ErrorClass::Internal,
            Error::Storage(StorageError::RecordNotFound(_)) => ErrorClass::Client,
            Error::Transaction(te) => match te {
                TransactionError::VersionMismatch { .. }
                | TransactionError::ConcurrentModification { .. }
                | TransactionError::LockConflict { .. }
                | TransactionError::LockAcquisitionFailed { .. } => ErrorClass::Contention,
                TransactionError::CommitDeliveryExhausted { .. } => ErrorClass::Fatal,
            },
            Error::Saga(SagaError::CompensationFailed { .. }) => ErrorClass::Fatal,
            Error::Saga(SagaError::StepFailed { .. }) => ErrorClass::Protocol,
            Error::Saga(SagaError::UnknownSagaType(_)) => ErrorClass::Client,
            Error::Protocol(ProtocolError::RemoteUnavailable { .. }) => ErrorClass::Transient,
            Error::Protocol(ProtocolError::UnknownParticipant(_)) => ErrorClass::Client,
            Error::Protocol(_) => ErrorClass::Protocol,
            Error::Io(_) => ErrorClass::Transient,
            Error::Timeout(_) => ErrorClass::Transient,
            Error::Unavailable(_) => ErrorClass::Unavailable,
            Error::NotFound(_, _)
            | Error::AlreadyExists(_, _)
            | Error::InvalidArgument(_)
            | Error::InvalidState(_)
            | Error::ResourceExhausted(_)
            | Error::Cancelled(_) => ErrorClass::Client,
            Error::Serialization(_) | Error::Config(_) | Error::Internal(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// Whether the adapter boundary may retry the failed call.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_contention(&self) -> bool {
        self.class() == ErrorClass::Contention
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::not_found("Saga", "abc");
        assert_eq!(err.to_string(), "Saga not found: abc");

        let err = Error::Transaction(TransactionError::VersionMismatch {
            resource_key: "order:1".into(),
            expected: 3,
            actual: 4,
        });
        assert_eq!(
            err.to_string(),
            "Transaction error: Version mismatch on order:1: expected 3, found 4"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_codes() {
        let mismatch = Error::Transaction(TransactionError::VersionMismatch {
            resource_key: "k".into(),
            expected: 1,
            actual: 2,
        });
        assert_eq!(mismatch.code(), "VERSION_MISMATCH");

        let raced = Error::Transaction(TransactionError::ConcurrentModification {
            resource_key: "k".into(),
            expected: 1,
            current: 2,
        });
        assert_eq!(raced.code(), "CONCURRENT_MODIFICATION");

        let conflict = Error::Transaction(TransactionError::LockConflict {
            resource_key: "k".into(),
            holders: vec!["a".into()],
        });
        assert_eq!(conflict.code(), "LOCK_CONFLICT");

        let victim = Error::Transaction(TransactionError::LockAcquisitionFailed {
            owner: "b".into(),
            reason: "deadlock victim".into(),
        });
        assert_eq!(victim.code(), "LOCK_ACQUISITION_FAILED");
    }

    #[test]
    fn test_classes() {
        let compensation = Error::Saga(SagaError::CompensationFailed {
            saga_id: "s".into(),
            step: 1,
            reason: "boom".into(),
        });
        assert_eq!(compensation.class(), ErrorClass::Fatal);
        assert_eq!(compensation.code(), "COMPENSATION_FAILED");

        let exhausted = Error::Transaction(TransactionError::CommitDeliveryExhausted {
            txn_id: 7,
            participant: "p2".into(),
            attempts: 5,
        });
        assert_eq!(exhausted.class(), ErrorClass::Fatal);

        let timeout = Error::Protocol(ProtocolError::ParticipantTimeout {
            txn_id: 1,
            participant: "p".into(),
        });
        assert_eq!(timeout.class(), ErrorClass::Protocol);
        assert!(!timeout.is_transient());

        let unavailable = Error::Storage(StorageError::Unavailable("down".into()));
        assert!(unavailable.is_transient());

        assert!(Error::Transaction(TransactionError::LockConflict {
            resource_key: "k".into(),
            holders: vec![],
        })
        .is_contention());
        assert_eq!(Error::invalid_state("x").class(), ErrorClass::Client);
    }
}
