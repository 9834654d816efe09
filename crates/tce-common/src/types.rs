//! Core types for the transaction coordination engine

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Record payloads are opaque JSON documents.
pub type Payload = serde_json::Value;

/// Key of a versioned record or lockable resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(pub String);

/// Identity of a lock owner (usually a caller-side transaction)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub String);

/// Identity of a two-phase commit participant
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

/// Unique identifier for a saga instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SagaId(pub Uuid);

/// Unique identifier for a two-phase transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxnId(pub u64);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(ResourceKey);
string_id!(OwnerId);
string_id!(ParticipantId);

impl SagaId {
    pub fn generate() -> Self {
        SagaId(Uuid::new_v4())
    }
}

impl fmt::Display for SagaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SagaId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(SagaId)
    }
}

impl TxnId {
    pub const INVALID: TxnId = TxnId(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

// ============================================================================
// Lock types
// ============================================================================

/// Advisory lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Read,
    Write,
    Exclusive,
}

impl LockType {
    /// Only read locks may be shared.
    pub fn is_compatible(&self, other: &LockType) -> bool {
        matches!((self, other), (LockType::Read, LockType::Read))
    }

    /// Whether a holder of `self` already has everything `requested` grants.
    pub fn covers(&self, requested: &LockType) -> bool {
        match (self, requested) {
            (LockType::Exclusive, _) => true,
            (LockType::Write, LockType::Read | LockType::Write) => true,
            (LockType::Read, LockType::Read) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::Read => write!(f, "read"),
            LockType::Write => write!(f, "write"),
            LockType::Exclusive => write!(f, "exclusive"),
        }
    }
}

// ============================================================================
// Isolation strategies
// ============================================================================

/// Concurrency strategy chosen per operation category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyKind {
    /// Version-checked write with no locking.
    OccOnly,
    /// Write lock held around a version-checked write.
    PessimisticLock,
    /// Atomic commit across independently-owned participants.
    TwoPhaseCommit,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::OccOnly => write!(f, "OCC_ONLY"),
            StrategyKind::PessimisticLock => write!(f, "PESSIMISTIC_LOCK"),
            StrategyKind::TwoPhaseCommit => write!(f, "TWO_PHASE_COMMIT"),
        }
    }
}
