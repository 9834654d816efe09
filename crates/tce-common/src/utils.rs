//! Utility functions and helpers

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::TxnId;

/// Current wall-clock time.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// `now + duration`, saturating at the far end of chrono's range.
pub fn deadline_after(duration: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Milliseconds elapsed since `since`, clamped at zero.
pub fn elapsed_ms(since: DateTime<Utc>) -> u64 {
    (Utc::now() - since).num_milliseconds().max(0) as u64
}

/// Monotonic transaction id sequence. Ids start at 1; 0 is reserved.
#[derive(Debug)]
pub struct TxnIdGenerator {
    next: AtomicU64,
}

impl TxnIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first.max(1)),
        }
    }

    pub fn next_id(&self) -> TxnId {
        TxnId(self.next.fetch_add(1, Ordering::SeqCst))
    }

    /// Make sure future ids are strictly greater than `seen`.
    pub fn observe(&self, seen: TxnId) {
        self.next.fetch_max(seen.0.saturating_add(1), Ordering::SeqCst);
    }
}

impl Default for TxnIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
