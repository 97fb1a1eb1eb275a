//! Error types for the transactional core.

use std::time::Duration;
use thiserror::Error;

use crate::lock::DeadlockSet;

pub type Result<T> = std::result::Result<T, LockError>;

/// Opaque attachment carried by a scope, surfaced to a blocked waiter so it
/// can report who (or what) is holding the lock it timed out on.
pub type Attachment = Option<String>;

#[derive(Error, Debug, Clone)]
pub enum LockError {
    /// A `try_lock` with a non-zero, non-infinite timeout expired without
    /// acquiring the lock, and the deadlock detector found no cycle.
    #[error("lock timed out after {waited:?} (owner: {owner:?})")]
    LockTimeout {
        waited: Duration,
        owner: Attachment,
    },

    /// A scope that already holds a lock shared attempted to request
    /// upgradable or exclusive, which policy forbids outside the `LENIENT`
    /// sole-shared-holder carve-out.
    #[error("illegal upgrade: scope already holds the lock in a weaker, non-upgradable mode")]
    IllegalUpgrade,

    /// The waiting thread was interrupted before the lock could be granted.
    #[error("lock wait was interrupted")]
    LockInterrupted,

    /// A full-timeout wait expired and the detector found a cycle in the
    /// wait-for graph.
    #[error("deadlock detected: {0}")]
    Deadlock(DeadlockSet),

    /// A caller violated the LIFO stack discipline: released with nothing
    /// held, crossed a scope boundary, tried to partially unlock a
    /// non-immediate upgrade, combined an acquire with an upgrade, or
    /// referenced a trigger handle that is no longer registered.
    #[error("illegal lock/scope state: {0}")]
    IllegalState(String),

    /// A trash write failed partway through the insert/undo-record/mutate
    /// sequence; the transaction can no longer commit or roll forward and
    /// must be reset.
    #[error("transaction borked by a failed trash write: {0}")]
    BorkedTransaction(String),

    /// `value_length` was asked to grow a value past what fits in a
    /// platform-sized length.
    #[error("value length {0} exceeds the maximum representable length")]
    LargeValue(u64),
}

impl LockError {
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        LockError::IllegalState(msg.into())
    }
}
