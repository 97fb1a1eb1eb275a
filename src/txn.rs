//! The transaction object that ties a lock scope to the trash/undo log,
//! and the distinguished `BOGUS` variant used for internal, unlocked
//! maintenance writes (§9).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{LockError, Result};
use crate::lock::{LockMode, LockResult, LockScope};
use crate::trash::{UndoFragmentReclaimRecord, UndoLog};
use crate::types::IndexId;

/// A transaction or ad-hoc locker, plus the one internal, lockless,
/// non-firing variant (`BOGUS`) used by maintenance code such as the
/// trash cursor itself.
enum Kind {
    Transactional(Arc<LockScope>),
    Bogus,
}

pub struct Transaction {
    id: u64,
    kind: Kind,
    undo: Option<UndoLog>,
    borked: AtomicBool,
}

impl Transaction {
    pub fn new(id: u64, scope: Arc<LockScope>) -> Self {
        Self { id, kind: Kind::Transactional(scope), undo: Some(UndoLog::new()), borked: AtomicBool::new(false) }
    }

    /// The distinguished no-op transaction: never acquires locks, never
    /// fires triggers, and never participates in trash/undo (there is
    /// nothing to roll it back to).
    pub fn bogus() -> Self {
        Self { id: 0, kind: Kind::Bogus, undo: None, borked: AtomicBool::new(false) }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_bogus(&self) -> bool {
        matches!(self.kind, Kind::Bogus)
    }

    /// Whether a mutation under this transaction should run the trigger
    /// pipeline at all — false only for `BOGUS`.
    pub fn fires_triggers(&self) -> bool {
        !self.is_bogus()
    }

    pub fn undo_log(&self) -> Option<&UndoLog> {
        self.undo.as_ref()
    }

    pub fn scope(&self) -> Option<&Arc<LockScope>> {
        match &self.kind {
            Kind::Transactional(s) => Some(s),
            Kind::Bogus => None,
        }
    }

    pub fn mark_borked(&self, reason: impl Into<String>) -> LockError {
        self.borked.store(true, Ordering::SeqCst);
        LockError::BorkedTransaction(reason.into())
    }

    pub fn is_borked(&self) -> bool {
        self.borked.load(Ordering::SeqCst)
    }

    /// Rollback always succeeds even on a borked transaction — "commit
    /// will fail until reset" (§7), and rolling back is the reset.
    pub fn reset_borked(&self) {
        self.borked.store(false, Ordering::SeqCst);
    }

    fn check_not_borked(&self) -> Result<()> {
        if self.is_borked() {
            Err(LockError::BorkedTransaction(
                "transaction is borked; commit/rollback will fail until reset".into(),
            ))
        } else {
            Ok(())
        }
    }

    /// Acquires an exclusive lock on behalf of a pending mutation. `BOGUS`
    /// short-circuits without touching the lock table, per §9.
    ///
    /// Unlike the raw `LockScope::lock`, this does not hand back
    /// `TimedOutLock`/`Illegal` as an `Ok` value: a mutation that cannot
    /// actually secure the lock must not proceed, so those outcomes are
    /// turned into the matching `LockError` here instead of being left
    /// for the caller to notice (or not) by inspecting the result.
    pub fn lock_exclusive(&self, index_id: IndexId, key: &[u8], timeout: Option<Duration>) -> Result<LockResult> {
        match &self.kind {
            Kind::Bogus => Ok(LockResult::Acquired),
            Kind::Transactional(scope) => {
                let result = scope.lock(LockMode::Exclusive, index_id, key, timeout)?;
                match result {
                    LockResult::TimedOutLock => Err(LockError::LockTimeout {
                        waited: timeout.or_else(|| scope.default_timeout()).unwrap_or(Duration::ZERO),
                        owner: None,
                    }),
                    LockResult::Illegal => Err(LockError::IllegalUpgrade),
                    _ if result.is_held() => Ok(result),
                    other => Err(LockError::illegal_state(format!(
                        "lock_exclusive: unexpected non-held result {other:?}"
                    ))),
                }
            }
        }
    }

    /// Appends a fragment-reclaim undo record. A no-op for `BOGUS` (it
    /// has no undo log, by construction, since it is never rolled back).
    pub fn push_undo(&self, record: UndoFragmentReclaimRecord) {
        if let Some(undo) = &self.undo {
            undo.push(record);
        }
    }

    pub fn has_trash(&self) -> bool {
        self.undo.as_ref().map(|u| u.has_trash()).unwrap_or(false)
    }

    /// Drains the undo log in reverse-insertion order for rollback, or
    /// releases it after a successful commit.
    pub fn take_undo_for_rollback(&self) -> Vec<UndoFragmentReclaimRecord> {
        self.undo.as_ref().map(|u| u.drain_reverse()).unwrap_or_default()
    }

    pub fn clear_undo(&self) {
        if let Some(undo) = &self.undo {
            undo.clear();
        }
    }

    /// Releases every lock held by this transaction's scope. Called after
    /// both commit and rollback. `BOGUS` holds nothing.
    pub fn release_all_locks(&self) {
        if let Kind::Transactional(scope) = &self.kind {
            scope.release_all();
        }
    }

    pub fn check_commit_preconditions(&self) -> Result<()> {
        self.check_not_borked()
    }
}
