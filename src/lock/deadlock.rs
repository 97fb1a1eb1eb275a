//! Best-effort deadlock detection: a wait-for graph walk with no latches
//! taken, per §4.3. Grounded on the teacher's `has_cycle` /
//! `detect_deadlock` walk over its `LockEntry` holder/waiter sets, widened
//! here to traverse scope-to-scope edges via `ScopeHandle::waiting_for`.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::lock::scope::ScopeId;
use crate::lock::table::{Lock, LockTable};
use crate::types::{IndexId, Key};

/// The cycle of resources discovered on a deadlock, in wait-for order
/// starting from the scope that asked for detection. A lock whose key is
/// not yet resolvable (shouldn't happen in practice, but the walk is
/// latch-free and may race a concurrent unlock) is recorded with `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockSet {
    pub resources: Vec<(IndexId, Option<Key>)>,
}

impl fmt::Display for DeadlockSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (index_id, key)) in self.resources.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            match key {
                Some(k) => write!(f, "({index_id}, {k:02x?})")?,
                None => write!(f, "({index_id}, <unresolved>)")?,
            }
        }
        write!(f, "]")
    }
}

/// Walks the wait-for graph starting from one scope, looking for a path
/// back to itself. No lock-table latch is held while walking: every read
/// is a single atomic snapshot (`owners_snapshot`, `waiting_for`), so the
/// graph may be stale by the time the walk completes. A false negative
/// just means the timeout that triggered detection fires again on the
/// next retry; a false positive is not possible because a reported cycle
/// is read directly off the edges as observed.
pub struct DeadlockDetector<'a> {
    table: &'a LockTable,
}

impl<'a> DeadlockDetector<'a> {
    pub fn new(table: &'a LockTable) -> Self {
        Self { table }
    }

    /// Looks for a cycle reachable from `origin`'s current
    /// `waiting_for` edge. Returns `None` if no cycle is found (the
    /// contention may simply be a long queue, not a deadlock).
    pub fn detect(&self, origin: ScopeId) -> Option<DeadlockSet> {
        let mut path: Vec<(IndexId, Option<Key>)> = Vec::new();
        let mut visiting = HashSet::new();
        let set = self.walk(origin, origin, &mut path, &mut visiting);
        if let Some(ref set) = set {
            eprintln!("deadlock detected: {} lock(s) on the cycle from scope {origin}", set.resources.len());
        }
        set
    }

    fn walk(
        &self,
        origin: ScopeId,
        current: ScopeId,
        path: &mut Vec<(IndexId, Option<Key>)>,
        visiting: &mut HashSet<ScopeId>,
    ) -> Option<DeadlockSet> {
        let handle = self.table.lookup_scope(current)?;
        let waiting_on: Arc<Lock> = handle.waiting_for()?;
        path.push((waiting_on.index_id, Some(waiting_on.key.clone())));

        let (exclusive_owner, shared_owners) = waiting_on.owners_snapshot();
        let mut owners: Vec<ScopeId> = shared_owners;
        owners.extend(exclusive_owner);

        for owner in owners {
            if owner == current {
                continue;
            }
            if owner == origin {
                return Some(DeadlockSet { resources: path.clone() });
            }
            if !visiting.insert(owner) {
                continue;
            }
            if let Some(found) = self.walk(origin, owner, path, visiting) {
                return Some(found);
            }
            visiting.remove(&owner);
        }

        path.pop();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::result::LockMode;
    use crate::lock::scope::LockScope;
    use std::sync::Arc as StdArc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn no_cycle_when_waiting_alone() {
        let table = StdArc::new(LockTable::new(1, false));
        let scope = LockScope::new(table.clone(), None);
        let detector = DeadlockDetector::new(&table);
        assert!(detector.detect(scope.id()).is_none());
    }

    #[test]
    fn detects_two_party_cycle() {
        let table = StdArc::new(LockTable::new(1, false));
        let a = LockScope::new(table.clone(), None);
        let b = LockScope::new(table.clone(), None);

        a.lock(LockMode::Exclusive, 1, b"x", None).unwrap();
        b.lock(LockMode::Exclusive, 1, b"y", None).unwrap();

        let table_for_b = table.clone();
        let b_for_thread = b.clone();
        let handle = thread::spawn(move || {
            // b waits on x, held by a.
            let _ = b_for_thread.lock(LockMode::Exclusive, 1, b"x", Some(Duration::from_secs(5)));
            let _ = table_for_b;
        });

        thread::sleep(Duration::from_millis(50));
        // a waits on y, held by b: a -> y -> b -> x -> a is a cycle.
        let result = a.lock(LockMode::Exclusive, 1, b"y", Some(Duration::from_millis(200)));
        assert!(result.is_err(), "expected a deadlock error, got {:?}", result);

        b.unlock().ok();
        handle.join().ok();
    }
}
