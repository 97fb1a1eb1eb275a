//! Lock manager: sharded lock table, scoped lock stacks, and best-effort
//! deadlock detection. See §4 for the governing invariants.

mod deadlock;
mod result;
mod scope;
mod table;

pub use deadlock::{DeadlockDetector, DeadlockSet};
pub use result::{LockMode, LockResult};
pub use scope::{LockScope, PendingTxn, ScopeHandle, ScopeId};
pub use table::{resource_hash, Lock, LockTable};

use std::sync::Arc;
use std::time::Duration;

/// Convenience wrapper tying a `LockTable` to the default timeout and
/// upgrade policy callers should use when creating new scopes, mirroring
/// how the teacher's coordinator hands out fresh lockers against one
/// shared table.
pub struct LockManager {
    table: Arc<LockTable>,
    default_timeout: Option<Duration>,
}

impl LockManager {
    pub fn new(shard_count: usize, lenient_upgrade: bool, default_timeout: Option<Duration>) -> Self {
        Self {
            table: Arc::new(LockTable::new(shard_count, lenient_upgrade)),
            default_timeout,
        }
    }

    /// Builds a manager from the crate's tunable knobs (§10.2), rather
    /// than spelling out shard count / policy / timeout at each call site.
    pub fn from_config(config: &crate::config::EngineConfig) -> Self {
        Self::new(
            config.shard_count,
            config.upgrade_policy == crate::config::UpgradePolicy::Lenient,
            config.default_lock_timeout,
        )
    }

    pub fn table(&self) -> Arc<LockTable> {
        self.table.clone()
    }

    /// Opens a fresh scope. Nested (savepoint-style) sub-scopes are
    /// modeled within a single scope's stack via `scope_enter`/`scope_exit`,
    /// not as separate `LockScope` instances.
    pub fn new_scope(&self) -> Arc<LockScope> {
        LockScope::new(self.table.clone(), self.default_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn manager_opens_and_releases_a_scope() {
        let mgr = LockManager::new(4, false, Some(Duration::from_millis(200)));
        let scope = mgr.new_scope();
        let result = scope.lock(LockMode::Exclusive, 7, b"row-1", None).unwrap();
        assert!(result.is_held());
        drop(scope);
    }
}
