//! Lock modes and the `LockResult` sum type.

use std::fmt;

/// The three modes a lock can be held in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Read mode; any number of scopes may hold it concurrently.
    Shared,
    /// A distinguished shared hold that reserves the right to upgrade to
    /// exclusive. At most one scope may hold `Upgradable` on a resource.
    Upgradable,
    /// Write mode; exclusive of every other owner, shared or exclusive.
    Exclusive,
}

impl LockMode {
    /// Whether `self` is at least as strong as `other` (Exclusive >
    /// Upgradable > Shared).
    pub fn at_least(&self, other: LockMode) -> bool {
        self.rank() >= other.rank()
    }

    fn rank(&self) -> u8 {
        match self {
            LockMode::Shared => 0,
            LockMode::Upgradable => 1,
            LockMode::Exclusive => 2,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "Shared"),
            LockMode::Upgradable => write!(f, "Upgradable"),
            LockMode::Exclusive => write!(f, "Exclusive"),
        }
    }
}

/// Outcome of a lock request. "Held" covers every variant except
/// `Unowned`, `TimedOutLock`, `Illegal`, and `Interrupted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    Acquired,
    Upgraded,
    OwnedShared,
    OwnedUpgradable,
    OwnedExclusive,
    Unowned,
    TimedOutLock,
    Illegal,
    Interrupted,
}

impl LockResult {
    pub fn is_held(&self) -> bool {
        matches!(
            self,
            LockResult::Acquired
                | LockResult::Upgraded
                | LockResult::OwnedShared
                | LockResult::OwnedUpgradable
                | LockResult::OwnedExclusive
        )
    }
}
