//! Engine configuration
//!
//! The transactional core has only a handful of genuinely tunable knobs —
//! everything else (page layout, fsync cadence, replication) belongs to
//! collaborators outside this crate's boundary. This module exposes those
//! knobs the same way the rest of the configuration surface is built
//! elsewhere in the stack: doc-commented variants, a sensible `Default`,
//! and named presets for common deployment shapes.

use serde::{Deserialize, Serialize};

/// Whether a scope that already holds the sole shared lock on a resource
/// may request an upgradable (or exclusive) lock on it.
///
/// Strict policy forbids this unconditionally (`ILLEGAL`). The lenient
/// carve-out permits it when the requesting scope is provably the only
/// shared holder, since no other waiter can observe the brief window where
/// both modes are "sort of" held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradePolicy {
    /// Shared → upgradable/exclusive by the same holder always returns
    /// `ILLEGAL`, matching the spec's default.
    Strict,
    /// Shared → upgradable/exclusive is granted when the requester is the
    /// only shared owner of the resource.
    Lenient,
}

impl Default for UpgradePolicy {
    fn default() -> Self {
        UpgradePolicy::Strict
    }
}

/// Configuration for the `LockTable` and its owning engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of lock-table shards. Must be a power of two; shard
    /// selection is `hash(index_id, key) & (shard_count - 1)`.
    ///
    /// More shards reduce latch contention under high concurrency at the
    /// cost of a little more memory per idle table. Default: 64.
    pub shard_count: usize,

    /// Default timeout applied to `try_lock` calls that don't specify one
    /// explicitly. `None` means wait forever; `Some(Duration::ZERO)` means
    /// fail fast without running the deadlock detector.
    pub default_lock_timeout: Option<std::time::Duration>,

    /// Governs whether a sole shared holder may upgrade without going
    /// through `ILLEGAL`. See `UpgradePolicy`.
    pub upgrade_policy: UpgradePolicy,

    /// How many trash records the commit-side drain deletes per shared
    /// commit-latch acquisition. Larger batches hold the latch longer but
    /// amortize its cost better. Default: 32.
    pub trash_drain_batch: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shard_count: 64,
            default_lock_timeout: Some(std::time::Duration::from_secs(1)),
            upgrade_policy: UpgradePolicy::Strict,
            trash_drain_batch: 32,
        }
    }
}

impl EngineConfig {
    /// A configuration tuned for a small number of threads contending on a
    /// small key space: fewer shards (less idle overhead), short default
    /// timeout so tests fail fast.
    pub fn low_contention() -> Self {
        Self {
            shard_count: 8,
            default_lock_timeout: Some(std::time::Duration::from_millis(250)),
            ..Default::default()
        }
    }

    /// A configuration tuned for many concurrent writers spread across a
    /// large key space: more shards, a longer default timeout to tolerate
    /// transient contention before giving up.
    pub fn high_contention() -> Self {
        Self {
            shard_count: 256,
            default_lock_timeout: Some(std::time::Duration::from_secs(5)),
            trash_drain_batch: 128,
            ..Default::default()
        }
    }

    /// Deterministic, fast-failing configuration for unit and integration
    /// tests: one shard (exercises contention paths deterministically) and
    /// a short timeout.
    pub fn for_testing() -> Self {
        Self {
            shard_count: 1,
            default_lock_timeout: Some(std::time::Duration::from_millis(200)),
            upgrade_policy: UpgradePolicy::Strict,
            trash_drain_batch: 4,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.shard_count == 0 || !self.shard_count.is_power_of_two() {
            return Err(format!(
                "shard_count must be a nonzero power of two, got {}",
                self.shard_count
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_shard_count_is_power_of_two() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.shard_count.is_power_of_two());
    }

    #[test]
    fn presets_validate() {
        assert!(EngineConfig::low_contention().validate().is_ok());
        assert!(EngineConfig::high_contention().validate().is_ok());
        assert!(EngineConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_shard_count() {
        let mut cfg = EngineConfig::default();
        cfg.shard_count = 100;
        assert!(cfg.validate().is_err());
    }
}
