//! `Database`: the thin facade that ties a `LockManager`, the
//! `ValueStore`/`FragmentStore`/`TxnIdSource` collaborators, and a
//! registry of `Index`es into the commit/rollback orchestration
//! described in §2's control flow. Grounded on the teacher's
//! `database/core.rs` (the `MoteDB` struct bundling its engine-wide
//! collaborators) and `txn/coordinator.rs` (`commit`/`rollback`), cut
//! down to just what the transactional core needs — no WAL, no catalog,
//! no query layer.

use parking_lot::Mutex;
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::index::Index;
use crate::lock::LockManager;
use crate::store::{FragmentStore, TxnIdSource, ValueStore};
use crate::trash::FragmentedTrash;
use crate::txn::Transaction;
use crate::types::IndexId;

/// Owns the lock manager and the abstract store collaborators, and hands
/// out `Index`es and `Transaction`s bound to them. A real deployment
/// backs `store`/`fragments`/`txn_ids` with the page-file engine, redo
/// log, and recovery-seeded counter respectively; this crate only needs
/// the traits.
pub struct Database {
    config: EngineConfig,
    lock_manager: LockManager,
    store: Arc<dyn ValueStore>,
    fragments: Arc<dyn FragmentStore>,
    txn_ids: Arc<dyn TxnIdSource>,
    indexes: DashMap<IndexId, Arc<Index>>,
    /// The *shared* commit latch named in §5: held around each fragment
    /// release during a trash drain, standing in for cooperation with the
    /// (out-of-scope) allocator's checkpoint-exclusive latch.
    commit_latch: Mutex<()>,
}

impl Database {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn ValueStore>,
        fragments: Arc<dyn FragmentStore>,
        txn_ids: Arc<dyn TxnIdSource>,
    ) -> Arc<Self> {
        let lock_manager = LockManager::from_config(&config);
        Arc::new(Self {
            config,
            lock_manager,
            store,
            fragments,
            txn_ids,
            indexes: DashMap::new(),
            commit_latch: Mutex::new(()),
        })
    }

    /// A database over the in-memory reference collaborators, for tests
    /// and small embedded deployments that don't need real durability.
    pub fn in_memory(config: EngineConfig) -> Arc<Self> {
        use crate::store::mem::{AtomicTxnIdSource, MemFragmentStore, MemStore};
        Self::new(
            config,
            Arc::new(MemStore::new()),
            Arc::new(MemFragmentStore::new()),
            Arc::new(AtomicTxnIdSource::new()),
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Opens (creating on first use) the `Index` for `id`, sharing this
    /// database's backing store and fragment side-store.
    pub fn open_index(self: &Arc<Self>, id: IndexId) -> Arc<Index> {
        self.indexes
            .entry(id)
            .or_insert_with(|| Index::new(id, self.store.clone(), self.fragments.clone()))
            .clone()
    }

    /// Begins a fresh transaction with its own lock scope and undo log.
    pub fn begin(self: &Arc<Self>) -> Transaction {
        Transaction::new(self.txn_ids.next_txn_id(), self.lock_manager.new_scope())
    }

    /// The distinguished internal transaction used by maintenance code
    /// (the trash cursor itself, crash recovery): no locks, no triggers,
    /// no undo.
    pub fn bogus_transaction(&self) -> Transaction {
        Transaction::bogus()
    }

    fn trash(&self) -> FragmentedTrash<'_> {
        FragmentedTrash::new(self.store.as_ref())
    }

    /// Commits `txn`: drains its trash records (releasing their
    /// fragments through the allocator collaborator), clears the undo
    /// log, and releases every lock it holds. Fails without touching
    /// anything if the transaction was borked by a prior failed trash
    /// write (§7).
    pub fn commit(&self, txn: &Transaction) -> Result<()> {
        txn.check_commit_preconditions()?;
        if txn.has_trash() {
            self.trash().commit_drain(
                &self.commit_latch,
                txn.id(),
                self.fragments.as_ref(),
                self.config.trash_drain_batch,
            );
        }
        txn.clear_undo();
        txn.release_all_locks();
        Ok(())
    }

    /// Rolls back `txn`: replays its undo log in reverse, restoring every
    /// fragmented value the transaction had trashed, then releases its
    /// locks. Always succeeds, even on a borked transaction — rolling
    /// back is itself the reset §7 promises.
    pub fn rollback(&self, txn: &Transaction) -> Result<()> {
        let records = txn.take_undo_for_rollback();
        if !records.is_empty() {
            self.trash().rollback_replay(records, txn.id());
        }
        txn.reset_borked();
        txn.release_all_locks();
        Ok(())
    }

    /// Crash-recovery sweep: reclaims every entry still in the trash
    /// index after redo replay (§4.5). Returns the count reclaimed; a
    /// nonzero count means the engine had pending trash at crash time.
    pub fn empty_all_trash(&self) -> usize {
        self.trash().empty_all_trash(self.fragments.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::TriggerObserver;
    use crate::types::ValueState;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn commit_drains_trash_and_releases_locks() {
        let db = Database::in_memory(EngineConfig::for_testing());
        let index = db.open_index(1);
        let view = index.view();

        let txn = db.begin();
        let big = vec![b'a'; 9000];
        view.store(&txn, b"big", big.clone()).unwrap();
        view.store(&txn, b"big", vec![b'b'; 9000]).unwrap();
        assert!(txn.has_trash());

        db.commit(&txn).unwrap();
        assert_eq!(view.get(b"big"), Some(vec![b'b'; 9000]));
        assert_eq!(txn.scope().unwrap().held_lock_count(), 0);
    }

    #[test]
    fn rollback_restores_fragmented_value_scenario_6() {
        let db = Database::in_memory(EngineConfig::for_testing());
        let index = db.open_index(1);
        let view = index.view();

        let original = vec![b'x'; 9000];
        let setup = db.begin();
        view.store(&setup, b"big", original.clone()).unwrap();
        db.commit(&setup).unwrap();

        let txn = db.begin();
        view.store(&txn, b"big", vec![b'y'; 9000]).unwrap();
        db.rollback(&txn).unwrap();

        assert_eq!(view.get(b"big"), Some(original));
        assert_eq!(db.empty_all_trash(), 0);
    }

    #[test]
    fn commit_refuses_a_borked_transaction() {
        let db = Database::in_memory(EngineConfig::for_testing());
        let txn = db.begin();
        let _ = txn.mark_borked("simulated trash-write failure");
        assert!(db.commit(&txn).is_err());
        // Rolling back is the reset.
        db.rollback(&txn).unwrap();
        assert!(!txn.is_borked());
    }

    #[test]
    fn scenario_auto_commit_vs_explicit_txn() {
        let db = Database::in_memory(EngineConfig::for_testing());
        let index = db.open_index(1);
        let view = index.view();

        let txn1 = db.begin();
        view.store(&txn1, b"k1", b"v1".to_vec()).unwrap();
        view.store(&txn1, b"k1", b"v2".to_vec()).unwrap();
        db.commit(&txn1).unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        struct Rec(Arc<StdMutex<Vec<(Vec<u8>, ValueState, ValueState)>>>);
        impl TriggerObserver for Rec {
            fn store(&self, cursor: &mut dyn crate::trigger::Cursor, new_value: &ValueState) {
                self.0.lock().unwrap().push((cursor.key().to_vec(), cursor.value(), new_value.clone()));
            }
        }
        view.add_trigger(Arc::new(Rec(seen.clone())));

        let txn2 = db.begin();
        let prior = view.exchange(&txn2, b"k1", b"v1".to_vec()).unwrap();
        db.commit(&txn2).unwrap();

        assert_eq!(prior, Some(b"v2".to_vec()));
        let log = seen.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, b"k1");
    }
}
