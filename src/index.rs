//! `Index` and `BoundView`: the mutation entry points that tie a
//! `ValueStore` to the trigger pipeline, the trash/undo protocol, and a
//! transaction's lock scope. See §2's control-flow summary.

use std::sync::Arc;

use crate::error::{LockError, Result};
use crate::store::{FragmentStore, ValueStore};
use crate::trash::{FragmentedTrash, UndoFragmentReclaimRecord};
use crate::trigger::cursor::ViewCursor;
use crate::trigger::view::{BaseView, BoundedView, KeysView, ReverseView, Transform, TransformedView, View};
use crate::trigger::{TriggerHandle, TriggerList, TriggerObserver};
use crate::txn::Transaction;
use crate::types::{is_fragmented, IndexId, Key, Value, ValueState};

/// One logical key space: the backing store plus the fragment side
/// store used for large values replaced under the trash protocol.
pub struct Index {
    id: IndexId,
    store: Arc<dyn ValueStore>,
    fragments: Arc<dyn FragmentStore>,
    /// Triggers registered directly on the index (as opposed to on a
    /// bounded/transformed view) — the same list `index.view()`'s
    /// unrestricted `BoundView` fires through, so `Index::add_trigger`
    /// and a trigger registered on `index.view()` are one and the same.
    base_triggers: Arc<TriggerList>,
}

impl Index {
    pub fn new(id: IndexId, store: Arc<dyn ValueStore>, fragments: Arc<dyn FragmentStore>) -> Arc<Self> {
        Arc::new(Self { id, store, fragments, base_triggers: Arc::new(TriggerList::new()) })
    }

    pub fn id(&self) -> IndexId {
        self.id
    }

    pub fn fragments(&self) -> &Arc<dyn FragmentStore> {
        &self.fragments
    }

    pub fn store(&self) -> &Arc<dyn ValueStore> {
        &self.store
    }

    /// The unrestricted view over the whole index — the starting point
    /// for every decorator chain (`index.view().ge(...).lt(...)`, etc).
    /// Shares `base_triggers` with `Index::add_trigger`/`remove_trigger`,
    /// so triggers registered either way fire on the same list.
    pub fn view(self: &Arc<Self>) -> BoundView {
        BoundView::with_triggers(
            self.clone(),
            Arc::new(BaseView { index_id: self.id }),
            self.base_triggers.clone(),
        )
    }

    pub fn add_trigger(&self, observer: Arc<dyn TriggerObserver>) -> TriggerHandle {
        self.base_triggers.add_trigger(observer)
    }

    pub fn remove_trigger(&self, handle: TriggerHandle) -> Result<()> {
        self.base_triggers.remove_trigger(handle)
    }

    pub fn get(&self, key: &[u8]) -> Option<Value> {
        self.store.get(self.id, key)
    }
}

/// A (possibly decorated) view over an index, with its own independent
/// trigger chain — registering an observer on a bounded or transformed
/// view only fires it for mutations that fall inside that view. The
/// unrestricted base view (`Index::view()`) is the one exception: it
/// shares its `TriggerList` with the owning `Index` (see `with_triggers`).
pub struct BoundView {
    index: Arc<Index>,
    view: Arc<dyn View>,
    triggers: Arc<TriggerList>,
}

impl BoundView {
    pub fn new(index: Arc<Index>, view: Arc<dyn View>) -> Self {
        Self { index, view, triggers: Arc::new(TriggerList::new()) }
    }

    /// Builds a view over an already-shared trigger list, used by
    /// `Index::view()` so its base view and `Index::add_trigger` route
    /// through the same list instead of each minting an independent one.
    fn with_triggers(index: Arc<Index>, view: Arc<dyn View>, triggers: Arc<TriggerList>) -> Self {
        Self { index, view, triggers }
    }

    pub fn index_id(&self) -> IndexId {
        self.index.id
    }

    pub fn ge(&self, lo: Key) -> BoundView {
        BoundView::new(self.index.clone(), Arc::new(BoundedView::ge(self.view.clone(), lo)))
    }

    pub fn lt(&self, hi: Key) -> BoundView {
        BoundView::new(self.index.clone(), Arc::new(BoundedView::lt(self.view.clone(), hi)))
    }

    pub fn prefix(&self, prefix: Key) -> BoundView {
        BoundView::new(self.index.clone(), Arc::new(BoundedView::prefix(self.view.clone(), prefix)))
    }

    pub fn keys(&self) -> BoundView {
        BoundView::new(self.index.clone(), Arc::new(KeysView { inner: self.view.clone() }))
    }

    pub fn reverse(&self) -> BoundView {
        BoundView::new(self.index.clone(), Arc::new(ReverseView { inner: self.view.clone() }))
    }

    pub fn transformed<T: Transform + 'static>(&self, transform: Arc<T>) -> BoundView {
        BoundView::new(
            self.index.clone(),
            Arc::new(TransformedView { inner: self.view.clone(), transform }),
        )
    }

    pub fn add_trigger(&self, observer: Arc<dyn TriggerObserver>) -> TriggerHandle {
        self.triggers.add_trigger(observer)
    }

    pub fn remove_trigger(&self, handle: TriggerHandle) -> Result<()> {
        self.triggers.remove_trigger(handle)
    }

    pub fn first(&self) -> Option<Key> {
        self.view.first(self.index.store.as_ref())
    }

    pub fn get(&self, key: &[u8]) -> Option<Value> {
        if !self.view.in_bounds(key) {
            return None;
        }
        self.index.store.get(self.index.id, key)
    }

    fn fire(&self, txn: &Transaction, real_key: &[u8], new_value: ValueState) {
        if !txn.fires_triggers() || self.triggers.is_empty() || !self.view.in_bounds(real_key) {
            return;
        }
        let mut cursor = ViewCursor::new(self.index.store.as_ref(), self.view.clone(), real_key.to_vec(), false);
        // Run the incoming value through the same visibility rules as a
        // read, so e.g. a `KeysView` hides the bytes of a fresh write just
        // as it hides bytes already on disk (§8 scenario 4).
        let visible_key = cursor.key().to_vec();
        let filtered = self.view.visible_value(new_value.as_loaded(), real_key, &visible_key);
        self.triggers.fire(&mut cursor, &filtered);
    }

    /// Copies a fragmented `existing` value into the trash index and
    /// appends the matching undo record, per §4.5 steps 1-3. A no-op for
    /// small values and for `BOGUS` transactions.
    fn maybe_trash(&self, txn: &Transaction, key: &[u8], existing: Option<&[u8]>) {
        let Some(existing) = existing else { return };
        if !is_fragmented(existing) {
            return;
        }
        if txn.is_bogus() {
            return;
        }
        let trash = FragmentedTrash::new(self.index.store.as_ref());
        let seq = trash.add(txn.id(), existing.to_vec());
        txn.push_undo(UndoFragmentReclaimRecord {
            index_id: self.index.id,
            original_key: key.to_vec(),
            seq,
        });
    }

    /// Inserts only if `key` is currently absent. A no-op (no trigger
    /// fire, no write) if it already exists.
    pub fn insert(&self, txn: &Transaction, key: &[u8], value: Value) -> Result<bool> {
        txn.lock_exclusive(self.index.id, key, None)?;
        if self.index.store.get(self.index.id, key).is_some() {
            return Ok(false);
        }
        self.fire(txn, key, ValueState::Loaded(value.clone()));
        self.index.store.put(self.index.id, key, value);
        Ok(true)
    }

    /// Replaces only if `key` is currently present. A no-op if absent.
    pub fn replace(&self, txn: &Transaction, key: &[u8], value: Value) -> Result<bool> {
        txn.lock_exclusive(self.index.id, key, None)?;
        let existing = self.index.store.get(self.index.id, key);
        if existing.is_none() {
            return Ok(false);
        }
        self.maybe_trash(txn, key, existing.as_deref());
        self.fire(txn, key, ValueState::Loaded(value.clone()));
        self.index.store.put(self.index.id, key, value);
        Ok(true)
    }

    /// Replaces only if the current value equals `old` exactly. A no-op
    /// otherwise (including when the key is absent and `old` is non-empty).
    pub fn update(&self, txn: &Transaction, key: &[u8], old: &[u8], new: Value) -> Result<bool> {
        txn.lock_exclusive(self.index.id, key, None)?;
        let current = self.index.store.get(self.index.id, key);
        if current.as_deref() != Some(old) {
            return Ok(false);
        }
        self.maybe_trash(txn, key, current.as_deref());
        self.fire(txn, key, ValueState::Loaded(new.clone()));
        self.index.store.put(self.index.id, key, new);
        Ok(true)
    }

    /// Deletes only if `key` is currently present. A no-op if absent.
    pub fn delete(&self, txn: &Transaction, key: &[u8]) -> Result<bool> {
        txn.lock_exclusive(self.index.id, key, None)?;
        let existing = self.index.store.get(self.index.id, key);
        if existing.is_none() {
            return Ok(false);
        }
        self.maybe_trash(txn, key, existing.as_deref());
        self.fire(txn, key, ValueState::Absent);
        self.index.store.remove(self.index.id, key);
        Ok(true)
    }

    /// Unconditional store: always fires (unlike `insert`/`replace`,
    /// `store` has no no-op carve-out).
    pub fn store(&self, txn: &Transaction, key: &[u8], value: Value) -> Result<()> {
        txn.lock_exclusive(self.index.id, key, None)?;
        let existing = self.index.store.get(self.index.id, key);
        self.maybe_trash(txn, key, existing.as_deref());
        self.fire(txn, key, ValueState::Loaded(value.clone()));
        self.index.store.put(self.index.id, key, value);
        Ok(())
    }

    /// Unconditional store that returns the prior value, per §8 scenario 2.
    pub fn exchange(&self, txn: &Transaction, key: &[u8], value: Value) -> Result<Option<Value>> {
        txn.lock_exclusive(self.index.id, key, None)?;
        let existing = self.index.store.get(self.index.id, key);
        self.maybe_trash(txn, key, existing.as_deref());
        self.fire(txn, key, ValueState::Loaded(value.clone()));
        self.index.store.put(self.index.id, key, value);
        Ok(existing)
    }

    /// Fires the trigger chain's `value_length`/`value_write`/`value_clear`
    /// variants rather than `store`, then performs whatever bytes those
    /// observers (by default, or by override) settled on. Per §4.4, a
    /// mutation that doesn't actually change the stored bytes (e.g. a
    /// `value_length` to the current length) is collapsed: no trigger
    /// fires and no write happens.
    fn mutate_value(
        &self,
        txn: &Transaction,
        key: &[u8],
        build: impl Fn(&[u8]) -> Value,
        fire_kind: impl FnOnce(&TriggerList, &mut dyn crate::trigger::Cursor),
    ) -> Result<()> {
        txn.lock_exclusive(self.index.id, key, None)?;
        let current = self.index.store.get(self.index.id, key).unwrap_or_default();
        let new_value = build(&current);
        if new_value == current {
            return Ok(());
        }
        self.maybe_trash(txn, key, Some(current.as_slice()));
        if txn.fires_triggers() && !self.triggers.is_empty() && self.view.in_bounds(key) {
            let mut cursor =
                ViewCursor::new(self.index.store.as_ref(), self.view.clone(), key.to_vec(), false);
            fire_kind(&self.triggers, &mut cursor);
        }
        self.index.store.put(self.index.id, key, new_value);
        Ok(())
    }

    /// Resizes the value at `key`, zero-extending on growth and
    /// truncating on shrink. A no-op length change (new length equals the
    /// current one) neither fires nor writes.
    pub fn value_length(&self, txn: &Transaction, key: &[u8], new_length: u64) -> Result<()> {
        if new_length > u32::MAX as u64 {
            return Err(LockError::LargeValue(new_length));
        }
        self.mutate_value(
            txn,
            key,
            |current| {
                let mut v = current.to_vec();
                v.resize(new_length as usize, 0);
                v
            },
            |triggers, cursor| triggers.fire_value_length(cursor, new_length),
        )
    }

    /// Overwrites `buf.len()` bytes starting at `pos`, zero-extending the
    /// value first if `pos + buf.len()` exceeds its current length.
    pub fn value_write(&self, txn: &Transaction, key: &[u8], pos: u64, buf: &[u8]) -> Result<()> {
        let pos_usize = pos as usize;
        let end = pos_usize + buf.len();
        self.mutate_value(
            txn,
            key,
            |current| {
                let mut v = current.to_vec();
                if v.len() < end {
                    v.resize(end, 0);
                }
                v[pos_usize..end].copy_from_slice(buf);
                v
            },
            |triggers, cursor| triggers.fire_value_write(cursor, pos, buf),
        )
    }

    /// Zeroes `len` bytes starting at `pos`, clipped to the value's
    /// current length (clearing past the end never grows it).
    pub fn value_clear(&self, txn: &Transaction, key: &[u8], pos: u64, len: u64) -> Result<()> {
        let pos_usize = pos as usize;
        self.mutate_value(
            txn,
            key,
            move |current| {
                let mut v = current.to_vec();
                if pos_usize < v.len() {
                    let end = (pos_usize + len as usize).min(v.len());
                    v[pos_usize..end].iter_mut().for_each(|b| *b = 0);
                }
                v
            },
            move |triggers, cursor| triggers.fire_value_clear(cursor, pos, len),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockManager;
    use crate::store::mem::{AtomicTxnIdSource, MemFragmentStore, MemStore};
    use crate::store::TxnIdSource;
    use std::sync::Mutex as StdMutex;

    fn new_txn(manager: &LockManager, ids: &AtomicTxnIdSource) -> Transaction {
        Transaction::new(ids.next_txn_id(), manager.new_scope())
    }

    #[test]
    fn index_add_trigger_fires_through_the_base_view() {
        let store: Arc<dyn ValueStore> = Arc::new(MemStore::new());
        let fragments: Arc<dyn FragmentStore> = Arc::new(MemFragmentStore::new());
        let index = Index::new(1, store, fragments);
        let manager = LockManager::new(4, false, None);
        let ids = AtomicTxnIdSource::new();

        let count = Arc::new(StdMutex::new(0usize));
        struct Counter(Arc<StdMutex<usize>>);
        impl TriggerObserver for Counter {
            fn store(&self, _cursor: &mut dyn crate::trigger::Cursor, _new_value: &ValueState) {
                *self.0.lock().unwrap() += 1;
            }
        }
        // Registered via `Index::add_trigger`, not `index.view().add_trigger`.
        let handle = index.add_trigger(Arc::new(Counter(count.clone())));

        let txn = new_txn(&manager, &ids);
        // A fresh `view()` call must still fire the same observer.
        index.view().store(&txn, b"k1", b"v1".to_vec()).unwrap();
        assert_eq!(*count.lock().unwrap(), 1, "Index::add_trigger's observer must fire through index.view()");

        index.remove_trigger(handle).unwrap();
        index.view().store(&txn, b"k2", b"v2".to_vec()).unwrap();
        assert_eq!(*count.lock().unwrap(), 1, "removed trigger must not fire again");
    }

    #[test]
    fn scenario_trigger_lifo_and_observation() {
        let store: Arc<dyn ValueStore> = Arc::new(MemStore::new());
        let fragments: Arc<dyn FragmentStore> = Arc::new(MemFragmentStore::new());
        let index = Index::new(1, store, fragments);
        let manager = LockManager::new(4, false, None);
        let ids = AtomicTxnIdSource::new();

        let order = Arc::new(StdMutex::new(Vec::new()));
        struct Rec(Arc<StdMutex<Vec<(&'static str, Vec<u8>, ValueState)>>>, &'static str);
        impl TriggerObserver for Rec {
            fn store(&self, cursor: &mut dyn crate::trigger::Cursor, new_value: &ValueState) {
                self.0.lock().unwrap().push((self.1, cursor.key().to_vec(), new_value.clone()));
            }
        }

        let view = index.view();
        view.add_trigger(Arc::new(Rec(order.clone(), "A")));
        view.add_trigger(Arc::new(Rec(order.clone(), "B")));

        let txn = new_txn(&manager, &ids);
        view.store(&txn, b"k1", b"v1".to_vec()).unwrap();

        let log = order.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].0, "B");
        assert_eq!(log[1].0, "A");
        assert_eq!(log[0].1, b"k1");
    }

    #[test]
    fn scenario_exchange_returns_prior_value() {
        let store: Arc<dyn ValueStore> = Arc::new(MemStore::new());
        let fragments: Arc<dyn FragmentStore> = Arc::new(MemFragmentStore::new());
        let index = Index::new(1, store, fragments);
        let manager = LockManager::new(4, false, None);
        let ids = AtomicTxnIdSource::new();
        let view = index.view();

        let txn = new_txn(&manager, &ids);
        view.store(&txn, b"k1", b"v1".to_vec()).unwrap();
        view.store(&txn, b"k1", b"v2".to_vec()).unwrap();

        let prior = view.exchange(&txn, b"k1", b"v1".to_vec()).unwrap();
        assert_eq!(prior, Some(b"v2".to_vec()));
    }

    #[test]
    fn scenario_bounded_view_fires_only_inside_range() {
        let store: Arc<dyn ValueStore> = Arc::new(MemStore::new());
        let fragments: Arc<dyn FragmentStore> = Arc::new(MemFragmentStore::new());
        let index = Index::new(1, store, fragments);
        let manager = LockManager::new(4, false, None);
        let ids = AtomicTxnIdSource::new();

        let bounded = index.view().ge(b"key-3".to_vec()).lt(b"key-8".to_vec());
        let count = Arc::new(StdMutex::new(0usize));
        struct Counter(Arc<StdMutex<usize>>);
        impl TriggerObserver for Counter {
            fn store(&self, _cursor: &mut dyn crate::trigger::Cursor, _new_value: &ValueState) {
                *self.0.lock().unwrap() += 1;
            }
        }
        bounded.add_trigger(Arc::new(Counter(count.clone())));

        let txn = new_txn(&manager, &ids);
        assert_eq!(bounded.first(), None);
        for i in 0..9 {
            let key = format!("key-{i}");
            bounded.store(&txn, key.as_bytes(), b"v".to_vec()).unwrap();
        }
        assert_eq!(bounded.first(), Some(b"key-3".to_vec()));
        assert_eq!(*count.lock().unwrap(), 5);
    }

    #[test]
    fn scenario_keys_view_never_reveals_bytes() {
        let store: Arc<dyn ValueStore> = Arc::new(MemStore::new());
        let fragments: Arc<dyn FragmentStore> = Arc::new(MemFragmentStore::new());
        let index = Index::new(1, store, fragments);
        let manager = LockManager::new(4, false, None);
        let ids = AtomicTxnIdSource::new();

        let keys_view = index.view().keys();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        struct Observer(Arc<StdMutex<Vec<ValueState>>>);
        impl TriggerObserver for Observer {
            fn store(&self, cursor: &mut dyn crate::trigger::Cursor, new_value: &ValueState) {
                self.0.lock().unwrap().push(new_value.clone());
                self.0.lock().unwrap().push(cursor.load());
            }
        }
        keys_view.add_trigger(Arc::new(Observer(seen.clone())));

        let txn = new_txn(&manager, &ids);
        keys_view.store(&txn, b"secret-key", b"secret-value".to_vec()).unwrap();

        for state in seen.lock().unwrap().iter() {
            assert!(!matches!(state, ValueState::Loaded(_)));
        }
    }

    #[test]
    fn bogus_transaction_fires_no_triggers_and_takes_no_locks() {
        let store: Arc<dyn ValueStore> = Arc::new(MemStore::new());
        let fragments: Arc<dyn FragmentStore> = Arc::new(MemFragmentStore::new());
        let index = Index::new(1, store, fragments);
        let view = index.view();
        let count = Arc::new(StdMutex::new(0usize));
        struct Counter(Arc<StdMutex<usize>>);
        impl TriggerObserver for Counter {
            fn store(&self, _cursor: &mut dyn crate::trigger::Cursor, _new_value: &ValueState) {
                *self.0.lock().unwrap() += 1;
            }
        }
        view.add_trigger(Arc::new(Counter(count.clone())));

        let bogus = Transaction::bogus();
        view.store(&bogus, b"k", b"v".to_vec()).unwrap();
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[test]
    fn value_write_extends_and_overwrites_in_place() {
        let store: Arc<dyn ValueStore> = Arc::new(MemStore::new());
        let fragments: Arc<dyn FragmentStore> = Arc::new(MemFragmentStore::new());
        let index = Index::new(1, store, fragments);
        let manager = LockManager::new(4, false, None);
        let ids = AtomicTxnIdSource::new();
        let view = index.view();

        let txn = new_txn(&manager, &ids);
        view.store(&txn, b"k", b"hello".to_vec()).unwrap();
        view.value_write(&txn, b"k", 2, b"XY").unwrap();
        assert_eq!(view.get(b"k"), Some(b"heXYo".to_vec()));

        view.value_write(&txn, b"k", 5, b"!!").unwrap();
        assert_eq!(view.get(b"k"), Some(b"heXYo!!".to_vec()));
    }

    #[test]
    fn value_length_grows_with_zero_padding_and_truncates() {
        let store: Arc<dyn ValueStore> = Arc::new(MemStore::new());
        let fragments: Arc<dyn FragmentStore> = Arc::new(MemFragmentStore::new());
        let index = Index::new(1, store, fragments);
        let manager = LockManager::new(4, false, None);
        let ids = AtomicTxnIdSource::new();
        let view = index.view();

        let txn = new_txn(&manager, &ids);
        view.store(&txn, b"k", b"abc".to_vec()).unwrap();
        view.value_length(&txn, b"k", 5).unwrap();
        assert_eq!(view.get(b"k"), Some(vec![b'a', b'b', b'c', 0, 0]));

        view.value_length(&txn, b"k", 2).unwrap();
        assert_eq!(view.get(b"k"), Some(vec![b'a', b'b']));
    }

    #[test]
    fn value_length_no_op_when_unchanged_fires_nothing() {
        let store: Arc<dyn ValueStore> = Arc::new(MemStore::new());
        let fragments: Arc<dyn FragmentStore> = Arc::new(MemFragmentStore::new());
        let index = Index::new(1, store, fragments);
        let manager = LockManager::new(4, false, None);
        let ids = AtomicTxnIdSource::new();
        let view = index.view();

        let count = Arc::new(StdMutex::new(0usize));
        struct Counter(Arc<StdMutex<usize>>);
        impl TriggerObserver for Counter {
            fn store(&self, _cursor: &mut dyn crate::trigger::Cursor, _new_value: &ValueState) {
                *self.0.lock().unwrap() += 1;
            }
        }
        view.add_trigger(Arc::new(Counter(count.clone())));

        let txn = new_txn(&manager, &ids);
        view.store(&txn, b"k", b"abc".to_vec()).unwrap();
        assert_eq!(*count.lock().unwrap(), 1);

        view.value_length(&txn, b"k", 3).unwrap();
        assert_eq!(*count.lock().unwrap(), 1, "no-op length change must not fire");
    }

    #[test]
    fn value_clear_zeroes_a_range_clipped_to_length() {
        let store: Arc<dyn ValueStore> = Arc::new(MemStore::new());
        let fragments: Arc<dyn FragmentStore> = Arc::new(MemFragmentStore::new());
        let index = Index::new(1, store, fragments);
        let manager = LockManager::new(4, false, None);
        let ids = AtomicTxnIdSource::new();
        let view = index.view();

        let txn = new_txn(&manager, &ids);
        view.store(&txn, b"k", b"abcdef".to_vec()).unwrap();
        view.value_clear(&txn, b"k", 2, 100).unwrap();
        assert_eq!(view.get(b"k"), Some(b"ab\0\0\0\0".to_vec()));
    }

    #[test]
    fn value_length_rejects_absurdly_large_request() {
        let store: Arc<dyn ValueStore> = Arc::new(MemStore::new());
        let fragments: Arc<dyn FragmentStore> = Arc::new(MemFragmentStore::new());
        let index = Index::new(1, store, fragments);
        let manager = LockManager::new(4, false, None);
        let ids = AtomicTxnIdSource::new();
        let view = index.view();

        let txn = new_txn(&manager, &ids);
        let err = view.value_length(&txn, b"k", u32::MAX as u64 + 1).unwrap_err();
        assert!(matches!(err, LockError::LargeValue(_)));
    }
}
