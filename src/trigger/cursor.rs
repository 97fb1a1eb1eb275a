//! The cursor trigger observers see: a key, a possibly-lazy value, and a
//! `first()` probe, all filtered through a `View`.

use std::sync::Arc;

use crate::store::ValueStore;
use crate::trigger::view::View;
use crate::types::{IndexId, Key, ValueState};

/// What observers are handed. Positioned at one key; `value()` may return
/// `NotLoaded` until `load()` is called, per the autoload contract in
/// §4.4. Observers see only this trait, never the concrete cursor type,
/// so a view decorator can swap in cheaper or more restrictive behavior
/// (e.g. `KeysView` never actually touches the underlying bytes).
pub trait Cursor {
    fn key(&self) -> &[u8];
    fn value(&self) -> ValueState;
    fn load(&mut self) -> ValueState;
    fn first(&mut self) -> Option<Key>;
}

/// The concrete cursor backing the default (non-overridden) view
/// pipeline: reads through a `View` over a `ValueStore`, with autoload
/// controlling whether `value()` eagerly resolves bytes or reports
/// `NotLoaded` until `load()` is called explicitly.
pub struct ViewCursor<'s> {
    store: &'s dyn ValueStore,
    view: Arc<dyn View>,
    real_key: Key,
    visible_key: Key,
    autoload: bool,
    loaded: Option<ValueState>,
}

impl<'s> ViewCursor<'s> {
    /// Positions a cursor at `real_key`, which must already satisfy the
    /// view's bounds (callers check `in_bounds` before constructing one).
    pub fn new(store: &'s dyn ValueStore, view: Arc<dyn View>, real_key: Key, autoload: bool) -> Self {
        let visible_key = view
            .visible_key(&real_key)
            .map(|c| c.into_owned())
            .unwrap_or_else(|| real_key.clone());
        let mut cursor = Self { store, view, real_key, visible_key, autoload, loaded: None };
        if autoload {
            let _ = cursor.load();
        }
        cursor
    }

    pub fn index_id(&self) -> IndexId {
        self.view.index_id()
    }

    pub fn real_key(&self) -> &[u8] {
        &self.real_key
    }
}

impl<'s> Cursor for ViewCursor<'s> {
    fn key(&self) -> &[u8] {
        &self.visible_key
    }

    fn value(&self) -> ValueState {
        self.loaded.clone().unwrap_or(ValueState::NotLoaded)
    }

    fn load(&mut self) -> ValueState {
        let raw = self.store.get(self.view.index_id(), &self.real_key);
        let state = self.view.visible_value(raw.as_deref(), &self.real_key, &self.visible_key);
        self.loaded = Some(state.clone());
        state
    }

    fn first(&mut self) -> Option<Key> {
        self.view.first(self.store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mem::MemStore;
    use crate::trigger::view::BaseView;

    #[test]
    fn autoload_resolves_immediately() {
        let store = MemStore::new();
        store.put(1, b"k", b"v".to_vec());
        let view = Arc::new(BaseView { index_id: 1 });
        let cursor = ViewCursor::new(&store, view, b"k".to_vec(), true);
        assert!(matches!(cursor.value(), ValueState::Loaded(ref v) if v == b"v"));
    }

    #[test]
    fn without_autoload_value_is_not_loaded_until_requested() {
        let store = MemStore::new();
        store.put(1, b"k", b"v".to_vec());
        let view = Arc::new(BaseView { index_id: 1 });
        let mut cursor = ViewCursor::new(&store, view, b"k".to_vec(), false);
        assert!(cursor.value().is_not_loaded());
        let loaded = cursor.load();
        assert!(matches!(loaded, ValueState::Loaded(ref v) if v == b"v"));
    }
}
