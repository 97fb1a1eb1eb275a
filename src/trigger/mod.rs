//! Pre-mutation observer pipeline: a per-index LIFO chain of `TriggerObserver`s
//! invoked through a `Cursor`, per §4.4.

pub mod cursor;
pub mod view;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{LockError, Result};
pub use cursor::Cursor;
pub use view::{BoundedView, KeysView, ReverseView, TransformedView, Transform, View};

/// Identity token returned by `add_trigger`, used only for exact-match
/// removal. Never reused within a process, so a stale handle from a
/// removed trigger cannot accidentally match a later one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TriggerHandle(u64);

/// A pre-mutation observer. Observers see the cursor positioned at the
/// mutated key, the incoming new value, and may read the pre-mutation
/// value off the cursor (lazily, if the cursor's view allows it).
/// Observers must not reposition the cursor or mutate the new-value bytes
/// in place — both are passed by shared reference for exactly that reason.
///
/// `value_length`/`value_write`/`value_clear` model the large-value
/// methods of §4.4/§6: their defaults load the current value, build the
/// post-mutation bytes, and dispatch through `store` exactly as a plain
/// `store` call would. An observer that wants to avoid the load (a
/// key-only view's trigger, say) overrides one directly instead of
/// inheriting the default.
pub trait TriggerObserver: Send + Sync {
    fn store(&self, cursor: &mut dyn Cursor, new_value: &crate::types::ValueState);

    fn value_length(&self, cursor: &mut dyn Cursor, new_length: u64) {
        let mut bytes = cursor.load().as_loaded().map(<[u8]>::to_vec).unwrap_or_default();
        bytes.resize(new_length as usize, 0);
        self.store(cursor, &crate::types::ValueState::Loaded(bytes));
    }

    fn value_write(&self, cursor: &mut dyn Cursor, pos: u64, buf: &[u8]) {
        let mut bytes = cursor.load().as_loaded().map(<[u8]>::to_vec).unwrap_or_default();
        let end = pos as usize + buf.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[pos as usize..end].copy_from_slice(buf);
        self.store(cursor, &crate::types::ValueState::Loaded(bytes));
    }

    fn value_clear(&self, cursor: &mut dyn Cursor, pos: u64, len: u64) {
        let mut bytes = cursor.load().as_loaded().map(<[u8]>::to_vec).unwrap_or_default();
        let pos = pos as usize;
        if pos < bytes.len() {
            let end = (pos + len as usize).min(bytes.len());
            bytes[pos..end].iter_mut().for_each(|b| *b = 0);
        }
        self.store(cursor, &crate::types::ValueState::Loaded(bytes));
    }
}

struct Entry {
    handle: TriggerHandle,
    observer: Arc<dyn TriggerObserver>,
}

/// Per-index (or per-view) chain of observers, fired LIFO: the
/// most-recently-registered observer sees the mutation first.
pub struct TriggerList {
    entries: Mutex<Vec<Entry>>,
    next_handle: AtomicU64,
}

impl Default for TriggerList {
    fn default() -> Self {
        Self { entries: Mutex::new(Vec::new()), next_handle: AtomicU64::new(1) }
    }
}

impl TriggerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_trigger(&self, observer: Arc<dyn TriggerObserver>) -> TriggerHandle {
        let handle = TriggerHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.entries.lock().push(Entry { handle, observer });
        handle
    }

    pub fn remove_trigger(&self, handle: TriggerHandle) -> Result<()> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.handle != handle);
        if entries.len() == before {
            return Err(LockError::illegal_state(format!(
                "remove_trigger: no such handle {:?}",
                handle
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Fires every registered observer, most-recently-added first, each
    /// seeing the same `new_value`.
    pub fn fire(&self, cursor: &mut dyn Cursor, new_value: &crate::types::ValueState) {
        for observer in self.snapshot() {
            observer.store(cursor, new_value);
        }
    }

    /// LIFO dispatch of the large-value variants, per §6's
    /// `TriggerObserver` contract.
    pub fn fire_value_length(&self, cursor: &mut dyn Cursor, new_length: u64) {
        for observer in self.snapshot() {
            observer.value_length(cursor, new_length);
        }
    }

    pub fn fire_value_write(&self, cursor: &mut dyn Cursor, pos: u64, buf: &[u8]) {
        for observer in self.snapshot() {
            observer.value_write(cursor, pos, buf);
        }
    }

    pub fn fire_value_clear(&self, cursor: &mut dyn Cursor, pos: u64, len: u64) {
        for observer in self.snapshot() {
            observer.value_clear(cursor, pos, len);
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn TriggerObserver>> {
        self.entries.lock().iter().rev().map(|e| e.observer.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueState;

    struct Counting {
        order: Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    }

    impl TriggerObserver for Counting {
        fn store(&self, _cursor: &mut dyn Cursor, _new_value: &ValueState) {
            self.order.lock().push(self.name);
        }
    }

    struct NullCursor;
    impl Cursor for NullCursor {
        fn key(&self) -> &[u8] {
            b""
        }
        fn value(&self) -> ValueState {
            ValueState::NotLoaded
        }
        fn load(&mut self) -> ValueState {
            ValueState::NotLoaded
        }
        fn first(&mut self) -> Option<Vec<u8>> {
            None
        }
    }

    #[test]
    fn fires_lifo_last_registered_first() {
        let list = TriggerList::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::new(Counting { order: order.clone(), name: "A" });
        let b = Arc::new(Counting { order: order.clone(), name: "B" });
        list.add_trigger(a);
        list.add_trigger(b);

        let mut cursor = NullCursor;
        list.fire(&mut cursor, &ValueState::Loaded(b"v1".to_vec()));

        assert_eq!(*order.lock(), vec!["B", "A"]);
    }

    #[test]
    fn remove_trigger_rejects_unknown_handle() {
        let list = TriggerList::new();
        let bogus = TriggerHandle(999);
        assert!(list.remove_trigger(bogus).is_err());
    }
}
