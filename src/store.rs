//! External collaborators the core consumes but does not implement.
//!
//! Per the scope boundary (see crate docs), the page allocator, B-tree node
//! layout, and redo/undo log writer live outside this crate. What the core
//! actually touches is three narrow interfaces: a mutable `(IndexId, Key)
//! -> Value` store with cursor-style positioning, a byte-addressable
//! fragment store for large values, and a monotonic transaction id source.
//!
//! `mem` provides a minimal in-memory implementation of all three, good
//! enough to drive this crate's own test suite. A real deployment backs
//! these traits with the B-tree/page-file engine instead.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::{IndexId, Key, Value};

/// An abstract mutable key/value store over one or more logical indexes,
/// with cursor-style range iteration. This is the `(index-id, key) ->
/// bytes` collaborator named in the scope section.
pub trait ValueStore: Send + Sync {
    fn get(&self, index: IndexId, key: &[u8]) -> Option<Value>;

    /// Unconditional write; creates or overwrites.
    fn put(&self, index: IndexId, key: &[u8], value: Value);

    /// Removes the entry if present. Returns whether anything was removed.
    fn remove(&self, index: IndexId, key: &[u8]) -> bool;

    /// Smallest key `>= from` in the index, if any. Used by the trash
    /// allocator to find the most recent `seq` for a transaction (trash
    /// keys sort newest-first, so the smallest key `>=` a txn's prefix is
    /// its most recent entry, if any).
    fn ceiling_key(&self, index: IndexId, from: &[u8]) -> Option<Key>;

    /// All (key, value) pairs in `[lo, hi)` order, ascending. `hi = None`
    /// means unbounded above. Used for recovery scans (`empty_all_trash`)
    /// and view decorators in tests.
    fn range(&self, index: IndexId, lo: &[u8], hi: Option<&[u8]>) -> Vec<(Key, Value)>;
}

/// The byte-addressable side store for fragmented (large) values, named in
/// §4.6. In a full engine this allocates and frees page runs; here it is
/// content-addressed by the caller's choice of key, matching how the trash
/// index itself stores fragment bytes under a `trash_key`.
pub trait FragmentStore: Send + Sync {
    fn insert_fragmented(&self, key: &[u8], bytes: Value);
    fn delete_fragments(&self, key: &[u8]);
    fn read_fragmented(&self, key: &[u8]) -> Option<Value>;
}

/// A monotonically increasing transaction id service. Recovery is
/// expected to seed this from the highest durably-logged id; here we only
/// model the increment side, since redo-log replay is out of core scope.
pub trait TxnIdSource: Send + Sync {
    fn next_txn_id(&self) -> u64;
    fn top_txn_id(&self) -> u64;
}

/// Reference in-memory implementation of all three collaborator traits,
/// built on a sharded `BTreeMap` protected by a single lock — sufficient
/// for tests and small embedded deployments, not for production durability.
pub mod mem {
    use super::*;
    use parking_lot::RwLock;
    use std::collections::BTreeMap;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct MemStore {
        indexes: RwLock<HashMap<IndexId, BTreeMap<Key, Value>>>,
    }

    impl MemStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl ValueStore for MemStore {
        fn get(&self, index: IndexId, key: &[u8]) -> Option<Value> {
            self.indexes.read().get(&index).and_then(|m| m.get(key).cloned())
        }

        fn put(&self, index: IndexId, key: &[u8], value: Value) {
            self.indexes
                .write()
                .entry(index)
                .or_default()
                .insert(key.to_vec(), value);
        }

        fn remove(&self, index: IndexId, key: &[u8]) -> bool {
            self.indexes
                .write()
                .get_mut(&index)
                .map(|m| m.remove(key).is_some())
                .unwrap_or(false)
        }

        fn ceiling_key(&self, index: IndexId, from: &[u8]) -> Option<Key> {
            self.indexes
                .read()
                .get(&index)
                .and_then(|m| m.range(from.to_vec()..).next().map(|(k, _)| k.clone()))
        }

        fn range(&self, index: IndexId, lo: &[u8], hi: Option<&[u8]>) -> Vec<(Key, Value)> {
            let guard = self.indexes.read();
            let Some(m) = guard.get(&index) else { return Vec::new() };
            match hi {
                Some(hi) => m
                    .range(lo.to_vec()..hi.to_vec())
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                None => m
                    .range(lo.to_vec()..)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            }
        }
    }

    /// Content-addressed fragment store backed by the same kind of map;
    /// fragments live under a single synthetic index id distinct from any
    /// caller-visible index.
    pub struct MemFragmentStore {
        fragments: RwLock<HashMap<Key, Value>>,
    }

    impl Default for MemFragmentStore {
        fn default() -> Self {
            Self {
                fragments: RwLock::new(HashMap::new()),
            }
        }
    }

    impl MemFragmentStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl FragmentStore for MemFragmentStore {
        fn insert_fragmented(&self, key: &[u8], bytes: Value) {
            self.fragments.write().insert(key.to_vec(), bytes);
        }

        fn delete_fragments(&self, key: &[u8]) {
            self.fragments.write().remove(key);
        }

        fn read_fragmented(&self, key: &[u8]) -> Option<Value> {
            self.fragments.read().get(key).cloned()
        }
    }

    pub struct AtomicTxnIdSource {
        next: AtomicU64,
    }

    impl Default for AtomicTxnIdSource {
        fn default() -> Self {
            // id 0 is reserved for the BOGUS transaction.
            Self { next: AtomicU64::new(1) }
        }
    }

    impl AtomicTxnIdSource {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed(starting_at: u64) -> Self {
            Self { next: AtomicU64::new(starting_at) }
        }
    }

    impl TxnIdSource for AtomicTxnIdSource {
        fn next_txn_id(&self) -> u64 {
            self.next.fetch_add(1, Ordering::SeqCst)
        }

        fn top_txn_id(&self) -> u64 {
            self.next.load(Ordering::SeqCst).saturating_sub(1)
        }
    }
}
