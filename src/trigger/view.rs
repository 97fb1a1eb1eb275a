//! View decorators: bounded/reverse/prefix/key-only/transformed
//! re-presentations of an index to the trigger pipeline, per §4.4.

use std::borrow::Cow;
use std::sync::Arc;

use crate::store::ValueStore;
use crate::types::{IndexId, Key, ValueState};

/// A view decides, for a raw `(key, value)` pair coming out of the
/// underlying index, whether the trigger pipeline sees it at all, what
/// key it sees, and what value. Views compose by wrapping one another.
pub trait View: Send + Sync {
    fn index_id(&self) -> IndexId;

    /// Whether `key` (the real, untransformed index key) falls inside
    /// this view.
    fn in_bounds(&self, key: &[u8]) -> bool {
        let _ = key;
        true
    }

    /// The key as the trigger pipeline sees it. `None` suppresses the row
    /// entirely (the trigger does not fire for it).
    fn visible_key<'a>(&self, key: &'a [u8]) -> Option<Cow<'a, [u8]>> {
        if self.in_bounds(key) {
            Some(Cow::Borrowed(key))
        } else {
            None
        }
    }

    /// The value as the trigger pipeline sees it, given the raw stored
    /// bytes (`None` = absent), the real key, and the visible key.
    fn visible_value(&self, raw: Option<&[u8]>, _real_key: &[u8], _visible_key: &[u8]) -> ValueState {
        match raw {
            Some(v) => ValueState::Loaded(v.to_vec()),
            None => ValueState::Absent,
        }
    }

    /// The first key in view order currently stored in the backing
    /// index, or `None` if the view is empty. Scenario 3 in §8 exercises
    /// this directly: before any row in `["key-3", "key-8")` is stored it
    /// is `None`; once `"key-3"` is stored it becomes `Some("key-3")`.
    fn first(&self, store: &dyn ValueStore) -> Option<Key>;

    fn reversed(&self) -> bool {
        false
    }
}

/// The whole index, untransformed, in forward key order.
pub struct BaseView {
    pub index_id: IndexId,
}

impl View for BaseView {
    fn index_id(&self) -> IndexId {
        self.index_id
    }

    fn first(&self, store: &dyn ValueStore) -> Option<Key> {
        store.range(self.index_id, &[], None).into_iter().next().map(|(k, _)| k)
    }
}

/// Wraps an inner view so iteration-order-sensitive consumers see the
/// predecessor direction instead of the successor direction. Bounds and
/// value visibility pass through unchanged; only `reversed()`/`first()`
/// differ.
pub struct ReverseView {
    pub inner: Arc<dyn View>,
}

impl View for ReverseView {
    fn index_id(&self) -> IndexId {
        self.inner.index_id()
    }

    fn in_bounds(&self, key: &[u8]) -> bool {
        self.inner.in_bounds(key)
    }

    fn visible_key<'a>(&self, key: &'a [u8]) -> Option<Cow<'a, [u8]>> {
        self.inner.visible_key(key)
    }

    fn visible_value(&self, raw: Option<&[u8]>, real_key: &[u8], visible_key: &[u8]) -> ValueState {
        self.inner.visible_value(raw, real_key, visible_key)
    }

    fn first(&self, store: &dyn ValueStore) -> Option<Key> {
        // The "first" entry in reverse order is the largest key the inner
        // view considers in-bounds.
        let all = store.range(self.inner.index_id(), &[], None);
        all.into_iter().rev().map(|(k, _)| k).find(|k| self.inner.in_bounds(k))
    }

    fn reversed(&self) -> bool {
        !self.inner.reversed()
    }
}

/// `viewGe(lo)` / `viewLt(hi)` / `viewPrefix(p, trim)`, combined into one
/// decorator since they only ever narrow a half-open key range and
/// optionally trim a visible prefix.
pub struct BoundedView {
    pub inner: Arc<dyn View>,
    pub lo: Option<Key>,
    pub hi: Option<Key>,
    pub trim: usize,
}

impl BoundedView {
    pub fn ge(inner: Arc<dyn View>, lo: Key) -> Self {
        Self { inner, lo: Some(lo), hi: None, trim: 0 }
    }

    pub fn lt(inner: Arc<dyn View>, hi: Key) -> Self {
        Self { inner, lo: None, hi: Some(hi), trim: 0 }
    }

    pub fn prefix(inner: Arc<dyn View>, prefix: Key) -> Self {
        let hi = increment_prefix(&prefix);
        let trim = prefix.len();
        Self { inner, lo: Some(prefix), hi, trim }
    }

    fn within_bounds(&self, key: &[u8]) -> bool {
        if let Some(lo) = &self.lo {
            if key < lo.as_slice() {
                return false;
            }
        }
        if let Some(hi) = &self.hi {
            if key >= hi.as_slice() {
                return false;
            }
        }
        true
    }
}

/// Smallest key strictly greater than every key with `prefix` as a
/// prefix, or `None` if `prefix` is all `0xff` bytes (unbounded above).
fn increment_prefix(prefix: &[u8]) -> Option<Key> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.pop() {
        if last != 0xff {
            out.push(last + 1);
            return Some(out);
        }
    }
    None
}

impl View for BoundedView {
    fn index_id(&self) -> IndexId {
        self.inner.index_id()
    }

    fn in_bounds(&self, key: &[u8]) -> bool {
        self.inner.in_bounds(key) && self.within_bounds(key)
    }

    fn visible_key<'a>(&self, key: &'a [u8]) -> Option<Cow<'a, [u8]>> {
        if !self.in_bounds(key) {
            return None;
        }
        match self.inner.visible_key(key)? {
            Cow::Borrowed(k) => Some(Cow::Borrowed(&k[self.trim.min(k.len())..])),
            Cow::Owned(k) => Some(Cow::Owned(k[self.trim.min(k.len())..].to_vec())),
        }
    }

    fn visible_value(&self, raw: Option<&[u8]>, real_key: &[u8], visible_key: &[u8]) -> ValueState {
        self.inner.visible_value(raw, real_key, visible_key)
    }

    fn first(&self, store: &dyn ValueStore) -> Option<Key> {
        let lo = self.lo.clone().unwrap_or_default();
        let hi = self.hi.clone();
        store
            .range(self.index_id(), &lo, hi.as_deref())
            .into_iter()
            .map(|(k, _)| k)
            .find(|k| self.inner.in_bounds(k))
    }

    fn reversed(&self) -> bool {
        self.inner.reversed()
    }
}

/// `viewKeys()`: the value is always `Absent` or `NotLoaded`, never the
/// concrete bytes, regardless of what is actually stored.
pub struct KeysView {
    pub inner: Arc<dyn View>,
}

impl View for KeysView {
    fn index_id(&self) -> IndexId {
        self.inner.index_id()
    }

    fn in_bounds(&self, key: &[u8]) -> bool {
        self.inner.in_bounds(key)
    }

    fn visible_key<'a>(&self, key: &'a [u8]) -> Option<Cow<'a, [u8]>> {
        self.inner.visible_key(key)
    }

    fn visible_value(&self, raw: Option<&[u8]>, _real_key: &[u8], _visible_key: &[u8]) -> ValueState {
        match raw {
            Some(_) => ValueState::NotLoaded,
            None => ValueState::Absent,
        }
    }

    fn first(&self, store: &dyn ValueStore) -> Option<Key> {
        self.inner.first(store)
    }

    fn reversed(&self) -> bool {
        self.inner.reversed()
    }
}

/// A user-supplied key/value remapper for `viewTransformed`. `transform_key`
/// may suppress a row by returning `None`; `transform_value` rewrites the
/// bytes the trigger pipeline sees. Both must be pure functions of their
/// inputs — see the open question in §9 about re-running `transform_value`
/// on a later `load()`.
pub trait Transform: Send + Sync {
    fn transform_key<'a>(&self, key: &'a [u8]) -> Option<Cow<'a, [u8]>>;
    fn transform_value(&self, value: &[u8], real_key: &[u8], transformed_key: &[u8]) -> Vec<u8>;
}

pub struct TransformedView<T: Transform> {
    pub inner: Arc<dyn View>,
    pub transform: Arc<T>,
}

impl<T: Transform> View for TransformedView<T> {
    fn index_id(&self) -> IndexId {
        self.inner.index_id()
    }

    fn in_bounds(&self, key: &[u8]) -> bool {
        self.inner.in_bounds(key) && self.transform.transform_key(key).is_some()
    }

    fn visible_key<'a>(&self, key: &'a [u8]) -> Option<Cow<'a, [u8]>> {
        if !self.inner.in_bounds(key) {
            return None;
        }
        self.transform.transform_key(key)
    }

    fn visible_value(&self, raw: Option<&[u8]>, real_key: &[u8], visible_key: &[u8]) -> ValueState {
        match raw {
            Some(v) => ValueState::Loaded(self.transform.transform_value(v, real_key, visible_key)),
            None => ValueState::Absent,
        }
    }

    fn first(&self, store: &dyn ValueStore) -> Option<Key> {
        self.inner
            .first(store)
            .and_then(|k| self.transform.transform_key(&k).map(|ck| ck.into_owned()))
    }

    fn reversed(&self) -> bool {
        self.inner.reversed()
    }
}
