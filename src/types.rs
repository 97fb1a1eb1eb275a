//! Core identifiers and the lazy-load value sentinel.

use std::fmt;

/// A 64-bit identifier naming a logical key space (an index, or a
/// "temporary index" created for a sort or a trash side-store).
pub type IndexId = u64;

/// Keys are opaque byte sequences, compared in unsigned-lexicographic
/// order. The core never interprets their contents.
pub type Key = Vec<u8>;

/// A stored value. Also opaque to the core.
pub type Value = Vec<u8>;

/// The result of reading a value through a cursor whose autoload policy
/// may have deferred the actual fetch.
///
/// `NotLoaded` is a distinguished sentinel, not `None`: a key-only view
/// reports `NotLoaded` for every live row, while a plain deleted row
/// reports `Absent`. Callers must not conflate the two.
#[derive(Clone, PartialEq, Eq)]
pub enum ValueState {
    Loaded(Value),
    NotLoaded,
    Absent,
}

impl ValueState {
    pub fn is_absent(&self) -> bool {
        matches!(self, ValueState::Absent)
    }

    pub fn is_not_loaded(&self) -> bool {
        matches!(self, ValueState::NotLoaded)
    }

    pub fn as_loaded(&self) -> Option<&[u8]> {
        match self {
            ValueState::Loaded(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn into_loaded(self) -> Option<Value> {
        match self {
            ValueState::Loaded(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Debug for ValueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueState::Loaded(v) => write!(f, "Loaded({} bytes)", v.len()),
            ValueState::NotLoaded => write!(f, "NotLoaded"),
            ValueState::Absent => write!(f, "Absent"),
        }
    }
}

/// Unsigned-lexicographic comparison, spelled out because the core must
/// never rely on `Vec<u8>`'s `Ord` impl changing out from under it — this
/// is a load-bearing invariant, not an incidental choice.
pub fn key_cmp(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// A threshold above which a value is considered "fragmented" (too large
/// to store inline) and must go through the trash/undo protocol when
/// transactionally replaced. The real engine derives this from page size;
/// here it is a simple constant since page layout is out of scope.
pub const FRAGMENT_THRESHOLD: usize = 4096;

pub fn is_fragmented(value: &[u8]) -> bool {
    value.len() > FRAGMENT_THRESHOLD
}
