//! Cross-module scenarios from §8: lock manager, trigger pipeline, and
//! fragmented-value trash working together through the `Database` facade,
//! the way a caller outside this crate would actually drive them.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tupl_core::{Cursor, Database, EngineConfig, LockError, LockMode, TriggerObserver, ValueState};

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<(Vec<u8>, ValueState, ValueState)>>,
}

impl TriggerObserver for Recorder {
    fn store(&self, cursor: &mut dyn Cursor, new_value: &ValueState) {
        // Explicitly `load()` the pre-mutation value rather than reading
        // `cursor.value()` straight off (which would still be `NotLoaded`
        // under the default non-autoload cursor) — scenario 2 depends on
        // seeing the real "old" value here.
        let old = cursor.load();
        self.events.lock().unwrap().push((cursor.key().to_vec(), old, new_value.clone()));
    }
}

struct Named {
    name: &'static str,
    order: Arc<Mutex<Vec<&'static str>>>,
}

impl TriggerObserver for Named {
    fn store(&self, _cursor: &mut dyn Cursor, _new_value: &ValueState) {
        self.order.lock().unwrap().push(self.name);
    }
}

#[test]
fn scenario_1_trigger_lifo_and_observation() {
    let db = Database::in_memory(EngineConfig::for_testing());
    let index = db.open_index(1);
    let view = index.view();

    let order = Arc::new(Mutex::new(Vec::new()));
    view.add_trigger(Arc::new(Named { name: "A", order: order.clone() }));
    view.add_trigger(Arc::new(Named { name: "B", order: order.clone() }));

    let txn = db.begin();
    view.store(&txn, b"k1", b"v1".to_vec()).unwrap();
    db.commit(&txn).unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["B", "A"]);
}

#[test]
fn scenario_2_auto_commit_vs_explicit_txn() {
    let db = Database::in_memory(EngineConfig::for_testing());
    let index = db.open_index(1);
    let view = index.view();

    let setup = db.begin();
    view.store(&setup, b"k1", b"v1".to_vec()).unwrap();
    view.store(&setup, b"k1", b"v2".to_vec()).unwrap();
    db.commit(&setup).unwrap();

    let recorder = Arc::new(Recorder::default());
    view.add_trigger(recorder.clone());

    let txn = db.begin();
    let prior = view.exchange(&txn, b"k1", b"v1".to_vec()).unwrap();
    db.commit(&txn).unwrap();

    assert_eq!(prior, Some(b"v2".to_vec()));
    let events = recorder.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, b"k1");
    assert_eq!(events[0].1, ValueState::Loaded(b"v2".to_vec()), "observer must see old=\"v2\"");
    assert_eq!(events[0].2, ValueState::Loaded(b"v1".to_vec()));
}

#[test]
fn scenario_3_bounded_view_fires_only_inside_range_and_tracks_first() {
    let db = Database::in_memory(EngineConfig::for_testing());
    let index = db.open_index(1);
    let bounded = index.view().ge(b"key-3".to_vec()).lt(b"key-8".to_vec());

    let recorder = Arc::new(Recorder::default());
    bounded.add_trigger(recorder.clone());

    assert_eq!(bounded.first(), None);

    let txn = db.begin();
    for i in 0..9u8 {
        let key = format!("key-{i}").into_bytes();
        bounded.store(&txn, &key, vec![i]).unwrap();
    }
    db.commit(&txn).unwrap();

    let events = recorder.events.lock().unwrap();
    assert_eq!(events.len(), 5, "expected fires only for key-3..key-7");
    assert_eq!(bounded.first(), Some(b"key-3".to_vec()));
}

#[test]
fn scenario_4_keys_view_never_reveals_bytes() {
    let db = Database::in_memory(EngineConfig::for_testing());
    let index = db.open_index(1);
    let keys_view = index.view().keys();

    let recorder = Arc::new(Recorder::default());
    keys_view.add_trigger(recorder.clone());

    let txn = db.begin();
    keys_view.store(&txn, b"secret", b"sensitive-bytes".to_vec()).unwrap();
    db.commit(&txn).unwrap();

    let events = recorder.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0].2, ValueState::NotLoaded));
}

#[test]
fn scenario_5_two_scopes_deadlock_symmetrically() {
    let db = Database::in_memory(EngineConfig::for_testing());
    let index = db.open_index(1);

    let txn_a = db.begin();
    let txn_b = db.begin();

    txn_a.lock_exclusive(index.id(), b"k1", None).unwrap();
    txn_b.lock_exclusive(index.id(), b"k2", None).unwrap();

    let scope_b = txn_b.scope().unwrap().clone();
    let handle = thread::spawn(move || {
        // B waits on k1, held by A.
        scope_b.lock(LockMode::Exclusive, 1, b"k1", Some(Duration::from_secs(1)))
    });

    thread::sleep(Duration::from_millis(50));
    // A waits on k2, held by B: a -> k2 -> b -> k1 -> a is a cycle. The
    // side whose timeout expires first runs the detector and reports the
    // deadlock without releasing anything; the other side then simply
    // times out (the cycle it would have walked is already gone, since
    // the first side is no longer waiting) and returns a plain
    // `LockTimeout`, not a second `Deadlock`. So exactly one of the two
    // results — not necessarily both — is `Err(LockError::Deadlock(_))`.
    let a_result = txn_a.lock_exclusive(index.id(), b"k2", Some(Duration::from_secs(1)));
    let b_result = handle.join().unwrap();

    let deadlock_sets: Vec<_> = [
        match &a_result {
            Err(LockError::Deadlock(set)) => Some(set.clone()),
            _ => None,
        },
        match &b_result {
            Err(LockError::Deadlock(set)) => Some(set.clone()),
            _ => None,
        },
    ]
    .into_iter()
    .flatten()
    .collect();

    assert_eq!(
        deadlock_sets.len(),
        1,
        "expected exactly one side to report Deadlock, got a={a_result:?} b={b_result:?}"
    );

    let set = &deadlock_sets[0];
    let has = |key: &[u8]| set.resources.iter().any(|(idx, k)| *idx == 1 && k.as_deref() == Some(key));
    assert!(has(b"k1") && has(b"k2"), "deadlock set should name both k1 and k2: {set:?}");

    txn_a.release_all_locks();
    txn_b.release_all_locks();
}

#[test]
fn scenario_6_trash_rollback_restores_large_value() {
    let db = Database::in_memory(EngineConfig::for_testing());
    let index = db.open_index(1);
    let view = index.view();

    let original = vec![b'x'; 9000];
    let setup = db.begin();
    view.store(&setup, b"big", original.clone()).unwrap();
    db.commit(&setup).unwrap();

    let txn = db.begin();
    view.store(&txn, b"big", vec![b'y'; 9000]).unwrap();
    assert!(txn.has_trash());
    db.rollback(&txn).unwrap();

    assert_eq!(view.get(b"big"), Some(original));
    assert_eq!(db.empty_all_trash(), 0);
}
