//! `tupl-core` — the transactional concurrency substrate of an embedded
//! key/value storage engine: a sharded lock manager with deadlock
//! detection, a per-view trigger/observer pipeline, and the
//! fragmented-value trash/undo coupling that keeps large-value rollback
//! safe. The on-disk page allocator, B-tree layout, redo log, and
//! replication are external collaborators this crate only consumes
//! through narrow traits (see `store`).

pub mod config;
pub mod database;
pub mod error;
pub mod index;
pub mod lock;
pub mod store;
pub mod trash;
pub mod trigger;
pub mod txn;
pub mod types;

pub use config::{EngineConfig, UpgradePolicy};
pub use database::Database;
pub use error::{LockError, Result};
pub use index::{BoundView, Index};
pub use lock::{DeadlockSet, LockManager, LockMode, LockResult, LockScope};
pub use store::{FragmentStore, TxnIdSource, ValueStore};
pub use trash::{FragmentedTrash, UndoFragmentReclaimRecord, UndoLog};
pub use trigger::{Cursor, Transform, TriggerHandle, TriggerList, TriggerObserver};
pub use txn::Transaction;
pub use types::{IndexId, Key, Value, ValueState};
