//! The sharded lock table: `(IndexId, Key) -> Lock`, with FIFO waiter
//! queues and a best-effort wait-for graph feeding the deadlock detector.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::error::{Attachment, LockError, Result};
use crate::lock::deadlock::DeadlockDetector;
use crate::lock::result::{LockMode, LockResult};
use crate::lock::scope::{ScopeHandle, ScopeId};
use crate::types::{IndexId, Key};

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// `hash(index_id, key)`, exposed so callers can precompute it once and
/// pass it through repeated `try_lock` calls, as the real engine does to
/// avoid rehashing the key on every retry.
pub fn resource_hash(index_id: IndexId, key: &[u8]) -> u64 {
    fnv1a(key) ^ index_id.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// One waiter's rendezvous point: the lock table grants by flipping
/// `outcome` and notifying `condvar`; the blocked thread wakes, checks
/// `outcome`, and either returns or keeps waiting (spurious wakeups).
struct Waiter {
    scope: ScopeId,
    mode: LockMode,
    attachment: Attachment,
    state: Mutex<WaitOutcome>,
    condvar: Condvar,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    Pending,
    Granted,
    TimedOut,
}

struct LockState {
    exclusive_owner: Option<ScopeId>,
    /// Includes the upgradable owner, if any — upgradable is a
    /// distinguished shared hold.
    shared_owners: HashSet<ScopeId>,
    upgradable_owner: Option<ScopeId>,
    /// Upgrade requests from an existing holder jump this queue ahead of
    /// freshly arriving requests (spec §4.1: "a shared-to-exclusive
    /// upgrade by a holder must be granted before any newly arriving
    /// exclusive waiter advances").
    upgrade_waiters: VecDeque<Arc<Waiter>>,
    waiters: VecDeque<Arc<Waiter>>,
}

impl LockState {
    fn new() -> Self {
        Self {
            exclusive_owner: None,
            shared_owners: HashSet::new(),
            upgradable_owner: None,
            upgrade_waiters: VecDeque::new(),
            waiters: VecDeque::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.exclusive_owner.is_none()
            && self.shared_owners.is_empty()
            && self.upgradable_owner.is_none()
            && self.upgrade_waiters.is_empty()
            && self.waiters.is_empty()
    }
}

/// A single lockable resource: `(index_id, key)` plus its hash and the
/// latch-protected ownership/waiter state.
pub struct Lock {
    pub index_id: IndexId,
    pub key: Key,
    pub hash: u64,
    state: Mutex<LockState>,
    condvar: Condvar,
}

impl Lock {
    fn new(index_id: IndexId, key: Key, hash: u64) -> Self {
        Self {
            index_id,
            key,
            hash,
            state: Mutex::new(LockState::new()),
            condvar: Condvar::new(),
        }
    }

    /// Best-effort, latch-free read of current owners, for the deadlock
    /// detector. May observe a slightly stale snapshot; that is accepted
    /// per §4.3.
    pub(crate) fn owners_snapshot(&self) -> (Option<ScopeId>, Vec<ScopeId>) {
        let st = self.state.lock();
        (st.exclusive_owner, st.shared_owners.iter().copied().collect())
    }

    fn can_grant(&self, st: &LockState, mode: LockMode, scope: ScopeId, lenient: bool) -> bool {
        match mode {
            LockMode::Shared => {
                st.exclusive_owner.is_none() || st.exclusive_owner == Some(scope)
            }
            LockMode::Upgradable => {
                if st.upgradable_owner == Some(scope) {
                    return true;
                }
                if st.upgradable_owner.is_some() {
                    return false;
                }
                if st.exclusive_owner.is_some() && st.exclusive_owner != Some(scope) {
                    return false;
                }
                if lenient && st.shared_owners.contains(&scope) {
                    // Sole-shared-holder carve-out: only this scope may hold
                    // shared right now.
                    return st.shared_owners.len() == 1;
                }
                // A fresh (non-holder) upgradable request is fine as long as
                // there is no conflicting exclusive owner; co-existing with
                // other plain shared holders is the point of upgradable.
                st.exclusive_owner.is_none() || st.exclusive_owner == Some(scope)
            }
            LockMode::Exclusive => {
                let only_self_shared = st.shared_owners.is_empty()
                    || (st.shared_owners.len() == 1 && st.shared_owners.contains(&scope));
                let owner_ok = st.exclusive_owner.is_none() || st.exclusive_owner == Some(scope);
                owner_ok && only_self_shared
            }
        }
    }

    fn grant(&self, st: &mut LockState, mode: LockMode, scope: ScopeId) {
        match mode {
            LockMode::Shared => {
                st.shared_owners.insert(scope);
            }
            LockMode::Upgradable => {
                st.shared_owners.insert(scope);
                st.upgradable_owner = Some(scope);
            }
            LockMode::Exclusive => {
                st.shared_owners.remove(&scope);
                if st.upgradable_owner == Some(scope) {
                    st.upgradable_owner = None;
                }
                st.exclusive_owner = Some(scope);
            }
        }
    }

    /// Drains whichever waiters can now be granted, strictly in FIFO
    /// order within each priority class (upgrade waiters first), stopping
    /// at the first waiter that still can't proceed — this is what keeps
    /// the queue head-of-line instead of letting later compatible
    /// requests barge ahead.
    fn drain_waiters(&self, st: &mut LockState, lenient: bool) {
        loop {
            let Some(front) = st.upgrade_waiters.front() else { break };
            if self.can_grant(st, front.mode, front.scope, lenient) {
                let w = st.upgrade_waiters.pop_front().unwrap();
                self.grant(st, w.mode, w.scope);
                *w.state.lock() = WaitOutcome::Granted;
                w.condvar.notify_all();
            } else {
                break;
            }
        }
        loop {
            let Some(front) = st.waiters.front() else { break };
            if self.can_grant(st, front.mode, front.scope, lenient) {
                let w = st.waiters.pop_front().unwrap();
                self.grant(st, w.mode, w.scope);
                *w.state.lock() = WaitOutcome::Granted;
                w.condvar.notify_all();
            } else {
                break;
            }
        }
    }
}

struct Shard {
    locks: Mutex<HashMap<(IndexId, Key), Arc<Lock>>>,
}

impl Shard {
    fn new() -> Self {
        Self { locks: Mutex::new(HashMap::new()) }
    }
}

/// Fixed sharded hash map from `(index-id, key)` to `Lock`, per §4.1.
pub struct LockTable {
    shards: Vec<Shard>,
    mask: u64,
    lenient_upgrade: bool,
    /// Registry of live scopes, so the deadlock detector can resolve a
    /// `waiting_for` edge's owner scope id back to that scope's own
    /// `waiting_for` pointer, without the scope needing to know about
    /// every other scope.
    scopes: DashMap<ScopeId, Weak<ScopeHandle>>,
    next_scope_id: AtomicU64,
}

impl LockTable {
    pub fn new(shard_count: usize, lenient_upgrade: bool) -> Self {
        assert!(shard_count.is_power_of_two(), "shard_count must be a power of two");
        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(Shard::new());
        }
        Self {
            shards,
            mask: (shard_count as u64) - 1,
            lenient_upgrade,
            scopes: DashMap::new(),
            // 0 is reserved for the BOGUS scope, which never appears here.
            next_scope_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn allocate_scope_id(&self) -> ScopeId {
        self.next_scope_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn register_scope(&self, id: ScopeId, handle: &Arc<ScopeHandle>) {
        self.scopes.insert(id, Arc::downgrade(handle));
    }

    pub(crate) fn unregister_scope(&self, id: ScopeId) {
        self.scopes.remove(&id);
    }

    pub(crate) fn lookup_scope(&self, id: ScopeId) -> Option<Arc<ScopeHandle>> {
        self.scopes.get(&id).and_then(|w| w.upgrade())
    }

    fn shard_for(&self, hash: u64) -> &Shard {
        &self.shards[(hash & self.mask) as usize]
    }

    fn find_or_create_lock(&self, index_id: IndexId, key: &[u8], hash: u64) -> Arc<Lock> {
        let shard = self.shard_for(hash);
        let mut locks = shard.locks.lock();
        locks
            .entry((index_id, key.to_vec()))
            .or_insert_with(|| Arc::new(Lock::new(index_id, key.to_vec(), hash)))
            .clone()
    }

    fn maybe_recycle(&self, lock: &Arc<Lock>) {
        let shard = self.shard_for(lock.hash);
        let mut locks = shard.locks.lock();
        if let Some(existing) = locks.get(&(lock.index_id, lock.key.clone())) {
            if Arc::ptr_eq(existing, lock) {
                let st = existing.state.lock();
                if st.is_idle() {
                    drop(st);
                    locks.remove(&(lock.index_id, lock.key.clone()));
                }
            }
        }
    }

    /// Attempts to acquire `mode` on `(index_id, key)` for `scope`, per
    /// §4.1. `timeout = None` waits forever; `Some(Duration::ZERO)` fails
    /// fast without running the deadlock detector.
    pub fn try_lock(
        &self,
        mode: LockMode,
        scope: &ScopeHandle,
        index_id: IndexId,
        key: &[u8],
        hash: u64,
        timeout: Option<Duration>,
    ) -> Result<(LockResult, Arc<Lock>)> {
        let lock = self.find_or_create_lock(index_id, key, hash);

        let already = {
            let st = lock.state.lock();
            if st.exclusive_owner == Some(scope.id) {
                Some(LockResult::OwnedExclusive)
            } else if st.upgradable_owner == Some(scope.id) && mode != LockMode::Exclusive {
                Some(LockResult::OwnedUpgradable)
            } else if st.shared_owners.contains(&scope.id)
                && mode == LockMode::Shared
            {
                Some(LockResult::OwnedShared)
            } else {
                None
            }
        };
        if let Some(r) = already {
            return Ok((r, lock));
        }

        // Same-scope strengthening (shared -> upgradable/exclusive, or
        // upgradable -> exclusive) goes through the upgrade path, which
        // enforces the upgrade policy and priority queue.
        let currently_held_mode = {
            let st = lock.state.lock();
            if st.exclusive_owner == Some(scope.id) {
                Some(LockMode::Exclusive)
            } else if st.upgradable_owner == Some(scope.id) {
                Some(LockMode::Upgradable)
            } else if st.shared_owners.contains(&scope.id) {
                Some(LockMode::Shared)
            } else {
                None
            }
        };

        if let Some(held) = currently_held_mode {
            if held == LockMode::Shared && mode != LockMode::Shared {
                if !self.lenient_upgrade {
                    return Ok((LockResult::Illegal, lock));
                }
            }
            return self.upgrade(mode, scope, &lock, timeout);
        }

        // Fast path: try to grant immediately if there's no queue ahead of
        // us (head-of-line fairness: a fresh request must not barge ahead
        // of anyone already waiting).
        {
            let mut st = lock.state.lock();
            if st.waiters.is_empty()
                && st.upgrade_waiters.is_empty()
                && self.can_grant_pub(&lock, &st, mode, scope.id)
            {
                lock.grant(&mut st, mode, scope.id);
                return Ok((LockResult::Acquired, lock));
            }
        }

        if timeout == Some(Duration::ZERO) {
            return Ok((LockResult::TimedOutLock, lock));
        }

        self.wait_for_grant(mode, scope, &lock, timeout, false)
    }

    fn can_grant_pub(&self, lock: &Lock, st: &LockState, mode: LockMode, scope: ScopeId) -> bool {
        lock.can_grant(st, mode, scope, self.lenient_upgrade)
    }

    fn upgrade(
        &self,
        mode: LockMode,
        scope: &ScopeHandle,
        lock: &Arc<Lock>,
        timeout: Option<Duration>,
    ) -> Result<(LockResult, Arc<Lock>)> {
        {
            let mut st = lock.state.lock();
            if st.upgrade_waiters.is_empty()
                && self.can_grant_pub(lock, &st, mode, scope.id)
            {
                lock.grant(&mut st, mode, scope.id);
                return Ok((LockResult::Upgraded, lock.clone()));
            }
        }
        if timeout == Some(Duration::ZERO) {
            return Ok((LockResult::TimedOutLock, lock.clone()));
        }
        self.wait_for_grant(mode, scope, lock, timeout, true)
    }

    fn wait_for_grant(
        &self,
        mode: LockMode,
        scope: &ScopeHandle,
        lock: &Arc<Lock>,
        timeout: Option<Duration>,
        is_upgrade: bool,
    ) -> Result<(LockResult, Arc<Lock>)> {
        let waiter = Arc::new(Waiter {
            scope: scope.id,
            mode,
            attachment: scope.attachment(),
            state: Mutex::new(WaitOutcome::Pending),
            condvar: Condvar::new(),
        });

        {
            let mut st = lock.state.lock();
            if is_upgrade {
                st.upgrade_waiters.push_back(waiter.clone());
            } else {
                st.waiters.push_back(waiter.clone());
            }
        }
        scope.set_waiting_for(Some(lock.clone()));

        let start = Instant::now();
        let outcome = {
            let mut guard = waiter.state.lock();
            loop {
                match *guard {
                    WaitOutcome::Granted | WaitOutcome::TimedOut => break *guard,
                    WaitOutcome::Pending => {}
                }
                match timeout {
                    None => {
                        waiter.condvar.wait(&mut guard);
                    }
                    Some(d) => {
                        let elapsed = start.elapsed();
                        if elapsed >= d {
                            *guard = WaitOutcome::TimedOut;
                            break WaitOutcome::TimedOut;
                        }
                        let remaining = d - elapsed;
                        let result = waiter.condvar.wait_for(&mut guard, remaining);
                        if result.timed_out() && *guard == WaitOutcome::Pending {
                            *guard = WaitOutcome::TimedOut;
                            break WaitOutcome::TimedOut;
                        }
                    }
                }
            }
        };

        scope.set_waiting_for(None);

        match outcome {
            WaitOutcome::Granted => Ok((
                if is_upgrade { LockResult::Upgraded } else { LockResult::Acquired },
                lock.clone(),
            )),
            WaitOutcome::TimedOut => {
                // Remove ourselves from whichever queue we were in; we may
                // have been granted concurrently with the timeout race, in
                // which case removal is a no-op and we should honor the
                // grant instead of reporting a timeout.
                let mut st = lock.state.lock();
                let queue = if is_upgrade { &mut st.upgrade_waiters } else { &mut st.waiters };
                let was_queued = queue.iter().any(|w| Arc::ptr_eq(w, &waiter));
                queue.retain(|w| !Arc::ptr_eq(w, &waiter));
                drop(st);
                if !was_queued {
                    // Already dequeued by a granting thread racing us.
                    let final_state = *waiter.state.lock();
                    if final_state == WaitOutcome::Granted {
                        return Ok((
                            if is_upgrade { LockResult::Upgraded } else { LockResult::Acquired },
                            lock.clone(),
                        ));
                    }
                }
                if timeout == Some(Duration::ZERO) {
                    Ok((LockResult::TimedOutLock, lock.clone()))
                } else {
                    let detector = DeadlockDetector::new(self);
                    if let Some(set) = detector.detect(scope.id) {
                        Err(LockError::Deadlock(set))
                    } else {
                        Ok((LockResult::TimedOutLock, lock.clone()))
                    }
                }
            }
            WaitOutcome::Pending => unreachable!("loop only exits on Granted or TimedOut"),
        }
    }

    /// Releases `scope`'s hold on `lock` entirely.
    pub fn unlock(&self, scope_id: ScopeId, lock: &Arc<Lock>) {
        {
            let mut st = lock.state.lock();
            if st.exclusive_owner == Some(scope_id) {
                st.exclusive_owner = None;
            }
            st.shared_owners.remove(&scope_id);
            if st.upgradable_owner == Some(scope_id) {
                st.upgradable_owner = None;
            }
            lock.drain_waiters(&mut st, self.lenient_upgrade);
        }
        self.maybe_recycle(lock);
    }

    /// Weakens `scope`'s hold on `lock` to `target`, releasing the
    /// strictly-stronger portion and waking waiters blocked only on that
    /// stronger mode.
    pub fn unlock_to(&self, scope_id: ScopeId, lock: &Arc<Lock>, target: LockMode) {
        {
            let mut st = lock.state.lock();
            match target {
                LockMode::Shared => {
                    if st.exclusive_owner == Some(scope_id) {
                        st.exclusive_owner = None;
                        st.shared_owners.insert(scope_id);
                    }
                    if st.upgradable_owner == Some(scope_id) {
                        st.upgradable_owner = None;
                        // still a plain shared owner
                    }
                }
                LockMode::Upgradable => {
                    if st.exclusive_owner == Some(scope_id) {
                        st.exclusive_owner = None;
                        st.shared_owners.insert(scope_id);
                    }
                    st.upgradable_owner = Some(scope_id);
                }
                LockMode::Exclusive => {
                    // Strengthening is not a downgrade; no-op here, handled
                    // by the upgrade path instead.
                }
            }
            lock.drain_waiters(&mut st, self.lenient_upgrade);
        }
        self.maybe_recycle(lock);
    }

    pub(crate) fn lenient_upgrade(&self) -> bool {
        self.lenient_upgrade
    }
}
