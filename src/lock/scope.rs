//! `LockScope` — the stack of locks held by a transaction or ad-hoc
//! locker, per §4.2. Storage is a chain of fixed 64-entry blocks so each
//! block's `upgrades` / `unlock_group` membership fits in one `u64`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Attachment, LockError, Result};
use crate::lock::result::{LockMode, LockResult};
use crate::lock::table::{resource_hash, Lock, LockTable};
use crate::types::IndexId;

pub type ScopeId = u64;

const BLOCK_CAP: usize = 64;

struct Frame {
    lock: Arc<Lock>,
    mode: LockMode,
}

/// A fixed-capacity block of stack frames plus its word-sized metadata.
/// `upgrades` bit `i` means `frames[i]` is a non-immediate upgrade (a
/// separate frame layered on top of an earlier acquire of the same lock,
/// as opposed to one coalesced into a single frame). `unlock_group` bit
/// `i` means `frames[i]` must be released together with `frames[i-1]`.
struct Block {
    frames: Vec<Frame>,
    upgrades: u64,
    unlock_group: u64,
}

impl Block {
    fn new() -> Self {
        Self { frames: Vec::with_capacity(BLOCK_CAP), upgrades: 0, unlock_group: 0 }
    }

    fn is_full(&self) -> bool {
        self.frames.len() >= BLOCK_CAP
    }
}

struct Stack {
    blocks: Vec<Block>,
    len: usize,
    /// Stack length (`len`) recorded at each `scope_enter()`, innermost
    /// last.
    scope_marks: Vec<usize>,
}

impl Stack {
    fn new() -> Self {
        Self { blocks: vec![Block::new()], len: 0, scope_marks: Vec::new() }
    }

    fn last_block_mut(&mut self) -> &mut Block {
        if self.blocks.last().map(|b| b.is_full()).unwrap_or(true) {
            self.blocks.push(Block::new());
        }
        self.blocks.last_mut().unwrap()
    }

    fn top(&self) -> Option<(&Block, usize)> {
        if self.len == 0 {
            return None;
        }
        let mut remaining = self.len;
        for block in &self.blocks {
            if remaining <= block.frames.len() {
                return Some((block, remaining - 1));
            }
            remaining -= block.frames.len();
        }
        None
    }

    fn top_mode(&self) -> Option<LockMode> {
        self.top().map(|(b, i)| b.frames[i].mode)
    }

    fn top_is_upgrade(&self) -> bool {
        self.top().map(|(b, i)| (b.upgrades >> i) & 1 == 1).unwrap_or(false)
    }

    fn top_unlock_group(&self) -> bool {
        self.top().map(|(b, i)| (b.unlock_group >> i) & 1 == 1).unwrap_or(false)
    }

    /// True if the current top frame was pushed before the innermost
    /// active `scope_enter()` mark — i.e. it belongs to the parent scope
    /// and must not be touched by `unlock*` while the sub-scope is active.
    fn top_belongs_to_parent(&self) -> bool {
        match self.scope_marks.last() {
            Some(&mark) => self.len <= mark,
            None => false,
        }
    }

    fn push_fresh(&mut self, lock: Arc<Lock>, mode: LockMode) {
        let block = self.last_block_mut();
        let idx = block.frames.len();
        block.frames.push(Frame { lock, mode });
        block.upgrades &= !(1u64 << idx);
        block.unlock_group &= !(1u64 << idx);
        self.len += 1;
    }

    /// Coalesces an upgrade into the current top frame if it is an
    /// immediate acquire of the same lock in this scope; otherwise pushes
    /// a separate non-immediate upgrade frame. Returns whether it was
    /// coalesced.
    fn push_upgrade(&mut self, lock: Arc<Lock>, mode: LockMode) -> bool {
        let can_coalesce = self
            .top()
            .map(|(b, i)| Arc::ptr_eq(&b.frames[i].lock, &lock))
            .unwrap_or(false);
        if can_coalesce {
            let (block, idx) = {
                let last_block_len = self.blocks.last().unwrap().frames.len();
                let block_idx = self.blocks.len() - 1;
                debug_assert!(last_block_len > 0);
                (block_idx, last_block_len - 1)
            };
            self.blocks[block].frames[idx].mode = mode;
            true
        } else {
            let block = self.last_block_mut();
            let idx = block.frames.len();
            block.frames.push(Frame { lock, mode });
            block.upgrades |= 1u64 << idx;
            block.unlock_group &= !(1u64 << idx);
            self.len += 1;
            false
        }
    }

    /// Pops the top frame (must exist), returning its lock and mode.
    fn pop(&mut self) -> (Arc<Lock>, LockMode) {
        let block = self.blocks.last_mut().expect("non-empty stack");
        let frame = block.frames.pop().expect("non-empty top block");
        let idx = block.frames.len();
        block.upgrades &= !(1u64 << idx);
        block.unlock_group &= !(1u64 << idx);
        if block.frames.is_empty() && self.blocks.len() > 1 {
            self.blocks.pop();
        }
        self.len -= 1;
        (frame.lock, frame.mode)
    }

    fn set_top_mode(&mut self, mode: LockMode) {
        let block = self.blocks.last_mut().expect("non-empty stack");
        let idx = block.frames.len() - 1;
        block.frames[idx].mode = mode;
    }

    fn mark_top_grouped(&mut self) {
        let block = self.blocks.last_mut().expect("non-empty stack");
        let idx = block.frames.len() - 1;
        block.unlock_group |= 1u64 << idx;
    }
}

/// The table-visible identity of a scope: its id, its attachment, and the
/// lock it is currently blocked on (if any). The deadlock detector reads
/// this without taking any lock-table latch.
pub struct ScopeHandle {
    pub(crate) id: ScopeId,
    attachment: Mutex<Attachment>,
    waiting_for: Mutex<Option<Arc<Lock>>>,
}

impl ScopeHandle {
    pub fn attachment(&self) -> Attachment {
        self.attachment.lock().clone()
    }

    pub fn set_attachment(&self, attachment: Attachment) {
        *self.attachment.lock() = attachment;
    }

    pub(crate) fn set_waiting_for(&self, lock: Option<Arc<Lock>>) {
        *self.waiting_for.lock() = lock;
    }

    pub(crate) fn waiting_for(&self) -> Option<Arc<Lock>> {
        self.waiting_for.lock().clone()
    }
}

/// A transaction or ad-hoc locker: the scoped stack of held locks plus
/// the table handle used to acquire and release them. The special
/// `BOGUS` scope (see `Transaction::bogus`) never actually calls into the
/// table — its mutation path short-circuits before reaching here.
pub struct LockScope {
    handle: Arc<ScopeHandle>,
    table: Arc<LockTable>,
    stack: Mutex<Stack>,
    default_timeout: Option<Duration>,
    last_locked: Mutex<Option<(IndexId, Vec<u8>)>>,
    interrupted: AtomicBool,
}

/// A commit-deferred bundle of exclusive locks, produced by
/// `transfer_exclusive`. Released (all at once) once the caller knows the
/// associated redo record is durable — driven externally, since the redo
/// log itself is out of core scope.
pub struct PendingTxn {
    table: Arc<LockTable>,
    scope_id: ScopeId,
    locks: Vec<Arc<Lock>>,
}

impl PendingTxn {
    pub fn release(self) {
        // Drop runs the actual release; this method exists so call sites
        // can name the moment explicitly.
        drop(self);
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for PendingTxn {
    fn drop(&mut self) {
        for lock in &self.locks {
            self.table.unlock(self.scope_id, lock);
        }
    }
}

impl LockScope {
    pub(crate) fn new(
        table: Arc<LockTable>,
        default_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let id = table.allocate_scope_id();
        let handle = Arc::new(ScopeHandle {
            id,
            attachment: Mutex::new(None),
            waiting_for: Mutex::new(None),
        });
        table.register_scope(id, &handle);
        Arc::new(Self {
            handle,
            table,
            stack: Mutex::new(Stack::new()),
            default_timeout,
            last_locked: Mutex::new(None),
            interrupted: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ScopeId {
        self.handle.id
    }

    /// The timeout a bare `lock()` call falls back to when it isn't
    /// given one explicitly. Exposed so callers building a typed error
    /// out of a `TimedOutLock` result can report how long they waited.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    pub fn set_attachment(&self, attachment: Attachment) {
        self.handle.set_attachment(attachment);
    }

    pub fn attachment(&self) -> Attachment {
        self.handle.attachment()
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    fn check_interrupted(&self) -> Result<()> {
        if self.interrupted.swap(false, Ordering::SeqCst) {
            Err(LockError::LockInterrupted)
        } else {
            Ok(())
        }
    }

    /// Acquires `mode` on `(index_id, key)`, using this scope's default
    /// timeout unless `timeout` overrides it.
    pub fn lock(
        &self,
        mode: LockMode,
        index_id: IndexId,
        key: &[u8],
        timeout: Option<Duration>,
    ) -> Result<LockResult> {
        self.check_interrupted()?;
        let hash = resource_hash(index_id, key);
        let effective_timeout = timeout.or(self.default_timeout);
        let (result, lock) =
            self.table.try_lock(mode, &self.handle, index_id, key, hash, effective_timeout)?;

        match result {
            LockResult::Acquired => {
                self.stack.lock().push_fresh(lock, mode);
            }
            LockResult::Upgraded => {
                self.stack.lock().push_upgrade(lock, mode);
            }
            _ => {}
        }
        if result.is_held() {
            *self.last_locked.lock() = Some((index_id, key.to_vec()));
        }
        Ok(result)
    }

    pub fn last_locked(&self) -> Option<(IndexId, Vec<u8>)> {
        self.last_locked.lock().clone()
    }

    pub fn held_lock_count(&self) -> usize {
        self.stack.lock().len
    }

    /// Releases the top frame entirely. See §4.2 for the three
    /// `IllegalState` preconditions.
    pub fn unlock(&self) -> Result<()> {
        let (lock, scope_for_cascade) = {
            let mut stack = self.stack.lock();
            if stack.len == 0 {
                return Err(LockError::illegal_state("unlock() with no locks held"));
            }
            if stack.top_belongs_to_parent() {
                return Err(LockError::illegal_state(
                    "unlock() would cross a scope boundary",
                ));
            }
            if stack.top_is_upgrade() {
                return Err(LockError::illegal_state(
                    "cannot unlock() a non-immediate upgrade frame directly",
                ));
            }
            let grouped = stack.top_unlock_group();
            let (lock, _mode) = stack.pop();
            (lock, grouped)
        };
        self.table.unlock(self.handle.id, &lock);
        if scope_for_cascade {
            // The popped frame was grouped with the one below it: cascade.
            self.unlock()?;
        }
        Ok(())
    }

    fn unlock_to(&self, target: LockMode) -> Result<()> {
        let (lock, grouped) = {
            let mut stack = self.stack.lock();
            if stack.len == 0 {
                return Err(LockError::illegal_state("unlock_to() with no locks held"));
            }
            if stack.top_belongs_to_parent() {
                return Err(LockError::illegal_state(
                    "unlock_to() would cross a scope boundary",
                ));
            }
            let grouped = stack.top_unlock_group();
            if stack.top_is_upgrade() {
                // Pop the upgrade frame, reverting to the pre-upgrade
                // frame, then weaken the lock itself.
                let (lock, _mode) = stack.pop();
                if stack.len == 0 || stack.top_belongs_to_parent() {
                    return Err(LockError::illegal_state(
                        "no pre-upgrade frame to revert to",
                    ));
                }
                stack.set_top_mode(target);
                (lock, grouped)
            } else {
                stack.set_top_mode(target);
                let lock = stack.top().map(|(b, i)| b.frames[i].lock.clone()).unwrap();
                (lock, grouped)
            }
        };
        self.table.unlock_to(self.handle.id, &lock, target);
        if grouped {
            self.unlock_to(target)?;
        }
        Ok(())
    }

    pub fn unlock_to_shared(&self) -> Result<()> {
        self.unlock_to(LockMode::Shared)
    }

    pub fn unlock_to_upgradable(&self) -> Result<()> {
        self.unlock_to(LockMode::Upgradable)
    }

    /// Marks the top frame as grouped with the frame below it: both kinds
    /// must match (both acquires or both upgrades), and subsequent
    /// `unlock*` calls release them as a unit.
    pub fn unlock_combine(&self) -> Result<()> {
        let mut stack = self.stack.lock();
        if stack.len < 2 {
            return Err(LockError::illegal_state(
                "unlock_combine() needs at least two frames",
            ));
        }
        if stack.top_belongs_to_parent() {
            return Err(LockError::illegal_state(
                "unlock_combine() would cross a scope boundary",
            ));
        }
        let top_is_upgrade = stack.top_is_upgrade();
        // Inspect the frame directly below the top within the same block
        // (combining across a scope boundary is never legal; combining
        // across a block boundary is not modeled, matching the teacher's
        // single-block-at-a-time bit tricks).
        let block = stack.blocks.last().expect("non-empty stack");
        if block.frames.len() < 2 {
            return Err(LockError::illegal_state(
                "unlock_combine() across a block boundary is not supported",
            ));
        }
        let below_idx = block.frames.len() - 2;
        let below_is_upgrade = (block.upgrades >> below_idx) & 1 == 1;
        if top_is_upgrade != below_is_upgrade {
            return Err(LockError::illegal_state(
                "unlock_combine() cannot mix an acquire with an upgrade",
            ));
        }
        stack.mark_top_grouped();
        Ok(())
    }

    /// Pushes a sub-scope marker at the current stack depth.
    pub fn scope_enter(&self) {
        let mut stack = self.stack.lock();
        let mark = stack.len;
        stack.scope_marks.push(mark);
    }

    /// Releases every lock acquired since the innermost `scope_enter()`,
    /// then removes that mark.
    pub fn scope_exit(&self) -> Result<()> {
        self.scope_unlock_all()?;
        self.stack.lock().scope_marks.pop();
        Ok(())
    }

    /// Releases everything pushed in the current sub-scope without
    /// popping the mark itself (so the sub-scope stays open).
    pub fn scope_unlock_all(&self) -> Result<()> {
        loop {
            let should_continue = {
                let stack = self.stack.lock();
                match stack.scope_marks.last() {
                    Some(&mark) => stack.len > mark,
                    None => false,
                }
            };
            if !should_continue {
                break;
            }
            self.unlock()?;
        }
        Ok(())
    }

    /// Reassigns every lock acquired within the current sub-scope to the
    /// parent scope, by simply draining the mark: those frames are no
    /// longer bounded by it and become indistinguishable from
    /// parent-scope frames.
    pub fn promote(&self) -> Result<()> {
        let mut stack = self.stack.lock();
        if stack.scope_marks.pop().is_none() {
            return Err(LockError::illegal_state("promote() with no open sub-scope"));
        }
        Ok(())
    }

    /// Produces a `PendingTxn` holding every exclusive lock acquired in
    /// the current (innermost) sub-scope, releasing every other held lock
    /// immediately. Used by commit.
    pub fn transfer_exclusive(&self) -> PendingTxn {
        let mut exclusive = Vec::new();
        let mut others = Vec::new();
        {
            let mut stack = self.stack.lock();
            let lower_bound = stack.scope_marks.last().copied().unwrap_or(0);
            while stack.len > lower_bound {
                let (lock, mode) = stack.pop();
                if mode == LockMode::Exclusive {
                    exclusive.push(lock);
                } else {
                    others.push(lock);
                }
            }
        }
        for lock in others {
            self.table.unlock(self.handle.id, &lock);
        }
        PendingTxn { table: self.table.clone(), scope_id: self.handle.id, locks: exclusive }
    }

    /// Releases every held lock and clears any pending wait — used on
    /// scope teardown (commit/rollback/drop of an ad-hoc locker).
    pub fn release_all(&self) {
        loop {
            let top = {
                let mut stack = self.stack.lock();
                if stack.len == 0 {
                    None
                } else {
                    Some(stack.pop())
                }
            };
            match top {
                Some((lock, _mode)) => self.table.unlock(self.handle.id, &lock),
                None => break,
            }
        }
        self.stack.lock().scope_marks.clear();
    }
}

impl Drop for LockScope {
    fn drop(&mut self) {
        self.release_all();
        self.table.unregister_scope(self.handle.id);
    }
}
