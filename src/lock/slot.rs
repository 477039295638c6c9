use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::{futex::RawLock, lazy::LazyInit};
use crate::os::thread::ThreadIdentity;

/// No thread owns the slot. Real kernel thread ids never get this large.
const NO_OWNER: u64 = u64::MAX;

/// What to do when a thread calls back into the interposer while it already
/// holds its own slot (e.g. the wrapped allocator allocates from inside
/// `malloc()`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReentrancyPolicy {
    /// Count the nesting depth and let the call through
    #[default]
    Recursive,
    /// Treat reentry as a bug and refuse it
    FailFast,
}

/// What a call to [`ThreadSlot::try_enter()`] did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    /// The slot was free and is now ours
    Acquired,
    /// We already had it, the depth went up
    Reentered,
    /// We already had it and the policy said no. Nothing was changed.
    Refused,
    /// Another thread (aliasing onto this slot) has it. Nothing was
    /// changed; finish with [`ThreadSlot::wait_enter()`].
    WouldBlock,
}

/// One entry in the lock table, aligned to a cache line so neighbouring
/// threads never false-share
#[repr(C, align(64))]
pub struct ThreadSlot {
    init: LazyInit,
    lock: RawLock,
    /// Only ever compared against the *calling* thread's own identity. A
    /// thread can only see its own id in here if it stored it itself and has
    /// not released yet, so `Relaxed` is enough.
    owner: AtomicU64,
    /// Only touched by the owner
    depth: AtomicU32,
}

// SAFETY: every field is zeroable, and a zeroed slot is simply uninitialized
unsafe impl bytemuck::Zeroable for ThreadSlot {}

impl ThreadSlot {
    pub const fn new() -> Self {
        Self {
            init: LazyInit::new(),
            lock: RawLock::new(),
            owner: AtomicU64::new(NO_OWNER),
            depth: AtomicU32::new(0),
        }
    }

    /// Initialize this slot on first use. Returns `true` for the one caller
    /// that did the initialization.
    #[inline]
    pub fn ensure_init(&self) -> bool {
        self.init.ensure(|| {
            self.lock.reset();
            self.owner.store(NO_OWNER, Ordering::Relaxed);
            self.depth.store(0, Ordering::Relaxed);
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.init.state() == super::lazy::LazyState::Init
    }

    /// The non-blocking half of locking on behalf of `identity`. The slot
    /// must be initialized.
    ///
    /// If the lock is taken, either we are re-entering (we own it) or another
    /// thread aliases onto this slot, and those two are told apart by the
    /// owner field.
    #[inline]
    pub fn try_enter(&self, identity: ThreadIdentity, policy: ReentrancyPolicy) -> LockOutcome {
        debug_assert!(self.is_initialized());
        if self.lock.try_lock() {
            self.take_ownership(identity);
            return LockOutcome::Acquired;
        }
        if self.owner.load(Ordering::Relaxed) == identity.get() {
            return match policy {
                ReentrancyPolicy::Recursive => {
                    self.depth.fetch_add(1, Ordering::Relaxed);
                    LockOutcome::Reentered
                }
                ReentrancyPolicy::FailFast => LockOutcome::Refused,
            };
        }
        LockOutcome::WouldBlock
    }

    /// Sleep until the slot is free, then take it for `identity`. Only after
    /// [`ThreadSlot::try_enter()`] said [`LockOutcome::WouldBlock`].
    pub fn wait_enter(&self, identity: ThreadIdentity) {
        self.lock.lock();
        self.take_ownership(identity);
    }

    fn take_ownership(&self, identity: ThreadIdentity) {
        self.owner.store(identity.get(), Ordering::Relaxed);
        self.depth.store(1, Ordering::Relaxed);
    }

    /// Undo one successful [`ThreadSlot::try_enter()`] or
    /// [`ThreadSlot::wait_enter()`]. The lock itself is only
    /// released once the outermost call unwinds.
    #[inline]
    pub fn unlock(&self) {
        if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(NO_OWNER, Ordering::Relaxed);
            self.lock.unlock();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Current nesting depth, 0 when unlocked
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }
}

impl Default for ThreadSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ME: ThreadIdentity = ThreadIdentity(7);

    fn slot() -> ThreadSlot {
        let slot = ThreadSlot::new();
        assert!(slot.ensure_init());
        slot
    }

    #[test]
    fn zeroed_slot_is_uninitialized() {
        let slot: ThreadSlot = bytemuck::Zeroable::zeroed();
        assert!(!slot.is_initialized());
        assert!(slot.ensure_init());
        assert!(!slot.ensure_init());
        assert!(!slot.is_locked());
    }

    #[test]
    fn slot_fills_a_cache_line() {
        assert_eq!(std::mem::align_of::<ThreadSlot>(), 64);
        assert_eq!(std::mem::size_of::<ThreadSlot>(), 64);
    }

    #[test]
    fn recursive_reentry_counts_depth() {
        let slot = slot();
        assert_eq!(slot.try_enter(ME, ReentrancyPolicy::Recursive), LockOutcome::Acquired);
        assert_eq!(slot.try_enter(ME, ReentrancyPolicy::Recursive), LockOutcome::Reentered);
        assert_eq!(slot.depth(), 2);
        slot.unlock();
        assert!(slot.is_locked());
        slot.unlock();
        assert!(!slot.is_locked());
        assert_eq!(slot.depth(), 0);
    }

    #[test]
    fn fail_fast_refuses_without_touching_state() {
        let slot = slot();
        assert_eq!(slot.try_enter(ME, ReentrancyPolicy::FailFast), LockOutcome::Acquired);
        assert_eq!(slot.try_enter(ME, ReentrancyPolicy::FailFast), LockOutcome::Refused);
        assert_eq!(slot.depth(), 1);
        slot.unlock();
        assert!(!slot.is_locked());
    }

    #[test]
    fn aliased_thread_would_block_instead_of_reentering() {
        let slot = slot();
        let other = ThreadIdentity(8);
        assert_eq!(slot.try_enter(ME, ReentrancyPolicy::Recursive), LockOutcome::Acquired);
        assert_eq!(
            slot.try_enter(other, ReentrancyPolicy::Recursive),
            LockOutcome::WouldBlock
        );
        // refusing to block changed nothing
        assert_eq!(slot.depth(), 1);

        crossbeam::thread::scope(|s| {
            let waiter = s.spawn(|_| slot.wait_enter(other));
            std::thread::sleep(std::time::Duration::from_millis(20));
            slot.unlock();
            waiter.join().unwrap();
        })
        .unwrap();
        assert_eq!(slot.depth(), 1);
        assert!(slot.is_locked());
        slot.unlock();
        assert!(!slot.is_locked());
    }
}
