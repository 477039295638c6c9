use std::sync::atomic::Ordering;

use linux_futex::{Futex, Private};

/// This futex represents a lock and is unlocked
const FUTEX_UNLOCKED: u32 = 0;

/// This futex represents a lock and is locked, nobody is waiting
const FUTEX_LOCKED: u32 = 1;

/// This futex represents a lock and is locked, and somebody might be asleep
/// on it, so `unlock()` has to go to the kernel
const FUTEX_CONTENDED: u32 = 2;

/// A bare, non-reentrant futex mutex. Uncontended lock/unlock stay in
/// userspace; waiters sleep in the kernel. It never allocates.
#[repr(transparent)]
pub struct RawLock {
    futex: Futex<Private>,
}

// SAFETY: `Futex` is a transparent `AtomicU32`, and 0 is `FUTEX_UNLOCKED`
unsafe impl bytemuck::Zeroable for RawLock {}

impl RawLock {
    pub const fn new() -> Self {
        Self {
            futex: Futex::new(FUTEX_UNLOCKED),
        }
    }

    /// Put the lock back into the unlocked state. Only sound while nobody
    /// else can see this lock.
    pub fn reset(&self) {
        self.futex.value.store(FUTEX_UNLOCKED, Ordering::Relaxed);
    }

    /// Take the lock if it's free, never blocks
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.futex
            .value
            .compare_exchange(
                FUTEX_UNLOCKED,
                FUTEX_LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Take the lock, sleeping for as long as it takes
    pub fn lock(&self) {
        if self.try_lock() {
            return;
        }
        // Mark the lock contended before going to sleep, so whoever holds it
        // knows to wake us. If the swap shows it was actually free, we got it.
        while self.futex.value.swap(FUTEX_CONTENDED, Ordering::Acquire) != FUTEX_UNLOCKED {
            _ = self.futex.wait(FUTEX_CONTENDED);
        }
    }

    #[inline]
    pub fn unlock(&self) {
        if self.futex.value.swap(FUTEX_UNLOCKED, Ordering::Release) == FUTEX_CONTENDED {
            self.futex.wake(1);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.futex.value.load(Ordering::Relaxed) != FUTEX_UNLOCKED
    }
}

impl Default for RawLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::UnsafeCell, sync::atomic::AtomicBool};

    use super::RawLock;

    #[test]
    fn try_lock_fails_while_held() {
        let lock = RawLock::new();
        assert!(lock.try_lock());
        assert!(lock.is_locked());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(!lock.is_locked());
        assert!(lock.try_lock());
        lock.unlock();
    }

    struct Shared {
        lock: RawLock,
        count: UnsafeCell<usize>,
    }

    unsafe impl Sync for Shared {}

    #[test]
    fn lock_gives_mutual_exclusion() {
        let shared = Shared {
            lock: RawLock::new(),
            count: UnsafeCell::new(0),
        };
        let shared = &shared;
        crossbeam::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(move |_| {
                    for _ in 0..10_000 {
                        shared.lock.lock();
                        unsafe { *shared.count.get() += 1 };
                        shared.lock.unlock();
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(unsafe { *shared.count.get() }, 80_000);
        assert!(!shared.lock.is_locked());
    }

    #[test]
    fn sleeping_waiter_is_woken() {
        let lock = RawLock::new();
        let acquired = AtomicBool::new(false);
        lock.lock();
        crossbeam::thread::scope(|s| {
            s.spawn(|_| {
                lock.lock();
                acquired.store(true, std::sync::atomic::Ordering::SeqCst);
                lock.unlock();
            });
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert!(!acquired.load(std::sync::atomic::Ordering::SeqCst));
            lock.unlock();
        })
        .unwrap();
        assert!(acquired.load(std::sync::atomic::Ordering::SeqCst));
    }
}
