//! OS-level thread identifiers.

use std::{cell::Cell, fmt};

thread_local! {
    /// `gettid()` is a syscall, so we only ever ask once per thread. `0` is
    /// never a valid kernel thread id, so it doubles as "not asked yet".
    static TID: Cell<u64> = const { Cell::new(0) };
}

/// The kernel's identifier for a running thread
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadIdentity(pub u64);

impl ThreadIdentity {
    /// The identity of the calling thread. Does not allocate, so this is fine
    /// to call from inside an allocator entry point.
    #[inline]
    pub fn current() -> Self {
        let tid = TID.with(|tid| {
            if tid.get() == 0 {
                tid.set(gettid());
            }
            tid.get()
        });
        Self(tid)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[inline]
fn gettid() -> u64 {
    // SAFETY: gettid() takes no arguments and cannot fail
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}
