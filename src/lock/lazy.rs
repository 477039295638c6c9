use std::sync::atomic::{AtomicU8, Ordering};

use crossbeam::utils::Backoff;

use crate::util::hint::cold;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LazyState {
    /// Signifies this cell is uninitialized
    Uninit = 0,
    /// Signifies somebody is running the initializer right now. Anyone else
    /// who shows up waits for [`LazyState::Init`].
    Initializing = 1,
    /// Signifies this cell is initialized
    Init = 2,
}

impl LazyState {
    fn from_u8(state: u8) -> Self {
        match state {
            0 => LazyState::Uninit,
            1 => LazyState::Initializing,
            _ => LazyState::Init,
        }
    }
}

/// A run-once flag that lets you poll its state (including mid-init).
///
/// Unlike `std::sync::Once` this never parks through the allocator, and an
/// all-zero `LazyInit` is a valid, uninitialized one, so it can live in
/// freshly mapped pages.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct LazyInit {
    state: AtomicU8,
}

// SAFETY: all zeroes is `LazyState::Uninit`
unsafe impl bytemuck::Zeroable for LazyInit {}

impl LazyInit {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(LazyState::Uninit as u8),
        }
    }

    pub fn state(&self) -> LazyState {
        LazyState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Run `init` unless it has already run (or is running). Exactly one
    /// caller ever wins; everyone else spins until the winner is done, so
    /// when this returns the initialization is visible.
    ///
    /// Returns `true` if this call ran `init`.
    #[inline]
    pub fn ensure<F: FnOnce()>(&self, init: F) -> bool {
        if self.state.load(Ordering::Acquire) == LazyState::Init as u8 {
            return false;
        }
        cold(|| self.ensure_slow(init))
    }

    fn ensure_slow<F: FnOnce()>(&self, init: F) -> bool {
        match self.state.compare_exchange(
            LazyState::Uninit as u8,
            LazyState::Initializing as u8,
            Ordering::Acquire,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                init();
                self.state.store(LazyState::Init as u8, Ordering::Release);
                true
            }
            Err(_) => {
                let backoff = Backoff::new();
                while self.state.load(Ordering::Acquire) != LazyState::Init as u8 {
                    backoff.snooze();
                }
                false
            }
        }
    }
}
