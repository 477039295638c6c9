//! Which interposer (and which original entry points) belong to which zone.
//!
//! The entry points only get the zone pointer, so they find their way back
//! here by address. The table is a fixed static array, so a lookup never
//! allocates and never takes a lock.

use std::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering},
};

use crate::{
    error::{Error, Result},
    interpose::Interposer,
    lock::futex::RawLock,
    zone::{Zone, ZoneOps},
};

/// Most zones that can be instrumented at once
pub const MAX_BINDINGS: usize = 64;

const FREE: u8 = 0;
const CLAIMED: u8 = 1;
const READY: u8 = 2;

pub struct Binding {
    state: AtomicU8,
    zone: AtomicUsize,
    original: [AtomicUsize; 10],
    interposer: AtomicPtr<Interposer>,
}

impl Binding {
    const fn new() -> Self {
        Self {
            state: AtomicU8::new(FREE),
            zone: AtomicUsize::new(0),
            original: [const { AtomicUsize::new(0) }; 10],
            interposer: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The entry points the zone had before it was instrumented
    #[inline]
    pub fn original(&self) -> ZoneOps {
        let addresses = std::array::from_fn(|i| self.original[i].load(Ordering::Acquire));
        // SAFETY: only ever stored from a real `ZoneOps` in `publish()`
        unsafe { ZoneOps::from_addresses(addresses) }
    }

    #[inline]
    pub fn interposer(&self) -> Option<&'static Interposer> {
        // SAFETY: only ever stored from a `&'static Interposer`
        unsafe { self.interposer.load(Ordering::Acquire).as_ref() }
    }

    fn holds(&self, zone: NonNull<Zone>) -> bool {
        self.state.load(Ordering::Acquire) != FREE
            && self.zone.load(Ordering::Acquire) == zone.as_ptr() as usize
    }

    /// Store everything an entry point needs, then flip to `READY`. The
    /// release on `state` is what makes the rest visible to `lookup()`.
    fn publish(&self, original: &ZoneOps, interposer: &'static Interposer) {
        for (slot, addr) in self.original.iter().zip(original.addresses()) {
            slot.store(addr, Ordering::Release);
        }
        self.interposer
            .store(ptr::from_ref(interposer).cast_mut(), Ordering::Release);
        self.state.store(READY, Ordering::Release);
    }

    fn clear(&self) {
        self.interposer.store(ptr::null_mut(), Ordering::Release);
        self.zone.store(0, Ordering::Release);
        self.state.store(FREE, Ordering::Release);
    }
}

static BINDINGS: [Binding; MAX_BINDINGS] = [const { Binding::new() }; MAX_BINDINGS];

/// Installs and restores take this, so only one of them is ever rewriting
/// the table (or any zone) at a time
static PATCH_LOCK: RawLock = RawLock::new();

pub struct PatchGuard(());

impl Drop for PatchGuard {
    fn drop(&mut self) {
        PATCH_LOCK.unlock();
    }
}

pub fn patch_lock() -> PatchGuard {
    PATCH_LOCK.lock();
    PatchGuard(())
}

/// The published binding for `zone`, if any
#[inline]
pub fn lookup(zone: *mut Zone) -> Option<&'static Binding> {
    let addr = zone as usize;
    BINDINGS.iter().find(|b| {
        b.state.load(Ordering::Acquire) == READY && b.zone.load(Ordering::Acquire) == addr
    })
}

/// Bind `zone` to `interposer` with `original` as its snapshot, reusing the
/// zone's existing binding if it has one. Must hold the [`patch_lock()`].
pub fn bind(
    _guard: &PatchGuard,
    zone: NonNull<Zone>,
    original: &ZoneOps,
    interposer: &'static Interposer,
) -> Result<&'static Binding> {
    let binding = match BINDINGS.iter().find(|b| b.holds(zone)) {
        Some(binding) => binding,
        None => BINDINGS
            .iter()
            .find(|b| {
                b.state
                    .compare_exchange(FREE, CLAIMED, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            })
            .ok_or(Error::BindingsExhausted(MAX_BINDINGS))?,
    };
    binding
        .zone
        .store(zone.as_ptr() as usize, Ordering::Release);
    binding.publish(original, interposer);
    Ok(binding)
}

/// Drop `zone`'s binding, if it has one. Entry points still running for the
/// zone will die on [`Error::UnboundZone`], so this is only for zones that
/// were never (or are no longer) pointing at them.
pub fn unbind(zone: NonNull<Zone>) {
    if let Some(binding) = BINDINGS.iter().find(|b| b.holds(zone)) {
        binding.clear();
    }
}
