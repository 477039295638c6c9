//! The table of per-thread locks.
//!
//! Slots live in segments of [`SEGMENT_SLOTS`] that are `mmap()`ed the first
//! time any thread lands in them, so the table covers the whole Linux thread
//! id space (`pid_max` tops out at 2^22) while only paying for segments that
//! are actually used. Segments never go through the allocator, which matters
//! because the allocator is usually what we are serialising.

use std::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};

use super::slot::{LockOutcome, ReentrancyPolicy, ThreadSlot};
use crate::{
    diag,
    error::{Error, Result},
    os::{mem::MmapRegion, thread::ThreadIdentity},
    util::{hint::cold, print::Diagnostics},
};

/// Slots per lazily mapped segment
pub const SEGMENT_SLOTS: usize = 4096;

/// Bytes per segment
const SEGMENT_BYTES: usize = SEGMENT_SLOTS * std::mem::size_of::<ThreadSlot>();

/// Maximum number of segments
pub const DIRECTORY_LEN: usize = 1024;

/// The most slots a registry can ever have
pub const MAX_IDENTITIES: usize = SEGMENT_SLOTS * DIRECTORY_LEN;

/// How thread identities are reduced onto slots
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capacity {
    /// `identity % n`. Two threads may share a slot; they then just take
    /// turns.
    Wrapping(usize),
    /// `identity` itself, and an identity `>= n` is
    /// [`Error::IdentitySpaceExhausted`]
    Bounded(usize),
}

impl Capacity {
    pub const fn slots(self) -> usize {
        match self {
            Capacity::Wrapping(n) | Capacity::Bounded(n) => n,
        }
    }
}

impl Default for Capacity {
    fn default() -> Self {
        Capacity::Wrapping(MAX_IDENTITIES)
    }
}

#[derive(Default)]
struct Counters {
    initialized_slots: AtomicUsize,
    reentries: AtomicUsize,
    contentions: AtomicUsize,
}

/// A snapshot of the registry's slow-path counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Slots that have been through their one-time initialization
    pub initialized_slots: usize,
    /// Acquisitions by a thread that already held its slot
    pub reentries: usize,
    /// Acquisitions that found the slot held by another (aliased) thread
    pub contentions: usize,
}

/// Proof that a slot is held. Dropping it releases the slot, so a release
/// happens exactly once per successful [`LockRegistry::acquire()`], on every
/// path out of the caller.
#[must_use = "the slot is released as soon as the guard is dropped"]
pub struct SlotGuard<'a> {
    slot: &'a ThreadSlot,
    index: usize,
}

impl SlotGuard<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// How many acquisitions this thread currently holds on the slot
    pub fn depth(&self) -> u32 {
        self.slot.depth()
    }

    /// Release the slot now rather than at the end of the scope
    pub fn release(self) {}
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slot.unlock();
    }
}

pub struct LockRegistry {
    directory: Box<[AtomicPtr<ThreadSlot>]>,
    capacity: Capacity,
    reentrancy: ReentrancyPolicy,
    diagnostics: Diagnostics,
    stats: CachePadded<Counters>,
}

impl LockRegistry {
    pub fn new(
        capacity: Capacity,
        reentrancy: ReentrancyPolicy,
        diagnostics: Diagnostics,
    ) -> Result<Self> {
        let slots = capacity.slots();
        if slots == 0 || slots > MAX_IDENTITIES {
            return Err(Error::InvalidCapacity(slots));
        }
        let directory = (0..slots.div_ceil(SEGMENT_SLOTS))
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Ok(Self {
            directory,
            capacity,
            reentrancy,
            diagnostics,
            stats: CachePadded::new(Counters::default()),
        })
    }

    pub const fn capacity(&self) -> Capacity {
        self.capacity
    }

    pub const fn reentrancy(&self) -> ReentrancyPolicy {
        self.reentrancy
    }

    pub const fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// The slot index `identity` maps to. This is a pure function of the
    /// identity, so a thread always comes back to the same slot.
    pub fn index_of(&self, identity: ThreadIdentity) -> Result<usize> {
        match self.capacity {
            Capacity::Wrapping(n) => Ok((identity.get() % n as u64) as usize),
            Capacity::Bounded(n) if identity.get() < n as u64 => Ok(identity.get() as usize),
            Capacity::Bounded(n) => cold(|| {
                Err(Error::IdentitySpaceExhausted {
                    identity: identity.get(),
                    capacity: n,
                })
            }),
        }
    }

    /// Lock `identity`'s slot, initializing it first if this is the first
    /// time anyone has landed on it.
    ///
    /// A failed non-blocking attempt means either this thread is re-entering
    /// (handled per [`ReentrancyPolicy`]) or another thread shares the slot.
    /// In the second case the contention is reported first, then we block
    /// until the other thread is done.
    pub fn acquire(&self, identity: ThreadIdentity) -> Result<SlotGuard<'_>> {
        let index = self.index_of(identity)?;
        let slot = self.slot(index)?;

        if slot.ensure_init() {
            self.stats.initialized_slots.fetch_add(1, Ordering::Relaxed);
            diag!(self.diagnostics, "init slot {index} for thread {identity}");
        }

        match slot.try_enter(identity, self.reentrancy) {
            LockOutcome::Acquired => {}
            LockOutcome::WouldBlock => cold(|| {
                self.stats.contentions.fetch_add(1, Ordering::Relaxed);
                diag!(
                    self.diagnostics,
                    "slot {index} contended, thread {identity} waiting"
                );
                slot.wait_enter(identity);
            }),
            LockOutcome::Reentered => cold(|| {
                self.stats.reentries.fetch_add(1, Ordering::Relaxed);
                diag!(
                    self.diagnostics,
                    "reentrant call from thread {identity} on slot {index} (depth {})",
                    slot.depth()
                );
            }),
            LockOutcome::Refused => {
                return cold(|| {
                    Err(Error::ReentrantCall {
                        identity: identity.get(),
                        slot: index,
                    })
                })
            }
        }

        Ok(SlotGuard { slot, index })
    }

    /// Release a slot. Same as dropping the guard.
    pub fn release(&self, guard: SlotGuard<'_>) {
        guard.release();
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            initialized_slots: self.stats.initialized_slots.load(Ordering::Relaxed),
            reentries: self.stats.reentries.load(Ordering::Relaxed),
            contentions: self.stats.contentions.load(Ordering::Relaxed),
        }
    }

    /// Number of segments that have been mapped so far
    pub fn mapped_segments(&self) -> usize {
        self.directory
            .iter()
            .filter(|seg| !seg.load(Ordering::Acquire).is_null())
            .count()
    }

    /// Look at a slot without mapping or initializing anything
    pub fn peek(&self, index: usize) -> Option<&ThreadSlot> {
        let segment = self.directory.get(index / SEGMENT_SLOTS)?;
        let base = segment.load(Ordering::Acquire);
        // SAFETY: a non-null segment holds `SEGMENT_SLOTS` slots and lives
        // as long as `self`
        (!base.is_null()).then(|| unsafe { &*base.add(index % SEGMENT_SLOTS) })
    }

    fn slot(&self, index: usize) -> Result<&ThreadSlot> {
        let segment = &self.directory[index / SEGMENT_SLOTS];
        let mut base = segment.load(Ordering::Acquire);
        if base.is_null() {
            base = cold(|| self.map_segment(segment))?;
        }
        // SAFETY:
        // - `base` points at a live segment of `SEGMENT_SLOTS` zeroable slots
        // - the segment is only unmapped when `self` is dropped, and the
        //   returned reference borrows `self`
        Ok(unsafe { &*base.add(index % SEGMENT_SLOTS) })
    }

    /// Map a fresh segment and publish it. If somebody beats us to it, ours
    /// goes straight back to the kernel and we use theirs.
    fn map_segment(&self, segment: &AtomicPtr<ThreadSlot>) -> Result<*mut ThreadSlot> {
        let region = MmapRegion::map_noreserve(SEGMENT_BYTES)?;
        let fresh = region.zeroed_slots::<ThreadSlot>(SEGMENT_SLOTS).as_ptr();
        match segment.compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                _ = region.into_raw();
                Ok(fresh)
            }
            Err(theirs) => {
                drop(region);
                Ok(theirs)
            }
        }
    }
}

impl Drop for LockRegistry {
    fn drop(&mut self) {
        for segment in self.directory.iter() {
            if let Some(base) = NonNull::new(segment.load(Ordering::Acquire)) {
                // SAFETY: every published segment was leaked from an
                // `MmapRegion` of `SEGMENT_BYTES`, and `&mut self` means no
                // guard can still be pointing into it
                drop(unsafe { MmapRegion::from_raw(base.cast(), SEGMENT_BYTES) });
            }
        }
    }
}
