//! The functions that go into an instrumented zone's slots.
//!
//! Each one finds the zone's binding, takes the calling thread's slot, calls
//! the original entry point with the same zone and arguments, releases the
//! slot and (for allocating calls) applies the failure policy.

use std::ffi::{c_int, c_void};

use crate::{
    error::Error,
    interpose::Interposer,
    patch::binding,
    util::print::Diagnostics,
    zone::{
        CallocFn, ClaimedAddressFn, FreeDefiniteSizeFn, FreeFn, MallocFn, MemalignFn,
        Operation, PressureReliefFn, ReallocFn, TryFreeDefaultFn, VallocFn, Zone, ZoneOps,
    },
};

/// The interposer and original entry points for `zone`. A zone with no
/// binding means somebody copied our pointers into a table we never
/// instrumented, and there is nothing sensible to call.
///
/// With no binding there is no interposer either, so that fatal message
/// goes to stderr through `Diagnostics::default()`, whatever `fd` was
/// configured.
#[inline]
fn bound(zone: *mut Zone) -> (&'static Interposer, ZoneOps) {
    binding::lookup(zone)
        .and_then(|b| Some((b.interposer()?, b.original())))
        .unwrap_or_else(|| {
            Diagnostics::default().fatal(&Error::UnboundZone {
                zone: zone as usize,
            })
        })
}

#[cold]
fn missing(interposer: &Interposer, op: Operation) -> ! {
    interposer
        .diagnostics()
        .fatal(&Error::MissingEntryPoint(op))
}

macro_rules! original {
    ($interposer:expr, $ops:expr, $op:ident, $variant:ident) => {
        match $ops.$op {
            Some(f) => f,
            None => missing($interposer, Operation::$variant),
        }
    };
}

pub unsafe extern "C" fn malloc(zone: *mut Zone, size: usize) -> *mut c_void {
    let (interposer, ops) = bound(zone);
    let f = original!(interposer, ops, malloc, Malloc);
    // SAFETY: same arguments the caller gave us, same zone
    let ptr = interposer.serialize(|| unsafe { f(zone, size) });
    interposer.check_allocation(ptr, Operation::Malloc, size)
}

pub unsafe extern "C" fn calloc(zone: *mut Zone, count: usize, size: usize) -> *mut c_void {
    let (interposer, ops) = bound(zone);
    let f = original!(interposer, ops, calloc, Calloc);
    // SAFETY: as above
    let ptr = interposer.serialize(|| unsafe { f(zone, count, size) });
    // an overflowing request can't be empty
    let total = count.checked_mul(size).unwrap_or(usize::MAX);
    interposer.check_allocation(ptr, Operation::Calloc, total)
}

pub unsafe extern "C" fn valloc(zone: *mut Zone, size: usize) -> *mut c_void {
    let (interposer, ops) = bound(zone);
    let f = original!(interposer, ops, valloc, Valloc);
    // SAFETY: as above
    let ptr = interposer.serialize(|| unsafe { f(zone, size) });
    interposer.check_allocation(ptr, Operation::Valloc, size)
}

pub unsafe extern "C" fn realloc(zone: *mut Zone, ptr: *mut c_void, size: usize) -> *mut c_void {
    let (interposer, ops) = bound(zone);
    let f = original!(interposer, ops, realloc, Realloc);
    // SAFETY: as above
    let ptr = interposer.serialize(|| unsafe { f(zone, ptr, size) });
    interposer.check_allocation(ptr, Operation::Realloc, size)
}

pub unsafe extern "C" fn free(zone: *mut Zone, ptr: *mut c_void) {
    let (interposer, ops) = bound(zone);
    let f = original!(interposer, ops, free, Free);
    // SAFETY: as above
    interposer.serialize(|| unsafe { f(zone, ptr) })
}

pub unsafe extern "C" fn memalign(zone: *mut Zone, alignment: usize, size: usize) -> *mut c_void {
    let (interposer, ops) = bound(zone);
    let f = original!(interposer, ops, memalign, Memalign);
    // SAFETY: as above
    let ptr = interposer.serialize(|| unsafe { f(zone, alignment, size) });
    interposer.check_allocation(ptr, Operation::Memalign, size)
}

pub unsafe extern "C" fn free_definite_size(zone: *mut Zone, ptr: *mut c_void, size: usize) {
    let (interposer, ops) = bound(zone);
    let f = original!(interposer, ops, free_definite_size, FreeDefiniteSize);
    // SAFETY: as above
    interposer.serialize(|| unsafe { f(zone, ptr, size) })
}

pub unsafe extern "C" fn pressure_relief(zone: *mut Zone, goal: usize) -> usize {
    let (interposer, ops) = bound(zone);
    let f = original!(interposer, ops, pressure_relief, PressureRelief);
    // SAFETY: as above
    interposer.serialize(|| unsafe { f(zone, goal) })
}

pub unsafe extern "C" fn claimed_address(zone: *mut Zone, ptr: *mut c_void) -> c_int {
    let (interposer, ops) = bound(zone);
    let f = original!(interposer, ops, claimed_address, ClaimedAddress);
    // SAFETY: as above
    interposer.serialize(|| unsafe { f(zone, ptr) })
}

pub unsafe extern "C" fn try_free_default(zone: *mut Zone, ptr: *mut c_void) {
    let (interposer, ops) = bound(zone);
    let f = original!(interposer, ops, try_free_default, TryFreeDefault);
    // SAFETY: as above
    interposer.serialize(|| unsafe { f(zone, ptr) })
}

/// Every entry point we have
pub fn entry_points() -> ZoneOps {
    ZoneOps {
        malloc: Some(malloc as MallocFn),
        calloc: Some(calloc as CallocFn),
        valloc: Some(valloc as VallocFn),
        realloc: Some(realloc as ReallocFn),
        free: Some(free as FreeFn),
        memalign: Some(memalign as MemalignFn),
        free_definite_size: Some(free_definite_size as FreeDefiniteSizeFn),
        pressure_relief: Some(pressure_relief as PressureReliefFn),
        claimed_address: Some(claimed_address as ClaimedAddressFn),
        try_free_default: Some(try_free_default as TryFreeDefaultFn),
    }
}

/// Our entry points for the slots that `original` fills. An absent slot
/// stays absent, since callers check for it before calling.
pub fn instrumented_ops(original: &ZoneOps) -> ZoneOps {
    let ours = entry_points();
    ZoneOps {
        malloc: original.malloc.and(ours.malloc),
        calloc: original.calloc.and(ours.calloc),
        valloc: original.valloc.and(ours.valloc),
        realloc: original.realloc.and(ours.realloc),
        free: original.free.and(ours.free),
        memalign: original.memalign.and(ours.memalign),
        free_definite_size: original.free_definite_size.and(ours.free_definite_size),
        pressure_relief: original.pressure_relief.and(ours.pressure_relief),
        claimed_address: original.claimed_address.and(ours.claimed_address),
        try_free_default: original.try_free_default.and(ours.try_free_default),
    }
}
