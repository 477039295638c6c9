//! Zone entry points that forward to the C library's allocator

use std::{
    ffi::c_void,
    mem::size_of,
    ptr,
};

use super::{Zone, ZoneOps};
use crate::os::mem::PAGE_SIZE;

unsafe extern "C" fn malloc(_: *mut Zone, size: usize) -> *mut c_void {
    unsafe { libc::malloc(size) }
}

unsafe extern "C" fn calloc(_: *mut Zone, count: usize, size: usize) -> *mut c_void {
    unsafe { libc::calloc(count, size) }
}

unsafe extern "C" fn valloc(zone: *mut Zone, size: usize) -> *mut c_void {
    unsafe { memalign(zone, *PAGE_SIZE, size) }
}

unsafe extern "C" fn realloc(_: *mut Zone, ptr: *mut c_void, size: usize) -> *mut c_void {
    unsafe { libc::realloc(ptr, size) }
}

unsafe extern "C" fn free(_: *mut Zone, ptr: *mut c_void) {
    unsafe { libc::free(ptr) }
}

unsafe extern "C" fn memalign(_: *mut Zone, alignment: usize, size: usize) -> *mut c_void {
    // posix_memalign() wants at least pointer alignment
    let alignment = alignment.max(size_of::<*mut c_void>());
    let mut out = ptr::null_mut();
    match unsafe { libc::posix_memalign(&mut out, alignment, size) } {
        0 => out,
        _ => ptr::null_mut(),
    }
}

unsafe extern "C" fn free_definite_size(_: *mut Zone, ptr: *mut c_void, _: usize) {
    unsafe { libc::free(ptr) }
}

/// glibc can't say how much it gave back, only whether it gave back anything
unsafe extern "C" fn pressure_relief(_: *mut Zone, goal: usize) -> usize {
    #[cfg(target_env = "gnu")]
    unsafe {
        libc::malloc_trim(goal);
    }
    #[cfg(not(target_env = "gnu"))]
    let _ = goal;
    0
}

unsafe extern "C" fn try_free_default(_: *mut Zone, ptr: *mut c_void) {
    unsafe { libc::free(ptr) }
}

/// The libc-backed slots. There is no `claimed_address`: libc has no way to
/// ask whether an arbitrary pointer is one of its own.
pub fn ops() -> ZoneOps {
    ZoneOps {
        malloc: Some(malloc),
        calloc: Some(calloc),
        valloc: Some(valloc),
        realloc: Some(realloc),
        free: Some(free),
        memalign: Some(memalign),
        free_definite_size: Some(free_definite_size),
        pressure_relief: Some(pressure_relief),
        claimed_address: None,
        try_free_default: Some(try_free_default),
    }
}
