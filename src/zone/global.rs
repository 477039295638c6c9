use std::{
    alloc::{GlobalAlloc, Layout},
    ffi::c_void,
};

use super::ZonePage;

/// Every zone hands out at least this alignment from plain `malloc()`
pub const ZONE_MIN_ALIGN: usize = 16;

/// Routes Rust allocations through a zone's *live* table, so once the zone is
/// instrumented every `Box` and `Vec` goes through the interposer too.
/// Alignments above [`ZONE_MIN_ALIGN`] go to `memalign()`.
#[derive(Clone, Copy)]
pub struct ZoneAlloc<'a> {
    zone: &'a ZonePage,
}

impl<'a> ZoneAlloc<'a> {
    pub const fn new(zone: &'a ZonePage) -> Self {
        Self { zone }
    }

    pub const fn zone(&self) -> &'a ZonePage {
        self.zone
    }
}

unsafe impl GlobalAlloc for ZoneAlloc<'_> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let data = if layout.align() <= ZONE_MIN_ALIGN {
            self.zone.malloc(layout.size())
        } else {
            self.zone.memalign(layout.align(), layout.size())
        };
        data.cast()
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= ZONE_MIN_ALIGN {
            return self.zone.calloc(1, layout.size()).cast();
        }
        let data = self.zone.memalign(layout.align(), layout.size()).cast::<u8>();
        if !data.is_null() {
            // SAFETY: a fresh allocation of `layout.size()` bytes
            unsafe { data.write_bytes(0, layout.size()) };
        }
        data
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: Identical contract to caller, which is described in
        // `GlobalAlloc` docs
        unsafe {
            if self.zone.ops().free_definite_size.is_some() {
                self.zone
                    .free_definite_size(ptr.cast::<c_void>(), layout.size());
            } else {
                self.zone.free(ptr.cast());
            }
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ZONE_MIN_ALIGN {
            // realloc() only promises malloc alignment, so do it by hand
            // SAFETY: the caller promises `new_size` rounded up to `align`
            // does not overflow
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            let new = unsafe { self.alloc(new_layout) };
            if !new.is_null() {
                // SAFETY: both are live and distinct, and we copy no more than
                // either holds
                unsafe {
                    std::ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
                    self.dealloc(ptr, layout);
                }
            }
            return new;
        }
        // SAFETY: `ptr` came from this zone, per the caller
        unsafe { self.zone.realloc(ptr.cast(), new_size).cast() }
    }
}
