use std::{
    ffi::{c_int, c_void, CStr},
    ptr::{self, NonNull},
};

use super::{system, Zone, ZoneOps, ZONE_VERSION};
use crate::{
    error::Result,
    os::mem::{protect, MmapRegion, Protection},
    patch,
};

/// A [`Zone`] that lives alone in its own read-only page, like the zones a
/// real malloc hands out. The page is only ever made writable by the patcher,
/// for as long as it takes to swap the slots.
///
/// The call-through methods load the slot from the live table every time, so
/// they go wherever the table currently points.
pub struct ZonePage {
    region: MmapRegion,
    zone: NonNull<Zone>,
}

// SAFETY: the zone is only mutated by the patcher, inside a protection
// window, and the entry points it points at must be callable from any thread
unsafe impl Send for ZonePage {}
// SAFETY: As above
unsafe impl Sync for ZonePage {}

impl ZonePage {
    /// Map a page, write a [`Zone`] into it and seal it read-only.
    ///
    /// # Safety
    ///
    /// - every entry point in `ops` must be sound to call, from any thread,
    ///   with a pointer to this zone and arguments that follow the usual
    ///   malloc contracts
    pub unsafe fn new(name: &'static CStr, version: u32, ops: ZoneOps) -> Result<Self> {
        let region = MmapRegion::map_noreserve(std::mem::size_of::<Zone>())?;
        let zone = region.as_ptr().cast::<Zone>();
        // SAFETY: the region is at least one fresh, writable, page-aligned
        // page, which is plenty for a `Zone`
        unsafe {
            zone.write(Zone {
                version,
                name: name.as_ptr(),
                ops,
            })
        };
        // SAFETY: the page is ours and holds nothing but the zone
        unsafe { protect(zone as usize, std::mem::size_of::<Zone>(), Protection::ReadOnly)? };
        Ok(Self {
            region,
            // SAFETY: came out of a `NonNull` region
            zone: unsafe { NonNull::new_unchecked(zone) },
        })
    }

    /// A zone that hands everything to the C library's allocator
    pub fn system() -> Result<Self> {
        // SAFETY: the libc shims only forward to malloc and friends
        unsafe { Self::new(c"DefaultMallocZone", ZONE_VERSION, system::ops()) }
    }

    pub const fn as_ptr(&self) -> NonNull<Zone> {
        self.zone
    }

    /// Bytes mapped for the zone (always whole pages)
    pub const fn mapped_len(&self) -> usize {
        self.region.size()
    }

    pub fn version(&self) -> u32 {
        // SAFETY: the zone lives as long as `self`
        unsafe { Zone::version_of(self.zone) }
    }

    pub fn name(&self) -> &CStr {
        // SAFETY: the name is a `&'static CStr`, and the patcher never
        // rewrites it
        unsafe { CStr::from_ptr((*self.zone.as_ptr()).name) }
    }

    /// The slots as they are right now
    pub fn ops(&self) -> ZoneOps {
        // SAFETY: the zone lives as long as `self`
        unsafe { Zone::read_ops(self.zone) }
    }

    /// `true` if the slots currently point at the interposer
    pub fn is_instrumented(&self) -> bool {
        patch::is_instrumented(&self.ops())
    }

    fn raw(&self) -> *mut Zone {
        self.zone.as_ptr()
    }

    /// Allocate `size` bytes. Null if the zone has no `malloc`.
    pub fn malloc(&self, size: usize) -> *mut c_void {
        match self.ops().malloc {
            // SAFETY: the constructor's contract
            Some(f) => unsafe { f(self.raw(), size) },
            None => ptr::null_mut(),
        }
    }

    pub fn calloc(&self, count: usize, size: usize) -> *mut c_void {
        match self.ops().calloc {
            // SAFETY: the constructor's contract
            Some(f) => unsafe { f(self.raw(), count, size) },
            None => ptr::null_mut(),
        }
    }

    pub fn valloc(&self, size: usize) -> *mut c_void {
        match self.ops().valloc {
            // SAFETY: the constructor's contract
            Some(f) => unsafe { f(self.raw(), size) },
            None => ptr::null_mut(),
        }
    }

    pub fn memalign(&self, alignment: usize, size: usize) -> *mut c_void {
        match self.ops().memalign {
            // SAFETY: the constructor's contract
            Some(f) => unsafe { f(self.raw(), alignment, size) },
            None => ptr::null_mut(),
        }
    }

    /// Bytes given back to the system. 0 if the zone has no
    /// `pressure_relief`.
    pub fn pressure_relief(&self, goal: usize) -> usize {
        match self.ops().pressure_relief {
            // SAFETY: the constructor's contract
            Some(f) => unsafe { f(self.raw(), goal) },
            None => 0,
        }
    }

    /// # Safety
    ///
    /// - `ptr` must be null or a live allocation from this zone
    pub unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        match self.ops().realloc {
            // SAFETY: the constructor's contract plus the caller's
            Some(f) => unsafe { f(self.raw(), ptr, size) },
            None => ptr::null_mut(),
        }
    }

    /// # Safety
    ///
    /// - `ptr` must be null or a live allocation from this zone
    pub unsafe fn free(&self, ptr: *mut c_void) {
        if let Some(f) = self.ops().free {
            // SAFETY: the constructor's contract plus the caller's
            unsafe { f(self.raw(), ptr) }
        }
    }

    /// # Safety
    ///
    /// - `ptr` must be a live allocation from this zone of `size` bytes
    pub unsafe fn free_definite_size(&self, ptr: *mut c_void, size: usize) {
        if let Some(f) = self.ops().free_definite_size {
            // SAFETY: the constructor's contract plus the caller's
            unsafe { f(self.raw(), ptr, size) }
        }
    }

    /// # Safety
    ///
    /// - `ptr` must be safe to hand to the zone's `claimed_address`. Real
    ///   zones accept any pointer, but that is up to the zone.
    pub unsafe fn claimed_address(&self, ptr: *mut c_void) -> bool {
        match self.ops().claimed_address {
            // SAFETY: the constructor's contract plus the caller's
            Some(f) => unsafe { f(self.raw(), ptr) != c_int::from(false) },
            None => false,
        }
    }

    /// # Safety
    ///
    /// - `ptr` must be null or a live allocation from this zone
    pub unsafe fn try_free_default(&self, ptr: *mut c_void) {
        if let Some(f) = self.ops().try_free_default {
            // SAFETY: the constructor's contract plus the caller's
            unsafe { f(self.raw(), ptr) }
        }
    }
}

impl Drop for ZonePage {
    fn drop(&mut self) {
        // The address is about to go back to the kernel; a binding left
        // behind would be picked up by whatever gets mapped there next.
        patch::forget(self.zone);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_is_sealed_with_the_given_slots() {
        let page = ZonePage::system().unwrap();
        assert_eq!(page.version(), ZONE_VERSION);
        assert_eq!(page.name(), c"DefaultMallocZone");
        assert_eq!(page.ops(), system::ops());
        assert!(!page.is_instrumented());
        assert!(page.mapped_len() >= std::mem::size_of::<Zone>());
        assert_eq!(page.mapped_len() % *crate::os::mem::PAGE_SIZE, 0);
    }

    #[test]
    fn system_zone_allocates_through_libc() {
        let page = ZonePage::system().unwrap();
        let p = page.malloc(64);
        assert!(!p.is_null());
        unsafe {
            p.cast::<u8>().write_bytes(0xab, 64);
            let p = page.realloc(p, 128);
            assert!(!p.is_null());
            assert_eq!(p.cast::<u8>().add(63).read(), 0xab);
            page.free_definite_size(p, 128);
        }

        let z = page.calloc(4, 16);
        assert!(unsafe { std::slice::from_raw_parts(z.cast::<u8>(), 64) }
            .iter()
            .all(|&b| b == 0));
        unsafe { page.free(z) };

        let a = page.memalign(256, 10);
        assert_eq!(a as usize % 256, 0);
        unsafe { page.try_free_default(a) };

        let v = page.valloc(10);
        assert_eq!(v as usize % *crate::os::mem::PAGE_SIZE, 0);
        unsafe { page.free(v) };
    }
}
