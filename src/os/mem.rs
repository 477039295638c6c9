use std::ptr::{self, NonNull};

use bytemuck::Zeroable;
use libc::{
    mmap, mprotect, munmap, EACCES, EAGAIN, EBADF, EINVAL, ENFILE, ENOMEM, MAP_ANONYMOUS,
    MAP_NORESERVE, MAP_PRIVATE, PROT_READ, PROT_WRITE,
};
use once_cell::sync::Lazy;

use crate::{
    error::{Error, Result},
    util::{
        hint::cold,
        num::{round_down, round_up},
    },
};

pub static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

/// A short name for the current `errno`, without going anywhere near the
/// allocator
pub fn errno_name() -> &'static str {
    // SAFETY: `__errno_location()` always returns a valid thread-local pointer
    match unsafe { *libc::__errno_location() } {
        ENOMEM => "ENOMEM", // It's basically just this one
        EACCES => "EACCES",
        EAGAIN => "EAGAIN",
        EBADF => "EBADF",
        EINVAL => "EINVAL",
        ENFILE => "ENFILE",
        _ => "unknown",
    }
}

/// The page-aligned span `(start, len)` covering `len` bytes at `addr`.
/// A table that straddles a page boundary covers two pages.
pub fn page_span(addr: usize, len: usize) -> (usize, usize) {
    let start = round_down(addr, *PAGE_SIZE);
    let end = round_up(addr + len, *PAGE_SIZE);
    (start, end - start)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protection {
    ReadOnly,
    ReadWrite,
}

impl Protection {
    const fn flags(self) -> libc::c_int {
        match self {
            Protection::ReadOnly => PROT_READ,
            Protection::ReadWrite => PROT_READ | PROT_WRITE,
        }
    }
}

/// `mprotect()` every page touched by `[addr, addr + len)`
///
/// # Safety
///
/// - Every page in the span must be mapped and must not hold anything that
///   somebody else expects to stay writable (e.g. a heap page) when
///   `prot` is [`Protection::ReadOnly`].
pub unsafe fn protect(addr: usize, len: usize, prot: Protection) -> Result<()> {
    let (start, span) = page_span(addr, len);
    // SAFETY: Passed on to the caller
    if unsafe { mprotect(start as *mut _, span, prot.flags()) } != 0 {
        return cold(|| {
            Err(Error::ProtectionChange {
                addr: start,
                len: span,
                errno: errno_name(),
            })
        });
    }
    Ok(())
}

/// Anonymous pages straight from the kernel. We need this for anything the
/// interposer owns, because the allocator might be the very thing we are
/// wrapping.
pub struct MmapRegion {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: The region is plain memory, and whoever hands out references into
// it is responsible for synchronising them
unsafe impl Send for MmapRegion {}
// SAFETY: As above
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// `mmap()` a read/write, page-aligned, zero-filled arena of memory of
    /// `size` bytes (or more -- the resulting arena is always a whole number
    /// of pages). This is guaranteed to map at least 1 page.
    pub fn map_noreserve(size: usize) -> Result<MmapRegion> {
        let size = round_up(size.max(1), *PAGE_SIZE);
        // SAFETY: An anonymous private mapping at a kernel-chosen address
        // cannot alias anything we own
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_NORESERVE | MAP_ANONYMOUS | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            // super duper unlikely
            return cold(|| {
                Err(Error::MapFailed {
                    len: size,
                    errno: errno_name(),
                })
            });
        }
        let ptr = NonNull::new(ptr.cast()).ok_or(Error::MapFailed {
            len: size,
            errno: "EINVAL",
        })?;
        Ok(MmapRegion { ptr, size })
    }

    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    /// View the start of the region as `count` zeroed `T`s
    ///
    /// # Panics
    ///
    /// - If `count` `T`s don't fit, or `T` needs more than page alignment
    pub fn zeroed_slots<T: Zeroable>(&self, count: usize) -> NonNull<T> {
        assert!(count * std::mem::size_of::<T>() <= self.size);
        assert!(std::mem::align_of::<T>() <= *PAGE_SIZE);
        // Fresh anonymous pages are zero-filled, and `T: Zeroable` says that
        // is a valid `T`
        self.ptr.cast()
    }

    /// Give up ownership without unmapping
    pub fn into_raw(self) -> NonNull<u8> {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }

    /// # Safety
    ///
    /// - `ptr` and `size` must come from a region that was previously leaked
    ///   with [`MmapRegion::into_raw()`], and must not be owned elsewhere
    pub unsafe fn from_raw(ptr: NonNull<u8>, size: usize) -> Self {
        Self {
            ptr,
            size: round_up(size.max(1), *PAGE_SIZE),
        }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY:
        // - The address addr must be a multiple of the page size (but length
        //   need not be). This is guaranteed true because we can only construct
        //   this region as page-aligned
        // - All pages containing a part of the indicated range are unmapped.
        //   This is fine, because we requested a region of at least `self.size`
        //   bytes and never handed ownership to anyone else.
        unsafe {
            munmap(self.ptr.as_ptr().cast(), self.size);
        }
    }
}
