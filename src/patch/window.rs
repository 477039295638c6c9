use std::ptr::NonNull;

use crate::{
    error::Result,
    os::mem::{protect, Protection},
    zone::Zone,
};

/// The zone's pages, made writable for as long as this lives.
///
/// [`WriteWindow::close()`] seals the pages again and reports whether that
/// worked. Dropping an open window (say on an early return) also seals them,
/// but any error is lost.
pub struct WriteWindow {
    addr: usize,
    len: usize,
    open: bool,
}

impl WriteWindow {
    /// # Safety
    ///
    /// - `zone` must point to a live [`Zone`] whose pages hold nothing that
    ///   must stay writable once the window is closed
    pub unsafe fn open(zone: NonNull<Zone>) -> Result<Self> {
        let addr = zone.as_ptr() as usize;
        let len = std::mem::size_of::<Zone>();
        // SAFETY: passed to the caller
        unsafe { protect(addr, len, Protection::ReadWrite)? };
        Ok(Self {
            addr,
            len,
            open: true,
        })
    }

    pub fn close(mut self) -> Result<()> {
        self.open = false;
        // SAFETY: `open()`'s contract
        unsafe { protect(self.addr, self.len, Protection::ReadOnly) }
    }
}

impl Drop for WriteWindow {
    fn drop(&mut self) {
        if self.open {
            // SAFETY: `open()`'s contract
            if let Err(err) = unsafe { protect(self.addr, self.len, Protection::ReadOnly) } {
                log::warn!("zone at {:#x} left writable: {err}", self.addr);
            }
        }
    }
}
