//! Diagnostics that are safe to emit from inside an allocator call.
//!
//! Nothing in here touches the heap: messages are formatted into a fixed
//! stack buffer and handed straight to `write(2)`. Stdio is out, since it
//! buffers (and so allocates) behind our back.

use std::{
    fmt::{self, Write},
    os::fd::RawFd,
};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Every diagnostic line starts with this
const PREFIX: &str = "zonelock: ";

/// Longest line we will ever write. Longer messages are truncated.
pub const MAX_LINE: usize = 256;

/// A `fmt::Write` sink backed by a fixed array. Writes past the end are
/// silently dropped rather than reported as errors, so a long message still
/// gets its prefix out.
pub struct StackBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> StackBuf<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn is_truncated(&self) -> bool {
        self.len == N
    }
}

impl<const N: usize> Default for StackBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Write for StackBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let n = s.len().min(N - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// Raw `write(2)` of the whole buffer, retrying on short writes. Errors are
/// dropped, there is nobody left to report them to.
pub fn write_fd(fd: RawFd, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a live slice, valid for `bytes.len()` reads
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if n <= 0 {
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Diagnostics {
    /// Emit non-fatal diagnostics (slot init, contention, reentry). Fatal
    /// messages are always written.
    pub enabled: bool,
    /// The descriptor we write to
    pub fd: RawFd,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            enabled: true,
            fd: libc::STDERR_FILENO,
        }
    }
}

impl Diagnostics {
    pub const fn silent() -> Self {
        Self {
            enabled: false,
            fd: libc::STDERR_FILENO,
        }
    }

    /// Write one line, unconditionally
    pub fn write_line(&self, args: fmt::Arguments<'_>) {
        let mut buf = StackBuf::<MAX_LINE>::new();
        _ = buf.write_str(PREFIX);
        _ = buf.write_fmt(args);
        if buf.is_truncated() {
            // make room for the newline
            buf.len -= 1;
        }
        _ = buf.write_char('\n');
        write_fd(self.fd, buf.as_bytes());
    }

    /// Write one line if diagnostics are enabled. Use [`diag!`] rather than
    /// calling this directly.
    ///
    /// [`diag!`]: crate::diag
    pub fn emit(&self, args: fmt::Arguments<'_>) {
        if self.enabled {
            self.write_line(args);
        }
    }

    /// Report `err` and abort the process. There is no unwinding out of an
    /// allocator entry point, so this is the end of the line for every
    /// error the interposer cannot hand back to a caller.
    #[cold]
    pub fn fatal(&self, err: &Error) -> ! {
        self.write_line(format_args!("fatal: {err}"));
        // SAFETY: abort() is always safe to call
        unsafe { libc::abort() }
    }
}

/// Basically `eprintln!()`, but it never allocates and it goes wherever the
/// given [`Diagnostics`] points
#[macro_export]
macro_rules! diag {
    ($diag:expr, $($arg:tt)*) => {
        $diag.emit(format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use std::fmt::Write;

    use super::{StackBuf, MAX_LINE};

    #[test]
    fn stack_buf_collects_formatted_output() {
        let mut buf = StackBuf::<32>::new();
        write!(buf, "slot {} of {}", 3, 16).unwrap();
        assert_eq!(buf.as_bytes(), b"slot 3 of 16");
        assert!(!buf.is_truncated());
    }

    #[test]
    fn stack_buf_truncates_instead_of_failing() {
        let mut buf = StackBuf::<8>::new();
        write!(buf, "{}", "a rather long message").unwrap();
        assert_eq!(buf.as_bytes(), b"a rather");
        assert!(buf.is_truncated());
    }

    #[test]
    fn max_line_fits_a_typical_error() {
        let mut buf = StackBuf::<MAX_LINE>::new();
        write!(
            buf,
            "zonelock: fatal: thread identity {} exceeds lock table capacity {}",
            u64::MAX,
            usize::MAX
        )
        .unwrap();
        assert!(!buf.is_truncated());
    }
}
