#![allow(dead_code)]

use std::{
    os::{fd::RawFd, unix::process::ExitStatusExt},
    process::{Command, Output},
};

use zonelock::{Interposer, InterposerConfig};

/// A request size the stub allocators always fail
pub const FAIL_SIZE: usize = 1 << 40;

/// A stub zone with its own counters: `mod $name` gets `malloc`, `free`,
/// `free_definite_size` and a `reentrant_malloc` that calls back into its
/// zone once. Pointers are fake (never dereference them) but unique.
macro_rules! counting_zone {
    (mod $name:ident) => {
        mod $name {
            use std::{
                ffi::c_void,
                ptr::{self, NonNull},
                sync::atomic::{AtomicIsize, AtomicUsize, Ordering},
            };

            use zonelock::{Zone, ZoneOps};

            pub static OUTSTANDING: AtomicIsize = AtomicIsize::new(0);
            pub static CALLS: AtomicUsize = AtomicUsize::new(0);
            static NEXT: AtomicUsize = AtomicUsize::new(1);

            pub unsafe extern "C" fn malloc(_: *mut Zone, size: usize) -> *mut c_void {
                CALLS.fetch_add(1, Ordering::Relaxed);
                if size == $crate::common::FAIL_SIZE {
                    return ptr::null_mut();
                }
                OUTSTANDING.fetch_add(1, Ordering::Relaxed);
                (NEXT.fetch_add(1, Ordering::Relaxed) << 4) as *mut c_void
            }

            /// Allocates the inner block through the zone's live table, so
            /// once instrumented this is a reentrant call
            pub unsafe extern "C" fn reentrant_malloc(zone: *mut Zone, size: usize) -> *mut c_void {
                if size != 0 {
                    let live = unsafe { Zone::read_ops(NonNull::new_unchecked(zone)) };
                    if let Some(inner) = live.malloc {
                        _ = unsafe { inner(zone, 0) };
                    }
                }
                unsafe { malloc(zone, size) }
            }

            pub unsafe extern "C" fn free(_: *mut Zone, ptr: *mut c_void) {
                CALLS.fetch_add(1, Ordering::Relaxed);
                if !ptr.is_null() {
                    OUTSTANDING.fetch_sub(1, Ordering::Relaxed);
                }
            }

            pub unsafe extern "C" fn free_definite_size(_: *mut Zone, ptr: *mut c_void, _: usize) {
                unsafe { free(ptr::null_mut(), ptr) }
            }

            pub fn ops() -> ZoneOps {
                ZoneOps {
                    malloc: Some(malloc),
                    free: Some(free),
                    free_definite_size: Some(free_definite_size),
                    ..ZoneOps::default()
                }
            }

            pub fn reentrant_ops() -> ZoneOps {
                ZoneOps {
                    malloc: Some(reentrant_malloc),
                    ..ops()
                }
            }

            pub fn outstanding() -> isize {
                OUTSTANDING.load(Ordering::Relaxed)
            }

            pub fn calls() -> usize {
                CALLS.load(Ordering::Relaxed)
            }
        }
    };
}

pub fn init_logging() {
    _ = env_logger::builder().is_test(true).try_init();
}

pub fn interposer(config: InterposerConfig) -> &'static Interposer {
    Interposer::new(config).unwrap().leak()
}

/// Set in a re-executed test binary, naming the test that should do the
/// dying
pub const CHILD_ENV: &str = "ZONELOCK_TEST_CHILD";

/// `true` in the child process started by [`run_in_child()`] for `test`
pub fn is_child(test: &str) -> bool {
    std::env::var(CHILD_ENV).as_deref() == Ok(test)
}

/// Re-run just `test` in a fresh copy of this test binary
pub fn run_in_child(test: &str) -> Output {
    Command::new(std::env::current_exe().unwrap())
        .args([test, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, test)
        .output()
        .unwrap()
}

/// Run `test` in a child and check that it died of `SIGABRT` after saying
/// `message`
pub fn assert_aborts_with(test: &str, message: &str) {
    let output = run_in_child(test);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(
        output.status.signal(),
        Some(libc::SIGABRT),
        "{test} exited with {:?}, stderr:\n{stderr}",
        output.status
    );
    assert!(
        stderr.contains(message),
        "{test} stderr does not mention {message:?}:\n{stderr}"
    );
}

/// A pipe to point `Diagnostics::fd` at. Reading never blocks.
pub struct Pipe {
    read: RawFd,
    pub write: RawFd,
}

impl Pipe {
    pub fn new() -> Self {
        let mut fds = [0; 2];
        unsafe {
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
            assert_eq!(libc::fcntl(fds[0], libc::F_SETFL, libc::O_NONBLOCK), 0);
        }
        Self {
            read: fds[0],
            write: fds[1],
        }
    }

    /// Everything written so far
    pub fn drain(&self) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe { libc::read(self.read, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                return String::from_utf8_lossy(&out).into_owned();
            }
            out.extend_from_slice(&buf[..n as usize]);
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read);
            libc::close(self.write);
        }
    }
}
