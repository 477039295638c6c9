use thiserror::Error;

use crate::zone::Operation;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while installing or running the interposer.
///
/// `Display` never allocates for any variant except [`Error::Config`], so an
/// error can be reported from inside an allocator entry point.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unsupported zone version {found}")]
    UnsupportedVersion { found: u32 },

    #[error("thread identity {identity} exceeds lock table capacity {capacity}")]
    IdentitySpaceExhausted { identity: u64, capacity: usize },

    #[error("invalid lock table capacity {0}")]
    InvalidCapacity(usize),

    #[error("mprotect({addr:#x}, {len}) failed: {errno}")]
    ProtectionChange {
        addr: usize,
        len: usize,
        errno: &'static str,
    },

    #[error("mmap({len}) failed: {errno}")]
    MapFailed { len: usize, errno: &'static str },

    #[error("{op} failed to allocate {size} bytes")]
    ResourceExhausted { op: Operation, size: usize },

    #[error("reentrant call from thread {identity} on slot {slot}")]
    ReentrantCall { identity: u64, slot: usize },

    #[error("no free zone bindings (limit {0})")]
    BindingsExhausted(usize),

    #[error("zone {zone:#x} was never instrumented")]
    UnboundZone { zone: usize },

    #[error("zone {zone:#x} is not instrumented")]
    NotInstalled { zone: usize },

    #[error("original zone has no {0} entry point")]
    MissingEntryPoint(Operation),

    #[error("host has no zone to patch")]
    NoZone,

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}
