//! The interposer: a lock registry plus the policies that say what to do when
//! things go wrong inside an allocator call.

use std::ffi::c_void;

use crate::{
    config::{FailurePolicy, InterposerConfig},
    error::{Error, Result},
    lock::LockRegistry,
    os::thread::ThreadIdentity,
    util::print::Diagnostics,
    zone::Operation,
};

pub mod entry;

pub struct Interposer {
    registry: LockRegistry,
    config: InterposerConfig,
}

impl Interposer {
    pub fn new(config: InterposerConfig) -> Result<Self> {
        let registry = LockRegistry::new(config.capacity, config.reentrancy, config.diagnostics)?;
        Ok(Self { registry, config })
    }

    /// [`Interposer::new()`] with [`InterposerConfig::from_env()`]
    pub fn from_env() -> Result<Self> {
        Self::new(InterposerConfig::from_env()?)
    }

    /// Entry points can be called at any time from any thread, for as long
    /// as the process lives, so an installed interposer has to live that
    /// long too
    pub fn leak(self) -> &'static Self {
        Box::leak(Box::new(self))
    }

    pub fn registry(&self) -> &LockRegistry {
        &self.registry
    }

    pub fn config(&self) -> &InterposerConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        self.registry.diagnostics()
    }

    /// Run `f` holding the calling thread's slot. Not getting the slot
    /// (identity out of range, refused reentry, no memory for the segment)
    /// is fatal, since the caller is an allocator entry point with no way to
    /// report it.
    #[inline]
    pub fn serialize<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = match self.registry.acquire(ThreadIdentity::current()) {
            Ok(guard) => guard,
            Err(err) => self.diagnostics().fatal(&err),
        };
        f()
    }

    /// Apply the failure policy to what `op` returned for a `size` byte
    /// request. Null for an empty request is allowed (`realloc(p, 0)` frees).
    #[inline]
    pub fn check_allocation(&self, ptr: *mut c_void, op: Operation, size: usize) -> *mut c_void {
        if ptr.is_null()
            && size != 0
            && self.config.on_allocation_failure == FailurePolicy::Abort
        {
            self.diagnostics()
                .fatal(&Error::ResourceExhausted { op, size });
        }
        ptr
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use super::*;
    use crate::lock::Capacity;

    #[test]
    fn serialize_holds_the_slot_for_the_duration() {
        let interposer = Interposer::new(InterposerConfig::default()).unwrap();
        let index = interposer
            .registry()
            .index_of(ThreadIdentity::current())
            .unwrap();
        let inside =
            interposer.serialize(|| interposer.registry().peek(index).unwrap().is_locked());
        assert!(inside);
        assert!(!interposer.registry().peek(index).unwrap().is_locked());
    }

    #[test]
    fn nested_serialize_reenters() {
        let interposer = Interposer::new(InterposerConfig::default()).unwrap();
        let depth = interposer.serialize(|| {
            interposer.serialize(|| {
                let index = interposer
                    .registry()
                    .index_of(ThreadIdentity::current())
                    .unwrap();
                interposer.registry().peek(index).unwrap().depth()
            })
        });
        assert_eq!(depth, 2);
        assert_eq!(interposer.registry().stats().reentries, 1);
    }

    #[test]
    fn propagate_hands_null_back() {
        let config = InterposerConfig {
            on_allocation_failure: FailurePolicy::Propagate,
            ..InterposerConfig::default()
        };
        let interposer = Interposer::new(config).unwrap();
        assert!(interposer
            .check_allocation(ptr::null_mut(), Operation::Malloc, 16)
            .is_null());
    }

    #[test]
    fn empty_requests_may_return_null() {
        let interposer = Interposer::new(InterposerConfig::default()).unwrap();
        assert!(interposer
            .check_allocation(ptr::null_mut(), Operation::Realloc, 0)
            .is_null());
    }

    #[test]
    fn bad_capacity_is_reported_at_construction() {
        let config = InterposerConfig {
            capacity: Capacity::Bounded(0),
            ..InterposerConfig::default()
        };
        assert!(matches!(Interposer::new(config), Err(Error::InvalidCapacity(0))));
    }
}
