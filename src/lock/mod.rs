//! Per-thread locks and the registry that hands them out

pub mod futex;
pub mod lazy;
pub mod registry;
pub mod slot;

pub use registry::{Capacity, LockRegistry, RegistryStats, SlotGuard};
pub use slot::ReentrancyPolicy;
