//! The allocator dispatch table ("zone") and the things that own one.
//!
//! A [`Zone`] is laid out like a malloc zone: a version, a name and one
//! function pointer per operation. Whoever calls into the allocator loads the
//! pointer out of the live table each time, which is what makes the table an
//! interception point.

use std::{
    ffi::{c_char, c_int, c_void},
    fmt,
    ptr::{self, addr_of, addr_of_mut, NonNull},
};

pub mod global;
pub mod host;
pub mod page;
pub mod system;

pub use global::ZoneAlloc;
pub use host::{SelectionPolicy, ZoneHost, ZoneSet};
pub use page::ZonePage;

pub type MallocFn = unsafe extern "C" fn(zone: *mut Zone, size: usize) -> *mut c_void;
pub type CallocFn = unsafe extern "C" fn(zone: *mut Zone, count: usize, size: usize) -> *mut c_void;
pub type VallocFn = unsafe extern "C" fn(zone: *mut Zone, size: usize) -> *mut c_void;
pub type ReallocFn =
    unsafe extern "C" fn(zone: *mut Zone, ptr: *mut c_void, size: usize) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(zone: *mut Zone, ptr: *mut c_void);
pub type MemalignFn =
    unsafe extern "C" fn(zone: *mut Zone, alignment: usize, size: usize) -> *mut c_void;
pub type FreeDefiniteSizeFn = unsafe extern "C" fn(zone: *mut Zone, ptr: *mut c_void, size: usize);
pub type PressureReliefFn = unsafe extern "C" fn(zone: *mut Zone, goal: usize) -> usize;
pub type ClaimedAddressFn = unsafe extern "C" fn(zone: *mut Zone, ptr: *mut c_void) -> c_int;
pub type TryFreeDefaultFn = unsafe extern "C" fn(zone: *mut Zone, ptr: *mut c_void);

/// The version our own zones report
pub const ZONE_VERSION: u32 = 10;

/// The versions whose layout matches [`Zone`]
pub const SUPPORTED_VERSIONS: [u32; 2] = [8, 10];

/// Every operation a zone can serve
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Malloc,
    Calloc,
    Valloc,
    Realloc,
    Free,
    Memalign,
    FreeDefiniteSize,
    PressureRelief,
    ClaimedAddress,
    TryFreeDefault,
}

impl Operation {
    pub const ALL: [Operation; 10] = [
        Operation::Malloc,
        Operation::Calloc,
        Operation::Valloc,
        Operation::Realloc,
        Operation::Free,
        Operation::Memalign,
        Operation::FreeDefiniteSize,
        Operation::PressureRelief,
        Operation::ClaimedAddress,
        Operation::TryFreeDefault,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Operation::Malloc => "malloc",
            Operation::Calloc => "calloc",
            Operation::Valloc => "valloc",
            Operation::Realloc => "realloc",
            Operation::Free => "free",
            Operation::Memalign => "memalign",
            Operation::FreeDefiniteSize => "free_definite_size",
            Operation::PressureRelief => "pressure_relief",
            Operation::ClaimedAddress => "claimed_address",
            Operation::TryFreeDefault => "try_free_default",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A zone's operation slots, by value. Used both for what a zone starts out
/// with and for the snapshot the interposer delegates to.
#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct ZoneOps {
    pub malloc: Option<MallocFn>,
    pub calloc: Option<CallocFn>,
    pub valloc: Option<VallocFn>,
    pub realloc: Option<ReallocFn>,
    pub free: Option<FreeFn>,
    pub memalign: Option<MemalignFn>,
    pub free_definite_size: Option<FreeDefiniteSizeFn>,
    pub pressure_relief: Option<PressureReliefFn>,
    pub claimed_address: Option<ClaimedAddressFn>,
    pub try_free_default: Option<TryFreeDefaultFn>,
}

impl ZoneOps {
    /// The address in each slot (0 for an empty one), in [`Operation::ALL`]
    /// order. Comparing addresses is how we tell whose code a table points
    /// at.
    pub fn addresses(&self) -> [usize; 10] {
        fn addr<F: Copy>(f: Option<F>) -> usize {
            // SAFETY: every slot type is a plain function pointer
            f.map_or(0, |f| unsafe { std::mem::transmute_copy::<F, usize>(&f) })
        }
        [
            addr(self.malloc),
            addr(self.calloc),
            addr(self.valloc),
            addr(self.realloc),
            addr(self.free),
            addr(self.memalign),
            addr(self.free_definite_size),
            addr(self.pressure_relief),
            addr(self.claimed_address),
            addr(self.try_free_default),
        ]
    }

    /// The inverse of [`ZoneOps::addresses()`]
    ///
    /// # Safety
    ///
    /// - every non-zero address must be a function with the signature of the
    ///   slot it lands in
    pub unsafe fn from_addresses(addresses: [usize; 10]) -> Self {
        unsafe fn slot<F: Copy>(addr: usize) -> Option<F> {
            // SAFETY: `Option<fn>` is a nullable function pointer, and the
            // caller vouches for the signature
            unsafe { std::mem::transmute_copy::<usize, Option<F>>(&addr) }
        }
        // SAFETY: passed to the caller
        unsafe {
            ZoneOps {
                malloc: slot(addresses[0]),
                calloc: slot(addresses[1]),
                valloc: slot(addresses[2]),
                realloc: slot(addresses[3]),
                free: slot(addresses[4]),
                memalign: slot(addresses[5]),
                free_definite_size: slot(addresses[6]),
                pressure_relief: slot(addresses[7]),
                claimed_address: slot(addresses[8]),
                try_free_default: slot(addresses[9]),
            }
        }
    }

    pub fn address_of(&self, op: Operation) -> usize {
        self.addresses()[op as usize]
    }

    /// Operations that have an entry point
    pub fn present(&self) -> impl Iterator<Item = Operation> + '_ {
        let addresses = self.addresses();
        Operation::ALL
            .into_iter()
            .filter(move |&op| addresses[op as usize] != 0)
    }
}

impl PartialEq for ZoneOps {
    fn eq(&self, other: &Self) -> bool {
        self.addresses() == other.addresses()
    }
}

impl Eq for ZoneOps {}

impl fmt::Debug for ZoneOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addresses = self.addresses();
        let mut map = f.debug_map();
        for op in Operation::ALL {
            map.entry(&op.name(), &format_args!("{:#x}", addresses[op as usize]));
        }
        map.finish()
    }
}

/// The live dispatch table
#[repr(C)]
pub struct Zone {
    pub version: u32,
    pub name: *const c_char,
    pub ops: ZoneOps,
}

impl Zone {
    /// Read the table's version
    ///
    /// # Safety
    ///
    /// - `zone` must point to a live [`Zone`]
    pub unsafe fn version_of(zone: NonNull<Zone>) -> u32 {
        // SAFETY: passed to the caller
        unsafe { ptr::read_volatile(addr_of!((*zone.as_ptr()).version)) }
    }

    /// Read every slot as it is right now. Volatile, since the table can be
    /// rewritten behind the compiler's back.
    ///
    /// # Safety
    ///
    /// - `zone` must point to a live [`Zone`]
    pub unsafe fn read_ops(zone: NonNull<Zone>) -> ZoneOps {
        // SAFETY: passed to the caller
        unsafe { ptr::read_volatile(addr_of!((*zone.as_ptr()).ops)) }
    }

    /// Overwrite every slot.
    ///
    /// # Safety
    ///
    /// - `zone` must point to a live [`Zone`] whose pages are currently
    ///   writable
    /// - every entry point in `ops` must be sound to call with `zone`
    pub unsafe fn write_ops(zone: NonNull<Zone>, ops: &ZoneOps) {
        // SAFETY: passed to the caller
        unsafe { ptr::write_volatile(addr_of_mut!((*zone.as_ptr()).ops), *ops) }
    }
}
