//! Serialise every call into an allocator's dispatch table through per-thread
//! locks, by rewriting the table's entry points in place.
//!
//! ```no_run
//! use zonelock::{interpose::Interposer, patch::interpose_or_abort, zone::{ZonePage, ZoneSet}};
//!
//! let host = ZoneSet::new(vec![ZonePage::system().unwrap()]);
//! let interposer = Interposer::from_env().unwrap().leak();
//! interpose_or_abort(&host, interposer);
//! ```

pub mod config;
pub mod error;
pub mod interpose;
pub mod lock;
pub mod os;
pub mod patch;
pub mod util;
pub mod zone;

pub use config::{FailurePolicy, InterposerConfig};
pub use error::{Error, Result};
pub use interpose::Interposer;
pub use lock::{Capacity, LockRegistry, ReentrancyPolicy};
pub use patch::{interpose, interpose_or_abort, InstallOutcome, PatchableTable};
pub use zone::{SelectionPolicy, Zone, ZoneHost, ZoneOps, ZonePage, ZoneSet};
