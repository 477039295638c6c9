use std::ptr::NonNull;

use serde::{Deserialize, Serialize};

use super::{Zone, ZonePage};

/// Which of a host's zones get instrumented
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// The first zone the host enumerates
    #[default]
    First,
    /// The zone the host currently allocates from by default
    Default,
    /// Every zone. Anything left unpatched bypasses the locks entirely.
    All,
}

/// Something that can list the allocator zones in a process.
///
/// # Safety
///
/// Every pointer handed out must point to a live [`Zone`] that
/// - stays mapped for as long as the host is alive,
/// - sits on pages that hold nothing but zones, mapped read-only, so the
///   patcher may flip their protection,
/// - is only called with arguments its entry points accept.
pub unsafe trait ZoneHost {
    /// Every zone, in enumeration order
    fn zones(&self) -> Vec<NonNull<Zone>>;

    /// The zone allocations go to when nobody picks one
    fn default_zone(&self) -> Option<NonNull<Zone>> {
        self.zones().first().copied()
    }

    /// The zones `policy` picks out
    fn select(&self, policy: SelectionPolicy) -> Vec<NonNull<Zone>> {
        match policy {
            SelectionPolicy::First => self.zones().into_iter().take(1).collect(),
            SelectionPolicy::Default => self.default_zone().into_iter().collect(),
            SelectionPolicy::All => self.zones(),
        }
    }
}

/// An in-process host: a list of zones it owns, one of which is the default
pub struct ZoneSet {
    zones: Vec<ZonePage>,
    default: usize,
}

impl ZoneSet {
    pub fn new(zones: Vec<ZonePage>) -> Self {
        Self { zones, default: 0 }
    }

    /// Make `zones[index]` the default zone
    ///
    /// # Panics
    ///
    /// - If there is no zone at `index`
    pub fn with_default(mut self, index: usize) -> Self {
        assert!(index < self.zones.len(), "no zone at index {index}");
        self.default = index;
        self
    }

    pub fn get(&self, index: usize) -> Option<&ZonePage> {
        self.zones.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ZonePage> {
        self.zones.iter()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

// SAFETY: every `ZonePage` is a sealed page holding only its zone, and lives
// as long as the set
unsafe impl ZoneHost for ZoneSet {
    fn zones(&self) -> Vec<NonNull<Zone>> {
        self.zones.iter().map(ZonePage::as_ptr).collect()
    }

    fn default_zone(&self) -> Option<NonNull<Zone>> {
        self.zones.get(self.default).map(ZonePage::as_ptr)
    }
}
