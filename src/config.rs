use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    lock::{Capacity, ReentrancyPolicy},
    util::print::Diagnostics,
    zone::{SelectionPolicy, SUPPORTED_VERSIONS},
};

/// The environment variable [`InterposerConfig::from_env()`] reads
pub const CONFIG_ENV: &str = "ZONELOCK_CONFIG";

/// What happens when the wrapped allocator returns null for a non-empty
/// request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Write a diagnostic and abort. The caller never sees the null.
    #[default]
    Abort,
    /// Hand the null back, like a plain allocator would
    Propagate,
}

/// Everything the interposer can be told. Every field has a default, so
/// `{}` is a complete configuration.
///
/// ```
/// # use zonelock::{config::InterposerConfig, lock::Capacity};
/// let config = InterposerConfig::from_json(r#"{ "capacity": { "bounded": 65535 } }"#).unwrap();
/// assert_eq!(config.capacity, Capacity::Bounded(65535));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InterposerConfig {
    pub capacity: Capacity,
    pub reentrancy: ReentrancyPolicy,
    pub on_allocation_failure: FailurePolicy,
    pub selection: SelectionPolicy,
    pub supported_versions: Vec<u32>,
    pub diagnostics: Diagnostics,
}

impl Default for InterposerConfig {
    fn default() -> Self {
        Self {
            capacity: Capacity::default(),
            reentrancy: ReentrancyPolicy::default(),
            on_allocation_failure: FailurePolicy::default(),
            selection: SelectionPolicy::default(),
            supported_versions: SUPPORTED_VERSIONS.to_vec(),
            diagnostics: Diagnostics::default(),
        }
    }
}

impl InterposerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read the configuration from `$ZONELOCK_CONFIG`, falling back to the
    /// defaults when it isn't set
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(json) => {
                log::debug!("configuration from ${CONFIG_ENV}: {json}");
                Self::from_json(&json)
            }
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn supports(&self, version: u32) -> bool {
        self.supported_versions.contains(&version)
    }
}
