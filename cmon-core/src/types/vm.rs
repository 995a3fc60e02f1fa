//! VM domain types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state reported by the inventory service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VmState {
    Running,
    Stopped,
    Destroyed,
    /// Transitional states (provisioning, stopping, ...) kept verbatim.
    Other(String),
}

impl VmState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Destroyed => "destroyed",
            Self::Other(s) => s,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// States that take a VM out of the cache.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Stopped | Self::Destroyed)
    }
}

impl From<String> for VmState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            "destroyed" => Self::Destroyed,
            _ => Self::Other(s),
        }
    }
}

impl From<&str> for VmState {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<VmState> for String {
    fn from(state: VmState) -> Self {
        match state {
            VmState::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a cached record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    Bootstrap,
    Changefeed,
}

impl RecordSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Changefeed => "changefeed",
        }
    }
}

/// Normalized VM entry held in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub vm_uuid: String,

    /// Host the VM runs on.
    pub server_uuid: String,

    pub owner_uuid: String,

    pub alias: Option<String>,

    pub brand: Option<String>,

    pub image_uuid: Option<String>,

    pub state: VmState,

    /// Discovery groups from the `cmon_groups` tag.
    pub groups: Vec<String>,

    /// Role of a core (operator-managed) zone.
    pub affinity_group: Option<String>,

    /// Operator-managed infrastructure zone.
    pub core: bool,

    pub source: RecordSource,

    /// Unix millis at which the record was cached.
    pub cached_date: u64,
}
