//! Core domain types for cmon.

pub mod host;
pub mod identity;
pub mod vm;

pub use host::{HostEntry, HostRecord, ADMIN_NIC};
pub use identity::Caller;
pub use vm::{RecordSource, VmRecord, VmState};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
