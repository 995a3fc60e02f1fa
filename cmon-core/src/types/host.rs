//! Compute node (host) types.

use crate::error::{CmonError, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// NIC tag that marks the administrative network.
pub const ADMIN_NIC: &str = "admin";

/// Host record as returned by the host directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    pub uuid: String,

    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub setup: Option<bool>,

    /// Raw sysinfo; interfaces live under `Network Interfaces`.
    #[serde(default)]
    pub sysinfo: Option<serde_json::Value>,
}

impl HostRecord {
    /// IPv4 address of the first interface carrying the `admin` NIC name,
    /// in the order the directory listed them.
    pub fn admin_ip(&self) -> Result<IpAddr> {
        let no_admin = || CmonError::NoAdminInterface { server_uuid: self.uuid.clone() };

        let interfaces = self
            .sysinfo
            .as_ref()
            .and_then(|s| s.get("Network Interfaces"))
            .and_then(|n| n.as_object())
            .ok_or_else(no_admin)?;

        for (name, iface) in interfaces {
            let is_admin = iface
                .get("NIC Names")
                .and_then(|n| n.as_array())
                .map(|names| names.iter().any(|n| n.as_str() == Some(ADMIN_NIC)))
                .unwrap_or(false);
            if !is_admin {
                continue;
            }

            let addr = iface.get("ip4addr").and_then(|a| a.as_str()).unwrap_or_default();
            return addr.parse().map_err(|_| CmonError::MalformedRecord {
                kind: "host",
                reason: format!("interface {} has invalid ip4addr {:?}", name, addr),
            });
        }

        Err(no_admin())
    }
}

/// Resolved admin address of a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    pub admin_ip: IpAddr,
    pub hostname: Option<String>,
    /// Unix millis of the resolution.
    pub resolved_at: u64,
}
