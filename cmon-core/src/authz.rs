//! Host-prefix parsing and access decisions against the cache.

use crate::cache::Cache;
use crate::error::{CmonError, Result};
use crate::types::Caller;
use once_cell::sync::Lazy;
use regex::Regex;

/// Leading host label that addresses the discovery endpoints.
pub const DISCOVERY_PREFIX: &str = "cmon";

/// Lower-case canonical UUID.
static UUID_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}$")
        .expect("Invalid UUID regex")
});

/// What the requested virtual host addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPrefix {
    Discovery,
    /// A VM or host uuid.
    Target(String),
}

impl HostPrefix {
    /// Parse the `Host` header. Anything other than `cmon.` or a uuid label
    /// is rejected as not found.
    pub fn parse(host: &str) -> Result<Self> {
        let label = host.split('.').next().unwrap_or_default().to_ascii_lowercase();
        // Strip a port from bare `label:port` hosts.
        let label = label.split(':').next().unwrap_or_default();

        if label == DISCOVERY_PREFIX {
            Ok(Self::Discovery)
        } else if UUID_REGEX.is_match(label) {
            Ok(Self::Target(label.to_string()))
        } else {
            Err(CmonError::not_found(host))
        }
    }
}

/// Decide whether `caller` may access what `prefix` addresses.
pub async fn authorize(cache: &Cache, caller: &Caller, prefix: &HostPrefix) -> Result<()> {
    let target = match prefix {
        HostPrefix::Discovery => return Ok(()),
        HostPrefix::Target(target) => target,
    };

    if cache.owns(&caller.account_uuid, target).await {
        return Ok(());
    }

    let is_host = cache.has_host(target).await;
    if caller.operator && is_host {
        return Ok(());
    }

    if !is_host && cache.get_vm(target).await.is_none() {
        return Err(CmonError::not_found(target.as_str()));
    }

    Err(CmonError::Forbidden { reason: format!("{} may not access {}", caller.login, target) })
}
