//! Discovery payloads served from the cache.

use crate::cache::Cache;
use crate::types::VmRecord;
use serde::{Deserialize, Serialize};

/// One tenant VM as listed by `/v1/discover`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerEntry {
    pub server_uuid: String,
    pub vm_alias: Option<String>,
    pub vm_image_uuid: Option<String>,
    pub vm_uuid: String,
    pub vm_brand: Option<String>,
    pub groups: Vec<String>,
    pub cached_date: u64,
}

impl From<VmRecord> for ContainerEntry {
    fn from(vm: VmRecord) -> Self {
        Self {
            server_uuid: vm.server_uuid,
            vm_alias: vm.alias,
            vm_image_uuid: vm.image_uuid,
            vm_uuid: vm.vm_uuid,
            vm_brand: vm.brand,
            groups: vm.groups,
            cached_date: vm.cached_date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerList {
    pub containers: Vec<ContainerEntry>,
}

/// One host as listed by `/v1/gz/discover`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostListEntry {
    pub server_uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostList {
    pub cns: Vec<HostListEntry>,
}

/// The owner's cached VMs, optionally limited to the given groups.
pub async fn discover_vms(
    cache: &Cache,
    owner_uuid: &str,
    groups: Option<&[String]>,
) -> ContainerList {
    let containers = cache
        .owner_vms(owner_uuid)
        .await
        .into_iter()
        .filter(|vm| groups.map(|wanted| in_groups(vm, wanted)).unwrap_or(true))
        .map(ContainerEntry::from)
        .collect();
    ContainerList { containers }
}

/// Every host with a resolved admin address.
pub async fn discover_hosts(cache: &Cache) -> HostList {
    let cns = cache
        .list_hosts()
        .await
        .into_iter()
        .map(|(server_uuid, entry)| HostListEntry { server_uuid, hostname: entry.hostname })
        .collect();
    HostList { cns }
}

fn in_groups(vm: &VmRecord, wanted: &[String]) -> bool {
    wanted.iter().any(|g| vm.groups.contains(g) || vm.affinity_group.as_ref() == Some(g))
}
