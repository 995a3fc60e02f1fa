//! In-memory view of running VMs and resolved hosts.
//!
//! The VM map and the owner index are guarded by one lock so that the owner
//! invariant (`vm ∈ owners[o]` iff `vms[vm].owner_uuid == o`) holds for every
//! reader. Host entries live behind their own lock. No lock is held across I/O.

use crate::observability::metrics;
use crate::types::{HostEntry, VmRecord};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct VmIndex {
    vms: HashMap<String, VmRecord>,
    owners: HashMap<String, BTreeSet<String>>,
}

impl VmIndex {
    fn unlink_owner(&mut self, owner_uuid: &str, vm_uuid: &str) {
        if let Some(set) = self.owners.get_mut(owner_uuid) {
            set.remove(vm_uuid);
            if set.is_empty() {
                self.owners.remove(owner_uuid);
            }
        }
    }
}

/// Effect of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheChange {
    Inserted,
    Updated,
    Unchanged,
}

/// Point-in-time size of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub vms: usize,
    pub owners: usize,
    pub hosts: usize,
}

/// Process-wide cache, shared as `Arc<Cache>`.
#[derive(Default)]
pub struct Cache {
    index: RwLock<VmIndex>,
    hosts: RwLock<HashMap<String, HostEntry>>,
}

impl Cache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert or replace a VM, moving it between owners when needed.
    pub async fn upsert_vm(&self, record: VmRecord) -> CacheChange {
        let (change, vms, owners) = {
            let mut index = self.index.write().await;
            let vm_uuid = record.vm_uuid.clone();
            let owner_uuid = record.owner_uuid.clone();

            let change = match index.vms.get(&vm_uuid) {
                None => CacheChange::Inserted,
                Some(existing) if same_content(existing, &record) => CacheChange::Unchanged,
                Some(_) => CacheChange::Updated,
            };

            if let Some(previous) = index.vms.insert(vm_uuid.clone(), record) {
                if previous.owner_uuid != owner_uuid {
                    index.unlink_owner(&previous.owner_uuid, &vm_uuid);
                }
            }
            index.owners.entry(owner_uuid).or_default().insert(vm_uuid);

            (change, index.vms.len(), index.owners.len())
        };

        metrics::set_cache_sizes(vms, owners);
        change
    }

    /// Remove a VM and prune its owner entry if it became empty.
    pub async fn remove_vm(&self, vm_uuid: &str) -> Option<VmRecord> {
        let (removed, vms, owners) = {
            let mut index = self.index.write().await;
            let removed = index.vms.remove(vm_uuid);
            if let Some(record) = &removed {
                index.unlink_owner(&record.owner_uuid, vm_uuid);
            }
            (removed, index.vms.len(), index.owners.len())
        };

        if removed.is_some() {
            debug!(vm_uuid = %vm_uuid, "Removed VM from cache");
            metrics::set_cache_sizes(vms, owners);
        }
        removed
    }

    /// Drop every VM cached before `cutoff` (unix millis). Returns the count.
    pub async fn sweep_vms_before(&self, cutoff: u64) -> usize {
        let (swept, vms, owners) = {
            let mut index = self.index.write().await;
            let stale: Vec<(String, String)> = index
                .vms
                .values()
                .filter(|r| r.cached_date < cutoff)
                .map(|r| (r.vm_uuid.clone(), r.owner_uuid.clone()))
                .collect();
            for (vm_uuid, owner_uuid) in &stale {
                index.vms.remove(vm_uuid);
                index.unlink_owner(owner_uuid, vm_uuid);
            }
            (stale.len(), index.vms.len(), index.owners.len())
        };

        if swept > 0 {
            metrics::set_cache_sizes(vms, owners);
        }
        swept
    }

    pub async fn get_vm(&self, vm_uuid: &str) -> Option<VmRecord> {
        self.index.read().await.vms.get(vm_uuid).cloned()
    }

    /// All cached VMs of an owner, ordered by VM uuid.
    pub async fn owner_vms(&self, owner_uuid: &str) -> Vec<VmRecord> {
        let index = self.index.read().await;
        index
            .owners
            .get(owner_uuid)
            .map(|set| set.iter().filter_map(|id| index.vms.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub async fn owns(&self, owner_uuid: &str, vm_uuid: &str) -> bool {
        let index = self.index.read().await;
        index.owners.get(owner_uuid).map(|set| set.contains(vm_uuid)).unwrap_or(false)
    }

    /// Record a host's admin address; last writer wins.
    pub async fn set_host(&self, server_uuid: &str, entry: HostEntry) {
        let count = {
            let mut hosts = self.hosts.write().await;
            hosts.insert(server_uuid.to_string(), entry);
            hosts.len()
        };
        metrics::set_host_count(count);
    }

    pub async fn get_host(&self, server_uuid: &str) -> Option<HostEntry> {
        self.hosts.read().await.get(server_uuid).cloned()
    }

    pub async fn has_host(&self, server_uuid: &str) -> bool {
        self.hosts.read().await.contains_key(server_uuid)
    }

    pub async fn evict_host(&self, server_uuid: &str) -> Option<HostEntry> {
        let (removed, count) = {
            let mut hosts = self.hosts.write().await;
            let removed = hosts.remove(server_uuid);
            (removed, hosts.len())
        };
        if removed.is_some() {
            debug!(server_uuid = %server_uuid, "Evicted host from cache");
            metrics::set_host_count(count);
        }
        removed
    }

    /// Resolved hosts, ordered by server uuid.
    pub async fn list_hosts(&self) -> Vec<(String, HostEntry)> {
        let hosts = self.hosts.read().await;
        let mut list: Vec<_> = hosts.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    pub async fn stats(&self) -> CacheStats {
        let (vms, owners) = {
            let index = self.index.read().await;
            (index.vms.len(), index.owners.len())
        };
        let hosts = self.hosts.read().await.len();
        CacheStats { vms, owners, hosts }
    }

    /// Verify the owner index against the VM map. Used by tests.
    pub async fn check_invariants(&self) -> std::result::Result<(), String> {
        let index = self.index.read().await;
        for (owner, set) in &index.owners {
            if set.is_empty() {
                return Err(format!("owner {} has an empty entry", owner));
            }
            for vm in set {
                match index.vms.get(vm) {
                    Some(record) if &record.owner_uuid == owner => {}
                    Some(record) => {
                        return Err(format!(
                            "vm {} indexed under {} but owned by {}",
                            vm, owner, record.owner_uuid
                        ))
                    }
                    None => return Err(format!("vm {} indexed under {} is not cached", vm, owner)),
                }
            }
        }
        for (vm, record) in &index.vms {
            let indexed =
                index.owners.get(&record.owner_uuid).map(|s| s.contains(vm)).unwrap_or(false);
            if !indexed {
                return Err(format!("vm {} missing from owner {}", vm, record.owner_uuid));
            }
        }
        Ok(())
    }
}

/// Equality ignoring the cache timestamp and record source.
fn same_content(a: &VmRecord, b: &VmRecord) -> bool {
    a.server_uuid == b.server_uuid
        && a.owner_uuid == b.owner_uuid
        && a.alias == b.alias
        && a.brand == b.brand
        && a.image_uuid == b.image_uuid
        && a.state == b.state
        && a.groups == b.groups
        && a.affinity_group == b.affinity_group
        && a.core == b.core
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RecordSource, VmState};

    fn vm(id: &str, owner: &str, host: &str) -> VmRecord {
        VmRecord {
            vm_uuid: id.to_string(),
            server_uuid: host.to_string(),
            owner_uuid: owner.to_string(),
            alias: None,
            brand: Some("joyent".to_string()),
            image_uuid: None,
            state: VmState::Running,
            groups: vec![],
            affinity_group: None,
            core: false,
            source: RecordSource::Bootstrap,
            cached_date: 1,
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let cache = Cache::new();
        assert_eq!(cache.upsert_vm(vm("a1", "o1", "h1")).await, CacheChange::Inserted);
        let before = cache.stats().await;

        let mut again = vm("a1", "o1", "h1");
        again.cached_date = 2;
        assert_eq!(cache.upsert_vm(again).await, CacheChange::Unchanged);
        assert_eq!(cache.stats().await, before);
        assert_eq!(cache.owner_vms("o1").await.len(), 1);
        cache.check_invariants().await.unwrap();
    }

    #[tokio::test]
    async fn test_owner_move() {
        let cache = Cache::new();
        cache.upsert_vm(vm("a1", "o1", "h1")).await;
        assert_eq!(cache.upsert_vm(vm("a1", "o2", "h1")).await, CacheChange::Updated);

        assert!(!cache.owns("o1", "a1").await);
        assert!(cache.owns("o2", "a1").await);
        assert_eq!(cache.stats().await.owners, 1);
        cache.check_invariants().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_prunes_owner() {
        let cache = Cache::new();
        cache.upsert_vm(vm("a1", "o1", "h1")).await;
        cache.upsert_vm(vm("a2", "o1", "h1")).await;

        assert!(cache.remove_vm("a1").await.is_some());
        assert_eq!(cache.stats().await.owners, 1);
        assert!(cache.remove_vm("a2").await.is_some());
        assert_eq!(cache.stats().await, CacheStats { vms: 0, owners: 0, hosts: 0 });

        assert!(cache.remove_vm("a2").await.is_none());
        cache.check_invariants().await.unwrap();
    }

    #[tokio::test]
    async fn test_random_sequences_keep_invariants() {
        use rand::Rng;

        let cache = Cache::new();
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let id = format!("vm{}", rng.gen_range(0..20));
            if rng.gen_bool(0.6) {
                let owner = format!("o{}", rng.gen_range(0..4));
                cache.upsert_vm(vm(&id, &owner, "h1")).await;
            } else {
                cache.remove_vm(&id).await;
            }
            cache.check_invariants().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_sweep_stale_vms() {
        let cache = Cache::new();
        cache.upsert_vm(vm("old", "o1", "h1")).await;
        let mut fresh = vm("fresh", "o1", "h1");
        fresh.cached_date = 10;
        cache.upsert_vm(fresh).await;
        let mut other = vm("gone", "o2", "h1");
        other.cached_date = 5;
        cache.upsert_vm(other).await;

        assert_eq!(cache.sweep_vms_before(10).await, 2);
        assert!(cache.get_vm("fresh").await.is_some());
        assert_eq!(cache.stats().await.owners, 1);
        cache.check_invariants().await.unwrap();
    }

    #[tokio::test]
    async fn test_host_entries() {
        let cache = Cache::new();
        let entry =
            HostEntry { admin_ip: "10.0.0.5".parse().unwrap(), hostname: None, resolved_at: 1 };
        cache.set_host("h1", entry.clone()).await;

        assert!(cache.has_host("h1").await);
        assert_eq!(cache.get_host("h1").await, Some(entry.clone()));
        assert_eq!(cache.list_hosts().await, vec![("h1".to_string(), entry)]);

        assert!(cache.evict_host("h1").await.is_some());
        assert!(cache.evict_host("h1").await.is_none());
        assert!(!cache.has_host("h1").await);
    }
}
