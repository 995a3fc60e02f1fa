//! Per-item processing shared by bootstrap, live and poll work.

use crate::cache::{Cache, CacheChange};
use crate::clients::{InventoryClient, VmQuery};
use crate::error::{CmonError, Result};
use crate::normalize::{
    normalize_host, normalize_vm, CacheEvent, ChangeNotice, NormalizeError, UNKNOWN_STATE,
};
use crate::observability::metrics;
use crate::resolver::{AdminResolver, ResolveOutcome};
use crate::types::{HostRecord, RecordSource};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// What stage one did to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEffect {
    Upserted(CacheChange),
    /// VM stopped or destroyed; `was_cached` tells whether an entry went away.
    Removed { was_cached: bool },
    /// VM in a state the cache does not track.
    Ignored(String),
    /// Record was malformed or rejected.
    Skipped(NormalizeError),
    /// Poll record for a host; only resolution follows.
    HostSeen,
}

impl CacheEffect {
    fn label(&self) -> &'static str {
        match self {
            Self::Upserted(_) => "upserted",
            Self::Removed { .. } => "removed",
            Self::Ignored(_) => "ignored",
            Self::Skipped(_) => "skipped",
            Self::HostSeen => "host_seen",
        }
    }
}

/// Result of processing one item.
#[derive(Debug)]
pub struct ItemOutcome {
    pub effect: CacheEffect,
    /// Host whose address resolution was triggered.
    pub host: Option<String>,
    /// Resolution task; the pipeline does not wait for it.
    pub resolution: Option<JoinHandle<ResolveOutcome>>,
}

/// Two-stage pipeline: cache update, then admin address resolution.
pub struct ItemPipeline {
    cache: Arc<Cache>,
    inventory: Arc<dyn InventoryClient>,
    resolver: Arc<AdminResolver>,
}

impl ItemPipeline {
    pub fn new(
        cache: Arc<Cache>,
        inventory: Arc<dyn InventoryClient>,
        resolver: Arc<AdminResolver>,
    ) -> Self {
        Self { cache, inventory, resolver }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Process one event. Only live re-fetch failures and upstream protocol
    /// violations are returned as errors; bad records are skipped.
    pub async fn process(&self, event: CacheEvent) -> Result<ItemOutcome> {
        let source = event.label();

        let (effect, host, supplied) = match event {
            CacheEvent::Bootstrap(raw) => self.apply_vm(&raw, RecordSource::Bootstrap).await,
            CacheEvent::Change(notice) => self.apply_change(&notice).await?,
            CacheEvent::Poll(raw) => match normalize_host(&raw) {
                Ok(record) => (CacheEffect::HostSeen, Some(record.uuid.clone()), Some(record)),
                Err(e) => {
                    warn!(error = %e, skipped = %raw, "Skipping malformed host record");
                    (CacheEffect::Skipped(e), None, None)
                }
            },
        };

        metrics::record_sync_item(source, effect.label());

        let resolution = host.clone().map(|server_uuid| self.resolver.spawn(server_uuid, supplied));

        Ok(ItemOutcome { effect, host, resolution })
    }

    async fn apply_vm(
        &self,
        raw: &Value,
        source: RecordSource,
    ) -> (CacheEffect, Option<String>, Option<HostRecord>) {
        match normalize_vm(raw, source) {
            Ok(record) => {
                let server_uuid = record.server_uuid.clone();
                let vm_uuid = record.vm_uuid.clone();
                let change = self.cache.upsert_vm(record).await;
                trace!(
                    vm_uuid = %vm_uuid,
                    server_uuid = %server_uuid,
                    source = source.as_str(),
                    ?change,
                    "Cached VM"
                );
                (CacheEffect::Upserted(change), Some(server_uuid), None)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    skipped = %raw,
                    source = source.as_str(),
                    "Skipping incomplete VM record"
                );
                (CacheEffect::Skipped(e), None, None)
            }
        }
    }

    async fn apply_change(
        &self,
        notice: &ChangeNotice,
    ) -> Result<(CacheEffect, Option<String>, Option<HostRecord>)> {
        let vm_uuid = &notice.changed_resource_id;
        let mut vms = self.inventory.list_vms(&VmQuery::by_uuid(vm_uuid)).await?;

        if vms.len() != 1 {
            return Err(CmonError::ProtocolViolation {
                reason: format!("lookup of VM {} returned {} records", vm_uuid, vms.len()),
            });
        }
        let raw = vms.remove(0);

        let state =
            raw.get("state").and_then(|s| s.as_str()).unwrap_or(UNKNOWN_STATE).to_string();

        match state.as_str() {
            "running" => Ok(self.apply_vm(&raw, RecordSource::Changefeed).await),
            "stopped" | "destroyed" => {
                let was_cached = self.cache.remove_vm(vm_uuid).await.is_some();
                if was_cached {
                    debug!(vm_uuid = %vm_uuid, %state, "Dropped VM from cache");
                }
                Ok((CacheEffect::Removed { was_cached }, None, None))
            }
            _ => {
                trace!(vm_uuid = %vm_uuid, %state, "VM state is not tracked");
                Ok((CacheEffect::Ignored(state), None, None))
            }
        }
    }
}
