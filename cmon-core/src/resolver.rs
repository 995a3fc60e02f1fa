//! Admin address resolution for hosts.
//!
//! Resolution runs as its own task so the item that triggered it never
//! waits on the host directory or the agent. Failures end up in the log and
//! the `cmon_resolver_failures_total` counter, never in the caller.

use crate::backoff::RetryPolicy;
use crate::cache::Cache;
use crate::clients::{AgentClient, HostDirectory};
use crate::error::{CmonError, Result};
use crate::observability::metrics;
use crate::types::{now_millis, HostEntry, HostRecord};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Result of one resolution request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    AlreadyCached,
    /// Another task is resolving the same host.
    InFlight,
    Resolved(IpAddr),
    /// The directory no longer knows the host.
    Gone,
    Failed(String),
}

enum Lookup {
    Found { admin_ip: IpAddr, hostname: Option<String> },
    Gone,
}

/// Resolves host admin addresses into the cache.
pub struct AdminResolver {
    cache: Arc<Cache>,
    directory: Arc<dyn HostDirectory>,
    agent: Arc<dyn AgentClient>,
    agent_port: u16,
    retry: RetryPolicy,
    in_flight: Mutex<HashSet<String>>,
}

impl AdminResolver {
    pub fn new(
        cache: Arc<Cache>,
        directory: Arc<dyn HostDirectory>,
        agent: Arc<dyn AgentClient>,
        agent_port: u16,
        retry: RetryPolicy,
    ) -> Self {
        Self { cache, directory, agent, agent_port, retry, in_flight: Mutex::new(HashSet::new()) }
    }

    /// Resolve in the background.
    pub fn spawn(
        self: &Arc<Self>,
        server_uuid: String,
        supplied: Option<HostRecord>,
    ) -> JoinHandle<ResolveOutcome> {
        let resolver = Arc::clone(self);
        tokio::spawn(async move { resolver.resolve(&server_uuid, supplied).await })
    }

    /// Resolve `server_uuid`, using `supplied` instead of a directory lookup
    /// when it carries sysinfo.
    #[instrument(skip(self, supplied), fields(server_uuid = %server_uuid))]
    pub async fn resolve(&self, server_uuid: &str, supplied: Option<HostRecord>) -> ResolveOutcome {
        if self.cache.has_host(server_uuid).await {
            return ResolveOutcome::AlreadyCached;
        }

        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, server_uuid) else {
            debug!("Resolution already in flight");
            return ResolveOutcome::InFlight;
        };

        let lookup = self
            .retry
            .retry("resolve admin ip", || self.lookup(server_uuid, supplied.as_ref()))
            .await;

        match lookup {
            Ok(Lookup::Gone) => {
                self.cache.evict_host(server_uuid).await;
                info!("Host removed from directory, dropped from cache");
                ResolveOutcome::Gone
            }
            Ok(Lookup::Found { admin_ip, hostname }) => {
                let agent_addr = SocketAddr::new(admin_ip, self.agent_port);
                if let Err(e) = self.agent.refresh(agent_addr).await {
                    warn!(%agent_addr, error = %e, "Agent refresh hint failed");
                }

                let entry = HostEntry { admin_ip, hostname, resolved_at: now_millis() };
                self.cache.set_host(server_uuid, entry).await;
                info!(%admin_ip, "Resolved host admin address");
                ResolveOutcome::Resolved(admin_ip)
            }
            Err(e @ CmonError::NoAdminInterface { .. }) => {
                error!(error = %e, "Host has no admin interface");
                metrics::record_resolver_failure("no_admin_interface");
                ResolveOutcome::Failed(e.to_string())
            }
            Err(e) => {
                error!(
                    error = %e,
                    attempts = self.retry.max_attempts(),
                    "Giving up on host resolution"
                );
                metrics::record_resolver_failure("exhausted");
                ResolveOutcome::Failed(e.to_string())
            }
        }
    }

    /// A supplied record without sysinfo is not enough; fetch the full one.
    async fn lookup(&self, server_uuid: &str, supplied: Option<&HostRecord>) -> Result<Lookup> {
        let fetched;
        let record = match supplied.filter(|r| r.sysinfo.is_some()) {
            Some(record) => record,
            None => match self.directory.get_server(server_uuid).await? {
                Some(record) => {
                    fetched = record;
                    &fetched
                }
                None => return Ok(Lookup::Gone),
            },
        };

        let admin_ip = record.admin_ip()?;
        Ok(Lookup::Found { admin_ip, hostname: record.hostname.clone() })
    }
}

/// Membership in the in-flight set, released on drop.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, key: &str) -> Option<Self> {
        let mut members = set.lock().unwrap_or_else(|e| e.into_inner());
        if !members.insert(key.to_string()) {
            return None;
        }
        Some(Self { set, key: key.to_string() })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut members = self.set.lock().unwrap_or_else(|e| e.into_inner());
        members.remove(&self.key);
    }
}
