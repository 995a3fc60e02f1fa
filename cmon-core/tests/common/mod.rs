//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use cmon_core::backoff::RetryPolicy;
use cmon_core::clients::{
    AgentClient, AgentRequest, AgentResponse, HostDirectory, InventoryClient, ServerQuery, VmQuery,
};
use cmon_core::error::{CmonError, Result};
use cmon_core::resolver::AdminResolver;
use cmon_core::sync::{HostPoller, ItemOutcome, ItemPipeline};
use cmon_core::{Cache, CacheEvent, HostRecord};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const AGENT_PORT: u16 = 9163;

/// Retry policy that gives up quickly.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    let (min, max) = (Duration::from_millis(1), Duration::from_millis(5));
    RetryPolicy::new(max_attempts, min, max, 2.0, Duration::ZERO)
}

pub fn vm(uuid: &str, server: &str, owner: &str, state: &str) -> Value {
    json!({
        "uuid": uuid,
        "server_uuid": server,
        "owner_uuid": owner,
        "state": state,
        "brand": "joyent"
    })
}

pub fn host(uuid: &str, admin_ip: &str) -> HostRecord {
    HostRecord {
        uuid: uuid.to_string(),
        hostname: Some(format!("cn-{}", uuid)),
        setup: Some(true),
        sysinfo: Some(json!({
            "Network Interfaces": {
                "ixgbe0": {"ip4addr": admin_ip, "NIC Names": ["admin"]},
                "ixgbe1": {"ip4addr": "192.168.1.10", "NIC Names": ["external"]}
            }
        })),
    }
}

/// Poll until `check` holds, panicking after two seconds.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Inventory backed by a list for bootstrap queries and a map for uuid lookups.
#[derive(Default)]
pub struct MockInventory {
    listing: Mutex<Vec<Value>>,
    current: Mutex<HashMap<String, Value>>,
    /// When set, state-filtered listings wait for a notification.
    gate: Option<Arc<Notify>>,
    pub queries: Mutex<Vec<VmQuery>>,
}

impl MockInventory {
    pub fn new(listing: Vec<Value>) -> Self {
        let current = listing
            .iter()
            .filter_map(|v| Some((v.get("uuid")?.as_str()?.to_string(), v.clone())))
            .collect();
        Self { listing: Mutex::new(listing), current: Mutex::new(current), ..Self::default() }
    }

    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// What a uuid lookup returns from now on.
    pub fn set_current(&self, record: Value) {
        let uuid = record["uuid"].as_str().unwrap().to_string();
        self.current.lock().unwrap().insert(uuid, record);
    }

    pub fn set_listing(&self, listing: Vec<Value>) {
        *self.listing.lock().unwrap() = listing;
    }

    /// Single-VM lookups made so far.
    pub fn uuid_lookups(&self) -> usize {
        self.queries.lock().unwrap().iter().filter(|q| q.uuid.is_some()).count()
    }

    pub fn listing_calls(&self) -> usize {
        self.queries.lock().unwrap().iter().filter(|q| q.state.is_some()).count()
    }
}

#[async_trait]
impl InventoryClient for MockInventory {
    async fn list_vms(&self, query: &VmQuery) -> Result<Vec<Value>> {
        self.queries.lock().unwrap().push(query.clone());

        if let Some(uuid) = &query.uuid {
            return Ok(self.current.lock().unwrap().get(uuid).cloned().into_iter().collect());
        }

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let listing = self.listing.lock().unwrap().clone();
        let start = match &query.marker {
            Some(marker) => {
                let marker: Value = serde_json::from_str(marker).unwrap();
                let last = listing.iter().position(|v| v["uuid"] == marker["uuid"]);
                last.map(|i| i + 1).unwrap_or(listing.len())
            }
            None => 0,
        };
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(listing.into_iter().skip(start).take(limit).collect())
    }
}

/// Host directory with optional transient failure.
#[derive(Default)]
pub struct MockDirectory {
    servers: Mutex<Vec<HostRecord>>,
    pub failing: AtomicBool,
    pub get_calls: AtomicUsize,
}

impl MockDirectory {
    pub fn new(servers: Vec<HostRecord>) -> Self {
        Self { servers: Mutex::new(servers), ..Self::default() }
    }

    pub fn remove(&self, uuid: &str) {
        self.servers.lock().unwrap().retain(|s| s.uuid != uuid);
    }

    fn unavailable() -> CmonError {
        CmonError::Backend {
            service: "cnapi",
            reason: "503 Service Unavailable".into(),
            transient: true,
        }
    }
}

#[async_trait]
impl HostDirectory for MockDirectory {
    async fn list_servers(&self, query: &ServerQuery) -> Result<Vec<Value>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        let with_sysinfo = query.extras.as_deref() == Some("sysinfo");
        let servers = self.servers.lock().unwrap().clone();
        Ok(servers
            .into_iter()
            .skip(query.offset.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|mut s| {
                // Like the real listing, sysinfo only comes back on request.
                if !with_sysinfo {
                    s.sysinfo = None;
                }
                serde_json::to_value(s).unwrap()
            })
            .collect())
    }

    async fn get_server(&self, server_uuid: &str) -> Result<Option<HostRecord>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        Ok(self.servers.lock().unwrap().iter().find(|s| s.uuid == server_uuid).cloned())
    }
}

/// Agent that records what it was asked and answers with a fixed body.
#[derive(Default)]
pub struct MockAgent {
    pub refreshes: Mutex<Vec<SocketAddr>>,
    pub requests: Mutex<Vec<AgentRequest>>,
    pub unreachable: AtomicBool,
    /// Send one chunk, then fail with a connection reset.
    pub resets_midstream: AtomicBool,
}

impl MockAgent {
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl AgentClient for MockAgent {
    async fn refresh(&self, addr: SocketAddr) -> Result<()> {
        self.refreshes.lock().unwrap().push(addr);
        Ok(())
    }

    async fn fetch_metrics(&self, request: AgentRequest) -> Result<AgentResponse> {
        self.requests.lock().unwrap().push(request.clone());
        if self.unreachable.load(Ordering::SeqCst) {
            let reason = "connection refused".into();
            return Err(CmonError::AgentUnreachable { addr: request.addr.ip(), reason });
        }

        let chunks: Vec<Result<Bytes>> = if self.resets_midstream.load(Ordering::SeqCst) {
            vec![
                Ok(Bytes::from("# HELP cpu_usage CPU usage\n")),
                Err(CmonError::AgentStream {
                    addr: request.addr.ip(),
                    reason: "connection reset".into(),
                }),
            ]
        } else {
            vec![Ok(Bytes::from("# HELP cpu_usage CPU usage\n")), Ok(Bytes::from("cpu_usage 42\n"))]
        };
        Ok(AgentResponse { content_encoding: None, body: futures::stream::iter(chunks).boxed() })
    }
}

/// Cache, resolver and pipeline wired to the given mocks.
pub struct Harness {
    pub cache: Arc<Cache>,
    pub inventory: Arc<MockInventory>,
    pub directory: Arc<MockDirectory>,
    pub agent: Arc<MockAgent>,
    pub resolver: Arc<AdminResolver>,
    pub pipeline: Arc<ItemPipeline>,
}

impl Harness {
    pub fn new(inventory: MockInventory, directory: MockDirectory, retry: RetryPolicy) -> Self {
        let cache = Cache::new();
        let inventory = Arc::new(inventory);
        let directory = Arc::new(directory);
        let agent = Arc::new(MockAgent::default());
        let resolver = Arc::new(AdminResolver::new(
            Arc::clone(&cache),
            directory.clone(),
            agent.clone(),
            AGENT_PORT,
            retry,
        ));
        let pipeline =
            ItemPipeline::new(Arc::clone(&cache), inventory.clone(), Arc::clone(&resolver));
        let pipeline = Arc::new(pipeline);
        Self { cache, inventory, directory, agent, resolver, pipeline }
    }

    /// Empty inventory and a directory that knows one host.
    pub fn with_host(server_uuid: &str, admin_ip: &str) -> Self {
        Self::with_inventory(MockInventory::new(vec![]), server_uuid, admin_ip)
    }

    pub fn with_inventory(inventory: MockInventory, server_uuid: &str, admin_ip: &str) -> Self {
        Self::new(inventory, MockDirectory::new(vec![host(server_uuid, admin_ip)]), fast_retry(3))
    }

    pub async fn process(&self, event: CacheEvent) -> ItemOutcome {
        self.pipeline.process(event).await.unwrap()
    }

    /// Poller over the mock directory with a long interval.
    pub fn poller(&self, page_size: usize) -> HostPoller {
        let pipeline = Arc::clone(&self.pipeline);
        HostPoller::new(self.directory.clone(), pipeline, Duration::from_secs(300), page_size)
    }
}
