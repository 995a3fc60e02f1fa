//! Outbound collaborators: inventory, host directory, agent, changefeed.
//!
//! Each service is reached through a trait so that the sync engine, resolver
//! and proxy can be driven by in-memory fakes in tests.

use crate::error::Result;
use crate::types::HostRecord;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde_json::Value;
use std::net::SocketAddr;

pub mod agent;
pub mod changefeed;
pub mod directory;
pub mod inventory;
pub mod pager;

pub use agent::HttpAgent;
pub use changefeed::HttpChangefeed;
pub use directory::{HostPages, HttpHostDirectory};
pub use inventory::{inventory_marker, HttpInventory, InventoryPages};
pub use pager::{Cursor, CursorStyle, Page, PageSource, Pager};

/// Filter for `GET /vms`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmQuery {
    pub uuid: Option<String>,
    pub state: Option<String>,
    /// Opaque continuation marker.
    pub marker: Option<String>,
    pub limit: Option<usize>,
}

impl VmQuery {
    pub fn by_uuid(uuid: &str) -> Self {
        Self { uuid: Some(uuid.to_string()), ..Self::default() }
    }

    pub(crate) fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(uuid) = &self.uuid {
            params.push(("uuid", uuid.clone()));
        }
        if let Some(state) = &self.state {
            params.push(("state", state.clone()));
        }
        if let Some(marker) = &self.marker {
            params.push(("marker", marker.clone()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit", limit.to_string()));
        }
        params
    }
}

/// Filter for `GET /servers`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerQuery {
    pub setup: Option<bool>,
    /// Extra sections to include, e.g. `sysinfo`. Omitted by the listing otherwise.
    pub extras: Option<String>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl ServerQuery {
    pub(crate) fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(setup) = self.setup {
            params.push(("setup", setup.to_string()));
        }
        if let Some(extras) = &self.extras {
            params.push(("extras", extras.clone()));
        }
        if let Some(offset) = self.offset {
            params.push(("offset", offset.to_string()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit", limit.to_string()));
        }
        params
    }
}

/// VM inventory service.
#[async_trait]
pub trait InventoryClient: Send + Sync {
    /// Raw VM records matching the query.
    async fn list_vms(&self, query: &VmQuery) -> Result<Vec<Value>>;
}

/// Compute node directory service.
#[async_trait]
pub trait HostDirectory: Send + Sync {
    /// Raw host records matching the query.
    async fn list_servers(&self, query: &ServerQuery) -> Result<Vec<Value>>;

    /// A single host, or `None` when the directory no longer knows it.
    async fn get_server(&self, server_uuid: &str) -> Result<Option<HostRecord>>;
}

/// A metrics request to a host agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub addr: SocketAddr,
    pub path: String,
    /// Value of the visibility header, for VM-directed requests.
    pub visibility: Option<String>,
    pub accept_encoding: Option<String>,
}

impl AgentRequest {
    pub fn url(&self) -> String {
        format!("http://{}{}", self.addr, self.path)
    }
}

/// Streaming response from a host agent.
pub struct AgentResponse {
    pub content_encoding: Option<String>,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for AgentResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentResponse").field("content_encoding", &self.content_encoding).finish()
    }
}

/// Per-host metrics agent.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Ask the agent to refresh its view of the host's VMs.
    async fn refresh(&self, addr: SocketAddr) -> Result<()>;

    /// Issue a streaming metrics GET.
    async fn fetch_metrics(&self, request: AgentRequest) -> Result<AgentResponse>;
}
