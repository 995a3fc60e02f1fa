//! VM inventory client.

use super::pager::{Cursor, PageSource};
use super::{InventoryClient, VmQuery};
use crate::backoff::{backend_error, RetryPolicy};
use crate::error::{CmonError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

const SERVICE: &str = "vmapi";

/// `GET /vms` over HTTP.
#[derive(Clone)]
pub struct HttpInventory {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl HttpInventory {
    pub fn new(base_url: &str, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| CmonError::InvalidConfig {
                reason: format!("Failed to create inventory HTTP client: {}", e),
            })?;

        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string(), retry })
    }

    async fn list_once(&self, query: &VmQuery) -> Result<Vec<Value>> {
        let url = format!("{}/vms", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&query.params())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| backend_error(SERVICE, e))?;

        response.json::<Vec<Value>>().await.map_err(|e| CmonError::Backend {
            service: SERVICE,
            reason: format!("invalid /vms body: {}", e),
            transient: false,
        })
    }
}

#[async_trait]
impl InventoryClient for HttpInventory {
    #[instrument(skip(self), fields(service = SERVICE))]
    async fn list_vms(&self, query: &VmQuery) -> Result<Vec<Value>> {
        let vms = self.retry.retry("list vms", || self.list_once(query)).await?;
        debug!(count = vms.len(), "Listed VMs");
        Ok(vms)
    }
}

/// Continuation marker for the inventory: `{"uuid":"<last vm>"}`.
pub fn inventory_marker(record: &Value) -> Option<String> {
    let uuid = record.get("uuid")?.as_str()?;
    Some(serde_json::json!({ "uuid": uuid }).to_string())
}

/// Inventory listing filtered by state, as a [`PageSource`].
pub struct InventoryPages {
    client: Arc<dyn InventoryClient>,
    state: String,
}

impl InventoryPages {
    pub fn new(client: Arc<dyn InventoryClient>, state: impl Into<String>) -> Self {
        Self { client, state: state.into() }
    }
}

#[async_trait]
impl PageSource for InventoryPages {
    async fn fetch(&self, cursor: &Cursor, limit: usize) -> Result<Vec<Value>> {
        let marker = match cursor {
            Cursor::Start => None,
            Cursor::Marker(m) => Some(m.clone()),
            Cursor::Offset(_) => {
                return Err(CmonError::Internal(
                    "inventory listing takes marker cursors".to_string(),
                ));
            }
        };
        let query =
            VmQuery { state: Some(self.state.clone()), marker, limit: Some(limit), uuid: None };
        self.client.list_vms(&query).await
    }
}
