//! Compute node directory client.

use super::pager::{Cursor, PageSource};
use super::{HostDirectory, ServerQuery};
use crate::backoff::{backend_error, RetryPolicy};
use crate::error::{CmonError, Result};
use crate::types::HostRecord;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

const SERVICE: &str = "cnapi";

/// Listings leave sysinfo out unless asked; the resolver needs its NICs.
pub const SYSINFO_EXTRAS: &str = "sysinfo";

/// `GET /servers` and `GET /servers/:uuid` over HTTP.
#[derive(Clone)]
pub struct HttpHostDirectory {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl HttpHostDirectory {
    pub fn new(base_url: &str, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| CmonError::InvalidConfig {
                reason: format!("Failed to create directory HTTP client: {}", e),
            })?;

        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string(), retry })
    }

    async fn list_once(&self, query: &ServerQuery) -> Result<Vec<Value>> {
        let url = format!("{}/servers", self.base_url);
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
            reason: format!("invalid /servers body: {}", e),
            transient: false,
        })
    }
}

#[async_trait]
impl HostDirectory for HttpHostDirectory {
    #[instrument(skip(self), fields(service = SERVICE))]
    async fn list_servers(&self, query: &ServerQuery) -> Result<Vec<Value>> {
        let servers = self.retry.retry("list servers", || self.list_once(query)).await?;
        debug!(count = servers.len(), "Listed servers");
        Ok(servers)
    }

    /// Single attempt; the resolver owns the retry loop for lookups.
    #[instrument(skip(self), fields(service = SERVICE))]
    async fn get_server(&self, server_uuid: &str) -> Result<Option<HostRecord>> {
        let url = format!("{}/servers/{}", self.base_url, server_uuid);
        let response =
            self.client.get(&url).send().await.map_err(|e| backend_error(SERVICE, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = response.error_for_status().map_err(|e| backend_error(SERVICE, e))?;
        let record = response.json::<HostRecord>().await.map_err(|e| CmonError::Backend {
            service: SERVICE,
            reason: format!("invalid /servers/{} body: {}", server_uuid, e),
            transient: false,
        })?;
        Ok(Some(record))
    }
}

/// Setup hosts, paged by offset.
pub struct HostPages {
    directory: Arc<dyn HostDirectory>,
}

impl HostPages {
    pub fn new(directory: Arc<dyn HostDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl PageSource for HostPages {
    async fn fetch(&self, cursor: &Cursor, limit: usize) -> Result<Vec<Value>> {
        let offset = match cursor {
            Cursor::Start => 0,
            Cursor::Offset(n) => *n,
            Cursor::Marker(_) => {
                return Err(CmonError::Internal("host listing takes offset cursors".to_string()))
            }
        };
        let query = ServerQuery {
            setup: Some(true),
            extras: Some(SYSINFO_EXTRAS.to_string()),
            offset: Some(offset),
            limit: Some(limit),
        };
        self.directory.list_servers(&query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_params() {
        let query = ServerQuery {
            setup: Some(true),
            extras: Some(SYSINFO_EXTRAS.to_string()),
            offset: Some(200),
            limit: Some(100),
        };
        assert_eq!(
            query.params(),
            vec![
                ("setup", "true".to_string()),
                ("extras", "sysinfo".to_string()),
                ("offset", "200".to_string()),
                ("limit", "100".to_string())
            ]
        );
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let retry = crate::config::RetryConfig::default().policy();
        let directory = HttpHostDirectory::new("http://cnapi.local/", retry).unwrap();
        assert_eq!(directory.base_url, "http://cnapi.local");
    }
}
