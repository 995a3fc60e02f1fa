//! Host metrics agent client.

use super::{AgentClient, AgentRequest, AgentResponse};
use crate::error::{CmonError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_ENCODING};
use reqwest::Client;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, instrument};

/// Header carrying base64 JSON visibility flags to the agent.
pub const VISIBILITY_HEADER: &str = "x-cmon-visibility";

pub const REFRESH_PATH: &str = "/v1/refresh";
pub const HOST_METRICS_PATH: &str = "/v1/gz/metrics";

/// Path of the per-VM metrics endpoint.
pub fn vm_metrics_path(vm_uuid: &str) -> String {
    format!("/v1/{}/metrics", vm_uuid)
}

/// Agent access over HTTP.
#[derive(Clone)]
pub struct HttpAgent {
    /// Streaming client; no overall timeout so slow scrapes are not cut off.
    client: Client,
    refresh_client: Client,
}

impl HttpAgent {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let build_err = |e: reqwest::Error| CmonError::InvalidConfig {
            reason: format!("Failed to create agent HTTP client: {}", e),
        };

        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .no_gzip()
            .build()
            .map_err(build_err)?;
        let refresh_client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(connect_timeout * 5)
            .build()
            .map_err(build_err)?;

        Ok(Self { client, refresh_client })
    }
}

#[async_trait]
impl AgentClient for HttpAgent {
    #[instrument(skip(self))]
    async fn refresh(&self, addr: SocketAddr) -> Result<()> {
        let url = format!("http://{}{}", addr, REFRESH_PATH);
        let response = self.refresh_client.post(&url).send().await.map_err(|e| {
            CmonError::AgentUnreachable { addr: addr.ip(), reason: e.to_string() }
        })?;

        if !response.status().is_success() {
            return Err(CmonError::AgentStatus {
                addr: addr.ip(),
                status: response.status().as_u16(),
            });
        }
        debug!("Agent refreshed");
        Ok(())
    }

    #[instrument(skip(self, request), fields(url = %request.url()))]
    async fn fetch_metrics(&self, request: AgentRequest) -> Result<AgentResponse> {
        let addr = request.addr.ip();
        let mut builder = self.client.get(request.url());
        if let Some(visibility) = &request.visibility {
            builder = builder.header(VISIBILITY_HEADER, visibility);
        }
        if let Some(encoding) = &request.accept_encoding {
            builder = builder.header(ACCEPT_ENCODING, encoding);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| CmonError::AgentUnreachable { addr, reason: e.to_string() })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CmonError::AgentStatus { addr, status: status.as_u16() });
        }

        let content_encoding = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map_err(|e| CmonError::AgentStream { addr, reason: e.to_string() })
            })
            .boxed();

        Ok(AgentResponse { content_encoding, body })
    }
}
