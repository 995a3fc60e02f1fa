//! Metrics routing proxy.
//!
//! Maps a target uuid to the agent that serves it and streams the agent's
//! answer back. A connection error on a whole-host target evicts the host
//! from the cache, whether it happens before the headers or mid-stream.
//! VM-directed failures leave the host entry alone.

use crate::cache::Cache;
use crate::clients::agent::{vm_metrics_path, HOST_METRICS_PATH};
use crate::clients::{AgentClient, AgentRequest};
use crate::error::{CmonError, Result};
use crate::observability::metrics;
use crate::types::Caller;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use futures::stream::{BoxStream, Stream};
use serde::Serialize;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, error, instrument, warn};

/// What a route points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Host { server_uuid: String },
    Vm { vm_uuid: String, server_uuid: String },
}

impl RouteTarget {
    fn kind(&self) -> &'static str {
        match self {
            Self::Host { .. } => "host",
            Self::Vm { .. } => "vm",
        }
    }
}

/// A resolved upstream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub target: RouteTarget,
    pub addr: SocketAddr,
    pub path: String,
    /// Encoded visibility header, for VM targets only.
    pub visibility: Option<String>,
}

impl Route {
    pub fn url(&self) -> String {
        format!("http://{}{}", self.addr, self.path)
    }
}

#[derive(Serialize)]
struct Visibility {
    core_operator: bool,
}

/// Base64 JSON visibility flags sent to the agent.
pub fn encode_visibility(core_operator: bool) -> String {
    let json = serde_json::to_vec(&Visibility { core_operator }).unwrap_or_default();
    STANDARD.encode(json)
}

/// How a metrics stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Completed,
    /// Dropped before the upstream finished.
    ClientGone,
    UpstreamFailed,
}

type CompletionFn = Box<dyn FnOnce(StreamEnd) + Send>;

/// Upstream body with a completion guard. Callbacks fire exactly once, with
/// whichever end is observed first. Dropping the stream early drops the
/// upstream response.
pub struct MetricsStream {
    inner: Option<BoxStream<'static, Result<Bytes>>>,
    callbacks: Vec<CompletionFn>,
}

impl MetricsStream {
    pub fn new(inner: BoxStream<'static, Result<Bytes>>) -> Self {
        Self { inner: Some(inner), callbacks: Vec::new() }
    }

    /// Register a callback for the end of the stream.
    pub fn on_complete(mut self, callback: impl FnOnce(StreamEnd) + Send + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    fn finish(&mut self, end: StreamEnd) {
        self.inner = None;
        for callback in self.callbacks.drain(..) {
            callback(end);
        }
    }
}

impl Stream for MetricsStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(e))) => {
                this.finish(StreamEnd::UpstreamFailed);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish(StreamEnd::Completed);
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for MetricsStream {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.finish(StreamEnd::ClientGone);
        }
    }
}

impl std::fmt::Debug for MetricsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsStream").field("open", &self.inner.is_some()).finish()
    }
}

/// Response headers and body relayed to the client.
#[derive(Debug)]
pub struct MetricsResponse {
    pub content_encoding: Option<String>,
    pub body: MetricsStream,
}

/// Routes metrics requests to host agents.
pub struct MetricsProxy {
    cache: Arc<Cache>,
    agent: Arc<dyn AgentClient>,
    agent_port: u16,
    compression_enabled: bool,
}

impl MetricsProxy {
    pub fn new(
        cache: Arc<Cache>,
        agent: Arc<dyn AgentClient>,
        agent_port: u16,
        compression_enabled: bool,
    ) -> Self {
        Self { cache, agent, agent_port, compression_enabled }
    }

    /// Resolve the upstream for `target` from the cache alone.
    pub async fn route(&self, target: &str, caller: &Caller) -> Result<Route> {
        if let Some(host) = self.cache.get_host(target).await {
            return Ok(Route {
                target: RouteTarget::Host { server_uuid: target.to_string() },
                addr: SocketAddr::new(host.admin_ip, self.agent_port),
                path: HOST_METRICS_PATH.to_string(),
                visibility: None,
            });
        }

        let Some(vm) = self.cache.get_vm(target).await else {
            debug!(target, "Target not in cache");
            return Err(CmonError::not_found(target));
        };

        if !vm.state.is_running() {
            debug!(target, state = %vm.state, "VM is not running");
            return Err(CmonError::not_found(target));
        }

        let Some(host) = self.cache.get_host(&vm.server_uuid).await else {
            warn!(
                vm_uuid = %vm.vm_uuid,
                server_uuid = %vm.server_uuid,
                "No admin address for the VM's host"
            );
            return Err(CmonError::not_found(target));
        };

        Ok(Route {
            addr: SocketAddr::new(host.admin_ip, self.agent_port),
            path: vm_metrics_path(&vm.vm_uuid),
            visibility: Some(encode_visibility(vm.core && caller.operator)),
            target: RouteTarget::Vm { vm_uuid: vm.vm_uuid, server_uuid: vm.server_uuid },
        })
    }

    /// Route and issue the upstream request.
    #[instrument(skip(self, caller, accept_encoding), fields(account = %caller.account_uuid))]
    pub async fn forward(
        &self,
        target: &str,
        caller: &Caller,
        accept_encoding: Option<&str>,
    ) -> Result<MetricsResponse> {
        let route = match self.route(target, caller).await {
            Ok(route) => route,
            Err(e) => {
                metrics::record_proxy_request("unknown", "not_found");
                return Err(e);
            }
        };
        let kind = route.target.kind();

        let request = AgentRequest {
            addr: route.addr,
            path: route.path.clone(),
            visibility: route.visibility.clone(),
            accept_encoding: accept_encoding
                .filter(|_| self.compression_enabled)
                .map(str::to_string),
        };

        let response = match self.agent.fetch_metrics(request).await {
            Ok(response) => response,
            Err(e) => {
                error!(url = %route.url(), error = %e, "Error reaching agent");
                if let (RouteTarget::Host { server_uuid }, CmonError::AgentUnreachable { .. }) =
                    (&route.target, &e)
                {
                    self.cache.evict_host(server_uuid).await;
                    metrics::record_host_eviction();
                }
                metrics::record_proxy_request(kind, "upstream_error");
                return Err(e);
            }
        };

        let url = route.url();
        let cache = Arc::clone(&self.cache);
        let route_target = route.target.clone();
        let body = MetricsStream::new(response.body).on_complete(move |end| {
            match end {
                StreamEnd::Completed => metrics::record_proxy_request(kind, "completed"),
                StreamEnd::ClientGone => {
                    debug!(%url, "Client went away mid-stream");
                    metrics::record_proxy_request(kind, "client_gone");
                }
                StreamEnd::UpstreamFailed => {
                    debug!(%url, "Agent stream broke mid-response");
                    metrics::record_proxy_request(kind, "upstream_failed");
                    if let RouteTarget::Host { server_uuid } = route_target {
                        // Only reached from poll_next, inside the runtime.
                        tokio::spawn(async move {
                            cache.evict_host(&server_uuid).await;
                            metrics::record_host_eviction();
                        });
                    }
                }
            }
        });

        Ok(MetricsResponse { content_encoding: response.content_encoding, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::Mutex;

    #[test]
    fn test_visibility_encoding() {
        assert_eq!(encode_visibility(true), STANDARD.encode(r#"{"core_operator":true}"#));
        let decoded = STANDARD.decode(encode_visibility(false)).unwrap();
        assert_eq!(decoded, br#"{"core_operator":false}"#.to_vec());
    }

    fn recorder() -> (Arc<Mutex<Vec<StreamEnd>>>, impl FnOnce(StreamEnd) + Send + 'static) {
        let ends = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ends);
        (ends, move |end| sink.lock().unwrap().push(end))
    }

    #[tokio::test]
    async fn test_stream_completes_once() {
        let chunks: Vec<Result<Bytes>> = vec![Ok(Bytes::from("a 1\n")), Ok(Bytes::from("b 2\n"))];
        let (ends, callback) = recorder();
        let mut stream =
            MetricsStream::new(futures::stream::iter(chunks).boxed()).on_complete(callback);

        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"a 1\nb 2\n");
        assert!(stream.next().await.is_none());
        drop(stream);
        assert_eq!(*ends.lock().unwrap(), vec![StreamEnd::Completed]);
    }

    #[tokio::test]
    async fn test_client_gone_on_early_drop() {
        let (ends, callback) = recorder();
        let stream = MetricsStream::new(futures::stream::pending().boxed()).on_complete(callback);
        drop(stream);
        assert_eq!(*ends.lock().unwrap(), vec![StreamEnd::ClientGone]);
    }

    #[tokio::test]
    async fn test_upstream_failure_wins() {
        let addr = "10.0.0.5".parse().unwrap();
        let reset = CmonError::AgentStream { addr, reason: "reset".into() };
        let chunks: Vec<Result<Bytes>> = vec![Ok(Bytes::from("a 1\n")), Err(reset)];
        let (ends, callback) = recorder();
        let mut stream =
            MetricsStream::new(futures::stream::iter(chunks).boxed()).on_complete(callback);

        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_err());
        drop(stream);
        assert_eq!(*ends.lock().unwrap(), vec![StreamEnd::UpstreamFailed]);
    }
}
