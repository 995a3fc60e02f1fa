//! Router assembly and the HTTP listener.

use super::{handlers, middleware};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::get;
use axum::Router;
use cmon_core::{Cache, HealthChecker, MetricsProxy};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<Cache>,
    pub proxy: Arc<MetricsProxy>,
    pub health: HealthChecker,
    /// Value of the `x-server-name` response header.
    pub server_name: Arc<str>,
}

/// Build the API router.
///
/// Metrics and discovery routes pass host enforcement, then identity, then
/// authorization. Liveness and health routes skip all three.
pub fn router(state: AppState) -> Router {
    // Route layers run outermost-last: enforce_host sees the request first.
    let guarded = Router::new()
        .route("/metrics", get(handlers::metrics))
        .route("/v1/discover", get(handlers::discover))
        .route("/v1/gz/discover", get(handlers::discover_gz))
        .route_layer(from_fn_with_state(state.clone(), middleware::authorize_target))
        .route_layer(from_fn(middleware::authenticate))
        .route_layer(from_fn(middleware::enforce_host));

    Router::new()
        .route("/_ping", get(handlers::ping))
        .route("/:version/_ping", get(handlers::versioned_ping))
        .route("/_health", get(handlers::health))
        .merge(guarded)
        .layer(from_fn_with_state(state.clone(), middleware::decorate_response))
        .with_state(state)
}

/// Serve until `cancel` fires, then drain in-flight requests.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "HTTP API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("HTTP API stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::middleware::{
        ACCOUNT_LOGIN_HEADER, ACCOUNT_UUID_HEADER, OPERATOR_HEADER, REQUEST_ID_HEADER,
        RESPONSE_TIME_HEADER, SERVER_NAME_HEADER,
    };
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use bytes::Bytes;
    use cmon_core::clients::{AgentClient, AgentRequest, AgentResponse};
    use cmon_core::types::{HostEntry, RecordSource, VmRecord, VmState};
    use cmon_core::CmonError;
    use futures::StreamExt;
    use serde_json::Value;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tower::ServiceExt;

    const VM: &str = "5a0a1ac6-7a42-4b2e-9b62-8d6a7d8d3c11";
    const OTHER_VM: &str = "6b1b2bd7-8b53-4c3f-8c73-9e7b8e9e4d22";
    const HOST: &str = "44454c4c-3800-104b-8052-b2c04f4e3132";
    const CMON: &str = "cmon.example.com";

    #[derive(Default)]
    struct StubAgent {
        requests: Mutex<Vec<AgentRequest>>,
        unreachable: AtomicBool,
    }

    #[async_trait]
    impl AgentClient for StubAgent {
        async fn refresh(&self, _addr: SocketAddr) -> cmon_core::Result<()> {
            Ok(())
        }

        async fn fetch_metrics(&self, request: AgentRequest) -> cmon_core::Result<AgentResponse> {
            self.requests.lock().unwrap().push(request.clone());
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(CmonError::AgentUnreachable {
                    addr: request.addr.ip(),
                    reason: "refused".into(),
                });
            }
            let chunks: Vec<cmon_core::Result<Bytes>> = vec![Ok(Bytes::from("cpu_usage 42\n"))];
            let body = futures::stream::iter(chunks).boxed();
            Ok(AgentResponse { content_encoding: None, body })
        }
    }

    fn record(vm_uuid: &str, owner: &str, state: VmState) -> VmRecord {
        VmRecord {
            vm_uuid: vm_uuid.to_string(),
            server_uuid: HOST.to_string(),
            owner_uuid: owner.to_string(),
            alias: Some("web0".to_string()),
            brand: Some("lx".to_string()),
            image_uuid: None,
            state,
            groups: vec!["web".to_string()],
            affinity_group: None,
            core: false,
            source: RecordSource::Bootstrap,
            cached_date: 1,
        }
    }

    async fn app() -> (Router, Arc<Cache>, Arc<StubAgent>) {
        let cache = Cache::new();
        cache.upsert_vm(record(VM, "o1", VmState::Running)).await;
        cache.upsert_vm(record(OTHER_VM, "o2", VmState::Running)).await;
        let entry = HostEntry {
            admin_ip: "10.0.0.5".parse().unwrap(),
            hostname: Some("cn1".into()),
            resolved_at: 1,
        };
        cache.set_host(HOST, entry).await;

        let agent = Arc::new(StubAgent::default());
        let proxy = Arc::new(MetricsProxy::new(Arc::clone(&cache), agent.clone(), 9163, false));
        let state = AppState {
            cache: Arc::clone(&cache),
            proxy,
            health: HealthChecker::new(),
            server_name: Arc::from("cmon-test"),
        };
        (router(state), cache, agent)
    }

    async fn send(app: &Router, request: Request<Body>) -> axum::response::Response {
        app.clone().oneshot(request).await.unwrap()
    }

    fn get(uri: &str, host: &str, account: Option<(&str, bool)>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri).header(header::HOST, host);
        if let Some((uuid, operator)) = account {
            builder = builder
                .header(ACCOUNT_UUID_HEADER, uuid)
                .header(ACCOUNT_LOGIN_HEADER, format!("login-{}", uuid))
                .header(OPERATOR_HEADER, operator.to_string());
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_ping_is_unauthenticated() {
        let (app, _, _) = app().await;
        for uri in ["/_ping", "/v1/_ping"] {
            let response = send(&app, get(uri, "anything.example.com", None)).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain; charset=utf-8");
            assert_eq!(response.headers()[SERVER_NAME_HEADER], "cmon-test");
            assert!(response.headers().contains_key(RESPONSE_TIME_HEADER));
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            assert_eq!(&bytes[..], b"OK");
        }

        let response = send(&app, get("/x1/_ping", CMON, None)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_request_id_is_echoed() {
        let (app, _, _) = app().await;
        let mut request = get("/_ping", CMON, None);
        request.headers_mut().insert(REQUEST_ID_HEADER, "req-123".parse().unwrap());
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-123");
    }

    #[tokio::test]
    async fn test_host_checked_before_identity() {
        let (app, _, _) = app().await;
        let response = send(&app, get("/v1/discover", "www.example.com", None)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(&app, get("/v1/discover", CMON, None)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_metrics_for_owned_vm() {
        let (app, _, agent) = app().await;
        let host = format!("{}.cmon.example.com", VM);
        let response = send(&app, get("/metrics", &host, Some(("o1", false)))).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"cpu_usage 42\n");

        let requests = agent.requests.lock().unwrap();
        assert_eq!(requests[0].url(), format!("http://10.0.0.5:9163/v1/{}/metrics", VM));
    }

    #[tokio::test]
    async fn test_metrics_access_rules() {
        let (app, _, agent) = app().await;
        let vm_host = format!("{}.cmon.example.com", VM);
        let cn_host = format!("{}.cmon.example.com", HOST);

        let response = send(&app, get("/metrics", &vm_host, Some(("o2", false)))).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = send(&app, get("/metrics", &cn_host, Some(("o1", false)))).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let unknown = "00000000-0000-0000-0000-000000000000.cmon.example.com";
        let response = send(&app, get("/metrics", unknown, Some(("o1", true)))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(&app, get("/metrics", CMON, Some(("o1", false)))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(agent.requests.lock().unwrap().is_empty());

        let response = send(&app, get("/metrics", &cn_host, Some(("admin", true)))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(agent.requests.lock().unwrap()[0].url(), "http://10.0.0.5:9163/v1/gz/metrics");
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_server_error() {
        let (app, cache, agent) = app().await;
        agent.unreachable.store(true, Ordering::SeqCst);
        let cn_host = format!("{}.cmon.example.com", HOST);

        let response = send(&app, get("/metrics", &cn_host, Some(("admin", true)))).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["code"], "InternalServer");
        assert!(!cache.has_host(HOST).await);

        // The host is gone until it resolves again.
        let response = send(&app, get("/metrics", &cn_host, Some(("admin", true)))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_discover_lists_own_vms() {
        let (app, _, _) = app().await;
        let response = send(&app, get("/v1/discover", CMON, Some(("o1", false)))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let containers = body["containers"].as_array().unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0]["vm_uuid"], VM);
        assert_eq!(containers[0]["vm_alias"], "web0");

        let response = send(&app, get("/v1/discover?groups=db", CMON, Some(("o1", false)))).await;
        assert!(body_json(response).await["containers"].as_array().unwrap().is_empty());

        let vm_host = format!("{}.cmon.example.com", VM);
        let response = send(&app, get("/v1/discover", &vm_host, Some(("o1", false)))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_gz_discover_is_operator_only() {
        let (app, _, _) = app().await;
        let response = send(&app, get("/v1/gz/discover", CMON, Some(("o1", false)))).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = send(&app, get("/v1/gz/discover", CMON, Some(("admin", true)))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["cns"][0]["server_uuid"], HOST);
        assert_eq!(body["cns"][0]["hostname"], "cn1");
    }

    #[tokio::test]
    async fn test_health_reports_cache() {
        let (app, _, _) = app().await;
        let response = send(&app, get("/_health", "localhost", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["cache"]["vms"], 2);
        assert_eq!(body["cache"]["hosts"], 1);
    }
}
