//! Route handlers.

use super::error::ApiError;
use super::server::AppState;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use cmon_core::cache::CacheStats;
use cmon_core::discovery::{discover_hosts, discover_vms, ContainerList, HostList};
use cmon_core::observability::health::{HealthCheck, HealthStatus};
use cmon_core::{Caller, CmonError, HostPrefix};
use serde::{Deserialize, Serialize};

const TEXT_PLAIN: &str = "text/plain";

/// `GET /metrics` on a uuid host.
pub async fn metrics(
    State(state): State<AppState>,
    Extension(prefix): Extension<HostPrefix>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let HostPrefix::Target(target) = prefix else {
        return Err(CmonError::not_found("/metrics requires a target host").into());
    };

    let accept_encoding = headers.get(header::ACCEPT_ENCODING).and_then(|v| v.to_str().ok());
    let upstream = state.proxy.forward(&target, &caller, accept_encoding).await?;

    let mut response =
        Response::builder().status(StatusCode::OK).header(header::CONTENT_TYPE, TEXT_PLAIN);
    if let Some(encoding) = upstream.content_encoding {
        response = response.header(header::CONTENT_ENCODING, encoding);
    }
    response
        .body(Body::from_stream(upstream.body))
        .map_err(|e| CmonError::internal(e).into())
}

#[derive(Debug, Default, Deserialize)]
pub struct DiscoverParams {
    /// Comma-separated group names.
    pub groups: Option<String>,
}

impl DiscoverParams {
    fn groups(&self) -> Option<Vec<String>> {
        self.groups.as_deref().map(cmon_core::normalize::parse_groups).filter(|g| !g.is_empty())
    }
}

/// `GET /v1/discover`: the caller's own VMs.
pub async fn discover(
    State(state): State<AppState>,
    Extension(prefix): Extension<HostPrefix>,
    Extension(caller): Extension<Caller>,
    Query(params): Query<DiscoverParams>,
) -> Result<Json<ContainerList>, ApiError> {
    require_discovery(&prefix)?;
    let groups = params.groups();
    Ok(Json(discover_vms(&state.cache, &caller.account_uuid, groups.as_deref()).await))
}

/// `GET /v1/gz/discover`: known hosts, operators only.
pub async fn discover_gz(
    State(state): State<AppState>,
    Extension(prefix): Extension<HostPrefix>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<HostList>, ApiError> {
    require_discovery(&prefix)?;
    if !caller.operator {
        let reason = format!("{} is not an operator", caller.login);
        return Err(CmonError::Forbidden { reason }.into());
    }
    Ok(Json(discover_hosts(&state.cache).await))
}

fn require_discovery(prefix: &HostPrefix) -> Result<(), ApiError> {
    match prefix {
        HostPrefix::Discovery => Ok(()),
        HostPrefix::Target(target) => {
            Err(CmonError::not_found(format!("discovery on {}", target)).into())
        }
    }
}

/// `GET /_ping`
pub async fn ping() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], "OK")
}

/// `GET /<version>/_ping`
pub async fn versioned_ping(Path(version): Path<String>) -> Result<Response, ApiError> {
    if !version.starts_with('v') {
        return Err(CmonError::not_found(format!("/{}/_ping", version)).into());
    }
    Ok(ping().await.into_response())
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    #[serde(flatten)]
    pub health: HealthCheck,
    pub cache: CacheStats,
}

/// `GET /_health`
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let health = state.health.get_health().await;
    let status = match health.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };
    let cache = state.cache.stats().await;
    (status, Json(HealthReport { health, cache }))
}
