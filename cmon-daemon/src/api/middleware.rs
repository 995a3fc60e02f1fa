//! Request middleware: host enforcement, identity, authorization and
//! response decoration.
//!
//! The TLS-terminating front end verifies the client certificate and passes
//! the account it maps to in trusted headers.

use super::error::ApiError;
use super::server::AppState;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use cmon_core::{authorize, Caller, CmonError, HostPrefix};
use std::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

pub const ACCOUNT_UUID_HEADER: &str = "x-cmon-account-uuid";
pub const ACCOUNT_LOGIN_HEADER: &str = "x-cmon-account-login";
pub const OPERATOR_HEADER: &str = "x-cmon-operator";

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const RESPONSE_TIME_HEADER: &str = "x-response-time";
pub const SERVER_NAME_HEADER: &str = "x-server-name";

/// Reject hosts whose leading label is neither `cmon` nor a uuid.
pub async fn enforce_host(mut request: Request, next: Next) -> Result<Response, ApiError> {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| request.uri().host())
        .ok_or_else(|| CmonError::not_found("request without a host"))?;

    let prefix = HostPrefix::parse(host)?;
    trace!(?prefix, "Host prefix accepted");
    request.extensions_mut().insert(prefix);
    Ok(next.run(request).await)
}

/// Build the caller identity from the trusted headers.
pub async fn authenticate(mut request: Request, next: Next) -> Result<Response, ApiError> {
    let caller = caller_from_headers(request.headers())?;
    request.extensions_mut().insert(caller);
    Ok(next.run(request).await)
}

fn caller_from_headers(headers: &HeaderMap) -> Result<Caller, ApiError> {
    let text = |name: &str| {
        headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim).filter(|v| !v.is_empty())
    };

    let account_uuid = text(ACCOUNT_UUID_HEADER).ok_or(CmonError::Unauthorized)?;
    let login = text(ACCOUNT_LOGIN_HEADER).ok_or(CmonError::Unauthorized)?;
    let operator = matches!(text(OPERATOR_HEADER), Some("true") | Some("1"));

    Ok(Caller::new(account_uuid, login, operator))
}

/// Check the caller against the addressed target.
pub async fn authorize_target(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let extensions = request.extensions();
    let (prefix, caller) = match (extensions.get::<HostPrefix>(), extensions.get::<Caller>()) {
        (Some(prefix), Some(caller)) => (prefix.clone(), caller.clone()),
        _ => {
            let reason = "authorization ran before host or identity checks";
            return Err(CmonError::Internal(reason.into()).into());
        }
    };

    authorize(&state.cache, &caller, &prefix).await?;
    Ok(next.run(request).await)
}

/// Stamp request id, response time and server name on every response.
pub async fn decorate_response(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let mut response = next.run(request).await;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let status = response.status();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    headers.insert(RESPONSE_TIME_HEADER, HeaderValue::from(elapsed_ms));
    if let Ok(value) = HeaderValue::from_str(&state.server_name) {
        headers.insert(SERVER_NAME_HEADER, value);
    }

    metrics::counter!("cmon_http_requests_total", "status" => status.as_u16().to_string())
        .increment(1);
    debug!(%method, %path, status = status.as_u16(), elapsed_ms, %request_id, "Handled request");
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(matches!(caller_from_headers(&headers), Err(ApiError(CmonError::Unauthorized))));

        headers.insert(ACCOUNT_UUID_HEADER, HeaderValue::from_static("o1"));
        assert!(caller_from_headers(&headers).is_err(), "login is required");

        headers.insert(ACCOUNT_LOGIN_HEADER, HeaderValue::from_static("alice"));
        assert_eq!(caller_from_headers(&headers).unwrap(), Caller::new("o1", "alice", false));

        headers.insert(OPERATOR_HEADER, HeaderValue::from_static("true"));
        assert!(caller_from_headers(&headers).unwrap().operator);

        headers.insert(ACCOUNT_UUID_HEADER, HeaderValue::from_static("  "));
        assert!(caller_from_headers(&headers).is_err());
    }
}
