//! Mapping of core errors onto HTTP responses.
//!
//! Clients only ever see not-found, forbidden, unauthorized or a generic
//! server error; the detail stays in the log.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cmon_core::CmonError;
use serde::Serialize;
use tracing::{debug, error, info};

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

/// Error returned by handlers and middleware.
#[derive(Debug)]
pub struct ApiError(pub CmonError);

impl From<CmonError> for ApiError {
    fn from(err: CmonError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            CmonError::NotFound { .. } => StatusCode::NOT_FOUND,
            CmonError::Forbidden { .. } => StatusCode::FORBIDDEN,
            CmonError::Unauthorized => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (code, message) = match status {
            StatusCode::NOT_FOUND => {
                debug!(error = %self.0, "Request target not found");
                ("NotFound", self.0.to_string())
            }
            StatusCode::FORBIDDEN => {
                info!(error = %self.0, "Request denied");
                ("Forbidden", "You do not have access to this resource".to_string())
            }
            StatusCode::UNAUTHORIZED => ("Unauthorized", "Authentication required".to_string()),
            _ => {
                error!(error = %self.0, "Request failed");
                ("InternalServer", "Internal error".to_string())
            }
        };

        (status, Json(ErrorBody { code, message })).into_response()
    }
}
