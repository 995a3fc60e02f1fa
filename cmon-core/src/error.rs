//! Error types for cmon.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::net::IpAddr;
use thiserror::Error;

/// Result type alias for cmon operations.
pub type Result<T> = std::result::Result<T, CmonError>;

/// Main error type for cmon.
#[derive(Error, Debug)]
pub enum CmonError {
    // Record errors
    #[error("Malformed {kind} record: {reason}")]
    MalformedRecord { kind: &'static str, reason: String },

    #[error("Upstream protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    // Backend errors
    #[error("{service} request failed: {reason}")]
    Backend { service: &'static str, reason: String, transient: bool },

    #[error("Host {server_uuid} has no NIC named \"admin\"")]
    NoAdminInterface { server_uuid: String },

    #[error("Agent at {addr} unreachable: {reason}")]
    AgentUnreachable { addr: IpAddr, reason: String },

    #[error("Agent at {addr} returned status {status}")]
    AgentStatus { addr: IpAddr, status: u16 },

    #[error("Agent stream from {addr} failed: {reason}")]
    AgentStream { addr: IpAddr, reason: String },

    // Changefeed errors
    #[error("Changefeed failed: {reason}")]
    FeedFatal { reason: String },

    #[error("Changefeed closed")]
    FeedClosed,

    #[error("Cache update worker exited: {reason}")]
    WorkerExited { reason: String },

    // Request errors
    #[error("Not found: {target}")]
    NotFound { target: String },

    #[error("Forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("Unauthorized")]
    Unauthorized,

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CmonError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Create a NotFound error for the given target.
    pub fn not_found(target: impl Into<String>) -> Self {
        Self::NotFound { target: target.into() }
    }

    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Backend { transient, .. } => *transient,
            Self::AgentUnreachable { .. } | Self::AgentStatus { .. } => true,
            _ => false,
        }
    }

    /// Whether this error means the process can no longer keep the cache correct.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation { .. }
                | Self::FeedFatal { .. }
                | Self::FeedClosed
                | Self::WorkerExited { .. }
        )
    }
}
