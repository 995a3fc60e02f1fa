//! HTTP API: metrics proxy, discovery and liveness endpoints.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod server;

pub use server::{router, serve, AppState};
