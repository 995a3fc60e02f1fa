//! Subsystem health tracking for the `/_health` endpoint.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Subsystem name for the changefeed/bootstrap engine.
pub const CACHE_SYNC: &str = "cache-sync";
/// Subsystem name for the host directory poller.
pub const HOST_POLL: &str = "host-poll";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Aggregated health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub version: String,
    pub subsystems: Vec<SubsystemHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsystemHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
}

/// Tracks the status of each registered subsystem.
#[derive(Clone)]
pub struct HealthChecker {
    subsystems: Arc<RwLock<Vec<SubsystemHealth>>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self { subsystems: Arc::new(RwLock::new(Vec::new())) }
    }

    /// Register a subsystem; it starts degraded until it reports in.
    pub async fn register_subsystem(&self, name: &str) {
        let mut subsystems = self.subsystems.write().await;
        if subsystems.iter().any(|s| s.name == name) {
            return;
        }
        subsystems.push(SubsystemHealth {
            name: name.to_string(),
            status: HealthStatus::Degraded,
            message: Some("starting".to_string()),
        });
    }

    pub async fn update_subsystem(
        &self,
        name: &str,
        status: HealthStatus,
        message: Option<String>,
    ) {
        let mut subsystems = self.subsystems.write().await;
        if let Some(subsystem) = subsystems.iter_mut().find(|s| s.name == name) {
            subsystem.status = status;
            subsystem.message = message;
        }
    }

    /// Worst status across subsystems wins.
    pub async fn get_health(&self) -> HealthCheck {
        let subsystems = self.subsystems.read().await.clone();

        let status = if subsystems.iter().any(|s| s.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if subsystems.iter().any(|s| s.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthCheck { status, version: env!("CARGO_PKG_VERSION").to_string(), subsystems }
    }

    pub async fn is_ready(&self) -> bool {
        self.get_health().await.status == HealthStatus::Healthy
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}
