//! Periodic host directory poll.

use super::pipeline::ItemPipeline;
use crate::clients::{CursorStyle, HostDirectory, HostPages, Pager};
use crate::error::Result;
use crate::normalize::CacheEvent;
use crate::observability::health::{HealthChecker, HealthStatus, HOST_POLL};
use crate::observability::metrics;
use crate::resolver::ResolveOutcome;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Result of one poll round.
#[derive(Debug, Default)]
pub struct PollReport {
    pub hosts: usize,
    /// Resolution tasks started by this round.
    pub resolutions: Vec<JoinHandle<ResolveOutcome>>,
}

/// Pages through setup hosts on a fixed interval.
pub struct HostPoller {
    directory: Arc<dyn HostDirectory>,
    pipeline: Arc<ItemPipeline>,
    interval: Duration,
    page_size: usize,
    health: Option<HealthChecker>,
}

impl HostPoller {
    pub fn new(
        directory: Arc<dyn HostDirectory>,
        pipeline: Arc<ItemPipeline>,
        interval: Duration,
        page_size: usize,
    ) -> Self {
        Self { directory, pipeline, interval, page_size, health: None }
    }

    pub fn with_health(mut self, health: HealthChecker) -> Self {
        self.health = Some(health);
        self
    }

    /// Poll immediately, then every interval, until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Host poller stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.poll_once().await {
                Ok(report) => {
                    info!(hosts = report.hosts, "Host poll complete");
                    self.report(HealthStatus::Healthy, None).await;
                }
                Err(e) => {
                    warn!(error = %e, "Host poll failed, retrying next interval");
                    self.report(HealthStatus::Degraded, Some(e.to_string())).await;
                }
            }
        }
    }

    /// One full pass over the directory. An error ends the pass early and
    /// leaves the cache untouched for the remaining hosts.
    #[instrument(skip(self))]
    pub async fn poll_once(&self) -> Result<PollReport> {
        let started = Instant::now();
        let pages = HostPages::new(Arc::clone(&self.directory));
        let mut pager = Pager::new(pages, CursorStyle::Offset, self.page_size);
        let mut report = PollReport::default();

        loop {
            let page = pager.next_page().await?;
            for record in page.records {
                let outcome = self.pipeline.process(CacheEvent::Poll(record)).await?;
                if outcome.host.is_some() {
                    report.hosts += 1;
                }
                report.resolutions.extend(outcome.resolution);
            }
            if page.done {
                break;
            }
        }

        metrics::record_poll(started.elapsed().as_secs_f64());
        Ok(report)
    }

    async fn report(&self, status: HealthStatus, message: Option<String>) {
        if let Some(health) = &self.health {
            health.update_subsystem(HOST_POLL, status, message).await;
        }
    }
}
