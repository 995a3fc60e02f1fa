//! Bootstrap/live coordination.
//!
//! The engine owns a bounded FIFO work queue drained by a single worker.
//! A bootstrap pushes every inventory record into the queue; live change
//! notices that arrive meanwhile are held back and released behind the last
//! bootstrap record, so no live change can be applied before the snapshot it
//! follows. Every bootstrap and every lost connection starts a new epoch; the
//! worker discards queued items from older epochs.

use super::pipeline::ItemPipeline;
use super::SyncState;
use crate::clients::{inventory_marker, CursorStyle, InventoryClient, InventoryPages, Pager};
use crate::error::{CmonError, Result};
use crate::normalize::{CacheEvent, ChangeNotice};
use crate::observability::health::{HealthChecker, HealthStatus, CACHE_SYNC};
use crate::observability::metrics;
use crate::sync::feed::FeedSignal;
use crate::types::now_millis;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Inventory state filter for bootstrap (`running` or `active`).
    pub bootstrap_state: String,
    pub page_size: usize,
    /// Work queue capacity; also bounds notices held during bootstrap.
    pub queue_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self { bootstrap_state: "running".to_string(), page_size: 100, queue_capacity: 16 }
    }
}

enum Work {
    Event(CacheEvent),
    /// Drop VMs the finished bootstrap did not refresh.
    Sweep { cutoff: u64 },
}

struct WorkItem {
    epoch: u64,
    work: Work,
}

/// Summary of a finished bootstrap.
#[derive(Debug, Clone, Copy)]
struct BootstrapReport {
    records: usize,
    started_at: u64,
}

/// Cache synchronization engine.
pub struct SyncEngine {
    pipeline: Arc<ItemPipeline>,
    inventory: Arc<dyn InventoryClient>,
    options: EngineOptions,
    state_tx: watch::Sender<SyncState>,
    health: Option<HealthChecker>,
}

impl SyncEngine {
    pub fn new(
        pipeline: Arc<ItemPipeline>,
        inventory: Arc<dyn InventoryClient>,
        options: EngineOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(SyncState::AwaitingBootstrap);
        Self { pipeline, inventory, options, state_tx, health: None }
    }

    /// Mirror engine state into the `cache-sync` health subsystem.
    pub fn with_health(mut self, health: HealthChecker) -> Self {
        self.health = Some(health);
        self
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    /// Consume feed signals until cancelled. Returns an error when the feed
    /// fails or closes, or when the worker hits a fatal error.
    #[instrument(skip_all)]
    pub async fn run(
        self,
        mut feed: mpsc::Receiver<FeedSignal>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let capacity = self.options.queue_capacity.max(1);
        let epoch = Arc::new(AtomicU64::new(0));
        let (queue, queue_rx) = mpsc::channel::<WorkItem>(capacity);
        let mut worker =
            tokio::spawn(run_worker(Arc::clone(&self.pipeline), queue_rx, Arc::clone(&epoch)));

        let mut bootstrap: Option<JoinHandle<Result<BootstrapReport>>> = None;
        let mut pending: VecDeque<ChangeNotice> = VecDeque::new();
        let mut state = SyncState::AwaitingBootstrap;
        self.publish(state).await;

        let result = loop {
            let can_read = state != SyncState::Bootstrapping || pending.len() < capacity;

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Sync engine stopping");
                    break Ok(());
                }

                exit = &mut worker => {
                    let reason = match exit {
                        Ok(Err(e)) => e.to_string(),
                        Ok(Ok(())) => "queue closed".to_string(),
                        Err(e) => e.to_string(),
                    };
                    break Err(CmonError::WorkerExited { reason });
                }

                done = join_bootstrap(&mut bootstrap) => {
                    bootstrap = None;
                    let report = match done {
                        Ok(Ok(report)) => report,
                        Ok(Err(e)) => {
                            error!(error = %e, "Bootstrap failed");
                            break Err(e);
                        }
                        Err(e) => {
                            break Err(CmonError::Internal(format!("bootstrap task failed: {}", e)))
                        }
                    };

                    let current = epoch.load(Ordering::SeqCst);
                    let released = pending.len();
                    let sweep = Work::Sweep { cutoff: report.started_at };
                    if enqueue(&queue, current, sweep).await.is_err() {
                        continue;
                    }
                    let mut closed = false;
                    while let Some(notice) = pending.pop_front() {
                        let work = Work::Event(CacheEvent::Change(notice));
                        if enqueue(&queue, current, work).await.is_err() {
                            closed = true;
                            break;
                        }
                    }
                    if closed {
                        continue;
                    }

                    info!(
                        records = report.records,
                        released,
                        "Bootstrap complete, applying live changes"
                    );
                    state = SyncState::Live;
                    self.publish(state).await;
                }

                signal = feed.recv(), if can_read => {
                    let Some(signal) = signal else {
                        error!("Changefeed closed");
                        break Err(CmonError::FeedClosed);
                    };

                    match signal {
                        FeedSignal::Bootstrap => {
                            if let Some(task) = bootstrap.take() {
                                warn!("Bootstrap signalled while bootstrapping, restarting");
                                task.abort();
                            }
                            pending.clear();
                            let current = epoch.fetch_add(1, Ordering::SeqCst) + 1;
                            bootstrap = Some(tokio::spawn(run_bootstrap(
                                Arc::clone(&self.inventory),
                                self.options.clone(),
                                queue.clone(),
                                current,
                            )));
                            state = SyncState::Bootstrapping;
                            self.publish(state).await;
                        }
                        FeedSignal::Change(notice) => match state {
                            SyncState::AwaitingBootstrap => {
                                debug!(
                                    vm_uuid = %notice.changed_resource_id,
                                    "Dropping change before bootstrap"
                                );
                            }
                            SyncState::Bootstrapping => pending.push_back(notice),
                            SyncState::Live => {
                                let current = epoch.load(Ordering::SeqCst);
                                // A send error means the worker is gone; its exit arm reports why.
                                let work = Work::Event(CacheEvent::Change(notice));
                                let _ = enqueue(&queue, current, work).await;
                            }
                        },
                        FeedSignal::ConnectionLost => {
                            epoch.fetch_add(1, Ordering::SeqCst);
                            if let Some(task) = bootstrap.take() {
                                task.abort();
                            }
                            let dropped = pending.len();
                            pending.clear();
                            info!(dropped, "Changefeed connection lost, awaiting bootstrap");
                            state = SyncState::AwaitingBootstrap;
                            self.publish(state).await;
                        }
                        FeedSignal::Fatal(reason) => {
                            error!(%reason, "Changefeed failed");
                            break Err(CmonError::FeedFatal { reason });
                        }
                    }
                }
            }
        };

        if let Some(task) = bootstrap.take() {
            task.abort();
        }
        worker.abort();

        if let (Err(e), Some(health)) = (&result, &self.health) {
            health.update_subsystem(CACHE_SYNC, HealthStatus::Unhealthy, Some(e.to_string())).await;
        }
        result
    }

    async fn publish(&self, state: SyncState) {
        self.state_tx.send_replace(state);
        if let Some(health) = &self.health {
            let (status, message) = match state {
                SyncState::AwaitingBootstrap => {
                    (HealthStatus::Degraded, Some("awaiting changefeed".to_string()))
                }
                SyncState::Bootstrapping => {
                    (HealthStatus::Degraded, Some("bootstrapping".to_string()))
                }
                SyncState::Live => (HealthStatus::Healthy, None),
            };
            health.update_subsystem(CACHE_SYNC, status, message).await;
        }
    }
}

async fn enqueue(queue: &mpsc::Sender<WorkItem>, epoch: u64, work: Work) -> Result<()> {
    queue
        .send(WorkItem { epoch, work })
        .await
        .map_err(|_| CmonError::WorkerExited { reason: "work queue closed".to_string() })
}

/// Resolves when the running bootstrap finishes; never when there is none.
async fn join_bootstrap(
    task: &mut Option<JoinHandle<Result<BootstrapReport>>>,
) -> std::result::Result<Result<BootstrapReport>, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

/// Page through the inventory, feeding the work queue. Blocks on a full queue.
async fn run_bootstrap(
    inventory: Arc<dyn InventoryClient>,
    options: EngineOptions,
    queue: mpsc::Sender<WorkItem>,
    epoch: u64,
) -> Result<BootstrapReport> {
    let started = Instant::now();
    let started_at = now_millis();
    let source = InventoryPages::new(inventory, options.bootstrap_state.clone());
    let mut pager = Pager::new(source, CursorStyle::Marker(inventory_marker), options.page_size);

    let mut records = 0;
    loop {
        let page = pager.next_page().await?;
        for record in page.records {
            enqueue(&queue, epoch, Work::Event(CacheEvent::Bootstrap(record))).await?;
            records += 1;
        }
        if page.done {
            break;
        }
    }

    metrics::record_bootstrap(started.elapsed().as_secs_f64());
    debug!(records, epoch, "Inventory listing finished");
    Ok(BootstrapReport { records, started_at })
}

/// Apply queued work in order. A pipeline error ends the worker.
async fn run_worker(
    pipeline: Arc<ItemPipeline>,
    mut queue: mpsc::Receiver<WorkItem>,
    epoch: Arc<AtomicU64>,
) -> Result<()> {
    while let Some(item) = queue.recv().await {
        if item.epoch != epoch.load(Ordering::SeqCst) {
            debug!(item_epoch = item.epoch, "Discarding work from a previous feed session");
            continue;
        }

        match item.work {
            Work::Event(event) => {
                if let Err(e) = pipeline.process(event).await {
                    error!(error = %e, "Cache update failed");
                    return Err(e);
                }
            }
            Work::Sweep { cutoff } => {
                let swept = pipeline.cache().sweep_vms_before(cutoff).await;
                if swept > 0 {
                    info!(swept, "Dropped VMs missing from bootstrap");
                }
            }
        }
    }
    Ok(())
}
