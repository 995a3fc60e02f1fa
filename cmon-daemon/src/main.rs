use clap::Parser;
use cmon_core::clients::{
    AgentClient, HostDirectory, HttpAgent, HttpChangefeed, HttpHostDirectory, HttpInventory,
    InventoryClient,
};
use cmon_core::observability::health::{CACHE_SYNC, HOST_POLL};
use cmon_core::sync::feed::FEED_BUFFER_SIZE;
use cmon_core::sync::{feed_channel, EngineOptions, HostPoller};
use cmon_core::{
    init_observability, shutdown_observability, AdminResolver, Cache, CmonError, Config,
    HealthChecker, ItemPipeline, MetricsProxy, SyncEngine,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod api;
mod shutdown;

/// cmon metrics discovery gateway.
#[derive(Debug, Parser)]
#[command(name = "cmond", version, about)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "CMON_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the log level (RUST_LOG still wins)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    config.validate()?;

    // Initialize observability FIRST
    init_observability(&config)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        server_name = %config.server_name,
        "cmon daemon starting"
    );

    let result = run(config).await;
    if let Err(e) = &result {
        error!(error = %e, "cmon daemon exiting on error");
    }

    info!("cmon daemon shutting down");
    shutdown_observability();
    result
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let health = HealthChecker::new();
    health.register_subsystem(CACHE_SYNC).await;
    health.register_subsystem(HOST_POLL).await;

    let cache = Cache::new();

    let inventory: Arc<dyn InventoryClient> =
        Arc::new(HttpInventory::new(&config.vmapi.url, config.api_retry.policy())?);
    let directory: Arc<dyn HostDirectory> =
        Arc::new(HttpHostDirectory::new(&config.cnapi.url, config.api_retry.policy())?);
    let agent: Arc<dyn AgentClient> =
        Arc::new(HttpAgent::new(Duration::from_millis(config.agent_connect_timeout_ms))?);

    let resolver = Arc::new(AdminResolver::new(
        Arc::clone(&cache),
        Arc::clone(&directory),
        Arc::clone(&agent),
        config.agent_port,
        config.resolver_retry.policy(),
    ));
    let pipeline =
        Arc::new(ItemPipeline::new(Arc::clone(&cache), Arc::clone(&inventory), resolver));

    let engine = SyncEngine::new(
        Arc::clone(&pipeline),
        inventory,
        EngineOptions {
            bootstrap_state: config.bootstrap_state_filter().to_string(),
            page_size: config.discovery_page_size,
            queue_capacity: config.queue_capacity,
        },
    )
    .with_health(health.clone());
    let poller =
        HostPoller::new(directory, pipeline, config.poll_interval(), config.discovery_page_size)
            .with_health(health.clone());
    let changefeed = HttpChangefeed::new(
        config.changefeed_url(),
        config.changefeed.clone(),
        *config.api_retry.policy().backoff(),
    )?;

    let proxy = Arc::new(MetricsProxy::new(
        Arc::clone(&cache),
        agent,
        config.agent_port,
        config.compression_enabled,
    ));
    let state = api::AppState {
        cache,
        proxy,
        health,
        server_name: Arc::from(config.server_name.as_str()),
    };

    let listener = TcpListener::bind((config.address.as_str(), config.port)).await?;

    let cancel = CancellationToken::new();
    shutdown::cancel_on_signal(cancel.clone());

    let (feed, feed_rx) = feed_channel(FEED_BUFFER_SIZE);
    let mut engine_task = tokio::spawn(engine.run(feed_rx, cancel.child_token()));
    let feed_task = tokio::spawn(changefeed.run(feed, cancel.child_token()));
    let poll_task = tokio::spawn(poller.run(cancel.child_token()));
    let mut server_task = tokio::spawn(api::serve(listener, state, cancel.child_token()));

    info!(address = %config.address, port = config.port, "cmon daemon ready");

    let result: Result<(), Box<dyn std::error::Error>> = tokio::select! {
        engine = &mut engine_task => match engine {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(CmonError::internal(e).into()),
        },
        server = &mut server_task => match server {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(CmonError::internal(e).into()),
        },
    };

    // Stop whatever is still running.
    cancel.cancel();
    if !engine_task.is_finished() {
        let _ = engine_task.await;
    }
    if !server_task.is_finished() {
        let _ = server_task.await;
    }
    match feed_task.await {
        Ok(Err(e)) => warn!(error = %e, "Changefeed listener ended with error"),
        Err(e) => warn!(error = %e, "Changefeed listener task failed"),
        Ok(Ok(())) => {}
    }
    let _ = poll_task.await;

    result
}
