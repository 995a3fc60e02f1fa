//! Cache synchronization: changefeed-driven bootstrap/live engine, the
//! per-item pipeline, and the host poller.

use serde::Serialize;

pub mod engine;
pub mod feed;
pub mod pipeline;
pub mod poller;

pub use engine::{EngineOptions, SyncEngine};
pub use feed::{feed_channel, FeedSender, FeedSignal};
pub use pipeline::{CacheEffect, ItemOutcome, ItemPipeline};
pub use poller::{HostPoller, PollReport};

/// Engine state. Polling runs alongside every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Waiting for the changefeed to (re)connect.
    AwaitingBootstrap,
    /// Replaying the inventory; live changes are held back.
    Bootstrapping,
    /// Applying live changes as they arrive.
    Live,
}
