//! Signals from the live changefeed transport to the sync engine.

use crate::normalize::ChangeNotice;
use crate::observability::metrics;
use tokio::sync::mpsc;
use tracing::debug;

/// Number of undelivered signals the transport may run ahead of the engine.
pub const FEED_BUFFER_SIZE: usize = 64;

/// What the changefeed transport reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSignal {
    /// Connected (or reconnected); historical state must be replayed.
    Bootstrap,
    /// A VM changed.
    Change(ChangeNotice),
    /// The connection dropped; the transport will reconnect on its own.
    ConnectionLost,
    /// The transport cannot continue.
    Fatal(String),
}

impl FeedSignal {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Change(_) => "change",
            Self::ConnectionLost => "connection_lost",
            Self::Fatal(_) => "fatal",
        }
    }
}

/// Sending half used by transports.
#[derive(Clone)]
pub struct FeedSender {
    tx: mpsc::Sender<FeedSignal>,
}

impl FeedSender {
    /// Deliver a signal; waits while the engine is not reading.
    /// Returns false once the engine has gone away.
    pub async fn send(&self, signal: FeedSignal) -> bool {
        debug!(kind = signal.kind(), "Publishing feed signal");
        metrics::record_feed_signal(signal.kind());
        self.tx.send(signal).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a feed channel.
pub fn feed_channel(capacity: usize) -> (FeedSender, mpsc::Receiver<FeedSignal>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (FeedSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_close() {
        let (feed, mut rx) = feed_channel(4);
        assert!(feed.send(FeedSignal::Bootstrap).await);
        assert!(feed.send(FeedSignal::Change(ChangeNotice::new("a1"))).await);

        assert_eq!(rx.recv().await, Some(FeedSignal::Bootstrap));
        assert_eq!(rx.recv().await.map(|s| s.kind()), Some("change"));

        drop(rx);
        assert!(feed.is_closed());
        assert!(!feed.send(FeedSignal::ConnectionLost).await);
    }
}
