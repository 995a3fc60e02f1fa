//! Changefeed transport.
//!
//! Holds a streaming GET against the feed endpoint. The body is newline
//! delimited JSON, one change record per line. Every successful connect
//! emits [`FeedSignal::Bootstrap`]; every disconnect emits
//! [`FeedSignal::ConnectionLost`] followed by a reconnect with backoff. A
//! 4xx answer means the registration itself was rejected and is fatal.

use crate::backoff::ExponentialBackoff;
use crate::config::ChangefeedConfig;
use crate::error::{CmonError, Result};
use crate::normalize::ChangeNotice;
use crate::sync::feed::{FeedSender, FeedSignal};
use futures::StreamExt;
use reqwest::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How a single feed session ended.
enum SessionEnd {
    /// Connected, then the stream ended or broke.
    Disconnected(String),
    /// Never connected.
    ConnectFailed(String),
    Rejected(String),
    EngineGone,
    Cancelled,
}

/// Streaming changefeed listener.
pub struct HttpChangefeed {
    client: Client,
    url: String,
    registration: ChangefeedConfig,
    backoff: ExponentialBackoff,
}

impl HttpChangefeed {
    pub fn new(
        url: String,
        registration: ChangefeedConfig,
        backoff: ExponentialBackoff,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| CmonError::InvalidConfig {
                reason: format!("Failed to create changefeed HTTP client: {}", e),
            })?;

        Ok(Self { client, url, registration, backoff })
    }

    /// Run until cancelled, rejected, or the engine drops its receiver.
    pub async fn run(self, feed: FeedSender, cancel: CancellationToken) -> Result<()> {
        let mut failures: u32 = 0;

        loop {
            match self.session(&feed, &cancel).await {
                SessionEnd::Cancelled | SessionEnd::EngineGone => return Ok(()),
                SessionEnd::Rejected(reason) => {
                    error!(url = %self.url, %reason, "Changefeed registration rejected");
                    feed.send(FeedSignal::Fatal(reason.clone())).await;
                    return Err(CmonError::FeedFatal { reason });
                }
                SessionEnd::Disconnected(reason) => {
                    info!(%reason, "Changefeed connection ended");
                    if !feed.send(FeedSignal::ConnectionLost).await {
                        return Ok(());
                    }
                    failures = 0;
                }
                SessionEnd::ConnectFailed(reason) => {
                    warn!(
                        url = %self.url,
                        %reason,
                        attempt = failures + 1,
                        "Changefeed connect failed"
                    );
                }
            }

            let delay = self.backoff.duration(failures);
            failures = failures.saturating_add(1);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn session(&self, feed: &FeedSender, cancel: &CancellationToken) -> SessionEnd {
        let request = self.client.get(&self.url).query(&[
            ("instance", self.registration.instance.clone()),
            ("service", "cmon".to_string()),
            ("resource", self.registration.resource.clone()),
            ("subResources", self.registration.sub_resources.join(",")),
        ]);

        let response = tokio::select! {
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            res = request.send() => match res {
                Ok(r) => r,
                Err(e) => return SessionEnd::ConnectFailed(e.to_string()),
            },
        };

        let status = response.status();
        if status.is_client_error() {
            return SessionEnd::Rejected(format!("feed returned {}", status));
        }
        if !status.is_success() {
            return SessionEnd::ConnectFailed(format!("feed returned {}", status));
        }

        debug!(url = %self.url, "Changefeed connected");
        if !feed.send(FeedSignal::Bootstrap).await {
            return SessionEnd::EngineGone;
        }

        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::default();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                chunk = body.next() => chunk,
            };

            let chunk = match chunk {
                None => return SessionEnd::Disconnected("stream ended".to_string()),
                Some(Err(e)) => return SessionEnd::Disconnected(e.to_string()),
                Some(Ok(chunk)) => chunk,
            };

            for line in lines.push(&chunk) {
                match serde_json::from_slice::<ChangeNotice>(&line) {
                    Ok(notice) => {
                        if !feed.send(FeedSignal::Change(notice)).await {
                            return SessionEnd::EngineGone;
                        }
                    }
                    Err(e) => {
                        warn!(
                            error = %e,
                            line = %String::from_utf8_lossy(&line),
                            "Skipping unparseable change record"
                        )
                    }
                }
            }
        }
    }
}

/// Splits a byte stream into non-empty lines.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.iter().all(u8::is_ascii_whitespace) {
                lines.push(line);
            }
        }
        lines
    }
}
