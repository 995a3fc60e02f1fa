//! Exponential backoff and bounded retry.

use crate::error::{CmonError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Exponential backoff with additive random jitter.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    min_delay: Duration,
    max_delay: Duration,
    factor: f32,
    jitter: Duration,
}

impl ExponentialBackoff {
    pub fn new(min_delay: Duration, max_delay: Duration, factor: f32, jitter: Duration) -> Self {
        Self { min_delay, max_delay, factor, jitter }
    }

    /// Delay before retry number `attempt` (zero based), capped at the maximum.
    pub fn duration(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.min(i32::MAX as u32) as i32);
        let base = self.min_delay.as_secs_f32() * exp;
        let backoff = base + rand::random::<f32>() * self.jitter.as_secs_f32();
        let capped = backoff.min(self.max_delay.as_secs_f32());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f32(capped)
        } else {
            self.max_delay
        }
    }
}

/// Bounded number of attempts spaced by an [`ExponentialBackoff`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    backoff: ExponentialBackoff,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        min_delay: Duration,
        max_delay: Duration,
        factor: f32,
        jitter: Duration,
    ) -> Self {
        Self {
            backoff: ExponentialBackoff::new(min_delay, max_delay, factor, jitter),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> &ExponentialBackoff {
        &self.backoff
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts run out. The last error is returned.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if !err.is_transient() || attempt >= self.max_attempts {
                        return Err(err);
                    }
                    let delay = self.backoff.duration(attempt - 1);
                    debug!(what, attempt, ?delay, error = %err, "Retrying after transient failure");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Classify a reqwest failure against a named backend.
pub fn backend_error(service: &'static str, err: reqwest::Error) -> CmonError {
    let transient = err.is_connect()
        || err.is_timeout()
        || err.is_request()
        || err.status().map(|s| s.is_server_error()).unwrap_or(false);
    CmonError::Backend { service, reason: err.to_string(), transient }
}
