//! Retry decorator for HTTP transports
//!
//! `Retryer` wraps any `HttpTransport` with bounded retry-with-backoff.
//! Delay priority: a server-supplied `x-ms-retry-after-ms` header is honored
//! verbatim; otherwise an interval table is selected by failure class and the
//! delay is half the table entry plus uniform jitter in `[0, half)`.
//!
//! Cancellation is cooperative: the retry sleep lives inside the caller's
//! future, so aborting the task that awaits `send` cancels both the pending
//! timer and the in-flight request.

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::HttpError;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

/// Retry intervals for general failures. The index is the retry count; once
/// the table is exhausted the last error is forwarded.
pub const GENERAL_RETRY_INTERVALS: [Duration; 3] = [
    Duration::from_secs(10),
    Duration::from_secs(5 * 60),
    Duration::from_secs(20 * 60),
];

/// Short retry intervals for pure connectivity failures (connect timeout,
/// unresolved host), used only when short retries were opted into.
pub const CONNECTIVITY_RETRY_INTERVALS: [Duration; 3] = [
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(20),
];

/// Transport decorator managing retries.
pub struct Retryer {
    inner: Arc<dyn HttpTransport>,
    short_network_retries: bool,
}

impl Retryer {
    /// Wrap a transport. `short_network_retries` opts connectivity failures
    /// into the short interval table.
    pub fn new(inner: Arc<dyn HttpTransport>, short_network_retries: bool) -> Self {
        Self { inner, short_network_retries }
    }

    fn delay_for(&self, error: &HttpError, retry_count: usize) -> Duration {
        if let Some(ms) = error.retry_after_ms() {
            // Server knows best; no jitter on top of its directive.
            return Duration::from_millis(ms);
        }
        let table = if self.short_network_retries && error.is_connectivity_failure() {
            &CONNECTIVITY_RETRY_INTERVALS
        } else {
            &GENERAL_RETRY_INTERVALS
        };
        let base = table[retry_count] / 2;
        let jitter_ms = rand::thread_rng().gen_range(0..base.as_millis() as u64);
        base + Duration::from_millis(jitter_ms)
    }
}

#[async_trait]
impl HttpTransport for Retryer {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        let mut retry_count = 0;
        loop {
            match self.inner.send(request).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    if retry_count >= GENERAL_RETRY_INTERVALS.len() || !error.is_recoverable() {
                        return Err(error);
                    }
                    let delay = self.delay_for(&error, retry_count);
                    retry_count += 1;
                    tracing::warn!(
                        attempt = retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "request failed, scheduling retry"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
