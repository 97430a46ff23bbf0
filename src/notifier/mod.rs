//! Tells the local scraper to reload its configuration, via a chain of
//! decorators: `HttpNotifier` → `RetryNotifier` → `MetricsNotifier`, the
//! reverse nesting of `notifier/notifier.go`'s
//! `WithRetry(WithMetrics(NewHTTP(url, method)), maxAttempts, delay)` so
//! that the duration histogram covers a whole (possibly retried) call
//! rather than a single attempt ("dynamic dispatch over wrapping
//! decorators" design note).

mod http;
mod metrics;
mod retry;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use http::HttpNotifier;
pub use metrics::MetricsNotifier;
pub use retry::RetryNotifier;


#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid HTTP method {0:?}")]
    InvalidMethod(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status code: {0}")]
    UnexpectedStatus(reqwest::StatusCode),
    #[error("notifier exhausted all {attempts} attempts, last error: {source}")]
    Exhausted {
        attempts: usize,
        #[source]
        source: Box<NotifyError>,
    },
    #[error("failed to register notifier metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// A single capability: ask the scraper to reload. Implementations may
/// wrap another `Notify` to add retrying or metrics, composed at
/// construction time with no inheritance required.
#[async_trait]
pub trait Notify: Send + Sync {
    async fn notify(&self, cancel: &CancellationToken) -> Result<(), NotifyError>;
}

/// Builds the standard decorator chain used at runtime: `Http` does the
/// request, `Retry` wraps it with constant-delay retries, and `Metrics` is
/// outermost so its duration histogram covers the whole (possibly
/// retried) call rather than a single attempt.
pub fn build(
    url: String,
    method: String,
    timeout: std::time::Duration,
    max_attempts: usize,
    retry_delay: std::time::Duration,
    registry: &prometheus::Registry,
) -> Result<MetricsNotifier<RetryNotifier<HttpNotifier>>, NotifyError> {
    let base = HttpNotifier::new(url, method, timeout)?;
    let retried = RetryNotifier::new(base, max_attempts, retry_delay);
    Ok(MetricsNotifier::new(retried, registry)?)
}
