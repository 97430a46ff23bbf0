//! Blocks bootstrap until the scraper answers a readiness probe.
//! Grounded in `readiness/http.go`/`readiness/waiter.go`: the sole
//! consumer is the bootstrap path — nothing else in the process starts
//! until readiness is reached.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests;

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[async_trait]
pub trait Wait: Send + Sync {
    /// Polls until ready or cancelled. A cancelled scope returns `Ok(())`.
    async fn wait(&self, cancel: &CancellationToken) -> Result<(), WaitError>;
}

/// No readiness URL configured: bootstrap proceeds immediately.
pub struct NoopWaiter;

#[async_trait]
impl Wait for NoopWaiter {
    async fn wait(&self, _cancel: &CancellationToken) -> Result<(), WaitError> {
        Ok(())
    }
}

pub struct HttpWaiter {
    url: String,
    poll_period: Duration,
    client: reqwest::Client,
}

impl HttpWaiter {
    pub fn new(url: String, poll_period: Duration) -> Self {
        Self {
            url,
            poll_period,
            client: reqwest::Client::new(),
        }
    }

    async fn check_ready(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                tracing::debug!(error = %err, "readiness probe failed");
                false
            }
        }
    }
}

#[async_trait]
impl Wait for HttpWaiter {
    #[tracing::instrument(skip(self, cancel), fields(url = %self.url))]
    async fn wait(&self, cancel: &CancellationToken) -> Result<(), WaitError> {
        tracing::info!(poll_period = ?self.poll_period, "waiting for scraper readiness");

        let mut tick = tokio::time::interval(self.poll_period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tick.tick() => {
                    if self.check_ready().await {
                        tracing::info!("scraper is ready");
                        return Ok(());
                    }
                }
            }
        }
    }
}
