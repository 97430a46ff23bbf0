//! Periodic probe producing healthy/unhealthy edge events, gating
//! election participation. Grounded in `health/checker.go` and
//! `health/http.go`: two running counters, edge-triggered callbacks.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio_util::sync::CancellationToken;


pub struct HttpCheckConfig {
    pub url: String,
    pub period: Duration,
    pub timeout: Duration,
    pub success_threshold: u32,
    pub failure_threshold: u32,
}

type EdgeCallback = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub struct Callbacks {
    pub on_healthy: EdgeCallback,
    pub on_unhealthy: EdgeCallback,
}

#[derive(Default)]
struct CheckState {
    success_count: u32,
    failure_count: u32,
}

pub struct HttpChecker {
    config: HttpCheckConfig,
    callbacks: Callbacks,
    client: reqwest::Client,
}

impl HttpChecker {
    pub fn new(config: HttpCheckConfig, callbacks: Callbacks) -> Self {
        Self {
            config,
            callbacks,
            client: reqwest::Client::new(),
        }
    }

    /// Runs the fixed-tick probe loop until `cancel` fires. Every tick is
    /// independent: neither a non-2xx response nor a transport error
    /// aborts the loop, they only count as a failed probe.
    #[tracing::instrument(skip(self, cancel), fields(url = %self.config.url))]
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(period = ?self.config.period, "starting health check loop");
        let mut tick = tokio::time::interval(self.config.period);
        let mut state = CheckState::default();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {
                    let ok = self.probe_once().await;
                    self.record(ok, &mut state).await;
                }
            }
        }
    }

    async fn probe_once(&self) -> bool {
        let request = self.client.get(&self.config.url).timeout(self.config.timeout);
        match request.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                tracing::debug!(error = %err, "health probe transport error");
                false
            }
        }
    }

    async fn record(&self, ok: bool, state: &mut CheckState) {
        if ok {
            state.success_count += 1;
            state.failure_count = 0;
        } else {
            state.failure_count += 1;
            state.success_count = 0;
        }

        if state.success_count == self.config.success_threshold {
            (self.callbacks.on_healthy)().await;
        }
        if state.failure_count == self.config.failure_threshold {
            (self.callbacks.on_unhealthy)().await;
        }
    }
}
