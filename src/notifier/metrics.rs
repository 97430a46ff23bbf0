use std::time::Instant;

use async_trait::async_trait;
use prometheus::{Counter, Histogram, HistogramOpts, Opts, Registry};
use tokio_util::sync::CancellationToken;

use super::{NotifyError, Notify};

/// Wraps a [`Notify`] with `notifier_calls_total`/`notifier_calls_errors`
/// counters and a `notifier_calls_duration_seconds` histogram, observed
/// once per call to `notify` (spec.md §4.4: "observed per outer Notify
/// call, not per attempt"). Composed as the outermost layer of the chain
/// so that when it wraps a [`super::RetryNotifier`], the duration covers
/// the whole retried operation rather than a single attempt.
pub struct MetricsNotifier<N> {
    next: N,
    total: Counter,
    errors: Counter,
    duration: Histogram,
}

impl<N: Notify> MetricsNotifier<N> {
    pub fn new(next: N, registry: &Registry) -> Result<Self, prometheus::Error> {
        let total = Counter::with_opts(
            Opts::new(
                "notifier_calls_total",
                "Total number of times the sidecar notified the scraper about a configuration update",
            )
            .namespace("prometheus_elector"),
        )?;
        let errors = Counter::with_opts(
            Opts::new(
                "notifier_calls_errors",
                "Total number of times notifying the scraper failed",
            )
            .namespace("prometheus_elector"),
        )?;
        let duration = Histogram::with_opts(
            HistogramOpts::new(
                "notifier_calls_duration_seconds",
                "Time it took to notify the scraper about a configuration update",
            )
            .namespace("prometheus_elector"),
        )?;

        registry.register(Box::new(total.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            next,
            total,
            errors,
            duration,
        })
    }
}

#[async_trait]
impl<N: Notify> Notify for MetricsNotifier<N> {
    async fn notify(&self, cancel: &CancellationToken) -> Result<(), NotifyError> {
        let start = Instant::now();
        let result = self.next.notify(cancel).await;

        self.duration.observe(start.elapsed().as_secs_f64());
        self.total.inc();
        if result.is_err() {
            self.errors.inc();
        }

        result
    }
}
