//! Owns participation in the lease election, exposes a consistent
//! [`LeaderStatus`] snapshot, and survives transient loss-of-leadership by
//! re-joining the election automatically.
//!
//! Grounded in `election/elector.go` (the `Start`/`Stop`/re-join loop) and
//! `kube-runtime`'s `lease` module (the `LeaseState` acquire/renew state
//! machine), recombined to express the three-parameter
//! `(lease_duration, renew_deadline, retry_period)` model of client-go's
//! `leaderelection.LeaderElector` that the original Go sidecar wraps.

mod lease;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use prometheus::{GaugeVec, Opts, Registry};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

pub use lease::{LeaseBackend, LeaseError, LeaseParams, LeaseParamsError, LeaseState};

#[cfg(test)]
mod tests;

/// Read-only projection of the lease participant, safe for concurrent
/// reads from any task. `current_leader` is empty iff no holder is
/// observed (spec.md §3).
#[derive(Clone)]
pub struct LeaderStatus {
    inner: Arc<StatusInner>,
}

struct StatusInner {
    is_leader: AtomicBool,
    current_leader: RwLock<String>,
}

impl LeaderStatus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StatusInner {
                is_leader: AtomicBool::new(false),
                current_leader: RwLock::new(String::new()),
            }),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.inner.is_leader.load(Ordering::SeqCst)
    }

    pub fn current_leader(&self) -> String {
        self.inner.current_leader.read().clone()
    }

    /// Updates both fields together so a concurrent reader never observes
    /// `is_leader = true` with a stale/mismatched `current_leader`.
    pub fn update(&self, current_leader: String, is_leader: bool) {
        let mut guard = self.inner.current_leader.write();
        *guard = current_leader;
        self.inner.is_leader.store(is_leader, Ordering::SeqCst);
    }
}

impl Default for LeaderStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("elector is already running")]
    AlreadyRunning,
}

#[derive(Debug, Error)]
pub enum StopError {
    #[error("elector is not running")]
    NotRunning,
    #[error("timed out waiting for the participation loop to exit")]
    DeadlineExceeded,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid lease parameters: {0}")]
    InvalidParams(#[from] LeaseParamsError),
    #[error("failed to register election metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

type LeadingCallback = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callbacks invoked from the single participation task — never
/// concurrently with each other — on leadership acquisition/loss.
pub struct Callbacks {
    pub on_started_leading: LeadingCallback,
    pub on_stopped_leading: LeadingCallback,
}

enum RunState {
    Idle,
    Participating { cancel: CancellationToken, done: oneshot::Receiver<()> },
}

/// Owns the lease participation task. `start`/`stop` are serialized under
/// a mutex; `status` is lock-free.
pub struct Supervisor {
    backend: Arc<LeaseBackend>,
    params: LeaseParams,
    callbacks: Callbacks,
    status: LeaderStatus,
    metrics: ElectionMetrics,
    state: Mutex<RunState>,
}

impl Supervisor {
    pub fn new(
        client: kube::Client,
        params: LeaseParams,
        callbacks: Callbacks,
        registry: &Registry,
    ) -> Result<Self, SupervisorError> {
        params.validate()?;
        let metrics = ElectionMetrics::new(registry, &params.identity)?;
        Ok(Self {
            backend: Arc::new(LeaseBackend::new(client, params.clone())),
            params,
            callbacks,
            status: LeaderStatus::new(),
            metrics,
            state: Mutex::new(RunState::Idle),
        })
    }

    pub fn status(&self) -> LeaderStatus {
        self.status.clone()
    }

    /// Begins participation. Returns immediately; participation runs on a
    /// spawned task. Fails with [`StartError::AlreadyRunning`] unless the
    /// supervisor is currently `Idle`.
    pub async fn start(self: &Arc<Self>) -> Result<(), StartError> {
        let mut state = self.state.lock().await;
        if !matches!(*state, RunState::Idle) {
            return Err(StartError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();

        let this = Arc::clone(self);
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            this.run_until_cancelled(task_cancel).await;
            let _ = done_tx.send(());
        });

        *state = RunState::Participating { cancel, done: done_rx };
        Ok(())
    }

    /// Requests departure and waits (bounded by `deadline`) for the
    /// participation task to exit, releasing the lease if held.
    pub async fn stop(self: &Arc<Self>, deadline: std::time::Duration) -> Result<(), StopError> {
        let mut state = self.state.lock().await;
        let RunState::Participating { cancel, done } = std::mem::replace(&mut *state, RunState::Idle)
        else {
            *state = RunState::Idle;
            return Err(StopError::NotRunning);
        };

        cancel.cancel();

        match timeout(deadline, done).await {
            Ok(_) => Ok(()),
            Err(_) => Err(StopError::DeadlineExceeded),
        }
    }

    /// The re-entrant participation loop (spec.md §9 "re-entrant
    /// participation loop"): a single pass through acquire+hold may end in
    /// demotion, which is not terminal — only an already-cancelled token
    /// stops the loop.
    async fn run_until_cancelled(self: Arc<Self>, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            self.acquire_and_hold(&cancel).await;
        }

        if let Err(err) = self.backend.release().await {
            tracing::warn!(error = %err, "failed to release lease on shutdown");
        }
    }

    async fn acquire_and_hold(self: &Arc<Self>, cancel: &CancellationToken) {
        if !self.acquire(cancel).await {
            return; // cancelled while still trying to acquire
        }

        self.dispatch_started_leading().await;

        self.hold_until_demoted_or_cancelled(cancel).await;

        self.dispatch_stopped_leading().await;
    }

    /// Retries `try_acquire_or_renew` every `retry_period` until this
    /// member holds the lease or the token is cancelled. Returns `true` iff
    /// it now holds the lease.
    async fn acquire(&self, cancel: &CancellationToken) -> bool {
        loop {
            match self.backend.try_acquire_or_renew(Utc::now()).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => tracing::warn!(error = %err, "acquisition attempt failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = sleep(self.retry_period()) => {}
            }
        }
    }

    /// Renews on every `retry_period` tick, bounding each renewal attempt
    /// by `renew_deadline`. Returns once cancelled or demoted (renewal
    /// failed/timed out, or a foreign holder was observed).
    async fn hold_until_demoted_or_cancelled(&self, cancel: &CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(self.retry_period()) => {}
            }

            let renewed = timeout(
                self.renew_deadline(),
                self.backend.try_acquire_or_renew(Utc::now()),
            )
            .await;

            match renewed {
                Ok(Ok(true)) => continue,
                Ok(Ok(false)) => {
                    tracing::info!("lease lost to another holder, demoting");
                    return;
                }
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "renewal failed, demoting");
                    return;
                }
                Err(_elapsed) => {
                    tracing::warn!("renewal exceeded renew_deadline, demoting");
                    return;
                }
            }
        }
    }

    async fn dispatch_started_leading(&self) {
        self.status
            .update(self.backend.identity().to_string(), true);
        self.metrics.set_leading(true);
        (self.callbacks.on_started_leading)().await;
    }

    async fn dispatch_stopped_leading(&self) {
        let observed = self
            .backend
            .state(Utc::now())
            .await
            .ok()
            .map(|state| match state {
                LeaseState::HeldByOther { holder, .. } => holder,
                _ => String::new(),
            })
            .unwrap_or_default();
        self.status.update(observed, false);
        self.metrics.set_leading(false);
        (self.callbacks.on_stopped_leading)().await;
    }

    fn retry_period(&self) -> std::time::Duration {
        self.params
            .retry_period
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(1))
    }

    fn renew_deadline(&self) -> std::time::Duration {
        self.params
            .renew_deadline
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(10))
    }
}

/// `election_is_leader{member_id}` and
/// `election_last_transition_time_seconds`, per spec.md §4.1.
struct ElectionMetrics {
    is_leader: GaugeVec,
    last_transition: GaugeVec,
    member_id: String,
}

impl ElectionMetrics {
    fn new(registry: &Registry, member_id: &str) -> Result<Self, prometheus::Error> {
        let is_leader = GaugeVec::new(
            Opts::new(
                "election_is_leader",
                "Whether this member currently holds the election lease (1) or not (0)",
            )
            .namespace("prometheus_elector"),
            &["member_id"],
        )?;
        let last_transition = GaugeVec::new(
            Opts::new(
                "election_last_transition_time_seconds",
                "Unix timestamp of the last leadership transition observed by this member",
            )
            .namespace("prometheus_elector"),
            &["member_id"],
        )?;

        registry.register(Box::new(is_leader.clone()))?;
        registry.register(Box::new(last_transition.clone()))?;

        Ok(Self {
            is_leader,
            last_transition,
            member_id: member_id.to_string(),
        })
    }

    fn set_leading(&self, leading: bool) {
        self.is_leader
            .with_label_values(&[&self.member_id])
            .set(if leading { 1.0 } else { 0.0 });
        self.last_transition
            .with_label_values(&[&self.member_id])
            .set(Utc::now().timestamp() as f64);
    }
}
