use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use prom_elector::api::{Proxy, ProxyConfig as ApiProxyConfig, Server};
use prom_elector::cli::Cli;
use prom_elector::config::Reconciler;
use prom_elector::election::{Callbacks as ElectionCallbacks, LeaseParams, StartError, StopError, Supervisor};
use prom_elector::health::{Callbacks as HealthCallbacks, HttpCheckConfig, HttpChecker};
use prom_elector::notifier::{self, Notify};
use prom_elector::readiness::{HttpWaiter, NoopWaiter, Wait};
use prom_elector::watcher::Watcher;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // The source/output paths are shared by both modes: init-mode performs
    // exactly one non-leader reconcile against them and exits, full runtime
    // mode performs the same bootstrap reconcile before anything else
    // starts (cmd/main.go: reconcile always runs before the init early
    // return).
    let init_config = cli.validate_init()?;
    let reconciler = Arc::new(Reconciler::new(
        init_config.config_path.clone(),
        init_config.output_path.clone(),
    ));

    info!("performing bootstrap reconcile");
    reconciler.reconcile()?;

    if cli.init {
        info!("--init requested, exiting after bootstrap reconcile");
        return Ok(());
    }

    let runtime = cli.validate_runtime()?;

    let registry = prometheus::Registry::new();
    registry.register(Box::new(prometheus::process_collector::ProcessCollector::for_self()))?;

    if let Some(path) = &runtime.kubeconfig {
        std::env::set_var("KUBECONFIG", path);
    }
    let client = kube::Client::try_default().await?;

    let notifier: Arc<dyn Notify> = Arc::new(notifier::build(
        runtime.reload_url.clone(),
        runtime.reload_method.clone(),
        runtime.reload_timeout,
        runtime.reload_max_attempts,
        runtime.reload_retry_delay,
        &registry,
    )?);

    let lease_params = LeaseParams {
        name: runtime.lease_name.clone(),
        namespace: runtime.lease_namespace.clone(),
        identity: runtime.member_id.clone(),
        lease_duration: chrono::Duration::from_std(runtime.lease_duration)?,
        renew_deadline: chrono::Duration::from_std(runtime.lease_renew_deadline)?,
        retry_period: chrono::Duration::from_std(runtime.lease_retry_period)?,
    };

    let leading_reconciler = Arc::clone(&reconciler);
    let leading_notifier = Arc::clone(&notifier);
    let stopped_reconciler = Arc::clone(&reconciler);
    let stopped_notifier = Arc::clone(&notifier);

    let supervisor = Arc::new(Supervisor::new(
        client,
        lease_params,
        ElectionCallbacks {
            on_started_leading: Box::new(move || {
                let reconciler = Arc::clone(&leading_reconciler);
                let notifier = Arc::clone(&leading_notifier);
                Box::pin(async move {
                    info!("started leading, reconciling leader configuration");
                    if let Err(err) = reconciler.reconcile() {
                        error!(error = %err, "reconcile failed on leadership acquisition");
                        return;
                    }
                    if let Err(err) = notifier.notify(&CancellationToken::new()).await {
                        error!(error = %err, "notify failed on leadership acquisition");
                    }
                })
            }),
            on_stopped_leading: Box::new(move || {
                let reconciler = Arc::clone(&stopped_reconciler);
                let notifier = Arc::clone(&stopped_notifier);
                Box::pin(async move {
                    info!("stopped leading, reconciling follower configuration");
                    if let Err(err) = reconciler.reconcile() {
                        error!(error = %err, "reconcile failed on leadership loss");
                        return;
                    }
                    if let Err(err) = notifier.notify(&CancellationToken::new()).await {
                        error!(error = %err, "notify failed on leadership loss");
                    }
                })
            }),
        },
        &registry,
    )?);

    reconciler.attach_status(supervisor.status());

    let proxy = match &runtime.proxy {
        Some(cfg) => Some(Arc::new(Proxy::new(
            ApiProxyConfig {
                local_port: cfg.local_port,
                remote_port: cfg.remote_port,
                service_name: cfg.service_name.clone(),
            },
            supervisor.status(),
        ))),
        None => None,
    };

    let root_token = CancellationToken::new();
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    // Readiness gates everything downstream of it: a `watch` channel
    // (rather than a one-shot) because both the unconditional-start path
    // below and the health-check loop need to observe it becoming ready,
    // and only one of the two ever runs for a given configuration.
    let (ready_tx, ready_rx) = tokio::sync::watch::channel(false);
    let readiness_token = root_token.child_token();
    let readiness_waiter: Arc<dyn Wait> = match &runtime.readiness_url {
        Some(url) => Arc::new(HttpWaiter::new(url.clone(), runtime.readiness_poll_period)),
        None => Arc::new(NoopWaiter),
    };
    tasks.spawn(async move {
        readiness_waiter.wait(&readiness_token).await?;
        let _ = ready_tx.send(true);
        Ok(())
    });

    if runtime.health_url.is_none() {
        // No health gate configured: participation begins as soon as the
        // scraper answers readiness (spec.md §2, §1 "gated by scraper
        // health" — with no health URL there is nothing else to gate on)
        // and is never stopped afterwards.
        let supervisor_for_task = Arc::clone(&supervisor);
        let election_token = root_token.child_token();
        let mut ready_rx = ready_rx.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = election_token.cancelled() => return Ok(()),
                result = ready_rx.wait_for(|ready| *ready) => { result?; }
            }
            supervisor_for_task.start().await?;
            election_token.cancelled().await;
            Ok(())
        });
    } else if let Some(health_url) = runtime.health_url.clone() {
        // A health URL is configured: the health checker's `on_healthy`
        // edge is the *only* path that starts the supervisor, so a node
        // whose scraper is unhealthy from boot never joins the election.
        let supervisor_for_health = Arc::clone(&supervisor);
        let health_token = root_token.child_token();
        let success_threshold = runtime.health_success_threshold;
        let failure_threshold = runtime.health_failure_threshold;
        let period = runtime.health_period;
        let timeout = runtime.health_timeout;
        let mut ready_rx = ready_rx.clone();
        tasks.spawn(async move {
            // The health-check loop starts only after the readiness gate
            // closes (spec.md §5).
            tokio::select! {
                _ = health_token.cancelled() => return Ok(()),
                result = ready_rx.wait_for(|ready| *ready) => { result?; }
            }

            let start_supervisor = Arc::clone(&supervisor_for_health);
            let stop_supervisor = Arc::clone(&supervisor_for_health);
            let checker = HttpChecker::new(
                HttpCheckConfig {
                    url: health_url,
                    period,
                    timeout,
                    success_threshold,
                    failure_threshold,
                },
                HealthCallbacks {
                    on_healthy: Box::new(move || {
                        let supervisor = Arc::clone(&start_supervisor);
                        Box::pin(async move {
                            match supervisor.start().await {
                                Ok(()) | Err(StartError::AlreadyRunning) => {
                                    info!("healthy, participating in election")
                                }
                            }
                        })
                    }),
                    on_unhealthy: Box::new(move || {
                        let supervisor = Arc::clone(&stop_supervisor);
                        Box::pin(async move {
                            match supervisor.stop(std::time::Duration::from_secs(15)).await {
                                Ok(()) | Err(StopError::NotRunning) => {
                                    warn!("unhealthy, left election")
                                }
                                Err(err) => error!(error = %err, "failed to leave election cleanly"),
                            }
                        })
                    }),
                },
            );
            checker.run(health_token).await;
            Ok(())
        });
    }

    let watcher_dir: PathBuf = PathBuf::from(&init_config.config_path)
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let watcher_file = PathBuf::from(&init_config.config_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| init_config.config_path.clone());
    let watcher = Watcher::new(
        watcher_dir,
        watcher_file,
        Arc::clone(&reconciler),
        Arc::clone(&notifier),
    )?;
    let watcher_token = root_token.child_token();
    tasks.spawn(async move { watcher.run(watcher_token).await.map_err(anyhow::Error::from) });

    let server = Server::new(
        runtime.api_listen_addr.clone(),
        runtime.api_shutdown_grace,
        registry,
        supervisor.status(),
        proxy,
    );
    let server_token = root_token.child_token();
    tasks.spawn(async move { server.serve(server_token).await.map_err(anyhow::Error::from) });

    info!("prometheus-elector running");

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("shutdown signal received");
        }
        result = drain(&mut tasks) => {
            if let Err(err) = result {
                error!(error = %err, "a component task failed, shutting down");
            }
        }
    }

    root_token.cancel();

    if let Err(err) = drain(&mut tasks).await {
        error!(error = %err, "a component task failed during shutdown");
    }

    if let Err(err) = supervisor.stop(std::time::Duration::from_secs(15)).await {
        match err {
            StopError::NotRunning => {}
            other => warn!(error = %other, "failed to release lease cleanly during shutdown"),
        }
    }

    info!("prometheus-elector shut down gracefully");
    Ok(())
}

/// Waits until every task in the set has completed, short-circuiting on
/// the first `Err` (either an inner task error or a join/panic error).
async fn drain(tasks: &mut JoinSet<anyhow::Result<()>>) -> anyhow::Result<()> {
    while let Some(result) = tasks.join_next().await {
        result??;
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => error!(error = %err, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
