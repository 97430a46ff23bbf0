//! Command-line flags, plus the two validation passes `cmd/config.go`
//! splits into `validateInitConfig`/`validateRuntimeConfig`: init mode
//! only needs the config source/output paths, the full runtime needs
//! everything else (lease identity, notifier, readiness/health probes,
//! the API listen address, and the optional leader proxy).

use std::time::Duration;

use clap::Parser;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required flag --{0}")]
    MissingFlag(&'static str),
    #[error("--enable-proxy requires --proxy-service-name")]
    MissingProxyServiceName,
    #[error("unable to determine a member identity: --member-id is unset and the hostname could not be read: {0}")]
    Hostname(#[source] std::io::Error),
}

#[derive(Debug, Parser)]
#[command(
    name = "prometheus-elector",
    about = "Leader-election sidecar that reconciles a Prometheus fleet's scrape config and gates leader-only work to a single member"
)]
pub struct Cli {
    /// Identity this member registers on the lease. Defaults to the
    /// POD_NAME environment variable, then the process hostname.
    #[arg(long)]
    pub member_id: Option<String>,

    /// Name of the coordination.k8s.io/v1 Lease used for election.
    #[arg(long)]
    pub lease_name: Option<String>,

    /// Namespace containing the election Lease.
    #[arg(long)]
    pub lease_namespace: Option<String>,

    /// TTL written on lease acquisition.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "15s")]
    pub lease_duration: Duration,

    /// Maximum time the holder spends trying to renew before demoting.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    pub lease_renew_deadline: Duration,

    /// Delay between acquisition/renewal attempts.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "2s")]
    pub lease_retry_period: Duration,

    /// Path to a kubeconfig; omit to use in-cluster config or
    /// $KUBECONFIG.
    #[arg(long)]
    pub kubeconfig: Option<String>,

    /// Path of the prometheus-elector configuration document (YAML,
    /// `follower`/`leader` sections).
    #[arg(long)]
    pub config: Option<String>,

    /// Path to write the materialized effective Prometheus
    /// configuration.
    #[arg(long)]
    pub output: Option<String>,

    /// Only perform one non-leader reconcile and exit, for use as an
    /// init container ahead of the main process.
    #[arg(long)]
    pub init: bool,

    /// URL of the scraper's reload endpoint.
    #[arg(long)]
    pub reload_url: Option<String>,

    /// HTTP method used to request a reload.
    #[arg(long, default_value = "POST")]
    pub reload_method: String,

    /// Per-attempt timeout for the reload request.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
    pub reload_timeout: Duration,

    /// Maximum number of reload attempts before giving up.
    #[arg(long, default_value_t = 3)]
    pub reload_max_attempts: usize,

    /// Delay between reload attempts.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "2s")]
    pub reload_retry_delay: Duration,

    /// URL polled at startup until it answers 2xx. Omit to skip
    /// readiness gating entirely.
    #[arg(long)]
    pub readiness_url: Option<String>,

    /// Poll period for the readiness waiter.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "2s")]
    pub readiness_poll_period: Duration,

    /// URL probed on a fixed tick to gate election participation. Omit
    /// to skip health gating and participate unconditionally.
    #[arg(long)]
    pub health_url: Option<String>,

    /// Tick period for the health checker.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    pub health_period: Duration,

    /// Per-probe timeout for the health checker.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
    pub health_timeout: Duration,

    /// Consecutive successful probes required to call `on_healthy`.
    #[arg(long, default_value_t = 1)]
    pub health_success_threshold: u32,

    /// Consecutive failed probes required to call `on_unhealthy`.
    #[arg(long, default_value_t = 3)]
    pub health_failure_threshold: u32,

    /// Address the `/_elector/*` API listens on.
    #[arg(long, default_value = "0.0.0.0:9091")]
    pub api_listen_addr: String,

    /// Grace period allowed for in-flight requests to drain on
    /// shutdown before the listener is force-closed.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
    pub api_shutdown_grace: Duration,

    /// Reverse-proxy every non-`/_elector/*` request to the current
    /// leader.
    #[arg(long)]
    pub enable_proxy: bool,

    /// Port the local scraper listens on, used when this member leads.
    #[arg(long, default_value_t = 9090)]
    pub proxy_local_port: u16,

    /// Port the scraper listens on for other members, used when
    /// forwarding to the current leader.
    #[arg(long, default_value_t = 9090)]
    pub proxy_remote_port: u16,

    /// Headless service name used to address other members
    /// (`http://<member>.<service>:<remote_port>`).
    #[arg(long)]
    pub proxy_service_name: Option<String>,
}

/// Config needed before any task spawns: just enough to perform the
/// bootstrap reconcile (mirrors `validateInitConfig`).
pub struct InitConfig {
    pub config_path: String,
    pub output_path: String,
}

/// Everything else, validated only when not running in `--init` mode
/// (mirrors `validateRuntimeConfig`).
pub struct RuntimeConfig {
    pub member_id: String,
    pub lease_name: String,
    pub lease_namespace: String,
    pub lease_duration: Duration,
    pub lease_renew_deadline: Duration,
    pub lease_retry_period: Duration,
    pub kubeconfig: Option<String>,
    pub reload_url: String,
    pub reload_method: String,
    pub reload_timeout: Duration,
    pub reload_max_attempts: usize,
    pub reload_retry_delay: Duration,
    pub readiness_url: Option<String>,
    pub readiness_poll_period: Duration,
    pub health_url: Option<String>,
    pub health_period: Duration,
    pub health_timeout: Duration,
    pub health_success_threshold: u32,
    pub health_failure_threshold: u32,
    pub api_listen_addr: String,
    pub api_shutdown_grace: Duration,
    pub proxy: Option<ProxyConfig>,
}

pub struct ProxyConfig {
    pub local_port: u16,
    pub remote_port: u16,
    pub service_name: String,
}

impl Cli {
    pub fn validate_init(&self) -> Result<InitConfig, ConfigError> {
        Ok(InitConfig {
            config_path: self
                .config
                .clone()
                .ok_or(ConfigError::MissingFlag("config"))?,
            output_path: self
                .output
                .clone()
                .ok_or(ConfigError::MissingFlag("output"))?,
        })
    }

    pub fn validate_runtime(&self) -> Result<RuntimeConfig, ConfigError> {
        let lease_name = self
            .lease_name
            .clone()
            .ok_or(ConfigError::MissingFlag("lease-name"))?;
        let lease_namespace = self
            .lease_namespace
            .clone()
            .ok_or(ConfigError::MissingFlag("lease-namespace"))?;
        let reload_url = self
            .reload_url
            .clone()
            .ok_or(ConfigError::MissingFlag("reload-url"))?;

        let member_id = match &self.member_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => match std::env::var("POD_NAME") {
                Ok(id) if !id.is_empty() => id,
                _ => hostname::get()
                    .map_err(ConfigError::Hostname)?
                    .to_string_lossy()
                    .into_owned(),
            },
        };

        let proxy = if self.enable_proxy {
            Some(ProxyConfig {
                local_port: self.proxy_local_port,
                remote_port: self.proxy_remote_port,
                service_name: self
                    .proxy_service_name
                    .clone()
                    .ok_or(ConfigError::MissingProxyServiceName)?,
            })
        } else {
            None
        };

        Ok(RuntimeConfig {
            member_id,
            lease_name,
            lease_namespace,
            lease_duration: self.lease_duration,
            lease_renew_deadline: self.lease_renew_deadline,
            lease_retry_period: self.lease_retry_period,
            kubeconfig: self.kubeconfig.clone(),
            reload_url,
            reload_method: self.reload_method.clone(),
            reload_timeout: self.reload_timeout,
            reload_max_attempts: self.reload_max_attempts,
            reload_retry_delay: self.reload_retry_delay,
            readiness_url: self.readiness_url.clone(),
            readiness_poll_period: self.readiness_poll_period,
            health_url: self.health_url.clone(),
            health_period: self.health_period,
            health_timeout: self.health_timeout,
            health_success_threshold: self.health_success_threshold,
            health_failure_threshold: self.health_failure_threshold,
            api_listen_addr: self.api_listen_addr.clone(),
            api_shutdown_grace: self.api_shutdown_grace,
            proxy,
        })
    }
}
