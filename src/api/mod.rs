//! Exposes the `/_elector/*` control endpoints and, optionally, proxies
//! everything else to the current leader. Grounded in `api/server.go`
//! for the graceful-shutdown-with-grace-delay behavior, using the
//! axum `Router` + `State` shape for the health/metrics endpoints.

pub mod proxy;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use proxy::{Proxy, ProxyConfig};

use crate::election::LeaderStatus;


#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server exited with an error: {0}")]
    Serve(#[source] std::io::Error),
    #[error("server task panicked")]
    TaskPanicked,
}

#[derive(Clone)]
struct AppState {
    status: LeaderStatus,
    registry: Registry,
    proxy: Option<Arc<Proxy>>,
}

#[derive(Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
struct LeaderResponse {
    is_leader: bool,
    current_leader: String,
}

async fn leader(State(state): State<AppState>) -> impl IntoResponse {
    Json(LeaderResponse {
        is_leader: state.status.is_leader(),
        current_leader: state.status.current_leader(),
    })
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let families = state.registry.gather();
    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

/// Serves the control API and, when `proxy` is set, reverse-proxies
/// every other path to the current lease holder.
pub struct Server {
    listen_addr: String,
    shutdown_grace: Duration,
    router: Router,
}

impl Server {
    pub fn new(
        listen_addr: impl Into<String>,
        shutdown_grace: Duration,
        registry: Registry,
        status: LeaderStatus,
        proxy: Option<Arc<Proxy>>,
    ) -> Self {
        let state = AppState {
            status,
            registry,
            proxy: proxy.clone(),
        };

        let api_router = Router::new()
            .route("/_elector/leader", get(leader))
            .route("/_elector/healthz", get(healthz))
            .route("/_elector/metrics", get(metrics))
            .with_state(state);

        let fallback_router = Router::new().fallback(proxy::fallback).with_state(proxy);

        let router = api_router.merge(fallback_router);

        Self {
            listen_addr: listen_addr.into(),
            shutdown_grace,
            router,
        }
    }

    /// Binds the listener so the caller can learn the concrete address
    /// (useful when `listen_addr` asks for an ephemeral port) before
    /// handing off to [`BoundServer::serve`].
    pub async fn bind(self) -> Result<BoundServer, ServerError> {
        let listener =
            TcpListener::bind(&self.listen_addr)
                .await
                .map_err(|source| ServerError::Bind {
                    addr: self.listen_addr.clone(),
                    source,
                })?;

        Ok(BoundServer {
            listener,
            router: self.router,
            shutdown_grace: self.shutdown_grace,
        })
    }

    /// Binds and serves until `cancel` fires, then waits up to
    /// `shutdown_grace` for in-flight requests to drain before aborting
    /// the accept loop outright.
    pub async fn serve(self, cancel: CancellationToken) -> Result<(), ServerError> {
        self.bind().await?.serve(cancel).await
    }
}

pub struct BoundServer {
    listener: TcpListener,
    router: Router,
    shutdown_grace: Duration,
}

impl BoundServer {
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self, cancel: CancellationToken) -> Result<(), ServerError> {
        let listener = self.listener;
        let router = self.router;
        let shutdown_grace = self.shutdown_grace;

        tracing::info!(addr = ?listener.local_addr(), "api server listening");

        let shutdown_signal = cancel.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown_signal.cancelled().await })
                .await
        });
        let abort = task.abort_handle();

        cancel.cancelled().await;
        tracing::info!(grace = ?shutdown_grace, "shutting down api server");

        match tokio::time::timeout(shutdown_grace, task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(err))) => Err(ServerError::Serve(err)),
            Ok(Err(_join_err)) => Err(ServerError::TaskPanicked),
            Err(_elapsed) => {
                tracing::warn!("shutdown grace period expired, forcing close");
                abort.abort();
                Ok(())
            }
        }
    }
}
