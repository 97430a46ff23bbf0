//! Reverse-proxies non-API requests to whichever member currently holds
//! the lease. Grounded in `api/proxy.go`'s `proxy`/`proxyCache`: a local
//! forward when this member leads, otherwise a cached forward to the
//! leader's in-cluster service address.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use parking_lot::RwLock;

use crate::election::LeaderStatus;

#[cfg(test)]
#[path = "proxy_test.rs"]
mod proxy_test;

pub struct ProxyConfig {
    pub local_port: u16,
    pub remote_port: u16,
    pub service_name: String,
}

/// Forwards requests either to the local scraper or to the current
/// leader's cluster-local address, caching the leader's base URL the
/// way `proxyCache` does in the original.
pub struct Proxy {
    status: LeaderStatus,
    client: reqwest::Client,
    local_base: String,
    remote_port: u16,
    service_name: String,
    cache: RwLock<HashMap<String, String>>,
}

impl Proxy {
    pub fn new(config: ProxyConfig, status: LeaderStatus) -> Self {
        Self {
            status,
            client: reqwest::Client::new(),
            local_base: format!("http://localhost:{}", config.local_port),
            remote_port: config.remote_port,
            service_name: config.service_name,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Double-checked cache lookup: a read-lock hit avoids ever taking the
    /// write lock; a miss is re-checked under the write lock before
    /// computing, so concurrent misses for the same member converge on one
    /// cached entry rather than racing.
    fn base_for(&self, member_id: &str) -> String {
        if let Some(base) = self.cache.read().get(member_id) {
            return base.clone();
        }

        let mut cache = self.cache.write();
        if let Some(base) = cache.get(member_id) {
            return base.clone();
        }

        let base = format!("http://{}.{}:{}", member_id, self.service_name, self.remote_port);
        cache.insert(member_id.to_string(), base.clone());
        base
    }

    pub async fn forward(&self, request: Request<Body>) -> Response {
        let base = if self.status.is_leader() {
            self.local_base.clone()
        } else {
            let leader = self.status.current_leader();
            if leader.is_empty() {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "no leader known to proxy to",
                )
                    .into_response();
            }
            self.base_for(&leader)
        };

        match relay(&self.client, &base, request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(error = %err, base = %base, "unable to relay proxied request");
                (StatusCode::INTERNAL_SERVER_ERROR, "something unexpected happened").into_response()
            }
        }
    }
}

async fn relay(
    client: &reqwest::Client,
    base: &str,
    request: Request<Body>,
) -> Result<Response, reqwest::Error> {
    let (parts, body) = request.into_parts();
    let target = format!("{base}{}", path_and_query(&parts.uri));

    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();

    let mut outgoing = client
        .request(parts.method, &target)
        .body(body_bytes.to_vec());

    for (name, value) in parts.headers.iter() {
        outgoing = outgoing.header(name, value);
    }

    let upstream = outgoing.send().await?;

    let status = upstream.status();
    let headers = upstream.headers().clone();
    let bytes = upstream.bytes().await?;

    let mut builder = Response::builder().status(status);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }

    let response = match builder.body(Body::from(bytes)) {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(error = %err, "failed to build proxied response");
            (StatusCode::INTERNAL_SERVER_ERROR, "something unexpected happened").into_response()
        }
    };
    Ok(response)
}

fn path_and_query(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string())
}

pub async fn fallback(State(proxy): State<Option<Arc<Proxy>>>, request: Request<Body>) -> Response {
    match proxy {
        Some(proxy) => proxy.forward(request).await,
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
