#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

async fn spawn_echo_server() -> u16 {
    let app = Router::new().route(
        "/path",
        get(|| async { "hello from upstream" }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr.port()
}

#[test]
fn base_for_caches_across_calls() {
    let proxy = Proxy::new(
        ProxyConfig {
            local_port: 9090,
            remote_port: 9090,
            service_name: "prometheus".to_string(),
        },
        LeaderStatus::new(),
    );

    let first = proxy.base_for("peer-a");
    let second = proxy.base_for("peer-a");
    assert_eq!(first, second);
    assert_eq!(first, "http://peer-a.prometheus:9090");
    assert_eq!(proxy.cache.read().len(), 1);

    let other = proxy.base_for("peer-b");
    assert_eq!(other, "http://peer-b.prometheus:9090");
    assert_eq!(proxy.cache.read().len(), 2);
}

#[tokio::test]
async fn forwards_to_local_when_leader() {
    let port = spawn_echo_server().await;
    let status = LeaderStatus::new();
    status.update("self".to_string(), true);

    let proxy = Proxy::new(
        ProxyConfig {
            local_port: port,
            remote_port: 0,
            service_name: "unused".to_string(),
        },
        status,
    );

    let request = Request::builder()
        .method("GET")
        .uri("/path")
        .body(Body::empty())
        .unwrap();

    let response = proxy.forward(request).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn returns_500_when_no_leader_known() {
    let proxy = Proxy::new(
        ProxyConfig {
            local_port: 9090,
            remote_port: 9090,
            service_name: "prometheus".to_string(),
        },
        LeaderStatus::new(),
    );

    let request = Request::builder()
        .method("GET")
        .uri("/path")
        .body(Body::empty())
        .unwrap();

    let response = proxy.forward(request).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
