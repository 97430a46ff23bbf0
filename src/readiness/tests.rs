#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use axum::routing::get;
use axum::Router;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::test]
async fn noop_waiter_returns_immediately() {
    let waiter = NoopWaiter;
    waiter.wait(&CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn http_waiter_blocks_until_ready() {
    let hits = Arc::new(AtomicUsize::new(0));
    let state = Arc::clone(&hits);

    let app = Router::new().route(
        "/ready",
        get(move || {
            let state = Arc::clone(&state);
            async move {
                let n = state.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    axum::http::StatusCode::SERVICE_UNAVAILABLE
                } else {
                    axum::http::StatusCode::OK
                }
            }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let waiter = HttpWaiter::new(format!("http://{addr}/ready"), Duration::from_millis(5));
    waiter.wait(&CancellationToken::new()).await.unwrap();
    assert!(hits.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn http_waiter_returns_promptly_on_cancellation() {
    let waiter = HttpWaiter::new(
        "http://127.0.0.1:1/ready".to_string(),
        Duration::from_secs(60),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(1), waiter.wait(&cancel)).await;
    assert!(result.is_ok(), "wait should return promptly once cancelled");
}
