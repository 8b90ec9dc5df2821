// tests/ops_http.rs
//
// Ops router exercised directly via tower::ServiceExt::oneshot (no sockets).

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use serde_json::Value as Json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower::ServiceExt as _;

use incident_signals::classifier::{shared_breaker, SharedBreaker};
use incident_signals::config::TimezoneConfig;
use incident_signals::metrics::Metrics;
use incident_signals::ops::{router, OpsState};
use incident_signals::quota::QuotaLedger;
use incident_signals::{MemoryStore, SignalStore};

mod common;
use common::FlakyStore;

const BODY_LIMIT: usize = 1024 * 1024;

fn app(store: Arc<dyn SignalStore>, breaker: SharedBreaker) -> Router {
    router(OpsState {
        quota: QuotaLedger::new(store.clone(), 5, TimezoneConfig::default()),
        store,
        breaker,
        metrics: Some(Metrics::detached().handle),
    })
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build request");
    let resp = app.oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body")
        .to_vec();
    (status, bytes)
}

#[tokio::test]
async fn health_ok_when_breaker_closed_and_db_reachable() {
    let (status, bytes) = get(app(Arc::new(MemoryStore::new()), shared_breaker(5, 600)), "/health").await;
    assert_eq!(status, StatusCode::OK);
    let v: Json = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(v["status"], "OK");
    assert_eq!(v["details"]["circuit_breaker"], "CLOSED");
    assert_eq!(v["details"]["db"], "OK");
}

#[tokio::test]
async fn health_degraded_while_breaker_open() {
    let breaker = shared_breaker(1, 600);
    breaker.lock().unwrap().on_failure(Utc::now());

    let (status, bytes) = get(app(Arc::new(MemoryStore::new()), breaker), "/health").await;
    assert_eq!(status, StatusCode::OK);
    let v: Json = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(v["status"], "DEGRADED");
    assert_eq!(v["details"]["circuit_breaker"], "OPEN");
}

#[tokio::test]
async fn health_critical_when_store_unreachable() {
    let store = FlakyStore::new();
    store.fail_writes.store(true, Ordering::SeqCst);

    let (status, bytes) = get(app(store, shared_breaker(5, 600)), "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let v: Json = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(v["status"], "CRITICAL");
}

#[tokio::test]
async fn status_reports_quota_breaker_and_subscribers() {
    let store: Arc<dyn SignalStore> = Arc::new(MemoryStore::new());
    store.activate_subscriber("ops-room").unwrap();
    store.activate_subscriber("night-shift").unwrap();
    store
        .check_and_insert("https://n.example/1", 0xdead_beef, 3, Utc::now())
        .unwrap();

    let (status, bytes) = get(app(store, shared_breaker(5, 600)), "/status").await;
    assert_eq!(status, StatusCode::OK);
    let v: Json = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(v["quota"]["max"], 5);
    assert_eq!(v["quota"]["count"], 0);
    assert_eq!(v["breaker"]["state"], "CLOSED");
    assert_eq!(v["dedup_entries"], 1);
    assert_eq!(v["active_subscribers"], 2);
}

#[tokio::test]
async fn metrics_endpoint_serves_text() {
    let (status, _) = get(app(Arc::new(MemoryStore::new()), shared_breaker(5, 600)), "/metrics").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn unknown_route_is_404() {
    let (status, _) = get(app(Arc::new(MemoryStore::new()), shared_breaker(5, 600)), "/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
