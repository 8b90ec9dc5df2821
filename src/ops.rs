// src/ops.rs
//! Read-only ops surface: `/health`, `/metrics`, `/status`.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;

use crate::classifier::{BreakerSnapshot, BreakerState, SharedBreaker};
use crate::model::QuotaState;
use crate::quota::QuotaLedger;
use crate::store::{acquire_lock, SignalStore};

#[derive(Clone)]
pub struct OpsState {
    pub store: Arc<dyn SignalStore>,
    pub breaker: SharedBreaker,
    pub quota: QuotaLedger,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: OpsState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/status", get(status))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct HealthDetails {
    pub circuit_breaker: &'static str,
    pub db: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResp {
    pub status: &'static str,
    pub details: HealthDetails,
}

async fn health(State(st): State<OpsState>) -> (StatusCode, Json<HealthResp>) {
    let breaker_open = acquire_lock(&st.breaker).state() == BreakerState::Open;
    let db = st.store.dedup_len().map(|_| "OK".to_string());

    let (code, status) = match (&db, breaker_open) {
        (Err(_), _) => (StatusCode::SERVICE_UNAVAILABLE, "CRITICAL"),
        (Ok(_), true) => (StatusCode::OK, "DEGRADED"),
        (Ok(_), false) => (StatusCode::OK, "OK"),
    };
    let details = HealthDetails {
        circuit_breaker: if breaker_open { "OPEN" } else { "CLOSED" },
        db: db.unwrap_or_else(|e| e.to_string()),
    };
    (code, Json(HealthResp { status, details }))
}

async fn metrics_text(State(st): State<OpsState>) -> String {
    st.metrics.as_ref().map(|h| h.render()).unwrap_or_default()
}

#[derive(Debug, Serialize)]
pub struct StatusResp {
    pub quota: QuotaState,
    pub breaker: BreakerSnapshot,
    pub dedup_entries: usize,
    pub active_subscribers: usize,
}

async fn status(
    State(st): State<OpsState>,
) -> Result<Json<StatusResp>, (StatusCode, String)> {
    let internal = |e: crate::error::StoreError| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    let day = st.quota.day_of(Utc::now());
    let quota = st.quota.state(day).map_err(internal)?;
    let dedup_entries = st.store.dedup_len().map_err(internal)?;
    let active_subscribers = st.store.active_subscribers().map_err(internal)?.len();
    let breaker = acquire_lock(&st.breaker).snapshot();
    Ok(Json(StatusResp {
        quota,
        breaker,
        dedup_entries,
        active_subscribers,
    }))
}
