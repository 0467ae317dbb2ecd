//! 健康与指标。
//!
//! - GET /health
//! - GET /metrics

use crate::AppState;
use crate::control::ConnectorView;
use crate::utils::response::ok;
use axum::{extract::State, response::Response};
use edge_telemetry::metrics;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthDto {
    pub ok: bool,
    pub transport_connected: bool,
    pub throttled: bool,
    pub queue_depth: u64,
    pub active_faults: u64,
    pub connectors: Vec<ConnectorView>,
}

pub async fn health(State(state): State<AppState>) -> Response {
    let snapshot = metrics().snapshot();
    ok(HealthDto {
        ok: true,
        transport_connected: snapshot.transport_connected,
        throttled: snapshot.throttled,
        queue_depth: snapshot.queue_depth,
        active_faults: snapshot.active_faults,
        connectors: state.control.connectors(),
    })
}

pub async fn get_metrics() -> Response {
    ok(metrics().snapshot())
}
