//! 路由定义
//!
//! - 健康与指标：/health, /metrics
//! - 运维控制：/control/*

use super::AppState;
use super::handlers::*;
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(get_metrics))
        .route("/control/rebirth", post(force_rebirth))
        .route("/control/connectors/:connector_id/start", post(start_connector))
        .route("/control/connectors/:connector_id/stop", post(stop_connector))
        .route("/control/faults/ack", post(acknowledge_fault))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
