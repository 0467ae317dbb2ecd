//! 边缘采集网关：连接器采集、Sparkplug 会话与断网续传、流处理流水线，
//! 附带健康/指标/运维控制 HTTP 接口。

mod catalog;
mod control;
mod gateway;
mod handlers;
mod routes;
mod utils;

use control::GatewayControl;
use edge_config::AppConfig;
use edge_telemetry::init_tracing;
use gateway::Gateway;
use std::future::Future;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub control: GatewayControl,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在）
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;
    init_tracing();

    let gateway = Gateway::start(&config).await?;
    let app = routes::create_router(AppState {
        control: gateway.control(),
    });

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!(target: "edge.gateway", addr = %config.http_addr, "http_listening");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(gateway.fatal().wait()))
        .await;
    if let Err(err) = &served {
        error!(target: "edge.gateway", error = %err, "http_server_failed");
    }

    let stopped = gateway.shutdown().await;
    served?;
    stopped?;
    Ok(())
}

/// Ctrl-C 或会话运行器失败，先到者触发停机。
async fn shutdown_signal(fatal: impl Future<Output = String>) {
    let interrupted = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(target: "edge.gateway", error = %err, "signal_listener_failed");
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        () = interrupted => info!(target: "edge.gateway", "shutdown_requested"),
        reason = fatal => error!(target: "edge.gateway", reason = %reason, "fatal_shutdown"),
    }
}
