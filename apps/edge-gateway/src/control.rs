//! 运维控制面：连接器启停、强制重生、故障确认。
//!
//! HTTP 与 NCMD 两个入口共用同一个 [`GatewayControl`]。

use domain::{EventRecord, FaultEvent};
use edge_pipeline::FaultAcknowledger;
use edge_protocol::{ConnectorHandle, ConnectorHealthEvent, HealthKind};
use edge_sparkplug::NodeCommand;
use edge_transport::RunnerRequest;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("unknown connector: {0}")]
    UnknownConnector(String),
    #[error("fault acknowledgement rejected: {0}")]
    Fault(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

struct Registered {
    handle: ConnectorHandle,
    machines: Vec<String>,
}

/// 已启动连接器的句柄表（启动后只读）。
#[derive(Default)]
pub struct ConnectorRegistry {
    entries: BTreeMap<String, Registered>,
}

impl ConnectorRegistry {
    pub fn insert(&mut self, handle: ConnectorHandle, machines: Vec<String>) {
        self.entries
            .insert(handle.id().to_string(), Registered { handle, machines });
    }

    fn get(&self, id: &str) -> Result<&Registered, ControlError> {
        self.entries
            .get(id)
            .ok_or_else(|| ControlError::UnknownConnector(id.to_string()))
    }

    pub fn machines_of(&self, id: &str) -> &[String] {
        self.entries
            .get(id)
            .map(|entry| entry.machines.as_slice())
            .unwrap_or_default()
    }
}

/// 连接器状态（`GET /health` 附带）。
#[derive(Debug, Clone, Serialize)]
pub struct ConnectorView {
    pub id: String,
    pub enabled: bool,
    pub machines: Vec<String>,
}

#[derive(Clone)]
pub struct GatewayControl {
    connectors: Arc<ConnectorRegistry>,
    runner: mpsc::Sender<RunnerRequest>,
    faults: Option<FaultAcknowledger>,
}

impl GatewayControl {
    pub fn new(
        connectors: Arc<ConnectorRegistry>,
        runner: mpsc::Sender<RunnerRequest>,
        faults: Option<FaultAcknowledger>,
    ) -> Self {
        Self {
            connectors,
            runner,
            faults,
        }
    }

    pub fn start_connector(&self, id: &str) -> Result<(), ControlError> {
        self.connectors.get(id)?.handle.start();
        info!(target: "edge.gateway", connector_id = id, "connector_started");
        Ok(())
    }

    pub fn stop_connector(&self, id: &str) -> Result<(), ControlError> {
        self.connectors.get(id)?.handle.stop();
        info!(target: "edge.gateway", connector_id = id, "connector_stopped");
        Ok(())
    }

    pub async fn rebirth(&self) -> Result<(), ControlError> {
        self.runner
            .send(RunnerRequest::Rebirth)
            .await
            .map_err(|_| ControlError::Unavailable("session runner stopped".to_string()))
    }

    pub async fn acknowledge_fault(
        &self,
        machine_id: &str,
        code: i64,
        operator: &str,
    ) -> Result<FaultEvent, ControlError> {
        let faults = self
            .faults
            .as_ref()
            .ok_or_else(|| ControlError::Unavailable("pipeline disabled".to_string()))?;
        let event = faults
            .acknowledge(machine_id, code, operator)
            .await
            .map_err(|err| ControlError::Fault(err.to_string()))?;
        info!(
            target: "edge.gateway",
            machine_id,
            code,
            operator,
            record_id = %event.record.record_id,
            "fault_acknowledged_by_operator"
        );
        Ok(event)
    }

    /// 连接器掉线：其下所有机台发布 DDEATH。
    pub async fn connector_down(&self, id: &str) {
        for machine in self.connectors.machines_of(id) {
            if self
                .runner
                .send(RunnerRequest::DeviceDeath(machine.clone()))
                .await
                .is_err()
            {
                return;
            }
        }
    }

    pub fn connectors(&self) -> Vec<ConnectorView> {
        self.connectors
            .entries
            .iter()
            .map(|(id, entry)| ConnectorView {
                id: id.clone(),
                enabled: entry.handle.is_enabled(),
                machines: entry.machines.clone(),
            })
            .collect()
    }

    /// 执行一条 NCMD（Rebirth 已由会话运行器自行处理）。
    pub async fn apply(&self, command: NodeCommand) {
        let result = match &command {
            NodeCommand::Rebirth => self.rebirth().await,
            NodeCommand::ConnectorStart(id) => self.start_connector(id),
            NodeCommand::ConnectorStop(id) => self.stop_connector(id),
            NodeCommand::AcknowledgeFault {
                machine_id,
                code,
                operator,
            } => self
                .acknowledge_fault(machine_id, *code, operator)
                .await
                .map(|_| ()),
        };
        if let Err(err) = result {
            warn!(target: "edge.gateway", command = ?command, error = %err, "node_command_failed");
        }
    }
}

/// 消费会话运行器转发的节点命令，直到通道关闭。
pub async fn run_commands(control: GatewayControl, mut commands: mpsc::Receiver<NodeCommand>) {
    while let Some(command) = commands.recv().await {
        control.apply(command).await;
    }
}

/// 消费连接器健康事件：更新指标、掉线发布 DDEATH、转发为输出事件。
pub async fn forward_health(
    control: GatewayControl,
    mut health: mpsc::Receiver<ConnectorHealthEvent>,
    events: Option<mpsc::Sender<EventRecord>>,
) {
    while let Some(event) = health.recv().await {
        let record = event.to_record();
        match &event.kind {
            HealthKind::Up => {
                edge_telemetry::set_connector_up(&event.connector_id, true);
                info!(target: "edge.gateway", connector_id = %event.connector_id, "connector_up");
            }
            HealthKind::Down { reason } => {
                edge_telemetry::set_connector_up(&event.connector_id, false);
                warn!(
                    target: "edge.gateway",
                    connector_id = %event.connector_id,
                    reason = %reason,
                    "connector_down"
                );
                control.connector_down(&event.connector_id).await;
            }
            _ => {
                warn!(
                    target: "edge.gateway",
                    connector_id = %event.connector_id,
                    detail = ?record.detail,
                    "connector_diagnostic"
                );
            }
        }
        if let Some(events) = &events
            && events.send(EventRecord::ConnectorHealth(record)).await.is_err()
        {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::ConnectorStatus;
    use edge_protocol::{ConnectorControl, RateMode};
    use tokio::sync::watch;

    fn registry() -> (Arc<ConnectorRegistry>, ConnectorControl) {
        let (_rate_tx, rate_rx) = watch::channel(RateMode::Normal);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (health_tx, _health_rx) = mpsc::channel(4);
        let (connector, handle) = ConnectorControl::new("plc-1", rate_rx, shutdown_rx, health_tx);
        let mut registry = ConnectorRegistry::default();
        registry.insert(handle, vec!["press-01".to_string(), "press-02".to_string()]);
        (Arc::new(registry), connector)
    }

    #[tokio::test]
    async fn node_commands_toggle_connectors() {
        let (registry, connector) = registry();
        let (runner_tx, _runner_rx) = mpsc::channel(4);
        let control = GatewayControl::new(registry, runner_tx, None);

        control
            .apply(NodeCommand::ConnectorStop("plc-1".to_string()))
            .await;
        assert!(!connector.is_enabled());
        control
            .apply(NodeCommand::ConnectorStart("plc-1".to_string()))
            .await;
        assert!(connector.is_enabled());
        assert!(matches!(
            control.start_connector("plc-9"),
            Err(ControlError::UnknownConnector(_))
        ));
    }

    #[tokio::test]
    async fn connector_down_kills_its_devices() {
        let (registry, _connector) = registry();
        let (runner_tx, mut runner_rx) = mpsc::channel(4);
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let (health_tx, health_rx) = mpsc::channel(4);
        let control = GatewayControl::new(registry, runner_tx, None);
        let task = tokio::spawn(forward_health(control, health_rx, Some(events_tx)));

        health_tx
            .send(ConnectorHealthEvent::new(
                "plc-1",
                HealthKind::Down {
                    reason: "refused".to_string(),
                },
            ))
            .await
            .expect("send");
        drop(health_tx);
        task.await.expect("join");

        assert_eq!(
            runner_rx.recv().await,
            Some(RunnerRequest::DeviceDeath("press-01".to_string()))
        );
        assert_eq!(
            runner_rx.recv().await,
            Some(RunnerRequest::DeviceDeath("press-02".to_string()))
        );
        let Some(EventRecord::ConnectorHealth(record)) = events_rx.recv().await else {
            panic!("expected connector health event");
        };
        assert_eq!(record.status, ConnectorStatus::Down);
    }

    #[tokio::test]
    async fn acknowledge_without_pipeline_is_unavailable() {
        let (registry, _connector) = registry();
        let (runner_tx, _runner_rx) = mpsc::channel(4);
        let control = GatewayControl::new(registry, runner_tx, None);
        assert!(matches!(
            control.acknowledge_fault("press-01", 7, "op").await,
            Err(ControlError::Unavailable(_))
        ));
    }
}
