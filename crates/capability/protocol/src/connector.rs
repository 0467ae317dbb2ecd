//! 连接器公共契约：采集样本走数据通道，健康事件走独立通道。

use crate::error::ConnectorError;
use async_trait::async_trait;
use domain::{ConnectorHealth, ConnectorStatus, TagSample, TagValue, now_epoch_ms};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// 采集速率模式，由背压协调器发布。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateMode {
    #[default]
    Normal,
    /// 采集间隔乘以 `factor`
    Throttled { factor: u32 },
}

impl RateMode {
    pub fn factor(self) -> u32 {
        match self {
            RateMode::Normal => 1,
            RateMode::Throttled { factor } => factor.max(1),
        }
    }

    pub fn scale(self, base: Duration) -> Duration {
        base.saturating_mul(self.factor())
    }
}

/// 写请求：按源地址写入一个值。
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub address: String,
    pub value: TagValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HealthKind {
    Up,
    Down { reason: String },
    /// 设备异常应答的可读诊断
    DeviceFault { diagnostic: String },
    /// 单个点位的地址/类型错误，其余点位不受影响
    TagError { address: String, error: String },
    WriteFailed { address: String, error: String },
}

/// 连接器健康事件
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorHealthEvent {
    pub connector_id: String,
    pub kind: HealthKind,
    pub ts_ms: i64,
}

impl ConnectorHealthEvent {
    pub fn new(connector_id: impl Into<String>, kind: HealthKind) -> Self {
        Self {
            connector_id: connector_id.into(),
            kind,
            ts_ms: now_epoch_ms(),
        }
    }

    /// 转为输出事件记录；点位级错误不改变连接器状态。
    pub fn to_record(&self) -> ConnectorHealth {
        let (status, detail) = match &self.kind {
            HealthKind::Up => (ConnectorStatus::Up, None),
            HealthKind::Down { reason } => (ConnectorStatus::Down, Some(reason.clone())),
            HealthKind::DeviceFault { diagnostic } => {
                (ConnectorStatus::Up, Some(format!("device fault: {}", diagnostic)))
            }
            HealthKind::TagError { address, error } => {
                (ConnectorStatus::Up, Some(format!("tag {}: {}", address, error)))
            }
            HealthKind::WriteFailed { address, error } => {
                (ConnectorStatus::Up, Some(format!("write {}: {}", address, error)))
            }
        };
        ConnectorHealth {
            connector_id: self.connector_id.clone(),
            status,
            detail,
            ts_ms: self.ts_ms,
        }
    }
}

/// 连接器运行时控制面（由连接器持有的接收端）。
pub struct ConnectorControl {
    pub rate: watch::Receiver<RateMode>,
    pub enabled: watch::Receiver<bool>,
    pub writes: mpsc::Receiver<WriteRequest>,
    pub shutdown: watch::Receiver<bool>,
    pub health: mpsc::Sender<ConnectorHealthEvent>,
}

/// 网关侧持有的连接器句柄。
#[derive(Clone)]
pub struct ConnectorHandle {
    id: String,
    enabled: watch::Sender<bool>,
    writes: mpsc::Sender<WriteRequest>,
}

impl ConnectorControl {
    pub fn new(
        id: impl Into<String>,
        rate: watch::Receiver<RateMode>,
        shutdown: watch::Receiver<bool>,
        health: mpsc::Sender<ConnectorHealthEvent>,
    ) -> (ConnectorControl, ConnectorHandle) {
        let (enabled_tx, enabled_rx) = watch::channel(true);
        let (writes_tx, writes_rx) = mpsc::channel(64);
        (
            ConnectorControl {
                rate,
                enabled: enabled_rx,
                writes: writes_rx,
                shutdown,
                health,
            },
            ConnectorHandle {
                id: id.into(),
                enabled: enabled_tx,
                writes: writes_tx,
            },
        )
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    pub fn rate_mode(&self) -> RateMode {
        *self.rate.borrow()
    }

    /// 健康通道满或关闭时丢弃事件，不阻塞采集。
    pub fn report(&self, event: ConnectorHealthEvent) {
        let _ = self.health.try_send(event);
    }

    /// 停用期间挂起，直到重新启用或停机。返回 false 表示停机。
    pub async fn wait_enabled(&mut self) -> bool {
        loop {
            if self.is_shutdown() {
                return false;
            }
            if self.is_enabled() {
                return true;
            }
            tokio::select! {
                changed = self.enabled.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

impl ConnectorHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn start(&self) {
        self.enabled.send_replace(true);
    }

    pub fn stop(&self) {
        self.enabled.send_replace(false);
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    pub async fn write(&self, request: WriteRequest) -> Result<(), ConnectorError> {
        self.writes
            .send(request)
            .await
            .map_err(|_| ConnectorError::ChannelClosed)
    }
}

/// 连接器契约
#[async_trait]
pub trait Connector: Send {
    fn id(&self) -> &str;

    /// 运行采集循环直到停机信号；样本经 `sink` 发出。
    async fn run(
        &mut self,
        sink: mpsc::Sender<TagSample>,
        control: ConnectorControl,
    ) -> Result<(), ConnectorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_mode_scale() {
        let base = Duration::from_millis(100);
        assert_eq!(RateMode::Normal.scale(base), base);
        assert_eq!(
            RateMode::Throttled { factor: 8 }.scale(base),
            Duration::from_millis(800)
        );
        assert_eq!(RateMode::Throttled { factor: 0 }.factor(), 1);
    }

    #[test]
    fn test_health_record_status() {
        let down = ConnectorHealthEvent::new(
            "plc-1",
            HealthKind::Down {
                reason: "refused".to_string(),
            },
        );
        assert_eq!(down.to_record().status, ConnectorStatus::Down);
        let fault = ConnectorHealthEvent::new(
            "plc-1",
            HealthKind::DeviceFault {
                diagnostic: "illegal data address (02)".to_string(),
            },
        );
        assert_eq!(fault.to_record().status, ConnectorStatus::Up);
    }

    #[tokio::test]
    async fn test_handle_toggles_enabled() {
        let (_rate_tx, rate_rx) = watch::channel(RateMode::Normal);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (health_tx, _health_rx) = mpsc::channel(4);
        let (mut control, handle) = ConnectorControl::new("plc-1", rate_rx, shutdown_rx, health_tx);
        handle.stop();
        assert!(!control.is_enabled());
        handle.start();
        assert!(control.wait_enabled().await);
    }
}
