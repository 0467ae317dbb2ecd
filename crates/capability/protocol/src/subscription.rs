//! 订阅型连接器（OPC 风格）
//!
//! 订阅项按 (采样间隔, 死区) 分组，每组建立一个服务器订阅；
//! 服务器推送变化，值、质量与服务器时间戳原样传递。
//! 降速时对已有订阅调整采样间隔，不重建连接。

use crate::backoff::Backoff;
use crate::connector::{Connector, ConnectorControl, ConnectorHealthEvent, HealthKind};
use crate::error::ConnectorError;
use crate::types::MonitoredItem;
use async_trait::async_trait;
use domain::{now_epoch_ms, Deadband, Quality, TagSample, TagValue};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub type SubscriptionId = u32;

/// 服务器推送的一次值变化
#[derive(Debug, Clone, PartialEq)]
pub struct DataChange {
    pub address: String,
    pub value: TagValue,
    pub quality: Quality,
    pub source_ts_ms: i64,
}

/// 订阅式采集客户端（厂商库的抽象）
#[async_trait]
pub trait SubscriptionClient: Send {
    async fn connect(&mut self) -> Result<(), ConnectorError>;

    async fn create_subscription(
        &mut self,
        sampling_interval_ms: u64,
        deadband: Deadband,
        addresses: &[String],
    ) -> Result<SubscriptionId, ConnectorError>;

    /// 调整已有订阅的采样间隔
    async fn set_sampling_interval(
        &mut self,
        subscription: SubscriptionId,
        sampling_interval_ms: u64,
    ) -> Result<(), ConnectorError>;

    /// 等待下一次变化；会话结束返回错误。
    async fn next_change(&mut self) -> Result<DataChange, ConnectorError>;

    async fn write(&mut self, address: &str, value: &TagValue) -> Result<(), ConnectorError>;

    async fn disconnect(&mut self);
}

/// 订阅配置
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscriptionSettings {
    #[serde(default = "default_retry_base")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_cap")]
    pub retry_cap_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default)]
    pub items: Vec<MonitoredItem>,
}

fn default_retry_base() -> u64 {
    500
}

fn default_retry_cap() -> u64 {
    30_000
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            retry_base_ms: default_retry_base(),
            retry_cap_ms: default_retry_cap(),
            failure_threshold: default_failure_threshold(),
            items: Vec::new(),
        }
    }
}

impl SubscriptionSettings {
    pub fn from_value(settings: &serde_json::Value) -> Result<Self, ConnectorError> {
        serde_json::from_value(settings.clone())
            .map_err(|e| ConnectorError::ConfigParse(e.to_string()))
    }
}

/// 同采样间隔、同死区的一组订阅项
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionGroup {
    pub sampling_interval_ms: u64,
    pub deadband: Deadband,
    pub addresses: Vec<String>,
}

fn group_items(items: &[MonitoredItem]) -> Vec<SubscriptionGroup> {
    let mut groups: Vec<SubscriptionGroup> = Vec::new();
    for item in items {
        match groups.iter_mut().find(|group| {
            group.sampling_interval_ms == item.sampling_interval_ms
                && group.deadband == item.deadband
        }) {
            Some(group) => group.addresses.push(item.address.clone()),
            None => groups.push(SubscriptionGroup {
                sampling_interval_ms: item.sampling_interval_ms,
                deadband: item.deadband,
                addresses: vec![item.address.clone()],
            }),
        }
    }
    groups
}

/// 订阅型连接器
pub struct SubscriptionConnector<C: SubscriptionClient> {
    id: String,
    client: C,
    settings: SubscriptionSettings,
    groups: Vec<SubscriptionGroup>,
    machines: HashMap<String, String>,
    subscriptions: Vec<(SubscriptionId, u64)>,
    backoff: Backoff,
    consecutive_failures: u32,
    down: bool,
}

impl<C: SubscriptionClient> SubscriptionConnector<C> {
    pub fn new(id: impl Into<String>, client: C, settings: SubscriptionSettings) -> Self {
        let groups = group_items(&settings.items);
        let machines = settings
            .items
            .iter()
            .map(|item| (item.address.clone(), item.machine_id.clone()))
            .collect();
        let backoff = Backoff::new(
            Duration::from_millis(settings.retry_base_ms),
            Duration::from_millis(settings.retry_cap_ms),
        );
        Self {
            id: id.into(),
            client,
            settings,
            groups,
            machines,
            subscriptions: Vec::new(),
            backoff,
            consecutive_failures: 0,
            down: false,
        }
    }

    pub fn groups(&self) -> &[SubscriptionGroup] {
        &self.groups
    }

    async fn establish(&mut self, control: &ConnectorControl) -> Result<(), ConnectorError> {
        self.client.connect().await?;
        self.subscriptions.clear();
        let factor = u64::from(control.rate_mode().factor());
        for group in &self.groups {
            let interval = group.sampling_interval_ms.saturating_mul(factor);
            let id = self
                .client
                .create_subscription(interval, group.deadband, &group.addresses)
                .await?;
            self.subscriptions.push((id, group.sampling_interval_ms));
        }
        info!(
            target: "edge.protocol",
            connector = %self.id,
            subscriptions = self.subscriptions.len(),
            "subscription_established"
        );
        Ok(())
    }

    async fn apply_rate(&mut self, control: &ConnectorControl) {
        let factor = u64::from(control.rate_mode().factor());
        for (id, base) in self.subscriptions.clone() {
            let interval = base.saturating_mul(factor);
            if let Err(err) = self.client.set_sampling_interval(id, interval).await {
                warn!(
                    target: "edge.protocol",
                    connector = %self.id,
                    subscription = id,
                    error = %err,
                    "subscription_interval_rejected"
                );
            }
        }
    }

    fn bad_samples(&self) -> Vec<TagSample> {
        let ts_ms = now_epoch_ms();
        self.settings
            .items
            .iter()
            .map(|item| TagSample::bad(item.machine_id.clone(), item.address.clone(), ts_ms))
            .collect()
    }

    async fn on_failure(
        &mut self,
        err: &ConnectorError,
        sink: &mpsc::Sender<TagSample>,
        control: &ConnectorControl,
    ) -> Result<Duration, ConnectorError> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.client.disconnect().await;
        let delay = self.backoff.next_delay();
        warn!(
            target: "edge.protocol",
            connector = %self.id,
            failures = self.consecutive_failures,
            retry_in_ms = delay.as_millis() as u64,
            error = %err,
            "subscription_failed"
        );
        if self.consecutive_failures >= self.settings.failure_threshold && !self.down {
            self.down = true;
            edge_telemetry::set_connector_up(&self.id, false);
            control.report(ConnectorHealthEvent::new(
                self.id.clone(),
                HealthKind::Down {
                    reason: err.to_string(),
                },
            ));
            for sample in self.bad_samples() {
                sink.send(sample).await.map_err(|_| ConnectorError::ChannelClosed)?;
            }
        }
        Ok(delay)
    }
}

#[async_trait]
impl<C: SubscriptionClient> Connector for SubscriptionConnector<C> {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(
        &mut self,
        sink: mpsc::Sender<TagSample>,
        mut control: ConnectorControl,
    ) -> Result<(), ConnectorError> {
        let mut writes_open = true;
        let mut rate_open = true;

        'session: loop {
            if !control.wait_enabled().await {
                break;
            }
            if let Err(err) = self.establish(&control).await {
                let delay = self.on_failure(&err, &sink, &control).await?;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = control.shutdown.changed() => {
                        if changed.is_err() {
                            break 'session;
                        }
                    }
                }
                continue;
            }
            self.consecutive_failures = 0;
            self.backoff.reset();
            self.down = false;
            edge_telemetry::set_connector_up(&self.id, true);
            control.report(ConnectorHealthEvent::new(self.id.clone(), HealthKind::Up));

            loop {
                tokio::select! {
                    change = self.client.next_change() => {
                        match change {
                            Ok(change) => {
                                let Some(machine_id) = self.machines.get(&change.address) else {
                                    continue;
                                };
                                let sample = TagSample::new(
                                    machine_id.clone(),
                                    change.address,
                                    change.value,
                                    change.quality,
                                    change.source_ts_ms,
                                );
                                sink.send(sample).await.map_err(|_| ConnectorError::ChannelClosed)?;
                                edge_telemetry::record_samples_acquired(1);
                            }
                            Err(err) => {
                                let delay = self.on_failure(&err, &sink, &control).await?;
                                tokio::select! {
                                    _ = tokio::time::sleep(delay) => {}
                                    changed = control.shutdown.changed() => {
                                        if changed.is_err() {
                                            break 'session;
                                        }
                                    }
                                }
                                continue 'session;
                            }
                        }
                    }
                    changed = control.rate.changed(), if rate_open => {
                        if changed.is_err() {
                            rate_open = false;
                        } else {
                            self.apply_rate(&control).await;
                        }
                    }
                    request = control.writes.recv(), if writes_open => {
                        let Some(request) = request else {
                            writes_open = false;
                            continue;
                        };
                        match self.client.write(&request.address, &request.value).await {
                            Ok(()) => edge_telemetry::record_write_success(1),
                            Err(err) => {
                                edge_telemetry::record_write_failure();
                                control.report(ConnectorHealthEvent::new(
                                    self.id.clone(),
                                    HealthKind::WriteFailed {
                                        address: request.address.clone(),
                                        error: err.to_string(),
                                    },
                                ));
                            }
                        }
                    }
                    changed = control.enabled.changed() => {
                        if changed.is_err() || !control.is_enabled() {
                            self.client.disconnect().await;
                            edge_telemetry::set_connector_up(&self.id, false);
                            control.report(ConnectorHealthEvent::new(
                                self.id.clone(),
                                HealthKind::Down { reason: "stopped".to_string() },
                            ));
                            continue 'session;
                        }
                    }
                    changed = control.shutdown.changed() => {
                        if changed.is_err() || control.is_shutdown() {
                            break 'session;
                        }
                    }
                }
            }
        }

        self.client.disconnect().await;
        info!(target: "edge.protocol", connector = %self.id, "subscription_connector_stopped");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SimulatedState {
    online: bool,
    next_id: SubscriptionId,
    subscriptions: HashMap<SubscriptionId, (u64, Deadband, Vec<String>)>,
    last_forwarded: HashMap<String, TagValue>,
    writes: Vec<(String, TagValue)>,
}

/// 内存模拟服务器，测试与演示用。
#[derive(Debug, Clone)]
pub struct SimulatedServer {
    state: Arc<Mutex<SimulatedState>>,
    changes: mpsc::UnboundedSender<Result<DataChange, ConnectorError>>,
}

/// 连接到 [`SimulatedServer`] 的订阅客户端
pub struct SimulatedSubscriptionClient {
    state: Arc<Mutex<SimulatedState>>,
    changes: mpsc::UnboundedReceiver<Result<DataChange, ConnectorError>>,
}

fn lock(state: &Arc<Mutex<SimulatedState>>) -> std::sync::MutexGuard<'_, SimulatedState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimulatedSubscriptionClient {
    pub fn new() -> (Self, SimulatedServer) {
        let state = Arc::new(Mutex::new(SimulatedState {
            online: true,
            next_id: 1,
            ..SimulatedState::default()
        }));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: state.clone(),
                changes: rx,
            },
            SimulatedServer { state, changes: tx },
        )
    }
}

impl SimulatedServer {
    /// 推送一次值变化（由客户端按订阅死区过滤）。
    pub fn push(&self, address: &str, value: TagValue, quality: Quality, source_ts_ms: i64) {
        let _ = self.changes.send(Ok(DataChange {
            address: address.to_string(),
            value,
            quality,
            source_ts_ms,
        }));
    }

    /// 模拟会话中断。
    pub fn drop_session(&self) {
        let _ = self
            .changes
            .send(Err(ConnectorError::Connection("session closed".to_string())));
    }

    pub fn set_online(&self, online: bool) {
        lock(&self.state).online = online;
    }

    /// 各订阅当前的采样间隔。
    pub fn sampling_intervals(&self) -> Vec<u64> {
        let state = lock(&self.state);
        let mut ids: Vec<_> = state.subscriptions.keys().copied().collect();
        ids.sort_unstable();
        ids.iter()
            .filter_map(|id| state.subscriptions.get(id).map(|(interval, _, _)| *interval))
            .collect()
    }

    pub fn writes(&self) -> Vec<(String, TagValue)> {
        lock(&self.state).writes.clone()
    }
}

#[async_trait]
impl SubscriptionClient for SimulatedSubscriptionClient {
    async fn connect(&mut self) -> Result<(), ConnectorError> {
        let mut state = lock(&self.state);
        if !state.online {
            return Err(ConnectorError::Connection("server unreachable".to_string()));
        }
        state.subscriptions.clear();
        state.last_forwarded.clear();
        Ok(())
    }

    async fn create_subscription(
        &mut self,
        sampling_interval_ms: u64,
        deadband: Deadband,
        addresses: &[String],
    ) -> Result<SubscriptionId, ConnectorError> {
        let mut state = lock(&self.state);
        let id = state.next_id;
        state.next_id += 1;
        state
            .subscriptions
            .insert(id, (sampling_interval_ms, deadband, addresses.to_vec()));
        Ok(id)
    }

    async fn set_sampling_interval(
        &mut self,
        subscription: SubscriptionId,
        sampling_interval_ms: u64,
    ) -> Result<(), ConnectorError> {
        let mut state = lock(&self.state);
        match state.subscriptions.get_mut(&subscription) {
            Some(entry) => {
                entry.0 = sampling_interval_ms;
                Ok(())
            }
            None => Err(ConnectorError::ConfigParse(format!(
                "unknown subscription {}",
                subscription
            ))),
        }
    }

    async fn next_change(&mut self) -> Result<DataChange, ConnectorError> {
        loop {
            let change = self
                .changes
                .recv()
                .await
                .ok_or_else(|| ConnectorError::Connection("server gone".to_string()))??;
            let mut state = lock(&self.state);
            let deadband = state
                .subscriptions
                .values()
                .find(|(_, _, addresses)| addresses.contains(&change.address))
                .map(|(_, deadband, _)| *deadband);
            let Some(deadband) = deadband else {
                continue;
            };
            let forward = match state.last_forwarded.get(&change.address) {
                Some(last) => deadband.exceeded(last, &change.value),
                None => true,
            };
            if forward {
                state
                    .last_forwarded
                    .insert(change.address.clone(), change.value.clone());
                return Ok(change);
            }
        }
    }

    async fn write(&mut self, address: &str, value: &TagValue) -> Result<(), ConnectorError> {
        let mut state = lock(&self.state);
        if !state.online {
            return Err(ConnectorError::Connection("server unreachable".to_string()));
        }
        state.writes.push((address.to_string(), value.clone()));
        Ok(())
    }

    async fn disconnect(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(address: &str, interval: u64, deadband: Deadband) -> MonitoredItem {
        MonitoredItem {
            machine_id: "oven-01".to_string(),
            address: address.to_string(),
            sampling_interval_ms: interval,
            deadband,
        }
    }

    #[test]
    fn test_items_grouped_by_interval_and_deadband() {
        let groups = group_items(&[
            item("ns=2;s=Temp", 500, Deadband::Absolute(0.5)),
            item("ns=2;s=Press", 500, Deadband::Absolute(0.5)),
            item("ns=2;s=State", 500, Deadband::None),
            item("ns=2;s=Count", 1000, Deadband::None),
        ]);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].addresses, vec!["ns=2;s=Temp", "ns=2;s=Press"]);
        assert_eq!(groups[2].sampling_interval_ms, 1000);
    }

    #[test]
    fn test_settings_from_value() {
        let value = serde_json::json!({
            "items": [{ "machine_id": "oven-01", "address": "ns=2;s=Temp",
                        "deadband": { "mode": "percent", "value": 2.0 } }]
        });
        let settings = SubscriptionSettings::from_value(&value).unwrap();
        assert_eq!(settings.items[0].sampling_interval_ms, 1000);
        assert_eq!(settings.items[0].deadband, Deadband::Percent(2.0));
        assert_eq!(settings.failure_threshold, 3);
    }
}
