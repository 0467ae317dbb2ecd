//! 边缘节点会话状态机。
//!
//! 状态：`Disconnected → Connecting → Birthed → Active → (Dead | Disconnected)`。
//! seq 与别名表只由本结构持有；出生证明时 seq 归零并重建别名表。

use crate::alias::AliasTable;
use crate::command::{ACKNOWLEDGE_FAULT, CONNECTOR_START, CONNECTOR_STOP, REBIRTH};
use crate::payload::{DataType, Metric, Payload};
use crate::topic::{MessageType, Topic};
use crate::{BD_SEQ_METRIC, SessionError, qualified_name};
use domain::{Quality, TagSample, TagValue, now_epoch_ms};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Birthed,
    Active,
    Dead,
}

/// 待发布消息。
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub message_type: MessageType,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub seq: Option<u8>,
}

#[derive(Debug, Clone)]
struct MetricState {
    value: TagValue,
    quality: Quality,
    ts_ms: i64,
    datatype: DataType,
}

#[derive(Debug, Default)]
struct DeviceState {
    metrics: BTreeMap<String, MetricState>,
    birthed: bool,
}

/// 单个边缘节点的 Sparkplug 会话。
#[derive(Debug)]
pub struct EdgeNodeSession {
    group_id: String,
    node_id: String,
    state: SessionState,
    seq: u8,
    bd_seq: u8,
    next_bd_seq: u8,
    aliases: AliasTable,
    devices: BTreeMap<String, DeviceState>,
    last_birth_ms: Option<i64>,
    last_death_ms: Option<i64>,
}

impl EdgeNodeSession {
    pub fn new(group_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            node_id: node_id.into(),
            state: SessionState::Disconnected,
            seq: 0,
            bd_seq: 0,
            next_bd_seq: 0,
            aliases: AliasTable::new(),
            devices: BTreeMap::new(),
            last_birth_ms: None,
            last_death_ms: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// 下一条消息将使用的 seq。
    pub fn next_seq(&self) -> u8 {
        self.seq
    }

    pub fn bd_seq(&self) -> u8 {
        self.bd_seq
    }

    /// 当前代次的别名表（只读）。
    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    pub fn last_birth_ms(&self) -> Option<i64> {
        self.last_birth_ms
    }

    pub fn last_death_ms(&self) -> Option<i64> {
        self.last_death_ms
    }

    pub fn device_ids(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    /// 开始连接：分配新的 bdSeq 并返回需在 CONNECT 中登记的遗嘱 NDEATH。
    pub fn connect_will(&mut self) -> Result<OutboundMessage, SessionError> {
        self.expect(&[SessionState::Disconnected, SessionState::Dead], "connect")?;
        self.bd_seq = self.next_bd_seq;
        self.next_bd_seq = self.next_bd_seq.wrapping_add(1);
        self.state = SessionState::Connecting;
        Ok(self.death_message())
    }

    /// 出生证明：NBIRTH（seq=0）后接每台设备的 DBIRTH。
    ///
    /// 连接建立后首次调用，或在 Active 状态下响应重生请求。
    pub fn birth(&mut self) -> Result<Vec<OutboundMessage>, SessionError> {
        self.expect(
            &[
                SessionState::Connecting,
                SessionState::Birthed,
                SessionState::Active,
            ],
            "birth",
        )?;
        let now = now_epoch_ms();
        self.seq = 0;
        self.aliases.clear();

        let mut messages = Vec::with_capacity(self.devices.len() + 1);
        let node_birth = Payload {
            timestamp: Some(now as u64),
            metrics: node_birth_metrics(self.bd_seq, now),
            seq: Some(u64::from(self.next_seq_value())),
            ..Default::default()
        };
        messages.push(self.message(
            Topic::node(&self.group_id, MessageType::NBirth, &self.node_id),
            node_birth,
        ));

        let device_ids: Vec<String> = self.devices.keys().cloned().collect();
        for device_id in device_ids {
            if let Some(device) = self.devices.get_mut(&device_id) {
                device.birthed = false;
            }
            if self.devices.get(&device_id).is_some_and(|d| !d.metrics.is_empty()) {
                messages.push(self.build_device_birth(&device_id, now));
            }
        }

        self.state = SessionState::Birthed;
        self.last_birth_ms = Some(now);
        debug!(
            target: "edge.sparkplug",
            node = %self.node_id,
            bd_seq = self.bd_seq,
            messages = messages.len(),
            "session_birth"
        );
        Ok(messages)
    }

    /// 出生证明已被确认发布。
    pub fn confirm_birth(&mut self) -> Result<(), SessionError> {
        self.expect(&[SessionState::Birthed], "confirm_birth")?;
        self.state = SessionState::Active;
        Ok(())
    }

    /// 更新指标缓存；返回该设备是否需要（重新）发布 DBIRTH。
    pub fn record(&mut self, sample: &TagSample) -> bool {
        let name = metric_name(sample);
        let device = self.devices.entry(sample.machine_id.clone()).or_default();
        let datatype = device
            .metrics
            .get(&name)
            .map(|state| state.datatype)
            .or_else(|| DataType::for_value(&sample.value))
            .unwrap_or(DataType::Double);
        let is_new = !device.metrics.contains_key(&name);
        device.metrics.insert(
            name.clone(),
            MetricState {
                value: sample.value.clone(),
                quality: sample.quality,
                ts_ms: sample.ts_ms,
                datatype,
            },
        );
        let birthed = device.birthed;
        let has_alias = self
            .aliases
            .alias_of(&qualified_name(Some(&sample.machine_id), &name))
            .is_some();
        !birthed || is_new || !has_alias
    }

    /// 设备是否需要 DBIRTH 才能发布数据。
    pub fn needs_device_birth(&self, device_id: &str) -> bool {
        match self.devices.get(device_id) {
            Some(device) => {
                !device.birthed
                    || device.metrics.keys().any(|name| {
                        self.aliases
                            .alias_of(&qualified_name(Some(device_id), name))
                            .is_none()
                    })
            }
            None => true,
        }
    }

    /// 单设备 DBIRTH（新设备、新指标或 DDEATH 之后）。
    pub fn device_birth(&mut self, device_id: &str) -> Result<OutboundMessage, SessionError> {
        self.expect(&[SessionState::Birthed, SessionState::Active], "device_birth")?;
        if !self.devices.contains_key(device_id) {
            return Err(SessionError::UnknownMetric(device_id.to_string()));
        }
        Ok(self.build_device_birth(device_id, now_epoch_ms()))
    }

    /// 实时 DDATA（仅别名，不带名称）。
    pub fn device_data(
        &mut self,
        device_id: &str,
        samples: &[TagSample],
    ) -> Result<OutboundMessage, SessionError> {
        self.expect(&[SessionState::Active], "data")?;
        let mut metrics = Vec::with_capacity(samples.len());
        for sample in samples {
            let name = metric_name(sample);
            let alias = self
                .aliases
                .alias_of(&qualified_name(Some(device_id), &name))
                .ok_or_else(|| SessionError::UnknownMetric(name.clone()))?;
            let datatype = self.declared_type(device_id, &name, &sample.value);
            let mut metric = Metric::with_value(
                None,
                Some(alias),
                datatype,
                &sample.value,
                sample.quality,
                sample.ts_ms,
            );
            metric.datatype = None;
            metrics.push(metric);
        }
        let payload = Payload {
            timestamp: Some(now_epoch_ms() as u64),
            metrics,
            seq: Some(u64::from(self.next_seq_value())),
            ..Default::default()
        };
        Ok(self.message(
            Topic::device(&self.group_id, MessageType::DData, &self.node_id, device_id),
            payload,
        ))
    }

    /// 离线暂存用载荷：按名称编码，不带 seq 与别名，回放时再盖章。
    pub fn stored_payload(&self, device_id: &str, samples: &[TagSample]) -> (String, Vec<u8>) {
        let metrics = samples
            .iter()
            .map(|sample| {
                let name = metric_name(sample);
                let datatype = self.declared_type(device_id, &name, &sample.value);
                Metric::with_value(
                    Some(name),
                    None,
                    datatype,
                    &sample.value,
                    sample.quality,
                    sample.ts_ms,
                )
            })
            .collect();
        let payload = Payload {
            timestamp: Some(now_epoch_ms() as u64),
            metrics,
            ..Default::default()
        };
        let topic = Topic::device(&self.group_id, MessageType::DData, &self.node_id, device_id);
        (topic.to_string(), payload.encode_bytes())
    }

    /// 为暂存载荷盖上当前代次的 seq 与别名，并标记为历史数据。
    pub fn restamp(&mut self, topic: &str, stored: &[u8]) -> Result<OutboundMessage, SessionError> {
        self.expect(&[SessionState::Active], "replay")?;
        let parsed = Topic::parse(topic)?;
        let device_id = parsed.device_id().map(str::to_string);
        let mut payload = Payload::decode_bytes(stored)?;
        for metric in &mut payload.metrics {
            let Some(name) = metric.name.take() else {
                return Err(SessionError::UnknownMetric("<unnamed>".to_string()));
            };
            let alias = self
                .aliases
                .alias_of(&qualified_name(device_id.as_deref(), &name))
                .ok_or_else(|| SessionError::UnknownMetric(name.clone()))?;
            metric.alias = Some(alias);
            metric.datatype = None;
            metric.is_historical = Some(true);
        }
        payload.seq = Some(u64::from(self.next_seq_value()));
        Ok(self.message(parsed, payload))
    }

    /// 接纳暂存载荷中尚未跟踪的指标（进程重启后回放旧队列时使用）。
    ///
    /// 已跟踪的指标保持当前值不变；返回载荷所属设备。
    pub fn adopt_stored(
        &mut self,
        topic: &str,
        stored: &[u8],
    ) -> Result<Option<String>, SessionError> {
        let parsed = Topic::parse(topic)?;
        let Some(device_id) = parsed.device_id() else {
            return Ok(None);
        };
        let payload = Payload::decode_bytes(stored)?;
        let device = self.devices.entry(device_id.to_string()).or_default();
        for metric in &payload.metrics {
            let Some(name) = metric.name.as_ref() else {
                continue;
            };
            if device.metrics.contains_key(name) {
                continue;
            }
            let declared = metric.datatype.map(DataType::from_code).transpose()?;
            let value = metric.tag_value(declared)?;
            let datatype = declared
                .or_else(|| DataType::for_value(&value))
                .unwrap_or(DataType::Double);
            device.metrics.insert(
                name.clone(),
                MetricState {
                    value,
                    quality: metric.quality(),
                    ts_ms: metric.timestamp.unwrap_or_default() as i64,
                    datatype,
                },
            );
        }
        Ok(Some(device_id.to_string()))
    }

    /// 设备离线（如连接器 Down）：DDEATH，之后数据需重新 DBIRTH。
    pub fn device_death(&mut self, device_id: &str) -> Result<OutboundMessage, SessionError> {
        self.expect(&[SessionState::Active], "device_death")?;
        if let Some(device) = self.devices.get_mut(device_id) {
            device.birthed = false;
        }
        let payload = Payload {
            timestamp: Some(now_epoch_ms() as u64),
            seq: Some(u64::from(self.next_seq_value())),
            ..Default::default()
        };
        Ok(self.message(
            Topic::device(&self.group_id, MessageType::DDeath, &self.node_id, device_id),
            payload,
        ))
    }

    /// 正常停机：NDEATH（与遗嘱相同的 bdSeq）。
    pub fn death(&mut self) -> Result<OutboundMessage, SessionError> {
        self.expect(&[SessionState::Birthed, SessionState::Active], "death")?;
        self.state = SessionState::Dead;
        self.last_death_ms = Some(now_epoch_ms());
        Ok(self.death_message())
    }

    /// 连接断开（任意状态）。
    pub fn disconnected(&mut self) {
        if self.state != SessionState::Disconnected {
            debug!(
                target: "edge.sparkplug",
                node = %self.node_id,
                from = ?self.state,
                "session_disconnected"
            );
        }
        if matches!(self.state, SessionState::Birthed | SessionState::Active) {
            self.last_death_ms = Some(now_epoch_ms());
        }
        self.state = SessionState::Disconnected;
        for device in self.devices.values_mut() {
            device.birthed = false;
        }
    }

    fn build_device_birth(&mut self, device_id: &str, now: i64) -> OutboundMessage {
        let mut metrics = Vec::new();
        if let Some(device) = self.devices.get(device_id) {
            for (name, state) in &device.metrics {
                let alias = self.aliases.assign(&qualified_name(Some(device_id), name));
                metrics.push(Metric::with_value(
                    Some(name.clone()),
                    Some(alias),
                    state.datatype,
                    &state.value,
                    state.quality,
                    state.ts_ms,
                ));
            }
        }
        if let Some(device) = self.devices.get_mut(device_id) {
            device.birthed = true;
        }
        let payload = Payload {
            timestamp: Some(now as u64),
            metrics,
            seq: Some(u64::from(self.next_seq_value())),
            ..Default::default()
        };
        self.message(
            Topic::device(&self.group_id, MessageType::DBirth, &self.node_id, device_id),
            payload,
        )
    }

    fn death_message(&self) -> OutboundMessage {
        let payload = Payload {
            timestamp: Some(now_epoch_ms() as u64),
            metrics: vec![bd_seq_metric(self.bd_seq, now_epoch_ms())],
            ..Default::default()
        };
        self.message(
            Topic::node(&self.group_id, MessageType::NDeath, &self.node_id),
            payload,
        )
    }

    fn declared_type(&self, device_id: &str, name: &str, value: &TagValue) -> DataType {
        self.devices
            .get(device_id)
            .and_then(|device| device.metrics.get(name))
            .map(|state| state.datatype)
            .or_else(|| DataType::for_value(value))
            .unwrap_or(DataType::Double)
    }

    fn next_seq_value(&mut self) -> u8 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    fn message(&self, topic: Topic, payload: Payload) -> OutboundMessage {
        let message_type = topic.message_type();
        OutboundMessage {
            topic: topic.to_string(),
            message_type,
            seq: payload.seq.map(|seq| seq as u8),
            payload: payload.encode_bytes(),
            qos: 1,
            retain: message_type.is_lifecycle(),
        }
    }

    fn expect(&self, allowed: &[SessionState], action: &'static str) -> Result<(), SessionError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                from: self.state,
                action,
            })
        }
    }
}

/// 指标名：优先使用规范信号名，否则使用源地址。
pub fn metric_name(sample: &TagSample) -> String {
    sample
        .signal
        .as_ref()
        .map(|signal| signal.to_string())
        .unwrap_or_else(|| sample.address.clone())
}

fn bd_seq_metric(bd_seq: u8, now: i64) -> Metric {
    let mut metric = Metric::with_value(
        Some(BD_SEQ_METRIC.to_string()),
        None,
        DataType::Int64,
        &TagValue::Int(i64::from(bd_seq)),
        Quality::Good,
        now,
    );
    metric.properties = None;
    metric
}

fn node_birth_metrics(bd_seq: u8, now: i64) -> Vec<Metric> {
    let mut metrics = vec![bd_seq_metric(bd_seq, now)];
    let controls = [
        (REBIRTH, DataType::Boolean, TagValue::Bool(false)),
        (CONNECTOR_START, DataType::String, TagValue::Text(String::new())),
        (CONNECTOR_STOP, DataType::String, TagValue::Text(String::new())),
        (ACKNOWLEDGE_FAULT, DataType::String, TagValue::Text(String::new())),
    ];
    for (name, datatype, value) in controls {
        let mut metric =
            Metric::with_value(Some(name.to_string()), None, datatype, &value, Quality::Good, now);
        metric.properties = None;
        metrics.push(metric);
    }
    metrics
}
