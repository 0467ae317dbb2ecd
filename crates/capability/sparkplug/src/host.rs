//! 主机侧会话跟踪：按节点维护出生证明中的别名表与 seq 连续性。
//!
//! seq 断档或出生前收到数据时要求节点重生，而不是静默继续。

use crate::alias::AliasTable;
use crate::payload::{DataType, Metric, Payload};
use crate::topic::{MessageType, Topic};
use crate::{BD_SEQ_METRIC, CodecError, StatePayload, qualified_name};
use domain::{Quality, TagValue, now_epoch_ms};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// 解码后的指标。
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMetric {
    pub name: String,
    pub value: TagValue,
    pub quality: Quality,
    pub ts_ms: i64,
    pub historical: bool,
}

/// 解码后的 Sparkplug 消息。
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub group_id: String,
    pub edge_node_id: String,
    pub device_id: Option<String>,
    pub message_type: MessageType,
    pub seq: Option<u8>,
    pub ts_ms: i64,
    pub metrics: Vec<DecodedMetric>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebirthReason {
    NoBirth,
    SeqGap { expected: u8, received: Option<u8> },
    UnknownAlias(u64),
}

/// 单条入站消息的处理结论。
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Accepted(DecodedMessage),
    RebirthRequired {
        group_id: String,
        edge_node_id: String,
        reason: RebirthReason,
    },
    NodeOffline {
        group_id: String,
        edge_node_id: String,
    },
    HostState {
        host_id: String,
        online: bool,
    },
    /// 已请求重生、旧代次遗嘱或命令消息，忽略。
    Ignored,
}

#[derive(Debug, Default)]
struct NodeTrack {
    online: bool,
    rebirth_pending: bool,
    bd_seq: Option<i64>,
    last_seq: Option<u8>,
    aliases: AliasTable,
    datatypes: HashMap<String, DataType>,
    devices: HashSet<String>,
}

/// 主机侧会话跟踪器。
#[derive(Debug, Default)]
pub struct HostSessionTracker {
    nodes: HashMap<(String, String), NodeTrack>,
}

impl HostSessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_online(&self, group_id: &str, edge_node_id: &str) -> bool {
        self.nodes
            .get(&(group_id.to_string(), edge_node_id.to_string()))
            .is_some_and(|track| track.online)
    }

    /// 按别名解析指标名（只读访问器）。
    pub fn resolve_alias(
        &self,
        group_id: &str,
        edge_node_id: &str,
        alias: u64,
    ) -> Option<&str> {
        self.nodes
            .get(&(group_id.to_string(), edge_node_id.to_string()))
            .and_then(|track| track.aliases.name_of(alias))
    }

    /// 处理一条入站消息。解码失败返回错误，整条消息丢弃。
    pub fn observe(&mut self, topic: &Topic, bytes: &[u8]) -> Result<Observation, CodecError> {
        let (group_id, edge_node_id) = match topic {
            Topic::State { host_id } => {
                let state = StatePayload::from_bytes(bytes)?;
                return Ok(Observation::HostState {
                    host_id: host_id.clone(),
                    online: state.online,
                });
            }
            Topic::Node {
                group_id,
                edge_node_id,
                ..
            }
            | Topic::Device {
                group_id,
                edge_node_id,
                ..
            } => (group_id.clone(), edge_node_id.clone()),
        };
        let message_type = topic.message_type();
        if matches!(message_type, MessageType::NCmd | MessageType::DCmd) {
            return Ok(Observation::Ignored);
        }

        let payload = Payload::decode_bytes(bytes)?;
        let key = (group_id.clone(), edge_node_id.clone());
        let track = self.nodes.entry(key).or_default();
        let received_seq = payload.seq.map(|seq| seq as u8);

        match message_type {
            MessageType::NBirth => {
                let mut aliases = AliasTable::new();
                let mut datatypes = HashMap::new();
                let mut bd_seq = None;
                let mut metrics = Vec::with_capacity(payload.metrics.len());
                for metric in &payload.metrics {
                    let name = metric.name.clone().ok_or(CodecError::MissingName)?;
                    let declared = declared_type(metric)?;
                    let value = metric.tag_value(declared)?;
                    if name == BD_SEQ_METRIC {
                        bd_seq = value.as_i64();
                        continue;
                    }
                    if let Some(alias) = metric.alias {
                        aliases.insert(name.clone(), alias);
                    }
                    if let Some(datatype) = declared {
                        datatypes.insert(name.clone(), datatype);
                    }
                    if !name.starts_with("Node Control/") {
                        metrics.push(decoded(metric, name, value, &payload));
                    }
                }
                track.online = true;
                track.rebirth_pending = false;
                track.bd_seq = bd_seq;
                track.last_seq = received_seq;
                track.aliases = aliases;
                track.datatypes = datatypes;
                track.devices.clear();
                info!(
                    target: "edge.sparkplug",
                    group = %group_id,
                    node = %edge_node_id,
                    bd_seq = ?bd_seq,
                    "host_node_birth"
                );
                Ok(Observation::Accepted(DecodedMessage {
                    group_id,
                    edge_node_id,
                    device_id: None,
                    message_type,
                    seq: received_seq,
                    ts_ms: payload_ts(&payload),
                    metrics,
                }))
            }
            MessageType::NDeath => {
                let death_bd_seq = payload
                    .metrics
                    .iter()
                    .find(|metric| metric.name.as_deref() == Some(BD_SEQ_METRIC))
                    .and_then(|metric| metric.tag_value(Some(DataType::Int64)).ok())
                    .and_then(|value| value.as_i64());
                if death_bd_seq.is_some() && track.bd_seq.is_some() && death_bd_seq != track.bd_seq
                {
                    debug!(
                        target: "edge.sparkplug",
                        node = %edge_node_id,
                        "host_stale_death_ignored"
                    );
                    return Ok(Observation::Ignored);
                }
                track.online = false;
                track.last_seq = None;
                track.aliases.clear();
                track.datatypes.clear();
                track.devices.clear();
                Ok(Observation::NodeOffline {
                    group_id,
                    edge_node_id,
                })
            }
            MessageType::DBirth | MessageType::DDeath | MessageType::DData | MessageType::NData => {
                if !track.online {
                    if track.rebirth_pending {
                        return Ok(Observation::Ignored);
                    }
                    track.rebirth_pending = true;
                    return Ok(Observation::RebirthRequired {
                        group_id,
                        edge_node_id,
                        reason: RebirthReason::NoBirth,
                    });
                }
                let expected = track.last_seq.map(|seq| seq.wrapping_add(1)).unwrap_or(0);
                if received_seq != Some(expected) {
                    track.online = false;
                    track.rebirth_pending = true;
                    return Ok(Observation::RebirthRequired {
                        group_id,
                        edge_node_id,
                        reason: RebirthReason::SeqGap {
                            expected,
                            received: received_seq,
                        },
                    });
                }
                track.last_seq = received_seq;

                let device_id = topic.device_id().map(str::to_string);
                let metrics = match message_type {
                    MessageType::DBirth => {
                        let device = device_id.as_deref().unwrap_or_default();
                        let mut metrics = Vec::with_capacity(payload.metrics.len());
                        let mut registered = Vec::new();
                        for metric in &payload.metrics {
                            let name = metric.name.clone().ok_or(CodecError::MissingName)?;
                            let declared = declared_type(metric)?;
                            let value = metric.tag_value(declared)?;
                            registered.push((name.clone(), metric.alias, declared));
                            metrics.push(decoded(metric, name, value, &payload));
                        }
                        for (name, alias, declared) in registered {
                            let qualified = qualified_name(Some(device), &name);
                            if let Some(alias) = alias {
                                track.aliases.insert(qualified.clone(), alias);
                            }
                            if let Some(datatype) = declared {
                                track.datatypes.insert(qualified, datatype);
                            }
                        }
                        track.devices.insert(device.to_string());
                        metrics
                    }
                    MessageType::DDeath => {
                        if let Some(device) = device_id.as_deref() {
                            track.devices.remove(device);
                        }
                        Vec::new()
                    }
                    _ => {
                        let mut metrics = Vec::with_capacity(payload.metrics.len());
                        for metric in &payload.metrics {
                            let qualified = match (&metric.name, metric.alias) {
                                (Some(name), _) => qualified_name(device_id.as_deref(), name),
                                (None, Some(alias)) => match track.aliases.name_of(alias) {
                                    Some(name) => name.to_string(),
                                    None => {
                                        track.online = false;
                                        track.rebirth_pending = true;
                                        return Err(CodecError::UnknownAlias(alias));
                                    }
                                },
                                (None, None) => return Err(CodecError::MissingName),
                            };
                            let declared = track.datatypes.get(&qualified).copied();
                            let value = metric.tag_value(declared)?;
                            let name = strip_device(device_id.as_deref(), &qualified);
                            metrics.push(decoded(metric, name, value, &payload));
                        }
                        metrics
                    }
                };
                Ok(Observation::Accepted(DecodedMessage {
                    group_id,
                    edge_node_id,
                    device_id,
                    message_type,
                    seq: received_seq,
                    ts_ms: payload_ts(&payload),
                    metrics,
                }))
            }
            MessageType::NCmd | MessageType::DCmd | MessageType::State => Ok(Observation::Ignored),
        }
    }
}

fn declared_type(metric: &Metric) -> Result<Option<DataType>, CodecError> {
    metric.datatype.map(DataType::from_code).transpose()
}

fn payload_ts(payload: &Payload) -> i64 {
    payload
        .timestamp
        .map(|ts| ts as i64)
        .unwrap_or_else(now_epoch_ms)
}

fn decoded(metric: &Metric, name: String, value: TagValue, payload: &Payload) -> DecodedMetric {
    DecodedMetric {
        name,
        value,
        quality: metric.quality(),
        ts_ms: metric
            .timestamp
            .map(|ts| ts as i64)
            .unwrap_or_else(|| payload_ts(payload)),
        historical: metric.is_historical.unwrap_or(false),
    }
}

fn strip_device(device_id: Option<&str>, qualified: &str) -> String {
    match device_id {
        Some(device) => qualified
            .strip_prefix(device)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(qualified)
            .to_string(),
        None => qualified.to_string(),
    }
}
