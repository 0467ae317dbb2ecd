//! # Sparkplug B 能力模块
//!
//! - **payload**：protobuf 载荷定义（prost derive）与值/质量编解码
//! - **topic**：`spBv1.0/{group}/{type}/{node}[/{device}]` 与 STATE topic
//! - **session**：边缘节点会话状态机（出生/死亡、seq、bdSeq、别名）
//! - **host**：主机侧会话跟踪（别名解析、seq 断档检测）
//! - **command**：节点控制命令（NCMD）

mod alias;
mod command;
mod host;
mod payload;
mod session;
mod topic;

pub use alias::AliasTable;
pub use command::{ACKNOWLEDGE_FAULT, CONNECTOR_START, CONNECTOR_STOP, NodeCommand, REBIRTH};
pub use host::{
    DecodedMessage, DecodedMetric, HostSessionTracker, Observation, RebirthReason,
};
pub use payload::{
    DataType, Metric, Payload, PropertySet, PropertyValue, QUALITY_PROPERTY, metric,
    property_value,
};
pub use session::{EdgeNodeSession, OutboundMessage, SessionState, metric_name};
pub use topic::{MessageType, NAMESPACE, Topic};

use serde::{Deserialize, Serialize};

/// 出生/死亡配对序号的指标名。
pub const BD_SEQ_METRIC: &str = "bdSeq";

/// 编解码错误。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("invalid topic: {0}")]
    InvalidTopic(String),
    #[error("unsupported datatype: {0}")]
    UnsupportedDatatype(u32),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("unknown alias: {0}")]
    UnknownAlias(u64),
    #[error("metric without name or alias")]
    MissingName,
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

/// 会话错误。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("invalid transition: {action} in {from:?}")]
    InvalidTransition {
        from: SessionState,
        action: &'static str,
    },
    #[error("metric not born in current generation: {0}")]
    UnknownMetric(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// 主机应用 STATE 消息体（JSON）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePayload {
    pub online: bool,
    pub timestamp: u64,
}

impl StatePayload {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(|err| CodecError::Malformed(err.to_string()))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// 别名表键：设备指标以设备 ID 限定，节点指标直接用名称。
pub(crate) fn qualified_name(device_id: Option<&str>, name: &str) -> String {
    match device_id {
        Some(device) => format!("{}/{}", device, name),
        None => name.to_string(),
    }
}
