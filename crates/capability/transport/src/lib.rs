//! # 传输能力模块
//!
//! 负责把边缘节点会话的消息可靠地送到 MQTT broker：
//! - **Transport**：连接（含遗嘱）、带确认的发布、订阅、入站事件
//! - **MqttTransport**：基于 rumqttc 的实现，PUBACK 与发布请求一一对应
//! - **MemoryBroker**：进程内 broker，供测试与离线演示使用
//! - **SessionRunner**：会话所有者，负责出生、断网暂存、重连回放、命令转发
//! - **BackpressureCoordinator**：按出站深度滞回切换连接器采样倍率
//!
//! ```text
//! connectors ──mpsc<TagSample>──▶ SessionRunner ──Transport──▶ broker
//!                                    │   ▲
//!                      StoreAndForwardQueue (断网/回放期间)
//!                                    │
//!                     NCMD ──mpsc<NodeCommand>──▶ 控制面
//! ```

mod backpressure;
mod memory;
mod mqtt;
mod runner;

pub use backpressure::{BackpressureCoordinator, BackpressureSettings, HysteresisController};
pub use memory::{MemoryBroker, MemoryTransport, topic_matches};
pub use mqtt::{MqttSettings, MqttTransport};
pub use runner::{RunnerRequest, RunnerSettings, SessionRunner};

use async_trait::async_trait;
use edge_buffer::BufferError;
use edge_sparkplug::{OutboundMessage, SessionError};
use tokio::sync::mpsc;

/// 传输错误。
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

impl TransportError {
    /// 本地存储故障不可恢复，需要上抛给进程。
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Buffer(BufferError::Storage(_)))
    }
}

/// 遗嘱消息（CONNECT 时登记）。
#[derive(Debug, Clone, PartialEq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

impl From<OutboundMessage> for WillMessage {
    fn from(message: OutboundMessage) -> Self {
        Self {
            topic: message.topic,
            payload: message.payload,
            qos: message.qos,
            retain: message.retain,
        }
    }
}

/// 入站消息。
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// 连接期间的入站事件。
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// 连接丢失；之后需重新 connect。
    Disconnected(String),
}

/// 发布/订阅传输抽象。
///
/// `connect` 返回本次连接的入站事件流；连接断开后该流产出
/// `Disconnected` 或直接关闭。
#[async_trait]
pub trait Transport: Send {
    async fn connect(
        &mut self,
        will: Option<WillMessage>,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    async fn subscribe(&mut self, filter: &str) -> Result<(), TransportError>;

    /// 发布并等待 broker 确认（QoS 1 为 PUBACK）。
    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// 正常断开，不触发遗嘱。
    async fn disconnect(&mut self);
}
