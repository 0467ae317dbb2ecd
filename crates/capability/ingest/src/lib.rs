//! 主机侧 Sparkplug 采集源。
//!
//! 订阅组内全部节点消息，经会话跟踪器解析别名、校验 seq 后交给处理器；
//! 断档或出生前收到数据时向对应节点发送 `Node Control/Rebirth`。

use async_trait::async_trait;
use domain::now_epoch_ms;
use edge_protocol::Backoff;
use edge_sparkplug::{
    CodecError, DecodedMessage, HostSessionTracker, MessageType, NodeCommand, Observation,
    StatePayload, Topic,
};
use edge_transport::{InboundMessage, Transport, TransportEvent, WillMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// 采集错误。
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("handler error: {0}")]
    Handler(String),
    #[error("source error: {0}")]
    Source(String),
}

/// 解码后消息的处理器。
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: DecodedMessage) -> Result<(), IngestError>;
}

/// 采集源抽象。
#[async_trait]
pub trait Source: Send {
    async fn run(
        &mut self,
        handler: Arc<dyn MessageHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), IngestError>;
}

/// 转发到有界通道（流水线解码阶段的输入）。
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    sender: mpsc::Sender<DecodedMessage>,
}

impl ChannelHandler {
    pub fn new(sender: mpsc::Sender<DecodedMessage>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl MessageHandler for ChannelHandler {
    async fn handle(&self, message: DecodedMessage) -> Result<(), IngestError> {
        self.sender
            .send(message)
            .await
            .map_err(|err| IngestError::Handler(err.to_string()))
    }
}

/// 采集源配置。
#[derive(Debug, Clone)]
pub struct SparkplugSourceConfig {
    pub group_id: String,
    /// 配置后以主机应用身份发布 STATE（遗嘱为 offline）。
    pub host_id: Option<String>,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl SparkplugSourceConfig {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            host_id: None,
            reconnect_min: Duration::from_secs(2),
            reconnect_max: Duration::from_secs(60),
        }
    }
}

/// Sparkplug 采集源。
pub struct SparkplugSource<T: Transport> {
    transport: T,
    config: SparkplugSourceConfig,
    tracker: HostSessionTracker,
}

impl<T: Transport> SparkplugSource<T> {
    pub fn new(transport: T, config: SparkplugSourceConfig) -> Self {
        Self {
            transport,
            config,
            tracker: HostSessionTracker::new(),
        }
    }

    pub fn config(&self) -> &SparkplugSourceConfig {
        &self.config
    }

    async fn open(&mut self) -> Result<mpsc::Receiver<TransportEvent>, IngestError> {
        let will = self.config.host_id.as_deref().map(|host_id| WillMessage {
            topic: Topic::state(host_id).to_string(),
            payload: state_payload(false),
            qos: 1,
            retain: true,
        });
        let link = self.transport.connect(will).await.map_err(source_error)?;
        let filter = Topic::group_filter(&self.config.group_id);
        self.transport
            .subscribe(&filter)
            .await
            .map_err(source_error)?;
        if let Some(host_id) = self.config.host_id.as_deref() {
            self.transport
                .publish(&Topic::state(host_id).to_string(), &state_payload(true), 1, true)
                .await
                .map_err(source_error)?;
        }
        info!(target: "edge.ingest", filter = %filter, "ingest_connected");
        Ok(link)
    }

    async fn close(&mut self) {
        if let Some(host_id) = self.config.host_id.as_deref() {
            let topic = Topic::state(host_id).to_string();
            if let Err(err) = self
                .transport
                .publish(&topic, &state_payload(false), 1, true)
                .await
            {
                warn!(target: "edge.ingest", error = %err, "host_state_publish_failed");
            }
        }
        self.transport.disconnect().await;
    }

    async fn on_message(&mut self, message: InboundMessage, handler: &dyn MessageHandler) {
        let topic = match Topic::parse(&message.topic) {
            Ok(topic) => topic,
            Err(err) => {
                edge_telemetry::record_decode_error();
                warn!(target: "edge.ingest", topic = %message.topic, error = %err, "sparkplug_topic_invalid");
                return;
            }
        };
        match self.tracker.observe(&topic, &message.payload) {
            Ok(Observation::Accepted(decoded)) => {
                debug!(
                    target: "edge.ingest",
                    node = %decoded.edge_node_id,
                    device = ?decoded.device_id,
                    kind = decoded.message_type.as_str(),
                    metrics = decoded.metrics.len(),
                    "sparkplug_message_received"
                );
                if let Err(err) = handler.handle(decoded).await {
                    warn!(target: "edge.ingest", error = %err, "message_handler_failed");
                }
            }
            Ok(Observation::RebirthRequired {
                group_id,
                edge_node_id,
                reason,
            }) => {
                self.request_rebirth(&group_id, &edge_node_id, &format!("{:?}", reason))
                    .await;
            }
            Ok(Observation::NodeOffline {
                group_id,
                edge_node_id,
            }) => {
                info!(target: "edge.ingest", group = %group_id, node = %edge_node_id, "edge_node_offline");
            }
            Ok(Observation::HostState { .. } | Observation::Ignored) => {}
            Err(err) => {
                edge_telemetry::record_decode_error();
                warn!(
                    target: "edge.ingest",
                    topic = %message.topic,
                    error = %err,
                    "sparkplug_message_dropped"
                );
                if let CodecError::UnknownAlias(_) = err
                    && let (Some(group_id), Some(edge_node_id)) =
                        (topic.group_id(), topic.edge_node_id())
                {
                    let (group_id, edge_node_id) = (group_id.to_string(), edge_node_id.to_string());
                    self.request_rebirth(&group_id, &edge_node_id, "unknown alias")
                        .await;
                }
            }
        }
    }

    async fn request_rebirth(&mut self, group_id: &str, edge_node_id: &str, reason: &str) {
        edge_telemetry::record_rebirth_request();
        warn!(
            target: "edge.ingest",
            group = group_id,
            node = edge_node_id,
            reason,
            "rebirth_requested"
        );
        let topic = Topic::node(group_id, MessageType::NCmd, edge_node_id).to_string();
        let payload = NodeCommand::encode(&[NodeCommand::Rebirth]);
        if let Err(err) = self.transport.publish(&topic, &payload, 1, false).await {
            warn!(target: "edge.ingest", error = %err, "rebirth_publish_failed");
        }
    }
}

#[async_trait]
impl<T: Transport> Source for SparkplugSource<T> {
    async fn run(
        &mut self,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), IngestError> {
        let mut backoff = Backoff::new(self.config.reconnect_min, self.config.reconnect_max);
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let mut link = match self.open().await {
                Ok(link) => {
                    backoff.reset();
                    link
                }
                Err(err) => {
                    let delay = self.config.reconnect_min.max(backoff.next_delay());
                    warn!(
                        target: "edge.ingest",
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "ingest_connect_failed"
                    );
                    if !pause(delay, &mut shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    event = link.recv() => match event {
                        Some(TransportEvent::Message(message)) => {
                            self.on_message(message, handler.as_ref()).await;
                        }
                        Some(TransportEvent::Disconnected(reason)) => {
                            warn!(target: "edge.ingest", reason = %reason, "ingest_link_lost");
                            break;
                        }
                        None => {
                            warn!(target: "edge.ingest", "ingest_link_closed");
                            break;
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            self.close().await;
                            return Ok(());
                        }
                    }
                }
            }

            let delay = self.config.reconnect_min.max(backoff.next_delay());
            if !pause(delay, &mut shutdown).await {
                return Ok(());
            }
        }
    }
}

fn source_error(err: impl std::fmt::Display) -> IngestError {
    IngestError::Source(err.to_string())
}

fn state_payload(online: bool) -> Vec<u8> {
    StatePayload {
        online,
        timestamp: now_epoch_ms().max(0) as u64,
    }
    .to_bytes()
}

/// 等待 `delay`；期间收到停机信号返回 false。
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return true,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return false;
                }
            }
        }
    }
}
