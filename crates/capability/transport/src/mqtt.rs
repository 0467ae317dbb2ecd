//! 基于 rumqttc 的 MQTT 传输。
//!
//! 每次 `connect` 新建一个事件循环任务（遗嘱随 CONNECT 登记，重连时 bdSeq 已变化，
//! 不能复用 rumqttc 的自动重连）。发布确认按出站顺序把请求与 pkid 关联，
//! 收到 PUBACK 后唤醒等待方。入站消息以非阻塞方式转交，消费方积压时丢弃并计数，
//! 事件循环不因此延误确认处理。

use crate::{InboundMessage, Transport, TransportError, TransportEvent, WillMessage};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

/// MQTT 连接参数。
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
}

impl MqttSettings {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(5),
        }
    }

    /// 客户端 ID 附加随机后缀，避免多实例互相接管会话。
    pub fn with_unique_suffix(mut self) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        self.client_id = format!("{}-{}", self.client_id, &suffix[..8]);
        self
    }
}

#[derive(Default)]
struct AckState {
    /// 已交给客户端、尚未分配 pkid 的发布。
    waiting: VecDeque<oneshot::Sender<()>>,
    inflight: HashMap<u16, oneshot::Sender<()>>,
}

/// MQTT 传输。
pub struct MqttTransport {
    settings: MqttSettings,
    client: Option<AsyncClient>,
    acks: Arc<Mutex<AckState>>,
    event_loop: Option<JoinHandle<()>>,
}

impl MqttTransport {
    pub fn new(settings: MqttSettings) -> Self {
        Self {
            settings,
            client: None,
            acks: Arc::new(Mutex::new(AckState::default())),
            event_loop: None,
        }
    }

    pub fn settings(&self) -> &MqttSettings {
        &self.settings
    }

    fn options(&self, will: Option<WillMessage>) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.settings.client_id.clone(),
            self.settings.host.clone(),
            self.settings.port,
        );
        options.set_keep_alive(self.settings.keep_alive);
        options.set_clean_session(true);
        if let (Some(username), Some(password)) =
            (self.settings.username.as_ref(), self.settings.password.as_ref())
        {
            options.set_credentials(username, password);
        }
        if let Some(will) = will {
            options.set_last_will(LastWill::new(
                will.topic,
                will.payload,
                to_qos(will.qos),
                will.retain,
            ));
        }
        options
    }

    fn abort_link(&mut self) {
        self.client = None;
        if let Some(task) = self.event_loop.take() {
            task.abort();
        }
        clear_acks(&self.acks);
    }
}

fn to_qos(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn lock_acks(acks: &Arc<Mutex<AckState>>) -> MutexGuard<'_, AckState> {
    acks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn clear_acks(acks: &Arc<Mutex<AckState>>) {
    let mut state = lock_acks(acks);
    state.waiting.clear();
    state.inflight.clear();
}

/// 转交一条入站消息；接收端已关闭时返回 false。
fn forward_inbound(events: &mpsc::Sender<TransportEvent>, message: InboundMessage) -> bool {
    match events.try_send(TransportEvent::Message(message)) {
        Ok(()) => true,
        Err(TrySendError::Full(TransportEvent::Message(message))) => {
            let dropped = edge_telemetry::record_inbound_dropped();
            warn!(
                target: "edge.transport",
                topic = %message.topic,
                dropped,
                "inbound_message_dropped"
            );
            true
        }
        Err(TrySendError::Full(_)) => true,
        Err(TrySendError::Closed(_)) => false,
    }
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
    acks: Arc<Mutex<AckState>>,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let mut ready = Some(ready);
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if !forward_inbound(&events, message) {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                if let Some(waiter) = lock_acks(&acks).inflight.remove(&ack.pkid) {
                    let _ = waiter.send(());
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let mut state = lock_acks(&acks);
                if let Some(waiter) = state.waiting.pop_front() {
                    if pkid == 0 {
                        // QoS 0 没有确认，写出即完成
                        let _ = waiter.send(());
                    } else {
                        state.inflight.insert(pkid, waiter);
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(err) => {
                let reason = err.to_string();
                match ready.take() {
                    Some(ready) => {
                        let _ = ready.send(Err(reason));
                    }
                    None => {
                        warn!(target: "edge.transport", error = %reason, "mqtt_connection_lost");
                        let _ = events.send(TransportEvent::Disconnected(reason)).await;
                    }
                }
                break;
            }
        }
    }
    clear_acks(&acks);
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(
        &mut self,
        will: Option<WillMessage>,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        self.abort_link();
        let options = self.options(will);
        let (client, event_loop) = AsyncClient::new(options, 64);
        let (events_tx, events_rx) = mpsc::channel(1024);
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(drive_event_loop(
            event_loop,
            events_tx,
            Arc::clone(&self.acks),
            ready_tx,
        ));

        match timeout(self.settings.connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                info!(
                    target: "edge.transport",
                    host = %self.settings.host,
                    port = self.settings.port,
                    client_id = %self.settings.client_id,
                    "mqtt_connected"
                );
                self.client = Some(client);
                self.event_loop = Some(task);
                Ok(events_rx)
            }
            Ok(Ok(Err(reason))) => {
                task.abort();
                Err(TransportError::Connect(reason))
            }
            Ok(Err(_)) => {
                task.abort();
                Err(TransportError::Connect("event loop ended".to_string()))
            }
            Err(_) => {
                task.abort();
                Err(TransportError::Timeout("connack".to_string()))
            }
        }
    }

    async fn subscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::NotConnected)?;
        client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|err| TransportError::Subscribe(err.to_string()))
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> Result<(), TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::NotConnected)?;
        let (waiter, acked) = oneshot::channel();
        lock_acks(&self.acks).waiting.push_back(waiter);
        if let Err(err) = client
            .publish(topic, to_qos(qos), retain, payload.to_vec())
            .await
        {
            lock_acks(&self.acks).waiting.pop_back();
            return Err(TransportError::Publish(err.to_string()));
        }
        match timeout(self.settings.publish_timeout, acked).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Publish(
                "connection lost before ack".to_string(),
            )),
            Err(_) => Err(TransportError::Timeout(format!("puback for {}", topic))),
        }
    }

    async fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = timeout(Duration::from_secs(1), client.disconnect()).await;
        }
        if let Some(task) = self.event_loop.take()
            && timeout(Duration::from_secs(2), task).await.is_err()
        {
            warn!(target: "edge.transport", "mqtt_disconnect_timeout");
        }
        clear_acks(&self.acks);
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_suffix_keeps_prefix() {
        let settings = MqttSettings::new("localhost", 1883, "edge-node-1").with_unique_suffix();
        assert!(settings.client_id.starts_with("edge-node-1-"));
        assert_eq!(settings.client_id.len(), "edge-node-1-".len() + 8);
    }

    #[test]
    fn qos_mapping() {
        assert_eq!(to_qos(0), QoS::AtMostOnce);
        assert_eq!(to_qos(1), QoS::AtLeastOnce);
        assert_eq!(to_qos(9), QoS::AtLeastOnce);
    }

    fn inbound(topic: &str) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: vec![1],
        }
    }

    #[tokio::test]
    async fn inbound_overflow_is_dropped_without_blocking() {
        let (events, mut received) = mpsc::channel(1);
        assert!(forward_inbound(&events, inbound("spBv1.0/line-1/NCMD/edge-1")));
        let before = edge_telemetry::metrics().snapshot().inbound_dropped;
        assert!(forward_inbound(&events, inbound("spBv1.0/line-1/NDATA/edge-2")));
        assert!(edge_telemetry::metrics().snapshot().inbound_dropped > before);

        let Some(TransportEvent::Message(first)) = received.recv().await else {
            panic!("expected the first message");
        };
        assert_eq!(first.topic, "spBv1.0/line-1/NCMD/edge-1");
        drop(received);
        assert!(!forward_inbound(&events, inbound("spBv1.0/line-1/NDATA/edge-3")));
    }

    #[tokio::test]
    async fn publish_requires_connection() {
        let mut transport = MqttTransport::new(MqttSettings::new("localhost", 1883, "edge"));
        assert!(matches!(
            transport.publish("t", b"x", 1, false).await,
            Err(TransportError::NotConnected)
        ));
    }
}
