//! 进程内 broker。
//!
//! 行为与 MQTT broker 对齐的部分：通配订阅、保留消息（空载荷清除）、
//! 非正常断开时发布遗嘱。发布即视为已确认。

use crate::{InboundMessage, Transport, TransportError, TransportEvent, WillMessage};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 4096;

struct ClientEntry {
    session_id: u64,
    client_id: String,
    filters: Vec<String>,
    events: mpsc::Sender<TransportEvent>,
    will: Option<WillMessage>,
}

struct BrokerState {
    online: bool,
    next_session: u64,
    clients: Vec<ClientEntry>,
    /// 被网络隔离的客户端 ID（拒绝连接）。
    isolated: HashSet<String>,
    retained: BTreeMap<String, Vec<u8>>,
    log: Vec<InboundMessage>,
}

/// 进程内 broker（克隆共享同一状态）。
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                online: true,
                next_session: 1,
                clients: Vec::new(),
                isolated: HashSet::new(),
                retained: BTreeMap::new(),
                log: Vec::new(),
            })),
        }
    }

    /// 为指定客户端 ID 创建一个传输端。
    pub fn transport(&self, client_id: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            client_id: client_id.into(),
            session: None,
        }
    }

    /// 切换在线状态；下线时踢掉全部客户端并发布其遗嘱。
    pub fn set_online(&self, online: bool) {
        let mut state = self.lock();
        state.online = online;
        if !online {
            kick_all(&mut state, "broker offline");
        }
    }

    /// 模拟网络闪断：踢掉全部客户端，broker 仍接受新连接。
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        kick_all(&mut state, "connection reset");
    }

    /// 模拟单个客户端断网：隔离期间踢掉该客户端（发布遗嘱）并拒绝其重连，
    /// 其他客户端不受影响。
    pub fn set_client_online(&self, client_id: &str, online: bool) {
        let mut state = self.lock();
        if online {
            state.isolated.remove(client_id);
            return;
        }
        state.isolated.insert(client_id.to_string());
        let (kicked, kept): (Vec<ClientEntry>, Vec<ClientEntry>) =
            std::mem::take(&mut state.clients)
                .into_iter()
                .partition(|client| client.client_id == client_id);
        state.clients = kept;
        for client in kicked {
            let _ = client
                .events
                .try_send(TransportEvent::Disconnected("network isolated".to_string()));
            if let Some(will) = client.will {
                route(&mut state, &will.topic, &will.payload, will.retain);
            }
        }
    }

    /// 外部发布（模拟主机应用或其他客户端）。
    pub fn publish(&self, topic: &str, payload: &[u8], retain: bool) {
        let mut state = self.lock();
        route(&mut state, topic, payload, retain);
    }

    /// 全部已发布消息（按到达顺序）。
    pub fn published(&self) -> Vec<InboundMessage> {
        self.lock().log.clone()
    }

    pub fn published_matching(&self, filter: &str) -> Vec<InboundMessage> {
        self.lock()
            .log
            .iter()
            .filter(|message| topic_matches(filter, &message.topic))
            .cloned()
            .collect()
    }

    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.lock().retained.get(topic).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.lock()
            .clients
            .iter()
            .any(|client| client.client_id == client_id)
    }

    fn attach(
        &self,
        client_id: &str,
        will: Option<WillMessage>,
    ) -> Result<(u64, mpsc::Receiver<TransportEvent>), TransportError> {
        let mut state = self.lock();
        if !state.online {
            return Err(TransportError::Connect("broker offline".to_string()));
        }
        if state.isolated.contains(client_id) {
            return Err(TransportError::Connect("network unreachable".to_string()));
        }
        // 同 ID 重复连接：旧会话被接管，按 MQTT 语义发布其遗嘱
        if let Some(index) = state
            .clients
            .iter()
            .position(|client| client.client_id == client_id)
        {
            let old = state.clients.remove(index);
            let _ = old
                .events
                .try_send(TransportEvent::Disconnected("session taken over".to_string()));
            if let Some(will) = old.will {
                route(&mut state, &will.topic, &will.payload, will.retain);
            }
        }
        let session_id = state.next_session;
        state.next_session += 1;
        let (events, receiver) = mpsc::channel(EVENT_CAPACITY);
        state.clients.push(ClientEntry {
            session_id,
            client_id: client_id.to_string(),
            filters: Vec::new(),
            events,
            will,
        });
        debug!(target: "edge.transport", client_id, session_id, "memory_client_attached");
        Ok((session_id, receiver))
    }

    fn detach(&self, session_id: u64, fire_will: bool) {
        let mut state = self.lock();
        let Some(index) = state
            .clients
            .iter()
            .position(|client| client.session_id == session_id)
        else {
            return;
        };
        let client = state.clients.remove(index);
        if fire_will && let Some(will) = client.will {
            route(&mut state, &will.topic, &will.payload, will.retain);
        }
    }

    fn subscribe_session(&self, session_id: u64, filter: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        let retained: Vec<(String, Vec<u8>)> = state
            .retained
            .iter()
            .filter(|(topic, _)| topic_matches(filter, topic))
            .map(|(topic, payload)| (topic.clone(), payload.clone()))
            .collect();
        let client = state
            .clients
            .iter_mut()
            .find(|client| client.session_id == session_id)
            .ok_or(TransportError::NotConnected)?;
        client.filters.push(filter.to_string());
        for (topic, payload) in retained {
            let _ = client
                .events
                .try_send(TransportEvent::Message(InboundMessage { topic, payload }));
        }
        Ok(())
    }

    fn publish_from(
        &self,
        session_id: u64,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.online {
            return Err(TransportError::Publish("broker offline".to_string()));
        }
        if !state
            .clients
            .iter()
            .any(|client| client.session_id == session_id)
        {
            return Err(TransportError::NotConnected);
        }
        route(&mut state, topic, payload, retain);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn kick_all(state: &mut BrokerState, reason: &str) {
    let clients = std::mem::take(&mut state.clients);
    for client in clients {
        let _ = client
            .events
            .try_send(TransportEvent::Disconnected(reason.to_string()));
        if let Some(will) = client.will {
            state.log.push(InboundMessage {
                topic: will.topic.clone(),
                payload: will.payload.clone(),
            });
            if will.retain {
                state.retained.insert(will.topic, will.payload);
            }
        }
    }
}

fn route(state: &mut BrokerState, topic: &str, payload: &[u8], retain: bool) {
    state.log.push(InboundMessage {
        topic: topic.to_string(),
        payload: payload.to_vec(),
    });
    if retain {
        if payload.is_empty() {
            state.retained.remove(topic);
        } else {
            state.retained.insert(topic.to_string(), payload.to_vec());
        }
    }
    for client in &state.clients {
        if !client
            .filters
            .iter()
            .any(|filter| topic_matches(filter, topic))
        {
            continue;
        }
        let event = TransportEvent::Message(InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
        if client.events.try_send(event).is_err() {
            warn!(
                target: "edge.transport",
                client_id = %client.client_id,
                topic,
                "memory_delivery_dropped"
            );
        }
    }
}

/// MQTT 订阅过滤匹配（`+` 单层，`#` 多层）。
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(level)) if expected == level => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// 进程内 broker 的客户端。丢弃时若仍在线视为非正常断开。
pub struct MemoryTransport {
    broker: MemoryBroker,
    client_id: String,
    session: Option<u64>,
}

impl MemoryTransport {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn session(&self) -> Result<u64, TransportError> {
        self.session.ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &mut self,
        will: Option<WillMessage>,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        if let Some(previous) = self.session.take() {
            self.broker.detach(previous, false);
        }
        let (session_id, receiver) = self.broker.attach(&self.client_id, will)?;
        self.session = Some(session_id);
        Ok(receiver)
    }

    async fn subscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        let session_id = self.session()?;
        self.broker.subscribe_session(session_id, filter)
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        _qos: u8,
        retain: bool,
    ) -> Result<(), TransportError> {
        let session_id = self.session()?;
        self.broker.publish_from(session_id, topic, payload, retain)
    }

    async fn disconnect(&mut self) {
        if let Some(session_id) = self.session.take() {
            self.broker.detach(session_id, false);
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if let Some(session_id) = self.session.take() {
            self.broker.detach(session_id, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matching() {
        assert!(topic_matches("spBv1.0/line-1/#", "spBv1.0/line-1/DDATA/n1/press"));
        assert!(topic_matches("spBv1.0/+/NCMD/n1", "spBv1.0/line-1/NCMD/n1"));
        assert!(topic_matches("a/#", "a"));
        assert!(!topic_matches("spBv1.0/+/NCMD/n1", "spBv1.0/line-1/NCMD/n2"));
        assert!(!topic_matches("a/b", "a/b/c"));
    }

    #[tokio::test]
    async fn retained_delivered_on_subscribe() {
        let broker = MemoryBroker::new();
        broker.publish("spBv1.0/STATE/scada", b"{\"online\":true,\"timestamp\":1}", true);
        let mut transport = broker.transport("edge");
        let mut events = transport.connect(None).await.expect("connect");
        transport
            .subscribe("spBv1.0/STATE/+")
            .await
            .expect("subscribe");
        match events.recv().await {
            Some(TransportEvent::Message(message)) => {
                assert_eq!(message.topic, "spBv1.0/STATE/scada")
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn will_fires_on_ungraceful_drop_only() {
        let broker = MemoryBroker::new();
        let will = WillMessage {
            topic: "spBv1.0/g/NDEATH/n".to_string(),
            payload: vec![1],
            qos: 1,
            retain: true,
        };

        let mut graceful = broker.transport("a");
        graceful.connect(Some(will.clone())).await.expect("connect");
        graceful.disconnect().await;
        assert!(broker.retained(&will.topic).is_none());

        let mut abrupt = broker.transport("b");
        abrupt.connect(Some(will.clone())).await.expect("connect");
        drop(abrupt);
        assert_eq!(broker.retained(&will.topic), Some(vec![1]));
    }

    #[tokio::test]
    async fn offline_broker_rejects_publish() {
        let broker = MemoryBroker::new();
        let mut transport = broker.transport("edge");
        let mut events = transport.connect(None).await.expect("connect");
        broker.set_online(false);
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Disconnected(_))
        ));
        assert!(transport.publish("t", b"x", 1, false).await.is_err());
        assert!(transport.connect(None).await.is_err());
    }

    #[tokio::test]
    async fn isolated_client_loses_link_others_keep_theirs() {
        let broker = MemoryBroker::new();
        let mut host = broker.transport("host");
        let mut host_events = host.connect(None).await.expect("connect");
        host.subscribe("death/#").await.expect("subscribe");

        let mut edge = broker.transport("edge");
        let will = WillMessage {
            topic: "death/edge".to_string(),
            payload: vec![9],
            qos: 1,
            retain: false,
        };
        let mut edge_events = edge.connect(Some(will)).await.expect("connect");
        broker.set_client_online("edge", false);

        assert!(matches!(
            edge_events.recv().await,
            Some(TransportEvent::Disconnected(_))
        ));
        assert!(matches!(
            host_events.recv().await,
            Some(TransportEvent::Message(InboundMessage { topic, .. })) if topic == "death/edge"
        ));
        assert!(edge.connect(None).await.is_err());
        assert!(broker.is_connected("host"));

        broker.set_client_online("edge", true);
        assert!(edge.connect(None).await.is_ok());
    }
}
