//! 会话运行器：边缘节点会话的唯一所有者。
//!
//! - 连接：登记遗嘱 → 订阅命令/STATE → 出生证明 → 回放暂存队列 → 实时发布
//! - 断网或主机离线：样本按名称编码写入暂存队列
//! - 队列非空时实时数据追加到队尾，不绕过积压数据
//! - 停机：排空样本通道 → NDEATH → 断开 → 刷盘

use crate::{Transport, TransportError, TransportEvent, InboundMessage};
use domain::TagSample;
use edge_buffer::{BufferError, StoreAndForwardQueue};
use edge_protocol::Backoff;
use edge_sparkplug::{
    EdgeNodeSession, MessageType, NAMESPACE, NodeCommand, OutboundMessage, Payload,
    SessionError, SessionState, StatePayload, Topic,
};
use edge_telemetry::{
    record_message_replayed, record_publish_failure, record_samples_published,
    set_transport_connected,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

/// 运行器参数。
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    /// 每轮回放的最大条数（轮间处理新样本与入站消息）。
    pub replay_batch: usize,
    /// 单次实时发布合并的最大样本数。
    pub live_batch: usize,
    /// 主机应用 ID；配置后按其 STATE 决定是否直发。
    pub host_id: Option<String>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            reconnect_min: Duration::from_secs(2),
            reconnect_max: Duration::from_secs(60),
            replay_batch: 100,
            live_batch: 100,
            host_id: None,
        }
    }
}

/// 网关控制面发给运行器的请求。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerRequest {
    Rebirth,
    /// 设备（机台）离线，发布 DDEATH。
    DeviceDeath(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostState {
    Unknown,
    Online,
    Offline,
}

pub struct SessionRunner<T: Transport> {
    transport: T,
    session: EdgeNodeSession,
    queue: Arc<StoreAndForwardQueue>,
    settings: RunnerSettings,
    commands: mpsc::Sender<NodeCommand>,
    backoff: Backoff,
    link: Option<mpsc::Receiver<TransportEvent>>,
    retry_at: Instant,
    host: HostState,
}

impl<T: Transport> SessionRunner<T> {
    pub fn new(
        transport: T,
        session: EdgeNodeSession,
        queue: Arc<StoreAndForwardQueue>,
        settings: RunnerSettings,
        commands: mpsc::Sender<NodeCommand>,
    ) -> Self {
        let backoff = Backoff::new(settings.reconnect_min, settings.reconnect_max);
        Self {
            transport,
            session,
            queue,
            settings,
            commands,
            backoff,
            link: None,
            retry_at: Instant::now(),
            host: HostState::Unknown,
        }
    }

    /// 运行直到 shutdown；仅本地存储故障会以错误返回。
    pub async fn run(
        mut self,
        mut samples: mpsc::Receiver<TagSample>,
        mut requests: mpsc::Receiver<RunnerRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        let mut samples_open = true;
        let mut requests_open = true;
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.link.is_none() && Instant::now() >= self.retry_at {
                let result = self.establish().await;
                self.settle(result)?;
            }
            let replay_ready = self.can_flow() && !self.queue.is_empty();
            let retry_at = self.retry_at;
            let offline = self.link.is_none();

            tokio::select! {
                _ = sleep_until(retry_at), if offline => {}
                event = next_event(&mut self.link), if !offline => {
                    let result = match event {
                        Some(TransportEvent::Message(message)) => self.on_inbound(message).await,
                        Some(TransportEvent::Disconnected(reason)) => {
                            Err(TransportError::Connect(reason))
                        }
                        None => Err(TransportError::NotConnected),
                    };
                    self.settle(result)?;
                }
                sample = samples.recv(), if samples_open => match sample {
                    Some(sample) => {
                        let mut batch = vec![sample];
                        while batch.len() < self.settings.live_batch.max(1) {
                            match samples.try_recv() {
                                Ok(sample) => batch.push(sample),
                                Err(_) => break,
                            }
                        }
                        let result = self.on_samples(batch).await;
                        self.settle(result)?;
                    }
                    None => samples_open = false,
                },
                request = requests.recv(), if requests_open => match request {
                    Some(request) => {
                        let result = self.on_request(request).await;
                        self.settle(result)?;
                    }
                    None => requests_open = false,
                },
                _ = std::future::ready(()), if replay_ready => {
                    let result = self.replay_chunk().await;
                    self.settle(result)?;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.stop(&mut samples).await
    }

    /// 已连接、会话 Active 且主机允许直发。
    fn can_flow(&self) -> bool {
        self.link.is_some()
            && self.session.state() == SessionState::Active
            && (self.settings.host_id.is_none() || self.host == HostState::Online)
    }

    async fn establish(&mut self) -> Result<(), TransportError> {
        self.session.disconnected();
        let will = self.session.connect_will()?;
        let link = self.transport.connect(Some(will.into())).await?;
        self.link = Some(link);
        self.host = HostState::Unknown;

        let group = self.session.group_id().to_string();
        let node = self.session.node_id().to_string();
        self.transport
            .subscribe(&Topic::node(&group, MessageType::NCmd, &node).to_string())
            .await?;
        self.transport
            .subscribe(&format!("{}/{}/DCMD/{}/+", NAMESPACE, group, node))
            .await?;
        if let Some(host_id) = self.settings.host_id.clone() {
            self.transport
                .subscribe(&Topic::state(&host_id).to_string())
                .await?;
        }

        self.publish_births().await?;
        self.backoff.reset();
        set_transport_connected(true);
        info!(
            target: "edge.transport",
            group = %group,
            node = %node,
            bd_seq = self.session.bd_seq(),
            queued = self.queue.len(),
            "session_online"
        );
        Ok(())
    }

    /// 处理阶段结果：存储故障上抛，其余视为链路中断并安排重连。
    fn settle(&mut self, result: Result<(), TransportError>) -> Result<(), TransportError> {
        let Err(err) = result else {
            return Ok(());
        };
        if err.is_fatal() {
            return Err(err);
        }
        let delay = self.settings.reconnect_min.max(self.backoff.next_delay());
        self.retry_at = Instant::now() + delay;
        if self.link.take().is_some() || self.session.state() != SessionState::Disconnected {
            set_transport_connected(false);
        }
        self.session.disconnected();
        warn!(
            target: "edge.transport",
            error = %err,
            retry_in_ms = delay.as_millis() as u64,
            queued = self.queue.len(),
            "session_link_lost"
        );
        Ok(())
    }

    async fn publish_births(&mut self) -> Result<(), TransportError> {
        let births = self.session.birth()?;
        for message in &births {
            self.send(message).await?;
        }
        self.session.confirm_birth()?;
        debug!(target: "edge.transport", messages = births.len(), "session_births_published");
        Ok(())
    }

    async fn send(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        let result = self
            .transport
            .publish(&message.topic, &message.payload, message.qos, message.retain)
            .await;
        if result.is_err() {
            record_publish_failure();
        }
        result
    }

    async fn on_samples(&mut self, batch: Vec<TagSample>) -> Result<(), TransportError> {
        let mut by_device: Vec<(String, Vec<TagSample>)> = Vec::new();
        for sample in batch {
            self.session.record(&sample);
            match by_device
                .iter_mut()
                .find(|(device, _)| *device == sample.machine_id)
            {
                Some((_, samples)) => samples.push(sample),
                None => by_device.push((sample.machine_id.clone(), vec![sample])),
            }
        }

        let mut link_error = None;
        for (device, samples) in by_device {
            if link_error.is_none() && self.can_flow() && self.queue.is_empty() {
                match self.publish_live(&device, &samples).await {
                    Ok(()) => continue,
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => link_error = Some(err),
                }
            }
            self.store(&device, &samples)?;
        }
        match link_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn publish_live(
        &mut self,
        device: &str,
        samples: &[TagSample],
    ) -> Result<(), TransportError> {
        if self.session.needs_device_birth(device) {
            let birth = self.session.device_birth(device)?;
            self.send(&birth).await?;
        }
        let message = self.session.device_data(device, samples)?;
        self.send(&message).await?;
        record_samples_published(samples.len() as u64);
        Ok(())
    }

    fn store(&mut self, device: &str, samples: &[TagSample]) -> Result<(), TransportError> {
        let (topic, payload) = self.session.stored_payload(device, samples);
        match self.queue.enqueue(topic, payload, 1) {
            Ok(_) => Ok(()),
            Err(err @ BufferError::Storage(_)) => Err(err.into()),
            Err(err) => {
                warn!(
                    target: "edge.transport",
                    device,
                    samples = samples.len(),
                    error = %err,
                    "samples_dropped_queue_full"
                );
                Ok(())
            }
        }
    }

    /// 回放一批暂存条目；确认发布后才从队列删除。
    async fn replay_chunk(&mut self) -> Result<(), TransportError> {
        let entries = self.queue.drain_in_order(self.settings.replay_batch.max(1))?;
        for entry in entries {
            if !self.can_flow() {
                break;
            }
            let device = match self.session.adopt_stored(&entry.topic, &entry.payload) {
                Ok(device) => device,
                Err(err) => {
                    self.discard(entry.id, &entry.topic, &err)?;
                    continue;
                }
            };
            if let Some(device) = device.as_deref()
                && self.session.needs_device_birth(device)
            {
                let birth = self.session.device_birth(device)?;
                self.send(&birth).await?;
            }
            let message = match self.session.restamp(&entry.topic, &entry.payload) {
                Ok(message) => message,
                Err(err @ (SessionError::Codec(_) | SessionError::UnknownMetric(_))) => {
                    self.discard(entry.id, &entry.topic, &err)?;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            self.send(&message).await?;
            self.queue.ack(entry.id)?;
            record_message_replayed();
        }
        if self.queue.is_empty() {
            info!(target: "edge.transport", "queue_replay_complete");
        }
        Ok(())
    }

    fn discard(
        &mut self,
        id: u64,
        topic: &str,
        err: &SessionError,
    ) -> Result<(), TransportError> {
        warn!(
            target: "edge.transport",
            id,
            topic,
            error = %err,
            "queued_entry_discarded"
        );
        self.queue.ack(id)?;
        Ok(())
    }

    async fn on_inbound(&mut self, message: InboundMessage) -> Result<(), TransportError> {
        let topic = match Topic::parse(&message.topic) {
            Ok(topic) => topic,
            Err(err) => {
                debug!(target: "edge.transport", topic = %message.topic, error = %err, "inbound_topic_ignored");
                return Ok(());
            }
        };
        match &topic {
            Topic::State { host_id } => {
                if self.settings.host_id.as_deref() == Some(host_id.as_str()) {
                    self.on_host_state(&message.payload).await?;
                }
                Ok(())
            }
            _ if matches!(topic.message_type(), MessageType::NCmd | MessageType::DCmd)
                && topic.edge_node_id() == Some(self.session.node_id()) =>
            {
                self.on_command(&message.payload).await
            }
            _ => Ok(()),
        }
    }

    async fn on_host_state(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let state = match StatePayload::from_bytes(payload) {
            Ok(state) => state,
            Err(err) => {
                warn!(target: "edge.transport", error = %err, "host_state_malformed");
                return Ok(());
            }
        };
        let previous = self.host;
        self.host = if state.online {
            HostState::Online
        } else {
            HostState::Offline
        };
        if previous == self.host {
            return Ok(());
        }
        info!(
            target: "edge.transport",
            online = state.online,
            queued = self.queue.len(),
            "host_state_changed"
        );
        // 主机恢复后重新出生，使其重建别名表
        if previous == HostState::Offline
            && self.host == HostState::Online
            && self.session.state() == SessionState::Active
        {
            self.publish_births().await?;
        }
        Ok(())
    }

    async fn on_command(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let payload = match Payload::decode_bytes(payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target: "edge.transport", error = %err, "node_command_malformed");
                return Ok(());
            }
        };
        for command in NodeCommand::parse_all(&payload) {
            match command {
                Ok(NodeCommand::Rebirth) => {
                    info!(target: "edge.transport", "rebirth_requested");
                    if self.session.state() == SessionState::Active {
                        self.publish_births().await?;
                    }
                }
                Ok(command) => {
                    info!(target: "edge.transport", command = ?command, "node_command_received");
                    if self.commands.try_send(command).is_err() {
                        warn!(target: "edge.transport", "node_command_dropped");
                    }
                }
                Err(err) => {
                    warn!(target: "edge.transport", error = %err, "node_command_invalid");
                }
            }
        }
        Ok(())
    }

    async fn on_request(&mut self, request: RunnerRequest) -> Result<(), TransportError> {
        if self.link.is_none() || self.session.state() != SessionState::Active {
            debug!(target: "edge.transport", request = ?request, "request_deferred_offline");
            return Ok(());
        }
        match request {
            RunnerRequest::Rebirth => self.publish_births().await,
            RunnerRequest::DeviceDeath(device) => {
                if !self.session.device_ids().any(|known| known == device) {
                    return Ok(());
                }
                let death = self.session.device_death(&device)?;
                self.send(&death).await
            }
        }
    }

    async fn stop(mut self, samples: &mut mpsc::Receiver<TagSample>) -> Result<(), TransportError> {
        let mut pending = Vec::new();
        while let Ok(sample) = samples.try_recv() {
            pending.push(sample);
        }
        if !pending.is_empty() {
            let result = self.on_samples(pending).await;
            self.settle(result)?;
        }

        if self.link.is_some()
            && matches!(
                self.session.state(),
                SessionState::Birthed | SessionState::Active
            )
        {
            let death = self.session.death()?;
            if let Err(err) = self.send(&death).await {
                warn!(target: "edge.transport", error = %err, "death_publish_failed");
            }
            self.transport.disconnect().await;
        }
        self.link = None;
        set_transport_connected(false);
        self.queue.sync()?;
        info!(
            target: "edge.transport",
            queued = self.queue.len(),
            "session_runner_stopped"
        );
        Ok(())
    }
}

async fn next_event(link: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match link {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
