//! 分阶段运行时：每个阶段一个任务，阶段之间是有界通道。
//!
//! 输入通道关闭后各阶段依次排空退出；路由阶段退出前刷新遥测缓冲并等待
//! 全部机台 actor 结束，事件阶段在所有事件发送端释放后退出。

use crate::decode::decode_samples;
use crate::enrich::{CachedContext, ContextProvider, enrichment};
use crate::machine::{MachineActor, MachineInput};
use crate::sink::{BatchConfig, BatchWriter, SharedEventSink, SharedTelemetrySink};
use crate::validate::{DEFAULT_DUPLICATE_WINDOW_MS, Validated, Validator};
use crate::PipelineError;
use domain::{
    AssetRegistry, DataQualityAlert, EventRecord, FaultEvent, TagSample, TelemetryRecord,
    ValueRange, now_epoch_ms,
};
use edge_fault::FaultPolicy;
use edge_normalize::{MappingProvider, NormalizeOutcome, Normalizer};
use edge_oee::WindowSettings;
use edge_sparkplug::DecodedMessage;
use edge_telemetry::Stage;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// 运行时参数。
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub channel_capacity: usize,
    pub duplicate_window_ms: i64,
    pub context_ttl: Duration,
    pub oee_tick: Duration,
    pub flush_interval: Duration,
    pub telemetry_batch: BatchConfig,
    pub event_batch: BatchConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            duplicate_window_ms: DEFAULT_DUPLICATE_WINDOW_MS,
            context_ttl: CachedContext::DEFAULT_TTL,
            oee_tick: Duration::from_secs(60),
            flush_interval: Duration::from_secs(1),
            telemetry_batch: BatchConfig::default(),
            event_batch: BatchConfig {
                batch_size: 50,
                ..BatchConfig::default()
            },
        }
    }
}

/// 热加载的配置视图：资产层级、各机台窗口参数、故障策略。
#[derive(Debug, Clone, Default)]
pub struct PipelineCatalog {
    pub assets: AssetRegistry,
    pub machines: HashMap<String, WindowSettings>,
    pub fault_policy: FaultPolicy,
}

impl PipelineCatalog {
    pub fn window_for(&self, machine_id: &str) -> WindowSettings {
        self.machines.get(machine_id).copied().unwrap_or_default()
    }
}

/// 运维控制。
#[derive(Debug)]
pub enum PipelineControl {
    AcknowledgeFault {
        machine_id: String,
        code: i64,
        operator: String,
        reply: oneshot::Sender<Result<FaultEvent, PipelineError>>,
    },
}

#[derive(Debug)]
struct Item {
    sample: TagSample,
    historical: bool,
    mapped: bool,
    unit: Option<String>,
    range: Option<ValueRange>,
    metadata: BTreeMap<String, String>,
}

impl Item {
    fn new(sample: TagSample, historical: bool) -> Self {
        Self {
            sample,
            historical,
            mapped: false,
            unit: None,
            range: None,
            metadata: BTreeMap::new(),
        }
    }

    fn into_record(self) -> TelemetryRecord {
        let Item {
            sample,
            historical,
            mapped,
            unit,
            mut metadata,
            ..
        } = self;
        let kind = sample.signal.as_ref().map(|signal| signal.kind());
        let signal = match sample.signal {
            Some(signal) => {
                if signal.as_str() != sample.address {
                    metadata.insert("address".to_string(), sample.address.clone());
                }
                signal.to_string()
            }
            None => sample.address.clone(),
        };
        if let Some(unit) = unit {
            metadata.insert("unit".to_string(), unit);
        }
        if historical {
            metadata.insert("historical".to_string(), "true".to_string());
        }
        TelemetryRecord {
            machine_id: sample.machine_id,
            signal,
            kind,
            mapped,
            value: sample.value,
            quality: sample.quality,
            ts_ms: sample.ts_ms,
            metadata,
        }
    }
}

#[derive(Debug)]
enum Routed {
    Item(Item),
    Alert(DataQualityAlert),
}

/// 可克隆的故障确认入口，供控制面持有。
#[derive(Debug, Clone)]
pub struct FaultAcknowledger {
    control: mpsc::Sender<PipelineControl>,
}

impl FaultAcknowledger {
    pub async fn acknowledge(
        &self,
        machine_id: &str,
        code: i64,
        operator: &str,
    ) -> Result<FaultEvent, PipelineError> {
        let (reply, result) = oneshot::channel();
        self.control
            .send(PipelineControl::AcknowledgeFault {
                machine_id: machine_id.to_string(),
                code,
                operator: operator.to_string(),
                reply,
            })
            .await
            .map_err(|_| PipelineError::Closed)?;
        result.await.map_err(|_| PipelineError::Closed)?
    }
}

/// 流水线句柄。
pub struct PipelineHandle {
    input: mpsc::Sender<DecodedMessage>,
    events: mpsc::Sender<EventRecord>,
    control: mpsc::Sender<PipelineControl>,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// 解码阶段的输入端（交给采集源）。
    pub fn input(&self) -> mpsc::Sender<DecodedMessage> {
        self.input.clone()
    }

    /// 事件 sink 的输入端（连接器健康等外部事件）。
    pub fn events(&self) -> mpsc::Sender<EventRecord> {
        self.events.clone()
    }

    pub fn acknowledger(&self) -> FaultAcknowledger {
        FaultAcknowledger {
            control: self.control.clone(),
        }
    }

    pub async fn acknowledge_fault(
        &self,
        machine_id: &str,
        code: i64,
        operator: &str,
    ) -> Result<FaultEvent, PipelineError> {
        self.acknowledger()
            .acknowledge(machine_id, code, operator)
            .await
    }

    /// 关闭输入并等待各阶段排空；超时后放弃剩余任务。
    pub async fn shutdown(self, grace: Duration) {
        let PipelineHandle {
            input,
            events,
            control,
            tasks,
        } = self;
        drop(input);
        drop(events);
        drop(control);
        let deadline = tokio::time::Instant::now() + grace;
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                warn!(target: "edge.pipeline", "pipeline_task_abandoned");
                task.abort();
            }
        }
        info!(target: "edge.pipeline", "pipeline_stopped");
    }
}

/// 流水线装配。
pub struct PipelineRuntime {
    config: PipelineConfig,
    mappings: Arc<dyn MappingProvider>,
    contexts: Arc<dyn ContextProvider>,
    catalog: watch::Receiver<Arc<PipelineCatalog>>,
    telemetry: SharedTelemetrySink,
    events: SharedEventSink,
}

impl PipelineRuntime {
    pub fn new(
        config: PipelineConfig,
        mappings: Arc<dyn MappingProvider>,
        contexts: Arc<dyn ContextProvider>,
        catalog: watch::Receiver<Arc<PipelineCatalog>>,
        telemetry: SharedTelemetrySink,
        events: SharedEventSink,
    ) -> Self {
        Self {
            config,
            mappings,
            contexts,
            catalog,
            telemetry,
            events,
        }
    }

    pub fn spawn(self) -> PipelineHandle {
        let capacity = self.config.channel_capacity.max(1);
        let (input, decoded_rx) = mpsc::channel::<DecodedMessage>(capacity);
        let (normalize_tx, normalize_rx) = mpsc::channel::<Item>(capacity);
        let (enrich_tx, enrich_rx) = mpsc::channel::<Item>(capacity);
        let (validate_tx, validate_rx) = mpsc::channel::<Item>(capacity);
        let (route_tx, route_rx) = mpsc::channel::<Routed>(capacity);
        let (events_tx, events_rx) = mpsc::channel::<EventRecord>(capacity);
        let (control, control_rx) = mpsc::channel::<PipelineControl>(16);

        let tasks = vec![
            tokio::spawn(decode_stage(decoded_rx, normalize_tx)),
            tokio::spawn(normalize_stage(normalize_rx, enrich_tx, self.mappings)),
            tokio::spawn(enrich_stage(
                enrich_rx,
                validate_tx,
                CachedContext::new(self.contexts, self.config.context_ttl),
                self.catalog.clone(),
            )),
            tokio::spawn(validate_stage(
                validate_rx,
                route_tx,
                Validator::new(self.config.duplicate_window_ms),
            )),
            tokio::spawn(
                Router {
                    writer: BatchWriter::new(
                        "telemetry",
                        self.telemetry,
                        self.config.telemetry_batch.clone(),
                    ),
                    events: events_tx.clone(),
                    catalog: self.catalog,
                    actors: HashMap::new(),
                    actor_tasks: Vec::new(),
                }
                .run(
                    route_rx,
                    control_rx,
                    self.config.oee_tick,
                    self.config.flush_interval,
                ),
            ),
            tokio::spawn(event_stage(
                events_rx,
                BatchWriter::new("events", self.events, self.config.event_batch.clone()),
            )),
        ];
        info!(target: "edge.pipeline", capacity, "pipeline_started");
        PipelineHandle {
            input,
            events: events_tx,
            control,
            tasks,
        }
    }
}

fn record_latency(stage: Stage, started: Instant) {
    edge_telemetry::record_stage_latency_ms(stage, started.elapsed().as_millis() as u64);
}

async fn decode_stage(mut input: mpsc::Receiver<DecodedMessage>, output: mpsc::Sender<Item>) {
    while let Some(message) = input.recv().await {
        let started = Instant::now();
        let samples = match decode_samples(&message) {
            Ok(samples) => samples,
            Err(err) => {
                edge_telemetry::record_decode_error();
                warn!(
                    target: "edge.pipeline",
                    node = %message.edge_node_id,
                    device = ?message.device_id,
                    error = %err,
                    "message_decode_failed"
                );
                continue;
            }
        };
        record_latency(Stage::Decode, started);
        for decoded in samples {
            if output
                .send(Item::new(decoded.sample, decoded.historical))
                .await
                .is_err()
            {
                return;
            }
        }
    }
    debug!(target: "edge.pipeline", stage = "decode", "stage_stopped");
}

async fn normalize_stage(
    mut input: mpsc::Receiver<Item>,
    output: mpsc::Sender<Item>,
    mappings: Arc<dyn MappingProvider>,
) {
    let mut normalizer = Normalizer::new(mappings);
    while let Some(mut item) = input.recv().await {
        let started = Instant::now();
        let outcome = normalizer.normalize(item.sample.clone()).await;
        record_latency(Stage::Normalize, started);
        match outcome {
            Ok(NormalizeOutcome::Forward(normalized)) => {
                item.sample = normalized.sample;
                item.mapped = true;
                item.unit = normalized.unit;
                item.range = normalized.range;
            }
            Ok(NormalizeOutcome::Unmapped(sample) | NormalizeOutcome::Labeled(sample)) => {
                item.sample = sample;
            }
            Ok(NormalizeOutcome::DroppedDeadband | NormalizeOutcome::DroppedQuality) => continue,
            Err(err) => {
                // 映射源故障时按未映射透传
                warn!(
                    target: "edge.pipeline",
                    machine_id = %item.sample.machine_id,
                    address = %item.sample.address,
                    error = %err,
                    "mapping_lookup_failed"
                );
            }
        }
        if output.send(item).await.is_err() {
            return;
        }
    }
    debug!(target: "edge.pipeline", stage = "normalize", "stage_stopped");
}

async fn enrich_stage(
    mut input: mpsc::Receiver<Item>,
    output: mpsc::Sender<Item>,
    mut contexts: CachedContext,
    catalog: watch::Receiver<Arc<PipelineCatalog>>,
) {
    while let Some(mut item) = input.recv().await {
        let started = Instant::now();
        let current = Arc::clone(&catalog.borrow());
        item.metadata = enrichment(&current.assets, &mut contexts, &item.sample.machine_id).await;
        record_latency(Stage::Enrich, started);
        if output.send(item).await.is_err() {
            return;
        }
    }
    debug!(target: "edge.pipeline", stage = "enrich", "stage_stopped");
}

async fn validate_stage(
    mut input: mpsc::Receiver<Item>,
    output: mpsc::Sender<Routed>,
    mut validator: Validator,
) {
    while let Some(mut item) = input.recv().await {
        let started = Instant::now();
        let outcome = validator.validate(item.sample.clone(), item.range);
        record_latency(Stage::Validate, started);
        let Validated::Pass { sample, alert } = outcome else {
            continue;
        };
        item.sample = sample;
        if output.send(Routed::Item(item)).await.is_err() {
            return;
        }
        if let Some(alert) = alert
            && output.send(Routed::Alert(alert)).await.is_err()
        {
            return;
        }
    }
    debug!(target: "edge.pipeline", stage = "validate", "stage_stopped");
}

struct Router {
    writer: BatchWriter<TelemetryRecord>,
    events: mpsc::Sender<EventRecord>,
    catalog: watch::Receiver<Arc<PipelineCatalog>>,
    actors: HashMap<String, mpsc::Sender<MachineInput>>,
    actor_tasks: Vec<JoinHandle<()>>,
}

impl Router {
    async fn run(
        mut self,
        mut input: mpsc::Receiver<Routed>,
        mut control: mpsc::Receiver<PipelineControl>,
        oee_tick: Duration,
        flush_interval: Duration,
    ) {
        let start = tokio::time::Instant::now();
        let mut ticks = tokio::time::interval_at(start + oee_tick, oee_tick);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut flushes = tokio::time::interval_at(start + flush_interval, flush_interval);
        flushes.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                routed = input.recv() => match routed {
                    Some(Routed::Item(item)) => self.route(item).await,
                    Some(Routed::Alert(alert)) => {
                        warn!(
                            target: "edge.pipeline",
                            machine_id = %alert.machine_id,
                            signal = %alert.signal,
                            value = %alert.value,
                            reason = %alert.reason,
                            "data_quality_alert"
                        );
                        let _ = self.events.send(EventRecord::DataQuality(alert)).await;
                    }
                    None => break,
                },
                Some(command) = control.recv() => self.on_control(command).await,
                _ = ticks.tick() => {
                    let now_ms = now_epoch_ms();
                    for actor in self.actors.values() {
                        let _ = actor.send(MachineInput::Tick { now_ms }).await;
                    }
                }
                _ = flushes.tick() => self.flush().await,
                Ok(()) = self.catalog.changed() => self.reconfigure().await,
            }
        }

        self.flush().await;
        self.actors.clear();
        for task in self.actor_tasks.drain(..) {
            let _ = task.await;
        }
        debug!(target: "edge.pipeline", stage = "route", "stage_stopped");
    }

    async fn route(&mut self, item: Item) {
        let started = Instant::now();
        let feeds_calculation = item
            .sample
            .signal
            .as_ref()
            .is_some_and(|signal| signal.kind().feeds_calculation());
        if feeds_calculation {
            let sample = item.sample.clone();
            let actor = self.actor_for(&sample.machine_id);
            if actor.send(MachineInput::Sample(sample)).await.is_err() {
                warn!(target: "edge.pipeline", "machine_actor_gone");
            }
        }
        if let Err(err) = self.writer.push(item.into_record()).await {
            warn!(target: "edge.pipeline", error = %err, pending = self.writer.pending(), "telemetry_write_deferred");
        }
        record_latency(Stage::Route, started);
    }

    async fn flush(&mut self) {
        if self.writer.pending() == 0 {
            return;
        }
        let started = Instant::now();
        if let Err(err) = self.writer.flush().await {
            warn!(target: "edge.pipeline", error = %err, pending = self.writer.pending(), "telemetry_flush_failed");
        }
        record_latency(Stage::Sink, started);
    }

    fn actor_for(&mut self, machine_id: &str) -> mpsc::Sender<MachineInput> {
        if let Some(actor) = self.actors.get(machine_id) {
            return actor.clone();
        }
        let catalog = Arc::clone(&self.catalog.borrow());
        let (sender, task) = MachineActor::new(
            machine_id,
            catalog.window_for(machine_id),
            catalog.fault_policy.clone(),
            now_epoch_ms(),
        )
        .spawn(self.events.clone());
        debug!(target: "edge.pipeline", machine_id, "machine_actor_started");
        self.actors.insert(machine_id.to_string(), sender.clone());
        self.actor_tasks.push(task);
        sender
    }

    async fn on_control(&mut self, command: PipelineControl) {
        match command {
            PipelineControl::AcknowledgeFault {
                machine_id,
                code,
                operator,
                reply,
            } => {
                let Some(actor) = self.actors.get(&machine_id) else {
                    let _ = reply.send(Err(PipelineError::Fault(format!(
                        "unknown machine {}",
                        machine_id
                    ))));
                    return;
                };
                // 发送失败时 reply 随消息一起丢弃，调用方收到 Closed
                let _ = actor
                    .send(MachineInput::Acknowledge {
                        code,
                        operator,
                        reply,
                    })
                    .await;
            }
        }
    }

    async fn reconfigure(&mut self) {
        let catalog = Arc::clone(&self.catalog.borrow_and_update());
        for (machine_id, actor) in &self.actors {
            let _ = actor
                .send(MachineInput::Reconfigure {
                    window: catalog.window_for(machine_id),
                    policy: catalog.fault_policy.clone(),
                })
                .await;
        }
        info!(target: "edge.pipeline", machines = self.actors.len(), "pipeline_reconfigured");
    }
}

async fn event_stage(mut input: mpsc::Receiver<EventRecord>, mut writer: BatchWriter<EventRecord>) {
    while let Some(event) = input.recv().await {
        let mut batch = vec![event];
        while let Ok(more) = input.try_recv() {
            batch.push(more);
        }
        for event in batch {
            edge_telemetry::record_event_emitted();
            if let Err(err) = writer.push(event).await {
                warn!(target: "edge.pipeline", error = %err, "event_write_deferred");
            }
        }
        if let Err(err) = writer.flush().await {
            warn!(target: "edge.pipeline", error = %err, pending = writer.pending(), "event_flush_failed");
        }
    }
    if let Err(err) = writer.flush().await {
        warn!(target: "edge.pipeline", error = %err, "event_flush_failed");
    }
    debug!(target: "edge.pipeline", stage = "events", "stage_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::NoContext;
    use crate::sink::ChannelSink;
    use domain::{CanonicalSignal, FaultTransition, MappingTable, Quality, TagMapping, TagValue};
    use edge_normalize::StaticMappingProvider;
    use edge_sparkplug::{DecodedMetric, MessageType};

    struct Rig {
        handle: PipelineHandle,
        telemetry: mpsc::Receiver<TelemetryRecord>,
        events: mpsc::Receiver<EventRecord>,
    }

    fn rig(mappings: Vec<TagMapping>) -> Rig {
        let (telemetry_tx, telemetry) = mpsc::channel(1024);
        let (events_tx, events) = mpsc::channel(1024);
        let (_catalog_tx, catalog) = watch::channel(Arc::new(PipelineCatalog::default()));
        let config = PipelineConfig {
            telemetry_batch: BatchConfig {
                batch_size: 1,
                ..BatchConfig::default()
            },
            ..PipelineConfig::default()
        };
        let handle = PipelineRuntime::new(
            config,
            Arc::new(StaticMappingProvider::new(MappingTable::new(mappings, 1))),
            Arc::new(NoContext),
            catalog,
            Arc::new(ChannelSink::new(telemetry_tx)),
            Arc::new(ChannelSink::new(events_tx)),
        )
        .spawn();
        Rig {
            handle,
            telemetry,
            events,
        }
    }

    fn ddata(metrics: Vec<(&str, TagValue)>) -> DecodedMessage {
        DecodedMessage {
            group_id: "line-1".to_string(),
            edge_node_id: "edge-1".to_string(),
            device_id: Some("press-01".to_string()),
            message_type: MessageType::DData,
            seq: Some(1),
            ts_ms: 1_000,
            metrics: metrics
                .into_iter()
                .map(|(name, value)| DecodedMetric {
                    name: name.to_string(),
                    value,
                    quality: Quality::Good,
                    ts_ms: 1_000,
                    historical: false,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn mapped_sample_reaches_telemetry_sink() {
        let mut temp = TagMapping::new(
            "press-01",
            "ir:1:5",
            CanonicalSignal::parse("pv.temperature").expect("signal"),
        );
        temp.unit = Some("degC".to_string());
        temp.range = Some(ValueRange {
            min: Some(0.0),
            max: Some(100.0),
        });
        let mut rig = rig(vec![temp]);
        rig.handle
            .input()
            .send(ddata(vec![
                ("ir:1:5", TagValue::Float(42.0)),
                ("hr:9:9", TagValue::Int(1)),
                ("ir:1:5", TagValue::Float(420.0)),
            ]))
            .await
            .expect("send");

        let first = rig.telemetry.recv().await.expect("record");
        assert_eq!(first.signal, "pv.temperature");
        assert!(first.mapped);
        assert_eq!(first.metadata.get("unit").map(String::as_str), Some("degC"));
        let unmapped = rig.telemetry.recv().await.expect("record");
        assert_eq!(unmapped.signal, "hr:9:9");
        assert!(!unmapped.mapped);
        let out_of_range = rig.telemetry.recv().await.expect("record");
        assert_eq!(out_of_range.quality, Quality::Uncertain);

        let alert = rig.events.recv().await.expect("event");
        assert!(matches!(alert, EventRecord::DataQuality(_)));
        rig.handle.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn fault_events_and_acknowledgement() {
        let mut rig = rig(Vec::new());
        rig.handle
            .input()
            .send(ddata(vec![("fault.code", TagValue::Int(42))]))
            .await
            .expect("send");
        let opened = rig.events.recv().await.expect("event");
        assert!(matches!(opened, EventRecord::Fault(_)));

        let acked = rig
            .handle
            .acknowledge_fault("press-01", 42, "operator-1")
            .await
            .expect("ack");
        assert_eq!(acked.record.acknowledged_by.as_deref(), Some("operator-1"));
        assert!(rig.handle.acknowledge_fault("lathe-9", 42, "x").await.is_err());
        rig.handle.shutdown(Duration::from_secs(5)).await;
    }

    fn metric_at(name: &str, value: TagValue, ts_ms: i64) -> DecodedMessage {
        let mut message = ddata(vec![(name, value)]);
        message.ts_ms = ts_ms;
        for metric in &mut message.metrics {
            metric.ts_ms = ts_ms;
        }
        message
    }

    async fn next_fault(events: &mut mpsc::Receiver<EventRecord>) -> FaultEvent {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Some(EventRecord::Fault(event))) => return event,
                Ok(Some(_)) => continue,
                other => panic!("expected fault event, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn fault_lifecycle_through_all_stages() {
        let mut rig = rig(Vec::new());
        let input = rig.handle.input();
        for (value, ts_ms) in [(42, 0), (42, 30_000), (42, 90_000), (0, 120_000)] {
            input
                .send(metric_at("fault.code", TagValue::Int(value), ts_ms))
                .await
                .expect("send");
        }

        let opened = next_fault(&mut rig.events).await;
        assert_eq!(opened.transition, FaultTransition::Opened);
        assert_eq!(opened.record.code, 42);
        // 30 s 处的同值样本在校验阶段被抑制，不计入次数
        let repeated = next_fault(&mut rig.events).await;
        assert_eq!(repeated.transition, FaultTransition::Repeated);
        assert_eq!(repeated.record.occurrence_count, 2);
        assert_eq!(repeated.record.last_seen_ms, 90_000);
        let resolved = next_fault(&mut rig.events).await;
        assert_eq!(resolved.transition, FaultTransition::Resolved);
        assert_eq!(resolved.record.record_id, opened.record.record_id);
        assert_eq!(resolved.record.closed_at_ms, Some(120_000));

        let first = rig.telemetry.recv().await.expect("record");
        assert_eq!(first.signal, "fault.code");
        assert!(!first.mapped);
        rig.handle.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn boolean_fault_signals_open_separate_records() {
        let mut rig = rig(Vec::new());
        let input = rig.handle.input();
        input
            .send(metric_at("fault.estop", TagValue::Bool(true), 0))
            .await
            .expect("send");
        input
            .send(metric_at("fault.door_open", TagValue::Bool(true), 1_000))
            .await
            .expect("send");
        input
            .send(metric_at("fault.estop", TagValue::Bool(false), 2_000))
            .await
            .expect("send");

        let estop = next_fault(&mut rig.events).await;
        let door = next_fault(&mut rig.events).await;
        assert_eq!(estop.transition, FaultTransition::Opened);
        assert_eq!(door.transition, FaultTransition::Opened);
        assert_ne!(estop.record.record_id, door.record.record_id);
        let cleared = next_fault(&mut rig.events).await;
        assert_eq!(cleared.transition, FaultTransition::Resolved);
        assert_eq!(cleared.record.signal, "fault.estop");
        rig.handle.shutdown(Duration::from_secs(5)).await;
    }
}
