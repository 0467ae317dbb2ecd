//! 网关装配：连接器 → 会话运行器 → broker → 采集源 → 流水线。
//!
//! 停机顺序：连接器与背压协调器 → 会话运行器（排空样本、NDEATH、队列刷盘）
//! → 采集源 → 流水线排空。
//!
//! 会话运行器异常退出（如队列本地存储故障）时 [`FatalSignal`] 触发，
//! 进程据此走同一停机流程并以错误退出。

use crate::catalog::{connector_machines, follow_reloads, pipeline_catalog};
use crate::control::{ConnectorRegistry, GatewayControl, forward_health, run_commands};
use domain::{EventRecord, TelemetryRecord};
use edge_buffer::{BufferError, OverflowPolicy, QueueConfig, StoreAndForwardQueue};
use edge_config::{
    AppConfig, ConfigError, ConnectorKind, OverflowPolicySetting, SinkKind, spawn_config_watcher,
};
use edge_ingest::{ChannelHandler, Source, SparkplugSource, SparkplugSourceConfig};
use edge_normalize::StaticMappingProvider;
use edge_pipeline::{
    BatchConfig, LogSink, MqttJsonSink, NoContext, PipelineConfig, PipelineHandle,
    PipelineRuntime, RecordSink,
};
use edge_protocol::{Connector, ConnectorControl, ConnectorError, ModbusTcpConnector, RateMode};
use edge_sparkplug::EdgeNodeSession;
use edge_transport::{
    BackpressureCoordinator, BackpressureSettings, MqttSettings, MqttTransport, RunnerSettings,
    SessionRunner, TransportError,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("queue: {0}")]
    Queue(#[from] BufferError),
    #[error("connector: {0}")]
    Connector(#[from] ConnectorError),
    #[error("session runner: {0}")]
    Runner(#[from] TransportError),
}

/// 会话运行器失败信号（只触发一次）。
#[derive(Clone)]
pub struct FatalSignal {
    reason: watch::Receiver<Option<String>>,
}

impl FatalSignal {
    fn channel() -> (watch::Sender<Option<String>>, Self) {
        let (tx, reason) = watch::channel(None);
        (tx, Self { reason })
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.borrow().clone()
    }

    /// 等待失败发生；运行器正常退出时永不完成。
    pub async fn wait(mut self) -> String {
        let reason = self
            .reason
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|reason| reason.clone());
        match reason {
            Some(reason) => reason,
            None => std::future::pending().await,
        }
    }
}

/// 运行会话运行器，失败时触发 [`FatalSignal`]。
async fn supervise_runner<F>(
    run: F,
    fatal: watch::Sender<Option<String>>,
) -> Result<(), TransportError>
where
    F: Future<Output = Result<(), TransportError>>,
{
    let result = run.await;
    if let Err(err) = &result {
        error!(
            target: "edge.gateway",
            error = %err,
            storage = err.is_fatal(),
            "session_runner_failed"
        );
        fatal.send_replace(Some(err.to_string()));
    }
    result
}

struct PipelinePart {
    handle: PipelineHandle,
    source: JoinHandle<()>,
    source_stop: watch::Sender<bool>,
    reload: JoinHandle<()>,
}

/// 运行中的网关。
pub struct Gateway {
    control: GatewayControl,
    acquisition_stop: watch::Sender<bool>,
    connectors: Vec<JoinHandle<()>>,
    backpressure: JoinHandle<()>,
    health: JoinHandle<()>,
    commands: JoinHandle<()>,
    runner_stop: watch::Sender<bool>,
    runner: JoinHandle<Result<(), TransportError>>,
    fatal: FatalSignal,
    pipeline: Option<PipelinePart>,
}

fn mqtt_settings(config: &AppConfig, client_id: String) -> MqttSettings {
    let mut settings = MqttSettings::new(config.mqtt_host.clone(), config.mqtt_port, client_id);
    settings.username = config.mqtt_username.clone();
    settings.password = config.mqtt_password.clone();
    settings.keep_alive = Duration::from_secs(config.mqtt_keep_alive_seconds.max(5));
    settings.publish_timeout = Duration::from_millis(config.publish_timeout_ms.max(1));
    settings
}

fn queue_config(config: &AppConfig) -> QueueConfig {
    let policy = match config.queue_overflow {
        OverflowPolicySetting::EvictOldest => OverflowPolicy::EvictOldest,
        OverflowPolicySetting::RejectNewest => OverflowPolicy::RejectNewest,
    };
    QueueConfig::new(&config.queue_dir)
        .with_watermark(config.queue_watermark_bytes)
        .with_policy(policy)
}

fn pipeline_config(config: &AppConfig) -> PipelineConfig {
    let defaults = PipelineConfig::default();
    PipelineConfig {
        channel_capacity: config.channel_capacity,
        duplicate_window_ms: config.duplicate_window_ms,
        context_ttl: Duration::from_millis(config.context_ttl_ms),
        oee_tick: Duration::from_millis(config.oee_tick_ms.max(1)),
        telemetry_batch: BatchConfig {
            batch_size: config.sink_batch_size,
            ..defaults.telemetry_batch.clone()
        },
        ..defaults
    }
}

type Sinks = (
    Arc<dyn RecordSink<TelemetryRecord>>,
    Arc<dyn RecordSink<EventRecord>>,
);

fn sinks(config: &AppConfig) -> Sinks {
    match config.sink {
        SinkKind::Log => {
            let sink = Arc::new(LogSink);
            let telemetry: Arc<dyn RecordSink<TelemetryRecord>> = sink.clone();
            let events: Arc<dyn RecordSink<EventRecord>> = sink;
            (telemetry, events)
        }
        SinkKind::Mqtt => {
            let transport = MqttTransport::new(
                mqtt_settings(config, format!("{}-sink", config.node_id)).with_unique_suffix(),
            );
            let sink = Arc::new(MqttJsonSink::new(transport, config.sink_topic_prefix.clone()));
            let telemetry: Arc<dyn RecordSink<TelemetryRecord>> = sink.clone();
            let events: Arc<dyn RecordSink<EventRecord>> = sink;
            (telemetry, events)
        }
    }
}

impl Gateway {
    pub async fn start(config: &AppConfig) -> Result<Self, GatewayError> {
        let watcher = spawn_config_watcher(
            &config.config_file,
            Duration::from_millis(config.config_reload_ms),
        )?;
        let (version, file) = watcher.current();
        let queue = Arc::new(StoreAndForwardQueue::open(queue_config(config))?);
        info!(
            target: "edge.gateway",
            version,
            machines = file.machines.len(),
            connectors = file.connectors.len(),
            queued = queue.len(),
            "gateway_starting"
        );

        let pipeline = if config.pipeline_enabled {
            let mappings = Arc::new(StaticMappingProvider::new(file.mapping_table(version)));
            let (catalog_tx, catalog_rx) = watch::channel(Arc::new(pipeline_catalog(
                &file,
                config.fault_dedup_window_ms,
            )));
            let (telemetry, events) = sinks(config);
            let handle = PipelineRuntime::new(
                pipeline_config(config),
                mappings.clone(),
                Arc::new(NoContext),
                catalog_rx,
                telemetry,
                events,
            )
            .spawn();
            let reload = tokio::spawn(follow_reloads(
                watcher.subscribe(),
                mappings,
                catalog_tx,
                config.fault_dedup_window_ms,
            ));

            let mut source_config = SparkplugSourceConfig::new(config.group_id.clone());
            source_config.reconnect_min = Duration::from_millis(config.reconnect_min_ms);
            source_config.reconnect_max = Duration::from_millis(config.reconnect_max_ms);
            let mut source = SparkplugSource::new(
                MqttTransport::new(
                    mqtt_settings(config, format!("{}-host", config.node_id)).with_unique_suffix(),
                ),
                source_config,
            );
            let handler = Arc::new(ChannelHandler::new(handle.input()));
            let (source_stop, source_stop_rx) = watch::channel(false);
            let source = tokio::spawn(async move {
                if let Err(err) = source.run(handler, source_stop_rx).await {
                    error!(target: "edge.gateway", error = %err, "ingest_source_failed");
                }
            });
            Some(PipelinePart {
                handle,
                source,
                source_stop,
                reload,
            })
        } else {
            None
        };

        let (samples_tx, samples_rx) = mpsc::channel(config.channel_capacity);
        let (rate_tx, rate_rx) = watch::channel(RateMode::Normal);
        let (acquisition_stop, acquisition_stop_rx) = watch::channel(false);
        let (health_tx, health_rx) = mpsc::channel(64);
        let mut registry = ConnectorRegistry::default();
        let mut connectors = Vec::new();
        for entry in &file.connectors {
            let mut connector = match entry.kind {
                ConnectorKind::ModbusTcp => {
                    ModbusTcpConnector::from_value(&entry.id, &entry.settings)?
                }
                ConnectorKind::Subscription => {
                    warn!(
                        target: "edge.gateway",
                        connector_id = %entry.id,
                        "subscription_client_unavailable"
                    );
                    continue;
                }
            };
            let (control, handle) = ConnectorControl::new(
                entry.id.clone(),
                rate_rx.clone(),
                acquisition_stop_rx.clone(),
                health_tx.clone(),
            );
            if !entry.enabled {
                handle.stop();
            }
            registry.insert(handle, connector_machines(entry));
            let sink = samples_tx.clone();
            let id = entry.id.clone();
            connectors.push(tokio::spawn(async move {
                if let Err(err) = connector.run(sink, control).await {
                    error!(target: "edge.gateway", connector_id = %id, error = %err, "connector_failed");
                }
            }));
        }
        drop(health_tx);

        let backlog = samples_tx.downgrade();
        drop(samples_tx);
        let depth_queue = queue.clone();
        let coordinator = BackpressureCoordinator::new(
            BackpressureSettings {
                interval: Duration::from_millis(config.backpressure_interval_ms),
                upper: config.backpressure_upper,
                lower: config.backpressure_lower,
                delay: Duration::from_millis(config.backpressure_delay_ms),
                factor: config.backpressure_factor,
            },
            rate_tx,
        );
        let backpressure = tokio::spawn(coordinator.run(
            move || {
                let pending = backlog
                    .upgrade()
                    .map(|sender| sender.max_capacity() - sender.capacity())
                    .unwrap_or(0);
                depth_queue.len() as u64 + pending as u64
            },
            acquisition_stop_rx,
        ));

        let (requests_tx, requests_rx) = mpsc::channel(16);
        let (command_tx, command_rx) = mpsc::channel(16);
        let runner = SessionRunner::new(
            MqttTransport::new(mqtt_settings(config, config.node_id.clone())),
            EdgeNodeSession::new(config.group_id.clone(), config.node_id.clone()),
            queue,
            RunnerSettings {
                reconnect_min: Duration::from_millis(config.reconnect_min_ms),
                reconnect_max: Duration::from_millis(config.reconnect_max_ms),
                host_id: config.host_id.clone(),
                ..RunnerSettings::default()
            },
            command_tx,
        );
        let (runner_stop, runner_stop_rx) = watch::channel(false);
        let (fatal_tx, fatal) = FatalSignal::channel();
        let runner = tokio::spawn(supervise_runner(
            runner.run(samples_rx, requests_rx, runner_stop_rx),
            fatal_tx,
        ));

        let control = GatewayControl::new(
            Arc::new(registry),
            requests_tx,
            pipeline.as_ref().map(|part| part.handle.acknowledger()),
        );
        let commands = tokio::spawn(run_commands(control.clone(), command_rx));
        let health = tokio::spawn(forward_health(
            control.clone(),
            health_rx,
            pipeline.as_ref().map(|part| part.handle.events()),
        ));

        info!(
            target: "edge.gateway",
            group = %config.group_id,
            node = %config.node_id,
            connectors = connectors.len(),
            pipeline = pipeline.is_some(),
            "gateway_started"
        );
        Ok(Self {
            control,
            acquisition_stop,
            connectors,
            backpressure,
            health,
            commands,
            runner_stop,
            runner,
            fatal,
            pipeline,
        })
    }

    pub fn control(&self) -> GatewayControl {
        self.control.clone()
    }

    pub fn fatal(&self) -> FatalSignal {
        self.fatal.clone()
    }

    /// 有序停机；会话运行器以错误退出时返回该错误。
    pub async fn shutdown(self) -> Result<(), GatewayError> {
        let Gateway {
            control,
            acquisition_stop,
            connectors,
            backpressure,
            health,
            commands,
            runner_stop,
            runner,
            fatal: _,
            pipeline,
        } = self;
        drop(control);

        acquisition_stop.send_replace(true);
        for task in connectors {
            join_within(task, "connector").await;
        }
        join_within(backpressure, "backpressure").await;

        runner_stop.send_replace(true);
        let outcome = match timeout(STOP_GRACE, runner).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                error!(target: "edge.gateway", error = %err, "session_runner_panicked");
                Ok(())
            }
            Err(_) => {
                warn!(target: "edge.gateway", "session_runner_stop_timeout");
                Ok(())
            }
        };
        join_within(health, "health").await;
        join_within(commands, "commands").await;

        if let Some(part) = pipeline {
            part.source_stop.send_replace(true);
            join_within(part.source, "ingest_source").await;
            part.reload.abort();
            part.handle.shutdown(STOP_GRACE).await;
        }
        info!(target: "edge.gateway", failed = outcome.is_err(), "gateway_stopped");
        outcome.map_err(GatewayError::from)
    }
}

async fn join_within(mut task: JoinHandle<()>, name: &'static str) {
    if timeout(STOP_GRACE, &mut task).await.is_err() {
        warn!(target: "edge.gateway", task = name, "task_stop_timeout");
        task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AppConfig {
        AppConfig {
            http_addr: "127.0.0.1:0".to_string(),
            mqtt_host: "broker.local".to_string(),
            mqtt_port: 1883,
            mqtt_username: Some("edge".to_string()),
            mqtt_password: None,
            mqtt_keep_alive_seconds: 1,
            group_id: "line-1".to_string(),
            node_id: "edge-node-1".to_string(),
            host_id: None,
            queue_dir: "./data/queue".to_string(),
            queue_watermark_bytes: 1024,
            queue_overflow: OverflowPolicySetting::RejectNewest,
            publish_timeout_ms: 2_000,
            reconnect_min_ms: 2_000,
            reconnect_max_ms: 60_000,
            backpressure_interval_ms: 5_000,
            backpressure_upper: 1_000,
            backpressure_lower: 500,
            backpressure_delay_ms: 5_000,
            backpressure_factor: 8,
            pipeline_enabled: true,
            channel_capacity: 256,
            sink: SinkKind::Log,
            sink_topic_prefix: "edge/out".to_string(),
            sink_batch_size: 25,
            oee_tick_ms: 30_000,
            fault_dedup_window_ms: 300_000,
            duplicate_window_ms: 60_000,
            context_ttl_ms: 300_000,
            config_file: "gateway.json".to_string(),
            config_reload_ms: 5_000,
        }
    }

    #[test]
    fn settings_follow_app_config() {
        let config = config();
        let mqtt = mqtt_settings(&config, "edge-node-1".to_string());
        assert_eq!(mqtt.username.as_deref(), Some("edge"));
        assert_eq!(mqtt.keep_alive, Duration::from_secs(5));
        assert_eq!(mqtt.publish_timeout, Duration::from_millis(2_000));

        let queue = queue_config(&config);
        assert_eq!(queue.policy, OverflowPolicy::RejectNewest);
        assert_eq!(queue.watermark_bytes, 1024);

        let pipeline = pipeline_config(&config);
        assert_eq!(pipeline.channel_capacity, 256);
        assert_eq!(pipeline.telemetry_batch.batch_size, 25);
        assert_eq!(pipeline.oee_tick, Duration::from_secs(30));
        assert_eq!(pipeline.event_batch.batch_size, 50);
    }

    #[tokio::test]
    async fn runner_storage_failure_raises_fatal_signal() {
        let (fatal_tx, signal) = FatalSignal::channel();
        let task = tokio::spawn(supervise_runner(
            async {
                Err::<(), _>(TransportError::Buffer(BufferError::Storage(
                    "disk gone".to_string(),
                )))
            },
            fatal_tx,
        ));
        let reason = timeout(Duration::from_secs(1), signal.clone().wait())
            .await
            .expect("fatal signal");
        assert!(reason.contains("disk gone"));
        assert_eq!(signal.reason(), Some(reason));
        let result = task.await.expect("join");
        assert!(matches!(result, Err(err) if err.is_fatal()));
    }

    #[tokio::test]
    async fn clean_runner_exit_is_not_fatal() {
        let (fatal_tx, signal) = FatalSignal::channel();
        supervise_runner(async { Ok::<(), TransportError>(()) }, fatal_tx)
            .await
            .expect("clean exit");
        assert!(signal.reason().is_none());
        assert!(
            timeout(Duration::from_millis(50), signal.wait())
                .await
                .is_err()
        );
    }
}
