use domain::{
    CanonicalSignal, EventRecord, MappingTable, Quality, TagMapping, TagSample, TagValue,
    TelemetryRecord,
};
use edge_buffer::{QueueConfig, StoreAndForwardQueue};
use edge_ingest::{ChannelHandler, Source, SparkplugSource, SparkplugSourceConfig};
use edge_normalize::StaticMappingProvider;
use edge_pipeline::{
    BatchConfig, ChannelSink, NoContext, PipelineCatalog, PipelineConfig, PipelineRuntime,
};
use edge_sparkplug::EdgeNodeSession;
use edge_transport::{MemoryBroker, RunnerSettings, SessionRunner};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

const NODE: &str = "edge-node-1";
const HOST: &str = "host-app";

async fn eventually(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn raw(value: u64) -> TagSample {
    TagSample::new(
        "press-01",
        "hr:1:100",
        TagValue::UInt(value),
        Quality::Good,
        1_000 + value as i64,
    )
}

async fn collect(records: &mut mpsc::Receiver<TelemetryRecord>, count: usize) -> Vec<TelemetryRecord> {
    let mut out = Vec::with_capacity(count);
    while out.len() < count {
        let record = timeout(Duration::from_secs(10), records.recv())
            .await
            .expect("telemetry in time")
            .expect("sink open");
        out.push(record);
    }
    out
}

/// 边缘节点断网期间的采样经暂存回放后按序到达遥测 sink。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn outage_backlog_reaches_sink_in_order() {
    let broker = MemoryBroker::new();
    let dir = tempfile::tempdir().expect("tempdir");

    let mapping = TagMapping::new(
        "press-01",
        "hr:1:100",
        CanonicalSignal::parse("counter.good").expect("signal"),
    );
    let (telemetry_tx, mut telemetry_rx) = mpsc::channel::<TelemetryRecord>(4_096);
    let (events_tx, _events_rx) = mpsc::channel::<EventRecord>(1_024);
    let (_catalog_tx, catalog_rx) = watch::channel(Arc::new(PipelineCatalog::default()));
    let config = PipelineConfig {
        telemetry_batch: BatchConfig {
            batch_size: 1,
            ..BatchConfig::default()
        },
        flush_interval: Duration::from_millis(20),
        ..PipelineConfig::default()
    };
    let pipeline = PipelineRuntime::new(
        config,
        Arc::new(StaticMappingProvider::new(MappingTable::new([mapping], 1))),
        Arc::new(NoContext),
        catalog_rx,
        Arc::new(ChannelSink::new(telemetry_tx)),
        Arc::new(ChannelSink::new(events_tx)),
    )
    .spawn();

    let mut source_config = SparkplugSourceConfig::new("line-1");
    source_config.reconnect_min = Duration::from_millis(10);
    source_config.reconnect_max = Duration::from_millis(50);
    let mut source = SparkplugSource::new(broker.transport(HOST), source_config);
    let handler = Arc::new(ChannelHandler::new(pipeline.input()));
    let (source_stop, source_stop_rx) = watch::channel(false);
    let source_task = tokio::spawn(async move { source.run(handler, source_stop_rx).await });
    eventually(|| broker.is_connected(HOST)).await;

    let queue = Arc::new(StoreAndForwardQueue::open(QueueConfig::new(dir.path())).expect("queue"));
    let settings = RunnerSettings {
        reconnect_min: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(50),
        ..RunnerSettings::default()
    };
    let (command_tx, _commands) = mpsc::channel(16);
    let runner = SessionRunner::new(
        broker.transport(NODE),
        EdgeNodeSession::new("line-1", NODE),
        Arc::clone(&queue),
        settings,
        command_tx,
    );
    let (samples, sample_rx) = mpsc::channel(2_048);
    let (_requests, request_rx) = mpsc::channel(16);
    let (runner_stop, runner_stop_rx) = watch::channel(false);
    let runner_task = tokio::spawn(runner.run(sample_rx, request_rx, runner_stop_rx));
    eventually(|| broker.is_connected(NODE)).await;

    for value in 0..10 {
        samples.send(raw(value)).await.expect("send");
    }
    let live = collect(&mut telemetry_rx, 10).await;

    broker.set_client_online(NODE, false);
    for value in 10..1_010 {
        samples.send(raw(value)).await.expect("send");
    }
    eventually(|| samples.capacity() == samples.max_capacity()).await;
    eventually(|| !queue.is_empty()).await;

    broker.set_client_online(NODE, true);
    let replayed = collect(&mut telemetry_rx, 1_000).await;
    eventually(|| queue.is_empty()).await;

    let values: Vec<i64> = live
        .iter()
        .chain(replayed.iter())
        .map(|record| record.value.as_i64().expect("integer"))
        .collect();
    assert_eq!(values, (0..1_010).collect::<Vec<i64>>());
    assert!(live.iter().all(|record| !record.metadata.contains_key("historical")));
    assert!(replayed.iter().all(|record| {
        record.signal == "counter.good"
            && record.mapped
            && record.metadata.get("historical").map(String::as_str) == Some("true")
    }));

    runner_stop.send_replace(true);
    timeout(Duration::from_secs(5), runner_task)
        .await
        .expect("runner stops")
        .expect("join")
        .expect("runner result");
    source_stop.send_replace(true);
    timeout(Duration::from_secs(5), source_task)
        .await
        .expect("source stops")
        .expect("join")
        .expect("source result");
    pipeline.shutdown(Duration::from_secs(5)).await;
}
