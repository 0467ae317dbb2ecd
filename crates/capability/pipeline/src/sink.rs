//! 输出协作方：遥测 sink 与事件 sink。
//!
//! - `ChannelSink`：写入有界通道（测试与进程内消费者）
//! - `LogSink`：写 tracing 日志
//! - `MqttJsonSink`：按机台发布 JSON 到 MQTT
//! - `BatchWriter`：攒批、失败重试、回灌缓冲，缓冲满时淘汰最旧记录

use crate::PipelineError;
use async_trait::async_trait;
use domain::{EventRecord, TelemetryRecord};
use edge_transport::{Transport, TransportEvent};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

/// 记录写入抽象。
#[async_trait]
pub trait RecordSink<R: Send + Sync + 'static>: Send + Sync {
    async fn write_batch(&self, records: &[R]) -> Result<(), PipelineError>;
}

pub type SharedTelemetrySink = Arc<dyn RecordSink<TelemetryRecord>>;
pub type SharedEventSink = Arc<dyn RecordSink<EventRecord>>;

/// 写入有界通道。
#[derive(Debug)]
pub struct ChannelSink<R> {
    sender: mpsc::Sender<R>,
}

impl<R> ChannelSink<R> {
    pub fn new(sender: mpsc::Sender<R>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl<R: Clone + Send + Sync + 'static> RecordSink<R> for ChannelSink<R> {
    async fn write_batch(&self, records: &[R]) -> Result<(), PipelineError> {
        for record in records {
            self.sender
                .send(record.clone())
                .await
                .map_err(|_| PipelineError::Sink("channel closed".to_string()))?;
        }
        Ok(())
    }
}

/// 写 tracing 日志。
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl RecordSink<TelemetryRecord> for LogSink {
    async fn write_batch(&self, records: &[TelemetryRecord]) -> Result<(), PipelineError> {
        for record in records {
            info!(
                target: "edge.pipeline.sink",
                machine_id = %record.machine_id,
                signal = %record.signal,
                value = %record.value,
                quality = record.quality.as_str(),
                ts_ms = record.ts_ms,
                "telemetry_record"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl RecordSink<EventRecord> for LogSink {
    async fn write_batch(&self, records: &[EventRecord]) -> Result<(), PipelineError> {
        for record in records {
            let body = serde_json::to_string(record)
                .map_err(|err| PipelineError::Sink(err.to_string()))?;
            info!(
                target: "edge.pipeline.sink",
                kind = record.kind(),
                machine_id = record.machine_id().unwrap_or("-"),
                body = %body,
                "event_record"
            );
        }
        Ok(())
    }
}

struct MqttSinkState<T> {
    transport: T,
    link: Option<mpsc::Receiver<TransportEvent>>,
}

/// MQTT JSON 输出：遥测按机台成批发布到 `{prefix}/telemetry/{machine}`，
/// 事件发布到 `{prefix}/events/{kind}[/{machine}]`。QoS 1，不保留。
pub struct MqttJsonSink<T: Transport> {
    prefix: String,
    state: Mutex<MqttSinkState<T>>,
}

impl<T: Transport> MqttJsonSink<T> {
    pub fn new(transport: T, prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
            state: Mutex::new(MqttSinkState {
                transport,
                link: None,
            }),
        }
    }

    async fn publish_all(&self, messages: Vec<(String, Vec<u8>)>) -> Result<(), PipelineError> {
        let mut state = self.state.lock().await;
        let lost = match state.link.as_mut() {
            None => true,
            Some(link) => loop {
                match link.try_recv() {
                    Ok(TransportEvent::Disconnected(_)) => break true,
                    Ok(TransportEvent::Message(_)) => continue,
                    Err(mpsc::error::TryRecvError::Empty) => break false,
                    Err(mpsc::error::TryRecvError::Disconnected) => break true,
                }
            },
        };
        if lost {
            state.link = None;
            let link = state
                .transport
                .connect(None)
                .await
                .map_err(|err| PipelineError::Sink(err.to_string()))?;
            state.link = Some(link);
        }
        for (topic, payload) in messages {
            if let Err(err) = state.transport.publish(&topic, &payload, 1, false).await {
                state.link = None;
                return Err(PipelineError::Sink(err.to_string()));
            }
        }
        Ok(())
    }
}

fn json<S: Serialize + ?Sized>(value: &S) -> Result<Vec<u8>, PipelineError> {
    serde_json::to_vec(value).map_err(|err| PipelineError::Sink(err.to_string()))
}

#[async_trait]
impl<T: Transport + 'static> RecordSink<TelemetryRecord> for MqttJsonSink<T> {
    async fn write_batch(&self, records: &[TelemetryRecord]) -> Result<(), PipelineError> {
        let mut by_machine: BTreeMap<&str, Vec<&TelemetryRecord>> = BTreeMap::new();
        for record in records {
            by_machine
                .entry(record.machine_id.as_str())
                .or_default()
                .push(record);
        }
        let mut messages = Vec::with_capacity(by_machine.len());
        for (machine_id, batch) in by_machine {
            messages.push((
                format!("{}/telemetry/{}", self.prefix, machine_id),
                json(&batch)?,
            ));
        }
        self.publish_all(messages).await
    }
}

#[async_trait]
impl<T: Transport + 'static> RecordSink<EventRecord> for MqttJsonSink<T> {
    async fn write_batch(&self, records: &[EventRecord]) -> Result<(), PipelineError> {
        let mut messages = Vec::with_capacity(records.len());
        for record in records {
            let topic = match record.machine_id() {
                Some(machine_id) => format!("{}/events/{}/{}", self.prefix, record.kind(), machine_id),
                None => format!("{}/events/{}", self.prefix, record.kind()),
            };
            messages.push((topic, json(record)?));
        }
        self.publish_all(messages).await
    }
}

/// 攒批参数。
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub max_buffer_size: usize,
    pub max_retries: usize,
    pub retry_delay: Duration,
    pub write_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_buffer_size: 10_000,
            max_retries: 3,
            retry_delay: Duration::from_millis(200),
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl BatchConfig {
    fn sanitized(mut self) -> Self {
        if self.batch_size == 0 {
            self.batch_size = 1;
        }
        if self.max_buffer_size < self.batch_size {
            self.max_buffer_size = self.batch_size;
        }
        self
    }
}

/// 攒批写入器（由单个任务独占）。
///
/// 写失败的批次回灌到缓冲头部，下一次刷新按原顺序重试。
pub struct BatchWriter<R: Send + Sync + 'static> {
    sink: Arc<dyn RecordSink<R>>,
    config: BatchConfig,
    buffer: VecDeque<R>,
    name: &'static str,
}

impl<R: Send + Sync + 'static> BatchWriter<R> {
    pub fn new(name: &'static str, sink: Arc<dyn RecordSink<R>>, config: BatchConfig) -> Self {
        Self {
            sink,
            config: config.sanitized(),
            buffer: VecDeque::new(),
            name,
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// 追加一条；攒满一批时立即写出。
    pub async fn push(&mut self, record: R) -> Result<(), PipelineError> {
        if self.buffer.len() >= self.config.max_buffer_size {
            self.buffer.pop_front();
            edge_telemetry::record_write_failure();
            warn!(target: "edge.pipeline", sink = self.name, "sink_buffer_full_oldest_dropped");
        }
        self.buffer.push_back(record);
        if self.buffer.len() >= self.config.batch_size {
            return self.flush().await;
        }
        Ok(())
    }

    /// 写出缓冲内全部记录。
    pub async fn flush(&mut self) -> Result<(), PipelineError> {
        while !self.buffer.is_empty() {
            let take = self.buffer.len().min(self.config.batch_size);
            let batch: Vec<R> = self.buffer.drain(..take).collect();
            if let Err(err) = self.write_with_retry(&batch).await {
                for record in batch.into_iter().rev() {
                    self.buffer.push_front(record);
                }
                while self.buffer.len() > self.config.max_buffer_size {
                    self.buffer.pop_front();
                    edge_telemetry::record_write_failure();
                }
                return Err(err);
            }
            edge_telemetry::record_write_success(batch.len() as u64);
        }
        Ok(())
    }

    async fn write_with_retry(&self, batch: &[R]) -> Result<(), PipelineError> {
        let mut attempt = 0;
        loop {
            let result = tokio::time::timeout(self.config.write_timeout, self.sink.write_batch(batch))
                .await
                .unwrap_or_else(|_| Err(PipelineError::Sink("write timed out".to_string())));
            match result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    attempt += 1;
                    edge_telemetry::record_write_failure();
                    if attempt > self.config.max_retries {
                        warn!(
                            target: "edge.pipeline",
                            sink = self.name,
                            records = batch.len(),
                            error = %err,
                            "sink_write_failed"
                        );
                        return Err(err);
                    }
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{Quality, TagValue};
    use edge_transport::MemoryBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        batches: std::sync::Mutex<Vec<Vec<u32>>>,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl RecordSink<u32> for CountingSink {
        async fn write_batch(&self, records: &[u32]) -> Result<(), PipelineError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
            {
                return Err(PipelineError::Sink("forced failure".to_string()));
            }
            self.batches
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(records.to_vec());
            Ok(())
        }
    }

    fn config(batch_size: usize, max_buffer_size: usize, max_retries: usize) -> BatchConfig {
        BatchConfig {
            batch_size,
            max_buffer_size,
            max_retries,
            retry_delay: Duration::from_millis(1),
            write_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn writes_full_batches() {
        let sink = Arc::new(CountingSink::default());
        let mut writer = BatchWriter::new("test", sink.clone(), config(2, 10, 0));
        writer.push(1).await.expect("queued");
        writer.push(2).await.expect("written");
        writer.push(3).await.expect("queued");
        assert_eq!(writer.pending(), 1);
        writer.flush().await.expect("flushed");
        let batches = sink.batches.lock().expect("lock").clone();
        assert_eq!(batches, vec![vec![1, 2], vec![3]]);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let sink = Arc::new(CountingSink {
            failures_left: AtomicUsize::new(2),
            ..CountingSink::default()
        });
        let mut writer = BatchWriter::new("test", sink.clone(), config(1, 10, 3));
        writer.push(7).await.expect("written after retries");
        assert_eq!(sink.batches.lock().expect("lock").clone(), vec![vec![7]]);
    }

    #[tokio::test]
    async fn failed_batch_is_requeued_in_order() {
        let sink = Arc::new(CountingSink {
            failures_left: AtomicUsize::new(1),
            ..CountingSink::default()
        });
        let mut writer = BatchWriter::new("test", sink.clone(), config(2, 10, 0));
        writer.push(1).await.expect("queued");
        writer.push(2).await.expect_err("write failure");
        assert_eq!(writer.pending(), 2);
        writer.push(3).await.expect("written");
        writer.flush().await.expect("flushed");
        let delivered: Vec<u32> = sink
            .batches
            .lock()
            .expect("lock")
            .iter()
            .flatten()
            .copied()
            .collect();
        assert_eq!(delivered, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn mqtt_sink_publishes_per_machine() {
        let broker = MemoryBroker::new();
        let sink = MqttJsonSink::new(broker.transport("sink"), "plant/");
        let record = |machine: &str, value: i64| TelemetryRecord {
            machine_id: machine.to_string(),
            signal: "counter.good".to_string(),
            kind: None,
            mapped: true,
            value: TagValue::Int(value),
            quality: Quality::Good,
            ts_ms: 1,
            metadata: BTreeMap::new(),
        };
        RecordSink::<TelemetryRecord>::write_batch(
            &sink,
            &[record("press-01", 1), record("press-02", 2), record("press-01", 3)],
        )
        .await
        .expect("publish");

        let published = broker.published_matching("plant/telemetry/#");
        assert_eq!(published.len(), 2);
        let first: serde_json::Value =
            serde_json::from_slice(&published[0].payload).expect("json");
        assert_eq!(published[0].topic, "plant/telemetry/press-01");
        assert_eq!(first.as_array().map(Vec::len), Some(2));
    }
}
