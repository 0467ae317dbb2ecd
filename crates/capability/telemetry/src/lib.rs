//! 追踪初始化与网关运行指标。

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use tracing_subscriber::{EnvFilter, fmt};

/// 流水线阶段（延迟统计维度）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Decode,
    Normalize,
    Enrich,
    Validate,
    Route,
    Sink,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencySnapshot {
    pub total_ms: u64,
    pub count: u64,
    pub max_ms: u64,
}

/// 指标快照（`GET /metrics` 响应体）。
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub samples_acquired: u64,
    pub samples_published: u64,
    pub messages_replayed: u64,
    pub publish_failures: u64,
    pub inbound_dropped: u64,
    pub decode_errors: u64,
    pub normalized_values: u64,
    pub dropped_deadband: u64,
    pub dropped_quality: u64,
    pub dropped_duplicate: u64,
    pub passed_unmapped: u64,
    pub out_of_range: u64,
    pub queue_rejected: u64,
    pub queue_evicted: u64,
    pub write_success: u64,
    pub write_failure: u64,
    pub rebirth_requests: u64,
    pub backpressure_activations: u64,
    pub events_emitted: u64,
    pub queue_depth: u64,
    pub queue_bytes: u64,
    pub active_faults: u64,
    pub transport_connected: bool,
    pub throttled: bool,
    pub connectors: BTreeMap<String, bool>,
    pub oee: BTreeMap<String, f64>,
    pub stage_latency: BTreeMap<Stage, LatencySnapshot>,
}

#[derive(Default)]
struct KeyedState {
    connectors: HashMap<String, bool>,
    oee: HashMap<String, f64>,
    stage_latency: HashMap<Stage, LatencySnapshot>,
}

/// 全局运行指标。
#[derive(Default)]
pub struct TelemetryMetrics {
    samples_acquired: AtomicU64,
    samples_published: AtomicU64,
    messages_replayed: AtomicU64,
    publish_failures: AtomicU64,
    inbound_dropped: AtomicU64,
    decode_errors: AtomicU64,
    normalized_values: AtomicU64,
    dropped_deadband: AtomicU64,
    dropped_quality: AtomicU64,
    dropped_duplicate: AtomicU64,
    passed_unmapped: AtomicU64,
    out_of_range: AtomicU64,
    queue_rejected: AtomicU64,
    queue_evicted: AtomicU64,
    write_success: AtomicU64,
    write_failure: AtomicU64,
    rebirth_requests: AtomicU64,
    backpressure_activations: AtomicU64,
    events_emitted: AtomicU64,
    queue_depth: AtomicU64,
    queue_bytes: AtomicU64,
    active_faults: AtomicU64,
    transport_connected: AtomicU64,
    throttled: AtomicU64,
    keyed: Mutex<KeyedState>,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (connectors, oee, stage_latency) = match self.keyed.lock() {
            Ok(keyed) => (
                keyed
                    .connectors
                    .iter()
                    .map(|(k, v)| (k.clone(), *v))
                    .collect(),
                keyed.oee.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                keyed.stage_latency.iter().map(|(k, v)| (*k, *v)).collect(),
            ),
            Err(_) => Default::default(),
        };
        MetricsSnapshot {
            samples_acquired: self.samples_acquired.load(Ordering::Relaxed),
            samples_published: self.samples_published.load(Ordering::Relaxed),
            messages_replayed: self.messages_replayed.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            inbound_dropped: self.inbound_dropped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            normalized_values: self.normalized_values.load(Ordering::Relaxed),
            dropped_deadband: self.dropped_deadband.load(Ordering::Relaxed),
            dropped_quality: self.dropped_quality.load(Ordering::Relaxed),
            dropped_duplicate: self.dropped_duplicate.load(Ordering::Relaxed),
            passed_unmapped: self.passed_unmapped.load(Ordering::Relaxed),
            out_of_range: self.out_of_range.load(Ordering::Relaxed),
            queue_rejected: self.queue_rejected.load(Ordering::Relaxed),
            queue_evicted: self.queue_evicted.load(Ordering::Relaxed),
            write_success: self.write_success.load(Ordering::Relaxed),
            write_failure: self.write_failure.load(Ordering::Relaxed),
            rebirth_requests: self.rebirth_requests.load(Ordering::Relaxed),
            backpressure_activations: self.backpressure_activations.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            queue_bytes: self.queue_bytes.load(Ordering::Relaxed),
            active_faults: self.active_faults.load(Ordering::Relaxed),
            transport_connected: self.transport_connected.load(Ordering::Relaxed) != 0,
            throttled: self.throttled.load(Ordering::Relaxed) != 0,
            connectors,
            oee,
            stage_latency,
        }
    }

    fn with_keyed(&self, f: impl FnOnce(&mut KeyedState)) {
        // 锁中毒时仍沿用内部数据；指标不应中断业务。
        let mut guard = match self.keyed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 记录采集样本数。
pub fn record_samples_acquired(count: u64) {
    metrics()
        .samples_acquired
        .fetch_add(count, Ordering::Relaxed);
}

/// 记录已确认发布的数据消息数。
pub fn record_samples_published(count: u64) {
    metrics()
        .samples_published
        .fetch_add(count, Ordering::Relaxed);
}

/// 记录断网续传回放消息数。
pub fn record_message_replayed() {
    metrics().messages_replayed.fetch_add(1, Ordering::Relaxed);
}

pub fn record_publish_failure() {
    metrics().publish_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录入站消息因消费方积压而丢弃，返回累计数。
pub fn record_inbound_dropped() -> u64 {
    metrics().inbound_dropped.fetch_add(1, Ordering::Relaxed) + 1
}

/// 记录解码失败（整条消息丢弃）。
pub fn record_decode_error() {
    metrics().decode_errors.fetch_add(1, Ordering::Relaxed);
}

pub fn record_normalized_value() {
    metrics().normalized_values.fetch_add(1, Ordering::Relaxed);
}

pub fn record_dropped_deadband() {
    metrics().dropped_deadband.fetch_add(1, Ordering::Relaxed);
}

pub fn record_dropped_quality() {
    metrics().dropped_quality.fetch_add(1, Ordering::Relaxed);
}

pub fn record_dropped_duplicate() {
    metrics().dropped_duplicate.fetch_add(1, Ordering::Relaxed);
}

/// 记录未映射透传次数。
pub fn record_passed_unmapped() {
    metrics().passed_unmapped.fetch_add(1, Ordering::Relaxed);
}

pub fn record_out_of_range() {
    metrics().out_of_range.fetch_add(1, Ordering::Relaxed);
}

/// 记录队列拒绝（reject-newest）次数。
pub fn record_queue_rejected() {
    metrics().queue_rejected.fetch_add(1, Ordering::Relaxed);
}

/// 记录队列淘汰（evict-oldest）条数。
pub fn record_queue_evicted(count: u64) {
    metrics().queue_evicted.fetch_add(count, Ordering::Relaxed);
}

pub fn record_write_success(count: u64) {
    metrics().write_success.fetch_add(count, Ordering::Relaxed);
}

pub fn record_write_failure() {
    metrics().write_failure.fetch_add(1, Ordering::Relaxed);
}

pub fn record_rebirth_request() {
    metrics().rebirth_requests.fetch_add(1, Ordering::Relaxed);
}

pub fn record_backpressure_activation() {
    metrics()
        .backpressure_activations
        .fetch_add(1, Ordering::Relaxed);
}

pub fn record_event_emitted() {
    metrics().events_emitted.fetch_add(1, Ordering::Relaxed);
}

/// 更新队列深度与字节数。
pub fn set_queue_gauges(depth: u64, bytes: u64) {
    let metrics = metrics();
    metrics.queue_depth.store(depth, Ordering::Relaxed);
    metrics.queue_bytes.store(bytes, Ordering::Relaxed);
}

pub fn adjust_active_faults(delta: i64) {
    let counter = &metrics().active_faults;
    if delta >= 0 {
        counter.fetch_add(delta as u64, Ordering::Relaxed);
    } else {
        let dec = delta.unsigned_abs();
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
            Some(current.saturating_sub(dec))
        });
    }
}

pub fn set_transport_connected(connected: bool) {
    metrics()
        .transport_connected
        .store(u64::from(connected), Ordering::Relaxed);
}

pub fn set_throttled(throttled: bool) {
    metrics()
        .throttled
        .store(u64::from(throttled), Ordering::Relaxed);
}

/// 记录连接器在线状态。
pub fn set_connector_up(connector_id: &str, up: bool) {
    metrics().with_keyed(|keyed| {
        keyed.connectors.insert(connector_id.to_string(), up);
    });
}

/// 记录机台最新 OEE。
pub fn set_machine_oee(machine_id: &str, oee: f64) {
    metrics().with_keyed(|keyed| {
        keyed.oee.insert(machine_id.to_string(), oee);
    });
}

/// 记录阶段处理延迟（毫秒）。
pub fn record_stage_latency_ms(stage: Stage, latency_ms: u64) {
    metrics().with_keyed(|keyed| {
        let entry = keyed.stage_latency.entry(stage).or_default();
        entry.total_ms = entry.total_ms.saturating_add(latency_ms);
        entry.count += 1;
        entry.max_ms = entry.max_ms.max(latency_ms);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyed_metrics_show_in_snapshot() {
        let metrics = TelemetryMetrics::new();
        metrics.with_keyed(|keyed| {
            keyed.connectors.insert("plc-1".to_string(), true);
            keyed.oee.insert("press-01".to_string(), 0.7);
        });
        metrics.samples_acquired.fetch_add(3, Ordering::Relaxed);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.samples_acquired, 3);
        assert_eq!(snapshot.connectors.get("plc-1"), Some(&true));
        assert_eq!(snapshot.oee.get("press-01"), Some(&0.7));
    }

    #[test]
    fn active_faults_never_underflow() {
        adjust_active_faults(-5);
        adjust_active_faults(2);
        adjust_active_faults(-1);
        assert!(metrics().snapshot().active_faults <= 1);
    }

    #[test]
    fn stage_latency_accumulates() {
        record_stage_latency_ms(Stage::Decode, 4);
        record_stage_latency_ms(Stage::Decode, 10);
        let snapshot = metrics().snapshot();
        let decode = snapshot.stage_latency.get(&Stage::Decode).copied().unwrap_or_default();
        assert!(decode.count >= 2);
        assert!(decode.max_ms >= 10);
        let json = serde_json::to_value(&snapshot).expect("json");
        assert!(json["stage_latency"]["decode"].is_object());
    }
}
