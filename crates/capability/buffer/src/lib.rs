//! 断网续传队列。
//!
//! 传输层不可用时，待发布消息落入本队列；恢复后按入队顺序回放，
//! 只有在传输层确认（PUBACK）后才 `ack` 删除，保证至少一次送达。
//!
//! 持久化：同目录下 `queue.log` 操作日志（put / ack / evict），
//! 打开时回放，死记录占多数时压缩重写。

mod log;

use domain::now_epoch_ms;
use log::{LogRecord, OpLog};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// 队列错误。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BufferError {
    #[error("queue full: {needed} bytes needed, watermark {watermark}")]
    Full { needed: u64, watermark: u64 },
    #[error("entry too large: {0} bytes")]
    TooLarge(u64),
    #[error("storage error: {0}")]
    Storage(String),
}

/// 到达水位时的处理策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// 拒绝新消息（返回错误并计数）。
    RejectNewest,
    /// 淘汰最旧消息直到新消息可放入。
    #[default]
    EvictOldest,
}

/// 队列条目。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: u64,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub enqueued_at_ms: i64,
}

impl QueueEntry {
    /// 计入水位的字节数。
    pub fn size(&self) -> u64 {
        (self.payload.len() + self.topic.len()) as u64
    }
}

/// 入队结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub id: u64,
    /// 为腾出空间被淘汰的条目 id。
    pub evicted: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub dir: PathBuf,
    pub watermark_bytes: u64,
    pub policy: OverflowPolicy,
    /// 死记录超过该值且超过存活数时压缩。
    pub compact_min_dead: usize,
}

impl QueueConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            watermark_bytes: 500 * 1024 * 1024,
            policy: OverflowPolicy::EvictOldest,
            compact_min_dead: 4096,
        }
    }

    pub fn with_watermark(mut self, bytes: u64) -> Self {
        self.watermark_bytes = bytes;
        self
    }

    pub fn with_policy(mut self, policy: OverflowPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_compact_min_dead(mut self, dead: usize) -> Self {
        self.compact_min_dead = dead;
        self
    }
}

struct QueueState {
    entries: VecDeque<QueueEntry>,
    bytes: u64,
    next_id: u64,
    dead_records: usize,
    log: OpLog,
}

/// 磁盘持久化的 FIFO 队列（多生产者、单消费者）。
pub struct StoreAndForwardQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl StoreAndForwardQueue {
    /// 打开队列目录并回放已有日志。
    pub fn open(config: QueueConfig) -> Result<Self, BufferError> {
        let path = config.dir.join("queue.log");
        let (entries, dead_records) = log::replay(&path)?;
        let log = OpLog::open(&path)?;
        let bytes = entries.iter().map(QueueEntry::size).sum();
        let next_id = entries.last().map(|entry| entry.id + 1).unwrap_or(1);
        if !entries.is_empty() {
            info!(
                target: "edge.buffer",
                depth = entries.len(),
                bytes,
                "queue_recovered"
            );
        }
        let queue = Self {
            config,
            state: Mutex::new(QueueState {
                entries: entries.into(),
                bytes,
                next_id,
                dead_records,
                log,
            }),
            notify: Notify::new(),
        };
        {
            let mut state = queue.lock()?;
            queue.maybe_compact(&mut state)?;
            publish_gauges(&state);
        }
        Ok(queue)
    }

    /// 入队；容量不足时按策略处理，从不阻塞。
    pub fn enqueue(
        &self,
        topic: impl Into<String>,
        payload: Vec<u8>,
        qos: u8,
    ) -> Result<EnqueueOutcome, BufferError> {
        let mut state = self.lock()?;
        let entry = QueueEntry {
            id: state.next_id,
            topic: topic.into(),
            payload,
            qos,
            enqueued_at_ms: now_epoch_ms(),
        };
        let size = entry.size();
        let watermark = self.config.watermark_bytes;
        if size > watermark {
            edge_telemetry::record_queue_rejected();
            return Err(BufferError::TooLarge(size));
        }

        let mut evicted = Vec::new();
        if state.bytes + size > watermark {
            match self.config.policy {
                OverflowPolicy::RejectNewest => {
                    edge_telemetry::record_queue_rejected();
                    debug!(target: "edge.buffer", topic = %entry.topic, size, "queue_reject_newest");
                    return Err(BufferError::Full {
                        needed: size,
                        watermark,
                    });
                }
                OverflowPolicy::EvictOldest => {
                    while state.bytes + size > watermark {
                        let Some(oldest) = state.entries.pop_front() else {
                            break;
                        };
                        state.bytes -= oldest.size();
                        state.log.append(&LogRecord::Evict { id: oldest.id })?;
                        state.dead_records += 2;
                        evicted.push(oldest.id);
                    }
                    edge_telemetry::record_queue_evicted(evicted.len() as u64);
                    warn!(
                        target: "edge.buffer",
                        evicted = evicted.len(),
                        "queue_evict_oldest"
                    );
                }
            }
        }

        state.log.append(&LogRecord::put(&entry))?;
        state.next_id += 1;
        state.bytes += size;
        let id = entry.id;
        state.entries.push_back(entry);
        self.maybe_compact(&mut state)?;
        publish_gauges(&state);
        drop(state);
        self.notify.notify_one();
        Ok(EnqueueOutcome { id, evicted })
    }

    /// 按入队顺序返回最多 `max` 条待发条目（不删除）。
    pub fn drain_in_order(&self, max: usize) -> Result<Vec<QueueEntry>, BufferError> {
        let state = self.lock()?;
        Ok(state.entries.iter().take(max).cloned().collect())
    }

    /// 传输层确认后删除条目；未知 id（已淘汰）返回 false。
    pub fn ack(&self, id: u64) -> Result<bool, BufferError> {
        let mut state = self.lock()?;
        let Ok(index) = state.entries.binary_search_by_key(&id, |entry| entry.id) else {
            return Ok(false);
        };
        state.log.append(&LogRecord::Ack { id })?;
        if let Some(entry) = state.entries.remove(index) {
            state.bytes -= entry.size();
        }
        state.dead_records += 2;
        self.maybe_compact(&mut state)?;
        publish_gauges(&state);
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|state| state.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> u64 {
        self.lock().map(|state| state.bytes).unwrap_or(0)
    }

    /// 等待队列非空。
    pub async fn wait_nonempty(&self) {
        loop {
            let notified = self.notify.notified();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// 刷盘（停机前调用）。
    pub fn sync(&self) -> Result<(), BufferError> {
        let mut state = self.lock()?;
        state.log.sync()
    }

    fn maybe_compact(&self, state: &mut QueueState) -> Result<(), BufferError> {
        if state.dead_records < self.config.compact_min_dead
            || state.dead_records <= state.entries.len()
        {
            return Ok(());
        }
        let QueueState { entries, log, .. } = state;
        log.rewrite(entries.iter())?;
        debug!(
            target: "edge.buffer",
            live = state.entries.len(),
            dropped = state.dead_records,
            "queue_log_compacted"
        );
        state.dead_records = 0;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueState>, BufferError> {
        self.state
            .lock()
            .map_err(|_| BufferError::Storage("queue lock poisoned".to_string()))
    }
}

fn publish_gauges(state: &QueueState) {
    edge_telemetry::set_queue_gauges(state.entries.len() as u64, state.bytes);
}
