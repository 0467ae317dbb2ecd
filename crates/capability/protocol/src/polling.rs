//! 轮询型连接器
//!
//! 点位按 (从站, 寄存器区, 周期等级) 合并为读批次，单批不超过 PDU 上限。
//! 链路故障按指数退避重连；连续失败达到阈值后状态转为 Down，
//! 此后每个周期为所有到期点位产出 Bad 质量样本，直到恢复。

use crate::backoff::Backoff;
use crate::byte_order::{decode_registers, encode_value};
use crate::connector::{
    Connector, ConnectorControl, ConnectorHealthEvent, HealthKind, WriteRequest,
};
use crate::error::ConnectorError;
use crate::types::{CycleClass, PollTag, RegisterAddress, RegisterTable};
use async_trait::async_trait;
use domain::{now_epoch_ms, Quality, TagSample};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 寄存器读写抽象（Modbus TCP 或测试脚本）。位区以 0/1 表示。
#[async_trait]
pub trait RegisterReader: Send {
    async fn connect(&mut self) -> Result<(), ConnectorError>;

    async fn read(
        &mut self,
        unit_id: u8,
        table: RegisterTable,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ConnectorError>;

    async fn write(
        &mut self,
        unit_id: u8,
        table: RegisterTable,
        start: u16,
        values: &[u16],
    ) -> Result<(), ConnectorError>;

    async fn disconnect(&mut self);
}

/// 轮询配置
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PollingSettings {
    #[serde(default = "default_fast_cycle")]
    pub fast_cycle_ms: u64,
    #[serde(default = "default_slow_cycle")]
    pub slow_cycle_ms: u64,
    /// 连续失败多少次后判定为 Down
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_retry_base")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_cap")]
    pub retry_cap_ms: u64,
    /// 连接、读、写的单次超时
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,
    #[serde(default)]
    pub tags: Vec<PollTag>,
}

fn default_fast_cycle() -> u64 {
    100
}

fn default_slow_cycle() -> u64 {
    1000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_retry_base() -> u64 {
    500
}

fn default_retry_cap() -> u64 {
    30_000
}

fn default_io_timeout() -> u64 {
    3000
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            fast_cycle_ms: default_fast_cycle(),
            slow_cycle_ms: default_slow_cycle(),
            failure_threshold: default_failure_threshold(),
            retry_base_ms: default_retry_base(),
            retry_cap_ms: default_retry_cap(),
            io_timeout_ms: default_io_timeout(),
            tags: Vec::new(),
        }
    }
}

/// 一次读请求覆盖的寄存器区间及其包含的点位下标。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBatch {
    pub unit_id: u8,
    pub table: RegisterTable,
    pub cycle: CycleClass,
    pub start: u16,
    pub count: u16,
    pub tags: Vec<usize>,
}

#[derive(Debug, Clone)]
struct ResolvedTag {
    tag: PollTag,
    address: RegisterAddress,
}

impl ResolvedTag {
    fn width(&self) -> u16 {
        if self.address.table.is_bit() {
            1
        } else {
            self.tag.data_type.register_count()
        }
    }
}

fn plan_batches(tags: &[ResolvedTag]) -> Vec<ReadBatch> {
    let mut groups: BTreeMap<(u8, RegisterTable, u8), Vec<usize>> = BTreeMap::new();
    for (index, tag) in tags.iter().enumerate() {
        let cycle = match tag.tag.cycle {
            CycleClass::Fast => 0,
            CycleClass::Slow => 1,
        };
        groups
            .entry((tag.address.unit_id, tag.address.table, cycle))
            .or_default()
            .push(index);
    }

    let mut batches = Vec::new();
    for ((unit_id, table, _), mut indices) in groups {
        indices.sort_by_key(|index| tags[*index].address.register);
        let max = u32::from(table.max_batch());
        let mut current: Option<ReadBatch> = None;
        for index in indices {
            let tag = &tags[index];
            let start = tag.address.register;
            let end = u32::from(start) + u32::from(tag.width());
            match current.as_mut() {
                Some(batch) if end - u32::from(batch.start) <= max => {
                    let span = (end - u32::from(batch.start)) as u16;
                    batch.count = batch.count.max(span);
                    batch.tags.push(index);
                }
                _ => {
                    if let Some(done) = current.take() {
                        batches.push(done);
                    }
                    current = Some(ReadBatch {
                        unit_id,
                        table,
                        cycle: tag.tag.cycle,
                        start,
                        count: tag.width(),
                        tags: vec![index],
                    });
                }
            }
        }
        if let Some(done) = current {
            batches.push(done);
        }
    }
    batches
}

async fn with_timeout<T>(
    limit: Duration,
    what: &str,
    operation: impl Future<Output = Result<T, ConnectorError>>,
) -> Result<T, ConnectorError> {
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(ConnectorError::Timeout(format!(
            "{} exceeded {} ms",
            what,
            limit.as_millis()
        ))),
    }
}

/// 轮询型连接器
pub struct PollingConnector<R: RegisterReader> {
    id: String,
    reader: R,
    settings: PollingSettings,
    tags: Vec<ResolvedTag>,
    batches: Vec<ReadBatch>,
    connected: bool,
    down: bool,
    announced_up: bool,
    consecutive_failures: u32,
    backoff: Backoff,
    retry_at: Option<Instant>,
    pending_writes: VecDeque<WriteRequest>,
}

impl<R: RegisterReader> PollingConnector<R> {
    pub fn new(
        id: impl Into<String>,
        reader: R,
        settings: PollingSettings,
    ) -> Result<Self, ConnectorError> {
        let tags = settings
            .tags
            .iter()
            .map(|tag| {
                Ok(ResolvedTag {
                    address: tag.register_address()?,
                    tag: tag.clone(),
                })
            })
            .collect::<Result<Vec<_>, ConnectorError>>()?;
        let batches = plan_batches(&tags);
        let backoff = Backoff::new(
            Duration::from_millis(settings.retry_base_ms),
            Duration::from_millis(settings.retry_cap_ms),
        );
        Ok(Self {
            id: id.into(),
            reader,
            settings,
            tags,
            batches,
            connected: false,
            down: false,
            announced_up: false,
            consecutive_failures: 0,
            backoff,
            retry_at: None,
            pending_writes: VecDeque::new(),
        })
    }

    pub fn batches(&self) -> &[ReadBatch] {
        &self.batches
    }

    pub fn is_down(&self) -> bool {
        self.down
    }

    pub fn pending_writes(&self) -> usize {
        self.pending_writes.len()
    }

    fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.io_timeout_ms)
    }

    fn on_failure(&mut self, err: &ConnectorError, control: &ConnectorControl) {
        self.connected = false;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = self.backoff.next_delay();
        self.retry_at = Some(Instant::now() + delay);
        warn!(
            target: "edge.protocol",
            connector = %self.id,
            failures = self.consecutive_failures,
            retry_in_ms = delay.as_millis() as u64,
            error = %err,
            "connector_io_failed"
        );
        if self.consecutive_failures >= self.settings.failure_threshold && !self.down {
            self.down = true;
            self.announced_up = false;
            edge_telemetry::set_connector_up(&self.id, false);
            control.report(ConnectorHealthEvent::new(
                self.id.clone(),
                HealthKind::Down {
                    reason: err.to_string(),
                },
            ));
        }
    }

    fn on_success(&mut self, control: &ConnectorControl) {
        self.consecutive_failures = 0;
        self.backoff.reset();
        self.retry_at = None;
        if self.down || !self.announced_up {
            self.down = false;
            self.announced_up = true;
            edge_telemetry::set_connector_up(&self.id, true);
            info!(target: "edge.protocol", connector = %self.id, "connector_up");
            control.report(ConnectorHealthEvent::new(self.id.clone(), HealthKind::Up));
        }
    }

    async fn ensure_connected(&mut self, control: &ConnectorControl) -> bool {
        if self.connected {
            return true;
        }
        if let Some(at) = self.retry_at {
            if Instant::now() < at {
                return false;
            }
        }
        let limit = self.io_timeout();
        match with_timeout(limit, "connect", self.reader.connect()).await {
            Ok(()) => {
                self.connected = true;
                self.retry_at = None;
                debug!(target: "edge.protocol", connector = %self.id, "connector_connected");
                true
            }
            Err(err) => {
                self.on_failure(&err, control);
                false
            }
        }
    }

    async fn drop_link(&mut self) {
        self.connected = false;
        self.reader.disconnect().await;
    }

    /// 依次执行排队的写请求；链路故障时保留剩余请求待下次重试。
    async fn flush_writes(&mut self, control: &ConnectorControl) {
        while self.connected {
            let Some(request) = self.pending_writes.front().cloned() else {
                break;
            };
            let target = self
                .tags
                .iter()
                .find(|tag| tag.tag.address == request.address)
                .map(|tag| (tag.address, tag.tag.data_type, tag.tag.byte_order));
            let prepared = match target {
                None => Err(ConnectorError::ConfigParse("address not configured".to_string())),
                Some((address, _, _)) if !address.table.is_writable() || address.bit.is_some() => {
                    Err(ConnectorError::ConfigParse("address is read-only".to_string()))
                }
                Some((address, data_type, byte_order)) => {
                    encode_value(&request.value, data_type, byte_order).map(|words| (address, words))
                }
            };
            let (address, words) = match prepared {
                Ok(prepared) => prepared,
                Err(err) => {
                    self.pending_writes.pop_front();
                    self.reject_write(&request, &err, control);
                    continue;
                }
            };

            let limit = self.io_timeout();
            let result = with_timeout(
                limit,
                "write",
                self.reader
                    .write(address.unit_id, address.table, address.register, &words),
            )
            .await;
            match result {
                Ok(()) => {
                    self.pending_writes.pop_front();
                    edge_telemetry::record_write_success(1);
                    info!(
                        target: "edge.protocol",
                        connector = %self.id,
                        address = %request.address,
                        value = %request.value,
                        "connector_write_applied"
                    );
                }
                Err(err) if err.is_transient() => {
                    self.on_failure(&err, control);
                    self.drop_link().await;
                }
                Err(err) => {
                    self.pending_writes.pop_front();
                    self.reject_write(&request, &err, control);
                }
            }
        }
    }

    fn reject_write(&self, request: &WriteRequest, err: &ConnectorError, control: &ConnectorControl) {
        edge_telemetry::record_write_failure();
        warn!(
            target: "edge.protocol",
            connector = %self.id,
            address = %request.address,
            error = %err,
            "connector_write_rejected"
        );
        control.report(ConnectorHealthEvent::new(
            self.id.clone(),
            HealthKind::WriteFailed {
                address: request.address.clone(),
                error: err.to_string(),
            },
        ));
    }

    fn bad_samples(&self, classes: &[CycleClass], ts_ms: i64) -> Vec<TagSample> {
        self.tags
            .iter()
            .filter(|tag| classes.contains(&tag.tag.cycle))
            .map(|tag| TagSample::bad(tag.tag.machine_id.clone(), tag.tag.address.clone(), ts_ms))
            .collect()
    }

    /// 执行一次采集周期，返回产出的样本。
    async fn poll(&mut self, classes: &[CycleClass], control: &ConnectorControl) -> Vec<TagSample> {
        if !self.ensure_connected(control).await {
            return if self.down {
                self.bad_samples(classes, now_epoch_ms())
            } else {
                Vec::new()
            };
        }
        self.flush_writes(control).await;
        if !self.connected {
            return if self.down {
                self.bad_samples(classes, now_epoch_ms())
            } else {
                Vec::new()
            };
        }

        let mut samples = Vec::new();
        let mut any_read = false;
        let limit = self.io_timeout();
        for batch_index in 0..self.batches.len() {
            if !classes.contains(&self.batches[batch_index].cycle) {
                continue;
            }
            let (unit_id, table, start, count) = {
                let batch = &self.batches[batch_index];
                (batch.unit_id, batch.table, batch.start, batch.count)
            };
            let result =
                with_timeout(limit, "read", self.reader.read(unit_id, table, start, count)).await;
            let ts_ms = now_epoch_ms();
            match result {
                Ok(registers) => {
                    any_read = true;
                    for &tag_index in &self.batches[batch_index].tags {
                        let tag = &self.tags[tag_index];
                        let offset = (tag.address.register - start) as usize;
                        let width = tag.width() as usize;
                        let decoded = match registers.get(offset..offset + width) {
                            Some(slice) => decode_registers(
                                slice,
                                tag.tag.data_type,
                                tag.tag.byte_order,
                                tag.address.bit,
                            ),
                            None => Err(ConnectorError::DataParse(format!(
                                "short read: {} registers",
                                registers.len()
                            ))),
                        };
                        match decoded {
                            Ok(value) => samples.push(TagSample::new(
                                tag.tag.machine_id.clone(),
                                tag.tag.address.clone(),
                                value,
                                Quality::Good,
                                ts_ms,
                            )),
                            Err(err) => {
                                control.report(ConnectorHealthEvent::new(
                                    self.id.clone(),
                                    HealthKind::TagError {
                                        address: tag.tag.address.clone(),
                                        error: err.to_string(),
                                    },
                                ));
                                samples.push(TagSample::bad(
                                    tag.tag.machine_id.clone(),
                                    tag.tag.address.clone(),
                                    ts_ms,
                                ));
                            }
                        }
                    }
                }
                Err(err) if err.is_transient() => {
                    self.on_failure(&err, control);
                    self.drop_link().await;
                    if self.down {
                        return self.bad_samples(classes, ts_ms);
                    }
                    return samples;
                }
                Err(err) => {
                    // 设备应答了异常码：链路正常，本批点位无可信值
                    any_read = true;
                    warn!(
                        target: "edge.protocol",
                        connector = %self.id,
                        unit = unit_id,
                        start,
                        count,
                        error = %err,
                        "connector_device_exception"
                    );
                    control.report(ConnectorHealthEvent::new(
                        self.id.clone(),
                        HealthKind::DeviceFault {
                            diagnostic: err.to_string(),
                        },
                    ));
                    for &tag_index in &self.batches[batch_index].tags {
                        let tag = &self.tags[tag_index];
                        samples.push(TagSample::bad(
                            tag.tag.machine_id.clone(),
                            tag.tag.address.clone(),
                            ts_ms,
                        ));
                    }
                }
            }
        }
        if any_read {
            self.on_success(control);
        }
        samples
    }
}

#[async_trait]
impl<R: RegisterReader> Connector for PollingConnector<R> {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(
        &mut self,
        sink: mpsc::Sender<TagSample>,
        mut control: ConnectorControl,
    ) -> Result<(), ConnectorError> {
        info!(
            target: "edge.protocol",
            connector = %self.id,
            tags = self.tags.len(),
            batches = self.batches.len(),
            "polling_connector_started"
        );
        let fast = Duration::from_millis(self.settings.fast_cycle_ms.max(1));
        let slow = Duration::from_millis(self.settings.slow_cycle_ms.max(1));
        let has_fast = self.batches.iter().any(|b| b.cycle == CycleClass::Fast);
        let has_slow = self.batches.iter().any(|b| b.cycle == CycleClass::Slow);
        let mut next_fast = Instant::now();
        let mut next_slow = Instant::now();
        let mut writes_open = true;
        let mut rate_open = true;

        loop {
            if !control.wait_enabled().await {
                break;
            }
            let due = match (has_fast, has_slow) {
                (true, true) => next_fast.min(next_slow),
                (true, false) => next_fast,
                (false, true) => next_slow,
                (false, false) => Instant::now() + slow,
            };

            tokio::select! {
                _ = tokio::time::sleep_until(due) => {
                    let now = Instant::now();
                    let rate = control.rate_mode();
                    let mut classes = Vec::with_capacity(2);
                    if has_fast && now >= next_fast {
                        classes.push(CycleClass::Fast);
                        next_fast = now + rate.scale(fast);
                    }
                    if has_slow && now >= next_slow {
                        classes.push(CycleClass::Slow);
                        next_slow = now + rate.scale(slow);
                    }
                    if classes.is_empty() {
                        // 无点位时仍处理排队写
                        if self.ensure_connected(&control).await {
                            self.flush_writes(&control).await;
                        }
                        continue;
                    }
                    let samples = self.poll(&classes, &control).await;
                    let count = samples.len() as u64;
                    for sample in samples {
                        sink.send(sample).await.map_err(|_| ConnectorError::ChannelClosed)?;
                    }
                    edge_telemetry::record_samples_acquired(count);
                }
                request = control.writes.recv(), if writes_open => {
                    match request {
                        Some(request) => {
                            self.pending_writes.push_back(request);
                            if self.ensure_connected(&control).await {
                                self.flush_writes(&control).await;
                            }
                        }
                        None => writes_open = false,
                    }
                }
                changed = control.rate.changed(), if rate_open => {
                    if changed.is_err() {
                        rate_open = false;
                        continue;
                    }
                    // 降速解除时不必等完放大后的周期
                    let now = Instant::now();
                    let rate = control.rate_mode();
                    next_fast = next_fast.min(now + rate.scale(fast));
                    next_slow = next_slow.min(now + rate.scale(slow));
                    debug!(target: "edge.protocol", connector = %self.id, factor = rate.factor(), "connector_rate_changed");
                }
                changed = control.enabled.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !control.is_enabled() {
                        self.drop_link().await;
                        self.announced_up = false;
                        edge_telemetry::set_connector_up(&self.id, false);
                        info!(target: "edge.protocol", connector = %self.id, "connector_stopped");
                        control.report(ConnectorHealthEvent::new(
                            self.id.clone(),
                            HealthKind::Down { reason: "stopped".to_string() },
                        ));
                    }
                }
                changed = control.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if !self.pending_writes.is_empty() {
            warn!(
                target: "edge.protocol",
                connector = %self.id,
                pending = self.pending_writes.len(),
                "connector_writes_abandoned"
            );
        }
        self.drop_link().await;
        info!(target: "edge.protocol", connector = %self.id, "polling_connector_stopped");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    online: bool,
    registers: HashMap<(u8, RegisterTable, u16), u16>,
    exception: Option<String>,
    reads: u64,
    writes: Vec<(u8, RegisterTable, u16, Vec<u16>)>,
}

/// 内存脚本设备：测试与演示用寄存器读写器。
#[derive(Debug, Clone, Default)]
pub struct ScriptedRegisterReader {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedRegisterReader {
    pub fn new() -> Self {
        let reader = Self::default();
        reader.set_online(true);
        reader
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ScriptState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    pub fn set_online(&self, online: bool) {
        self.with_state(|state| state.online = online);
    }

    pub fn set_register(&self, unit_id: u8, table: RegisterTable, register: u16, value: u16) {
        self.with_state(|state| {
            state.registers.insert((unit_id, table, register), value);
        });
    }

    /// 设置后所有读写都以该异常应答。
    pub fn set_exception(&self, diagnostic: Option<&str>) {
        self.with_state(|state| state.exception = diagnostic.map(str::to_string));
    }

    pub fn reads(&self) -> u64 {
        self.with_state(|state| state.reads)
    }

    pub fn writes(&self) -> Vec<(u8, RegisterTable, u16, Vec<u16>)> {
        self.with_state(|state| state.writes.clone())
    }
}

#[async_trait]
impl RegisterReader for ScriptedRegisterReader {
    async fn connect(&mut self) -> Result<(), ConnectorError> {
        if self.with_state(|state| state.online) {
            Ok(())
        } else {
            Err(ConnectorError::Connection("connection refused".to_string()))
        }
    }

    async fn read(
        &mut self,
        unit_id: u8,
        table: RegisterTable,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ConnectorError> {
        self.with_state(|state| {
            if !state.online {
                return Err(ConnectorError::Connection("connection reset".to_string()));
            }
            if let Some(diagnostic) = &state.exception {
                return Err(ConnectorError::Exception(diagnostic.clone()));
            }
            state.reads += 1;
            Ok((0..count)
                .map(|offset| {
                    state
                        .registers
                        .get(&(unit_id, table, start.wrapping_add(offset)))
                        .copied()
                        .unwrap_or(0)
                })
                .collect())
        })
    }

    async fn write(
        &mut self,
        unit_id: u8,
        table: RegisterTable,
        start: u16,
        values: &[u16],
    ) -> Result<(), ConnectorError> {
        self.with_state(|state| {
            if !state.online {
                return Err(ConnectorError::Connection("connection reset".to_string()));
            }
            if let Some(diagnostic) = &state.exception {
                return Err(ConnectorError::Exception(diagnostic.clone()));
            }
            for (offset, value) in values.iter().enumerate() {
                state
                    .registers
                    .insert((unit_id, table, start.wrapping_add(offset as u16)), *value);
            }
            state.writes.push((unit_id, table, start, values.to_vec()));
            Ok(())
        })
    }

    async fn disconnect(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ByteOrder, ModbusDataType};

    fn tag(address: &str, data_type: ModbusDataType, cycle: CycleClass) -> PollTag {
        PollTag {
            machine_id: "press-01".to_string(),
            address: address.to_string(),
            data_type,
            byte_order: ByteOrder::Abcd,
            cycle,
        }
    }

    #[test]
    fn test_batches_coalesce_by_unit_table_and_cycle() {
        let settings = PollingSettings {
            tags: vec![
                tag("hr:1:100", ModbusDataType::Uint16, CycleClass::Fast),
                tag("hr:1:101", ModbusDataType::Float32, CycleClass::Fast),
                tag("hr:1:300", ModbusDataType::Uint16, CycleClass::Fast),
                tag("hr:1:102", ModbusDataType::Uint16, CycleClass::Slow),
                tag("hr:2:100", ModbusDataType::Uint16, CycleClass::Fast),
                tag("co:1:0", ModbusDataType::Bool, CycleClass::Fast),
                tag("co:1:1999", ModbusDataType::Bool, CycleClass::Fast),
            ],
            ..PollingSettings::default()
        };
        let connector =
            PollingConnector::new("plc-1", ScriptedRegisterReader::new(), settings).unwrap();
        let batches = connector.batches();
        let summary: Vec<(u8, RegisterTable, CycleClass, u16, u16, usize)> = batches
            .iter()
            .map(|b| (b.unit_id, b.table, b.cycle, b.start, b.count, b.tags.len()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, RegisterTable::Coil, CycleClass::Fast, 0, 2000, 2),
                (1, RegisterTable::Holding, CycleClass::Fast, 100, 3, 2),
                (1, RegisterTable::Holding, CycleClass::Fast, 300, 1, 1),
                (1, RegisterTable::Holding, CycleClass::Slow, 102, 1, 1),
                (2, RegisterTable::Holding, CycleClass::Fast, 100, 1, 1),
            ]
        );
        assert!(batches.iter().all(|b| b.count <= b.table.max_batch()));
    }

    #[test]
    fn test_invalid_tag_rejected() {
        let settings = PollingSettings {
            tags: vec![tag("zz:1:1", ModbusDataType::Uint16, CycleClass::Fast)],
            ..PollingSettings::default()
        };
        assert!(PollingConnector::new("plc-1", ScriptedRegisterReader::new(), settings).is_err());
    }
}
