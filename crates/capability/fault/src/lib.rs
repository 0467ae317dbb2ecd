//! 故障状态机：`None → Active → Acknowledged → Resolved`（确认可跳过）。
//!
//! 每个机台一本 `FaultBook`，由机台 actor 独占。记录按 (故障信号, 码) 跟踪来源，
//! 不同信号上的同码（如两个布尔故障位都记为码 1）互不干扰。
//!
//! - 去重：同一来源在窗口内（距上次出现）重复只累加次数；超出窗口则旧记录以
//!   `Expired` 关闭（关闭时间取上次出现），另开新记录
//! - 合并：与某条未关闭记录同属一个根因组的新码并入该记录；记录在其全部来源
//!   清除后才关闭
//! - 故障寄存器：同一信号上码值跳变为组外新码时，旧来源以 `Superseded` 释放；写 0 即清除

use domain::{
    FaultEvent, FaultRecord, FaultState, FaultTransition, ResolutionReason, Severity, TagValue,
};
use std::collections::HashMap;
use tracing::{debug, info};

/// 默认去重窗口 5 分钟。
pub const DEFAULT_DEDUP_WINDOW_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FaultError {
    #[error("no open fault for code {0}")]
    NotFound(i64),
    #[error("fault {0} already acknowledged")]
    AlreadyAcknowledged(i64),
}

/// 去重与合并策略。
#[derive(Debug, Clone)]
pub struct FaultPolicy {
    pub dedup_window_ms: i64,
    groups: HashMap<i64, String>,
    severities: HashMap<i64, Severity>,
}

impl Default for FaultPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW_MS)
    }
}

impl FaultPolicy {
    pub fn new(dedup_window_ms: i64) -> Self {
        Self {
            dedup_window_ms,
            groups: HashMap::new(),
            severities: HashMap::new(),
        }
    }

    /// 登记根因组；一个码只属于一个组，后登记的覆盖先登记的。
    pub fn with_group(mut self, name: impl Into<String>, codes: impl IntoIterator<Item = i64>) -> Self {
        let name = name.into();
        for code in codes {
            self.groups.insert(code, name.clone());
        }
        self
    }

    pub fn with_severity(mut self, code: i64, severity: Severity) -> Self {
        self.severities.insert(code, severity);
        self
    }

    pub fn group_of(&self, code: i64) -> Option<&str> {
        self.groups.get(&code).map(String::as_str)
    }

    fn same_group(&self, a: i64, b: i64) -> bool {
        matches!((self.group_of(a), self.group_of(b)), (Some(x), Some(y)) if x == y)
    }

    fn severity_of(&self, code: i64) -> Severity {
        self.severities.get(&code).copied().unwrap_or_default()
    }
}

/// 未关闭记录及其仍然有效的来源。
#[derive(Debug)]
struct OpenFault {
    record: FaultRecord,
    sources: Vec<(String, i64)>,
}

impl OpenFault {
    fn tracks(&self, signal: &str, code: i64) -> bool {
        self.sources
            .iter()
            .any(|(source, current)| source == signal && *current == code)
    }
}

/// 单机台故障簿（只保存未关闭记录）。
#[derive(Debug)]
pub struct FaultBook {
    machine_id: String,
    policy: FaultPolicy,
    open: Vec<OpenFault>,
    /// 故障信号 → 当前码值。
    registers: HashMap<String, i64>,
}

impl FaultBook {
    pub fn new(machine_id: impl Into<String>, policy: FaultPolicy) -> Self {
        Self {
            machine_id: machine_id.into(),
            policy,
            open: Vec::new(),
            registers: HashMap::new(),
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn set_policy(&mut self, policy: FaultPolicy) {
        self.policy = policy;
    }

    pub fn open_records(&self) -> Vec<&FaultRecord> {
        self.open.iter().map(|open| &open.record).collect()
    }

    pub fn find(&self, code: i64) -> Option<&FaultRecord> {
        self.open
            .iter()
            .map(|open| &open.record)
            .find(|record| record.covers(code))
    }

    /// 故障信号取值：整数码（0 为清除）或布尔故障位（true 记为码 1）。
    pub fn observe(&mut self, signal: &str, value: &TagValue, ts_ms: i64) -> Vec<FaultEvent> {
        let code = match value {
            TagValue::Bool(bit) => i64::from(*bit),
            other => match other.as_i64() {
                Some(code) => code,
                None => return Vec::new(),
            },
        };
        let previous = self.registers.get(signal).copied();
        let mut events = Vec::new();

        if code == 0 {
            self.registers.remove(signal);
            if let Some(previous) = previous {
                events.extend(self.resolve(signal, previous, ts_ms, ResolutionReason::Cleared));
            }
            return events;
        }

        let replaced = previous.filter(|previous| *previous != code);
        let merges = replaced.is_some_and(|previous| {
            self.open
                .iter()
                .find(|open| open.tracks(signal, previous))
                .is_some_and(|open| self.policy.same_group(open.record.code, code))
        });
        if let Some(previous) = replaced
            && !merges
        {
            events.extend(self.resolve(signal, previous, ts_ms, ResolutionReason::Superseded));
        }
        self.registers.insert(signal.to_string(), code);
        events.extend(self.raise(signal, code, ts_ms));
        if let Some(previous) = replaced
            && merges
        {
            self.release(signal, previous);
        }
        events
    }

    /// 故障出现（或重复出现）。
    pub fn raise(&mut self, signal: &str, code: i64, ts_ms: i64) -> Vec<FaultEvent> {
        let window = self.policy.dedup_window_ms;
        if let Some(index) = self.open.iter().position(|open| open.tracks(signal, code)) {
            let record = &mut self.open[index].record;
            if ts_ms - record.last_seen_ms <= window {
                record.occurrence_count += 1;
                record.last_seen_ms = record.last_seen_ms.max(ts_ms);
                return vec![event(FaultTransition::Repeated, record)];
            }
            let closed_at = record.last_seen_ms;
            let mut events = Vec::new();
            if let Some(expired) = self.close(index, closed_at, ResolutionReason::Expired) {
                events.push(expired);
            }
            events.push(self.open_new(signal, code, ts_ms));
            return events;
        }

        if let Some(open) = self
            .open
            .iter_mut()
            .find(|open| self.policy.same_group(open.record.code, code))
        {
            let record = &mut open.record;
            if !record.covers(code) {
                record.merged_codes.push(code);
            }
            record.last_seen_ms = record.last_seen_ms.max(ts_ms);
            open.sources.push((signal.to_string(), code));
            debug!(
                target: "edge.fault",
                machine_id = %record.machine_id,
                code = record.code,
                merged = code,
                signal,
                "fault_merged"
            );
            return vec![event(FaultTransition::Merged, record)];
        }

        vec![self.open_new(signal, code, ts_ms)]
    }

    /// PLC 侧清除。
    pub fn clear(&mut self, signal: &str, code: i64, ts_ms: i64) -> Option<FaultEvent> {
        if self.registers.get(signal) == Some(&code) {
            self.registers.remove(signal);
        }
        self.resolve(signal, code, ts_ms, ResolutionReason::Cleared)
    }

    /// 操作员确认：按码选取最早一条尚未确认的记录。
    pub fn acknowledge(
        &mut self,
        code: i64,
        operator: &str,
        ts_ms: i64,
    ) -> Result<FaultEvent, FaultError> {
        let mut covering = self
            .open
            .iter_mut()
            .map(|open| &mut open.record)
            .filter(|record| record.covers(code))
            .peekable();
        if covering.peek().is_none() {
            return Err(FaultError::NotFound(code));
        }
        let record = covering
            .find(|record| record.state != FaultState::Acknowledged)
            .ok_or(FaultError::AlreadyAcknowledged(code))?;
        record.state = FaultState::Acknowledged;
        record.acknowledged_by = Some(operator.to_string());
        record.acknowledged_at_ms = Some(ts_ms);
        info!(
            target: "edge.fault",
            machine_id = %record.machine_id,
            code = record.code,
            signal = %record.signal,
            operator,
            "fault_acknowledged"
        );
        Ok(event(FaultTransition::Acknowledged, record))
    }

    /// 释放一个来源；记录的最后一个来源释放时关闭记录。
    fn resolve(
        &mut self,
        signal: &str,
        code: i64,
        ts_ms: i64,
        reason: ResolutionReason,
    ) -> Option<FaultEvent> {
        let index = self.release(signal, code)?;
        if !self.open[index].sources.is_empty() {
            return None;
        }
        self.close(index, ts_ms, reason)
    }

    fn release(&mut self, signal: &str, code: i64) -> Option<usize> {
        let index = self.open.iter().position(|open| open.tracks(signal, code))?;
        self.open[index]
            .sources
            .retain(|(source, current)| !(source == signal && *current == code));
        Some(index)
    }

    fn close(&mut self, index: usize, ts_ms: i64, reason: ResolutionReason) -> Option<FaultEvent> {
        if index >= self.open.len() {
            return None;
        }
        let mut record = self.open.remove(index).record;
        record.state = FaultState::Resolved;
        record.closed_at_ms = Some(ts_ms.max(record.opened_at_ms));
        record.resolution = Some(reason);
        edge_telemetry::adjust_active_faults(-1);
        info!(
            target: "edge.fault",
            machine_id = %record.machine_id,
            code = record.code,
            signal = %record.signal,
            reason = ?reason,
            occurrences = record.occurrence_count,
            "fault_resolved"
        );
        Some(FaultEvent {
            transition: FaultTransition::Resolved,
            record,
        })
    }

    fn open_new(&mut self, signal: &str, code: i64, ts_ms: i64) -> FaultEvent {
        let record = FaultRecord {
            record_id: uuid::Uuid::new_v4().to_string(),
            machine_id: self.machine_id.clone(),
            signal: signal.to_string(),
            code,
            state: FaultState::Active,
            severity: self.policy.severity_of(code),
            opened_at_ms: ts_ms,
            first_seen_ms: ts_ms,
            last_seen_ms: ts_ms,
            occurrence_count: 1,
            merged_codes: Vec::new(),
            acknowledged_by: None,
            acknowledged_at_ms: None,
            closed_at_ms: None,
            resolution: None,
        };
        edge_telemetry::adjust_active_faults(1);
        info!(
            target: "edge.fault",
            machine_id = %record.machine_id,
            code,
            signal,
            record_id = %record.record_id,
            "fault_opened"
        );
        let opened = event(FaultTransition::Opened, &record);
        self.open.push(OpenFault {
            record,
            sources: vec![(signal.to_string(), code)],
        });
        opened
    }
}

fn event(transition: FaultTransition, record: &FaultRecord) -> FaultEvent {
    FaultEvent {
        transition,
        record: record.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::signal::FAULT_CODE;

    const MINUTE_MS: i64 = 60_000;

    fn book() -> FaultBook {
        FaultBook::new(
            "press-01",
            FaultPolicy::default().with_group("hydraulics", [210, 211, 212]),
        )
    }

    fn transitions(events: &[FaultEvent]) -> Vec<FaultTransition> {
        events.iter().map(|event| event.transition).collect()
    }

    #[test]
    fn repeat_within_window_is_deduplicated() {
        let mut book = book();
        book.raise(FAULT_CODE, 101, 0);
        let events = book.raise(FAULT_CODE, 101, 2 * MINUTE_MS);
        assert_eq!(transitions(&events), vec![FaultTransition::Repeated]);
        assert_eq!(book.open_records().len(), 1);
        assert_eq!(book.open_records()[0].occurrence_count, 2);
        assert_eq!(book.open_records()[0].last_seen_ms, 2 * MINUTE_MS);
    }

    #[test]
    fn repeat_after_window_opens_new_record() {
        let mut book = book();
        let first = book.raise(FAULT_CODE, 101, 0);
        let events = book.raise(FAULT_CODE, 101, 6 * MINUTE_MS);
        assert_eq!(
            transitions(&events),
            vec![FaultTransition::Resolved, FaultTransition::Opened]
        );
        let expired = &events[0].record;
        assert_eq!(expired.resolution, Some(ResolutionReason::Expired));
        assert_eq!(expired.closed_at_ms, Some(0));
        assert_ne!(events[1].record.record_id, first[0].record.record_id);
        assert_eq!(book.open_records().len(), 1);
        assert_eq!(book.open_records()[0].opened_at_ms, 6 * MINUTE_MS);
    }

    #[test]
    fn same_group_codes_merge() {
        let mut book = book();
        book.raise(FAULT_CODE, 210, 0);
        let events = book.raise(FAULT_CODE, 212, 1_000);
        assert_eq!(transitions(&events), vec![FaultTransition::Merged]);
        assert_eq!(book.open_records().len(), 1);
        assert_eq!(book.open_records()[0].merged_codes, vec![212]);
        assert!(book.find(212).is_some());

        book.raise(FAULT_CODE, 300, 2_000);
        assert_eq!(book.open_records().len(), 2);
    }

    #[test]
    fn acknowledge_then_clear_reports_repair_time() {
        let mut book = book();
        book.raise(FAULT_CODE, 101, 1_000);
        let acked = book.acknowledge(101, "operator-7", 5_000).expect("ack");
        assert_eq!(acked.record.state, FaultState::Acknowledged);
        assert_eq!(
            book.acknowledge(101, "operator-7", 6_000),
            Err(FaultError::AlreadyAcknowledged(101))
        );

        let resolved = book.clear(FAULT_CODE, 101, 61_000).expect("resolved");
        assert_eq!(resolved.record.state, FaultState::Resolved);
        assert_eq!(resolved.record.resolution, Some(ResolutionReason::Cleared));
        assert_eq!(resolved.record.repair_ms(), Some(60_000));
        assert!(book.open_records().is_empty());
        assert_eq!(book.acknowledge(101, "x", 0), Err(FaultError::NotFound(101)));
    }

    #[test]
    fn register_changes_supersede_and_zero_clears() {
        let mut book = book();
        book.observe("fault.code", &TagValue::Int(101), 0);
        let events = book.observe("fault.code", &TagValue::Int(300), 1_000);
        assert_eq!(
            transitions(&events),
            vec![FaultTransition::Resolved, FaultTransition::Opened]
        );
        assert_eq!(
            events[0].record.resolution,
            Some(ResolutionReason::Superseded)
        );

        let events = book.observe("fault.code", &TagValue::Int(0), 2_000);
        assert_eq!(transitions(&events), vec![FaultTransition::Resolved]);
        assert_eq!(events[0].record.code, 300);
        assert!(book.open_records().is_empty());
    }

    #[test]
    fn register_change_within_group_merges() {
        let mut book = book();
        book.observe("fault.code", &TagValue::Int(210), 0);
        let events = book.observe("fault.code", &TagValue::Int(211), 1_000);
        assert_eq!(transitions(&events), vec![FaultTransition::Merged]);
        let events = book.observe("fault.code", &TagValue::Int(0), 2_000);
        assert_eq!(events[0].record.code, 210);
        assert_eq!(events[0].record.merged_codes, vec![211]);
    }

    #[test]
    fn boolean_fault_bit() {
        let mut book = book();
        let opened = book.observe("fault.estop", &TagValue::Bool(true), 0);
        assert_eq!(transitions(&opened), vec![FaultTransition::Opened]);
        assert_eq!(opened[0].record.code, 1);
        let cleared = book.observe("fault.estop", &TagValue::Bool(false), 10);
        assert_eq!(transitions(&cleared), vec![FaultTransition::Resolved]);
    }

    #[test]
    fn boolean_bits_on_different_signals_stay_apart() {
        let mut book = book();
        let estop = book.observe("fault.estop", &TagValue::Bool(true), 0);
        let door = book.observe("fault.door_open", &TagValue::Bool(true), 1_000);
        assert_eq!(transitions(&estop), vec![FaultTransition::Opened]);
        assert_eq!(transitions(&door), vec![FaultTransition::Opened]);
        assert_ne!(estop[0].record.record_id, door[0].record.record_id);
        assert_eq!(door[0].record.signal, "fault.door_open");
        assert_eq!(door[0].record.occurrence_count, 1);

        let cleared = book.observe("fault.estop", &TagValue::Bool(false), 5_000);
        assert_eq!(transitions(&cleared), vec![FaultTransition::Resolved]);
        assert_eq!(cleared[0].record.record_id, estop[0].record.record_id);
        assert_eq!(cleared[0].record.repair_ms(), Some(5_000));
        let still_open = book.open_records();
        assert_eq!(still_open.len(), 1);
        assert_eq!(still_open[0].signal, "fault.door_open");

        let repeated = book.observe("fault.door_open", &TagValue::Bool(true), 6_000);
        assert_eq!(transitions(&repeated), vec![FaultTransition::Repeated]);
        assert_eq!(repeated[0].record.occurrence_count, 2);
    }

    #[test]
    fn merged_record_closes_after_every_source_clears() {
        let mut book = book();
        book.observe("fault.pump", &TagValue::Int(210), 0);
        let merged = book.observe("fault.valve", &TagValue::Int(211), 1_000);
        assert_eq!(transitions(&merged), vec![FaultTransition::Merged]);

        assert!(book.observe("fault.pump", &TagValue::Int(0), 2_000).is_empty());
        assert_eq!(book.open_records().len(), 1);

        let closed = book.observe("fault.valve", &TagValue::Int(0), 3_000);
        assert_eq!(transitions(&closed), vec![FaultTransition::Resolved]);
        assert_eq!(closed[0].record.code, 210);
        assert_eq!(closed[0].record.closed_at_ms, Some(3_000));
        assert!(book.open_records().is_empty());
    }

    #[test]
    fn acknowledge_picks_oldest_unacknowledged_record() {
        let mut book = book();
        book.observe("fault.estop", &TagValue::Bool(true), 0);
        book.observe("fault.door_open", &TagValue::Bool(true), 1_000);
        let first = book.acknowledge(1, "op", 2_000).expect("first");
        assert_eq!(first.record.signal, "fault.estop");
        let second = book.acknowledge(1, "op", 3_000).expect("second");
        assert_eq!(second.record.signal, "fault.door_open");
        assert_eq!(
            book.acknowledge(1, "op", 4_000),
            Err(FaultError::AlreadyAcknowledged(1))
        );
    }
}
