//! 事件输出：故障生命周期、OEE 结果、数据质量告警、连接器健康。

use serde::{Deserialize, Serialize};

/// 故障状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultState {
    Active,
    Acknowledged,
    Resolved,
}

impl FaultState {
    pub fn is_open(self) -> bool {
        !matches!(self, FaultState::Resolved)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Critical,
}

/// 故障关闭原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionReason {
    /// PLC 侧清除。
    Cleared,
    /// 同一故障信号跳变为组外的新码。
    Superseded,
    /// 去重窗口外再次出现，旧记录过期关闭。
    Expired,
}

/// 故障记录。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub record_id: String,
    pub machine_id: String,
    /// 开启该记录的故障信号（如 `fault.code`、`fault.estop`）。
    #[serde(default)]
    pub signal: String,
    pub code: i64,
    pub state: FaultState,
    pub severity: Severity,
    pub opened_at_ms: i64,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    pub occurrence_count: u32,
    pub merged_codes: Vec<i64>,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at_ms: Option<i64>,
    pub closed_at_ms: Option<i64>,
    pub resolution: Option<ResolutionReason>,
}

impl FaultRecord {
    /// 修复时长（关闭时间 - 开启时间）。
    pub fn repair_ms(&self) -> Option<i64> {
        self.closed_at_ms
            .map(|closed| (closed - self.opened_at_ms).max(0))
    }

    /// 是否覆盖指定故障码（含已合并的码）。
    pub fn covers(&self, code: i64) -> bool {
        self.code == code || self.merged_codes.contains(&code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultTransition {
    Opened,
    Repeated,
    Merged,
    Acknowledged,
    Resolved,
}

/// 故障生命周期事件（携带变更后的记录快照）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultEvent {
    pub transition: FaultTransition,
    pub record: FaultRecord,
}

/// 单个窗口的 OEE 结果。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OeeReport {
    pub machine_id: String,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    /// 窗口已结束（false 表示周期性中间结果）。
    pub closed: bool,
    pub planned_ms: i64,
    pub run_ms: i64,
    pub good_count: u64,
    pub total_count: u64,
    pub ideal_cycle_s: f64,
    pub availability: f64,
    /// 上限 1.0 的性能率。
    pub performance: f64,
    pub performance_raw: f64,
    pub performance_anomaly: bool,
    pub quality: f64,
    pub oee: f64,
    pub oee_raw: f64,
    pub failures: u32,
    pub repairs: u32,
    pub mttr_ms: f64,
    pub mtbf_ms: f64,
}

/// 数据质量告警（越界值降级为 Uncertain 时产生）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQualityAlert {
    pub machine_id: String,
    pub signal: String,
    pub value: String,
    pub reason: String,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorStatus {
    Up,
    Down,
}

/// 连接器健康事件。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorHealth {
    pub connector_id: String,
    pub status: ConnectorStatus,
    pub detail: Option<String>,
    pub ts_ms: i64,
}

/// 写往事件存储协作方的记录。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventRecord {
    Fault(FaultEvent),
    Oee(OeeReport),
    DataQuality(DataQualityAlert),
    ConnectorHealth(ConnectorHealth),
}

impl EventRecord {
    pub fn machine_id(&self) -> Option<&str> {
        match self {
            EventRecord::Fault(event) => Some(&event.record.machine_id),
            EventRecord::Oee(report) => Some(&report.machine_id),
            EventRecord::DataQuality(alert) => Some(&alert.machine_id),
            EventRecord::ConnectorHealth(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EventRecord::Fault(_) => "fault",
            EventRecord::Oee(_) => "oee",
            EventRecord::DataQuality(_) => "data_quality",
            EventRecord::ConnectorHealth(_) => "connector_health",
        }
    }
}
