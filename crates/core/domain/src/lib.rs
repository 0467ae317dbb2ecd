pub mod asset;
pub mod data;
pub mod events;
pub mod mapping;
pub mod signal;

pub use asset::{AssetPath, AssetRegistry};
pub use data::{Quality, TagSample, TagValue, TelemetryRecord};
pub use events::{
    ConnectorHealth, ConnectorStatus, DataQualityAlert, EventRecord, FaultEvent, FaultRecord,
    FaultState, FaultTransition, OeeReport, ResolutionReason, Severity,
};
pub use mapping::{Deadband, MappingKey, MappingTable, TagMapping, ValueRange};
pub use signal::{CanonicalSignal, SignalKind, SignalParseError, ValueSchema};

use std::time::{SystemTime, UNIX_EPOCH};

/// 当前 Unix 毫秒时间戳。
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
