//! 采集配置文件（JSON）。
//!
//! ```json
//! {
//!   "machines": [{ "site": "s1", "area": "a1", "line": "l1", "cell": "c1",
//!                  "machine": "press-01", "ideal_cycle_s": 30.0 }],
//!   "connectors": [{ "id": "plc-1", "kind": "modbus_tcp", "settings": { ... } }],
//!   "mappings": [{ "machine_id": "press-01", "address": "hr:1:100", "signal": "counter.good" }],
//!   "fault_groups": [{ "name": "hydraulic", "codes": [101, 102] }]
//! }
//! ```

use crate::ConfigError;
use domain::{AssetPath, AssetRegistry, MappingTable, TagMapping};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// 机台条目（资产路径 + OEE 参数）。
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MachineEntry {
    #[serde(flatten)]
    pub path: AssetPath,
    /// 理想节拍（秒/件）。
    #[serde(default)]
    pub ideal_cycle_s: f64,
    /// OEE 窗口长度（秒），默认一个班次 8 小时。
    #[serde(default = "default_window_s")]
    pub oee_window_s: u64,
}

fn default_window_s() -> u64 {
    8 * 3600
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    ModbusTcp,
    Subscription,
}

/// 连接器条目；`settings` 由协议模块按 kind 自行解析。
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConnectorEntry {
    pub id: String,
    pub kind: ConnectorKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub settings: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

/// 故障根因分组：同组故障码合并到同一条记录。
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FaultGroup {
    pub name: String,
    pub codes: Vec<i64>,
}

/// 采集配置文件整体。
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GatewayFile {
    #[serde(default)]
    pub machines: Vec<MachineEntry>,
    #[serde(default)]
    pub connectors: Vec<ConnectorEntry>,
    #[serde(default)]
    pub mappings: Vec<TagMapping>,
    #[serde(default)]
    pub fault_groups: Vec<FaultGroup>,
}

impl GatewayFile {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let file: GatewayFile =
            serde_json::from_str(json).map_err(|err| ConfigError::File(err.to_string()))?;
        file.validate()?;
        Ok(file)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::File(format!("{}: {}", path.display(), err)))?;
        Self::from_json(&raw)
    }

    /// 结构校验：连接器 ID 唯一，映射引用已声明的机台。
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut connector_ids = HashSet::new();
        for connector in &self.connectors {
            if !connector_ids.insert(connector.id.as_str()) {
                return Err(ConfigError::File(format!(
                    "duplicate connector id: {}",
                    connector.id
                )));
            }
        }
        let machines: HashSet<&str> = self
            .machines
            .iter()
            .map(|entry| entry.path.machine.as_str())
            .collect();
        for mapping in &self.mappings {
            if !machines.contains(mapping.machine_id.as_str()) {
                return Err(ConfigError::File(format!(
                    "mapping {} references unknown machine {}",
                    mapping.address, mapping.machine_id
                )));
            }
        }
        Ok(())
    }

    pub fn asset_registry(&self) -> AssetRegistry {
        AssetRegistry::new(self.machines.iter().map(|entry| entry.path.clone()))
    }

    pub fn mapping_table(&self, version: u64) -> MappingTable {
        MappingTable::new(self.mappings.iter().cloned(), version)
    }

    pub fn machine(&self, machine_id: &str) -> Option<&MachineEntry> {
        self.machines
            .iter()
            .find(|entry| entry.path.machine == machine_id)
    }
}
