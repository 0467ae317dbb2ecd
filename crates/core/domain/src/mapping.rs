//! 点位映射：(机台, 源地址) → 规范信号及换算规则。

use crate::data::{Quality, TagValue};
use crate::signal::CanonicalSignal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 死区配置。
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum Deadband {
    #[default]
    None,
    Absolute(f64),
    Percent(f64),
}

impl Deadband {
    /// 新值相对上次转发值是否越过死区。
    ///
    /// 非数值类型只要值发生变化即视为越过。
    pub fn exceeded(&self, last: &TagValue, next: &TagValue) -> bool {
        let (Some(last_num), Some(next_num)) = (last.as_f64(), next.as_f64()) else {
            return last != next;
        };
        match *self {
            Deadband::None => true,
            Deadband::Absolute(threshold) => (next_num - last_num).abs() > threshold,
            Deadband::Percent(percent) => {
                if last_num == 0.0 {
                    return next_num != 0.0;
                }
                let change = ((next_num - last_num) / last_num).abs() * 100.0;
                change > percent
            }
        }
    }
}

/// 有效值范围（闭区间，缺省端不限）。
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ValueRange {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl ValueRange {
    pub fn contains(&self, value: &TagValue) -> bool {
        let Some(v) = value.as_f64() else {
            return true;
        };
        self.min.is_none_or(|min| v >= min) && self.max.is_none_or(|max| v <= max)
    }
}

/// 映射键。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MappingKey {
    pub machine_id: String,
    pub address: String,
}

impl MappingKey {
    pub fn new(machine_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            address: address.into(),
        }
    }
}

fn default_scale() -> f64 {
    1.0
}

fn default_min_quality() -> Quality {
    Quality::Uncertain
}

/// 单条点位映射（会话内不可变）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagMapping {
    pub machine_id: String,
    pub address: String,
    pub signal: CanonicalSignal,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub deadband: Deadband,
    #[serde(default)]
    pub sampling_interval_ms: Option<u64>,
    #[serde(default = "default_min_quality")]
    pub min_quality: Quality,
    #[serde(default)]
    pub range: Option<ValueRange>,
}

impl TagMapping {
    pub fn new(
        machine_id: impl Into<String>,
        address: impl Into<String>,
        signal: CanonicalSignal,
    ) -> Self {
        Self {
            machine_id: machine_id.into(),
            address: address.into(),
            signal,
            unit: None,
            scale: default_scale(),
            offset: 0.0,
            deadband: Deadband::None,
            sampling_interval_ms: None,
            min_quality: default_min_quality(),
            range: None,
        }
    }

    pub fn key(&self) -> MappingKey {
        MappingKey::new(self.machine_id.clone(), self.address.clone())
    }

    /// 应用单位换算。
    pub fn apply(&self, value: &TagValue) -> TagValue {
        value.scaled(self.scale, self.offset)
    }
}

/// 映射表（热加载时整体替换）。
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    entries: HashMap<MappingKey, TagMapping>,
    version: u64,
}

impl MappingTable {
    pub fn new(mappings: impl IntoIterator<Item = TagMapping>, version: u64) -> Self {
        Self {
            entries: mappings
                .into_iter()
                .map(|mapping| (mapping.key(), mapping))
                .collect(),
            version,
        }
    }

    pub fn get(&self, machine_id: &str, address: &str) -> Option<&TagMapping> {
        self.entries.get(&MappingKey::new(machine_id, address))
    }

    pub fn for_machine<'a>(&'a self, machine_id: &'a str) -> impl Iterator<Item = &'a TagMapping> {
        self.entries
            .values()
            .filter(move |mapping| mapping.machine_id == machine_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TagMapping> {
        self.entries.values()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
