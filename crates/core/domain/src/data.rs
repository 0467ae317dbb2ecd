use crate::signal::{CanonicalSignal, SignalKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 数据质量（顺序：Bad < Uncertain < Good）。
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Bad,
    Uncertain,
    #[default]
    Good,
}

impl Quality {
    pub const GOOD_CODE: i32 = 192;
    pub const UNCERTAIN_CODE: i32 = 64;
    pub const BAD_CODE: i32 = 0;

    /// 线上质量码（OPC 约定）。
    pub fn code(self) -> i32 {
        match self {
            Quality::Good => Self::GOOD_CODE,
            Quality::Uncertain => Self::UNCERTAIN_CODE,
            Quality::Bad => Self::BAD_CODE,
        }
    }

    pub fn from_code(code: i32) -> Self {
        if code >= Self::GOOD_CODE {
            Quality::Good
        } else if code >= Self::UNCERTAIN_CODE {
            Quality::Uncertain
        } else {
            Quality::Bad
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Quality::Good => "good",
            Quality::Uncertain => "uncertain",
            Quality::Bad => "bad",
        }
    }
}

/// 点位值的数据类型。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TagValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
}

impl TagValue {
    pub fn is_null(&self) -> bool {
        matches!(self, TagValue::Null)
    }

    /// 数值视图；布尔值按 1/0 处理。
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TagValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            TagValue::Int(v) => Some(*v as f64),
            TagValue::UInt(v) => Some(*v as f64),
            TagValue::Float(v) => Some(*v),
            TagValue::Null | TagValue::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TagValue::Bool(v) => Some(i64::from(*v)),
            TagValue::Int(v) => Some(*v),
            TagValue::UInt(v) => i64::try_from(*v).ok(),
            TagValue::Float(v) if v.is_finite() && v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TagValue::Bool(v) => Some(*v),
            TagValue::Int(v) => Some(*v != 0),
            TagValue::UInt(v) => Some(*v != 0),
            TagValue::Float(v) => Some(*v != 0.0),
            TagValue::Text(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "1" | "on" => Some(true),
                "false" | "0" | "off" => Some(false),
                _ => None,
            },
            TagValue::Null => None,
        }
    }

    /// 单位换算 `value * scale + offset`。
    ///
    /// 恒等换算保持原类型（计数器不会变成浮点）；布尔与文本不参与换算。
    pub fn scaled(&self, scale: f64, offset: f64) -> TagValue {
        if scale == 1.0 && offset == 0.0 {
            return self.clone();
        }
        match self {
            TagValue::Int(_) | TagValue::UInt(_) | TagValue::Float(_) => {
                let raw = self.as_f64().unwrap_or_default();
                TagValue::Float(raw * scale + offset)
            }
            other => other.clone(),
        }
    }

    /// 去重用的值签名（浮点按位比较）。
    pub fn signature(&self) -> String {
        match self {
            TagValue::Null => "n".to_string(),
            TagValue::Bool(v) => format!("b:{}", v),
            TagValue::Int(v) => format!("i:{}", v),
            TagValue::UInt(v) => format!("u:{}", v),
            TagValue::Float(v) => format!("f:{:x}", v.to_bits()),
            TagValue::Text(v) => format!("s:{}", v),
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Null => write!(f, "null"),
            TagValue::Bool(v) => write!(f, "{}", v),
            TagValue::Int(v) => write!(f, "{}", v),
            TagValue::UInt(v) => write!(f, "{}", v),
            TagValue::Float(v) => write!(f, "{}", v),
            TagValue::Text(v) => write!(f, "{}", v),
        }
    }
}

/// 连接器产出的采集样本。
///
/// 质量为 Bad 时值恒为 `TagValue::Null`，不会伪造数据。
#[derive(Debug, Clone, PartialEq)]
pub struct TagSample {
    pub machine_id: String,
    pub address: String,
    pub signal: Option<CanonicalSignal>,
    pub value: TagValue,
    pub quality: Quality,
    pub ts_ms: i64,
}

impl TagSample {
    pub fn new(
        machine_id: impl Into<String>,
        address: impl Into<String>,
        value: TagValue,
        quality: Quality,
        ts_ms: i64,
    ) -> Self {
        let value = if quality == Quality::Bad {
            TagValue::Null
        } else {
            value
        };
        Self {
            machine_id: machine_id.into(),
            address: address.into(),
            signal: None,
            value,
            quality,
            ts_ms,
        }
    }

    /// 坏质量样本（连接器离线期间使用）。
    pub fn bad(machine_id: impl Into<String>, address: impl Into<String>, ts_ms: i64) -> Self {
        Self::new(machine_id, address, TagValue::Null, Quality::Bad, ts_ms)
    }

    pub fn with_signal(mut self, signal: Option<CanonicalSignal>) -> Self {
        self.signal = signal;
        self
    }
}

/// 遥测输出记录（写往时序存储协作方）。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub machine_id: String,
    /// 规范信号名；未映射时为原始地址。
    pub signal: String,
    pub kind: Option<SignalKind>,
    pub mapped: bool,
    pub value: TagValue,
    pub quality: Quality,
    pub ts_ms: i64,
    pub metadata: BTreeMap<String, String>,
}
