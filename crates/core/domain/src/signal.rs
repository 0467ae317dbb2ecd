//! 规范信号：封闭的信号族集合，每个族有明确的值约束。

use crate::data::TagValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const STATE_RUN: &str = "state.run";
pub const STATE_PLANNED: &str = "state.planned";
pub const COUNTER_GOOD: &str = "counter.good";
pub const COUNTER_TOTAL: &str = "counter.total";
pub const COUNTER_REJECT: &str = "counter.reject";
pub const FAULT_CODE: &str = "fault.code";
pub const CYCLE_TIME: &str = "cycle.time";

/// 信号族。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    State,
    Counter,
    Rate,
    Cycle,
    Fault,
    Utilization,
    ProcessVariable,
}

impl SignalKind {
    pub fn prefix(self) -> &'static str {
        match self {
            SignalKind::State => "state",
            SignalKind::Counter => "counter",
            SignalKind::Rate => "rate",
            SignalKind::Cycle => "cycle",
            SignalKind::Fault => "fault",
            SignalKind::Utilization => "utilization",
            SignalKind::ProcessVariable => "pv",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "state" => Some(SignalKind::State),
            "counter" => Some(SignalKind::Counter),
            "rate" => Some(SignalKind::Rate),
            "cycle" => Some(SignalKind::Cycle),
            "fault" => Some(SignalKind::Fault),
            "utilization" => Some(SignalKind::Utilization),
            "pv" | "process" => Some(SignalKind::ProcessVariable),
            _ => None,
        }
    }

    pub fn schema(self) -> ValueSchema {
        match self {
            SignalKind::State => ValueSchema::Boolean,
            SignalKind::Counter => ValueSchema::NonNegativeInteger,
            SignalKind::Fault => ValueSchema::FaultCode,
            SignalKind::Cycle => ValueSchema::Seconds,
            SignalKind::Utilization => ValueSchema::Percent,
            SignalKind::Rate | SignalKind::ProcessVariable => ValueSchema::Number,
        }
    }

    /// 是否进入 OEE / 故障计算。
    pub fn feeds_calculation(self) -> bool {
        matches!(
            self,
            SignalKind::State | SignalKind::Counter | SignalKind::Cycle | SignalKind::Fault
        )
    }
}

/// 信号族的值约束。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSchema {
    Boolean,
    NonNegativeInteger,
    /// 整数故障码（0 表示清除）或布尔故障位。
    FaultCode,
    Seconds,
    Percent,
    Number,
}

impl ValueSchema {
    pub fn admits(self, value: &TagValue) -> bool {
        match (self, value) {
            (_, TagValue::Null) => true,
            (ValueSchema::Boolean, v) => v.as_bool().is_some() && !matches!(v, TagValue::Text(_)),
            (ValueSchema::NonNegativeInteger, v) => v.as_i64().is_some_and(|n| n >= 0),
            (ValueSchema::FaultCode, TagValue::Bool(_)) => true,
            (ValueSchema::FaultCode, v) => v.as_i64().is_some(),
            (ValueSchema::Seconds, v) => v.as_f64().is_some_and(|n| n >= 0.0),
            (ValueSchema::Percent, v) => v.as_f64().is_some_and(|n| (0.0..=100.0).contains(&n)),
            (ValueSchema::Number, v) => v.as_f64().is_some_and(f64::is_finite),
        }
    }
}

/// 信号名解析错误。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalParseError {
    #[error("empty signal name")]
    Empty,
    #[error("unknown signal family: {0}")]
    UnknownFamily(String),
    #[error("missing signal leaf: {0}")]
    MissingLeaf(String),
}

/// 规范信号名（如 `state.run`、`counter.good`）。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanonicalSignal {
    kind: SignalKind,
    name: String,
}

impl CanonicalSignal {
    pub fn parse(name: &str) -> Result<Self, SignalParseError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SignalParseError::Empty);
        }
        let (prefix, leaf) = name
            .split_once('.')
            .ok_or_else(|| SignalParseError::MissingLeaf(name.to_string()))?;
        if leaf.is_empty() {
            return Err(SignalParseError::MissingLeaf(name.to_string()));
        }
        let kind = SignalKind::from_prefix(prefix)
            .ok_or_else(|| SignalParseError::UnknownFamily(prefix.to_string()))?;
        Ok(Self {
            kind,
            name: format!("{}.{}", kind.prefix(), leaf),
        })
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// 族前缀之后的部分。
    pub fn leaf(&self) -> &str {
        self.name
            .split_once('.')
            .map(|(_, leaf)| leaf)
            .unwrap_or_default()
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }
}

impl FromStr for CanonicalSignal {
    type Err = SignalParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CanonicalSignal {
    type Error = SignalParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CanonicalSignal> for String {
    fn from(value: CanonicalSignal) -> Self {
        value.name
    }
}

impl fmt::Display for CanonicalSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_families() {
        let signal = CanonicalSignal::parse("counter.good").expect("signal");
        assert_eq!(signal.kind(), SignalKind::Counter);
        assert_eq!(signal.leaf(), "good");

        let pv = CanonicalSignal::parse("process.temperature").expect("pv");
        assert_eq!(pv.kind(), SignalKind::ProcessVariable);
        assert_eq!(pv.as_str(), "pv.temperature");
    }

    #[test]
    fn rejects_unknown_family() {
        let err = CanonicalSignal::parse("speed.motor").unwrap_err();
        assert_eq!(err, SignalParseError::UnknownFamily("speed".to_string()));
        assert!(CanonicalSignal::parse("state").is_err());
    }

    #[test]
    fn schema_checks_values() {
        assert!(SignalKind::Counter.schema().admits(&TagValue::Int(3)));
        assert!(!SignalKind::Counter.schema().admits(&TagValue::Int(-1)));
        assert!(SignalKind::State.schema().admits(&TagValue::Bool(true)));
        assert!(!SignalKind::Utilization.schema().admits(&TagValue::Float(140.0)));
    }
}
