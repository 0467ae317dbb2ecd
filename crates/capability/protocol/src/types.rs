//! 协议相关类型定义

use crate::error::ConnectorError;
use domain::Deadband;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Modbus 寄存器数据类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModbusDataType {
    /// 线圈/离散输入，或保持寄存器中的某一位
    Bool,
    /// 16位有符号整数
    #[default]
    Int16,
    /// 16位无符号整数
    Uint16,
    /// 32位有符号整数（2个寄存器）
    Int32,
    /// 32位无符号整数（2个寄存器）
    Uint32,
    /// 32位浮点数（2个寄存器）
    Float32,
    /// 64位浮点数（4个寄存器）
    Float64,
}

impl ModbusDataType {
    /// 占用的寄存器个数。
    pub fn register_count(self) -> u16 {
        match self {
            ModbusDataType::Bool | ModbusDataType::Int16 | ModbusDataType::Uint16 => 1,
            ModbusDataType::Int32 | ModbusDataType::Uint32 | ModbusDataType::Float32 => 2,
            ModbusDataType::Float64 => 4,
        }
    }
}

/// 多寄存器值的字节序。
///
/// 字母表示大端序下的字节位置：ABCD 为标准大端，CDAB 为字交换。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Abcd,
    Dcba,
    Badc,
    Cdab,
}

/// 寄存器区。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterTable {
    Coil,
    DiscreteInput,
    Holding,
    Input,
}

impl RegisterTable {
    pub fn prefix(self) -> &'static str {
        match self {
            RegisterTable::Coil => "co",
            RegisterTable::DiscreteInput => "di",
            RegisterTable::Holding => "hr",
            RegisterTable::Input => "ir",
        }
    }

    /// 位区（线圈/离散输入）每个地址一位。
    pub fn is_bit(self) -> bool {
        matches!(self, RegisterTable::Coil | RegisterTable::DiscreteInput)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, RegisterTable::Coil | RegisterTable::Holding)
    }

    /// 单次读请求的最大长度（PDU 限制）。
    pub fn max_batch(self) -> u16 {
        if self.is_bit() { 2000 } else { 125 }
    }
}

/// 源地址：`{区}:{从站}:{寄存器}[.{位}]`，如 `hr:1:100`、`hr:1:7.3`、`co:2:10`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterAddress {
    pub table: RegisterTable,
    pub unit_id: u8,
    pub register: u16,
    pub bit: Option<u8>,
}

impl FromStr for RegisterAddress {
    type Err = ConnectorError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || ConnectorError::ConfigParse(format!("invalid register address: {}", raw));
        let mut parts = raw.trim().split(':');
        let table = match parts.next() {
            Some("co") => RegisterTable::Coil,
            Some("di") => RegisterTable::DiscreteInput,
            Some("hr") => RegisterTable::Holding,
            Some("ir") => RegisterTable::Input,
            _ => return Err(invalid()),
        };
        let unit_id = parts
            .next()
            .and_then(|part| part.parse::<u8>().ok())
            .ok_or_else(invalid)?;
        let rest = parts.next().ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }
        let (register, bit) = match rest.split_once('.') {
            Some((register, bit)) => {
                let bit = bit.parse::<u8>().ok().filter(|bit| *bit < 16);
                (register, Some(bit.ok_or_else(invalid)?))
            }
            None => (rest, None),
        };
        let register = register.parse::<u16>().map_err(|_| invalid())?;
        if bit.is_some() && table.is_bit() {
            return Err(invalid());
        }
        Ok(Self {
            table,
            unit_id,
            register,
            bit,
        })
    }
}

impl fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.table.prefix(), self.unit_id, self.register)?;
        if let Some(bit) = self.bit {
            write!(f, ".{}", bit)?;
        }
        Ok(())
    }
}

/// 轮询周期等级。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleClass {
    Fast,
    #[default]
    Slow,
}

/// 轮询点位配置
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PollTag {
    pub machine_id: String,
    /// 源地址，见 [`RegisterAddress`]
    pub address: String,
    #[serde(default)]
    pub data_type: ModbusDataType,
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default)]
    pub cycle: CycleClass,
}

impl PollTag {
    pub fn register_address(&self) -> Result<RegisterAddress, ConnectorError> {
        let address: RegisterAddress = self.address.parse()?;
        if address.table.is_bit() && self.data_type != ModbusDataType::Bool {
            return Err(ConnectorError::ConfigParse(format!(
                "{}: bit table requires bool data type",
                self.address
            )));
        }
        Ok(address)
    }
}

/// 订阅项配置
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MonitoredItem {
    pub machine_id: String,
    /// 服务器侧节点标识，同时作为样本的源地址
    pub address: String,
    #[serde(default = "default_sampling_interval")]
    pub sampling_interval_ms: u64,
    #[serde(default)]
    pub deadband: Deadband,
}

fn default_sampling_interval() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register_address() {
        let address: RegisterAddress = "hr:1:100".parse().unwrap();
        assert_eq!(address.table, RegisterTable::Holding);
        assert_eq!(address.unit_id, 1);
        assert_eq!(address.register, 100);
        assert_eq!(address.bit, None);

        let address: RegisterAddress = "hr:3:7.15".parse().unwrap();
        assert_eq!(address.bit, Some(15));
        assert_eq!(address.to_string(), "hr:3:7.15");

        assert!("hr:1:7.16".parse::<RegisterAddress>().is_err());
        assert!("co:1:7.1".parse::<RegisterAddress>().is_err());
        assert!("xx:1:7".parse::<RegisterAddress>().is_err());
        assert!("hr:1".parse::<RegisterAddress>().is_err());
    }

    #[test]
    fn test_parse_poll_tag() {
        let json = r#"{"machine_id": "press-01", "address": "hr:1:100", "data_type": "float32", "byte_order": "cdab", "cycle": "fast"}"#;
        let tag: PollTag = serde_json::from_str(json).unwrap();
        assert_eq!(tag.data_type, ModbusDataType::Float32);
        assert_eq!(tag.byte_order, ByteOrder::Cdab);
        assert_eq!(tag.cycle, CycleClass::Fast);

        let coil = PollTag {
            machine_id: "press-01".to_string(),
            address: "co:1:4".to_string(),
            data_type: ModbusDataType::Int16,
            byte_order: ByteOrder::Abcd,
            cycle: CycleClass::Slow,
        };
        assert!(coil.register_address().is_err());
    }
}
