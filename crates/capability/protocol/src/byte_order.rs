//! 寄存器与值之间的转换（按数据类型与字节序）。
//!
//! 多寄存器值先按字节序重排为大端字序再解释；16 位及以下的类型不受字节序影响。
//! 重排是对合的：同一函数既用于读也用于写。

use crate::error::ConnectorError;
use crate::types::{ByteOrder, ModbusDataType};
use domain::TagValue;

fn reorder(registers: &[u16], order: ByteOrder) -> Vec<u16> {
    let mut words = registers.to_vec();
    if matches!(order, ByteOrder::Cdab | ByteOrder::Dcba) {
        words.reverse();
    }
    if matches!(order, ByteOrder::Badc | ByteOrder::Dcba) {
        for word in &mut words {
            *word = word.swap_bytes();
        }
    }
    words
}

fn be_bytes<const N: usize>(words: &[u16]) -> [u8; N] {
    let mut bytes = [0u8; N];
    for (index, word) in words.iter().take(N / 2).enumerate() {
        let [high, low] = word.to_be_bytes();
        bytes[index * 2] = high;
        bytes[index * 2 + 1] = low;
    }
    bytes
}

fn words_of(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]))
        .collect()
}

/// 将读到的寄存器解码为值。`bit` 仅对保持/输入寄存器中的布尔点位有效。
pub fn decode_registers(
    registers: &[u16],
    data_type: ModbusDataType,
    byte_order: ByteOrder,
    bit: Option<u8>,
) -> Result<TagValue, ConnectorError> {
    let needed = data_type.register_count() as usize;
    if registers.len() < needed {
        return Err(ConnectorError::DataParse(format!(
            "need {} registers for {:?}, got {}",
            needed,
            data_type,
            registers.len()
        )));
    }

    let value = match data_type {
        ModbusDataType::Bool => match bit {
            Some(bit) => TagValue::Bool((registers[0] >> bit) & 1 == 1),
            None => TagValue::Bool(registers[0] != 0),
        },
        ModbusDataType::Int16 => TagValue::Int(registers[0] as i16 as i64),
        ModbusDataType::Uint16 => TagValue::UInt(registers[0] as u64),
        ModbusDataType::Int32 => {
            let bytes = be_bytes::<4>(&reorder(&registers[..2], byte_order));
            TagValue::Int(i32::from_be_bytes(bytes) as i64)
        }
        ModbusDataType::Uint32 => {
            let bytes = be_bytes::<4>(&reorder(&registers[..2], byte_order));
            TagValue::UInt(u32::from_be_bytes(bytes) as u64)
        }
        ModbusDataType::Float32 => {
            let bytes = be_bytes::<4>(&reorder(&registers[..2], byte_order));
            let value = f32::from_be_bytes(bytes);
            if !value.is_finite() {
                return Err(ConnectorError::DataParse("non-finite float32".to_string()));
            }
            TagValue::Float(value as f64)
        }
        ModbusDataType::Float64 => {
            let bytes = be_bytes::<8>(&reorder(&registers[..4], byte_order));
            let value = f64::from_be_bytes(bytes);
            if !value.is_finite() {
                return Err(ConnectorError::DataParse("non-finite float64".to_string()));
            }
            TagValue::Float(value)
        }
    };
    Ok(value)
}

/// 将写入值编码为寄存器。位区写入返回 0/1。
pub fn encode_value(
    value: &TagValue,
    data_type: ModbusDataType,
    byte_order: ByteOrder,
) -> Result<Vec<u16>, ConnectorError> {
    let mismatch = || ConnectorError::DataParse(format!("cannot write {} as {:?}", value, data_type));
    let integer = |min: i64, max: i64| {
        value
            .as_i64()
            .filter(|v| *v >= min && *v <= max)
            .ok_or_else(mismatch)
    };

    let words = match data_type {
        ModbusDataType::Bool => vec![u16::from(value.as_bool().ok_or_else(mismatch)?)],
        ModbusDataType::Int16 => vec![integer(i16::MIN as i64, i16::MAX as i64)? as i16 as u16],
        ModbusDataType::Uint16 => vec![integer(0, u16::MAX as i64)? as u16],
        ModbusDataType::Int32 => {
            let raw = integer(i32::MIN as i64, i32::MAX as i64)? as i32;
            reorder(&words_of(&raw.to_be_bytes()), byte_order)
        }
        ModbusDataType::Uint32 => {
            let raw = integer(0, u32::MAX as i64)? as u32;
            reorder(&words_of(&raw.to_be_bytes()), byte_order)
        }
        ModbusDataType::Float32 => {
            let raw = value.as_f64().ok_or_else(mismatch)? as f32;
            reorder(&words_of(&raw.to_be_bytes()), byte_order)
        }
        ModbusDataType::Float64 => {
            let raw = value.as_f64().ok_or_else(mismatch)?;
            reorder(&words_of(&raw.to_be_bytes()), byte_order)
        }
    };
    Ok(words)
}
