//! Sparkplug B 载荷（protobuf，字段号与官方 proto 一致）。

use crate::CodecError;
use domain::{Quality, TagValue};
use prost::Message;

/// 质量属性键。
pub const QUALITY_PROPERTY: &str = "Quality";

#[derive(Clone, PartialEq, Message)]
pub struct Payload {
    #[prost(uint64, optional, tag = "1")]
    pub timestamp: Option<u64>,
    #[prost(message, repeated, tag = "2")]
    pub metrics: Vec<Metric>,
    #[prost(uint64, optional, tag = "3")]
    pub seq: Option<u64>,
    #[prost(string, optional, tag = "4")]
    pub uuid: Option<String>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub body: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Metric {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(uint64, optional, tag = "2")]
    pub alias: Option<u64>,
    #[prost(uint64, optional, tag = "3")]
    pub timestamp: Option<u64>,
    #[prost(uint32, optional, tag = "4")]
    pub datatype: Option<u32>,
    #[prost(bool, optional, tag = "5")]
    pub is_historical: Option<bool>,
    #[prost(bool, optional, tag = "6")]
    pub is_transient: Option<bool>,
    #[prost(bool, optional, tag = "7")]
    pub is_null: Option<bool>,
    #[prost(message, optional, tag = "9")]
    pub properties: Option<PropertySet>,
    #[prost(oneof = "metric::Value", tags = "10, 11, 12, 13, 14, 15, 16")]
    pub value: Option<metric::Value>,
}

pub mod metric {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Value {
        #[prost(uint32, tag = "10")]
        IntValue(u32),
        #[prost(uint64, tag = "11")]
        LongValue(u64),
        #[prost(float, tag = "12")]
        FloatValue(f32),
        #[prost(double, tag = "13")]
        DoubleValue(f64),
        #[prost(bool, tag = "14")]
        BooleanValue(bool),
        #[prost(string, tag = "15")]
        StringValue(String),
        #[prost(bytes = "vec", tag = "16")]
        BytesValue(Vec<u8>),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct PropertySet {
    #[prost(string, repeated, tag = "1")]
    pub keys: Vec<String>,
    #[prost(message, repeated, tag = "2")]
    pub values: Vec<PropertyValue>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PropertyValue {
    #[prost(uint32, optional, tag = "1")]
    pub r#type: Option<u32>,
    #[prost(bool, optional, tag = "2")]
    pub is_null: Option<bool>,
    #[prost(oneof = "property_value::Value", tags = "3, 4, 5, 6, 7, 8")]
    pub value: Option<property_value::Value>,
}

pub mod property_value {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Value {
        #[prost(uint32, tag = "3")]
        IntValue(u32),
        #[prost(uint64, tag = "4")]
        LongValue(u64),
        #[prost(float, tag = "5")]
        FloatValue(f32),
        #[prost(double, tag = "6")]
        DoubleValue(f64),
        #[prost(bool, tag = "7")]
        BooleanValue(bool),
        #[prost(string, tag = "8")]
        StringValue(String),
    }
}

/// Sparkplug 数据类型码。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Int8 = 1,
    Int16 = 2,
    Int32 = 3,
    Int64 = 4,
    UInt8 = 5,
    UInt16 = 6,
    UInt32 = 7,
    UInt64 = 8,
    Float = 9,
    Double = 10,
    Boolean = 11,
    String = 12,
    DateTime = 13,
    Text = 14,
}

impl DataType {
    pub fn from_code(code: u32) -> Result<Self, CodecError> {
        Ok(match code {
            1 => DataType::Int8,
            2 => DataType::Int16,
            3 => DataType::Int32,
            4 => DataType::Int64,
            5 => DataType::UInt8,
            6 => DataType::UInt16,
            7 => DataType::UInt32,
            8 => DataType::UInt64,
            9 => DataType::Float,
            10 => DataType::Double,
            11 => DataType::Boolean,
            12 => DataType::String,
            13 => DataType::DateTime,
            14 => DataType::Text,
            other => return Err(CodecError::UnsupportedDatatype(other)),
        })
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    /// 按值类型推断声明类型。
    pub fn for_value(value: &TagValue) -> Option<Self> {
        match value {
            TagValue::Null => None,
            TagValue::Bool(_) => Some(DataType::Boolean),
            TagValue::Int(_) => Some(DataType::Int64),
            TagValue::UInt(_) => Some(DataType::UInt64),
            TagValue::Float(_) => Some(DataType::Double),
            TagValue::Text(_) => Some(DataType::String),
        }
    }
}

impl Payload {
    pub fn encode_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        Payload::decode(bytes).map_err(|err| CodecError::Malformed(err.to_string()))
    }
}

impl Metric {
    /// 构造带值、质量属性的指标。
    pub fn with_value(
        name: Option<String>,
        alias: Option<u64>,
        datatype: DataType,
        value: &TagValue,
        quality: Quality,
        ts_ms: i64,
    ) -> Self {
        let encoded = encode_value(datatype, value);
        Metric {
            name,
            alias,
            timestamp: Some(ts_ms.max(0) as u64),
            datatype: Some(datatype.code()),
            is_historical: None,
            is_transient: None,
            is_null: encoded.is_none().then_some(true),
            properties: Some(quality_properties(quality)),
            value: encoded,
        }
    }

    pub fn quality(&self) -> Quality {
        let Some(props) = &self.properties else {
            return Quality::Good;
        };
        props
            .keys
            .iter()
            .position(|key| key == QUALITY_PROPERTY)
            .and_then(|index| props.values.get(index))
            .and_then(|value| match value.value {
                Some(property_value::Value::IntValue(code)) => Some(code as i32),
                Some(property_value::Value::LongValue(code)) => Some(code as i32),
                _ => None,
            })
            .map(Quality::from_code)
            .unwrap_or(Quality::Good)
    }

    /// 解码值；`declared` 为出生证明中登记的类型（数据消息可省略 datatype）。
    pub fn tag_value(&self, declared: Option<DataType>) -> Result<TagValue, CodecError> {
        if self.is_null == Some(true) {
            return Ok(TagValue::Null);
        }
        let datatype = match self.datatype {
            Some(code) => Some(DataType::from_code(code)?),
            None => declared,
        };
        decode_value(datatype, self.value.as_ref())
    }
}

fn quality_properties(quality: Quality) -> PropertySet {
    PropertySet {
        keys: vec![QUALITY_PROPERTY.to_string()],
        values: vec![PropertyValue {
            r#type: Some(DataType::Int32.code()),
            is_null: None,
            value: Some(property_value::Value::IntValue(quality.code() as u32)),
        }],
    }
}

fn encode_value(datatype: DataType, value: &TagValue) -> Option<metric::Value> {
    use metric::Value as V;
    if value.is_null() {
        return None;
    }
    Some(match datatype {
        DataType::Int8 | DataType::Int16 | DataType::Int32 => {
            V::IntValue(value.as_i64().unwrap_or_default() as i32 as u32)
        }
        DataType::UInt8 | DataType::UInt16 | DataType::UInt32 => {
            V::IntValue(value.as_i64().unwrap_or_default() as u32)
        }
        DataType::Int64 => V::LongValue(value.as_i64().unwrap_or_default() as u64),
        DataType::UInt64 | DataType::DateTime => V::LongValue(match value {
            TagValue::UInt(v) => *v,
            other => other.as_i64().unwrap_or_default() as u64,
        }),
        DataType::Float => V::FloatValue(value.as_f64().unwrap_or_default() as f32),
        DataType::Double => V::DoubleValue(value.as_f64().unwrap_or_default()),
        DataType::Boolean => V::BooleanValue(value.as_bool().unwrap_or_default()),
        DataType::String | DataType::Text => V::StringValue(value.to_string()),
    })
}

fn decode_value(
    datatype: Option<DataType>,
    value: Option<&metric::Value>,
) -> Result<TagValue, CodecError> {
    use metric::Value as V;
    let Some(value) = value else {
        return Ok(TagValue::Null);
    };
    let decoded = match (datatype, value) {
        (Some(DataType::Int8), V::IntValue(v)) => TagValue::Int(*v as i8 as i64),
        (Some(DataType::Int16), V::IntValue(v)) => TagValue::Int(*v as i16 as i64),
        (Some(DataType::Int32), V::IntValue(v)) => TagValue::Int(*v as i32 as i64),
        (Some(DataType::UInt8 | DataType::UInt16 | DataType::UInt32), V::IntValue(v)) => {
            TagValue::UInt(u64::from(*v))
        }
        (Some(DataType::Int64), V::LongValue(v)) => TagValue::Int(*v as i64),
        (Some(DataType::UInt64 | DataType::DateTime), V::LongValue(v)) => TagValue::UInt(*v),
        (Some(DataType::Float), V::FloatValue(v)) => TagValue::Float(f64::from(*v)),
        (Some(DataType::Double), V::DoubleValue(v)) => TagValue::Float(*v),
        (Some(DataType::Boolean), V::BooleanValue(v)) => TagValue::Bool(*v),
        (Some(DataType::String | DataType::Text), V::StringValue(v)) => TagValue::Text(v.clone()),
        (None, V::IntValue(v)) => TagValue::Int(i64::from(*v as i32)),
        (None, V::LongValue(v)) => TagValue::Int(*v as i64),
        (None, V::FloatValue(v)) => TagValue::Float(f64::from(*v)),
        (None, V::DoubleValue(v)) => TagValue::Float(*v),
        (None, V::BooleanValue(v)) => TagValue::Bool(*v),
        (None, V::StringValue(v)) => TagValue::Text(v.clone()),
        (Some(declared), other) => {
            return Err(CodecError::TypeMismatch(format!(
                "{:?} carried as {}",
                declared,
                variant_name(other)
            )));
        }
        (None, V::BytesValue(_)) => return Err(CodecError::UnsupportedDatatype(17)),
    };
    Ok(decoded)
}

fn variant_name(value: &metric::Value) -> &'static str {
    match value {
        metric::Value::IntValue(_) => "int_value",
        metric::Value::LongValue(_) => "long_value",
        metric::Value::FloatValue(_) => "float_value",
        metric::Value::DoubleValue(_) => "double_value",
        metric::Value::BooleanValue(_) => "boolean_value",
        metric::Value::StringValue(_) => "string_value",
        metric::Value::BytesValue(_) => "bytes_value",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_small_ints_survive_wire() {
        let metric = Metric::with_value(
            Some("pv.offset".to_string()),
            None,
            DataType::Int16,
            &TagValue::Int(-42),
            Quality::Good,
            1,
        );
        let payload = Payload {
            metrics: vec![metric],
            ..Default::default()
        };
        let decoded = Payload::decode_bytes(&payload.encode_bytes()).expect("decode");
        let value = decoded.metrics[0].tag_value(None).expect("value");
        assert_eq!(value, TagValue::Int(-42));
    }

    #[test]
    fn quality_travels_as_property() {
        let metric = Metric::with_value(
            Some("counter.good".to_string()),
            Some(3),
            DataType::UInt64,
            &TagValue::UInt(9),
            Quality::Uncertain,
            1,
        );
        assert_eq!(metric.quality(), Quality::Uncertain);
        let null = Metric::with_value(None, Some(3), DataType::UInt64, &TagValue::Null, Quality::Bad, 1);
        assert_eq!(null.is_null, Some(true));
        assert_eq!(null.tag_value(None).expect("null"), TagValue::Null);
        assert_eq!(null.quality(), Quality::Bad);
    }

    #[test]
    fn mismatched_type_is_rejected() {
        let metric = Metric {
            datatype: Some(DataType::Boolean.code()),
            value: Some(metric::Value::StringValue("x".to_string())),
            ..Default::default()
        };
        assert!(matches!(
            metric.tag_value(None),
            Err(CodecError::TypeMismatch(_))
        ));
        let unknown = Metric {
            datatype: Some(16),
            ..Default::default()
        };
        assert!(matches!(
            unknown.tag_value(None),
            Err(CodecError::UnsupportedDatatype(16))
        ));
    }
}
