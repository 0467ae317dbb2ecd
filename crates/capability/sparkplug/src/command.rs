//! 节点控制命令（NCMD）。

use crate::CodecError;
use crate::payload::{DataType, Metric, Payload};
use domain::{Quality, TagValue, now_epoch_ms};

pub const REBIRTH: &str = "Node Control/Rebirth";
pub const CONNECTOR_START: &str = "Node Control/Connector Start";
pub const CONNECTOR_STOP: &str = "Node Control/Connector Stop";
pub const ACKNOWLEDGE_FAULT: &str = "Node Control/Acknowledge Fault";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCommand {
    Rebirth,
    ConnectorStart(String),
    ConnectorStop(String),
    /// 值格式 `machine/code[/operator]`。
    AcknowledgeFault {
        machine_id: String,
        code: i64,
        operator: String,
    },
}

impl NodeCommand {
    /// 从 NCMD 载荷解析全部命令；未知指标被忽略，格式错误逐条报告。
    pub fn parse_all(payload: &Payload) -> Vec<Result<NodeCommand, CodecError>> {
        payload
            .metrics
            .iter()
            .filter_map(|metric| {
                let name = metric.name.as_deref()?;
                let value = match metric.tag_value(None) {
                    Ok(value) => value,
                    Err(err) => return Some(Err(err)),
                };
                match name {
                    REBIRTH => match value.as_bool() {
                        Some(true) => Some(Ok(NodeCommand::Rebirth)),
                        _ => None,
                    },
                    CONNECTOR_START => Some(text_arg(name, &value).map(NodeCommand::ConnectorStart)),
                    CONNECTOR_STOP => Some(text_arg(name, &value).map(NodeCommand::ConnectorStop)),
                    ACKNOWLEDGE_FAULT => Some(parse_ack(&value)),
                    _ => None,
                }
            })
            .collect()
    }

    pub fn to_metric(&self) -> Metric {
        let now = now_epoch_ms();
        let (name, datatype, value) = match self {
            NodeCommand::Rebirth => (REBIRTH, DataType::Boolean, TagValue::Bool(true)),
            NodeCommand::ConnectorStart(id) => {
                (CONNECTOR_START, DataType::String, TagValue::Text(id.clone()))
            }
            NodeCommand::ConnectorStop(id) => {
                (CONNECTOR_STOP, DataType::String, TagValue::Text(id.clone()))
            }
            NodeCommand::AcknowledgeFault {
                machine_id,
                code,
                operator,
            } => (
                ACKNOWLEDGE_FAULT,
                DataType::String,
                TagValue::Text(format!("{}/{}/{}", machine_id, code, operator)),
            ),
        };
        let mut metric =
            Metric::with_value(Some(name.to_string()), None, datatype, &value, Quality::Good, now);
        metric.properties = None;
        metric
    }

    /// 编码为 NCMD 载荷。
    pub fn encode(commands: &[NodeCommand]) -> Vec<u8> {
        Payload {
            timestamp: Some(now_epoch_ms() as u64),
            metrics: commands.iter().map(NodeCommand::to_metric).collect(),
            ..Default::default()
        }
        .encode_bytes()
    }
}

fn text_arg(name: &str, value: &TagValue) -> Result<String, CodecError> {
    match value {
        TagValue::Text(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        _ => Err(CodecError::InvalidCommand(format!("{} expects a connector id", name))),
    }
}

fn parse_ack(value: &TagValue) -> Result<NodeCommand, CodecError> {
    let TagValue::Text(text) = value else {
        return Err(CodecError::InvalidCommand(
            "acknowledge fault expects machine/code".to_string(),
        ));
    };
    let mut parts = text.trim().splitn(3, '/');
    let machine_id = parts.next().filter(|part| !part.is_empty());
    let code = parts.next().and_then(|part| part.parse::<i64>().ok());
    let operator = parts
        .next()
        .filter(|part| !part.is_empty())
        .unwrap_or("ncmd");
    match (machine_id, code) {
        (Some(machine_id), Some(code)) => Ok(NodeCommand::AcknowledgeFault {
            machine_id: machine_id.to_string(),
            code,
            operator: operator.to_string(),
        }),
        _ => Err(CodecError::InvalidCommand(format!(
            "acknowledge fault value: {}",
            text
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_survive_encoding() {
        let commands = vec![
            NodeCommand::Rebirth,
            NodeCommand::ConnectorStop("plc-1".to_string()),
            NodeCommand::AcknowledgeFault {
                machine_id: "press-01".to_string(),
                code: 101,
                operator: "alice".to_string(),
            },
        ];
        let payload = Payload::decode_bytes(&NodeCommand::encode(&commands)).expect("decode");
        let parsed: Vec<NodeCommand> = NodeCommand::parse_all(&payload)
            .into_iter()
            .collect::<Result<_, _>>()
            .expect("parse");
        assert_eq!(parsed, commands);
    }

    #[test]
    fn ack_without_operator_defaults() {
        let parsed = parse_ack(&TagValue::Text("press-01/7".to_string())).expect("ack");
        assert_eq!(
            parsed,
            NodeCommand::AcknowledgeFault {
                machine_id: "press-01".to_string(),
                code: 7,
                operator: "ncmd".to_string(),
            }
        );
        assert!(parse_ack(&TagValue::Text("press-01".to_string())).is_err());
    }
}
