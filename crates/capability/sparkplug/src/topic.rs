use crate::CodecError;
use std::fmt;

pub const NAMESPACE: &str = "spBv1.0";

/// Sparkplug 消息类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    NBirth,
    NDeath,
    DBirth,
    DDeath,
    NData,
    DData,
    NCmd,
    DCmd,
    State,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::NBirth => "NBIRTH",
            MessageType::NDeath => "NDEATH",
            MessageType::DBirth => "DBIRTH",
            MessageType::DDeath => "DDEATH",
            MessageType::NData => "NDATA",
            MessageType::DData => "DDATA",
            MessageType::NCmd => "NCMD",
            MessageType::DCmd => "DCMD",
            MessageType::State => "STATE",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "NBIRTH" => MessageType::NBirth,
            "NDEATH" => MessageType::NDeath,
            "DBIRTH" => MessageType::DBirth,
            "DDEATH" => MessageType::DDeath,
            "NDATA" => MessageType::NData,
            "DDATA" => MessageType::DData,
            "NCMD" => MessageType::NCmd,
            "DCMD" => MessageType::DCmd,
            "STATE" => MessageType::State,
            _ => return None,
        })
    }

    pub fn is_device(self) -> bool {
        matches!(
            self,
            MessageType::DBirth | MessageType::DDeath | MessageType::DData | MessageType::DCmd
        )
    }

    /// 生命周期消息：QoS 1 且保留。
    pub fn is_lifecycle(self) -> bool {
        matches!(
            self,
            MessageType::NBirth
                | MessageType::NDeath
                | MessageType::DBirth
                | MessageType::DDeath
                | MessageType::State
        )
    }

    /// 是否携带 seq（NDEATH 与命令不携带）。
    pub fn carries_seq(self) -> bool {
        matches!(
            self,
            MessageType::NBirth
                | MessageType::DBirth
                | MessageType::DDeath
                | MessageType::NData
                | MessageType::DData
        )
    }
}

/// Sparkplug topic。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Node {
        group_id: String,
        message_type: MessageType,
        edge_node_id: String,
    },
    Device {
        group_id: String,
        message_type: MessageType,
        edge_node_id: String,
        device_id: String,
    },
    State {
        host_id: String,
    },
}

impl Topic {
    pub fn node(group_id: &str, message_type: MessageType, edge_node_id: &str) -> Self {
        Topic::Node {
            group_id: group_id.to_string(),
            message_type,
            edge_node_id: edge_node_id.to_string(),
        }
    }

    pub fn device(
        group_id: &str,
        message_type: MessageType,
        edge_node_id: &str,
        device_id: &str,
    ) -> Self {
        Topic::Device {
            group_id: group_id.to_string(),
            message_type,
            edge_node_id: edge_node_id.to_string(),
            device_id: device_id.to_string(),
        }
    }

    pub fn state(host_id: &str) -> Self {
        Topic::State {
            host_id: host_id.to_string(),
        }
    }

    /// 订阅某个组下全部节点消息的通配 topic。
    pub fn group_filter(group_id: &str) -> String {
        format!("{}/{}/#", NAMESPACE, group_id)
    }

    pub fn parse(topic: &str) -> Result<Self, CodecError> {
        let invalid = || CodecError::InvalidTopic(topic.to_string());
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.first() != Some(&NAMESPACE) || parts.iter().any(|part| part.is_empty()) {
            return Err(invalid());
        }
        match parts.as_slice() {
            [_, "STATE", host_id] => Ok(Topic::state(host_id)),
            [_, group, kind, node] => {
                let message_type = MessageType::parse(kind).ok_or_else(invalid)?;
                if message_type.is_device() || message_type == MessageType::State {
                    return Err(invalid());
                }
                Ok(Topic::node(group, message_type, node))
            }
            [_, group, kind, node, device] => {
                let message_type = MessageType::parse(kind).ok_or_else(invalid)?;
                if !message_type.is_device() {
                    return Err(invalid());
                }
                Ok(Topic::device(group, message_type, node, device))
            }
            _ => Err(invalid()),
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Topic::Node { message_type, .. } | Topic::Device { message_type, .. } => *message_type,
            Topic::State { .. } => MessageType::State,
        }
    }

    pub fn group_id(&self) -> Option<&str> {
        match self {
            Topic::Node { group_id, .. } | Topic::Device { group_id, .. } => Some(group_id),
            Topic::State { .. } => None,
        }
    }

    pub fn edge_node_id(&self) -> Option<&str> {
        match self {
            Topic::Node { edge_node_id, .. } | Topic::Device { edge_node_id, .. } => {
                Some(edge_node_id)
            }
            Topic::State { .. } => None,
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            Topic::Device { device_id, .. } => Some(device_id),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Node {
                group_id,
                message_type,
                edge_node_id,
            } => write!(
                f,
                "{}/{}/{}/{}",
                NAMESPACE,
                group_id,
                message_type.as_str(),
                edge_node_id
            ),
            Topic::Device {
                group_id,
                message_type,
                edge_node_id,
                device_id,
            } => write!(
                f,
                "{}/{}/{}/{}/{}",
                NAMESPACE,
                group_id,
                message_type.as_str(),
                edge_node_id,
                device_id
            ),
            Topic::State { host_id } => write!(f, "{}/STATE/{}", NAMESPACE, host_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format_device_topic() {
        let topic = Topic::parse("spBv1.0/line-1/DDATA/edge-1/press-01").expect("topic");
        assert_eq!(topic.message_type(), MessageType::DData);
        assert_eq!(topic.device_id(), Some("press-01"));
        assert_eq!(topic.to_string(), "spBv1.0/line-1/DDATA/edge-1/press-01");
    }

    #[test]
    fn parse_state_topic() {
        let topic = Topic::parse("spBv1.0/STATE/scada").expect("state");
        assert_eq!(topic, Topic::state("scada"));
    }

    #[test]
    fn reject_malformed_topics() {
        assert!(Topic::parse("spAv1.0/g/NDATA/n").is_err());
        assert!(Topic::parse("spBv1.0/g/DDATA/n").is_err());
        assert!(Topic::parse("spBv1.0/g/NDATA/n/d").is_err());
        assert!(Topic::parse("spBv1.0/g/XDATA/n").is_err());
        assert!(Topic::parse("spBv1.0//NDATA/n").is_err());
    }
}
