//! 解码阶段：会话跟踪器已解析别名的消息 → 采集样本。
//!
//! 指标名即源地址，设备 ID 即机台（节点级指标归属节点本身）。
//! 任一指标非法时整条消息丢弃，不做部分应用。
//! 出生消息只建立指标目录；其快照值同样会经由 DATA（实时或回放）到达，
//! 这里不重复产出，否则重连后的快照会排在积压回放之前。

use domain::{CanonicalSignal, TagSample};
use edge_sparkplug::{DecodedMessage, MessageType};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("metric without name in {0}")]
    MissingName(String),
    #[error("metric {name} has invalid timestamp {ts_ms}")]
    InvalidTimestamp { name: String, ts_ms: i64 },
}

/// 解码后的单条样本。
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DecodedSample {
    pub sample: TagSample,
    pub historical: bool,
}

/// NDATA/DDATA 转换为样本；其余类型返回空。
pub fn decode_message(message: &DecodedMessage) -> Result<Vec<TagSample>, DecodeError> {
    Ok(decode_samples(message)?
        .into_iter()
        .map(|decoded| decoded.sample)
        .collect())
}

pub(crate) fn decode_samples(message: &DecodedMessage) -> Result<Vec<DecodedSample>, DecodeError> {
    if !matches!(message.message_type, MessageType::NData | MessageType::DData) {
        return Ok(Vec::new());
    }
    let machine_id = message
        .device_id
        .as_deref()
        .unwrap_or(&message.edge_node_id);

    let mut samples = Vec::with_capacity(message.metrics.len());
    for metric in &message.metrics {
        if metric.name.trim().is_empty() {
            return Err(DecodeError::MissingName(format!(
                "{}/{}",
                message.edge_node_id,
                message.message_type.as_str()
            )));
        }
        if metric.ts_ms < 0 {
            return Err(DecodeError::InvalidTimestamp {
                name: metric.name.clone(),
                ts_ms: metric.ts_ms,
            });
        }
        let ts_ms = if metric.ts_ms == 0 {
            message.ts_ms
        } else {
            metric.ts_ms
        };
        let sample = TagSample::new(
            machine_id,
            metric.name.clone(),
            metric.value.clone(),
            metric.quality,
            ts_ms,
        )
        .with_signal(CanonicalSignal::parse(&metric.name).ok());
        samples.push(DecodedSample {
            sample,
            historical: metric.historical,
        });
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{Quality, TagValue};
    use edge_sparkplug::DecodedMetric;

    fn message(message_type: MessageType, metrics: Vec<DecodedMetric>) -> DecodedMessage {
        DecodedMessage {
            group_id: "line-1".to_string(),
            edge_node_id: "edge-1".to_string(),
            device_id: Some("press-01".to_string()),
            message_type,
            seq: Some(1),
            ts_ms: 500,
            metrics,
        }
    }

    fn metric(name: &str, value: TagValue, ts_ms: i64) -> DecodedMetric {
        DecodedMetric {
            name: name.to_string(),
            value,
            quality: Quality::Good,
            ts_ms,
            historical: false,
        }
    }

    #[test]
    fn data_metrics_become_samples() {
        let decoded = decode_samples(&message(
            MessageType::DData,
            vec![
                metric("hr:1:100", TagValue::Int(7), 1_000),
                metric("counter.good", TagValue::UInt(3), 0),
            ],
        ))
        .expect("decode");
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].sample.machine_id, "press-01");
        assert_eq!(decoded[0].sample.address, "hr:1:100");
        assert!(decoded[0].sample.signal.is_none());
        // 缺省时间戳取消息时间
        assert_eq!(decoded[1].sample.ts_ms, 500);
        assert_eq!(
            decoded[1].sample.signal.as_ref().map(|s| s.as_str()),
            Some("counter.good")
        );
    }

    #[test]
    fn invalid_metric_drops_whole_message() {
        let result = decode_samples(&message(
            MessageType::DData,
            vec![
                metric("hr:1:100", TagValue::Int(7), 1_000),
                metric("", TagValue::Int(8), 1_000),
            ],
        ));
        assert!(matches!(result, Err(DecodeError::MissingName(_))));
    }

    #[test]
    fn lifecycle_messages_carry_no_samples() {
        let decoded = decode_samples(&message(MessageType::DDeath, Vec::new())).expect("decode");
        assert!(decoded.is_empty());
        let birth = decode_samples(&message(
            MessageType::DBirth,
            vec![metric("hr:1:100", TagValue::Int(7), 1_000)],
        ))
        .expect("decode");
        assert!(birth.is_empty());
    }

    #[test]
    fn historical_flag_survives() {
        let mut replayed = metric("hr:1:100", TagValue::Int(7), 1_000);
        replayed.historical = true;
        let decoded =
            decode_samples(&message(MessageType::DData, vec![replayed])).expect("decode");
        assert!(decoded[0].historical);
    }
}
