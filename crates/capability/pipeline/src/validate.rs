//! 校验阶段：越界降级 + 告警，时间窗内的精确重复抑制。

use domain::{DataQualityAlert, Quality, TagSample, ValueRange};
use std::collections::{HashMap, VecDeque};

/// 默认重复抑制窗口 60 秒。
pub const DEFAULT_DUPLICATE_WINDOW_MS: i64 = 60_000;
const DEFAULT_DEDUP_CAPACITY: usize = 50_000;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ValueSignature {
    value: String,
    ts_ms: i64,
}

/// 有界去重表：超过容量时按插入顺序淘汰。
struct DedupState {
    map: HashMap<String, (ValueSignature, u64)>,
    order: VecDeque<(String, u64)>,
    counter: u64,
    capacity: usize,
    window_ms: i64,
}

impl DedupState {
    fn new(capacity: usize, window_ms: i64) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            counter: 0,
            capacity,
            window_ms,
        }
    }

    /// 同键同值且距首次出现不足窗口时判为重复；窗口从首次出现起算。
    fn is_duplicate(&mut self, key: String, value: String, ts_ms: i64) -> bool {
        if self.capacity == 0 || self.window_ms <= 0 {
            return false;
        }
        if let Some((existing, _)) = self.map.get(&key)
            && existing.value == value
            && (ts_ms - existing.ts_ms).abs() < self.window_ms
        {
            return true;
        }
        self.counter = self.counter.saturating_add(1);
        let token = self.counter;
        self.map
            .insert(key.clone(), (ValueSignature { value, ts_ms }, token));
        self.order.push_back((key, token));
        while self.map.len() > self.capacity {
            let Some((evict_key, evict_token)) = self.order.pop_front() else {
                break;
            };
            let current = self
                .map
                .get(&evict_key)
                .is_some_and(|(_, token)| *token == evict_token);
            if current {
                self.map.remove(&evict_key);
            }
        }
        // 同一键反复刷新时旧令牌堆积
        if self.order.len() > self.capacity.saturating_mul(2) {
            let map = &self.map;
            self.order
                .retain(|(key, token)| map.get(key).is_some_and(|(_, current)| current == token));
        }
        false
    }
}

/// 校验结果。
#[derive(Debug, Clone, PartialEq)]
pub enum Validated {
    Pass {
        sample: TagSample,
        alert: Option<DataQualityAlert>,
    },
    Duplicate,
}

pub struct Validator {
    dedup: DedupState,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(DEFAULT_DUPLICATE_WINDOW_MS)
    }
}

impl Validator {
    pub fn new(duplicate_window_ms: i64) -> Self {
        Self {
            dedup: DedupState::new(DEFAULT_DEDUP_CAPACITY, duplicate_window_ms),
        }
    }

    pub fn validate(&mut self, mut sample: TagSample, range: Option<ValueRange>) -> Validated {
        let signal = sample
            .signal
            .as_ref()
            .map(|signal| signal.to_string())
            .unwrap_or_else(|| sample.address.clone());
        let key = format!("{}\u{1f}{}", sample.machine_id, signal);
        if self
            .dedup
            .is_duplicate(key, sample.value.signature(), sample.ts_ms)
        {
            edge_telemetry::record_dropped_duplicate();
            return Validated::Duplicate;
        }

        let reason = if sample.value.is_null() {
            None
        } else if range.is_some_and(|range| !range.contains(&sample.value)) {
            Some("out_of_range")
        } else if sample
            .signal
            .as_ref()
            .is_some_and(|signal| !signal.kind().schema().admits(&sample.value))
        {
            Some("schema_violation")
        } else {
            None
        };

        let alert = reason.map(|reason| {
            edge_telemetry::record_out_of_range();
            if sample.quality > Quality::Uncertain {
                sample.quality = Quality::Uncertain;
            }
            DataQualityAlert {
                machine_id: sample.machine_id.clone(),
                signal,
                value: sample.value.to_string(),
                reason: reason.to_string(),
                ts_ms: sample.ts_ms,
            }
        });
        Validated::Pass { sample, alert }
    }
}
