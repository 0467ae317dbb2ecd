//! 标准化：(机台, 源地址) → 规范信号，单位换算、死区与质量门限。

use async_trait::async_trait;
use domain::{MappingKey, MappingTable, TagMapping, TagSample, TagValue, ValueRange};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// 规范化错误。
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("mapping provider error: {0}")]
    MappingProvider(String),
}

/// 点位映射提供者抽象。
#[async_trait]
pub trait MappingProvider: Send + Sync {
    async fn find_mapping(
        &self,
        machine_id: &str,
        address: &str,
    ) -> Result<Option<TagMapping>, NormalizeError>;

    /// 映射表版本；变化时标准化器重置死区基线。
    fn version(&self) -> u64 {
        0
    }
}

/// 内存映射表提供者，热加载时整体替换。
#[derive(Debug, Default)]
pub struct StaticMappingProvider {
    table: RwLock<Arc<MappingTable>>,
}

impl StaticMappingProvider {
    pub fn new(table: MappingTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
        }
    }

    pub fn replace(&self, table: MappingTable) {
        let mut guard = self
            .table
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        debug!(
            target: "edge.normalize",
            from = guard.version(),
            to = table.version(),
            mappings = table.len(),
            "mapping_table_replaced"
        );
        *guard = Arc::new(table);
    }

    pub fn current(&self) -> Arc<MappingTable> {
        self.table
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl MappingProvider for StaticMappingProvider {
    async fn find_mapping(
        &self,
        machine_id: &str,
        address: &str,
    ) -> Result<Option<TagMapping>, NormalizeError> {
        Ok(self.current().get(machine_id, address).cloned())
    }

    fn version(&self) -> u64 {
        self.current().version()
    }
}

/// 已映射样本及校验阶段需要的映射属性。
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedSample {
    pub sample: TagSample,
    pub unit: Option<String>,
    pub range: Option<ValueRange>,
}

impl From<TagSample> for NormalizedSample {
    fn from(sample: TagSample) -> Self {
        Self {
            sample,
            unit: None,
            range: None,
        }
    }
}

/// 单个样本的标准化结果。
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizeOutcome {
    /// 已映射：带规范信号与换算后的值。
    Forward(NormalizedSample),
    /// 无映射：原样透传。
    Unmapped(TagSample),
    /// 无映射但边缘侧已标注规范信号：原样透传，不算已映射。
    Labeled(TagSample),
    DroppedDeadband,
    DroppedQuality,
}

/// 标准化器；死区基线按 (机台, 地址) 保存最后一次转发的值。
pub struct Normalizer {
    provider: Arc<dyn MappingProvider>,
    last_forwarded: HashMap<MappingKey, TagValue>,
    warned_unmapped: HashSet<MappingKey>,
    version: u64,
}

impl Normalizer {
    pub fn new(provider: Arc<dyn MappingProvider>) -> Self {
        let version = provider.version();
        Self {
            provider,
            last_forwarded: HashMap::new(),
            warned_unmapped: HashSet::new(),
            version,
        }
    }

    pub async fn normalize(&mut self, sample: TagSample) -> Result<NormalizeOutcome, NormalizeError> {
        let version = self.provider.version();
        if version != self.version {
            // 换算规则可能已变，旧基线失效
            self.last_forwarded.clear();
            self.warned_unmapped.clear();
            self.version = version;
        }

        let mapping = self
            .provider
            .find_mapping(&sample.machine_id, &sample.address)
            .await?;
        let Some(mapping) = mapping else {
            // 边缘侧已标注规范信号的样本不再换算
            edge_telemetry::record_passed_unmapped();
            if sample.signal.is_some() {
                return Ok(NormalizeOutcome::Labeled(sample));
            }
            let key = MappingKey::new(sample.machine_id.clone(), sample.address.clone());
            if self.warned_unmapped.insert(key) {
                warn!(
                    target: "edge.normalize",
                    machine_id = %sample.machine_id,
                    address = %sample.address,
                    "tag_unmapped"
                );
            }
            return Ok(NormalizeOutcome::Unmapped(sample));
        };

        if sample.quality < mapping.min_quality {
            edge_telemetry::record_dropped_quality();
            return Ok(NormalizeOutcome::DroppedQuality);
        }

        let value = mapping.apply(&sample.value);
        let key = mapping.key();
        if let Some(last) = self.last_forwarded.get(&key)
            && !mapping.deadband.exceeded(last, &value)
        {
            edge_telemetry::record_dropped_deadband();
            return Ok(NormalizeOutcome::DroppedDeadband);
        }
        self.last_forwarded.insert(key, value.clone());
        edge_telemetry::record_normalized_value();

        Ok(NormalizeOutcome::Forward(NormalizedSample {
            sample: TagSample {
                signal: Some(mapping.signal),
                value,
                ..sample
            },
            unit: mapping.unit,
            range: mapping.range,
        }))
    }

    /// 当前跟踪的死区基线数量。
    pub fn tracked(&self) -> usize {
        self.last_forwarded.len()
    }
}
